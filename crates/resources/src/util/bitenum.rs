// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::fmt;
use std::marker::PhantomData;
use std::ops::{BitOr, BitOrAssign};

use num_traits::ToPrimitive;

/// A set of flags from a fieldless enum whose discriminants are bit positions.
///
/// Persisted as the raw `i32` in an integer column, so unknown bits written by a newer
/// release survive a round trip.
#[derive(Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct BitEnum<T: ToPrimitive> {
    value: u32,
    phantom: PhantomData<T>,
}

fn bit<T: ToPrimitive>(flag: &T) -> u32 {
    flag.to_u32().filter(|b| *b < 32).map_or(0, |b| 1 << b)
}

impl<T: ToPrimitive> BitEnum<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::from_bits(0)
    }

    #[must_use]
    pub fn from_bits(value: u32) -> Self {
        Self {
            value,
            phantom: PhantomData,
        }
    }

    #[must_use]
    pub fn bits(&self) -> u32 {
        self.value
    }

    /// Decode the value of an integer column.
    #[must_use]
    pub fn from_column(value: i32) -> Self {
        Self::from_bits(value as u32)
    }

    #[must_use]
    pub fn to_column(&self) -> i32 {
        self.value as i32
    }

    pub fn new_with(flag: T) -> Self {
        let mut s = Self::new();
        s.set(flag);
        s
    }

    pub fn set(&mut self, flag: T) {
        self.value |= bit(&flag);
    }

    pub fn clear(&mut self, flag: T) {
        self.value &= !bit(&flag);
    }

    pub fn contains(&self, flag: T) -> bool {
        self.value & bit(&flag) != 0
    }

    pub fn contains_all(&self, other: BitEnum<T>) -> bool {
        other.value & self.value == other.value
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0
    }
}

impl<T: ToPrimitive> BitOr for BitEnum<T> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self::from_bits(self.value | rhs.value)
    }
}

impl<T: ToPrimitive> BitOr<T> for BitEnum<T> {
    type Output = Self;

    fn bitor(self, rhs: T) -> Self::Output {
        let mut s = self;
        s.set(rhs);
        s
    }
}

impl<T: ToPrimitive> BitOrAssign<T> for BitEnum<T> {
    fn bitor_assign(&mut self, rhs: T) {
        self.set(rhs);
    }
}

impl<T: ToPrimitive> Default for BitEnum<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ToPrimitive> From<T> for BitEnum<T> {
    fn from(flag: T) -> Self {
        Self::new_with(flag)
    }
}

impl<T: ToPrimitive> fmt::Debug for BitEnum<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitEnum({:#b})", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enum_primitive_derive::Primitive;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
    enum Flag {
        A = 0,
        B = 1,
        C = 5,
    }

    #[test]
    fn set_clear_and_merge() {
        let mut flags = BitEnum::new_with(Flag::A) | Flag::C;
        assert!(flags.contains(Flag::A));
        assert!(!flags.contains(Flag::B));
        assert_eq!(flags.bits(), 0b100001);
        flags.clear(Flag::A);
        assert!(!flags.contains(Flag::A));

        let merged = flags | BitEnum::from(Flag::B);
        assert!(merged.contains_all(flags));
        assert_eq!(BitEnum::<Flag>::from_column(merged.to_column()), merged);
    }
}
