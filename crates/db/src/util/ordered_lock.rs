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

//! A mutex that knows its place in a global acquisition order.
//!
//! Whenever two of these must be held at once, `lock_pair` acquires them in order of creation,
//! so two callers locking the same pair from opposite ends cannot deadlock.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub struct OrderedMutex<T> {
    sequence: u64,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(value),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// Lock `a` and `b` together, in creation order. Guards come back in argument order.
///
/// # Panics
/// If `a` and `b` are the same mutex.
pub fn lock_pair<'a, A, B>(
    a: &'a OrderedMutex<A>,
    b: &'a OrderedMutex<B>,
) -> (MutexGuard<'a, A>, MutexGuard<'a, B>) {
    assert_ne!(a.sequence, b.sequence, "lock_pair called twice on the same lock");
    if a.sequence < b.sequence {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
