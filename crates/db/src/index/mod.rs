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

//! Ordered secondary indexes, and the id index every table carries.
//!
//! Each index lives in its own file as a paged B+tree read through the page cache.
//! An entry's position is decided by its key columns, then its value column (for indexes
//! declared with one), then the record's heap offset, so duplicate keys come back in offset
//! order.

mod btree_index;

pub(crate) use btree_index::{BTreeIndex, IdIndex};

use crate::values::KeyValue;

/// Declared shape of an index: the key columns (by position) and an optional value column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub value_column: Option<usize>,
}

impl IndexDef {
    pub fn is_compound(&self) -> bool {
        self.columns.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IndexEntry {
    pub(crate) key: Vec<KeyValue>,
    pub(crate) value: Option<KeyValue>,
    pub(crate) offset: u64,
    pub(crate) id: i32,
}

impl IndexEntry {
    /// The smallest possible entry whose key starts with `prefix`.
    pub(crate) fn lower_bound(prefix: &[KeyValue]) -> Self {
        Self {
            key: prefix.to_vec(),
            value: None,
            offset: 0,
            id: i32::MIN,
        }
    }

    pub(crate) fn has_prefix(&self, prefix: &[KeyValue]) -> bool {
        self.key.len() >= prefix.len() && self.key[..prefix.len()] == *prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_order_by_key_then_value_then_offset() {
        let e = |k: i32, v: Option<i32>, offset: u64| IndexEntry {
            key: vec![KeyValue::Int(k)],
            value: v.map(KeyValue::Int),
            offset,
            id: 0,
        };
        let mut entries = vec![e(2, None, 10), e(1, Some(5), 3), e(1, Some(5), 1), e(1, Some(2), 99)];
        entries.sort();
        assert_eq!(
            entries,
            vec![e(1, Some(2), 99), e(1, Some(5), 1), e(1, Some(5), 3), e(2, None, 10)]
        );
        assert!(IndexEntry::lower_bound(&[KeyValue::Int(1)]) < entries[0]);
    }
}
