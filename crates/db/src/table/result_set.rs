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

use std::sync::Arc;

use crate::DbError;
use crate::table::{Record, TableStore};

/// A snapshot of matching `(id, offset)` pairs, resolved to records lazily.
///
/// Records deleted after the snapshot was taken are skipped. Records that moved within the
/// heap since are found again through the id index.
pub struct ResultSet {
    table: Arc<TableStore>,
    rows: Vec<(i32, u64)>,
    position: usize,
}

impl ResultSet {
    pub(crate) fn new(table: Arc<TableStore>, rows: Vec<(i32, u64)>) -> Self {
        Self {
            table,
            rows,
            position: 0,
        }
    }

    /// Number of rows in the snapshot, including any deleted since.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ids in snapshot order.
    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.rows.iter().map(|(id, _)| *id)
    }

    fn resolve(&self, id: i32, offset: u64) -> Result<Option<Record>, DbError> {
        let mut inner = self.table.lock();
        let current = inner.opened()?.ids.get(id)?;
        let Some(current) = current else {
            return Ok(None);
        };
        if current != offset {
            tracing::trace!(table = self.table.name(), id, "record moved since snapshot");
        }
        Ok(inner
            .read_at(current)?
            .map(|(_, values)| Record::committed(self.table.clone(), id, values)))
    }
}

impl Iterator for ResultSet {
    type Item = Result<Record, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.rows.len() {
            let (id, offset) = self.rows[self.position];
            self.position += 1;
            match self.resolve(id, offset) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("table", &self.table.name())
            .field("rows", &self.rows.len())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::table::Table;
    use crate::table::tests::open_table;
    use crate::values::KeyValue;

    #[test]
    fn snapshot_skips_deleted_and_follows_moved() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_table(dir.path());
        let mut ids = vec![];
        for name in ["a", "b", "c"] {
            let mut record = table.new_record().unwrap();
            record.set_string(0, name).unwrap();
            record.set_int(1, 7).unwrap();
            record.commit().unwrap();
            ids.push(record.id());
        }
        let snapshot = table.create_result_set_eq(1, KeyValue::Int(7)).unwrap();
        assert_eq!(snapshot.len(), 3);

        table.get_record(ids[0]).unwrap().unwrap().delete().unwrap();
        let mut moved = table.get_record(ids[1]).unwrap().unwrap();
        moved.set_string(0, &"b".repeat(500)).unwrap();
        moved.commit().unwrap();

        let names: Vec<String> = snapshot
            .map(|r| r.unwrap().get_string(0).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b".repeat(500), "c".to_string()]);
    }
}
