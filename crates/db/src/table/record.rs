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

use chrono::NaiveDateTime;

use tracing::warn;

use crate::DbError;
use crate::blob::{BlobFileSystem, BlobHandle};
use crate::table::TableStore;
use crate::values::{ColumnType, Value};

/// Where a record stands in its get → set → commit lifecycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecordState {
    /// Created by `new_record`, never committed.
    New,
    /// Matches what is stored.
    Committed,
    /// Committed once, modified since.
    Updated,
    Deleted,
}

/// One row of a table, detached from storage until `commit`.
pub struct Record {
    table: Arc<TableStore>,
    id: i32,
    state: RecordState,
    values: Vec<Value>,
    pending_blobs: Vec<(usize, Vec<u8>)>,
}

impl Record {
    pub(crate) fn new(table: Arc<TableStore>, values: Vec<Value>) -> Self {
        Self {
            table,
            id: -1,
            state: RecordState::New,
            values,
            pending_blobs: vec![],
        }
    }

    pub(crate) fn committed(table: Arc<TableStore>, id: i32, values: Vec<Value>) -> Self {
        Self {
            table,
            id,
            state: RecordState::Committed,
            values,
            pending_blobs: vec![],
        }
    }

    /// The record's id; -1 until first committed.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn table(&self) -> &Arc<TableStore> {
        &self.table
    }

    fn check_readable(&self) -> Result<(), DbError> {
        if self.state == RecordState::Deleted {
            return Err(DbError::AttemptReadingDeletedRecord {
                table: self.table.name().to_string(),
                id: self.id,
            });
        }
        Ok(())
    }

    fn column(&self, column: usize, expected: ColumnType) -> Result<&Value, DbError> {
        self.check_readable()?;
        let value = self.values.get(column).ok_or_else(|| DbError::ColumnDoesNotExist {
            table: self.table.name().to_string(),
            column: column.to_string(),
        })?;
        if value.column_type() != expected {
            return Err(self.mismatch(column, expected, value.column_type()));
        }
        Ok(value)
    }

    fn mismatch(&self, column: usize, expected: ColumnType, actual: ColumnType) -> DbError {
        let name = self
            .table
            .lock()
            .columns
            .get(column)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| column.to_string());
        DbError::TypeMismatch {
            table: self.table.name().to_string(),
            column: name,
            expected,
            actual,
        }
    }

    pub fn get(&self, column: usize) -> Result<&Value, DbError> {
        self.check_readable()?;
        self.values.get(column).ok_or_else(|| DbError::ColumnDoesNotExist {
            table: self.table.name().to_string(),
            column: column.to_string(),
        })
    }

    pub fn values(&self) -> Result<&[Value], DbError> {
        self.check_readable()?;
        Ok(&self.values)
    }

    pub fn get_int(&self, column: usize) -> Result<i32, DbError> {
        match self.column(column, ColumnType::Int)? {
            Value::Int(i) => Ok(*i),
            other => Err(self.mismatch(column, ColumnType::Int, other.column_type())),
        }
    }

    pub fn get_string(&self, column: usize) -> Result<&str, DbError> {
        match self.column(column, ColumnType::String)? {
            Value::String(s) => Ok(s),
            other => Err(self.mismatch(column, ColumnType::String, other.column_type())),
        }
    }

    pub fn get_date(&self, column: usize) -> Result<NaiveDateTime, DbError> {
        match self.column(column, ColumnType::DateTime)? {
            Value::DateTime(dt) => Ok(*dt),
            other => Err(self.mismatch(column, ColumnType::DateTime, other.column_type())),
        }
    }

    pub fn get_double(&self, column: usize) -> Result<f64, DbError> {
        match self.column(column, ColumnType::Double)? {
            Value::Double(d) => Ok(*d),
            other => Err(self.mismatch(column, ColumnType::Double, other.column_type())),
        }
    }

    pub fn get_blob_handle(&self, column: usize) -> Result<BlobHandle, DbError> {
        match self.column(column, ColumnType::Blob)? {
            Value::Blob(h) => Ok(*h),
            other => Err(self.mismatch(column, ColumnType::Blob, other.column_type())),
        }
    }

    /// Contents of a BLOB column, including contents set but not yet committed. An unset BLOB
    /// reads as empty.
    pub fn get_blob(&self, column: usize) -> Result<Vec<u8>, DbError> {
        let handle = self.get_blob_handle(column)?;
        if let Some((_, data)) = self.pending_blobs.iter().rev().find(|(c, _)| *c == column) {
            return Ok(data.clone());
        }
        if handle.is_none() {
            return Ok(vec![]);
        }
        let blobs = self.table.lock().blobs()?;
        blobs.read(handle)
    }

    /// Set a field. The value's type must match the column's.
    pub fn set(&mut self, column: usize, value: Value) -> Result<(), DbError> {
        if self.state == RecordState::Deleted {
            return Err(DbError::AttemptWritingToDeletedRecord {
                table: self.table.name().to_string(),
                id: self.id,
            });
        }
        let current = self.values.get(column).ok_or_else(|| DbError::ColumnDoesNotExist {
            table: self.table.name().to_string(),
            column: column.to_string(),
        })?;
        if current.column_type() != value.column_type() {
            return Err(self.mismatch(column, current.column_type(), value.column_type()));
        }
        self.values[column] = value;
        if self.state == RecordState::Committed {
            self.state = RecordState::Updated;
        }
        Ok(())
    }

    pub fn set_int(&mut self, column: usize, value: i32) -> Result<(), DbError> {
        self.set(column, Value::Int(value))
    }

    pub fn set_string(&mut self, column: usize, value: &str) -> Result<(), DbError> {
        self.set(column, Value::String(value.to_string()))
    }

    pub fn set_date(&mut self, column: usize, value: NaiveDateTime) -> Result<(), DbError> {
        self.set(column, Value::DateTime(value))
    }

    pub fn set_double(&mut self, column: usize, value: f64) -> Result<(), DbError> {
        self.set(column, Value::Double(value))
    }

    /// Stage new contents for a BLOB column; they are written out on `commit`.
    pub fn set_blob(&mut self, column: usize, data: &[u8]) -> Result<(), DbError> {
        let handle = self.get_blob_handle(column).map_err(|e| match e {
            DbError::AttemptReadingDeletedRecord { table, id } => {
                DbError::AttemptWritingToDeletedRecord { table, id }
            }
            other => other,
        })?;
        self.set(column, Value::Blob(handle))?;
        self.pending_blobs.push((column, data.to_vec()));
        if self.state == RecordState::Committed {
            self.state = RecordState::Updated;
        }
        Ok(())
    }

    /// Persist the record: a new record gets its id and joins every index, an updated one is
    /// rewritten and re-indexed.
    pub fn commit(&mut self) -> Result<(), DbError> {
        let mut inner = self.table.lock();
        match self.state {
            RecordState::New | RecordState::Updated => {}
            RecordState::Committed | RecordState::Deleted => {
                return Err(DbError::AttemptCommitNotNewOrNotUpdatedRecord {
                    table: self.table.name().to_string(),
                    id: self.id,
                });
            }
        }

        // Staged BLOBs go to fresh slots; the previous contents are freed only once the
        // record itself is stored.
        let mut values = self.values.clone();
        let mut replaced: Vec<(usize, BlobHandle)> = vec![];
        let blobs = if self.pending_blobs.is_empty() {
            None
        } else {
            Some(inner.blobs()?)
        };
        if let Some(blobs) = &blobs {
            for (column, data) in self.pending_blobs.iter().rev() {
                if replaced.iter().any(|(c, _)| c == column) {
                    continue;
                }
                let Value::Blob(previous) = values[*column] else {
                    continue;
                };
                match blobs.store(data) {
                    Ok(handle) => {
                        values[*column] = Value::Blob(handle);
                        replaced.push((*column, previous));
                    }
                    Err(e) => {
                        release_new_blobs(blobs, &values, &replaced);
                        return Err(e);
                    }
                }
            }
        }

        let stored = match self.state {
            RecordState::New => {
                let id = inner.allocate_id();
                inner.insert(id, &values).map(|_| id)
            }
            _ => inner.update(self.id, &values).map(|_| self.id),
        };
        let id = match stored {
            Ok(id) => id,
            Err(e) => {
                if let Some(blobs) = &blobs {
                    release_new_blobs(blobs, &values, &replaced);
                }
                return Err(e);
            }
        };
        if let Some(blobs) = &blobs {
            for (_, previous) in &replaced {
                blobs.free(*previous)?;
            }
        }
        self.id = id;
        self.values = values;
        self.pending_blobs.clear();
        self.state = RecordState::Committed;
        Ok(())
    }

    /// Remove the record from storage and every index. Its BLOBs are freed.
    pub fn delete(&mut self) -> Result<(), DbError> {
        match self.state {
            RecordState::Deleted => {
                return Err(DbError::AttemptWritingToDeletedRecord {
                    table: self.table.name().to_string(),
                    id: self.id,
                });
            }
            RecordState::New => {}
            RecordState::Committed | RecordState::Updated => {
                self.table.lock().delete(self.id, true)?;
            }
        }
        self.pending_blobs.clear();
        self.state = RecordState::Deleted;
        Ok(())
    }
}

fn release_new_blobs(blobs: &BlobFileSystem, values: &[Value], replaced: &[(usize, BlobHandle)]) {
    for (column, _) in replaced {
        if let Value::Blob(handle) = values[*column]
            && let Err(e) = blobs.free(handle)
        {
            warn!(handle = handle.0, error = %e, "could not release BLOB of failed commit");
        }
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("table", &self.table.name())
            .field("id", &self.id)
            .field("state", &self.state)
            .field("values", &self.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::open_table;
    use crate::table::{Table, TableDesign};
    use crate::values::KeyValue;
    use chrono::NaiveDate;
    use rand::Rng;
    use std::collections::HashMap;

    #[test]
    fn lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_table(dir.path());
        let mut record = table.new_record().unwrap();
        record.set_string(0, "x").unwrap();
        record.commit().unwrap();
        assert_eq!(record.state(), RecordState::Committed);
        assert!(matches!(
            record.commit(),
            Err(DbError::AttemptCommitNotNewOrNotUpdatedRecord { .. })
        ));

        record.set_int(1, 9).unwrap();
        assert_eq!(record.state(), RecordState::Updated);
        record.commit().unwrap();

        record.delete().unwrap();
        assert!(matches!(
            record.get_int(1),
            Err(DbError::AttemptReadingDeletedRecord { .. })
        ));
        assert!(matches!(
            record.set_int(1, 1),
            Err(DbError::AttemptWritingToDeletedRecord { .. })
        ));
        assert!(matches!(
            record.commit(),
            Err(DbError::AttemptCommitNotNewOrNotUpdatedRecord { .. })
        ));
        assert!(matches!(
            record.set_string(1, "not an int"),
            Err(DbError::AttemptWritingToDeletedRecord { .. })
        ));
    }

    #[test]
    fn typed_accessors_check_types() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_table(dir.path());
        let mut record = table.new_record().unwrap();
        assert!(matches!(record.set_int(0, 1), Err(DbError::TypeMismatch { .. })));
        assert!(matches!(record.get_string(1), Err(DbError::TypeMismatch { .. })));
        assert!(matches!(record.get_int(17), Err(DbError::ColumnDoesNotExist { .. })));
        record.set_double(2, 2.5).unwrap();
        assert_eq!(record.get_double(2).unwrap(), 2.5);
    }

    #[test]
    fn stale_handle_sees_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_table(dir.path());
        let mut record = table.new_record().unwrap();
        record.set_string(0, "ghost").unwrap();
        record.commit().unwrap();
        let mut other = table.get_record(record.id()).unwrap().unwrap();
        record.delete().unwrap();
        other.set_int(1, 4).unwrap();
        assert!(matches!(
            other.commit(),
            Err(DbError::AttemptWritingToDeletedRecord { .. })
        ));
    }

    #[test]
    fn blobs_and_dates() {
        let dir = tempfile::tempdir().unwrap();
        let table = crate::table::TableStore::new("Docs");
        table.create_column("When", ColumnType::DateTime).unwrap();
        table.create_column("Body", ColumnType::Blob).unwrap();
        table.create_index("When").unwrap();
        let cache = crate::paging::SharedPageCache::new(1 << 20);
        let blobs = Arc::new(crate::blob::BlobFileSystem::open(dir.path(), &cache).unwrap());
        table.open(dir.path(), &cache, blobs.clone()).unwrap();

        let when = NaiveDate::from_ymd_opt(2004, 7, 9)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap();
        let mut record = table.new_record().unwrap();
        record.set_date(0, when).unwrap();
        record.set_blob(1, b"body text").unwrap();
        assert_eq!(record.get_blob(1).unwrap(), b"body text");
        record.commit().unwrap();
        assert_eq!(blobs.count(), 1);

        let found = table
            .get_record_by_equal(0, Value::DateTime(when).key().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(found.get_date(0).unwrap(), when);
        assert_eq!(found.get_blob(1).unwrap(), b"body text");

        let mut found = found;
        found.delete().unwrap();
        assert_eq!(blobs.count(), 0);
    }

    #[test]
    fn failed_commit_releases_staged_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let table = crate::table::TableStore::new("Docs");
        table.create_column("Body", ColumnType::Blob).unwrap();
        let cache = crate::paging::SharedPageCache::new(1 << 20);
        let blobs = Arc::new(crate::blob::BlobFileSystem::open(dir.path(), &cache).unwrap());
        table.open(dir.path(), &cache, blobs.clone()).unwrap();

        let mut record = table.new_record().unwrap();
        record.set_blob(0, b"first").unwrap();
        record.commit().unwrap();
        assert_eq!(blobs.count(), 1);

        let mut stale = table.get_record(record.id()).unwrap().unwrap();
        record.delete().unwrap();
        assert_eq!(blobs.count(), 0);
        stale.set_blob(0, b"second").unwrap();
        assert!(matches!(
            stale.commit(),
            Err(DbError::AttemptWritingToDeletedRecord { .. })
        ));
        assert_eq!(blobs.count(), 0);
    }

    #[test]
    fn blob_update_frees_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let table = crate::table::TableStore::new("Docs");
        table.create_column("Body", ColumnType::Blob).unwrap();
        let cache = crate::paging::SharedPageCache::new(1 << 20);
        let blobs = Arc::new(crate::blob::BlobFileSystem::open(dir.path(), &cache).unwrap());
        table.open(dir.path(), &cache, blobs.clone()).unwrap();

        let mut record = table.new_record().unwrap();
        record.set_blob(0, b"one").unwrap();
        record.commit().unwrap();
        record.set_blob(0, b"two").unwrap();
        record.set_blob(0, b"three").unwrap();
        record.commit().unwrap();
        assert_eq!(blobs.count(), 1);
        let stored = table.get_record(record.id()).unwrap().unwrap();
        assert_eq!(stored.get_blob(0).unwrap(), b"three");
    }

    #[test]
    fn random_workload_matches_model() {
        let dir = tempfile::tempdir().unwrap();
        let table = open_table(dir.path());
        let mut rng = rand::rng();
        let mut model: HashMap<i32, (String, i32)> = HashMap::new();

        for step in 0..400 {
            let roll = rng.random_range(0..10);
            if roll < 5 || model.is_empty() {
                let name = format!("r{step}-{}", "x".repeat(rng.random_range(0..40)));
                let age = rng.random_range(0..20);
                let mut record = table.new_record().unwrap();
                record.set_string(0, &name).unwrap();
                record.set_int(1, age).unwrap();
                record.commit().unwrap();
                model.insert(record.id(), (name, age));
            } else {
                let ids: Vec<i32> = model.keys().copied().collect();
                let id = ids[rng.random_range(0..ids.len())];
                let mut record = table.get_record(id).unwrap().unwrap();
                if roll < 8 {
                    let name = format!("u{step}-{}", "y".repeat(rng.random_range(0..80)));
                    record.set_string(0, &name).unwrap();
                    record.commit().unwrap();
                    model.get_mut(&id).unwrap().0 = name;
                } else {
                    record.delete().unwrap();
                    model.remove(&id);
                    assert!(table.get_record(id).unwrap().is_none());
                }
            }
        }

        assert_eq!(table.count().unwrap(), model.len());
        for (id, (name, age)) in &model {
            let by_name = table
                .get_record_by_equal(0, KeyValue::from(name.as_str()))
                .unwrap()
                .unwrap();
            assert_eq!(by_name.id(), *id);
            assert_eq!(by_name.get_int(1).unwrap(), *age);
        }

        let ages: Vec<i32> = table
            .create_result_set(1)
            .unwrap()
            .map(|r| r.unwrap().get_int(1).unwrap())
            .collect();
        assert_eq!(ages.len(), model.len());
        assert!(ages.windows(2).all(|w| w[0] <= w[1]));
    }
}
