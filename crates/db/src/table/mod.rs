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

//! Tables: a record heap, an id index and any number of secondary indexes, kept in step.
//!
//! A `TableStore` is exposed through two capability traits. `TableDesign` declares columns and
//! indexes and is only usable before the owning database is opened. `Table` is the runtime
//! surface: records, result sets, and maintenance.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use crate::blob::BlobFileSystem;
use crate::heap::SlotHeap;
use crate::index::{BTreeIndex, IdIndex, IndexDef, IndexEntry};
use crate::paging::{CachedStream, SharedPageCache};
use crate::util::ordered_lock::{OrderedMutex, lock_pair};
use crate::values::{ColumnType, KeyValue, Value, decode_record, encode_record};
use crate::{DbError, Progress};

mod record;
mod result_set;

pub use record::{Record, RecordState};
pub use result_set::ResultSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

/// Live vs. allocated record slots of a table heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WastedSpace {
    pub live: u64,
    pub total: u64,
}

impl WastedSpace {
    /// Fraction of slots that hold no live record.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        1.0 - (self.live as f64 / self.total as f64)
    }
}

/// Schema-declaration surface of a table.
pub trait TableDesign: Send + Sync {
    fn name(&self) -> &str;
    /// Add a column, returning its position.
    fn create_column(&self, name: &str, column_type: ColumnType) -> Result<usize, DbError>;
    /// Index a single column. The index is named after the column.
    fn create_index(&self, column: &str) -> Result<(), DbError>;
    /// Index several columns together, in the order given.
    fn create_compound_index(&self, columns: &[&str]) -> Result<(), DbError>;
    /// Index `columns`, carrying `value_column` alongside each entry.
    fn create_index_with_value(&self, columns: &[&str], value_column: &str) -> Result<(), DbError>;
    fn column_index(&self, name: &str) -> Result<usize, DbError>;
    fn columns(&self) -> Vec<Column>;
    fn indexes(&self) -> Vec<IndexDef>;
}

/// Runtime surface of an open table.
pub trait Table: Send + Sync {
    fn name(&self) -> &str;
    /// A fresh, uncommitted record with every field at its type's default.
    fn new_record(&self) -> Result<Record, DbError>;
    fn get_record(&self, id: i32) -> Result<Option<Record>, DbError>;
    /// First record (in index order) whose `column` equals `key`.
    fn get_record_by_equal(&self, column: usize, key: KeyValue) -> Result<Option<Record>, DbError>;
    /// Every record, in the order of the index on `column`.
    fn create_result_set(&self, column: usize) -> Result<ResultSet, DbError>;
    fn create_result_set_eq(&self, column: usize, key: KeyValue) -> Result<ResultSet, DbError>;
    /// Records whose `column` lies in `[from, to]`; `None` leaves that end open.
    fn create_result_set_range(
        &self,
        column: usize,
        from: Option<KeyValue>,
        to: Option<KeyValue>,
    ) -> Result<ResultSet, DbError>;
    /// Records matching `keys` on a compound index over (a prefix of) `columns`.
    fn create_compound_result_set(
        &self,
        columns: &[usize],
        keys: &[KeyValue],
    ) -> Result<ResultSet, DbError>;
    /// `(id, value)` pairs from the with-value index keyed by `columns`, for records matching `keys`.
    fn seek_values(
        &self,
        columns: &[usize],
        keys: &[KeyValue],
    ) -> Result<Vec<(i32, KeyValue)>, DbError>;
    fn count(&self) -> Result<usize, DbError>;
    /// Allocate the next record id.
    fn next_id(&self) -> i32;
    fn peek_next_id(&self) -> i32;
    /// Recompute the id index and every secondary index from the heap. Returns whether a
    /// rebuild actually happened (always when `force`, otherwise only for a dirty table).
    fn rebuild_indexes(&self, force: bool, progress: Progress) -> Result<bool, DbError>;
    /// Rewrite the heap with only its live records, then rebuild indexes.
    fn defragment(&self, progress: Progress) -> Result<(), DbError>;
    /// Compact index files. In idle mode at most one index is compacted per call. Returns
    /// whether any index still needs compacting.
    fn defragment_indexes(&self, idle_mode: bool) -> Result<bool, DbError>;
    fn compute_wasted_space(&self) -> Result<WastedSpace, DbError>;
    fn flush(&self) -> Result<(), DbError>;
    /// True when the table needs an index rebuild before it can be trusted.
    fn is_dirty(&self) -> bool;
}

pub(crate) struct OpenTable {
    dir: PathBuf,
    cache: SharedPageCache,
    heap: SlotHeap,
    ids: IdIndex,
    indexes: Vec<BTreeIndex>,
    blobs: Arc<BlobFileSystem>,
}

pub(crate) struct TableInner {
    pub(crate) name: String,
    pub(crate) columns: Vec<Column>,
    pub(crate) indexes: Vec<IndexDef>,
    pub(crate) next_id: i32,
    pub(crate) dirty: bool,
    pub(crate) open: Option<OpenTable>,
}

pub struct TableStore {
    name: String,
    self_ref: Weak<TableStore>,
    pub(crate) inner: OrderedMutex<TableInner>,
}

pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn heap_file(table: &str) -> String {
    format!("{table}.dat")
}

fn id_index_file(table: &str) -> String {
    format!("{table}.pk")
}

fn index_file(table: &str, index: &str) -> String {
    format!("{table}.{index}.idx")
}

fn open_stream(dir: &Path, file: &str, cache: &SharedPageCache, truncate: bool) -> Result<CachedStream, DbError> {
    let handle = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(dir.join(file))?;
    CachedStream::shared(Box::new(handle), cache)
}

fn column_key(values: &[Value], column: usize) -> Option<KeyValue> {
    values.get(column).and_then(|v| v.key().ok())
}

fn entry_for(def: &IndexDef, values: &[Value], id: i32, offset: u64) -> Result<IndexEntry, DbError> {
    let key = def
        .columns
        .iter()
        .map(|c| values[*c].key())
        .collect::<Result<Vec<_>, _>>()?;
    let value = def.value_column.map(|c| values[c].key()).transpose()?;
    Ok(IndexEntry {
        key,
        value,
        offset,
        id,
    })
}

impl TableStore {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Self::with_layout(name, vec![], vec![], 1, false)
    }

    pub(crate) fn with_layout(
        name: &str,
        columns: Vec<Column>,
        indexes: Vec<IndexDef>,
        next_id: i32,
        dirty: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            self_ref: self_ref.clone(),
            inner: OrderedMutex::new(TableInner {
                name: name.to_string(),
                columns,
                indexes,
                next_id,
                dirty,
                open: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn arc(&self) -> Result<Arc<TableStore>, DbError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| DbError::TableDoesNotExist(self.name.clone()))
    }

    fn design(&self) -> Result<MutexGuard<'_, TableInner>, DbError> {
        let inner = self.inner.lock();
        if inner.open.is_some() {
            return Err(DbError::SchemaLocked);
        }
        Ok(inner)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock()
    }

    /// Open the table's files. The table ends up open even when an index turns out to be
    /// corrupted; in that case the table is marked dirty and `IndexIsCorrupted` is returned so
    /// the caller can schedule a rebuild.
    pub(crate) fn open(
        &self,
        dir: &Path,
        cache: &SharedPageCache,
        blobs: Arc<BlobFileSystem>,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.open.is_some() {
            return Ok(());
        }
        let heap = SlotHeap::open(open_stream(dir, &heap_file(&self.name), cache, false)?, heap_file(&self.name))?;
        let mut corrupted: Option<DbError> = None;

        let ids = match IdIndex::load(&self.name, open_stream(dir, &id_index_file(&self.name), cache, false)?) {
            Ok(ids) => ids,
            Err(e @ DbError::IndexIsCorrupted { .. }) => {
                corrupted = Some(e);
                let mut ids = IdIndex::load(&self.name, open_stream(dir, &id_index_file(&self.name), cache, true)?)?;
                ids.clear()?;
                ids
            }
            Err(e) => return Err(e),
        };
        if corrupted.is_none() && ids.len() as u64 != heap.live_slots() {
            corrupted = Some(DbError::IndexIsCorrupted {
                table: self.name.clone(),
                index: "#id".to_string(),
            });
        }

        let mut indexes = Vec::with_capacity(inner.indexes.len());
        for def in &inner.indexes {
            let file = index_file(&self.name, &def.name);
            let index = match BTreeIndex::load(def.clone(), &self.name, open_stream(dir, &file, cache, false)?) {
                Ok(index) => {
                    if corrupted.is_none() && index.len() != ids.len() {
                        corrupted = Some(DbError::IndexIsCorrupted {
                            table: self.name.clone(),
                            index: def.name.clone(),
                        });
                    }
                    index
                }
                Err(e @ DbError::IndexIsCorrupted { .. }) => {
                    corrupted.get_or_insert(e);
                    BTreeIndex::load(def.clone(), &self.name, open_stream(dir, &file, cache, true)?)?
                }
                Err(e) => return Err(e),
            };
            indexes.push(index);
        }

        debug!(table = self.name, records = ids.len(), indexes = indexes.len(), "opened table");
        inner.open = Some(OpenTable {
            dir: dir.to_path_buf(),
            cache: cache.clone(),
            heap,
            ids,
            indexes,
            blobs,
        });
        match corrupted {
            Some(e) => {
                warn!(table = self.name, "index corruption detected on open: {e}");
                inner.dirty = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Flush and release the table's files.
    pub(crate) fn close(&self) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        if inner.open.is_some() {
            inner.flush()?;
        }
        inner.open = None;
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.lock().open.is_some()
    }

    pub(crate) fn mark_dirty(&self) {
        self.inner.lock().dirty = true;
    }

    /// Delete every file belonging to this table from `dir`.
    pub(crate) fn remove_files(&self, dir: &Path) -> Result<(), DbError> {
        let inner = self.inner.lock();
        let mut files = vec![heap_file(&self.name), id_index_file(&self.name)];
        files.extend(inner.indexes.iter().map(|d| index_file(&self.name, &d.name)));
        for file in files {
            match std::fs::remove_file(dir.join(&file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn add_index(&self, columns: &[&str], value_column: Option<&str>) -> Result<(), DbError> {
        let mut inner = self.design()?;
        let positions = columns
            .iter()
            .map(|c| inner.column_position(c))
            .collect::<Result<Vec<_>, _>>()?;
        let value_position = value_column.map(|c| inner.column_position(c)).transpose()?;
        for p in positions.iter().chain(value_position.iter()) {
            let column = &inner.columns[*p];
            if !column.column_type.is_indexable() {
                return Err(DbError::NotIndexable(column.column_type));
            }
        }
        if positions.is_empty() {
            return Err(DbError::InvalidName(String::new()));
        }
        let mut name = columns.join("+");
        if let Some(v) = value_column {
            name = format!("{name}@{v}");
        }
        if inner.indexes.iter().any(|d| d.name == name) {
            return Ok(());
        }
        inner.indexes.push(IndexDef {
            name,
            columns: positions,
            value_column: value_position,
        });
        Ok(())
    }

    fn result_set(&self, rows: Vec<(i32, u64)>) -> Result<ResultSet, DbError> {
        Ok(ResultSet::new(self.arc()?, rows))
    }
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore").field("name", &self.name).finish()
    }
}

impl TableInner {
    fn column_position(&self, name: &str) -> Result<usize, DbError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DbError::ColumnDoesNotExist {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub(crate) fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }

    pub(crate) fn opened(&mut self) -> Result<&mut OpenTable, DbError> {
        self.open.as_mut().ok_or(DbError::DatabaseNotOpen)
    }

    /// Position of the index best serving lookups on `columns`: an exact match on the key
    /// columns is preferred, then any index whose key starts with them.
    fn index_for(&self, columns: &[usize], with_value: bool) -> Result<usize, DbError> {
        let candidates: Vec<(usize, &IndexDef)> = self
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, d)| d.columns.starts_with(columns))
            .filter(|(_, d)| !with_value || d.value_column.is_some())
            .collect();
        candidates
            .iter()
            .find(|(_, d)| d.columns.len() == columns.len())
            .or_else(|| candidates.first())
            .map(|(i, _)| *i)
            .ok_or_else(|| DbError::IndexDoesNotExist {
                table: self.name.clone(),
                index: columns
                    .iter()
                    .map(|c| {
                        self.columns
                            .get(*c)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| c.to_string())
                    })
                    .collect::<Vec<_>>()
                    .join("+"),
            })
    }

    fn check_key_types(&self, columns: &[usize], keys: &[KeyValue]) -> Result<(), DbError> {
        for (c, key) in columns.iter().zip(keys) {
            let column = self.columns.get(*c).ok_or_else(|| DbError::ColumnDoesNotExist {
                table: self.name.clone(),
                column: c.to_string(),
            })?;
            if column.column_type != key.column_type() {
                return Err(DbError::TypeMismatch {
                    table: self.name.clone(),
                    column: column.name.clone(),
                    expected: column.column_type,
                    actual: key.column_type(),
                });
            }
        }
        Ok(())
    }

    fn prefix_rows(&mut self, columns: &[usize], keys: &[KeyValue]) -> Result<Vec<(i32, u64)>, DbError> {
        self.check_key_types(columns, keys)?;
        let slot = self.index_for(columns, false)?;
        let index = &mut self.opened()?.indexes[slot];
        let exact = index.is_exact(keys);
        let found = index.seek_prefix(keys)?;
        if exact {
            return Ok(found.iter().map(|e| (e.id, e.offset)).collect());
        }
        // Long strings are indexed clipped; confirm each hit against its record.
        let mut rows = vec![];
        for entry in found {
            if let Some((_, values)) = self.read_at(entry.offset)?
                && columns.iter().zip(keys).all(|(c, k)| column_key(&values, *c).as_ref() == Some(k))
            {
                rows.push((entry.id, entry.offset));
            }
        }
        Ok(rows)
    }

    fn range_rows(
        &mut self,
        column: usize,
        from: Option<&KeyValue>,
        to: Option<&KeyValue>,
    ) -> Result<Vec<(i32, u64)>, DbError> {
        let bounds: Vec<KeyValue> = from.iter().chain(to.iter()).map(|k| (*k).clone()).collect();
        self.check_key_types(&vec![column; bounds.len()], &bounds)?;
        let slot = self.index_for(&[column], false)?;
        let index = &mut self.opened()?.indexes[slot];
        let exact = index.is_exact(&bounds);
        let found = index.range(from, to)?;
        if exact {
            return Ok(found.iter().map(|e| (e.id, e.offset)).collect());
        }
        let mut rows = vec![];
        for entry in found {
            let Some((_, values)) = self.read_at(entry.offset)? else {
                continue;
            };
            let Some(key) = column_key(&values, column) else {
                continue;
            };
            if from.is_none_or(|from| &key >= from) && to.is_none_or(|to| &key <= to) {
                rows.push((entry.id, entry.offset));
            }
        }
        Ok(rows)
    }

    pub(crate) fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Decode the record stored at `offset`.
    pub(crate) fn read_at(&mut self, offset: u64) -> Result<Option<(i32, Vec<Value>)>, DbError> {
        let types = self.column_types();
        let open = self.opened()?;
        let Some(bytes) = open.heap.read(offset)? else {
            return Ok(None);
        };
        decode_record(&bytes, &types, open.heap.file(), offset).map(Some)
    }

    /// Current offset and values of record `id`, if it is live.
    pub(crate) fn read_id(&mut self, id: i32) -> Result<Option<(u64, Vec<Value>)>, DbError> {
        let Some(offset) = self.opened()?.ids.get(id)? else {
            return Ok(None);
        };
        Ok(self.read_at(offset)?.map(|(_, values)| (offset, values)))
    }

    /// Store a new record with `id`, adding it to every index.
    pub(crate) fn insert(&mut self, id: i32, values: &[Value]) -> Result<u64, DbError> {
        let payload = encode_record(id, values)?;
        let open = self.opened()?;
        let offset = open.heap.allocate(&payload)?;
        open.ids.insert(id, offset)?;
        for index in open.indexes.iter_mut() {
            let entry = entry_for(index.def(), values, id, offset)?;
            index.insert(entry)?;
        }
        if self.next_id <= id {
            self.next_id = id + 1;
        }
        Ok(offset)
    }

    /// Replace the stored values of record `id`. Returns the record's (possibly new) offset.
    pub(crate) fn update(&mut self, id: i32, values: &[Value]) -> Result<u64, DbError> {
        let Some((old_offset, old_values)) = self.read_id(id)? else {
            return Err(DbError::AttemptWritingToDeletedRecord {
                table: self.name.clone(),
                id,
            });
        };
        let payload = encode_record(id, values)?;
        let open = self.opened()?;
        let offset = open.heap.rewrite(old_offset, &payload)?;
        open.ids.insert(id, offset)?;
        for index in open.indexes.iter_mut() {
            let old = entry_for(index.def(), &old_values, id, old_offset)?;
            let new = entry_for(index.def(), values, id, offset)?;
            if old != new {
                index.remove(&old)?;
                index.insert(new)?;
            }
        }
        Ok(offset)
    }

    /// Remove record `id` from the heap and every index. BLOBs it references are freed when
    /// `free_blobs` is set. Returns the removed values, or `None` if it was not live.
    pub(crate) fn delete(&mut self, id: i32, free_blobs: bool) -> Result<Option<Vec<Value>>, DbError> {
        let Some((offset, values)) = self.read_id(id)? else {
            return Ok(None);
        };
        let open = self.opened()?;
        for index in open.indexes.iter_mut() {
            let entry = entry_for(index.def(), &values, id, offset)?;
            index.remove(&entry)?;
        }
        open.ids.remove(id)?;
        open.heap.free(offset)?;
        if free_blobs {
            for value in &values {
                if let Value::Blob(handle) = value
                    && !handle.is_none()
                {
                    open.blobs.free(*handle)?;
                }
            }
        }
        Ok(Some(values))
    }

    pub(crate) fn blobs(&mut self) -> Result<Arc<BlobFileSystem>, DbError> {
        Ok(self.opened()?.blobs.clone())
    }

    pub(crate) fn flush(&mut self) -> Result<(), DbError> {
        let open = self.opened()?;
        open.heap.sync()?;
        open.ids.save()?;
        for index in open.indexes.iter_mut() {
            index.save()?;
        }
        Ok(())
    }

    fn rebuild(&mut self, progress: Progress) -> Result<(), DbError> {
        let types = self.column_types();
        let name = self.name.clone();
        let open = self.opened()?;
        let total = open.heap.total_slots();

        let mut records = vec![];
        let mut damaged = vec![];
        let mut done = 0;
        let file = open.heap.file().to_string();
        let outcome = open.heap.scan(|offset, payload| {
            match decode_record(payload, &types, &file, offset) {
                Ok((id, values)) => records.push((id, offset, values)),
                Err(e) if e.is_corruption() => {
                    warn!(table = name, offset, "dropping undecodable record: {e}");
                    damaged.push(offset);
                }
                Err(e) => return Err(e),
            }
            done += 1;
            progress(done, total);
            Ok(())
        })?;
        if let Some(at) = outcome.truncated_at {
            warn!(table = name, offset = at, "truncating damaged heap tail");
            open.heap.truncate(at)?;
        }
        for offset in damaged {
            open.heap.free(offset)?;
        }

        let mut seen = HashSet::with_capacity(records.len());
        let mut max_id = 0;
        let mut rows = Vec::with_capacity(records.len());
        let mut entries: Vec<Vec<IndexEntry>> = open.indexes.iter().map(|_| vec![]).collect();
        for (id, offset, values) in records {
            if !seen.insert(id) {
                warn!(table = name, id, offset, "dropping duplicate record");
                open.heap.free(offset)?;
                continue;
            }
            max_id = max_id.max(id);
            rows.push((id, offset));
            for (index, out) in open.indexes.iter().zip(entries.iter_mut()) {
                out.push(entry_for(index.def(), &values, id, offset)?);
            }
        }
        open.ids.replace_all(&rows)?;
        for (index, entries) in open.indexes.iter_mut().zip(entries) {
            index.replace_all(entries)?;
        }
        open.heap.rebuild_free_list()?;
        debug!(table = name, live = outcome.live, max_id, "rebuilt indexes");
        self.next_id = self.next_id.max(max_id + 1);
        self.dirty = false;
        self.flush()
    }
}

impl TableDesign for TableStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_column(&self, name: &str, column_type: ColumnType) -> Result<usize, DbError> {
        if !valid_name(name) {
            return Err(DbError::InvalidName(name.to_string()));
        }
        let mut inner = self.design()?;
        if inner.columns.iter().any(|c| c.name == name) {
            return Err(DbError::ColumnAlreadyExists {
                table: self.name.clone(),
                column: name.to_string(),
            });
        }
        inner.columns.push(Column {
            name: name.to_string(),
            column_type,
        });
        Ok(inner.columns.len() - 1)
    }

    fn create_index(&self, column: &str) -> Result<(), DbError> {
        self.add_index(&[column], None)
    }

    fn create_compound_index(&self, columns: &[&str]) -> Result<(), DbError> {
        self.add_index(columns, None)
    }

    fn create_index_with_value(&self, columns: &[&str], value_column: &str) -> Result<(), DbError> {
        self.add_index(columns, Some(value_column))
    }

    fn column_index(&self, name: &str) -> Result<usize, DbError> {
        self.inner.lock().column_position(name)
    }

    fn columns(&self) -> Vec<Column> {
        self.inner.lock().columns.clone()
    }

    fn indexes(&self) -> Vec<IndexDef> {
        self.inner.lock().indexes.clone()
    }
}

impl Table for TableStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_record(&self) -> Result<Record, DbError> {
        let inner = self.inner.lock();
        if inner.open.is_none() {
            return Err(DbError::DatabaseNotOpen);
        }
        let values = inner.columns.iter().map(|c| c.column_type.default_value()).collect();
        Ok(Record::new(self.arc()?, values))
    }

    fn get_record(&self, id: i32) -> Result<Option<Record>, DbError> {
        let found = self.inner.lock().read_id(id)?;
        Ok(match found {
            Some((_, values)) => Some(Record::committed(self.arc()?, id, values)),
            None => None,
        })
    }

    fn get_record_by_equal(&self, column: usize, key: KeyValue) -> Result<Option<Record>, DbError> {
        let mut inner = self.inner.lock();
        let rows = inner.prefix_rows(&[column], std::slice::from_ref(&key))?;
        for (id, offset) in rows {
            if let Some((_, values)) = inner.read_at(offset)? {
                return Ok(Some(Record::committed(self.arc()?, id, values)));
            }
        }
        Ok(None)
    }

    fn create_result_set(&self, column: usize) -> Result<ResultSet, DbError> {
        let rows = {
            let mut inner = self.inner.lock();
            let slot = inner.index_for(&[column], false)?;
            let open = inner.opened()?;
            open.indexes[slot].entries()?.iter().map(|e| (e.id, e.offset)).collect()
        };
        self.result_set(rows)
    }

    fn create_result_set_eq(&self, column: usize, key: KeyValue) -> Result<ResultSet, DbError> {
        let rows = self.inner.lock().prefix_rows(&[column], &[key])?;
        self.result_set(rows)
    }

    fn create_result_set_range(
        &self,
        column: usize,
        from: Option<KeyValue>,
        to: Option<KeyValue>,
    ) -> Result<ResultSet, DbError> {
        let rows = self.inner.lock().range_rows(column, from.as_ref(), to.as_ref())?;
        self.result_set(rows)
    }

    fn create_compound_result_set(
        &self,
        columns: &[usize],
        keys: &[KeyValue],
    ) -> Result<ResultSet, DbError> {
        let rows = self.inner.lock().prefix_rows(columns, keys)?;
        self.result_set(rows)
    }

    fn seek_values(
        &self,
        columns: &[usize],
        keys: &[KeyValue],
    ) -> Result<Vec<(i32, KeyValue)>, DbError> {
        let mut inner = self.inner.lock();
        inner.check_key_types(columns, keys)?;
        let slot = inner.index_for(columns, true)?;
        let value_column = inner.indexes[slot].value_column;
        let index = &mut inner.opened()?.indexes[slot];
        let exact = index.is_exact(keys);
        let found = index.seek_prefix(keys)?;
        let clipped: Vec<bool> = found
            .iter()
            .map(|e| e.value.as_ref().is_some_and(|v| index.may_be_clipped(v)))
            .collect();
        let mut out = vec![];
        for (entry, clipped) in found.into_iter().zip(clipped) {
            if exact && !clipped {
                out.extend(entry.value.map(|v| (entry.id, v)));
                continue;
            }
            let Some((_, values)) = inner.read_at(entry.offset)? else {
                continue;
            };
            if !columns.iter().zip(keys).all(|(c, k)| column_key(&values, *c).as_ref() == Some(k)) {
                continue;
            }
            out.extend(value_column.and_then(|c| column_key(&values, c)).map(|v| (entry.id, v)));
        }
        Ok(out)
    }

    fn count(&self) -> Result<usize, DbError> {
        Ok(self.inner.lock().opened()?.ids.len())
    }

    fn next_id(&self) -> i32 {
        self.inner.lock().allocate_id()
    }

    fn peek_next_id(&self) -> i32 {
        self.inner.lock().next_id
    }

    fn rebuild_indexes(&self, force: bool, progress: Progress) -> Result<bool, DbError> {
        let mut inner = self.inner.lock();
        if !force && !inner.dirty {
            return Ok(false);
        }
        info!(table = self.name, force, "rebuilding indexes");
        inner.rebuild(progress)?;
        Ok(true)
    }

    fn defragment(&self, progress: Progress) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let types = inner.column_types();
        let open = inner.opened()?;
        let before = WastedSpace {
            live: open.heap.live_slots(),
            total: open.heap.total_slots(),
        };
        let scratch = format!("{}.defrag", heap_file(&self.name));
        let mut compacted = SlotHeap::open(
            open_stream(&open.dir, &scratch, &open.cache, true)?,
            heap_file(&self.name),
        )?;

        let mut live = vec![];
        let file = open.heap.file().to_string();
        open.heap.scan(|offset, payload| {
            // Undecodable records are left behind; the rebuild below accounts for them.
            if decode_record(payload, &types, &file, offset).is_ok() {
                live.push(payload.to_vec());
            }
            Ok(())
        })?;
        let total = live.len() as u64;
        for (done, payload) in live.iter().enumerate() {
            compacted.allocate(payload)?;
            progress(done as u64 + 1, total);
        }
        compacted.sync()?;
        open.heap.sync()?;

        let old = std::mem::replace(&mut open.heap, compacted);
        drop(old);
        std::fs::rename(open.dir.join(&scratch), open.dir.join(heap_file(&self.name)))?;
        info!(
            table = self.name,
            before_live = before.live,
            before_total = before.total,
            after = total,
            "defragmented table heap"
        );
        inner.rebuild(&mut |_, _| {})
    }

    fn defragment_indexes(&self, idle_mode: bool) -> Result<bool, DbError> {
        let mut inner = self.inner.lock();
        let open = inner.opened()?;
        let mut compacted = 0;
        if open.ids.is_fragmented() {
            open.ids.compact()?;
            compacted += 1;
        }
        for index in open.indexes.iter_mut() {
            if !index.is_fragmented() {
                continue;
            }
            if idle_mode && compacted > 0 {
                return Ok(true);
            }
            index.compact()?;
            compacted += 1;
        }
        debug!(table = self.name, compacted, "defragmented indexes");
        Ok(false)
    }

    fn compute_wasted_space(&self) -> Result<WastedSpace, DbError> {
        let mut inner = self.inner.lock();
        let open = inner.opened()?;
        Ok(WastedSpace {
            live: open.heap.live_slots(),
            total: open.heap.total_slots(),
        })
    }

    fn flush(&self) -> Result<(), DbError> {
        self.inner.lock().flush()
    }

    fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }
}

/// Move records from `src` to `dst`. `map` turns each source record's values into the
/// destination's, or `None` to leave the record where it is. Moved records keep their BLOBs and
/// receive fresh ids in `dst`. Returns the number of records moved.
pub fn transfer_records(
    src: &TableStore,
    dst: &TableStore,
    mut map: impl FnMut(i32, &[Value]) -> Option<Vec<Value>>,
) -> Result<usize, DbError> {
    if std::ptr::eq(src, dst) {
        return Err(DbError::TransferIntoSameTable(src.name.clone()));
    }
    let (mut from, mut to) = lock_pair(&src.inner, &dst.inner);
    let ids: Vec<i32> = from.opened()?.ids.rows()?.into_iter().map(|(id, _)| id).collect();
    let dst_types = to.column_types();
    let mut moved = 0;
    for id in ids {
        let Some((_, values)) = from.read_id(id)? else {
            continue;
        };
        let Some(mapped) = map(id, &values) else {
            continue;
        };
        if mapped.len() != dst_types.len() {
            return Err(DbError::ColumnCountMismatch {
                table: dst.name.clone(),
                expected: dst_types.len(),
                actual: mapped.len(),
            });
        }
        for (column, (value, expected)) in mapped.iter().zip(&dst_types).enumerate() {
            if value.column_type() != *expected {
                return Err(DbError::TypeMismatch {
                    table: dst.name.clone(),
                    column: to.columns[column].name.clone(),
                    expected: *expected,
                    actual: value.column_type(),
                });
            }
        }
        let new_id = to.allocate_id();
        to.insert(new_id, &mapped)?;
        from.delete(id, false)?;
        moved += 1;
    }
    debug!(from = src.name, to = dst.name, moved, "transferred records");
    Ok(moved)
}
