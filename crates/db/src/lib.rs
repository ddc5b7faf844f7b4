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

//! An embedded, single-writer table engine.
//!
//! A database is a directory holding one structure file (`structure.dbs`), a record heap and a
//! set of index files per table, and one shared BLOB heap. Every file is accessed through the
//! page cache in [`paging`].
//!
//! The schema is declared in code through the design-time traits ([`DatabaseDesign`],
//! [`TableDesign`]) before the database is opened; once open, the runtime traits ([`Database`],
//! [`Table`]) provide record creation, lookup and maintenance.

pub use blob::{BlobFileSystem, BlobHandle};
pub use config::DatabaseConfig;
pub use db::{Database, DatabaseDesign, PendingMaintenance, StoreDb};
pub use index::IndexDef;
pub use structure::{ENGINE_VERSION, VersionInfo, load_version_info};
pub use table::{
    Column, Record, RecordState, ResultSet, Table, TableDesign, TableStore, WastedSpace,
    transfer_records,
};
pub use util::ordered_lock::{OrderedMutex, lock_pair};
pub use values::{ColumnType, KeyValue, Value, datetime_from_ticks, datetime_to_ticks};

mod blob;
mod codec;
mod config;
mod db;
mod heap;
mod index;
pub mod paging;
mod structure;
mod table;
pub mod util;
mod values;

/// Which structural check a piece of on-disk data failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, strum::Display)]
pub enum Corruption {
    BadDate,
    BadString,
    BadEndMarker,
    BadSlotHeader,
    BadHeader,
    BadFreeList,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),
    #[error("Table does not exist: {0}")]
    TableDoesNotExist(String),
    #[error("Column {column} already exists in table {table}")]
    ColumnAlreadyExists { table: String, column: String },
    #[error("Column {column} does not exist in table {table}")]
    ColumnDoesNotExist { table: String, column: String },
    #[error("Index {index} does not exist in table {table}")]
    IndexDoesNotExist { table: String, index: String },
    #[error("Index {index} of table {table} is corrupted")]
    IndexIsCorrupted { table: String, index: String },
    #[error("Attempt to read deleted record {id} of table {table}")]
    AttemptReadingDeletedRecord { table: String, id: i32 },
    #[error("Attempt to write to deleted record {id} of table {table}")]
    AttemptWritingToDeletedRecord { table: String, id: i32 },
    #[error("Attempt to commit record {id} of table {table} which is neither new nor updated")]
    AttemptCommitNotNewOrNotUpdatedRecord { table: String, id: i32 },
    #[error("Data corrupted in {file} at offset {offset}: {kind}")]
    DataCorrupted {
        file: String,
        offset: u64,
        kind: Corruption,
    },
    #[error("Database version {found} is newer than engine version {supported}")]
    BackwardIncompatibility { found: u32, supported: u32 },
    #[error("Column {column} of table {table} holds {expected}, not {actual}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        actual: ColumnType,
    },
    #[error("Table {table} has {expected} columns, got a row of {actual}")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },
    #[error("Cannot transfer records of table {0} into itself")]
    TransferIntoSameTable(String),
    #[error("Position {position} is beyond stream length {length}")]
    PositionOutOfRange { position: u64, length: u64 },
    #[error("Schema cannot be changed once the database is open")]
    SchemaLocked,
    #[error("Database is not open")]
    DatabaseNotOpen,
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    #[error("Column type {0} cannot be indexed")]
    NotIndexable(ColumnType),
    #[error("Date/time is outside the representable range")]
    DateOutOfRange,
    #[error("BLOB {0} not found")]
    BlobNotFound(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// True for errors that mean on-disk state is damaged and a forced rebuild should repair
    /// it, as opposed to caller errors or environmental failures.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DbError::DataCorrupted { .. } | DbError::IndexIsCorrupted { .. }
        )
    }
}

/// Progress callback for long running maintenance: `(done, total)`.
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_classification() {
        let e = DbError::DataCorrupted {
            file: "t.dat".into(),
            offset: 32,
            kind: Corruption::BadEndMarker,
        };
        assert!(e.is_corruption());
        assert_eq!(e.to_string(), "Data corrupted in t.dat at offset 32: BadEndMarker");
        assert!(
            DbError::IndexIsCorrupted {
                table: "t".into(),
                index: "i".into()
            }
            .is_corruption()
        );
        assert!(!DbError::SchemaLocked.is_corruption());
        assert!(!DbError::TableDoesNotExist("x".into()).is_corruption());
    }
}
