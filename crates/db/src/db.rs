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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::blob::BlobFileSystem;
use crate::config::DatabaseConfig;
use crate::paging::SharedPageCache;
use crate::structure::{
    DEFRAGMENT_UPGRADE_VERSION, ENGINE_VERSION, StructureFile, StructureImage, TableLayout,
    VersionInfo,
};
use crate::table::{Table, TableDesign, TableStore, valid_name};
use crate::DbError;

/// Heaps smaller than this are never defragmented for wasted space alone.
const MIN_SLOTS_FOR_DEFRAGMENT: u64 = 256;

/// Repair work the database knows it has to do, from least to most thorough.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, strum::Display)]
pub enum PendingMaintenance {
    None,
    /// Rebuild the indexes of every dirty table.
    RebuildIndexes,
    /// Rewrite every table heap (and so every index).
    Defragment,
}

/// Schema-declaration surface of a database. Only usable while the database is closed.
pub trait DatabaseDesign {
    fn create_table(&self, name: &str) -> Result<Arc<dyn TableDesign>, DbError>;
    fn has_table(&self, name: &str) -> bool;
    /// Forget a table and delete its files.
    fn drop_table(&self, name: &str) -> Result<(), DbError>;
    fn save_structure(&self) -> Result<(), DbError>;
    /// Replace the declared schema with the stored one. Returns false if nothing was stored.
    fn load_structure(&self) -> Result<bool, DbError>;
}

/// Runtime surface of a database.
pub trait Database {
    fn table(&self, name: &str) -> Result<Arc<TableStore>, DbError>;
    fn table_names(&self) -> Vec<String>;
    fn open_database(&self) -> Result<(), DbError>;
    fn is_open(&self) -> bool;
    fn flush(&self) -> Result<(), DbError>;
    /// Flush everything, release every file, and record a clean shutdown.
    fn close(&self) -> Result<(), DbError>;
    fn pending_maintenance(&self) -> PendingMaintenance;
    /// Perform scheduled repairs. `progress` receives `(table, done, total)`.
    fn run_maintenance(&self, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<(), DbError>;
    /// Schedule a rebuild of every table after an upper layer found inconsistent data.
    fn mark_corrupted(&self);
    fn blobs(&self) -> Result<Arc<BlobFileSystem>, DbError>;
    fn version_info(&self) -> VersionInfo;
}

struct OpenState {
    cache: SharedPageCache,
    blobs: Arc<BlobFileSystem>,
}

struct DbState {
    open: Option<OpenState>,
    pending: PendingMaintenance,
    /// Version of the data on disk; only raised once pending upgrades are done.
    version: u32,
}

/// A database directory: its tables, BLOBs and structure file.
pub struct StoreDb {
    dir: PathBuf,
    config: DatabaseConfig,
    tables: Mutex<Vec<Arc<TableStore>>>,
    structure: Mutex<StructureFile>,
    state: Mutex<DbState>,
}

impl StoreDb {
    /// Prepare the database held in `dir`, creating the directory if needed. Nothing is read
    /// until `load_structure` or `open_database`.
    pub fn new(dir: &Path, config: DatabaseConfig) -> Result<Self, DbError> {
        std::fs::create_dir_all(dir)?;
        let structure = StructureFile::open(dir, config.structure_cache_bytes)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            tables: Mutex::new(vec![]),
            structure: Mutex::new(structure),
            state: Mutex::new(DbState {
                open: None,
                pending: PendingMaintenance::None,
                version: ENGINE_VERSION,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn schedule(&self, maintenance: PendingMaintenance) {
        let mut state = self.state.lock();
        state.pending = state.pending.max(maintenance);
    }

    fn tables(&self) -> Vec<Arc<TableStore>> {
        self.tables.lock().clone()
    }

    /// The version to stamp into the structure file: the engine's own once nothing is left to
    /// upgrade, otherwise whatever the data still is.
    fn effective_version(&self, state: &DbState) -> u32 {
        match state.pending {
            PendingMaintenance::None => ENGINE_VERSION,
            PendingMaintenance::RebuildIndexes
                if self.tables().iter().all(|t| !Table::is_dirty(t.as_ref())) =>
            {
                ENGINE_VERSION
            }
            _ => state.version,
        }
    }

    fn write_structure(&self) -> Result<(), DbError> {
        let (in_use, version) = {
            let state = self.state.lock();
            (state.open.is_some(), self.effective_version(&state))
        };
        let tables = self
            .tables()
            .iter()
            .map(|t| {
                let inner = t.lock();
                TableLayout {
                    name: inner.name.clone(),
                    next_id: inner.next_id,
                    // While open every table is recorded as dirty, so a crash is noticed.
                    dirty: inner.dirty || in_use,
                    columns: inner.columns.clone(),
                    indexes: inner.indexes.clone(),
                }
            })
            .collect();
        let image = StructureImage {
            info: VersionInfo {
                version,
                build_tag: self.config.build_tag.clone(),
            },
            tables,
        };
        self.structure.lock().save(&image)?;
        debug!(version, in_use, "saved structure");
        Ok(())
    }

    fn run_pending(&self, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<(), DbError> {
        let pending = self.state.lock().pending;
        let tables = self.tables();
        match pending {
            PendingMaintenance::None => {}
            PendingMaintenance::RebuildIndexes => {
                for table in &tables {
                    let name = table.name().to_string();
                    table.rebuild_indexes(false, &mut |done, total| progress(&name, done, total))?;
                }
            }
            PendingMaintenance::Defragment => {
                for table in &tables {
                    let name = table.name().to_string();
                    table.defragment(&mut |done, total| progress(&name, done, total))?;
                }
            }
        }
        for table in &tables {
            let wasted = table.compute_wasted_space()?;
            if wasted.total >= MIN_SLOTS_FOR_DEFRAGMENT
                && wasted.ratio() > self.config.defragment_wasted_ratio
            {
                info!(table = table.name(), ratio = wasted.ratio(), "defragmenting wasted space");
                let name = table.name().to_string();
                table.defragment(&mut |done, total| progress(&name, done, total))?;
            }
        }
        let mut state = self.state.lock();
        state.pending = PendingMaintenance::None;
        state.version = ENGINE_VERSION;
        Ok(())
    }
}

impl DatabaseDesign for StoreDb {
    fn create_table(&self, name: &str) -> Result<Arc<dyn TableDesign>, DbError> {
        if self.is_open() {
            return Err(DbError::SchemaLocked);
        }
        if !valid_name(name) {
            return Err(DbError::InvalidName(name.to_string()));
        }
        let mut tables = self.tables.lock();
        if tables.iter().any(|t| t.name() == name) {
            return Err(DbError::TableAlreadyExists(name.to_string()));
        }
        let table = TableStore::new(name);
        tables.push(table.clone());
        Ok(table)
    }

    fn has_table(&self, name: &str) -> bool {
        self.tables.lock().iter().any(|t| t.name() == name)
    }

    fn drop_table(&self, name: &str) -> Result<(), DbError> {
        if self.is_open() {
            return Err(DbError::SchemaLocked);
        }
        let table = {
            let mut tables = self.tables.lock();
            let position = tables
                .iter()
                .position(|t| t.name() == name)
                .ok_or_else(|| DbError::TableDoesNotExist(name.to_string()))?;
            tables.remove(position)
        };
        table.remove_files(&self.dir)?;
        info!(table = name, "dropped table");
        Ok(())
    }

    fn save_structure(&self) -> Result<(), DbError> {
        self.write_structure()
    }

    fn load_structure(&self) -> Result<bool, DbError> {
        if self.is_open() {
            return Err(DbError::SchemaLocked);
        }
        let Some(image) = self.structure.lock().load()? else {
            return Ok(false);
        };
        let stored = image.info.version;
        let tables: Vec<Arc<TableStore>> = image
            .tables
            .into_iter()
            .map(|t| {
                let dirty = t.dirty || stored < ENGINE_VERSION;
                TableStore::with_layout(&t.name, t.columns, t.indexes, t.next_id, dirty)
            })
            .collect();
        let any_dirty = tables.iter().any(|t| Table::is_dirty(t.as_ref()));
        *self.tables.lock() = tables;

        let mut state = self.state.lock();
        state.version = stored;
        state.pending = if stored == DEFRAGMENT_UPGRADE_VERSION {
            info!(stored, engine = ENGINE_VERSION, "database will be upgraded by defragmenting");
            PendingMaintenance::Defragment
        } else if stored < ENGINE_VERSION {
            info!(stored, engine = ENGINE_VERSION, "database indexes will be rebuilt for upgrade");
            PendingMaintenance::RebuildIndexes
        } else if any_dirty {
            warn!("database was not shut down cleanly; dirty tables will be rebuilt");
            PendingMaintenance::RebuildIndexes
        } else {
            PendingMaintenance::None
        };
        Ok(true)
    }
}

impl Database for StoreDb {
    fn table(&self, name: &str) -> Result<Arc<TableStore>, DbError> {
        self.tables
            .lock()
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| DbError::TableDoesNotExist(name.to_string()))
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.lock().iter().map(|t| t.name().to_string()).collect()
    }

    fn open_database(&self) -> Result<(), DbError> {
        if self.is_open() {
            return Ok(());
        }
        let cache = SharedPageCache::new(self.config.cache_size_bytes);
        let blobs = Arc::new(BlobFileSystem::open(&self.dir, &cache)?);
        let tables = self.tables();
        for (i, table) in tables.iter().enumerate() {
            match table.open(&self.dir, &cache, blobs.clone()) {
                Ok(()) => {}
                Err(e @ DbError::IndexIsCorrupted { .. }) => {
                    warn!(table = table.name(), "{e}; table will be rebuilt");
                    self.schedule(PendingMaintenance::RebuildIndexes);
                }
                Err(e) => {
                    error!(table = table.name(), "unable to open table: {e}");
                    for opened in &tables[..i] {
                        if let Err(e) = opened.close() {
                            warn!(table = opened.name(), "error closing table after failed open: {e}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        self.state.lock().open = Some(OpenState { cache, blobs });
        self.write_structure()?;
        info!(dir = ?self.dir, tables = tables.len(), "opened database");

        if self.config.repair_on_open && self.pending_maintenance() != PendingMaintenance::None {
            self.run_maintenance(&mut |table, done, total| {
                debug!(table, done, total, "maintenance progress");
            })?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open.is_some()
    }

    fn flush(&self) -> Result<(), DbError> {
        let blobs = self.blobs()?;
        for table in self.tables() {
            Table::flush(table.as_ref())?;
        }
        blobs.flush()?;
        self.write_structure()
    }

    fn close(&self) -> Result<(), DbError> {
        let Some(open) = self.state.lock().open.take() else {
            return Ok(());
        };
        let mut first_error = None;
        for table in self.tables() {
            if let Err(e) = table.close() {
                error!(table = table.name(), "error closing table: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = open.blobs.flush() {
            first_error.get_or_insert(e);
        }
        drop(open);
        self.write_structure()?;
        info!(dir = ?self.dir, "closed database");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn pending_maintenance(&self) -> PendingMaintenance {
        self.state.lock().pending
    }

    fn run_maintenance(&self, progress: &mut dyn FnMut(&str, u64, u64)) -> Result<(), DbError> {
        if !self.is_open() {
            return Err(DbError::DatabaseNotOpen);
        }
        let pending = self.pending_maintenance();
        info!(%pending, "running maintenance");
        self.run_pending(progress)?;
        self.write_structure()
    }

    fn mark_corrupted(&self) {
        warn!("database marked corrupted; all indexes will be rebuilt");
        for table in self.tables() {
            table.mark_dirty();
        }
        self.schedule(PendingMaintenance::RebuildIndexes);
    }

    fn blobs(&self) -> Result<Arc<BlobFileSystem>, DbError> {
        self.state
            .lock()
            .open
            .as_ref()
            .map(|o| o.blobs.clone())
            .ok_or(DbError::DatabaseNotOpen)
    }

    fn version_info(&self) -> VersionInfo {
        VersionInfo {
            version: self.state.lock().version,
            build_tag: self.config.build_tag.clone(),
        }
    }
}

impl Drop for StoreDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(dir = ?self.dir, "error closing database on drop: {e}");
        }
    }
}

impl std::fmt::Debug for StoreDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDb")
            .field("dir", &self.dir)
            .field("tables", &self.table_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{ColumnType, KeyValue};
    use tracing_test::traced_test;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            cache_size_bytes: 1 << 20,
            ..Default::default()
        }
    }

    fn declare(db: &StoreDb) {
        let notes = db.create_table("Notes").unwrap();
        notes.create_column("Title", ColumnType::String).unwrap();
        notes.create_column("Rank", ColumnType::Int).unwrap();
        notes.create_index("Title").unwrap();
    }

    #[test]
    fn design_is_refused_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let db = StoreDb::new(dir.path(), config()).unwrap();
        declare(&db);
        assert!(matches!(
            db.create_table("Notes"),
            Err(DbError::TableAlreadyExists(_))
        ));
        db.open_database().unwrap();
        assert!(matches!(db.create_table("Other"), Err(DbError::SchemaLocked)));
        assert!(matches!(db.drop_table("Notes"), Err(DbError::SchemaLocked)));
        assert!(matches!(db.table("Nope"), Err(DbError::TableDoesNotExist(_))));
    }

    #[test]
    #[traced_test]
    fn unclean_shutdown_schedules_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = StoreDb::new(dir.path(), config()).unwrap();
            declare(&db);
            db.open_database().unwrap();
            let notes = db.table("Notes").unwrap();
            let mut record = notes.new_record().unwrap();
            record.set_string(0, "kept").unwrap();
            record.commit().unwrap();
            db.flush().unwrap();
            // Simulate a crash: skip close, and stop Drop from recording a clean shutdown.
            std::mem::forget(db);
        }

        let db = StoreDb::new(dir.path(), DatabaseConfig {
            repair_on_open: false,
            ..config()
        })
        .unwrap();
        assert!(db.load_structure().unwrap());
        assert_eq!(db.pending_maintenance(), PendingMaintenance::RebuildIndexes);
        db.open_database().unwrap();
        db.run_maintenance(&mut |_, _, _| {}).unwrap();
        assert_eq!(db.pending_maintenance(), PendingMaintenance::None);
        let notes = db.table("Notes").unwrap();
        assert!(!Table::is_dirty(notes.as_ref()));
        assert!(notes.get_record_by_equal(0, KeyValue::from("kept")).unwrap().is_some());
        assert!(logs_contain("not shut down cleanly"));
    }

    #[test]
    fn mark_corrupted_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let db = StoreDb::new(dir.path(), config()).unwrap();
        declare(&db);
        db.open_database().unwrap();
        db.mark_corrupted();
        assert_eq!(db.pending_maintenance(), PendingMaintenance::RebuildIndexes);
        db.run_maintenance(&mut |_, _, _| {}).unwrap();
        assert!(!Table::is_dirty(db.table("Notes").unwrap().as_ref()));
    }
}
