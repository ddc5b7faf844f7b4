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

//! The property-type registry.
//!
//! Every property type is a row of `PropTypes` (its id is the row id) plus a resource of the
//! internal `PropType` resource type standing for it. The registry caches all of them.

use std::sync::Arc;

use ahash::AHashMap;
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use petrel_db::{
    Database, DbError, KeyValue, Record, StoreDb, Table, Value, transfer_records,
};
use tracing::{debug, info, warn};

use crate::ResourceError;
use crate::prop_types::{PropDataType, PropType, PropTypeFlag};
use crate::schema::{self, Tables, link_restrictions, links, prop_types as cols, resources, values};
use crate::util::bitenum::BitEnum;

#[derive(Default)]
struct Cache {
    by_name: AHashMap<String, i32>,
    by_id: AHashMap<i32, PropType>,
}

impl Cache {
    fn insert(&mut self, prop: PropType) {
        self.by_name.insert(prop.name.clone(), prop.id);
        self.by_id.insert(prop.id, prop);
    }

    fn by_name(&self, name: &str) -> Option<&PropType> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }
}

fn optional(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn prop_from_record(record: &Record) -> Result<Option<PropType>, DbError> {
    let raw_type = record.get_int(cols::DATA_TYPE)?;
    let Some(data_type) = PropDataType::from_i32(raw_type) else {
        return Ok(None);
    };
    Ok(Some(PropType {
        id: record.id(),
        name: record.get_string(cols::NAME)?.to_string(),
        data_type,
        flags: BitEnum::from_column(record.get_int(cols::FLAGS)?),
        owner: record.get_string(cols::OWNER)?.to_string(),
        display_name: optional(record.get_string(cols::DISPLAY_NAME)?),
        reverse_display_name: optional(record.get_string(cols::REVERSE_DISPLAY_NAME)?),
        resource: record.get_int(cols::RESOURCE)?,
    }))
}

pub struct PropTypeRegistry {
    db: Arc<StoreDb>,
    tables: Arc<Tables>,
    /// Resource type of the resources standing for property types.
    backing_type: i32,
    cache: Mutex<Cache>,
}

impl PropTypeRegistry {
    pub(crate) fn load(
        db: Arc<StoreDb>,
        tables: Arc<Tables>,
        backing_type: i32,
    ) -> Result<Self, DbError> {
        let mut cache = Cache::default();
        for record in tables.prop_types.create_result_set(cols::NAME)? {
            let record = record?;
            match prop_from_record(&record)? {
                Some(prop) => cache.insert(prop),
                None => {
                    warn!(id = record.id(), "property type with unknown data type; scheduling rebuild");
                    db.mark_corrupted();
                }
            }
        }
        debug!(props = cache.by_id.len(), "loaded property types");
        Ok(Self {
            db,
            tables,
            backing_type,
            cache: Mutex::new(cache),
        })
    }

    /// Apply `update` to the describing record of `id`. A missing record means the tables and
    /// the cache disagree; that is logged and scheduled for repair instead of failing.
    fn update_record(
        &self,
        id: i32,
        update: impl FnOnce(&mut Record) -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        match self.tables.prop_types.get_record(id)? {
            Some(mut record) => {
                update(&mut record)?;
                record.commit()
            }
            None => {
                warn!(id, "property type record missing; scheduling index rebuild");
                self.db.mark_corrupted();
                Ok(())
            }
        }
    }

    /// Register a property type, or confirm an existing registration. Re-registering merges
    /// `flags` into the stored ones; the data type must not change.
    pub fn register(
        &self,
        name: &str,
        data_type: PropDataType,
        flags: BitEnum<PropTypeFlag>,
        owner: &str,
    ) -> Result<i32, ResourceError> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.by_name(name) {
            if existing.data_type != data_type {
                return Err(ResourceError::PropTypeMismatch {
                    name: name.to_string(),
                    registered: existing.data_type,
                    requested: data_type,
                });
            }
            let id = existing.id;
            let merged = existing.flags | flags;
            if merged != existing.flags {
                self.update_record(id, |r| r.set_int(cols::FLAGS, merged.to_column()))?;
                if let Some(entry) = cache.by_id.get_mut(&id) {
                    entry.flags = merged;
                }
                debug!(name, id, "merged property type flags");
            }
            return Ok(id);
        }

        let mut backing = self.tables.resources.new_record()?;
        backing.set_int(resources::TYPE, self.backing_type)?;
        backing.commit()?;

        let mut record = self.tables.prop_types.new_record()?;
        record.set_string(cols::NAME, name)?;
        record.set_int(cols::DATA_TYPE, data_type as i32)?;
        record.set_int(cols::FLAGS, flags.to_column())?;
        record.set_string(cols::OWNER, owner)?;
        record.set_int(cols::RESOURCE, backing.id())?;
        record.commit()?;
        let prop = PropType {
            id: record.id(),
            name: name.to_string(),
            data_type,
            flags,
            owner: owner.to_string(),
            display_name: None,
            reverse_display_name: None,
            resource: backing.id(),
        };
        info!(name, id = prop.id, %data_type, "registered property type");
        let id = prop.id;
        cache.insert(prop);
        Ok(id)
    }

    fn has_values(&self, id: i32, data_type: PropDataType) -> Result<bool, DbError> {
        let key = [KeyValue::Int(id)];
        let rows = match self.tables.for_values(data_type) {
            Some(table) => table.create_compound_result_set(&[values::PROP_TYPE], &key)?,
            None => self.tables.links.create_result_set_eq(links::PROP_TYPE, KeyValue::Int(id))?,
        };
        Ok(!rows.is_empty())
    }

    /// Register `name` with `data_type` even if it is already registered with another type.
    /// Only migrations that keep stored values meaningful are accepted: `Int` and `Bool`
    /// convert freely, `String` values become one-element string lists, and any other change
    /// is allowed only while no values of the type are stored.
    pub fn register_forced(
        &self,
        name: &str,
        data_type: PropDataType,
        flags: BitEnum<PropTypeFlag>,
        owner: &str,
    ) -> Result<i32, ResourceError> {
        let existing = self.cache.lock().by_name(name).cloned();
        let Some(existing) = existing.filter(|e| e.data_type != data_type) else {
            return self.register(name, data_type, flags, owner);
        };
        let id = existing.id;
        let from = existing.data_type;
        match (from, data_type) {
            (PropDataType::Int, PropDataType::Bool) | (PropDataType::Bool, PropDataType::Int) => {}
            (PropDataType::String, PropDataType::StringList) => {
                let moved = transfer_records(
                    &self.tables.string_props,
                    &self.tables.string_list_props,
                    |_, row| {
                        (row[values::PROP_TYPE] == Value::Int(id)).then(|| {
                            vec![
                                row[values::RESOURCE].clone(),
                                row[values::PROP_TYPE].clone(),
                                Value::Int(0),
                                row[values::VALUE].clone(),
                            ]
                        })
                    },
                )?;
                info!(name, moved, "moved string values into string lists");
            }
            _ if !self.has_values(id, from)? => {}
            _ => {
                return Err(ResourceError::ForcedTypeNotAllowed {
                    name: name.to_string(),
                    from,
                    to: data_type,
                });
            }
        }

        let merged = existing.flags | flags;
        self.update_record(id, |r| {
            r.set_int(cols::DATA_TYPE, data_type as i32)?;
            r.set_int(cols::FLAGS, merged.to_column())
        })?;
        if let Some(entry) = self.cache.lock().by_id.get_mut(&id) {
            entry.data_type = data_type;
            entry.flags = merged;
        }
        warn!(name, id, %from, to = %data_type, "forced property type change");
        Ok(id)
    }

    /// Set display names. Directed links need both directions, anything else exactly one.
    pub fn set_display_names(
        &self,
        name: &str,
        display_name: &str,
        reverse_display_name: Option<&str>,
    ) -> Result<(), ResourceError> {
        let mut cache = self.cache.lock();
        let prop = cache
            .by_name(name)
            .ok_or_else(|| ResourceError::UnknownPropType(name.to_string()))?;
        let id = prop.id;
        match (prop.is_directed_link(), reverse_display_name.is_some()) {
            (true, false) => {
                return Err(ResourceError::DisplayNameMismatch {
                    name: name.to_string(),
                    expected: 2,
                });
            }
            (false, true) => {
                return Err(ResourceError::DisplayNameMismatch {
                    name: name.to_string(),
                    expected: 1,
                });
            }
            _ => {}
        }
        self.update_record(id, |r| {
            r.set_string(cols::DISPLAY_NAME, display_name)?;
            r.set_string(cols::REVERSE_DISPLAY_NAME, reverse_display_name.unwrap_or_default())
        })?;
        if let Some(entry) = cache.by_id.get_mut(&id) {
            entry.display_name = Some(display_name.to_string());
            entry.reverse_display_name = reverse_display_name.map(str::to_string);
        }
        Ok(())
    }

    /// Delete a property type with every value and link of it, its link restrictions, the
    /// resource standing for it, and finally its describing record.
    pub fn delete(&self, id: i32) -> Result<(), ResourceError> {
        let id = id.abs();
        let prop = self
            .get(id)
            .ok_or_else(|| ResourceError::UnknownPropType(id.to_string()))?;
        let key = [KeyValue::Int(id)];

        let removed = match self.tables.for_values(prop.data_type) {
            Some(table) => schema::delete_matching(table, &[values::PROP_TYPE], &key)?,
            None => schema::delete_matching(&self.tables.links, &[links::PROP_TYPE], &key)?,
        };
        schema::delete_matching(
            &self.tables.link_restrictions,
            &[link_restrictions::PROP_TYPE],
            &key,
        )?;
        delete_resource_rows(&self.tables, prop.resource)?;
        match self.tables.prop_types.get_record(id)? {
            Some(mut record) => record.delete()?,
            None => {
                warn!(id, name = prop.name, "property type record already gone; scheduling rebuild");
                self.db.mark_corrupted();
            }
        }

        let mut cache = self.cache.lock();
        cache.by_name.remove(&prop.name);
        cache.by_id.remove(&id);
        info!(id, name = prop.name, removed, "deleted property type");
        Ok(())
    }

    /// Look up a property type by either direction of its id.
    pub fn get(&self, id: i32) -> Option<PropType> {
        self.cache.lock().by_id.get(&id.abs()).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<PropType> {
        self.cache.lock().by_name(name).cloned()
    }

    pub fn id_of(&self, name: &str) -> Result<i32, ResourceError> {
        self.cache
            .lock()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| ResourceError::UnknownPropType(name.to_string()))
    }

    pub fn all(&self) -> Vec<PropType> {
        let mut all: Vec<_> = self.cache.lock().by_id.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        all
    }
}

/// Remove a resource row together with all of its property values and links.
pub(crate) fn delete_resource_rows(tables: &Tables, resource: i32) -> Result<(), DbError> {
    let key = [KeyValue::Int(resource)];
    for table in tables.value_tables() {
        schema::delete_matching(table, &[values::RESOURCE], &key)?;
    }
    schema::delete_matching(&tables.links, &[links::FROM], &key)?;
    schema::delete_matching(&tables.links, &[links::TO], &key)?;
    if let Some(mut record) = tables.resources.get_record(resource)? {
        record.delete()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_db::{DatabaseConfig, DatabaseDesign, PendingMaintenance};
    use tracing_test::traced_test;

    fn open(dir: &std::path::Path) -> (Arc<StoreDb>, Arc<Tables>) {
        let db = Arc::new(StoreDb::new(dir, DatabaseConfig::default()).unwrap());
        schema::declare(db.as_ref()).unwrap();
        db.save_structure().unwrap();
        db.open_database().unwrap();
        let tables = Arc::new(Tables::open(db.as_ref()).unwrap());
        (db, tables)
    }

    #[test]
    #[traced_test]
    fn missing_record_schedules_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let (db, tables) = open(dir.path());
        let registry = PropTypeRegistry::load(db.clone(), tables.clone(), 1).unwrap();
        let id = registry
            .register("Subject", PropDataType::String, BitEnum::new(), "mail")
            .unwrap();
        tables.prop_types.get_record(id).unwrap().unwrap().delete().unwrap();

        let again = registry
            .register("Subject", PropDataType::String, PropTypeFlag::Internal.into(), "mail")
            .unwrap();
        assert_eq!(again, id);
        assert!(registry.get(id).unwrap().flags.contains(PropTypeFlag::Internal));
        assert_eq!(db.pending_maintenance(), PendingMaintenance::RebuildIndexes);
        assert!(logs_contain("property type record missing"));
    }

    #[test]
    fn cache_reloads_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let (db, tables) = open(dir.path());
        let registry = PropTypeRegistry::load(db.clone(), tables.clone(), 1).unwrap();
        let flags = BitEnum::new_with(PropTypeFlag::DirectedLink);
        let id = registry.register("Reply", PropDataType::Link, flags, "mail").unwrap();
        registry.set_display_names("Reply", "Reply to", Some("Replies")).unwrap();

        let reloaded = PropTypeRegistry::load(db, tables, 1).unwrap();
        let prop = reloaded.get(-id).unwrap();
        assert_eq!(prop.name, "Reply");
        assert!(prop.is_directed_link());
        assert_eq!(prop.display_name_for(-id), "Replies");
        assert_eq!(reloaded.all().len(), 1);
    }
}
