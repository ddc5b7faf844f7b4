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

use ahash::AHashMap;
use enum_primitive_derive::Primitive;
use parking_lot::Mutex;
use petrel_db::{DbError, Table, TableStore};
use tracing::{debug, warn};

use crate::ResourceError;
use crate::schema::resource_types::{FLAGS, NAME};
use crate::util::bitenum::BitEnum;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Primitive)]
pub enum ResourceTypeFlag {
    Internal = 0,
    NoIndex = 1,
    ResourceContainer = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    pub id: i32,
    pub name: String,
    pub flags: BitEnum<ResourceTypeFlag>,
}

#[derive(Default)]
struct Cache {
    by_name: AHashMap<String, i32>,
    by_id: AHashMap<i32, ResourceType>,
}

impl Cache {
    fn insert(&mut self, resource_type: ResourceType) {
        self.by_name.insert(resource_type.name.clone(), resource_type.id);
        self.by_id.insert(resource_type.id, resource_type);
    }
}

/// Names of resource types, mapped to the small integer ids stored with each resource.
pub struct ResourceTypeRegistry {
    table: Arc<TableStore>,
    cache: Mutex<Cache>,
}

impl ResourceTypeRegistry {
    pub(crate) fn load(table: Arc<TableStore>) -> Result<Self, DbError> {
        let mut cache = Cache::default();
        for record in table.create_result_set(NAME)? {
            let record = record?;
            cache.insert(ResourceType {
                id: record.id(),
                name: record.get_string(NAME)?.to_string(),
                flags: BitEnum::from_column(record.get_int(FLAGS)?),
            });
        }
        debug!(types = cache.by_id.len(), "loaded resource types");
        Ok(Self {
            table,
            cache: Mutex::new(cache),
        })
    }

    /// Register `name`, or merge `flags` into an existing registration. Returns the type id.
    pub fn register(
        &self,
        name: &str,
        flags: BitEnum<ResourceTypeFlag>,
    ) -> Result<i32, ResourceError> {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.by_name.get(name).and_then(|id| cache.by_id.get(id)) {
            let merged = existing.flags | flags;
            if merged == existing.flags {
                return Ok(existing.id);
            }
            let id = existing.id;
            match self.table.get_record(id)? {
                Some(mut record) => {
                    record.set_int(FLAGS, merged.to_column())?;
                    record.commit()?;
                }
                None => warn!(name, id, "resource type record missing; keeping cached flags"),
            }
            if let Some(entry) = cache.by_id.get_mut(&id) {
                entry.flags = merged;
            }
            return Ok(id);
        }

        let mut record = self.table.new_record()?;
        record.set_string(NAME, name)?;
        record.set_int(FLAGS, flags.to_column())?;
        record.commit()?;
        let id = record.id();
        debug!(name, id, "registered resource type");
        cache.insert(ResourceType {
            id,
            name: name.to_string(),
            flags,
        });
        Ok(id)
    }

    pub fn get(&self, id: i32) -> Option<ResourceType> {
        self.cache.lock().by_id.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<ResourceType> {
        let cache = self.cache.lock();
        cache.by_name.get(name).and_then(|id| cache.by_id.get(id)).cloned()
    }

    pub fn id_of(&self, name: &str) -> Result<i32, ResourceError> {
        self.cache
            .lock()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| ResourceError::UnknownResourceType(name.to_string()))
    }

    pub fn all(&self) -> Vec<ResourceType> {
        let mut all: Vec<_> = self.cache.lock().by_id.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }
}
