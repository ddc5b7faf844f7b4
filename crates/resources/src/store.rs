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

use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use petrel_db::{
    ColumnType, Database, DatabaseConfig, DatabaseDesign, DbError, KeyValue, Record, StoreDb,
    Table, TableStore, datetime_to_ticks,
};
use tracing::{debug, info};

use crate::change_set::PropChangeSet;
use crate::live_list::LiveResourceList;
use crate::notifier::{ResourceEvent, Subscription, UpdateListener, UpdateNotifier};
use crate::predicate::{ResourceListPredicate, ResourceSource};
use crate::prop_types::{PropDataType, PropType, PropValue};
use crate::registry::{PropTypeRegistry, delete_resource_rows};
use crate::resource_types::{ResourceTypeFlag, ResourceTypeRegistry};
use crate::schema::{self, Tables, link_restrictions as lr, links, resources, string_lists, values};
use crate::ResourceError;

/// Resource type of the resources standing for property types.
pub const PROP_TYPE_RESOURCE: &str = "PropType";

/// Bounds on how many links of one type a resource of one type may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRestriction {
    pub resource_type: i32,
    pub prop: i32,
    pub min_count: i32,
    pub max_count: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictionViolation {
    pub resource: i32,
    pub restriction: LinkRestriction,
    pub count: usize,
}

fn restriction_from_record(record: &Record) -> Result<LinkRestriction, DbError> {
    let max = record.get_int(lr::MAX_COUNT)?;
    Ok(LinkRestriction {
        resource_type: record.get_int(lr::RESOURCE_TYPE)?,
        prop: record.get_int(lr::PROP_TYPE)?,
        min_count: record.get_int(lr::MIN_COUNT)?,
        max_count: (max >= 0).then_some(max),
    })
}

/// A link row for `prop` as seen from `resource`: negative ids run from `other` to `resource`.
fn link_row(resource: i32, prop: i32, other: i32) -> (i32, i32, i32) {
    if prop < 0 {
        (other, resource, -prop)
    } else {
        (resource, other, prop)
    }
}

/// The resource database: typed properties and links on resources, with change notification.
pub struct ResourceStore {
    db: Arc<StoreDb>,
    tables: Arc<Tables>,
    resource_types: ResourceTypeRegistry,
    prop_types: PropTypeRegistry,
    notifier: Arc<UpdateNotifier>,
}

impl ResourceStore {
    /// Open the resource database in `dir`, creating it if it does not exist yet.
    pub fn open(dir: &Path, config: DatabaseConfig) -> Result<Arc<Self>, ResourceError> {
        let db = Arc::new(StoreDb::new(dir, config)?);
        if !db.load_structure()? {
            schema::declare(db.as_ref())?;
            db.save_structure()?;
            info!(?dir, "created resource database");
        }
        db.open_database()?;
        let tables = Arc::new(Tables::open(db.as_ref())?);
        let resource_types = ResourceTypeRegistry::load(tables.resource_types.clone())?;
        let backing_type =
            resource_types.register(PROP_TYPE_RESOURCE, ResourceTypeFlag::Internal.into())?;
        let prop_types = PropTypeRegistry::load(db.clone(), tables.clone(), backing_type)?;
        Ok(Arc::new(Self {
            db,
            tables,
            resource_types,
            prop_types,
            notifier: UpdateNotifier::new(),
        }))
    }

    pub fn db(&self) -> &Arc<StoreDb> {
        &self.db
    }

    pub fn resource_types(&self) -> &ResourceTypeRegistry {
        &self.resource_types
    }

    pub fn prop_types(&self) -> &PropTypeRegistry {
        &self.prop_types
    }

    pub fn notifier(&self) -> &Arc<UpdateNotifier> {
        &self.notifier
    }

    fn prop(&self, id: i32) -> Result<PropType, ResourceError> {
        self.prop_types
            .get(id)
            .ok_or_else(|| ResourceError::UnknownPropType(id.to_string()))
    }

    fn prop_named(&self, name: &str) -> Result<PropType, ResourceError> {
        self.prop_types
            .by_name(name)
            .ok_or_else(|| ResourceError::UnknownPropType(name.to_string()))
    }

    fn value_table(&self, prop: &PropType) -> Result<&Arc<TableStore>, ResourceError> {
        self.tables
            .for_values(prop.data_type)
            .ok_or_else(|| ResourceError::WrongValueType {
                prop: prop.name.clone(),
                expected: prop.data_type,
                actual: PropDataType::Link,
            })
    }

    /// Start a new resource of the named type. Nothing is stored until `commit`.
    pub fn create_resource(&self, resource_type: &str) -> Result<ResourceEditor<'_>, ResourceError> {
        let resource_type = self.resource_types.id_of(resource_type)?;
        Ok(ResourceEditor {
            store: self,
            resource: None,
            resource_type,
            ops: vec![],
        })
    }

    pub fn edit(&self, resource: i32) -> Result<ResourceEditor<'_>, ResourceError> {
        let resource_type = self
            .resource_type(resource)?
            .ok_or(ResourceError::ResourceDeleted(resource))?;
        Ok(ResourceEditor {
            store: self,
            resource: Some(resource),
            resource_type,
            ops: vec![],
        })
    }

    /// Delete a resource with its properties and links. Listeners hear about it first; link
    /// partners are then notified that the link went away.
    pub fn delete_resource(&self, resource: i32) -> Result<(), ResourceError> {
        let resource_type = self
            .resource_type(resource)?
            .ok_or(ResourceError::ResourceDeleted(resource))?;
        self.notifier.notify_deleting(resource, resource_type)?;

        let mut partners: AHashMap<i32, PropChangeSet> = AHashMap::new();
        let key = [KeyValue::Int(resource)];
        for record in schema::records_matching(&self.tables.links, &[links::FROM], &key)? {
            let prop = record.get_int(links::PROP_TYPE)?;
            let to = record.get_int(links::TO)?;
            partners
                .entry(to)
                .or_default()
                .record_link_removed(self.reverse_link(prop), resource);
        }
        for record in schema::records_matching(&self.tables.links, &[links::TO], &key)? {
            let prop = record.get_int(links::PROP_TYPE)?;
            let from = record.get_int(links::FROM)?;
            partners.entry(from).or_default().record_link_removed(prop, resource);
        }
        partners.remove(&resource);

        delete_resource_rows(&self.tables, resource)?;
        debug!(resource, resource_type, partners = partners.len(), "deleted resource");
        self.notify_partners(partners)
    }

    fn notify_partners(&self, partners: AHashMap<i32, PropChangeSet>) -> Result<(), ResourceError> {
        let mut partners: Vec<_> = partners.into_iter().collect();
        partners.sort_by_key(|(id, _)| *id);
        for (partner, changes) in partners {
            let Some(resource_type) = self.resource_type(partner)? else {
                continue;
            };
            self.notifier.notify_saved(&ResourceEvent {
                resource: partner,
                resource_type,
                changes: &changes,
            })?;
        }
        Ok(())
    }

    fn value_rows(&self, resource: i32, prop: &PropType) -> Result<Vec<Record>, ResourceError> {
        let table = self.value_table(prop)?;
        Ok(schema::records_matching(
            table,
            &[values::RESOURCE, values::PROP_TYPE],
            &[KeyValue::Int(resource), KeyValue::Int(prop.id)],
        )?)
    }

    fn read_value(&self, resource: i32, prop: &PropType) -> Result<Option<PropValue>, ResourceError> {
        if prop.is_link() {
            return Ok(None);
        }
        let rows = self.value_rows(resource, prop)?;
        if prop.data_type == PropDataType::StringList {
            let list = rows
                .iter()
                .map(|r| r.get_string(string_lists::VALUE).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok((!list.is_empty()).then_some(PropValue::StringList(list)));
        }
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let v = values::VALUE;
        Ok(Some(match prop.data_type {
            PropDataType::Int => PropValue::Int(row.get_int(v)?),
            PropDataType::Bool => PropValue::Bool(row.get_int(v)? != 0),
            PropDataType::String => PropValue::String(row.get_string(v)?.to_string()),
            PropDataType::DateTime => PropValue::DateTime(row.get_date(v)?),
            PropDataType::Double => PropValue::Double(row.get_double(v)?),
            PropDataType::Blob => PropValue::Blob(row.get_blob(v)?),
            PropDataType::StringList | PropDataType::Link => return Ok(None),
        }))
    }

    fn write_value(&self, resource: i32, prop: &PropType, value: &PropValue) -> Result<(), ResourceError> {
        let table = self.value_table(prop)?;
        if let PropValue::StringList(list) = value {
            self.remove_value(resource, prop)?;
            for (order, item) in list.iter().enumerate() {
                let mut row = table.new_record()?;
                row.set_int(values::RESOURCE, resource)?;
                row.set_int(values::PROP_TYPE, prop.id)?;
                row.set_int(string_lists::ORDER, order as i32)?;
                row.set_string(string_lists::VALUE, item)?;
                row.commit()?;
            }
            return Ok(());
        }

        let mut row = match self.value_rows(resource, prop)?.into_iter().next() {
            Some(row) => row,
            None => {
                let mut row = table.new_record()?;
                row.set_int(values::RESOURCE, resource)?;
                row.set_int(values::PROP_TYPE, prop.id)?;
                row
            }
        };
        let v = values::VALUE;
        match value {
            PropValue::Int(i) => row.set_int(v, *i)?,
            PropValue::Bool(b) => row.set_int(v, i32::from(*b))?,
            PropValue::String(s) => row.set_string(v, s)?,
            PropValue::DateTime(dt) => row.set_date(v, *dt)?,
            PropValue::Double(d) => row.set_double(v, *d)?,
            PropValue::Blob(bytes) => row.set_blob(v, bytes)?,
            PropValue::StringList(_) => {}
        }
        row.commit()?;
        Ok(())
    }

    fn remove_value(&self, resource: i32, prop: &PropType) -> Result<(), ResourceError> {
        for mut row in self.value_rows(resource, prop)? {
            row.delete()?;
        }
        Ok(())
    }

    fn link_exists(&self, resource: i32, prop: i32, other: i32) -> Result<bool, ResourceError> {
        Ok(self.links(resource, prop)?.contains(&other))
    }

    pub fn get_prop(&self, resource: i32, name: &str) -> Result<Option<PropValue>, ResourceError> {
        let prop = self.prop_named(name)?;
        self.read_value(resource, &prop)
    }

    /// Resources `resource` links to through the named link type.
    pub fn get_links(&self, resource: i32, name: &str) -> Result<Vec<i32>, ResourceError> {
        let prop = self.prop_named(name)?;
        if !prop.is_link() {
            return Err(ResourceError::NotALink(name.to_string()));
        }
        self.links(resource, prop.id)
    }

    /// Resources linking to `resource` through the named directed link type.
    pub fn get_back_links(&self, resource: i32, name: &str) -> Result<Vec<i32>, ResourceError> {
        let prop = self.prop_named(name)?;
        if !prop.is_link() {
            return Err(ResourceError::NotALink(name.to_string()));
        }
        self.links(resource, self.reverse_link(prop.id))
    }

    pub fn count_resources(&self) -> Result<usize, ResourceError> {
        Ok(self.tables.resources.count()?)
    }

    /// Restrict how many `prop` links resources of `resource_type` may have.
    pub fn set_link_restriction(
        &self,
        resource_type: &str,
        prop: &str,
        min_count: i32,
        max_count: Option<i32>,
    ) -> Result<(), ResourceError> {
        let resource_type = self.resource_types.id_of(resource_type)?;
        let prop_type = self.prop_named(prop)?;
        if !prop_type.is_link() {
            return Err(ResourceError::NotALink(prop.to_string()));
        }
        let existing = schema::records_matching(
            &self.tables.link_restrictions,
            &[lr::RESOURCE_TYPE, lr::PROP_TYPE],
            &[KeyValue::Int(resource_type), KeyValue::Int(prop_type.id)],
        )?;
        let mut record = match existing.into_iter().next() {
            Some(record) => record,
            None => {
                let mut record = self.tables.link_restrictions.new_record()?;
                record.set_int(lr::RESOURCE_TYPE, resource_type)?;
                record.set_int(lr::PROP_TYPE, prop_type.id)?;
                record
            }
        };
        record.set_int(lr::MIN_COUNT, min_count)?;
        record.set_int(lr::MAX_COUNT, max_count.unwrap_or(-1))?;
        record.commit()?;
        Ok(())
    }

    pub fn delete_link_restriction(&self, resource_type: &str, prop: &str) -> Result<(), ResourceError> {
        let resource_type = self.resource_types.id_of(resource_type)?;
        let prop = self.prop_named(prop)?;
        schema::delete_matching(
            &self.tables.link_restrictions,
            &[lr::RESOURCE_TYPE, lr::PROP_TYPE],
            &[KeyValue::Int(resource_type), KeyValue::Int(prop.id)],
        )?;
        Ok(())
    }

    pub fn link_restrictions(&self, resource_type: i32) -> Result<Vec<LinkRestriction>, ResourceError> {
        schema::records_matching(
            &self.tables.link_restrictions,
            &[lr::RESOURCE_TYPE],
            &[KeyValue::Int(resource_type)],
        )?
        .iter()
        .map(|r| restriction_from_record(r).map_err(ResourceError::from))
        .collect()
    }

    /// Link restrictions of the resource's type that its current links break.
    pub fn check_link_restrictions(&self, resource: i32) -> Result<Vec<RestrictionViolation>, ResourceError> {
        let resource_type = self
            .resource_type(resource)?
            .ok_or(ResourceError::ResourceDeleted(resource))?;
        let mut violations = vec![];
        for restriction in self.link_restrictions(resource_type)? {
            let count = self.links(resource, restriction.prop)?.len();
            let too_few = (count as i64) < i64::from(restriction.min_count);
            let too_many = restriction.max_count.is_some_and(|max| count as i64 > i64::from(max));
            if too_few || too_many {
                violations.push(RestrictionViolation {
                    resource,
                    restriction,
                    count,
                });
            }
        }
        Ok(violations)
    }

    /// Register a listener for save/delete notifications, optionally for one resource type.
    pub fn subscribe(
        &self,
        listener: Arc<dyn UpdateListener>,
        known_type: Option<i32>,
        priority: bool,
    ) -> Subscription {
        self.notifier.subscribe(listener, known_type, priority)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(token = ?subscription.token(), "unsubscribing");
        subscription.cancel();
    }

    /// A list of the resources matching `predicate`, kept current as resources change.
    pub fn live_list(
        self: &Arc<Self>,
        predicate: ResourceListPredicate,
    ) -> Result<LiveResourceList, ResourceError> {
        LiveResourceList::new(self, &self.notifier, predicate)
    }

    pub fn flush(&self) -> Result<(), ResourceError> {
        Ok(self.db.flush()?)
    }

    pub fn close(&self) -> Result<(), ResourceError> {
        info!(listeners = self.notifier.listener_count(), "closing resource store");
        Ok(self.db.close()?)
    }

    fn key_for(&self, prop: &PropType, value: &PropValue) -> Result<KeyValue, ResourceError> {
        let mismatch = || ResourceError::WrongValueType {
            prop: prop.name.clone(),
            expected: prop.data_type,
            actual: value.data_type(),
        };
        Ok(match (prop.data_type, value) {
            (PropDataType::Int, PropValue::Int(i)) => KeyValue::Int(*i),
            (PropDataType::Bool, PropValue::Bool(b)) => KeyValue::Int(i32::from(*b)),
            (PropDataType::String | PropDataType::StringList, PropValue::String(s)) => {
                KeyValue::String(s.clone())
            }
            (PropDataType::DateTime, PropValue::DateTime(dt)) => {
                KeyValue::DateTime(datetime_to_ticks(dt)?)
            }
            (PropDataType::Double, PropValue::Double(d)) => KeyValue::Double(*d),
            (PropDataType::Blob, PropValue::Blob(_)) => {
                return Err(DbError::NotIndexable(ColumnType::Blob).into());
            }
            _ => return Err(mismatch()),
        })
    }
}

impl ResourceSource for ResourceStore {
    fn resource_type(&self, resource: i32) -> Result<Option<i32>, ResourceError> {
        match self.tables.resources.get_record(resource)? {
            Some(record) => Ok(Some(record.get_int(resources::TYPE)?)),
            None => Ok(None),
        }
    }

    fn resources_of_type(&self, resource_type: i32) -> Result<Vec<i32>, ResourceError> {
        Ok(self
            .tables
            .resources
            .create_result_set_eq(resources::TYPE, KeyValue::Int(resource_type))?
            .ids()
            .collect())
    }

    fn find_with_prop(&self, prop: i32) -> Result<Vec<i32>, ResourceError> {
        let prop_type = self.prop(prop)?;
        let mut found = vec![];
        if prop_type.is_link() {
            let rows = schema::records_matching(
                &self.tables.links,
                &[links::PROP_TYPE],
                &[KeyValue::Int(prop_type.id)],
            )?;
            for row in rows {
                let (from, to) = (row.get_int(links::FROM)?, row.get_int(links::TO)?);
                match (prop_type.is_directed_link(), prop < 0) {
                    (true, false) => found.push(from),
                    (true, true) => found.push(to),
                    (false, _) => found.extend([from, to]),
                }
            }
        } else {
            let rows = schema::records_matching(
                self.value_table(&prop_type)?,
                &[values::PROP_TYPE],
                &[KeyValue::Int(prop_type.id)],
            )?;
            for row in rows {
                found.push(row.get_int(values::RESOURCE)?);
            }
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn find_with_value(&self, prop: i32, value: &PropValue) -> Result<Vec<i32>, ResourceError> {
        let prop_type = self.prop(prop)?;
        let key = self.key_for(&prop_type, value)?;
        let value_column = if prop_type.data_type == PropDataType::StringList {
            string_lists::VALUE
        } else {
            values::VALUE
        };
        let rows = schema::records_matching(
            self.value_table(&prop_type)?,
            &[values::PROP_TYPE, value_column],
            &[KeyValue::Int(prop_type.id), key],
        )?;
        let mut found = rows
            .iter()
            .map(|r| r.get_int(values::RESOURCE))
            .collect::<Result<Vec<_>, _>>()?;
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn has_prop(&self, resource: i32, prop: i32) -> Result<bool, ResourceError> {
        let prop_type = self.prop(prop)?;
        if prop_type.is_link() {
            return Ok(!self.links(resource, prop)?.is_empty());
        }
        Ok(!self.value_rows(resource, &prop_type)?.is_empty())
    }

    fn prop_value(&self, resource: i32, prop: i32) -> Result<Option<PropValue>, ResourceError> {
        let prop_type = self.prop(prop)?;
        self.read_value(resource, &prop_type)
    }

    fn links(&self, resource: i32, prop: i32) -> Result<Vec<i32>, ResourceError> {
        let prop_type = self.prop(prop)?;
        if !prop_type.is_link() {
            return Err(ResourceError::NotALink(prop_type.name));
        }
        let id = prop_type.id;
        let key = [KeyValue::Int(resource), KeyValue::Int(id)];
        let outgoing = !prop_type.is_directed_link() || prop > 0;
        let incoming = !prop_type.is_directed_link() || prop < 0;
        let mut found = vec![];
        if outgoing {
            found.extend(self.tables.links.seek_values(&[links::FROM, links::PROP_TYPE], &key)?);
        }
        if incoming {
            found.extend(self.tables.links.seek_values(&[links::TO, links::PROP_TYPE], &key)?);
        }
        let mut found: Vec<i32> = found
            .into_iter()
            .filter_map(|(_, v)| match v {
                KeyValue::Int(other) => Some(other),
                _ => None,
            })
            .collect();
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn reverse_link(&self, prop: i32) -> i32 {
        match self.prop_types.get(prop) {
            Some(p) if p.is_directed_link() => -prop,
            _ => prop,
        }
    }
}

enum EditOp {
    SetProp(PropType, PropValue),
    DeleteProp(PropType),
    AddLink(i32, i32),
    DeleteLink(i32, i32),
    SetType(i32),
}

/// Pending changes to one resource, applied and published together by `commit`.
pub struct ResourceEditor<'a> {
    store: &'a ResourceStore,
    resource: Option<i32>,
    resource_type: i32,
    ops: Vec<EditOp>,
}

impl ResourceEditor<'_> {
    pub fn resource(&self) -> Option<i32> {
        self.resource
    }

    pub fn set_prop(
        &mut self,
        name: &str,
        value: impl Into<PropValue>,
    ) -> Result<&mut Self, ResourceError> {
        let prop = self.store.prop_named(name)?;
        let value = value.into();
        if prop.is_link() || prop.data_type != value.data_type() {
            return Err(ResourceError::WrongValueType {
                prop: prop.name,
                expected: prop.data_type,
                actual: value.data_type(),
            });
        }
        self.ops.push(EditOp::SetProp(prop, value));
        Ok(self)
    }

    pub fn delete_prop(&mut self, name: &str) -> Result<&mut Self, ResourceError> {
        let prop = self.store.prop_named(name)?;
        self.ops.push(EditOp::DeleteProp(prop));
        Ok(self)
    }

    fn link_prop(&self, name: &str, reverse: bool) -> Result<i32, ResourceError> {
        let prop = self.store.prop_named(name)?;
        if !prop.is_link() {
            return Err(ResourceError::NotALink(name.to_string()));
        }
        Ok(if reverse { self.store.reverse_link(prop.id) } else { prop.id })
    }

    /// Link this resource to `target`.
    pub fn add_link(&mut self, name: &str, target: i32) -> Result<&mut Self, ResourceError> {
        let prop = self.link_prop(name, false)?;
        self.ops.push(EditOp::AddLink(prop, target));
        Ok(self)
    }

    /// Link `source` to this resource through a directed link type.
    pub fn add_back_link(&mut self, name: &str, source: i32) -> Result<&mut Self, ResourceError> {
        let prop = self.link_prop(name, true)?;
        self.ops.push(EditOp::AddLink(prop, source));
        Ok(self)
    }

    pub fn delete_link(&mut self, name: &str, target: i32) -> Result<&mut Self, ResourceError> {
        let prop = self.link_prop(name, false)?;
        self.ops.push(EditOp::DeleteLink(prop, target));
        Ok(self)
    }

    pub fn set_type(&mut self, resource_type: &str) -> Result<&mut Self, ResourceError> {
        let resource_type = self.store.resource_types.id_of(resource_type)?;
        self.ops.push(EditOp::SetType(resource_type));
        Ok(self)
    }

    /// Apply every pending change and notify listeners. Returns the resource id.
    pub fn commit(self) -> Result<i32, ResourceError> {
        let store = self.store;
        let tables = &store.tables;
        let (id, mut changes) = match self.resource {
            Some(id) => (id, PropChangeSet::default()),
            None => {
                let mut record = tables.resources.new_record()?;
                record.set_int(resources::TYPE, self.resource_type)?;
                record.commit()?;
                (record.id(), PropChangeSet::new_resource())
            }
        };
        let mut resource_type = self.resource_type;
        let mut partners: AHashMap<i32, PropChangeSet> = AHashMap::new();

        for op in self.ops {
            match op {
                EditOp::SetProp(prop, value) => {
                    let old = store.read_value(id, &prop)?;
                    if old.as_ref() != Some(&value) {
                        store.write_value(id, &prop, &value)?;
                        changes.record_prop(prop.id, old);
                    }
                }
                EditOp::DeleteProp(prop) => {
                    if prop.is_link() {
                        for other in store.links(id, prop.id)? {
                            let (from, to, p) = link_row(id, prop.id, other);
                            delete_link_row(tables, from, to, p, !prop.is_directed_link())?;
                            changes.record_link_removed(prop.id, other);
                            partners
                                .entry(other)
                                .or_default()
                                .record_link_removed(store.reverse_link(prop.id), id);
                        }
                    } else if let Some(old) = store.read_value(id, &prop)? {
                        store.remove_value(id, &prop)?;
                        changes.record_prop(prop.id, Some(old));
                    }
                }
                EditOp::AddLink(prop, other) => {
                    if store.resource_type(other)?.is_none() {
                        return Err(ResourceError::ResourceDeleted(other));
                    }
                    if store.link_exists(id, prop, other)? {
                        continue;
                    }
                    let (from, to, p) = link_row(id, prop, other);
                    let mut row = tables.links.new_record()?;
                    row.set_int(links::FROM, from)?;
                    row.set_int(links::TO, to)?;
                    row.set_int(links::PROP_TYPE, p)?;
                    row.commit()?;
                    changes.record_link_added(prop, other);
                    partners
                        .entry(other)
                        .or_default()
                        .record_link_added(store.reverse_link(prop), id);
                }
                EditOp::DeleteLink(prop, other) => {
                    let (from, to, p) = link_row(id, prop, other);
                    let undirected = store.reverse_link(p) == p;
                    if delete_link_row(tables, from, to, p, undirected)? {
                        changes.record_link_removed(prop, other);
                        partners
                            .entry(other)
                            .or_default()
                            .record_link_removed(store.reverse_link(prop), id);
                    }
                }
                EditOp::SetType(new_type) => {
                    if new_type != resource_type {
                        if let Some(mut record) = tables.resources.get_record(id)? {
                            record.set_int(resources::TYPE, new_type)?;
                            record.commit()?;
                        }
                        changes.set_old_type(resource_type);
                        resource_type = new_type;
                    }
                }
            }
        }

        // A self-link shows up on both ends of the same resource.
        if let Some(own) = partners.remove(&id) {
            for prop in own.changed_props().collect::<Vec<_>>() {
                if let Some(change) = own.link_change(prop) {
                    for target in &change.added {
                        changes.record_link_added(prop, *target);
                    }
                    for target in &change.removed {
                        changes.record_link_removed(prop, *target);
                    }
                }
            }
        }

        if !changes.is_empty() {
            store.notifier.notify_saved(&ResourceEvent {
                resource: id,
                resource_type,
                changes: &changes,
            })?;
        }
        store.notify_partners(partners)?;
        Ok(id)
    }
}

/// Delete the link row `(from, to, prop)`, also in the swapped orientation for undirected
/// types. Returns whether anything was deleted.
fn delete_link_row(
    tables: &Tables,
    from: i32,
    to: i32,
    prop: i32,
    undirected: bool,
) -> Result<bool, DbError> {
    let mut deleted = false;
    let orientations = [(from, to), (to, from)];
    let tried = if undirected { 2 } else { 1 };
    for &(a, b) in &orientations[..tried] {
        let rows = schema::records_matching(
            &tables.links,
            &[links::FROM, links::PROP_TYPE],
            &[KeyValue::Int(a), KeyValue::Int(prop)],
        )?;
        for mut row in rows {
            if row.get_int(links::TO)? == b {
                row.delete()?;
                deleted = true;
            }
        }
        if deleted {
            break;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prop_types::PropTypeFlag;
    use crate::util::bitenum::BitEnum;

    #[test]
    fn directed_links_read_from_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceStore::open(dir.path(), DatabaseConfig::default()).unwrap();
        store.resource_types().register("Email", BitEnum::new()).unwrap();
        let reply = store
            .prop_types()
            .register(
                "Reply",
                PropDataType::Link,
                BitEnum::new_with(PropTypeFlag::DirectedLink),
                "mail",
            )
            .unwrap();
        let original = store.create_resource("Email").unwrap().commit().unwrap();
        let mut answer = store.create_resource("Email").unwrap();
        answer.add_link("Reply", original).unwrap();
        let answer = answer.commit().unwrap();

        assert_eq!(store.get_links(answer, "Reply").unwrap(), vec![original]);
        assert!(store.get_links(original, "Reply").unwrap().is_empty());
        assert_eq!(store.get_back_links(original, "Reply").unwrap(), vec![answer]);
        assert_eq!(store.links(original, -reply).unwrap(), vec![answer]);
        assert_eq!(store.find_with_prop(-reply).unwrap(), vec![original]);

        let mut edit = store.edit(answer).unwrap();
        edit.delete_link("Reply", original).unwrap();
        edit.commit().unwrap();
        assert!(store.get_back_links(original, "Reply").unwrap().is_empty());
    }
}
