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

//! The tables backing the resource layer, declared in code.

use std::sync::Arc;

use petrel_db::{
    ColumnType, Database, DatabaseDesign, DbError, KeyValue, Record, Table, TableDesign, TableStore,
};

use crate::prop_types::PropDataType;

pub(crate) mod resources {
    pub const TABLE: &str = "Resources";
    pub const TYPE: usize = 0;
}

pub(crate) mod resource_types {
    pub const TABLE: &str = "ResourceTypes";
    pub const NAME: usize = 0;
    pub const FLAGS: usize = 1;
}

pub(crate) mod prop_types {
    pub const TABLE: &str = "PropTypes";
    pub const NAME: usize = 0;
    pub const DATA_TYPE: usize = 1;
    pub const FLAGS: usize = 2;
    pub const OWNER: usize = 3;
    pub const DISPLAY_NAME: usize = 4;
    pub const REVERSE_DISPLAY_NAME: usize = 5;
    /// Id of the resource representing this property type.
    pub const RESOURCE: usize = 6;
}

/// Column layout shared by the single-valued property tables.
pub(crate) mod values {
    pub const RESOURCE: usize = 0;
    pub const PROP_TYPE: usize = 1;
    pub const VALUE: usize = 2;
}

pub(crate) mod string_lists {
    pub const TABLE: &str = "StringListProps";
    pub const ORDER: usize = 2;
    pub const VALUE: usize = 3;
}

pub(crate) mod links {
    pub const TABLE: &str = "Links";
    pub const FROM: usize = 0;
    pub const TO: usize = 1;
    pub const PROP_TYPE: usize = 2;
}

pub(crate) mod link_restrictions {
    pub const TABLE: &str = "LinkRestrictions";
    pub const RESOURCE_TYPE: usize = 0;
    pub const PROP_TYPE: usize = 1;
    pub const MIN_COUNT: usize = 2;
    pub const MAX_COUNT: usize = 3;
}

const INT_PROPS: &str = "IntProps";
const STRING_PROPS: &str = "StringProps";
const DATE_PROPS: &str = "DateProps";
const DOUBLE_PROPS: &str = "DoubleProps";
const BLOB_PROPS: &str = "BlobProps";

fn declare_value_table(
    db: &dyn DatabaseDesign,
    name: &str,
    value_type: ColumnType,
) -> Result<(), DbError> {
    let table = db.create_table(name)?;
    table.create_column("Resource", ColumnType::Int)?;
    table.create_column("PropType", ColumnType::Int)?;
    table.create_column("Value", value_type)?;
    table.create_compound_index(&["Resource", "PropType"])?;
    if value_type.is_indexable() {
        table.create_compound_index(&["PropType", "Value"])?;
    } else {
        table.create_index("PropType")?;
    }
    Ok(())
}

/// Declare every table of a fresh resource database.
pub(crate) fn declare(db: &dyn DatabaseDesign) -> Result<(), DbError> {
    let resources = db.create_table(resources::TABLE)?;
    resources.create_column("Type", ColumnType::Int)?;
    resources.create_index("Type")?;

    let types = db.create_table(resource_types::TABLE)?;
    types.create_column("Name", ColumnType::String)?;
    types.create_column("Flags", ColumnType::Int)?;
    types.create_index("Name")?;

    let props = db.create_table(prop_types::TABLE)?;
    props.create_column("Name", ColumnType::String)?;
    props.create_column("DataType", ColumnType::Int)?;
    props.create_column("Flags", ColumnType::Int)?;
    props.create_column("Owner", ColumnType::String)?;
    props.create_column("DisplayName", ColumnType::String)?;
    props.create_column("ReverseDisplayName", ColumnType::String)?;
    props.create_column("Resource", ColumnType::Int)?;
    props.create_index("Name")?;

    declare_value_table(db, INT_PROPS, ColumnType::Int)?;
    declare_value_table(db, STRING_PROPS, ColumnType::String)?;
    declare_value_table(db, DATE_PROPS, ColumnType::DateTime)?;
    declare_value_table(db, DOUBLE_PROPS, ColumnType::Double)?;
    declare_value_table(db, BLOB_PROPS, ColumnType::Blob)?;

    let lists = db.create_table(string_lists::TABLE)?;
    lists.create_column("Resource", ColumnType::Int)?;
    lists.create_column("PropType", ColumnType::Int)?;
    lists.create_column("Order", ColumnType::Int)?;
    lists.create_column("Value", ColumnType::String)?;
    lists.create_compound_index(&["Resource", "PropType", "Order"])?;
    lists.create_compound_index(&["PropType", "Value"])?;

    let links = db.create_table(links::TABLE)?;
    links.create_column("From", ColumnType::Int)?;
    links.create_column("To", ColumnType::Int)?;
    links.create_column("PropType", ColumnType::Int)?;
    links.create_index_with_value(&["From", "PropType"], "To")?;
    links.create_index_with_value(&["To", "PropType"], "From")?;
    links.create_index("PropType")?;

    let restrictions = db.create_table(link_restrictions::TABLE)?;
    restrictions.create_column("ResourceType", ColumnType::Int)?;
    restrictions.create_column("PropType", ColumnType::Int)?;
    restrictions.create_column("MinCount", ColumnType::Int)?;
    restrictions.create_column("MaxCount", ColumnType::Int)?;
    restrictions.create_compound_index(&["ResourceType", "PropType"])?;
    restrictions.create_index("PropType")?;
    Ok(())
}

/// Handles to every table of an open resource database.
pub(crate) struct Tables {
    pub(crate) resources: Arc<TableStore>,
    pub(crate) resource_types: Arc<TableStore>,
    pub(crate) prop_types: Arc<TableStore>,
    pub(crate) int_props: Arc<TableStore>,
    pub(crate) string_props: Arc<TableStore>,
    pub(crate) date_props: Arc<TableStore>,
    pub(crate) double_props: Arc<TableStore>,
    pub(crate) blob_props: Arc<TableStore>,
    pub(crate) string_list_props: Arc<TableStore>,
    pub(crate) links: Arc<TableStore>,
    pub(crate) link_restrictions: Arc<TableStore>,
}

impl Tables {
    pub(crate) fn open(db: &dyn Database) -> Result<Self, DbError> {
        Ok(Self {
            resources: db.table(resources::TABLE)?,
            resource_types: db.table(resource_types::TABLE)?,
            prop_types: db.table(prop_types::TABLE)?,
            int_props: db.table(INT_PROPS)?,
            string_props: db.table(STRING_PROPS)?,
            date_props: db.table(DATE_PROPS)?,
            double_props: db.table(DOUBLE_PROPS)?,
            blob_props: db.table(BLOB_PROPS)?,
            string_list_props: db.table(string_lists::TABLE)?,
            links: db.table(links::TABLE)?,
            link_restrictions: db.table(link_restrictions::TABLE)?,
        })
    }

    /// The table storing values of `data_type`; `None` for links.
    pub(crate) fn for_values(&self, data_type: PropDataType) -> Option<&Arc<TableStore>> {
        match data_type {
            PropDataType::Int | PropDataType::Bool => Some(&self.int_props),
            PropDataType::String => Some(&self.string_props),
            PropDataType::DateTime => Some(&self.date_props),
            PropDataType::Double => Some(&self.double_props),
            PropDataType::Blob => Some(&self.blob_props),
            PropDataType::StringList => Some(&self.string_list_props),
            PropDataType::Link => None,
        }
    }

    pub(crate) fn value_tables(&self) -> [&Arc<TableStore>; 6] {
        [
            &self.int_props,
            &self.string_props,
            &self.date_props,
            &self.double_props,
            &self.blob_props,
            &self.string_list_props,
        ]
    }
}

/// Records of `table` whose `columns` start with `keys`, through the index on those columns.
pub(crate) fn records_matching(
    table: &TableStore,
    columns: &[usize],
    keys: &[KeyValue],
) -> Result<Vec<Record>, DbError> {
    table.create_compound_result_set(columns, keys)?.collect()
}

pub(crate) fn delete_matching(
    table: &TableStore,
    columns: &[usize],
    keys: &[KeyValue],
) -> Result<usize, DbError> {
    let records = records_matching(table, columns, keys)?;
    let count = records.len();
    for mut record in records {
        record.delete()?;
    }
    Ok(count)
}
