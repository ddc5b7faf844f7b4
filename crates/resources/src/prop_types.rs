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

use chrono::NaiveDateTime;
use enum_primitive_derive::Primitive;
use strum::{Display, EnumString};

use crate::util::bitenum::BitEnum;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Primitive, Display, EnumString)]
pub enum PropDataType {
    Int = 0,
    String = 1,
    DateTime = 2,
    Double = 3,
    Link = 4,
    Blob = 5,
    StringList = 6,
    Bool = 7,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Primitive, Display, EnumString)]
pub enum PropTypeFlag {
    /// Source and target of the link read differently; `-id` names the reverse direction.
    DirectedLink = 0,
    Internal = 1,
    CountUnread = 2,
    SourceLink = 3,
}

/// A registered property type.
#[derive(Debug, Clone, PartialEq)]
pub struct PropType {
    pub id: i32,
    pub name: String,
    pub data_type: PropDataType,
    pub flags: BitEnum<PropTypeFlag>,
    pub owner: String,
    pub display_name: Option<String>,
    pub reverse_display_name: Option<String>,
    /// The resource standing for this property type.
    pub resource: i32,
}

impl PropType {
    pub fn is_link(&self) -> bool {
        self.data_type == PropDataType::Link
    }

    pub fn is_directed_link(&self) -> bool {
        self.is_link() && self.flags.contains(PropTypeFlag::DirectedLink)
    }

    /// Display name for the given direction of this type: `id` or `-id`.
    pub fn display_name_for(&self, direction: i32) -> &str {
        let name = if direction < 0 && self.is_directed_link() {
            self.reverse_display_name.as_deref()
        } else {
            self.display_name.as_deref()
        };
        name.unwrap_or(&self.name)
    }
}

/// A property value as read from or written to a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Int(i32),
    String(String),
    DateTime(NaiveDateTime),
    Double(f64),
    Blob(Vec<u8>),
    StringList(Vec<String>),
    Bool(bool),
}

impl PropValue {
    pub fn data_type(&self) -> PropDataType {
        match self {
            PropValue::Int(_) => PropDataType::Int,
            PropValue::String(_) => PropDataType::String,
            PropValue::DateTime(_) => PropDataType::DateTime,
            PropValue::Double(_) => PropDataType::Double,
            PropValue::Blob(_) => PropDataType::Blob,
            PropValue::StringList(_) => PropDataType::StringList,
            PropValue::Bool(_) => PropDataType::Bool,
        }
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        PropValue::Int(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::String(v.to_string())
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Double(v)
    }
}

impl From<NaiveDateTime> for PropValue {
    fn from(v: NaiveDateTime) -> Self {
        PropValue::DateTime(v)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(v: Vec<String>) -> Self {
        PropValue::StringList(v)
    }
}
