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

//! Resources, typed properties and links layered over `petrel-db` tables, plus the predicate
//! algebra and notifier that keep live result lists current as resources change.

pub use change_set::{LinkChange, PropChangeSet};
pub use live_list::{ListChange, LiveResourceList};
pub use notifier::{ListenerToken, ResourceEvent, Subscription, UpdateListener, UpdateNotifier};
pub use predicate::{IdList, MatchState, ResourceListPredicate, ResourceSource};
pub use prop_types::{PropDataType, PropType, PropTypeFlag, PropValue};
pub use registry::PropTypeRegistry;
pub use resource_types::{ResourceType, ResourceTypeFlag, ResourceTypeRegistry};
pub use store::{
    LinkRestriction, PROP_TYPE_RESOURCE, ResourceEditor, ResourceStore, RestrictionViolation,
};
pub use util::bitenum::BitEnum;

mod change_set;
mod live_list;
mod notifier;
mod predicate;
mod prop_types;
mod registry;
mod resource_types;
mod schema;
mod store;
pub mod util;

use petrel_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Property type {name} is registered as {registered}, not {requested}")]
    PropTypeMismatch {
        name: String,
        registered: PropDataType,
        requested: PropDataType,
    },
    #[error("Property type {name}: {expected} display name(s) required")]
    DisplayNameMismatch { name: String, expected: usize },
    #[error("Property type {name} cannot be forced from {from} to {to}")]
    ForcedTypeNotAllowed {
        name: String,
        from: PropDataType,
        to: PropDataType,
    },
    #[error("Unknown property type: {0}")]
    UnknownPropType(String),
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),
    #[error("Resource {0} does not exist")]
    ResourceDeleted(i32),
    #[error("Property {prop} holds {expected} values, not {actual}")]
    WrongValueType {
        prop: String,
        expected: PropDataType,
        actual: PropDataType,
    },
    #[error("Property type {0} is not a link type")]
    NotALink(String),
}

impl ResourceError {
    /// True when the underlying tables hold inconsistent data and a rebuild is warranted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ResourceError::Db(e) if e.is_corruption())
    }
}
