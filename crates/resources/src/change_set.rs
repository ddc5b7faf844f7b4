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

use ahash::AHashMap;

use crate::prop_types::PropValue;

/// Targets added to and removed from one link type of a resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkChange {
    pub added: Vec<i32>,
    pub removed: Vec<i32>,
}

/// What one save changed on a resource, with enough of the old state to tell whether a
/// predicate matched before the save.
#[derive(Debug, Clone, Default)]
pub struct PropChangeSet {
    is_new: bool,
    old_type: Option<i32>,
    /// Changed property ids with their value before the save (`None`: it had none).
    props: AHashMap<i32, Option<PropValue>>,
    /// Keyed by the link type as seen from this resource (`-id` for the reverse direction).
    links: AHashMap<i32, LinkChange>,
}

impl PropChangeSet {
    pub fn new_resource() -> Self {
        Self {
            is_new: true,
            ..Default::default()
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// The resource type before the save, if the save changed it.
    pub fn old_type(&self) -> Option<i32> {
        self.old_type
    }

    pub fn is_empty(&self) -> bool {
        !self.is_new && self.old_type.is_none() && self.props.is_empty() && self.links.is_empty()
    }

    pub fn is_prop_changed(&self, prop: i32) -> bool {
        self.props.contains_key(&prop) || self.links.contains_key(&prop)
    }

    /// The value before the save: `None` if the property did not change, `Some(None)` if it
    /// was absent.
    pub fn old_value(&self, prop: i32) -> Option<Option<&PropValue>> {
        self.props.get(&prop).map(Option::as_ref)
    }

    pub fn link_change(&self, prop: i32) -> Option<&LinkChange> {
        self.links.get(&prop)
    }

    pub fn changed_props(&self) -> impl Iterator<Item = i32> + '_ {
        self.props.keys().chain(self.links.keys()).copied()
    }

    pub(crate) fn set_old_type(&mut self, old_type: i32) {
        if !self.is_new && self.old_type.is_none() {
            self.old_type = Some(old_type);
        }
    }

    /// Record a property change; only the first old value seen for a property is kept.
    pub(crate) fn record_prop(&mut self, prop: i32, old: Option<PropValue>) {
        self.props.entry(prop).or_insert(old);
    }

    pub(crate) fn record_link_added(&mut self, prop: i32, target: i32) {
        let change = self.links.entry(prop).or_default();
        if let Some(pos) = change.removed.iter().position(|t| *t == target) {
            change.removed.remove(pos);
        } else if !change.added.contains(&target) {
            change.added.push(target);
        }
    }

    pub(crate) fn record_link_removed(&mut self, prop: i32, target: i32) {
        let change = self.links.entry(prop).or_default();
        if let Some(pos) = change.added.iter().position(|t| *t == target) {
            change.added.remove(pos);
        } else if !change.removed.contains(&target) {
            change.removed.push(target);
        }
    }
}
