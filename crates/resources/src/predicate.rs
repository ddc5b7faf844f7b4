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

//! Resource selections that can be enumerated in full, or re-checked against one changed
//! resource without re-running the query.

use tracing::trace;

use crate::ResourceError;
use crate::change_set::PropChangeSet;
use crate::prop_types::PropValue;

/// The read side a predicate is evaluated against.
pub trait ResourceSource: Send + Sync {
    /// Type of `resource`, or `None` if it does not exist.
    fn resource_type(&self, resource: i32) -> Result<Option<i32>, ResourceError>;
    fn resources_of_type(&self, resource_type: i32) -> Result<Vec<i32>, ResourceError>;
    /// Resources having any value (or link) of `prop`.
    fn find_with_prop(&self, prop: i32) -> Result<Vec<i32>, ResourceError>;
    fn find_with_value(&self, prop: i32, value: &PropValue) -> Result<Vec<i32>, ResourceError>;
    fn has_prop(&self, resource: i32, prop: i32) -> Result<bool, ResourceError>;
    fn prop_value(&self, resource: i32, prop: i32) -> Result<Option<PropValue>, ResourceError>;
    /// Resources `resource` links to through `prop` (`-prop` for the reverse direction).
    fn links(&self, resource: i32, prop: i32) -> Result<Vec<i32>, ResourceError>;
    /// The direction under which the far end of a `prop` link sees it.
    fn reverse_link(&self, prop: i32) -> i32;
}

/// Whether a resource matched a predicate before and after a save.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MatchState {
    pub before: bool,
    pub after: bool,
}

impl MatchState {
    fn unchanged(matches: bool) -> Self {
        Self {
            before: matches,
            after: matches,
        }
    }

    pub fn flipped(&self) -> bool {
        self.before != self.after
    }
}

/// Resource ids, sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdList(Vec<i32>);

impl IdList {
    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn contains(&self, id: i32) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<i32>> for IdList {
    fn from(mut ids: Vec<i32>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        IdList(ids)
    }
}

impl FromIterator<i32> for IdList {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceListPredicate {
    Single(i32),
    PlainList(IdList),
    OfType(i32),
    HasProp(i32),
    PropEquals { prop: i32, value: PropValue },
    /// Every resource `resource` links to through `prop`.
    LinkedTo { resource: i32, prop: i32 },
    Union(Vec<ResourceListPredicate>),
    Intersection(Vec<ResourceListPredicate>),
}

fn merge_sorted(a: &[i32], b: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn intersect_sorted(a: &[i32], b: &[i32]) -> Vec<i32> {
    let mut out = vec![];
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

impl ResourceListPredicate {
    pub fn plain_list(ids: impl Into<IdList>) -> Self {
        ResourceListPredicate::PlainList(ids.into())
    }

    fn fixed_ids(&self) -> Option<&[i32]> {
        match self {
            ResourceListPredicate::Single(id) => Some(std::slice::from_ref(id)),
            ResourceListPredicate::PlainList(ids) => Some(ids.as_slice()),
            _ => None,
        }
    }

    /// Children's results, each sorted by id.
    fn sorted_children(
        children: &[ResourceListPredicate],
        src: &dyn ResourceSource,
    ) -> Result<Vec<Vec<i32>>, ResourceError> {
        children
            .iter()
            .map(|child| {
                let (mut ids, sorted) = child.matching_resources(src)?;
                if !sorted {
                    ids.sort_unstable();
                    ids.dedup();
                }
                Ok(ids)
            })
            .collect()
    }

    /// Every matching resource id, and whether the list is sorted by id.
    pub fn matching_resources(
        &self,
        src: &dyn ResourceSource,
    ) -> Result<(Vec<i32>, bool), ResourceError> {
        Ok(match self {
            ResourceListPredicate::Single(id) => match src.resource_type(*id)? {
                Some(_) => (vec![*id], true),
                None => (vec![], true),
            },
            ResourceListPredicate::PlainList(ids) => (ids.as_slice().to_vec(), true),
            ResourceListPredicate::OfType(t) => (src.resources_of_type(*t)?, false),
            ResourceListPredicate::HasProp(prop) => (src.find_with_prop(*prop)?, false),
            ResourceListPredicate::PropEquals { prop, value } => {
                (src.find_with_value(*prop, value)?, false)
            }
            ResourceListPredicate::LinkedTo { resource, prop } => {
                (src.links(*resource, *prop)?, false)
            }
            ResourceListPredicate::Union(children) => {
                let merged = Self::sorted_children(children, src)?
                    .iter()
                    .fold(vec![], |acc, ids| merge_sorted(&acc, ids));
                (merged, true)
            }
            ResourceListPredicate::Intersection(children) => {
                let mut lists = Self::sorted_children(children, src)?.into_iter();
                let first = lists.next().unwrap_or_default();
                (lists.fold(first, |acc, ids| intersect_sorted(&acc, &ids)), true)
            }
        })
    }

    /// Re-check `resource` after a save described by `changes`.
    pub fn match_resource(
        &self,
        src: &dyn ResourceSource,
        resource: i32,
        changes: &PropChangeSet,
    ) -> Result<MatchState, ResourceError> {
        let state = match self {
            ResourceListPredicate::Single(_) | ResourceListPredicate::PlainList(_) => {
                let member = self
                    .fixed_ids()
                    .is_some_and(|ids| ids.binary_search(&resource).is_ok());
                MatchState::unchanged(member)
            }
            ResourceListPredicate::OfType(t) => {
                let current = src.resource_type(resource)?;
                MatchState {
                    before: changes.old_type().or(current) == Some(*t),
                    after: current == Some(*t),
                }
            }
            ResourceListPredicate::HasProp(prop) => {
                let after = src.has_prop(resource, *prop)?;
                let before = match (changes.old_value(*prop), changes.link_change(*prop)) {
                    (Some(old), _) => old.is_some(),
                    (None, Some(change)) => {
                        let mut count = src.links(resource, *prop)?.len();
                        count -= change.added.len().min(count);
                        count += change.removed.len();
                        count > 0
                    }
                    (None, None) => after,
                };
                MatchState { before, after }
            }
            ResourceListPredicate::PropEquals { prop, value } => {
                let after = src.prop_value(resource, *prop)?.as_ref() == Some(value);
                let before = match changes.old_value(*prop) {
                    Some(old) => old == Some(value),
                    None => after,
                };
                MatchState { before, after }
            }
            ResourceListPredicate::LinkedTo {
                resource: anchor,
                prop,
            } => {
                let after = src.links(*anchor, *prop)?.contains(&resource);
                let before = match changes.link_change(src.reverse_link(*prop)) {
                    Some(change) => {
                        (after && !change.added.contains(anchor)) || change.removed.contains(anchor)
                    }
                    None => after,
                };
                MatchState { before, after }
            }
            ResourceListPredicate::Union(children) => {
                let (mut old, mut new) = (0usize, 0usize);
                for child in children {
                    let m = child.match_resource(src, resource, changes)?;
                    old += usize::from(m.before);
                    new += usize::from(m.after);
                    if old > 0 && new > 0 {
                        break;
                    }
                }
                MatchState {
                    before: old > 0,
                    after: new > 0,
                }
            }
            ResourceListPredicate::Intersection(children) => {
                let mut state = MatchState::unchanged(!children.is_empty());
                for child in children {
                    let m = child.match_resource(src, resource, changes)?;
                    state.before &= m.before;
                    state.after &= m.after;
                    if !state.before && !state.after {
                        break;
                    }
                }
                state
            }
        };
        if changes.is_new() {
            return Ok(MatchState {
                before: false,
                after: state.after,
            });
        }
        Ok(state)
    }

    /// Rewrite into an equivalent, cheaper predicate. Live unions fold their fixed-list
    /// children into a single list.
    pub fn optimize(self, is_live: bool) -> Self {
        match self {
            ResourceListPredicate::Union(children) => {
                let (lists, rest): (Vec<_>, Vec<_>) =
                    children.into_iter().partition(|c| c.fixed_ids().is_some());
                let has_empty = lists.iter().any(|c| c.fixed_ids().is_some_and(<[i32]>::is_empty));
                let mut children = rest;
                if is_live && (lists.len() > 1 || has_empty) {
                    let ids: IdList = lists
                        .iter()
                        .filter_map(|c| c.fixed_ids())
                        .flatten()
                        .copied()
                        .collect();
                    trace!(lists = lists.len(), ids = ids.len(), "merged fixed-list children");
                    if !ids.is_empty() {
                        children.push(Self::plain_list(ids));
                    }
                } else {
                    children.extend(lists);
                }
                let mut children: Vec<_> = children.into_iter().map(|c| c.optimize(is_live)).collect();
                match children.len() {
                    0 => ResourceListPredicate::PlainList(IdList::default()),
                    1 => children.remove(0),
                    _ => ResourceListPredicate::Union(children),
                }
            }
            ResourceListPredicate::Intersection(children) => ResourceListPredicate::Intersection(
                children.into_iter().map(|c| c.optimize(is_live)).collect(),
            ),
            other => other,
        }
    }

    /// The single resource type every match must have, if there is one.
    pub fn known_type(&self) -> Option<i32> {
        match self {
            ResourceListPredicate::OfType(t) => Some(*t),
            ResourceListPredicate::Intersection(children) => {
                children.iter().find_map(|c| c.known_type())
            }
            ResourceListPredicate::Union(children) => {
                let first = children.first()?.known_type()?;
                children
                    .iter()
                    .all(|c| c.known_type() == Some(first))
                    .then_some(first)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ahash::AHashMap;
    use pretty_assertions::assert_eq;

    /// In-memory source; links are undirected.
    #[derive(Default)]
    pub(crate) struct MemorySource {
        pub(crate) types: AHashMap<i32, i32>,
        pub(crate) props: AHashMap<(i32, i32), PropValue>,
        pub(crate) links: Vec<(i32, i32, i32)>,
    }

    impl ResourceSource for MemorySource {
        fn resource_type(&self, resource: i32) -> Result<Option<i32>, ResourceError> {
            Ok(self.types.get(&resource).copied())
        }

        fn resources_of_type(&self, resource_type: i32) -> Result<Vec<i32>, ResourceError> {
            Ok(self
                .types
                .iter()
                .filter(|(_, t)| **t == resource_type)
                .map(|(r, _)| *r)
                .collect())
        }

        fn find_with_prop(&self, prop: i32) -> Result<Vec<i32>, ResourceError> {
            Ok(self.props.keys().filter(|(_, p)| *p == prop).map(|(r, _)| *r).collect())
        }

        fn find_with_value(&self, prop: i32, value: &PropValue) -> Result<Vec<i32>, ResourceError> {
            Ok(self
                .props
                .iter()
                .filter(|((_, p), v)| *p == prop && *v == value)
                .map(|((r, _), _)| *r)
                .collect())
        }

        fn has_prop(&self, resource: i32, prop: i32) -> Result<bool, ResourceError> {
            Ok(self.props.contains_key(&(resource, prop)) || !self.links(resource, prop)?.is_empty())
        }

        fn prop_value(&self, resource: i32, prop: i32) -> Result<Option<PropValue>, ResourceError> {
            Ok(self.props.get(&(resource, prop)).cloned())
        }

        fn links(&self, resource: i32, prop: i32) -> Result<Vec<i32>, ResourceError> {
            Ok(self
                .links
                .iter()
                .filter(|(_, _, p)| *p == prop)
                .filter_map(|(a, b, _)| match (*a == resource, *b == resource) {
                    (true, _) => Some(*b),
                    (_, true) => Some(*a),
                    _ => None,
                })
                .collect())
        }

        fn reverse_link(&self, prop: i32) -> i32 {
            prop
        }
    }

    const TAG: i32 = 5;

    fn source() -> MemorySource {
        let mut src = MemorySource::default();
        for r in 1..=4 {
            src.types.insert(r, if r % 2 == 0 { 20 } else { 10 });
        }
        src.props.insert((1, TAG), PropValue::Int(1));
        src.props.insert((3, TAG), PropValue::Int(1));
        src
    }

    fn union() -> ResourceListPredicate {
        ResourceListPredicate::Union(vec![
            ResourceListPredicate::HasProp(TAG),
            ResourceListPredicate::plain_list(vec![3, 2]),
        ])
    }

    #[test]
    fn union_merges_without_duplicates() {
        let (ids, sorted) = union().matching_resources(&source()).unwrap();
        assert!(sorted);
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn union_keeps_resource_matched_by_other_child() {
        let mut src = source();
        src.props.remove(&(3, TAG));
        let mut changes = PropChangeSet::default();
        changes.record_prop(TAG, Some(PropValue::Int(1)));

        let state = union().match_resource(&src, 3, &changes).unwrap();
        assert_eq!(state, MatchState { before: true, after: true });
        assert!(!state.flipped());
        let only_tag = ResourceListPredicate::HasProp(TAG).match_resource(&src, 3, &changes).unwrap();
        assert!(only_tag.flipped());
        assert_eq!(union().matching_resources(&src).unwrap().0, vec![1, 2, 3]);
    }

    #[test]
    fn type_change_flips_of_type() {
        let mut src = source();
        src.types.insert(1, 20);
        let mut changes = PropChangeSet::default();
        changes.set_old_type(10);
        let state = ResourceListPredicate::OfType(10).match_resource(&src, 1, &changes).unwrap();
        assert_eq!(state, MatchState { before: true, after: false });
    }

    #[test]
    fn new_resource_never_matched_before() {
        let state = ResourceListPredicate::OfType(10)
            .match_resource(&source(), 1, &PropChangeSet::new_resource())
            .unwrap();
        assert_eq!(state, MatchState { before: false, after: true });
    }

    #[test]
    fn link_added_flips_linked_to() {
        let mut src = source();
        src.links.push((1, 2, 7));
        let mut changes = PropChangeSet::default();
        changes.record_link_added(7, 1);
        let predicate = ResourceListPredicate::LinkedTo { resource: 1, prop: 7 };
        let state = predicate.match_resource(&src, 2, &changes).unwrap();
        assert_eq!(state, MatchState { before: false, after: true });
        assert_eq!(predicate.matching_resources(&src).unwrap().0, vec![2]);
    }

    #[test]
    fn intersection_of_type_and_prop() {
        let predicate = ResourceListPredicate::Intersection(vec![
            ResourceListPredicate::OfType(10),
            ResourceListPredicate::HasProp(TAG),
        ]);
        assert_eq!(predicate.matching_resources(&source()).unwrap().0, vec![1, 3]);
        assert_eq!(predicate.known_type(), Some(10));
    }

    #[test]
    fn live_union_folds_fixed_lists() {
        let predicate = ResourceListPredicate::Union(vec![
            ResourceListPredicate::Single(9),
            ResourceListPredicate::plain_list(vec![4, 1]),
            ResourceListPredicate::plain_list(vec![]),
            ResourceListPredicate::OfType(10),
        ]);
        assert_eq!(
            predicate.clone().optimize(true),
            ResourceListPredicate::Union(vec![
                ResourceListPredicate::OfType(10),
                ResourceListPredicate::plain_list(vec![1, 4, 9]),
            ])
        );
        // Not live: left alone apart from recursion.
        assert!(matches!(predicate.optimize(false), ResourceListPredicate::Union(c) if c.len() == 4));

        let single = ResourceListPredicate::Union(vec![
            ResourceListPredicate::plain_list(vec![]),
            ResourceListPredicate::HasProp(TAG),
        ]);
        assert_eq!(single.optimize(true), ResourceListPredicate::HasProp(TAG));
    }

    #[test]
    fn plain_list_is_normalized_whatever_the_input_order() {
        let predicate = ResourceListPredicate::plain_list(vec![3, 1, 2, 3]);
        let (ids, sorted) = predicate.matching_resources(&source()).unwrap();
        assert!(sorted);
        assert_eq!(ids, vec![1, 2, 3]);
        let state = predicate
            .match_resource(&source(), 3, &PropChangeSet::default())
            .unwrap();
        assert_eq!(state, MatchState { before: true, after: true });

        let collected: IdList = [9, 4, 9].into_iter().collect();
        assert_eq!(collected.as_slice(), &[4, 9]);
        assert!(collected.contains(4) && !collected.contains(5));
    }
}
