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

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ResourceError;
use crate::notifier::{ResourceEvent, Subscription, UpdateListener, UpdateNotifier};
use crate::predicate::{ResourceListPredicate, ResourceSource};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ListChange {
    Added(i32),
    Removed(i32),
    /// A member was saved and still matches.
    Changed(i32),
}

type ChangeCallback = Arc<dyn Fn(ListChange) + Send + Sync>;

struct LiveState {
    source: Weak<dyn ResourceSource>,
    predicate: ResourceListPredicate,
    ids: Mutex<Vec<i32>>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl LiveState {
    fn publish(&self, change: ListChange) {
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(change);
        }
    }
}

impl UpdateListener for LiveState {
    fn resource_saved(&self, event: &ResourceEvent<'_>) -> Result<(), ResourceError> {
        let Some(source) = self.source.upgrade() else {
            return Ok(());
        };
        let state = self
            .predicate
            .match_resource(source.as_ref(), event.resource, event.changes)?;
        let change = {
            let mut ids = self.ids.lock();
            let position = ids.binary_search(&event.resource);
            if state.before != position.is_ok() {
                trace!(resource = event.resource, "live list membership disagreed with old match state");
            }
            match (state.after, position) {
                (true, Err(at)) => {
                    ids.insert(at, event.resource);
                    Some(ListChange::Added(event.resource))
                }
                (false, Ok(at)) => {
                    ids.remove(at);
                    Some(ListChange::Removed(event.resource))
                }
                (true, Ok(_)) => Some(ListChange::Changed(event.resource)),
                (false, Err(_)) => None,
            }
        };
        if let Some(change) = change {
            self.publish(change);
        }
        Ok(())
    }

    fn resource_deleting(&self, resource: i32, _resource_type: i32) -> Result<(), ResourceError> {
        let removed = {
            let mut ids = self.ids.lock();
            match ids.binary_search(&resource) {
                Ok(at) => {
                    ids.remove(at);
                    true
                }
                Err(_) => false,
            }
        };
        if removed {
            self.publish(ListChange::Removed(resource));
        }
        Ok(())
    }
}

/// The result of a predicate, kept current as resources are saved and deleted.
pub struct LiveResourceList {
    state: Arc<LiveState>,
    subscription: Subscription,
}

impl LiveResourceList {
    pub fn new<S: ResourceSource + 'static>(
        source: &Arc<S>,
        notifier: &Arc<UpdateNotifier>,
        predicate: ResourceListPredicate,
    ) -> Result<Self, ResourceError> {
        let predicate = predicate.optimize(true);
        let (mut ids, sorted) = predicate.matching_resources(source.as_ref())?;
        if !sorted {
            ids.sort_unstable();
            ids.dedup();
        }
        let known_type = predicate.known_type();
        let weak: Weak<dyn ResourceSource> = Arc::downgrade(source) as Weak<dyn ResourceSource>;
        let state = Arc::new(LiveState {
            source: weak,
            predicate,
            ids: Mutex::new(ids),
            callbacks: Mutex::new(vec![]),
        });
        let subscription = notifier.subscribe(state.clone(), known_type, false);
        debug!(?known_type, len = state.ids.lock().len(), "created live list");
        Ok(Self {
            state,
            subscription,
        })
    }

    /// Call `callback` after every change to the list.
    pub fn on_change(&self, callback: impl Fn(ListChange) + Send + Sync + 'static) {
        self.state.callbacks.lock().push(Arc::new(callback));
    }

    /// Current members, sorted by id.
    pub fn ids(&self) -> Vec<i32> {
        self.state.ids.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.state.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.ids.lock().is_empty()
    }

    pub fn contains(&self, resource: i32) -> bool {
        self.state.ids.lock().binary_search(&resource).is_ok()
    }

    pub fn predicate(&self) -> &ResourceListPredicate {
        &self.state.predicate
    }

    /// Stop tracking changes. Dropping the list does the same.
    pub fn dispose(self) {
        debug!(token = ?self.subscription.token(), "disposing live list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_set::PropChangeSet;
    use crate::predicate::tests::MemorySource;
    use pretty_assertions::assert_eq;

    #[test]
    fn follows_deletes_and_new_resources() {
        let mut src = MemorySource::default();
        src.types.insert(1, 10);
        src.types.insert(2, 20);
        src.types.insert(3, 10);
        let src = Arc::new(src);
        let notifier = UpdateNotifier::new();
        let list = LiveResourceList::new(&src, &notifier, ResourceListPredicate::OfType(10)).unwrap();
        assert_eq!(list.ids(), vec![1, 3]);

        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        list.on_change(move |c| sink.lock().push(c));

        notifier.notify_deleting(3, 10).unwrap();
        assert_eq!(list.ids(), vec![1]);

        let changes = PropChangeSet::new_resource();
        notifier
            .notify_saved(&ResourceEvent {
                resource: 3,
                resource_type: 10,
                changes: &changes,
            })
            .unwrap();
        // Resources of other types never reach a typed list.
        notifier
            .notify_saved(&ResourceEvent {
                resource: 2,
                resource_type: 20,
                changes: &changes,
            })
            .unwrap();
        assert_eq!(list.ids(), vec![1, 3]);
        assert_eq!(*seen.lock(), vec![ListChange::Removed(3), ListChange::Added(3)]);

        assert_eq!(notifier.listener_count(), 1);
        list.dispose();
        assert_eq!(notifier.listener_count(), 0);
    }
}
