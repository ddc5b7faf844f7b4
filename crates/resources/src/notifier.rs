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

//! Save/delete notifications for live views.
//!
//! Listeners live in an arena of slots addressed by [`ListenerToken`]. Dispatch order for a
//! resource is: listeners registered for its type (and for its previous type, if the save
//! changed it), then untyped priority listeners, then all other untyped listeners. Listener
//! callbacks always run outside the registry lock. Removing a listener empties its slot at
//! once, but the dispatch buckets are only compacted when no dispatch is in progress.

use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ResourceError;
use crate::change_set::PropChangeSet;

/// A resource that was just saved.
#[derive(Debug)]
pub struct ResourceEvent<'a> {
    pub resource: i32,
    pub resource_type: i32,
    pub changes: &'a PropChangeSet,
}

pub trait UpdateListener: Send + Sync {
    fn resource_saved(&self, event: &ResourceEvent<'_>) -> Result<(), ResourceError>;
    /// Called before the resource and its properties are removed.
    fn resource_deleting(&self, resource: i32, resource_type: i32) -> Result<(), ResourceError>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ListenerToken {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    priority: bool,
    listener: Option<Arc<dyn UpdateListener>>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    typed: AHashMap<i32, Vec<ListenerToken>>,
    priority: Vec<ListenerToken>,
    untyped: Vec<ListenerToken>,
    /// Dispatches currently running, including nested ones.
    depth: usize,
    needs_compaction: bool,
}

impl Registry {
    fn is_live(&self, token: &ListenerToken) -> bool {
        self.slots
            .get(token.index as usize)
            .is_some_and(|s| s.generation == token.generation && s.listener.is_some())
    }

    fn is_priority(&self, token: &ListenerToken) -> bool {
        self.is_live(token) && self.slots[token.index as usize].priority
    }

    fn compact(&mut self) {
        let slots = &self.slots;
        let live = |t: &ListenerToken| {
            slots
                .get(t.index as usize)
                .is_some_and(|s| s.generation == t.generation && s.listener.is_some())
        };
        for bucket in self.typed.values_mut() {
            bucket.retain(live);
        }
        self.typed.retain(|_, bucket| !bucket.is_empty());
        self.priority.retain(live);
        self.untyped.retain(live);
        self.needs_compaction = false;
        trace!("compacted listener buckets");
    }
}

#[derive(Default)]
pub struct UpdateNotifier {
    registry: Mutex<Registry>,
}

/// Decrements the dispatch depth when a dispatch ends, however it ends.
struct DispatchGuard<'a> {
    notifier: &'a UpdateNotifier,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let mut registry = self.notifier.registry.lock();
        registry.depth -= 1;
        if registry.depth == 0 && registry.needs_compaction {
            registry.compact();
        }
    }
}

impl UpdateNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `listener`. With a `known_type` it only hears about resources of that type.
    pub fn add_listener(
        &self,
        listener: Arc<dyn UpdateListener>,
        known_type: Option<i32>,
        priority: bool,
    ) -> ListenerToken {
        let mut registry = self.registry.lock();
        let token = match registry.free.pop() {
            Some(index) => {
                let slot = &mut registry.slots[index as usize];
                slot.listener = Some(listener);
                slot.priority = priority;
                ListenerToken {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                registry.slots.push(Slot {
                    generation: 0,
                    priority,
                    listener: Some(listener),
                });
                ListenerToken {
                    index: (registry.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        match known_type {
            Some(t) => {
                let bucket = registry.typed.remove(&t).unwrap_or_default();
                // Stale entries may sit between live ones until compaction.
                let at = if priority {
                    bucket
                        .iter()
                        .rposition(|tok| registry.is_priority(tok))
                        .map_or(0, |last| last + 1)
                } else {
                    bucket.len()
                };
                let mut bucket = bucket;
                bucket.insert(at, token);
                registry.typed.insert(t, bucket);
            }
            None if priority => registry.priority.push(token),
            None => registry.untyped.push(token),
        }
        debug!(?token, ?known_type, priority, "added update listener");
        token
    }

    /// Unsubscribe. Returns false if the token was already removed.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        let mut registry = self.registry.lock();
        if !registry.is_live(&token) {
            return false;
        }
        let slot = &mut registry.slots[token.index as usize];
        slot.listener = None;
        slot.generation = slot.generation.wrapping_add(1);
        registry.free.push(token.index);
        if registry.depth == 0 {
            registry.compact();
        } else {
            registry.needs_compaction = true;
        }
        debug!(?token, "removed update listener");
        true
    }

    /// Register `listener` and tie its lifetime to the returned guard.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: Arc<dyn UpdateListener>,
        known_type: Option<i32>,
        priority: bool,
    ) -> Subscription {
        let token = self.add_listener(listener, known_type, priority);
        Subscription {
            notifier: Arc::downgrade(self),
            token,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .slots
            .iter()
            .filter(|s| s.listener.is_some())
            .count()
    }

    fn dispatch(
        &self,
        resource_type: i32,
        old_type: Option<i32>,
        mut deliver: impl FnMut(&dyn UpdateListener) -> Result<(), ResourceError>,
    ) -> Result<(), ResourceError> {
        let tokens: Vec<ListenerToken> = {
            let mut registry = self.registry.lock();
            registry.depth += 1;
            let mut tokens = registry.typed.get(&resource_type).cloned().unwrap_or_default();
            if let Some(old) = old_type.filter(|old| *old != resource_type)
                && let Some(bucket) = registry.typed.get(&old)
            {
                tokens.extend(bucket);
            }
            tokens.extend(&registry.priority);
            tokens.extend(&registry.untyped);
            tokens
        };
        let _guard = DispatchGuard { notifier: self };
        for token in tokens {
            let listener = {
                let registry = self.registry.lock();
                registry
                    .slots
                    .get(token.index as usize)
                    .filter(|s| s.generation == token.generation)
                    .and_then(|s| s.listener.clone())
            };
            match listener {
                Some(listener) => deliver(listener.as_ref())?,
                None => trace!(?token, "skipping removed listener"),
            }
        }
        Ok(())
    }

    pub fn notify_saved(&self, event: &ResourceEvent<'_>) -> Result<(), ResourceError> {
        self.dispatch(event.resource_type, event.changes.old_type(), |l| {
            l.resource_saved(event)
        })
    }

    pub fn notify_deleting(&self, resource: i32, resource_type: i32) -> Result<(), ResourceError> {
        self.dispatch(resource_type, None, |l| {
            l.resource_deleting(resource, resource_type)
        })
    }

    #[cfg(test)]
    fn bucket_entries(&self) -> usize {
        let registry = self.registry.lock();
        registry.typed.values().map(Vec::len).sum::<usize>()
            + registry.priority.len()
            + registry.untyped.len()
    }
}

/// Keeps a listener registered until dropped or cancelled.
pub struct Subscription {
    notifier: Weak<UpdateNotifier>,
    token: ListenerToken,
}

impl Subscription {
    pub fn token(&self) -> ListenerToken {
        self.token
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.remove_listener(self.token);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("token", &self.token).finish()
    }
}
