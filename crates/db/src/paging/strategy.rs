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

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use crate::paging::{BackingStream, CachedPage, StreamId, pages_for_budget};

pub(crate) type SharedBacking = Arc<Mutex<Box<dyn BackingStream>>>;

/// Where cached pages live, and who gets evicted when the budget is exhausted.
///
/// Implementations are keyed by `(StreamId, page offset)`; a strategy serving a single stream
/// may ignore the stream component.
pub trait CachingStrategy: Send {
    /// Look a page up, marking it most-recently used.
    fn get(&mut self, stream: StreamId, offset: u64) -> Option<&mut CachedPage>;
    /// Look a page up without disturbing recency.
    fn peek_mut(&mut self, stream: StreamId, offset: u64) -> Option<&mut CachedPage>;
    /// Insert a page that is not already present. If the budget is exceeded, returns the
    /// least-recently used page along with the stream it belongs to.
    fn put(&mut self, stream: StreamId, page: CachedPage) -> Option<(StreamId, CachedPage)>;
    fn remove(&mut self, stream: StreamId, offset: u64) -> Option<CachedPage>;
    /// Offsets of every cached page belonging to `stream`, in no particular order.
    fn offsets_for(&self, stream: StreamId) -> Vec<u64>;
    fn capacity_pages(&self) -> usize;
    fn cached_pages(&self) -> usize;
    /// Make a stream's backing reachable for write-back of its evicted pages.
    fn register(&mut self, stream: StreamId, backing: &SharedBacking);
    fn unregister(&mut self, stream: StreamId);
    /// The backing stream that owns pages for `stream`, if it is still alive.
    fn writer_for(&self, stream: StreamId) -> Option<SharedBacking>;
}

/// A private LRU of pages for exactly one stream, indexed purely by page offset.
pub struct SingleStreamStrategy {
    owner: Option<StreamId>,
    pages: LruCache<u64, CachedPage>,
}

impl SingleStreamStrategy {
    pub fn new(budget_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(pages_for_budget(budget_bytes)).unwrap_or(NonZeroUsize::MIN);
        Self {
            owner: None,
            pages: LruCache::new(capacity),
        }
    }
}

impl CachingStrategy for SingleStreamStrategy {
    fn get(&mut self, _stream: StreamId, offset: u64) -> Option<&mut CachedPage> {
        self.pages.get_mut(&offset)
    }

    fn peek_mut(&mut self, _stream: StreamId, offset: u64) -> Option<&mut CachedPage> {
        self.pages.peek_mut(&offset)
    }

    fn put(&mut self, stream: StreamId, page: CachedPage) -> Option<(StreamId, CachedPage)> {
        self.pages
            .push(page.offset(), page)
            .map(|(_, evicted)| (self.owner.unwrap_or(stream), evicted))
    }

    fn remove(&mut self, _stream: StreamId, offset: u64) -> Option<CachedPage> {
        self.pages.pop(&offset)
    }

    fn offsets_for(&self, _stream: StreamId) -> Vec<u64> {
        self.pages.iter().map(|(offset, _)| *offset).collect()
    }

    fn capacity_pages(&self) -> usize {
        self.pages.cap().get()
    }

    fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    fn register(&mut self, stream: StreamId, _backing: &SharedBacking) {
        self.owner = Some(stream);
    }

    fn unregister(&mut self, _stream: StreamId) {
        self.owner = None;
    }

    fn writer_for(&self, _stream: StreamId) -> Option<SharedBacking> {
        // Only ever one stream here, and it writes its own pages back.
        None
    }
}

/// One LRU shared by many streams, indexed by (stream identity, page offset).
pub struct SharedStrategy {
    pages: LruCache<(StreamId, u64), CachedPage>,
    writers: HashMap<StreamId, Weak<Mutex<Box<dyn BackingStream>>>>,
}

impl CachingStrategy for SharedStrategy {
    fn get(&mut self, stream: StreamId, offset: u64) -> Option<&mut CachedPage> {
        self.pages.get_mut(&(stream, offset))
    }

    fn peek_mut(&mut self, stream: StreamId, offset: u64) -> Option<&mut CachedPage> {
        self.pages.peek_mut(&(stream, offset))
    }

    fn put(&mut self, stream: StreamId, page: CachedPage) -> Option<(StreamId, CachedPage)> {
        self.pages
            .push((stream, page.offset()), page)
            .map(|((owner, _), evicted)| (owner, evicted))
    }

    fn remove(&mut self, stream: StreamId, offset: u64) -> Option<CachedPage> {
        self.pages.pop(&(stream, offset))
    }

    fn offsets_for(&self, stream: StreamId) -> Vec<u64> {
        self.pages
            .iter()
            .filter(|((owner, _), _)| *owner == stream)
            .map(|((_, offset), _)| *offset)
            .collect()
    }

    fn capacity_pages(&self) -> usize {
        self.pages.cap().get()
    }

    fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    fn register(&mut self, stream: StreamId, backing: &SharedBacking) {
        self.writers.insert(stream, Arc::downgrade(backing));
    }

    fn unregister(&mut self, stream: StreamId) {
        self.writers.remove(&stream);
    }

    fn writer_for(&self, stream: StreamId) -> Option<SharedBacking> {
        self.writers.get(&stream).and_then(Weak::upgrade)
    }
}

/// Handle to a page budget shared between several `CachedStream`s.
#[derive(Clone)]
pub struct SharedPageCache {
    pub(crate) strategy: Arc<Mutex<Box<dyn CachingStrategy>>>,
}

impl SharedPageCache {
    pub fn new(budget_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(pages_for_budget(budget_bytes)).unwrap_or(NonZeroUsize::MIN);
        let strategy: Box<dyn CachingStrategy> = Box::new(SharedStrategy {
            pages: LruCache::new(capacity),
            writers: HashMap::new(),
        });
        Self {
            strategy: Arc::new(Mutex::new(strategy)),
        }
    }

    pub fn capacity_pages(&self) -> usize {
        self.strategy.lock().capacity_pages()
    }

    pub fn cached_pages(&self) -> usize {
        self.strategy.lock().cached_pages()
    }
}

impl std::fmt::Debug for SharedPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategy = self.strategy.lock();
        f.debug_struct("SharedPageCache")
            .field("capacity_pages", &strategy.capacity_pages())
            .field("cached_pages", &strategy.cached_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PAGE_SIZE;
    use std::io::Cursor;

    fn page_at(offset: u64) -> CachedPage {
        let mut stream = Cursor::new(vec![]);
        CachedPage::load(&mut stream, offset).unwrap()
    }

    #[test]
    fn budget_rounds_down_to_whole_pages() {
        let strategy = SingleStreamStrategy::new(3 * PAGE_SIZE + PAGE_SIZE / 2);
        assert_eq!(strategy.capacity_pages(), 3);
        let strategy = SingleStreamStrategy::new(10);
        assert_eq!(strategy.capacity_pages(), 1);
    }

    #[test]
    fn shared_eviction_reports_owner() {
        let cache = SharedPageCache::new(2 * PAGE_SIZE);
        let mut strategy = cache.strategy.lock();
        let a = StreamId(1001);
        let b = StreamId(1002);
        assert!(strategy.put(a, page_at(0)).is_none());
        assert!(strategy.put(b, page_at(0)).is_none());
        // Touch a's page so b's becomes least recently used.
        assert!(strategy.get(a, 0).is_some());
        let (owner, evicted) = strategy.put(a, page_at(PAGE_SIZE as u64)).unwrap();
        assert_eq!(owner, b);
        assert_eq!(evicted.offset(), 0);

        let mut offsets = strategy.offsets_for(a);
        offsets.sort();
        assert_eq!(offsets, vec![0, PAGE_SIZE as u64]);
        assert!(strategy.offsets_for(b).is_empty());
    }
}
