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

//! The page cache makes a random-access byte stream behave like a low latency page store.
//!
//! A `CachedStream` fronts exactly one `BackingStream`, and faults fixed-size (8KiB) pages
//! in on first access. Modified pages are held dirty in memory and written back either when
//! they are evicted from the cache, or when the stream is explicitly flushed.
//!
//! Where pages live is decided by a `CachingStrategy`: either a private LRU per stream, or a
//! `SharedPageCache` in which several streams compete for one shared budget.

use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::sync::atomic::{AtomicU64, Ordering};

mod cached_page;
mod cached_stream;
mod strategy;

pub use cached_page::CachedPage;
pub use cached_stream::CachedStream;
pub use strategy::{CachingStrategy, SharedPageCache, SingleStreamStrategy};

/// The size of every cached page, in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Identity of a stream participating in a cache. Unique for the life of the process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(pub u64);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl StreamId {
    pub(crate) fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// A seekable, readable and writable stream of bytes that can be resized.
pub trait BackingStream: Read + Write + Seek + Send {
    /// Current physical length of the stream.
    fn stream_len(&mut self) -> std::io::Result<u64>;
    /// Truncate or zero-extend the stream.
    fn set_len(&mut self, len: u64) -> std::io::Result<()>;
    /// Make previously written bytes durable. Defaults to a plain flush.
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()
    }
}

impl BackingStream for File {
    fn stream_len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        File::set_len(self, len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl BackingStream for Cursor<Vec<u8>> {
    fn stream_len(&mut self) -> std::io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        if self.position() > len {
            self.set_position(len);
        }
        Ok(())
    }
}

/// Offset of the page that covers `position`.
pub(crate) fn page_offset(position: u64) -> u64 {
    position - (position % PAGE_SIZE as u64)
}

/// Number of whole pages a byte budget buys; never less than one.
pub(crate) fn pages_for_budget(bytes: usize) -> usize {
    (bytes / PAGE_SIZE).max(1)
}
