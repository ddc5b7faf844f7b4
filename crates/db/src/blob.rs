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

use std::fs::OpenOptions;
use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use crate::DbError;
use crate::heap::SlotHeap;
use crate::paging::{CachedStream, SharedPageCache};

pub(crate) const BLOB_FILE: &str = "blobs.dat";

/// Reference to a BLOB stored out-of-line. `NONE` refers to nothing.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct BlobHandle(pub u64);

impl BlobHandle {
    pub const NONE: BlobHandle = BlobHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blob#{}", self.0)
    }
}

/// All BLOBs of a database, kept in one shared slot heap.
pub struct BlobFileSystem {
    heap: Mutex<SlotHeap>,
}

impl BlobFileSystem {
    pub(crate) fn open(dir: &Path, cache: &SharedPageCache) -> Result<Self, DbError> {
        let path = dir.join(BLOB_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let stream = CachedStream::shared(Box::new(file), cache)?;
        let heap = SlotHeap::open(stream, BLOB_FILE.to_string())?;
        debug!(live = heap.live_slots(), "opened BLOB file system");
        Ok(Self {
            heap: Mutex::new(heap),
        })
    }

    pub fn store(&self, data: &[u8]) -> Result<BlobHandle, DbError> {
        Ok(BlobHandle(self.heap.lock().allocate(data)?))
    }

    pub fn read(&self, handle: BlobHandle) -> Result<Vec<u8>, DbError> {
        if handle.is_none() {
            return Err(DbError::BlobNotFound(handle.0));
        }
        self.heap
            .lock()
            .read(handle.0)?
            .ok_or(DbError::BlobNotFound(handle.0))
    }

    /// Replace a BLOB's contents. The handle changes when the new contents do not fit.
    pub fn replace(&self, handle: BlobHandle, data: &[u8]) -> Result<BlobHandle, DbError> {
        if handle.is_none() {
            return self.store(data);
        }
        Ok(BlobHandle(self.heap.lock().rewrite(handle.0, data)?))
    }

    pub fn free(&self, handle: BlobHandle) -> Result<(), DbError> {
        if handle.is_none() {
            return Ok(());
        }
        self.heap.lock().free(handle.0)
    }

    pub fn count(&self) -> u64 {
        self.heap.lock().live_slots()
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.heap.lock().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_replace_free() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SharedPageCache::new(1 << 20);
        let blobs = BlobFileSystem::open(dir.path(), &cache).unwrap();

        let h = blobs.store(b"some bytes").unwrap();
        assert!(!h.is_none());
        assert_eq!(blobs.read(h).unwrap(), b"some bytes");

        let big = vec![3u8; 10_000];
        let h2 = blobs.replace(h, &big).unwrap();
        assert_ne!(h, h2);
        assert_eq!(blobs.read(h2).unwrap(), big);
        assert!(matches!(blobs.read(h), Err(DbError::BlobNotFound(_))));

        blobs.free(h2).unwrap();
        assert_eq!(blobs.count(), 0);
        assert!(blobs.read(BlobHandle::NONE).is_err());
    }

    #[test]
    fn blobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SharedPageCache::new(1 << 20);
        let handle = {
            let blobs = BlobFileSystem::open(dir.path(), &cache).unwrap();
            let h = blobs.store(b"persistent").unwrap();
            blobs.flush().unwrap();
            h
        };
        let blobs = BlobFileSystem::open(dir.path(), &cache).unwrap();
        assert_eq!(blobs.read(handle).unwrap(), b"persistent");
    }
}
