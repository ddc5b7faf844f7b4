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

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::DbError;
use crate::paging::strategy::SharedBacking;
use crate::paging::{
    BackingStream, CachedPage, CachingStrategy, PAGE_SIZE, SharedPageCache, SingleStreamStrategy,
    StreamId, page_offset,
};

/// A random-access stream whose bytes are served out of a page cache.
///
/// All reads and writes go through cached pages. Dirty pages reach the backing stream when
/// they are evicted, when `flush` is called, or when the stream is dropped.
pub struct CachedStream {
    id: StreamId,
    backing: SharedBacking,
    strategy: Arc<Mutex<Box<dyn CachingStrategy>>>,
    length: u64,
    position: u64,
    released: bool,
}

impl CachedStream {
    /// Wrap `stream` with a private page cache of (at most) `budget_bytes`.
    pub fn new(stream: Box<dyn BackingStream>, budget_bytes: usize) -> Result<Self, DbError> {
        let strategy: Box<dyn CachingStrategy> = Box::new(SingleStreamStrategy::new(budget_bytes));
        Self::with_strategy(stream, Arc::new(Mutex::new(strategy)))
    }

    /// Wrap `stream`, drawing pages from a budget shared with other streams.
    pub fn shared(stream: Box<dyn BackingStream>, cache: &SharedPageCache) -> Result<Self, DbError> {
        Self::with_strategy(stream, cache.strategy.clone())
    }

    fn with_strategy(
        mut stream: Box<dyn BackingStream>,
        strategy: Arc<Mutex<Box<dyn CachingStrategy>>>,
    ) -> Result<Self, DbError> {
        let length = stream.stream_len()?;
        let id = StreamId::next();
        let backing: SharedBacking = Arc::new(Mutex::new(stream));
        strategy.lock().register(id, &backing);
        Ok(Self {
            id,
            backing,
            strategy,
            length,
            position: 0,
            released: false,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Logical length, including bytes still only held in dirty pages.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor. Positions beyond the current length are refused.
    pub fn set_position(&mut self, position: u64) -> Result<(), DbError> {
        if position > self.length {
            return Err(DbError::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Run `f` against the page covering `offset`, faulting it in if necessary.
    pub fn with_page<R>(&mut self, offset: u64, f: impl FnOnce(&CachedPage) -> R) -> Result<R, DbError> {
        self.access(offset, |page| f(page))
    }

    /// As `with_page`, for the write path.
    pub(crate) fn with_page_mut<R>(
        &mut self,
        offset: u64,
        f: impl FnOnce(&mut CachedPage) -> R,
    ) -> Result<R, DbError> {
        self.access(offset, f)
    }

    fn access<R>(&mut self, offset: u64, f: impl FnOnce(&mut CachedPage) -> R) -> Result<R, DbError> {
        let page_offset = page_offset(offset);
        let mut strategy = self.strategy.lock();
        if let Some(page) = strategy.get(self.id, page_offset) {
            return Ok(f(page));
        }

        let mut page = {
            let mut backing = self.backing.lock();
            CachedPage::load(&mut **backing, page_offset)?
        };
        trace!(stream = self.id.0, page_offset, "faulted page");
        let result = f(&mut page);
        if let Some((owner, mut evicted)) = strategy.put(self.id, page) {
            if evicted.is_dirty() {
                // Dirty pages go back to whichever stream owns them.
                if owner == self.id {
                    evicted.save(&mut **self.backing.lock())?;
                } else if let Some(writer) = strategy.writer_for(owner) {
                    evicted.save(&mut **writer.lock())?;
                } else {
                    warn!(
                        stream = owner.0,
                        offset = evicted.offset(),
                        "evicted dirty page for a stream that no longer exists"
                    );
                }
            }
        }
        Ok(result)
    }

    /// Byte at `index`.
    pub fn byte_at(&mut self, index: u64) -> Result<u8, DbError> {
        if index >= self.length {
            return Err(DbError::PositionOutOfRange {
                position: index,
                length: self.length,
            });
        }
        let at = (index - page_offset(index)) as usize;
        self.with_page(index, |page| {
            let mut b = [0u8; 1];
            page.read(at, &mut b);
            b[0]
        })
    }

    /// Set the byte at `index`; writing at exactly `len()` extends the stream by one.
    pub fn set_byte_at(&mut self, index: u64, value: u8) -> Result<(), DbError> {
        self.write_at(index, &[value])
    }

    /// Read up to `buf.len()` bytes at `position`, returning how many were available.
    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize, DbError> {
        if position > self.length {
            return Err(DbError::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        let wanted = buf.len().min((self.length - position) as usize);
        let mut done = 0;
        while done < wanted {
            let at = position + done as u64;
            let in_page = (at - page_offset(at)) as usize;
            let chunk = (wanted - done).min(PAGE_SIZE - in_page);
            let target = &mut buf[done..done + chunk];
            self.with_page(at, |page| page.read(in_page, target))?;
            done += chunk;
        }
        Ok(done)
    }

    /// Read exactly `buf.len()` bytes at `position`.
    pub fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<(), DbError> {
        let n = self.read_at(position, buf)?;
        if n < buf.len() {
            return Err(DbError::PositionOutOfRange {
                position: position + buf.len() as u64,
                length: self.length,
            });
        }
        Ok(())
    }

    /// Write `buf` at `position`. Writing past the current end extends the stream.
    pub fn write_at(&mut self, position: u64, buf: &[u8]) -> Result<(), DbError> {
        if position > self.length {
            return Err(DbError::PositionOutOfRange {
                position,
                length: self.length,
            });
        }
        let mut done = 0;
        while done < buf.len() {
            let at = position + done as u64;
            let in_page = (at - page_offset(at)) as usize;
            let chunk = (buf.len() - done).min(PAGE_SIZE - in_page);
            let source = &buf[done..done + chunk];
            self.with_page_mut(at, |page| page.write(in_page, source))?;
            done += chunk;
        }
        self.length = self.length.max(position + buf.len() as u64);
        Ok(())
    }

    /// Truncate or extend the stream.
    ///
    /// Pages wholly beyond the new length are dropped, their contents being moot. A page that
    /// straddles the new end is shrunk in place and marked dirty.
    pub fn set_len(&mut self, new_length: u64) -> Result<(), DbError> {
        let mut strategy = self.strategy.lock();
        for offset in strategy.offsets_for(self.id) {
            if offset >= new_length {
                strategy.remove(self.id, offset);
            } else if let Some(page) = strategy.peek_mut(self.id, offset) {
                let keep = (new_length - offset) as usize;
                if keep < page.size() {
                    page.shrink(keep);
                }
            }
        }
        self.backing.lock().set_len(new_length)?;
        self.length = new_length;
        self.position = self.position.min(new_length);
        Ok(())
    }

    /// Write all dirty pages back in ascending offset order, then flush the backing stream.
    pub fn flush(&mut self) -> Result<(), DbError> {
        let mut strategy = self.strategy.lock();
        let mut offsets = strategy.offsets_for(self.id);
        offsets.sort_unstable();
        let mut backing = self.backing.lock();
        let mut written = 0;
        for offset in offsets {
            if let Some(page) = strategy.peek_mut(self.id, offset)
                && page.is_dirty()
            {
                page.save(&mut **backing)?;
                written += 1;
            }
        }
        if backing.stream_len()? < self.length {
            backing.set_len(self.length)?;
        }
        backing.flush()?;
        trace!(stream = self.id.0, written, "flushed pages");
        Ok(())
    }

    /// Flush, then ask the backing stream to make its contents durable.
    pub fn sync(&mut self) -> Result<(), DbError> {
        self.flush()?;
        self.backing.lock().sync()?;
        Ok(())
    }

    pub fn dirty_page_count(&self) -> usize {
        let mut strategy = self.strategy.lock();
        strategy
            .offsets_for(self.id)
            .into_iter()
            .filter(|offset| {
                strategy
                    .peek_mut(self.id, *offset)
                    .is_some_and(|page| page.is_dirty())
            })
            .count()
    }

    /// Drop the stream without writing any dirty pages back.
    pub fn discard(mut self) {
        self.release(false);
    }

    fn release(&mut self, write_back: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if write_back && let Err(e) = self.flush() {
            error!(stream = self.id.0, "unable to flush cached stream on release: {e}");
        }
        let mut strategy = self.strategy.lock();
        for offset in strategy.offsets_for(self.id) {
            strategy.remove(self.id, offset);
        }
        strategy.unregister(self.id);
    }
}

impl Drop for CachedStream {
    fn drop(&mut self) {
        self.release(true);
    }
}

impl std::fmt::Debug for CachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStream")
            .field("id", &self.id)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

fn into_io(e: DbError) -> std::io::Error {
    match e {
        DbError::Io(e) => e,
        DbError::PositionOutOfRange { .. } => {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        }
        other => std::io::Error::other(other),
    }
}

impl Read for CachedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.read_at(self.position, buf).map_err(into_io)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for CachedStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_at(self.position, buf).map_err(into_io)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        CachedStream::flush(self).map_err(into_io)
    }
}

impl Seek for CachedStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        };
        self.set_position(target).map_err(into_io)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A backing stream whose bytes outlive the `CachedStream` wrapping it.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl Read for SharedBuffer {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.lock().read(buf)
        }
    }
    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl Seek for SharedBuffer {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.0.lock().seek(pos)
        }
    }
    impl BackingStream for SharedBuffer {
        fn stream_len(&mut self) -> std::io::Result<u64> {
            Ok(self.0.lock().get_ref().len() as u64)
        }
        fn set_len(&mut self, len: u64) -> std::io::Result<()> {
            self.0.lock().set_len(len)
        }
    }

    impl SharedBuffer {
        fn raw(&self) -> Vec<u8> {
            self.0.lock().get_ref().clone()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn multi_page_write_reads_back_before_and_after_flush() {
        let buffer = SharedBuffer::default();
        let data = pattern(3 * PAGE_SIZE + 123);
        {
            let mut stream = CachedStream::new(Box::new(buffer.clone()), 16 * PAGE_SIZE).unwrap();
            stream.write_at(0, &data).unwrap();
            assert_eq!(stream.len(), data.len() as u64);
            // Nothing has reached the backing stream yet.
            assert!(buffer.raw().is_empty());

            let mut out = vec![0u8; data.len()];
            stream.read_exact_at(0, &mut out).unwrap();
            assert_eq!(out, data);

            stream.flush().unwrap();
            assert_eq!(stream.dirty_page_count(), 0);
        }
        assert_eq!(buffer.raw(), data);

        let mut fresh = CachedStream::new(Box::new(buffer.clone()), 16 * PAGE_SIZE).unwrap();
        let mut out = vec![0u8; data.len()];
        fresh.read_exact_at(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let buffer = SharedBuffer::default();
        let data = pattern(4 * PAGE_SIZE);
        let mut stream = CachedStream::new(Box::new(buffer.clone()), PAGE_SIZE).unwrap();
        stream.write_at(0, &data).unwrap();
        // A one page budget must have pushed the first three pages out already.
        assert_eq!(buffer.raw().len(), 3 * PAGE_SIZE);
        assert_eq!(&buffer.raw()[..], &data[..3 * PAGE_SIZE]);

        let mut out = vec![0u8; data.len()];
        stream.read_exact_at(0, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn set_len_drops_and_shrinks_pages() {
        let buffer = SharedBuffer::default();
        let mut stream = CachedStream::new(Box::new(buffer.clone()), 8 * PAGE_SIZE).unwrap();
        stream.write_at(0, &pattern(3 * PAGE_SIZE)).unwrap();
        stream.set_len(PAGE_SIZE as u64 + 10).unwrap();
        assert_eq!(stream.len(), PAGE_SIZE as u64 + 10);
        stream.flush().unwrap();
        assert_eq!(buffer.raw().len(), PAGE_SIZE + 10);

        // Extending again exposes zeros, not the old tail.
        stream.set_len(2 * PAGE_SIZE as u64).unwrap();
        assert_eq!(stream.byte_at(PAGE_SIZE as u64 + 10).unwrap(), 0);
        assert_eq!(
            stream.byte_at(PAGE_SIZE as u64 + 9).unwrap(),
            pattern(PAGE_SIZE + 10)[PAGE_SIZE + 9]
        );
    }

    #[test]
    fn seeking_past_end_is_refused() {
        let mut stream = CachedStream::new(Box::new(Cursor::new(vec![0u8; 10])), PAGE_SIZE).unwrap();
        assert!(stream.set_position(10).is_ok());
        assert!(matches!(
            stream.set_position(11),
            Err(DbError::PositionOutOfRange { position: 11, length: 10 })
        ));
        assert!(stream.seek(SeekFrom::End(1)).is_err());
        assert!(stream.byte_at(10).is_err());

        // Writing at the end extends.
        stream.seek(SeekFrom::End(0)).unwrap();
        stream.write_all(b"abc").unwrap();
        assert_eq!(stream.len(), 13);
        assert_eq!(stream.byte_at(12).unwrap(), b'c');
    }

    #[test]
    fn shared_cache_writes_back_other_streams_pages() {
        let cache = SharedPageCache::new(2 * PAGE_SIZE);
        let a_buf = SharedBuffer::default();
        let b_buf = SharedBuffer::default();
        let mut a = CachedStream::shared(Box::new(a_buf.clone()), &cache).unwrap();
        let mut b = CachedStream::shared(Box::new(b_buf.clone()), &cache).unwrap();

        a.write_at(0, &[1u8; 100]).unwrap();
        b.write_at(0, &pattern(2 * PAGE_SIZE)).unwrap();
        // b's second page pushed a's only page out, through a's own backing stream.
        assert_eq!(a_buf.raw(), vec![1u8; 100]);
        assert_eq!(a.byte_at(99).unwrap(), 1);
        assert!(cache.cached_pages() <= 2);
    }
}
