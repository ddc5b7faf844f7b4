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

//! A slotted heap of variable length payloads over a cached stream.
//!
//! The file begins with a fixed header, followed by slots laid end to end. Each slot has a small
//! header (marker, capacity, length) and `capacity` bytes of payload room. Freed slots are
//! chained through the first eight bytes of their payload room into a free list whose head lives
//! in the file header; allocation reuses the first free slot large enough.

use binary_layout::define_layout;
use tracing::{debug, warn};

use crate::paging::CachedStream;
use crate::{Corruption, DbError};

define_layout!(heap_header, LittleEndian, {
    magic_marker: u32,
    format: u32,
    free_head: u64,
    live_slots: u64,
    total_slots: u64,
});

define_layout!(slot_header, LittleEndian, {
    marker: u8,
    capacity: u32,
    length: u32,
});

const HEAP_MAGIC: u32 = 0x5054_4850;
const HEAP_FORMAT: u32 = 2;
const LIVE_MARKER: u8 = 0xA7;
const FREE_MARKER: u8 = 0x7A;
const MIN_CAPACITY: u32 = 16;

fn header_size() -> u64 {
    heap_header::SIZE.unwrap_or(32) as u64
}

fn slot_header_size() -> u64 {
    slot_header::SIZE.unwrap_or(9) as u64
}

fn capacity_for(length: usize) -> u32 {
    let length = (length as u32).max(MIN_CAPACITY);
    length.div_ceil(16) * 16
}

#[derive(Debug, Copy, Clone)]
struct SlotInfo {
    marker: u8,
    capacity: u32,
    length: u32,
}

/// Where a scan stopped early because a slot header made no sense.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ScanOutcome {
    pub(crate) live: u64,
    pub(crate) truncated_at: Option<u64>,
}

pub(crate) struct SlotHeap {
    file: String,
    stream: CachedStream,
    free_head: u64,
    live_slots: u64,
    total_slots: u64,
}

impl SlotHeap {
    /// Open (initializing if empty) the heap held in `stream`. `file` names it in errors.
    pub(crate) fn open(mut stream: CachedStream, file: String) -> Result<Self, DbError> {
        if stream.is_empty() {
            let mut heap = Self {
                file,
                stream,
                free_head: 0,
                live_slots: 0,
                total_slots: 0,
            };
            heap.write_header()?;
            return Ok(heap);
        }
        let mut buf = vec![0u8; header_size() as usize];
        stream
            .read_exact_at(0, &mut buf)
            .map_err(|_| corrupt(&file, 0, Corruption::BadHeader))?;
        let header = heap_header::View::new(buf.as_slice());
        if header.magic_marker().read() != HEAP_MAGIC || header.format().read() != HEAP_FORMAT {
            return Err(corrupt(&file, 0, Corruption::BadHeader));
        }
        Ok(Self {
            free_head: header.free_head().read(),
            live_slots: header.live_slots().read(),
            total_slots: header.total_slots().read(),
            file,
            stream,
        })
    }

    pub(crate) fn file(&self) -> &str {
        &self.file
    }

    pub(crate) fn live_slots(&self) -> u64 {
        self.live_slots
    }

    pub(crate) fn total_slots(&self) -> u64 {
        self.total_slots
    }

    fn write_header(&mut self) -> Result<(), DbError> {
        let mut buf = vec![0u8; header_size() as usize];
        let mut header = heap_header::View::new(buf.as_mut_slice());
        header.magic_marker_mut().write(HEAP_MAGIC);
        header.format_mut().write(HEAP_FORMAT);
        header.free_head_mut().write(self.free_head);
        header.live_slots_mut().write(self.live_slots);
        header.total_slots_mut().write(self.total_slots);
        self.stream.write_at(0, &buf)
    }

    fn slot_info(&mut self, offset: u64) -> Result<SlotInfo, DbError> {
        if offset < header_size() || offset + slot_header_size() > self.stream.len() {
            return Err(corrupt(&self.file, offset, Corruption::BadSlotHeader));
        }
        let mut buf = vec![0u8; slot_header_size() as usize];
        self.stream.read_exact_at(offset, &mut buf)?;
        let view = slot_header::View::new(buf.as_slice());
        let info = SlotInfo {
            marker: view.marker().read(),
            capacity: view.capacity().read(),
            length: view.length().read(),
        };
        let end = offset + slot_header_size() + u64::from(info.capacity);
        if (info.marker != LIVE_MARKER && info.marker != FREE_MARKER)
            || info.length > info.capacity
            || end > self.stream.len()
        {
            return Err(corrupt(&self.file, offset, Corruption::BadSlotHeader));
        }
        Ok(info)
    }

    fn write_slot_header(&mut self, offset: u64, info: SlotInfo) -> Result<(), DbError> {
        let mut buf = vec![0u8; slot_header_size() as usize];
        let mut view = slot_header::View::new(buf.as_mut_slice());
        view.marker_mut().write(info.marker);
        view.capacity_mut().write(info.capacity);
        view.length_mut().write(info.length);
        self.stream.write_at(offset, &buf)
    }

    fn next_free(&mut self, offset: u64) -> Result<u64, DbError> {
        let mut buf = [0u8; 8];
        self.stream
            .read_exact_at(offset + slot_header_size(), &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn set_next_free(&mut self, offset: u64, next: u64) -> Result<(), DbError> {
        self.stream
            .write_at(offset + slot_header_size(), &next.to_le_bytes())
    }

    /// Store `payload` in a new slot and return its offset.
    pub(crate) fn allocate(&mut self, payload: &[u8]) -> Result<u64, DbError> {
        let mut prev = 0u64;
        let mut cursor = self.free_head;
        let mut visited = 0u64;
        while cursor != 0 {
            // A free list longer than the heap has a cycle in it.
            visited += 1;
            if visited > self.total_slots {
                return Err(corrupt(&self.file, cursor, Corruption::BadFreeList));
            }
            let info = self.slot_info(cursor)?;
            if info.marker != FREE_MARKER {
                return Err(corrupt(&self.file, cursor, Corruption::BadSlotHeader));
            }
            let next = self.next_free(cursor)?;
            if info.capacity as usize >= payload.len() {
                if prev == 0 {
                    self.free_head = next;
                } else {
                    self.set_next_free(prev, next)?;
                }
                self.fill_slot(cursor, info.capacity, payload)?;
                self.live_slots += 1;
                self.write_header()?;
                return Ok(cursor);
            }
            prev = cursor;
            cursor = next;
        }

        let offset = self.stream.len().max(header_size());
        let capacity = capacity_for(payload.len());
        self.fill_slot(offset, capacity, payload)?;
        let end = offset + slot_header_size() + u64::from(capacity);
        if self.stream.len() < end {
            // Zero the unused tail of the slot so the file length covers the full capacity.
            let tail = end - self.stream.len();
            self.stream
                .write_at(self.stream.len(), &vec![0u8; tail as usize])?;
        }
        self.live_slots += 1;
        self.total_slots += 1;
        self.write_header()?;
        Ok(offset)
    }

    fn fill_slot(&mut self, offset: u64, capacity: u32, payload: &[u8]) -> Result<(), DbError> {
        self.write_slot_header(
            offset,
            SlotInfo {
                marker: LIVE_MARKER,
                capacity,
                length: payload.len() as u32,
            },
        )?;
        self.stream
            .write_at(offset + slot_header_size(), payload)
    }

    /// The payload at `offset`, or `None` if that slot has been freed.
    pub(crate) fn read(&mut self, offset: u64) -> Result<Option<Vec<u8>>, DbError> {
        let info = self.slot_info(offset)?;
        if info.marker == FREE_MARKER {
            return Ok(None);
        }
        let mut payload = vec![0u8; info.length as usize];
        self.stream
            .read_exact_at(offset + slot_header_size(), &mut payload)?;
        Ok(Some(payload))
    }

    /// Replace the payload at `offset`. Returns the (possibly new) offset of the payload.
    pub(crate) fn rewrite(&mut self, offset: u64, payload: &[u8]) -> Result<u64, DbError> {
        let info = self.slot_info(offset)?;
        if info.marker != LIVE_MARKER {
            return Err(corrupt(&self.file, offset, Corruption::BadSlotHeader));
        }
        if payload.len() <= info.capacity as usize {
            self.fill_slot(offset, info.capacity, payload)?;
            return Ok(offset);
        }
        self.free(offset)?;
        self.allocate(payload)
    }

    /// Release the slot at `offset` onto the free list.
    pub(crate) fn free(&mut self, offset: u64) -> Result<(), DbError> {
        let info = self.slot_info(offset)?;
        if info.marker == FREE_MARKER {
            warn!(file = self.file, offset, "slot freed twice");
            return Ok(());
        }
        self.write_slot_header(
            offset,
            SlotInfo {
                marker: FREE_MARKER,
                capacity: info.capacity,
                length: 0,
            },
        )?;
        self.set_next_free(offset, self.free_head)?;
        self.free_head = offset;
        self.live_slots = self.live_slots.saturating_sub(1);
        self.write_header()
    }

    /// Visit every live slot in file order. A slot header that fails its sanity checks ends the
    /// scan; its offset is reported so the caller can decide to truncate the torn tail.
    pub(crate) fn scan(
        &mut self,
        mut visitor: impl FnMut(u64, &[u8]) -> Result<(), DbError>,
    ) -> Result<ScanOutcome, DbError> {
        let mut outcome = ScanOutcome::default();
        let mut offset = header_size();
        while offset < self.stream.len() {
            let info = match self.slot_info(offset) {
                Ok(info) => info,
                Err(e) if e.is_corruption() => {
                    warn!(file = self.file, offset, "heap scan stopped at damaged slot");
                    outcome.truncated_at = Some(offset);
                    break;
                }
                Err(e) => return Err(e),
            };
            if info.marker == LIVE_MARKER {
                let mut payload = vec![0u8; info.length as usize];
                self.stream
                    .read_exact_at(offset + slot_header_size(), &mut payload)?;
                visitor(offset, &payload)?;
                outcome.live += 1;
            }
            offset += slot_header_size() + u64::from(info.capacity);
        }
        Ok(outcome)
    }

    /// Recompute the free list and the slot counters from the slots themselves.
    pub(crate) fn rebuild_free_list(&mut self) -> Result<(), DbError> {
        let mut free = vec![];
        let mut live = 0;
        let mut total = 0;
        let mut offset = header_size();
        while offset < self.stream.len() {
            let info = self.slot_info(offset)?;
            if info.marker == FREE_MARKER {
                free.push(offset);
            } else {
                live += 1;
            }
            total += 1;
            offset += slot_header_size() + u64::from(info.capacity);
        }
        let mut head = 0;
        for offset in free.iter().rev() {
            self.set_next_free(*offset, head)?;
            head = *offset;
        }
        debug!(file = self.file, live, total, free = free.len(), "rebuilt free list");
        self.free_head = head;
        self.live_slots = live;
        self.total_slots = total;
        self.write_header()
    }

    /// Cut the heap off at `offset`, discarding a damaged tail.
    pub(crate) fn truncate(&mut self, offset: u64) -> Result<(), DbError> {
        self.stream.set_len(offset.max(header_size()))
    }

    pub(crate) fn flush(&mut self) -> Result<(), DbError> {
        self.stream.flush()
    }

    pub(crate) fn sync(&mut self) -> Result<(), DbError> {
        self.stream.sync()
    }
}

fn corrupt(file: &str, offset: u64, kind: Corruption) -> DbError {
    DbError::DataCorrupted {
        file: file.to_string(),
        offset,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PAGE_SIZE;
    use std::io::Cursor;

    fn heap() -> SlotHeap {
        let stream = CachedStream::new(Box::new(Cursor::new(vec![])), 4 * PAGE_SIZE).unwrap();
        SlotHeap::open(stream, "test.dat".into()).unwrap()
    }

    #[test]
    fn allocate_read_free_reuse() {
        let mut heap = heap();
        let a = heap.allocate(b"first record").unwrap();
        let b = heap.allocate(&[7u8; 100]).unwrap();
        assert_eq!(heap.read(a).unwrap().unwrap(), b"first record");
        assert_eq!(heap.read(b).unwrap().unwrap(), vec![7u8; 100]);
        assert_eq!(heap.live_slots(), 2);

        heap.free(a).unwrap();
        assert_eq!(heap.read(a).unwrap(), None);
        assert_eq!(heap.live_slots(), 1);

        // Too big for the freed slot: appended.
        let c = heap.allocate(&[1u8; 64]).unwrap();
        assert!(c > b);
        // Fits: reuses the first freed slot.
        let d = heap.allocate(b"tiny").unwrap();
        assert_eq!(d, a);
        assert_eq!(heap.total_slots(), 3);
    }

    #[test]
    fn rewrite_in_place_or_moves() {
        let mut heap = heap();
        let a = heap.allocate(b"0123456789").unwrap();
        let _b = heap.allocate(b"neighbour").unwrap();
        assert_eq!(heap.rewrite(a, b"short").unwrap(), a);
        assert_eq!(heap.read(a).unwrap().unwrap(), b"short");

        let moved = heap.rewrite(a, &[9u8; 200]).unwrap();
        assert_ne!(moved, a);
        assert_eq!(heap.read(a).unwrap(), None);
        assert_eq!(heap.read(moved).unwrap().unwrap(), vec![9u8; 200]);
    }

    #[test]
    fn scan_stops_at_damaged_tail() {
        let mut heap = heap();
        heap.allocate(b"one").unwrap();
        let two = heap.allocate(b"two").unwrap();
        heap.allocate(b"three").unwrap();
        heap.free(two).unwrap();

        // Scribble a bogus slot header after the last good slot.
        let end = heap.stream.len();
        heap.stream.write_at(end, &[0x11; 12]).unwrap();

        let mut seen = vec![];
        let outcome = heap
            .scan(|_, payload| {
                seen.push(payload.to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(outcome.truncated_at, Some(end));

        heap.truncate(end).unwrap();
        heap.rebuild_free_list().unwrap();
        assert_eq!(heap.live_slots(), 2);
        assert_eq!(heap.total_slots(), 3);
        assert_eq!(heap.allocate(b"2").unwrap(), two);
    }

    #[test]
    fn cyclic_free_list_is_reported() {
        let mut heap = heap();
        let a = heap.allocate(b"aa").unwrap();
        let b = heap.allocate(b"bb").unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        // b -> a -> b
        heap.set_next_free(a, b).unwrap();

        assert!(matches!(
            heap.allocate(&[3u8; 500]),
            Err(DbError::DataCorrupted { kind: Corruption::BadFreeList, .. })
        ));
        heap.rebuild_free_list().unwrap();
        let c = heap.allocate(&[3u8; 500]).unwrap();
        assert_eq!(heap.read(c).unwrap().unwrap(), vec![3u8; 500]);
    }

    #[test]
    fn damaged_heap_header_is_reported() {
        let backing = Cursor::new(vec![]);
        let mut stream = CachedStream::new(Box::new(backing), PAGE_SIZE).unwrap();
        stream.write_at(0, &[0u8; 4]).unwrap();
        assert!(matches!(
            SlotHeap::open(stream, "bad.dat".into()),
            Err(DbError::DataCorrupted { kind: Corruption::BadHeader, .. })
        ));
    }
}
