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

use std::io::SeekFrom;

use crate::paging::{BackingStream, PAGE_SIZE};

/// A fixed-size window over a backing stream at a page-aligned offset.
///
/// Once loaded, the page's bytes are authoritative over the stream's. Bytes past `size` are
/// always zero, so a page that only partially covers the stream reads like a zero-extended one.
pub struct CachedPage {
    offset: u64,
    size: usize,
    dirty: bool,
    data: Box<[u8]>,
}

impl CachedPage {
    /// Fault the page at `offset` in from the stream. Reading past the end of the stream
    /// produces a short (possibly empty) page.
    pub(crate) fn load(stream: &mut dyn BackingStream, offset: u64) -> std::io::Result<Self> {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let stream_len = stream.stream_len()?;
        let mut size = 0;
        if offset < stream_len {
            let want = ((stream_len - offset) as usize).min(PAGE_SIZE);
            stream.seek(SeekFrom::Start(offset))?;
            while size < want {
                let n = stream.read(&mut data[size..want])?;
                if n == 0 {
                    break;
                }
                size += n;
            }
        }
        Ok(Self {
            offset,
            size,
            dirty: false,
            data,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of valid bytes held by the page.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The valid bytes of the page.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Copy out of the page starting at page-relative `at`. Returns the number of bytes copied.
    pub(crate) fn read(&self, at: usize, buf: &mut [u8]) -> usize {
        let n = buf.len().min(PAGE_SIZE - at);
        buf[..n].copy_from_slice(&self.data[at..at + n]);
        n
    }

    /// Copy into the page at page-relative `at`, growing its valid size as needed.
    pub(crate) fn write(&mut self, at: usize, buf: &[u8]) -> usize {
        let n = buf.len().min(PAGE_SIZE - at);
        self.data[at..at + n].copy_from_slice(&buf[..n]);
        self.size = self.size.max(at + n);
        self.dirty = true;
        n
    }

    /// Shrink the valid region to `size` bytes; the cut-off tail is zeroed.
    pub(crate) fn shrink(&mut self, size: usize) {
        if size >= self.size {
            return;
        }
        self.data[size..].fill(0);
        self.size = size;
        self.dirty = true;
    }

    /// Write the page's valid bytes back to the stream at its offset.
    pub(crate) fn save(&mut self, stream: &mut dyn BackingStream) -> std::io::Result<()> {
        stream.seek(SeekFrom::Start(self.offset))?;
        stream.write_all(&self.data[..self.size])?;
        self.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPage")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn load_short_page_at_end_of_stream() {
        let mut stream = Cursor::new(vec![1u8; PAGE_SIZE + 10]);
        let page = CachedPage::load(&mut stream, PAGE_SIZE as u64).unwrap();
        assert_eq!(page.size(), 10);
        assert!(!page.is_dirty());
        assert_eq!(page.bytes(), &[1u8; 10]);

        let empty = CachedPage::load(&mut stream, 4 * PAGE_SIZE as u64).unwrap();
        assert_eq!(empty.size(), 0);
    }

    #[test]
    fn write_extends_and_shrink_zeroes() {
        let mut stream = Cursor::new(vec![]);
        let mut page = CachedPage::load(&mut stream, 0).unwrap();
        page.write(100, &[9, 9, 9]);
        assert_eq!(page.size(), 103);
        assert!(page.is_dirty());

        page.save(&mut stream).unwrap();
        assert!(!page.is_dirty());
        assert_eq!(stream.get_ref().len(), 103);

        page.shrink(101);
        let mut out = [0u8; 3];
        page.read(100, &mut out);
        assert_eq!(out, [9, 0, 0]);
        assert!(page.is_dirty());
    }
}
