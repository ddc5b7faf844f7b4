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


//! Paged B+tree indexes over a `CachedStream`.
//!
//! Page 0 of an index file holds the header and every later page holds one node. Leaves keep
//! their entries in order and are chained left to right. An interior node routes by whole
//! entries: separator `i` is the smallest entry anywhere under child `i + 1`.
//!
//! Removal never merges nodes, so leaves only thin out until `compact` repacks the tree.
//! String key parts longer than the index's clip limit are stored truncated; lookups built on
//! a clipped key return a superset the caller has to confirm against the records.

use binary_layout::define_layout;
use tracing::{debug, trace};

use crate::DbError;
use crate::codec::{ByteReader, ByteWriter, ReadError};
use crate::index::{IndexDef, IndexEntry};
use crate::paging::{CachedStream, PAGE_SIZE};
use crate::values::KeyValue;

define_layout!(index_header, LittleEndian, {
    magic_marker: u32,
    format: u16,
    arity: u16,
    has_value: u8,
    root: u32,
    pages: u32,
    leaves: u32,
    count: u64,
    live_bytes: u64,
});

define_layout!(node_header, LittleEndian, {
    kind: u8,
    count: u16,
    next: u32,
});

const INDEX_MAGIC: u32 = 0x5850_5449;
const ID_INDEX_MAGIC: u32 = 0x4B50_5450;
const INDEX_FORMAT: u16 = 2;

const LEAF: u8 = 1;
const INTERIOR: u8 = 2;

/// Record id and heap offset, carried by every entry.
const ENTRY_FIXED_BYTES: usize = 12;
/// How full bulk loads and compaction pack each node.
const FILL_PERCENT: usize = 90;
/// Leaves averaging less than this are worth repacking.
const MIN_FILL_PERCENT: u64 = 50;

fn header_size() -> usize {
    index_header::SIZE.unwrap_or(37)
}

fn node_header_size() -> usize {
    node_header::SIZE.unwrap_or(7)
}

fn node_capacity() -> usize {
    PAGE_SIZE - node_header_size()
}

/// Largest encoded entry; four always fit in one node.
fn max_entry_bytes() -> usize {
    node_capacity() / 4 - 8
}

fn fill_limit() -> usize {
    node_capacity() * FILL_PERCENT / 100
}

fn page_offset(page: u32) -> u64 {
    u64::from(page) * PAGE_SIZE as u64
}

fn entry_size(entry: &IndexEntry) -> usize {
    entry.key.iter().map(KeyValue::encoded_len).sum::<usize>()
        + entry.value.as_ref().map_or(0, KeyValue::encoded_len)
        + ENTRY_FIXED_BYTES
}

fn leaf_bytes(entries: &[IndexEntry]) -> usize {
    entries.iter().map(entry_size).sum()
}

fn interior_bytes(separators: &[IndexEntry]) -> usize {
    4 + separators.iter().map(|s| entry_size(s) + 4).sum::<usize>()
}

/// Where to cut a run of items so that both sides are non-empty and hold about half the bytes.
fn split_point(sizes: &[usize]) -> usize {
    let half = sizes.iter().sum::<usize>() / 2;
    let mut running = 0;
    let at = sizes
        .iter()
        .position(|s| {
            running += s;
            running >= half
        })
        .map_or(1, |i| i + 1);
    at.clamp(1, sizes.len().saturating_sub(1).max(1))
}

fn clip(part: &KeyValue, limit: usize) -> KeyValue {
    match part {
        KeyValue::String(s) if s.len() > limit => {
            let mut end = limit;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            KeyValue::String(s[..end].to_string())
        }
        other => other.clone(),
    }
}

fn clip_entry(entry: IndexEntry, limit: usize) -> IndexEntry {
    IndexEntry {
        key: entry.key.iter().map(|k| clip(k, limit)).collect(),
        value: entry.value.as_ref().map(|v| clip(v, limit)),
        ..entry
    }
}

/// Failure decoding an index page; the caller turns this into `IndexIsCorrupted`.
struct Malformed;

impl From<ReadError> for Malformed {
    fn from(_: ReadError) -> Self {
        Malformed
    }
}

/// What every entry of one index looks like.
#[derive(Debug, Clone, Copy)]
struct Shape {
    arity: usize,
    has_value: bool,
    /// Longest string part stored unclipped, in bytes.
    limit: usize,
}

impl Shape {
    fn of(def: &IndexDef) -> Self {
        let arity = def.columns.len();
        let has_value = def.value_column.is_some();
        let parts = (arity + usize::from(has_value)).max(1);
        // Budgeted as if every part were a string: tag, length prefix and bytes.
        let budget = max_entry_bytes().saturating_sub(ENTRY_FIXED_BYTES + parts * 5);
        Self {
            arity,
            has_value,
            limit: (budget / parts).max(16),
        }
    }
}

fn encode_entry(w: &mut ByteWriter, entry: &IndexEntry) {
    for part in &entry.key {
        part.encode(w);
    }
    if let Some(value) = &entry.value {
        value.encode(w);
    }
    w.i32(entry.id);
    w.u64(entry.offset);
}

fn decode_entry(r: &mut ByteReader, shape: Shape) -> Result<IndexEntry, Malformed> {
    let mut key = Vec::with_capacity(shape.arity);
    for _ in 0..shape.arity {
        key.push(KeyValue::decode(r)?);
    }
    let value = if shape.has_value {
        Some(KeyValue::decode(r)?)
    } else {
        None
    };
    let id = r.i32()?;
    let offset = r.u64()?;
    Ok(IndexEntry {
        key,
        value,
        offset,
        id,
    })
}

enum Node {
    /// `next` is the right sibling, 0 for the last leaf.
    Leaf { entries: Vec<IndexEntry>, next: u32 },
    Interior {
        children: Vec<u32>,
        separators: Vec<IndexEntry>,
    },
}

impl Node {
    /// One full page.
    fn encode(&self) -> Vec<u8> {
        let mut header = vec![0u8; node_header_size()];
        let mut view = node_header::View::new(header.as_mut_slice());
        let mut body = ByteWriter::with_capacity(PAGE_SIZE);
        match self {
            Node::Leaf { entries, next } => {
                view.kind_mut().write(LEAF);
                view.count_mut().write(entries.len() as u16);
                view.next_mut().write(*next);
                for entry in entries {
                    encode_entry(&mut body, entry);
                }
            }
            Node::Interior {
                children,
                separators,
            } => {
                view.kind_mut().write(INTERIOR);
                view.count_mut().write(separators.len() as u16);
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        encode_entry(&mut body, &separators[i - 1]);
                    }
                    body.u32(*child);
                }
            }
        }
        let mut page = ByteWriter::with_capacity(PAGE_SIZE);
        page.raw(&header);
        page.raw(&body.into_inner());
        let mut page = page.into_inner();
        page.resize(PAGE_SIZE, 0);
        page
    }

    /// Decode a page, checking that every page it points at lies within `1..=pages`.
    fn decode(bytes: &[u8], shape: Shape, pages: u32) -> Result<Node, Malformed> {
        if bytes.len() < PAGE_SIZE {
            return Err(Malformed);
        }
        let (head, body) = bytes.split_at(node_header_size());
        let header = node_header::View::new(head);
        let count = usize::from(header.count().read());
        let in_range = |page: u32| (1..=pages).contains(&page);
        let mut r = ByteReader::new(body);
        match header.kind().read() {
            LEAF => {
                let next = header.next().read();
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(decode_entry(&mut r, shape)?);
                }
                if (next != 0 && !in_range(next)) || !entries.is_sorted() {
                    return Err(Malformed);
                }
                Ok(Node::Leaf { entries, next })
            }
            INTERIOR => {
                let mut children = Vec::with_capacity(count + 1);
                let mut separators = Vec::with_capacity(count);
                children.push(r.u32()?);
                for _ in 0..count {
                    separators.push(decode_entry(&mut r, shape)?);
                    children.push(r.u32()?);
                }
                if !children.iter().all(|c| in_range(*c)) || !separators.is_sorted() {
                    return Err(Malformed);
                }
                Ok(Node::Interior {
                    children,
                    separators,
                })
            }
            _ => Err(Malformed),
        }
    }
}

/// The leaf an entry belongs in, and the interior pages (with the child slot taken) above it.
struct Descent {
    page: u32,
    entries: Vec<IndexEntry>,
    next: u32,
    path: Vec<(u32, usize)>,
}

/// Shape of a freshly packed tree.
struct Packed {
    root: u32,
    pages: u32,
    leaves: u32,
    count: u64,
    live_bytes: u64,
}

/// Writes a packed tree from entries arriving in order, bottom level first. Page numbers are
/// the ones the nodes will finally have; each page is written `shift` pages further on.
struct Packer {
    shift: u32,
    next_page: u32,
    pending: Vec<IndexEntry>,
    pending_bytes: usize,
    /// First entry and page of every node written on the level being built.
    firsts: Vec<(IndexEntry, u32)>,
    count: u64,
    live_bytes: u64,
}

impl Packer {
    fn new(shift: u32) -> Self {
        Self {
            shift,
            next_page: 1,
            pending: vec![],
            pending_bytes: 0,
            firsts: vec![],
            count: 0,
            live_bytes: 0,
        }
    }

    fn write(&mut self, stream: &mut CachedStream, node: &Node) -> Result<u32, DbError> {
        let page = self.next_page;
        stream.write_at(page_offset(page + self.shift), &node.encode())?;
        self.next_page += 1;
        Ok(page)
    }

    fn write_leaf(&mut self, stream: &mut CachedStream, next: u32) -> Result<(), DbError> {
        let entries = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        let first = entries.first().cloned();
        let page = self.write(stream, &Node::Leaf { entries, next })?;
        if let Some(first) = first {
            self.firsts.push((first, page));
        }
        Ok(())
    }

    fn push(&mut self, stream: &mut CachedStream, entry: IndexEntry) -> Result<(), DbError> {
        let size = entry_size(&entry);
        if !self.pending.is_empty() && self.pending_bytes + size > fill_limit() {
            let next = self.next_page + 1;
            self.write_leaf(stream, next)?;
        }
        self.pending_bytes += size;
        self.live_bytes += size as u64;
        self.count += 1;
        self.pending.push(entry);
        Ok(())
    }

    fn write_interior(
        &mut self,
        stream: &mut CachedStream,
        group: Vec<(IndexEntry, u32)>,
    ) -> Result<Option<(IndexEntry, u32)>, DbError> {
        let children = group.iter().map(|(_, page)| *page).collect();
        let mut entries = group.into_iter().map(|(entry, _)| entry);
        let first = entries.next();
        let separators = entries.collect();
        let page = self.write(
            stream,
            &Node::Interior {
                children,
                separators,
            },
        )?;
        Ok(first.map(|first| (first, page)))
    }

    fn finish(mut self, stream: &mut CachedStream) -> Result<Packed, DbError> {
        self.write_leaf(stream, 0)?;
        let leaves = self.next_page - 1;
        let mut level = std::mem::take(&mut self.firsts);
        while level.len() > 1 {
            let mut parents = vec![];
            let mut group = vec![];
            let mut bytes = 4;
            for (first, page) in level {
                let size = entry_size(&first) + 4;
                if group.len() > 1 && bytes + size > fill_limit() {
                    parents.extend(self.write_interior(stream, std::mem::take(&mut group))?);
                    bytes = 4;
                }
                bytes += size;
                group.push((first, page));
            }
            parents.extend(self.write_interior(stream, group)?);
            level = parents;
        }
        Ok(Packed {
            root: level.first().map_or(1, |(_, page)| *page),
            pages: self.next_page - 1,
            leaves,
            count: self.count,
            live_bytes: self.live_bytes,
        })
    }
}

/// A secondary index over one table.
pub(crate) struct BTreeIndex {
    def: IndexDef,
    table: String,
    magic: u32,
    shape: Shape,
    stream: CachedStream,
    root: u32,
    /// Node pages, not counting the header page.
    pages: u32,
    leaves: u32,
    count: u64,
    /// Encoded bytes of all entries.
    live_bytes: u64,
    /// The header differs from what was last saved.
    dirty: bool,
}

impl BTreeIndex {
    /// Open the index persisted in `stream`. An empty stream is an empty index.
    pub(crate) fn load(def: IndexDef, table: &str, stream: CachedStream) -> Result<Self, DbError> {
        Self::open(def, table, stream, INDEX_MAGIC)
    }

    fn open(def: IndexDef, table: &str, stream: CachedStream, magic: u32) -> Result<Self, DbError> {
        let mut index = Self {
            shape: Shape::of(&def),
            def,
            table: table.to_string(),
            magic,
            stream,
            root: 1,
            pages: 0,
            leaves: 0,
            count: 0,
            live_bytes: 0,
            dirty: false,
        };
        if index.stream.is_empty() {
            index.clear()?;
            return Ok(index);
        }
        index.read_header()?;
        index.read_node(index.root)?;
        trace!(
            table,
            index = index.def.name,
            entries = index.count,
            pages = index.pages,
            "opened index"
        );
        Ok(index)
    }

    fn corrupted(&self) -> DbError {
        DbError::IndexIsCorrupted {
            table: self.table.clone(),
            index: self.def.name.clone(),
        }
    }

    fn read_header(&mut self) -> Result<(), DbError> {
        if self.stream.len() < PAGE_SIZE as u64 {
            return Err(self.corrupted());
        }
        let mut buf = vec![0u8; header_size()];
        self.stream.read_exact_at(0, &mut buf)?;
        let header = index_header::View::new(buf.as_slice());
        let pages = header.pages().read();
        let root = header.root().read();
        let leaves = header.leaves().read();
        let consistent = header.magic_marker().read() == self.magic
            && header.format().read() == INDEX_FORMAT
            && usize::from(header.arity().read()) == self.shape.arity
            && (header.has_value().read() != 0) == self.shape.has_value
            && (1..=pages).contains(&root)
            && (1..=pages).contains(&leaves)
            && self.stream.len() == (u64::from(pages) + 1) * PAGE_SIZE as u64;
        if !consistent {
            return Err(self.corrupted());
        }
        self.root = root;
        self.pages = pages;
        self.leaves = leaves;
        self.count = header.count().read();
        self.live_bytes = header.live_bytes().read();
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), DbError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = index_header::View::new(&mut buf[..header_size()]);
        header.magic_marker_mut().write(self.magic);
        header.format_mut().write(INDEX_FORMAT);
        header.arity_mut().write(self.shape.arity as u16);
        header.has_value_mut().write(u8::from(self.shape.has_value));
        header.root_mut().write(self.root);
        header.pages_mut().write(self.pages);
        header.leaves_mut().write(self.leaves);
        header.count_mut().write(self.count);
        header.live_bytes_mut().write(self.live_bytes);
        self.stream.write_at(0, &buf)
    }

    fn read_node(&mut self, page: u32) -> Result<Node, DbError> {
        let (shape, pages) = (self.shape, self.pages);
        if !(1..=pages).contains(&page) {
            return Err(self.corrupted());
        }
        match self
            .stream
            .with_page(page_offset(page), |p| Node::decode(p.bytes(), shape, pages))?
        {
            Ok(node) => Ok(node),
            Err(Malformed) => Err(self.corrupted()),
        }
    }

    fn read_leaf(&mut self, page: u32) -> Result<(Vec<IndexEntry>, u32), DbError> {
        match self.read_node(page)? {
            Node::Leaf { entries, next } => Ok((entries, next)),
            Node::Interior { .. } => Err(self.corrupted()),
        }
    }

    fn read_interior(&mut self, page: u32) -> Result<(Vec<u32>, Vec<IndexEntry>), DbError> {
        match self.read_node(page)? {
            Node::Interior {
                children,
                separators,
            } => Ok((children, separators)),
            Node::Leaf { .. } => Err(self.corrupted()),
        }
    }

    fn write_node(&mut self, page: u32, node: &Node) -> Result<(), DbError> {
        self.stream.write_at(page_offset(page), &node.encode())
    }

    fn append_node(&mut self, node: &Node) -> Result<u32, DbError> {
        let page = self.pages + 1;
        self.write_node(page, node)?;
        self.pages = page;
        Ok(page)
    }

    fn descend(&mut self, sought: &IndexEntry) -> Result<Descent, DbError> {
        let mut path = vec![];
        let mut page = self.root;
        loop {
            if path.len() > self.pages as usize {
                return Err(self.corrupted());
            }
            match self.read_node(page)? {
                Node::Interior {
                    children,
                    separators,
                } => {
                    let slot = separators.partition_point(|s| s <= sought);
                    path.push((page, slot));
                    page = children[slot];
                }
                Node::Leaf { entries, next } => {
                    return Ok(Descent {
                        page,
                        entries,
                        next,
                        path,
                    });
                }
            }
        }
    }

    pub(crate) fn def(&self) -> &IndexDef {
        &self.def
    }

    pub(crate) fn len(&self) -> usize {
        self.count as usize
    }

    #[cfg(test)]
    pub(crate) fn pages(&self) -> u32 {
        self.pages
    }

    /// Add `entry`. Returns false if it was already present.
    pub(crate) fn insert(&mut self, entry: IndexEntry) -> Result<bool, DbError> {
        let entry = clip_entry(entry, self.shape.limit);
        let Descent {
            page,
            mut entries,
            next,
            path,
        } = self.descend(&entry)?;
        let Err(at) = entries.binary_search(&entry) else {
            return Ok(false);
        };
        // Appending past the last leaf leaves the full node alone instead of halving it.
        let appending = at == entries.len() && next == 0;
        self.live_bytes += entry_size(&entry) as u64;
        self.count += 1;
        self.dirty = true;
        entries.insert(at, entry);
        if leaf_bytes(&entries) <= node_capacity() {
            self.write_node(page, &Node::Leaf { entries, next })?;
            return Ok(true);
        }

        let cut = if appending {
            entries.len() - 1
        } else {
            split_point(&entries.iter().map(entry_size).collect::<Vec<_>>())
        };
        let right = entries.split_off(cut);
        let separator = right[0].clone();
        let right_page = self.append_node(&Node::Leaf {
            entries: right,
            next,
        })?;
        self.write_node(
            page,
            &Node::Leaf {
                entries,
                next: right_page,
            },
        )?;
        self.leaves += 1;
        self.insert_separator(path, separator, right_page)?;
        Ok(true)
    }

    /// Hang `right` off the parent at the end of `path`, splitting upwards as needed.
    fn insert_separator(
        &mut self,
        mut path: Vec<(u32, usize)>,
        mut separator: IndexEntry,
        mut right: u32,
    ) -> Result<(), DbError> {
        while let Some((page, slot)) = path.pop() {
            let (mut children, mut separators) = self.read_interior(page)?;
            separators.insert(slot, separator);
            children.insert(slot + 1, right);
            if interior_bytes(&separators) <= node_capacity() {
                return self.write_node(
                    page,
                    &Node::Interior {
                        children,
                        separators,
                    },
                );
            }

            let sizes: Vec<usize> = separators.iter().map(|s| entry_size(s) + 4).collect();
            let mid = split_point(&sizes).min(separators.len() - 1);
            let right_separators = separators.split_off(mid + 1);
            let right_children = children.split_off(mid + 1);
            let Some(promoted) = separators.pop() else {
                return Err(self.corrupted());
            };
            right = self.append_node(&Node::Interior {
                children: right_children,
                separators: right_separators,
            })?;
            self.write_node(
                page,
                &Node::Interior {
                    children,
                    separators,
                },
            )?;
            separator = promoted;
        }
        let old_root = self.root;
        self.root = self.append_node(&Node::Interior {
            children: vec![old_root, right],
            separators: vec![separator],
        })?;
        trace!(table = self.table, index = self.def.name, root = self.root, "grew index");
        Ok(())
    }

    /// Remove `entry`. Returns false if it was not present.
    pub(crate) fn remove(&mut self, entry: &IndexEntry) -> Result<bool, DbError> {
        let entry = clip_entry(entry.clone(), self.shape.limit);
        let Descent {
            page,
            mut entries,
            next,
            ..
        } = self.descend(&entry)?;
        let Ok(at) = entries.binary_search(&entry) else {
            return Ok(false);
        };
        entries.remove(at);
        self.live_bytes = self.live_bytes.saturating_sub(entry_size(&entry) as u64);
        self.count = self.count.saturating_sub(1);
        self.dirty = true;
        self.write_node(page, &Node::Leaf { entries, next })?;
        Ok(true)
    }

    pub(crate) fn clear(&mut self) -> Result<(), DbError> {
        self.replace_all(vec![])
    }

    /// Replace the whole tree with a packed one holding `entries`.
    pub(crate) fn replace_all(&mut self, entries: Vec<IndexEntry>) -> Result<(), DbError> {
        let limit = self.shape.limit;
        let mut entries: Vec<IndexEntry> = entries.into_iter().map(|e| clip_entry(e, limit)).collect();
        entries.sort();
        entries.dedup();
        self.stream.set_len(0)?;
        self.stream.write_at(0, &vec![0u8; PAGE_SIZE])?;
        let mut packer = Packer::new(0);
        for entry in entries {
            packer.push(&mut self.stream, entry)?;
        }
        let packed = packer.finish(&mut self.stream)?;
        self.adopt(packed);
        self.write_header()
    }

    fn adopt(&mut self, packed: Packed) {
        self.root = packed.root;
        self.pages = packed.pages;
        self.leaves = packed.leaves;
        self.count = packed.count;
        self.live_bytes = packed.live_bytes;
        self.dirty = true;
    }

    /// Visit entries in order, starting at the first not below `from`, until `visit` says stop.
    fn scan_from(
        &mut self,
        from: &IndexEntry,
        mut visit: impl FnMut(&IndexEntry) -> bool,
    ) -> Result<(), DbError> {
        let Descent {
            entries, mut next, ..
        } = self.descend(from)?;
        let start = entries.partition_point(|e| e < from);
        for entry in &entries[start..] {
            if !visit(entry) {
                return Ok(());
            }
        }
        let mut hops = 0;
        while next != 0 {
            hops += 1;
            if hops > self.leaves {
                return Err(self.corrupted());
            }
            let (entries, following) = self.read_leaf(next)?;
            for entry in &entries {
                if !visit(entry) {
                    return Ok(());
                }
            }
            next = following;
        }
        Ok(())
    }

    /// Every entry, in index order.
    pub(crate) fn entries(&mut self) -> Result<Vec<IndexEntry>, DbError> {
        let mut out = Vec::with_capacity(self.len());
        self.scan_from(&IndexEntry::lower_bound(&[]), |e| {
            out.push(e.clone());
            true
        })?;
        Ok(out)
    }

    /// Entries whose key begins with `prefix`, in index order.
    pub(crate) fn seek_prefix(&mut self, prefix: &[KeyValue]) -> Result<Vec<IndexEntry>, DbError> {
        let prefix: Vec<KeyValue> = prefix.iter().map(|k| clip(k, self.shape.limit)).collect();
        let mut out = vec![];
        self.scan_from(&IndexEntry::lower_bound(&prefix), |e| {
            let matched = e.has_prefix(&prefix);
            if matched {
                out.push(e.clone());
            }
            matched
        })?;
        Ok(out)
    }

    /// Entries whose first key column lies within `[from, to]`; either bound may be open.
    pub(crate) fn range(
        &mut self,
        from: Option<&KeyValue>,
        to: Option<&KeyValue>,
    ) -> Result<Vec<IndexEntry>, DbError> {
        let limit = self.shape.limit;
        let lower = match from {
            Some(from) => IndexEntry::lower_bound(&[clip(from, limit)]),
            None => IndexEntry::lower_bound(&[]),
        };
        let to = to.map(|to| clip(to, limit));
        let mut out = vec![];
        self.scan_from(&lower, |e| {
            let inside = match (&to, e.key.first()) {
                (Some(to), Some(first)) => first <= to,
                _ => true,
            };
            if inside {
                out.push(e.clone());
            }
            inside
        })?;
        Ok(out)
    }

    /// True if no part of `keys` would be clipped, so lookups on them are exact.
    pub(crate) fn is_exact(&self, keys: &[KeyValue]) -> bool {
        keys.iter()
            .all(|k| !matches!(k, KeyValue::String(s) if s.len() > self.shape.limit))
    }

    /// True if `value`, as read back from an entry, may have lost its tail.
    pub(crate) fn may_be_clipped(&self, value: &KeyValue) -> bool {
        matches!(value, KeyValue::String(s) if s.len() + 3 >= self.shape.limit)
    }

    /// Write the header and every dirty page back.
    pub(crate) fn save(&mut self) -> Result<(), DbError> {
        if !self.dirty {
            return Ok(());
        }
        self.write_header()?;
        self.stream.flush()?;
        trace!(table = self.table, index = self.def.name, pages = self.pages, "saved index");
        self.dirty = false;
        Ok(())
    }

    /// True once the leaves are, on average, less than half full.
    pub(crate) fn is_fragmented(&self) -> bool {
        self.leaves > 1
            && self.live_bytes * 100
                < u64::from(self.leaves) * node_capacity() as u64 * MIN_FILL_PERCENT
    }

    /// Repack the tree into as few pages as it needs.
    ///
    /// The packed tree is first written past the current last page, numbered as it will finally
    /// sit, then moved down over the old nodes and the file cut to size.
    pub(crate) fn compact(&mut self) -> Result<(), DbError> {
        let before = self.pages;
        let mut packer = Packer::new(before);
        let mut page = self.descend(&IndexEntry::lower_bound(&[]))?.page;
        let mut hops = 0;
        loop {
            hops += 1;
            if hops > self.leaves {
                return Err(self.corrupted());
            }
            let (entries, next) = self.read_leaf(page)?;
            for entry in entries {
                packer.push(&mut self.stream, entry)?;
            }
            if next == 0 {
                break;
            }
            page = next;
        }
        let packed = packer.finish(&mut self.stream)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        for page in 1..=packed.pages {
            self.stream.read_exact_at(page_offset(page + before), &mut buf)?;
            self.stream.write_at(page_offset(page), &buf)?;
        }
        self.stream.set_len(page_offset(packed.pages + 1))?;
        debug!(
            table = self.table,
            index = self.def.name,
            before,
            after = packed.pages,
            "compacted index"
        );
        self.adopt(packed);
        self.save()
    }
}

fn id_entry(id: i32, offset: u64) -> IndexEntry {
    IndexEntry {
        key: vec![KeyValue::Int(id)],
        value: None,
        offset,
        id,
    }
}

/// Record id to heap offset, for every live record in a table: the same paged tree, keyed by
/// id alone.
pub(crate) struct IdIndex {
    tree: BTreeIndex,
}

impl IdIndex {
    pub(crate) fn load(table: &str, stream: CachedStream) -> Result<Self, DbError> {
        let def = IndexDef {
            name: "#id".to_string(),
            columns: vec![0],
            value_column: None,
        };
        Ok(Self {
            tree: BTreeIndex::open(def, table, stream, ID_INDEX_MAGIC)?,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn get(&mut self, id: i32) -> Result<Option<u64>, DbError> {
        Ok(self
            .tree
            .seek_prefix(&[KeyValue::Int(id)])?
            .first()
            .map(|e| e.offset))
    }

    pub(crate) fn insert(&mut self, id: i32, offset: u64) -> Result<(), DbError> {
        match self.get(id)? {
            Some(current) if current == offset => return Ok(()),
            Some(current) => {
                self.tree.remove(&id_entry(id, current))?;
            }
            None => {}
        }
        self.tree.insert(id_entry(id, offset))?;
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: i32) -> Result<Option<u64>, DbError> {
        let current = self.get(id)?;
        if let Some(offset) = current {
            self.tree.remove(&id_entry(id, offset))?;
        }
        Ok(current)
    }

    pub(crate) fn clear(&mut self) -> Result<(), DbError> {
        self.tree.clear()
    }

    pub(crate) fn replace_all(&mut self, rows: &[(i32, u64)]) -> Result<(), DbError> {
        self.tree
            .replace_all(rows.iter().map(|(id, offset)| id_entry(*id, *offset)).collect())
    }

    /// `(id, offset)` of every record, by id.
    pub(crate) fn rows(&mut self) -> Result<Vec<(i32, u64)>, DbError> {
        Ok(self
            .tree
            .entries()?
            .into_iter()
            .map(|e| (e.id, e.offset))
            .collect())
    }

    pub(crate) fn save(&mut self) -> Result<(), DbError> {
        self.tree.save()
    }

    pub(crate) fn is_fragmented(&self) -> bool {
        self.tree.is_fragmented()
    }

    pub(crate) fn compact(&mut self) -> Result<(), DbError> {
        self.tree.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use std::fs::File;
    use std::io::{Cursor, Read, Seek, SeekFrom};

    fn def(columns: Vec<usize>, value_column: Option<usize>) -> IndexDef {
        IndexDef {
            name: "ByName".into(),
            columns,
            value_column,
        }
    }

    fn memory() -> CachedStream {
        CachedStream::new(Box::new(Cursor::new(vec![])), 4 * PAGE_SIZE).unwrap()
    }

    fn over(file: &File) -> CachedStream {
        CachedStream::new(Box::new(file.try_clone().unwrap()), 4 * PAGE_SIZE).unwrap()
    }

    fn entry(key: Vec<KeyValue>, id: i32) -> IndexEntry {
        IndexEntry {
            key,
            value: None,
            offset: id as u64 * 64,
            id,
        }
    }

    fn named(name: &str, id: i32) -> IndexEntry {
        entry(vec![KeyValue::String(name.into())], id)
    }

    #[test]
    fn prefix_and_range_scans() {
        let mut index = BTreeIndex::load(def(vec![0, 1], None), "Mail", memory()).unwrap();
        for (id, (folder, n)) in [("inbox", 2), ("inbox", 1), ("sent", 7), ("archive", 3)]
            .into_iter()
            .enumerate()
        {
            let key = vec![KeyValue::String(folder.into()), KeyValue::Int(n)];
            assert!(index.insert(entry(key, id as i32)).unwrap());
        }
        assert!(!index.insert(entry(vec![KeyValue::String("sent".into()), KeyValue::Int(7)], 2)).unwrap());
        assert_eq!(index.len(), 4);

        let inbox: Vec<i32> = index
            .seek_prefix(&[KeyValue::String("inbox".into())])
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(inbox, vec![1, 0]);

        let from = KeyValue::String("b".into());
        let to = KeyValue::String("inbox".into());
        let ids: Vec<i32> = index.range(Some(&from), Some(&to)).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 0]);
        assert_eq!(index.range(None, None).unwrap().len(), 4);

        assert!(index.remove(&entry(vec![KeyValue::String("inbox".into()), KeyValue::Int(1)], 1)).unwrap());
        assert!(!index.remove(&entry(vec![KeyValue::String("inbox".into()), KeyValue::Int(1)], 1)).unwrap());
        assert_eq!(index.seek_prefix(&[KeyValue::String("inbox".into())]).unwrap().len(), 1);
    }

    #[test]
    fn shuffled_inserts_split_and_survive_reopen() {
        let file = tempfile::tempfile().unwrap();
        let mut ids: Vec<i32> = (0..6000).collect();
        ids.shuffle(&mut StdRng::seed_from_u64(17));

        let mut index = BTreeIndex::load(def(vec![0], None), "Mail", over(&file)).unwrap();
        for id in &ids {
            index.insert(named(&format!("subject {id:05}"), *id)).unwrap();
        }
        assert!(index.pages() > 10);
        let entries = index.entries().unwrap();
        assert_eq!(entries.len(), 6000);
        assert!(entries.is_sorted());
        index.save().unwrap();
        drop(index);

        let mut reopened = BTreeIndex::load(def(vec![0], None), "Mail", over(&file)).unwrap();
        assert_eq!(reopened.len(), 6000);
        assert_eq!(reopened.entries().unwrap(), entries);
        let hit = reopened.seek_prefix(&[KeyValue::String("subject 04321".into())]).unwrap();
        assert_eq!(hit.iter().map(|e| e.id).collect::<Vec<_>>(), vec![4321]);
    }

    #[test]
    fn compaction_repacks_a_thinned_tree() {
        let mut index = BTreeIndex::load(def(vec![0], None), "Mail", memory()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut ids: Vec<i32> = (0..4000).collect();
        ids.shuffle(&mut rng);
        for id in &ids {
            index.insert(named(&format!("{id:08}"), *id)).unwrap();
        }
        for id in (0..4000).filter(|id| id % 5 != 0) {
            assert!(index.remove(&named(&format!("{id:08}"), id)).unwrap());
        }
        assert!(index.is_fragmented());
        let before = index.pages();
        let survivors = index.entries().unwrap();

        index.compact().unwrap();
        assert!(index.pages() < before);
        assert!(!index.is_fragmented());
        assert_eq!(index.entries().unwrap(), survivors);

        index.insert(named("00000001", 1)).unwrap();
        assert_eq!(index.len(), survivors.len() + 1);
        assert_eq!(index.seek_prefix(&[KeyValue::String("00000001".into())]).unwrap().len(), 1);
    }

    #[test]
    fn unreadable_files_are_corrupted_indexes() {
        let corrupted = |bytes: Vec<u8>, def: IndexDef| {
            let stream = CachedStream::new(Box::new(Cursor::new(bytes)), PAGE_SIZE).unwrap();
            matches!(
                BTreeIndex::load(def, "Mail", stream),
                Err(DbError::IndexIsCorrupted { .. })
            )
        };
        assert!(corrupted(b"not an index".to_vec(), def(vec![0], None)));
        assert!(corrupted(vec![0xAB; 3 * PAGE_SIZE], def(vec![0], None)));

        let file = tempfile::tempfile().unwrap();
        let mut index = BTreeIndex::load(def(vec![0], None), "Mail", over(&file)).unwrap();
        for id in 0..500 {
            index.insert(named(&format!("{id}"), id)).unwrap();
        }
        index.save().unwrap();
        drop(index);
        let mut bytes = vec![];
        let mut handle = file.try_clone().unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        handle.read_to_end(&mut bytes).unwrap();

        // A different declaration over the same file.
        assert!(corrupted(bytes.clone(), def(vec![0, 1], None)));
        assert!(corrupted(bytes.clone(), def(vec![0], Some(1))));
        // Truncated mid-node.
        assert!(corrupted(bytes[..bytes.len() - 100].to_vec(), def(vec![0], None)));

        // Garbage in the root's page.
        let root = {
            let header = index_header::View::new(&bytes[..header_size()]);
            header.root().read() as usize
        };
        let mut scribbled = bytes.clone();
        scribbled[root * PAGE_SIZE] = 0x7F;
        assert!(corrupted(scribbled, def(vec![0], None)));
    }

    #[test]
    fn long_strings_are_clipped_but_still_found() {
        let mut index = BTreeIndex::load(def(vec![0], None), "Mail", memory()).unwrap();
        let limit = index.shape.limit;
        let long_a = "é".repeat(limit) + "a";
        let long_b = "é".repeat(limit) + "b";
        index.insert(named(&long_a, 1)).unwrap();
        index.insert(named(&long_b, 2)).unwrap();
        index.insert(named("short", 3)).unwrap();

        let sought = KeyValue::String(long_a.clone());
        assert!(!index.is_exact(std::slice::from_ref(&sought)));
        assert!(index.is_exact(&[KeyValue::String("short".into())]));

        // Both share the clipped prefix; the caller sorts them out from the records.
        let hits: Vec<i32> = index.seek_prefix(&[sought]).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(hits, vec![1, 2]);
        let stored = &index.entries().unwrap()[0].key[0];
        assert!(index.may_be_clipped(stored));
        assert!(matches!(stored, KeyValue::String(s) if s.len() <= limit));

        assert!(index.remove(&named(&long_b, 2)).unwrap());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn id_index_round_trips_through_its_file() {
        let file = tempfile::tempfile().unwrap();
        let mut ids = IdIndex::load("Mail", over(&file)).unwrap();
        for id in 0..3000 {
            ids.insert(id, u64::from(id as u32) * 32).unwrap();
        }
        ids.insert(7, 99).unwrap();
        assert_eq!(ids.remove(8).unwrap(), Some(256));
        assert_eq!(ids.remove(8).unwrap(), None);
        ids.save().unwrap();
        drop(ids);

        let mut ids = IdIndex::load("Mail", over(&file)).unwrap();
        assert_eq!(ids.len(), 2999);
        assert_eq!(ids.get(7).unwrap(), Some(99));
        assert_eq!(ids.get(8).unwrap(), None);
        assert_eq!(ids.get(2999).unwrap(), Some(2999 * 32));

        ids.replace_all(&[(4, 40), (2, 20)]).unwrap();
        assert_eq!(ids.rows().unwrap(), vec![(2, 20), (4, 40)]);
        assert!(!ids.is_fragmented());
    }
}
