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

//! The structure file: engine version, build tag, and the layout of every table.
//!
//! The file is only ever rewritten whole (truncate, write, sync), never patched in place.

use std::fs::OpenOptions;
use std::path::Path;

use binary_layout::define_layout;

use crate::codec::{ByteReader, ByteWriter, ReadError};
use crate::index::IndexDef;
use crate::paging::{CachedStream, PAGE_SIZE};
use crate::table::Column;
use crate::values::ColumnType;
use crate::{Corruption, DbError};

/// On-disk format version this engine writes.
pub const ENGINE_VERSION: u32 = 5;
/// Databases at this version predate slot capacities and are upgraded by defragmenting.
pub(crate) const DEFRAGMENT_UPGRADE_VERSION: u32 = 3;

pub(crate) const STRUCTURE_FILE: &str = "structure.dbs";

const STRUCTURE_MAGIC: u32 = 0x5054_5253;
const STRUCTURE_END_MARKER: u32 = 0x454E_4453;

define_layout!(structure_header, LittleEndian, {
    magic_marker: u32,
    version: u32,
    table_count: u32,
});

fn header_size() -> usize {
    structure_header::SIZE.unwrap_or(12)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u32,
    pub build_tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TableLayout {
    pub(crate) name: String,
    pub(crate) next_id: i32,
    pub(crate) dirty: bool,
    pub(crate) columns: Vec<Column>,
    pub(crate) indexes: Vec<IndexDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StructureImage {
    pub(crate) info: VersionInfo,
    pub(crate) tables: Vec<TableLayout>,
}

fn corrupt(kind: Corruption, offset: usize) -> DbError {
    DbError::DataCorrupted {
        file: STRUCTURE_FILE.to_string(),
        offset: offset as u64,
        kind,
    }
}

impl StructureImage {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; header_size()];
        let mut header = structure_header::View::new(buf.as_mut_slice());
        header.magic_marker_mut().write(STRUCTURE_MAGIC);
        header.version_mut().write(self.info.version);
        header.table_count_mut().write(self.tables.len() as u32);

        let mut w = ByteWriter::with_capacity(256);
        for b in buf {
            w.u8(b);
        }
        w.short_str(&self.info.build_tag);
        for table in &self.tables {
            w.short_str(&table.name);
            w.i32(table.next_id);
            w.u8(u8::from(table.dirty));
            w.u16(table.columns.len() as u16);
            for column in &table.columns {
                w.short_str(&column.name);
                w.u8(column.column_type as u8);
            }
            w.u16(table.indexes.len() as u16);
            for index in &table.indexes {
                w.short_str(&index.name);
                w.u8(index.columns.len() as u8);
                for c in &index.columns {
                    w.u16(*c as u16);
                }
                w.i16(index.value_column.map(|c| c as i16).unwrap_or(-1));
            }
        }
        w.u32(STRUCTURE_END_MARKER);
        w.into_inner()
    }

    fn decode_info(r: &mut ByteReader) -> Result<(VersionInfo, u32), DbError> {
        let bytes = r.bytes(header_size()).map_err(|_| corrupt(Corruption::BadHeader, 0))?;
        let header = structure_header::View::new(bytes);
        if header.magic_marker().read() != STRUCTURE_MAGIC {
            return Err(corrupt(Corruption::BadHeader, 0));
        }
        let version = header.version().read();
        let table_count = header.table_count().read();
        let build_tag = r
            .short_str()
            .map_err(|_| corrupt(Corruption::BadString, r.position()))?;
        Ok((VersionInfo { version, build_tag }, table_count))
    }

    /// Decode a structure file. A version newer than this engine is refused before anything
    /// past the header is interpreted.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        let mut r = ByteReader::new(bytes);
        let (info, table_count) = Self::decode_info(&mut r)?;
        if info.version > ENGINE_VERSION {
            return Err(DbError::BackwardIncompatibility {
                found: info.version,
                supported: ENGINE_VERSION,
            });
        }
        let mut tables = Vec::with_capacity(table_count as usize);
        for _ in 0..table_count {
            tables.push(Self::decode_table(&mut r).map_err(|e| match e {
                ReadError::BadUtf8 => corrupt(Corruption::BadString, r.position()),
                ReadError::Truncated => corrupt(Corruption::BadEndMarker, r.position()),
            })?);
        }
        if r.u32().ok() != Some(STRUCTURE_END_MARKER) {
            return Err(corrupt(Corruption::BadEndMarker, r.position()));
        }
        Ok(Self { info, tables })
    }

    fn decode_table(r: &mut ByteReader) -> Result<TableLayout, ReadError> {
        let name = r.short_str()?;
        let next_id = r.i32()?;
        let dirty = r.u8()? != 0;
        let column_count = r.u16()?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let name = r.short_str()?;
            let column_type = ColumnType::from_repr(r.u8()?).ok_or(ReadError::Truncated)?;
            columns.push(Column { name, column_type });
        }
        let index_count = r.u16()?;
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let name = r.short_str()?;
            let arity = r.u8()?;
            let mut index_columns = Vec::with_capacity(arity as usize);
            for _ in 0..arity {
                index_columns.push(r.u16()? as usize);
            }
            let value_column = match r.i16()? {
                v if v < 0 => None,
                v => Some(v as usize),
            };
            indexes.push(IndexDef {
                name,
                columns: index_columns,
                value_column,
            });
        }
        Ok(TableLayout {
            name,
            next_id,
            dirty,
            columns,
            indexes,
        })
    }
}

/// The structure file of one database directory.
pub(crate) struct StructureFile {
    stream: CachedStream,
}

impl StructureFile {
    pub(crate) fn open(dir: &Path, cache_bytes: usize) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(STRUCTURE_FILE))?;
        Ok(Self {
            stream: CachedStream::new(Box::new(file), cache_bytes)?,
        })
    }

    /// The stored structure, or `None` for a database that has never been saved.
    pub(crate) fn load(&mut self) -> Result<Option<StructureImage>, DbError> {
        if self.stream.is_empty() {
            return Ok(None);
        }
        let mut bytes = vec![0u8; self.stream.len() as usize];
        self.stream.read_exact_at(0, &mut bytes)?;
        StructureImage::decode(&bytes).map(Some)
    }

    pub(crate) fn save(&mut self, image: &StructureImage) -> Result<(), DbError> {
        let bytes = image.encode();
        self.stream.set_len(0)?;
        self.stream.write_at(0, &bytes)?;
        self.stream.sync()
    }
}

/// Read just the version and build tag of the database in `dir`, without opening it.
pub fn load_version_info(dir: &Path) -> Result<Option<VersionInfo>, DbError> {
    let path = dir.join(STRUCTURE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    let mut stream = CachedStream::new(Box::new(file), PAGE_SIZE)?;
    if stream.is_empty() {
        return Ok(None);
    }
    // Header plus the longest possible build tag.
    let mut bytes = vec![0u8; (header_size() + 2 + u16::MAX as usize).min(stream.len() as usize)];
    stream.read_exact_at(0, &mut bytes)?;
    stream.discard();
    let mut r = ByteReader::new(&bytes);
    StructureImage::decode_info(&mut r).map(|(info, _)| Some(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image() -> StructureImage {
        StructureImage {
            info: VersionInfo {
                version: ENGINE_VERSION,
                build_tag: "test-build".into(),
            },
            tables: vec![
                TableLayout {
                    name: "Links".into(),
                    next_id: 42,
                    dirty: true,
                    columns: vec![
                        Column {
                            name: "From".into(),
                            column_type: ColumnType::Int,
                        },
                        Column {
                            name: "To".into(),
                            column_type: ColumnType::Int,
                        },
                        Column {
                            name: "Stamp".into(),
                            column_type: ColumnType::DateTime,
                        },
                    ],
                    indexes: vec![
                        IndexDef {
                            name: "From".into(),
                            columns: vec![0],
                            value_column: None,
                        },
                        IndexDef {
                            name: "From+Stamp@To".into(),
                            columns: vec![0, 2],
                            value_column: Some(1),
                        },
                    ],
                },
                TableLayout {
                    name: "Empty".into(),
                    next_id: 1,
                    dirty: false,
                    columns: vec![],
                    indexes: vec![],
                },
            ],
        }
    }

    #[test]
    fn layout_survives_encoding() {
        let image = image();
        assert_eq!(StructureImage::decode(&image.encode()).unwrap(), image);
    }

    #[test]
    fn newer_version_is_refused() {
        let mut image = image();
        image.info.version = ENGINE_VERSION + 1;
        assert!(matches!(
            StructureImage::decode(&image.encode()),
            Err(DbError::BackwardIncompatibility { found, supported })
                if found == ENGINE_VERSION + 1 && supported == ENGINE_VERSION
        ));
    }

    #[test]
    fn torn_file_is_corruption() {
        let bytes = image().encode();
        let err = StructureImage::decode(&bytes[..bytes.len() - 7]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn version_peek_and_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_version_info(dir.path()).unwrap(), None);
        {
            let mut file = StructureFile::open(dir.path(), PAGE_SIZE).unwrap();
            assert!(file.load().unwrap().is_none());
            file.save(&image()).unwrap();
            // A shorter rewrite must not leave the old tail behind.
            let mut smaller = image();
            smaller.tables.truncate(1);
            file.save(&smaller).unwrap();
            assert_eq!(file.load().unwrap().unwrap(), smaller);
        }
        let info = load_version_info(dir.path()).unwrap().unwrap();
        assert_eq!(info.version, ENGINE_VERSION);
        assert_eq!(info.build_tag, "test-build");
    }
}
