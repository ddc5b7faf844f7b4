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

use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use strum::{Display, EnumString, FromRepr};

use crate::blob::BlobHandle;
use crate::codec::{ByteReader, ByteWriter, ReadError};
use crate::{Corruption, DbError};

pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Ticks of 9999-12-31 23:59:59.9999999.
pub const MAX_TICKS: i64 = 3_155_378_975_999_999_999;

const RECORD_END_MARKER: u16 = 0xEDED;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, EnumString, FromRepr)]
#[repr(u8)]
pub enum ColumnType {
    Int = 1,
    String = 2,
    DateTime = 3,
    Double = 4,
    Blob = 5,
}

impl ColumnType {
    pub fn is_indexable(&self) -> bool {
        !matches!(self, ColumnType::Blob)
    }

    pub(crate) fn default_value(&self) -> Value {
        match self {
            ColumnType::Int => Value::Int(0),
            ColumnType::String => Value::String(String::new()),
            ColumnType::DateTime => Value::DateTime(epoch()),
            ColumnType::Double => Value::Double(0.0),
            ColumnType::Blob => Value::Blob(BlobHandle::NONE),
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    String(String),
    DateTime(NaiveDateTime),
    Double(f64),
    Blob(BlobHandle),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) => ColumnType::Int,
            Value::String(_) => ColumnType::String,
            Value::DateTime(_) => ColumnType::DateTime,
            Value::Double(_) => ColumnType::Double,
            Value::Blob(_) => ColumnType::Blob,
        }
    }

    /// The index key form of this value; BLOB handles have none.
    pub fn key(&self) -> Result<KeyValue, DbError> {
        Ok(match self {
            Value::Int(i) => KeyValue::Int(*i),
            Value::String(s) => KeyValue::String(s.clone()),
            Value::DateTime(dt) => KeyValue::DateTime(datetime_to_ticks(dt)?),
            Value::Double(d) => KeyValue::Double(*d),
            Value::Blob(_) => return Err(DbError::NotIndexable(ColumnType::Blob)),
        })
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

/// An indexable value. Strings order by ordinal (byte) comparison, doubles by IEEE total order,
/// date-times by their tick count.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Int(i32),
    String(String),
    DateTime(i64),
    Double(f64),
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::Int(_) => 0,
            KeyValue::String(_) => 1,
            KeyValue::DateTime(_) => 2,
            KeyValue::Double(_) => 3,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            KeyValue::Int(_) => ColumnType::Int,
            KeyValue::String(_) => ColumnType::String,
            KeyValue::DateTime(_) => ColumnType::DateTime,
            KeyValue::Double(_) => ColumnType::Double,
        }
    }

    pub(crate) fn encode(&self, w: &mut ByteWriter) {
        w.u8(self.column_type() as u8);
        match self {
            KeyValue::Int(i) => w.i32(*i),
            KeyValue::String(s) => w.str(s),
            KeyValue::DateTime(t) => w.i64(*t),
            KeyValue::Double(d) => w.f64(*d),
        }
    }

    /// Bytes `encode` writes for this value.
    pub(crate) fn encoded_len(&self) -> usize {
        1 + match self {
            KeyValue::Int(_) => 4,
            KeyValue::String(s) => 4 + s.len(),
            KeyValue::DateTime(_) | KeyValue::Double(_) => 8,
        }
    }

    pub(crate) fn decode(r: &mut ByteReader) -> Result<Self, ReadError> {
        let tag = r.u8()?;
        Ok(match ColumnType::from_repr(tag) {
            Some(ColumnType::Int) => KeyValue::Int(r.i32()?),
            Some(ColumnType::String) => KeyValue::String(r.str()?),
            Some(ColumnType::DateTime) => KeyValue::DateTime(r.i64()?),
            Some(ColumnType::Double) => KeyValue::Double(r.f64()?),
            _ => return Err(ReadError::Truncated),
        })
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::String(v.to_string())
    }
}

impl From<f64> for KeyValue {
    fn from(v: f64) -> Self {
        KeyValue::Double(v)
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::String(a), KeyValue::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (KeyValue::DateTime(a), KeyValue::DateTime(b)) => a.cmp(b),
            (KeyValue::Double(a), KeyValue::Double(b)) => a.total_cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// 100ns ticks since 0001-01-01T00:00:00.
pub fn datetime_to_ticks(dt: &NaiveDateTime) -> Result<i64, DbError> {
    let delta = *dt - epoch();
    let seconds = delta.num_seconds();
    if seconds < 0 {
        return Err(DbError::DateOutOfRange);
    }
    let ticks = seconds
        .checked_mul(TICKS_PER_SECOND)
        .and_then(|t| t.checked_add(i64::from(delta.subsec_nanos()) / 100))
        .ok_or(DbError::DateOutOfRange)?;
    if ticks > MAX_TICKS {
        return Err(DbError::DateOutOfRange);
    }
    Ok(ticks)
}

pub fn datetime_from_ticks(ticks: i64) -> Option<NaiveDateTime> {
    if !(0..=MAX_TICKS).contains(&ticks) {
        return None;
    }
    let seconds = TimeDelta::try_seconds(ticks / TICKS_PER_SECOND)?;
    let nanos = TimeDelta::nanoseconds((ticks % TICKS_PER_SECOND) * 100);
    epoch()
        .checked_add_signed(seconds)?
        .checked_add_signed(nanos)
}

/// Encode a record payload: id, field count, tagged fields, end marker.
pub(crate) fn encode_record(id: i32, values: &[Value]) -> Result<Vec<u8>, DbError> {
    let mut w = ByteWriter::with_capacity(16 + values.len() * 8);
    w.i32(id);
    w.u16(values.len() as u16);
    for value in values {
        w.u8(value.column_type() as u8);
        match value {
            Value::Int(i) => w.i32(*i),
            Value::String(s) => w.str(s),
            Value::DateTime(dt) => w.i64(datetime_to_ticks(dt)?),
            Value::Double(d) => w.f64(*d),
            Value::Blob(h) => w.u64(h.0),
        }
    }
    w.u16(RECORD_END_MARKER);
    Ok(w.into_inner())
}

/// Decode a record payload against the table's current column layout. Fields the payload
/// does not carry (columns declared after it was written) take their type's default.
pub(crate) fn decode_record(
    bytes: &[u8],
    columns: &[ColumnType],
    file: &str,
    offset: u64,
) -> Result<(i32, Vec<Value>), DbError> {
    let corrupt = |kind| DbError::DataCorrupted {
        file: file.to_string(),
        offset,
        kind,
    };
    let mut r = ByteReader::new(bytes);
    let id = r.i32().map_err(|_| corrupt(Corruption::BadHeader))?;
    let count = r.u16().map_err(|_| corrupt(Corruption::BadHeader))? as usize;
    let mut values = Vec::with_capacity(columns.len());
    for i in 0..count {
        let tag = r.u8().map_err(|_| corrupt(Corruption::BadEndMarker))?;
        let ctype = ColumnType::from_repr(tag).ok_or_else(|| corrupt(Corruption::BadHeader))?;
        let value = match ctype {
            ColumnType::Int => Value::Int(r.i32().map_err(|_| corrupt(Corruption::BadEndMarker))?),
            ColumnType::String => Value::String(r.str().map_err(|_| corrupt(Corruption::BadString))?),
            ColumnType::DateTime => {
                let ticks = r.i64().map_err(|_| corrupt(Corruption::BadDate))?;
                Value::DateTime(datetime_from_ticks(ticks).ok_or_else(|| corrupt(Corruption::BadDate))?)
            }
            ColumnType::Double => Value::Double(r.f64().map_err(|_| corrupt(Corruption::BadEndMarker))?),
            ColumnType::Blob => {
                Value::Blob(BlobHandle(r.u64().map_err(|_| corrupt(Corruption::BadEndMarker))?))
            }
        };
        if i < columns.len() {
            if columns[i] != ctype {
                return Err(corrupt(Corruption::BadHeader));
            }
            values.push(value);
        }
    }
    if r.u16().ok() != Some(RECORD_END_MARKER) {
        return Err(corrupt(Corruption::BadEndMarker));
    }
    for column in columns.iter().skip(values.len()) {
        values.push(column.default_value());
    }
    Ok((id, values))
}
