// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]
//! The canonical value model for feature cells, and its MessagePack codec.
//!
//! Encoding is canonical: the same value produces the same bytes on any
//! platform (minimal-length integer markers, little-endian IEEE floats,
//! geometry as a `G` extension wrapping normalised GeoPackage binary).
//! Temporal and numeric values are carried as strings; their logical type
//! lives in the schema, not in the blob.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;

use thiserror::Error;

use crate::geometry::Geometry;

/// MessagePack extension type tag for geometry values ('G').
pub const GEOMETRY_EXT_TYPE: i8 = 0x47;

#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Geometry(Geometry),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Self::Geometry(g) => Some(g),
            _ => None,
        }
    }

    /// The text form used for primary keys in the working-copy track table.
    pub fn to_track_text(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Blob(b) => hex::encode(b),
            Self::Geometry(g) => hex::encode(g.as_bytes()),
        }
    }
}

/// The text form of a whole primary-key tuple. Single-column keys (the
/// overwhelmingly common case) use the bare value text.
pub fn pk_to_track_text(pk: &[Value]) -> String {
    match pk {
        [single] => single.to_track_text(),
        many => many
            .iter()
            .map(Value::to_track_text)
            .collect::<Vec<_>>()
            .join("\u{1e}"),
    }
}

// Floats compare by bit pattern: the stored form is canonical, and diffing
// must treat re-read values as equal iff their encodings are equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            (Self::Geometry(a), Self::Geometry(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Boolean(b) => b.hash(state),
            Self::Integer(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
            Self::Blob(b) => b.hash(state),
            Self::Geometry(g) => g.as_bytes().hash(state),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "Blob({})", hex::encode(b)),
            Self::Geometry(g) => g.fmt(f),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueDecodeError {
    #[error("Value data is truncated")]
    Truncated,
    #[error("Unexpected MessagePack marker 0x{0:02x}")]
    UnexpectedMarker(u8),
    #[error("Integer value does not fit in 64 bits")]
    IntegerOverflow,
    #[error("Text value is not valid UTF-8")]
    InvalidUtf8,
    #[error("Unknown extension type {0}")]
    UnknownExtType(i8),
}

/// Appends the canonical encoding of `value` to `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => rmp::encode::write_nil(buf).unwrap(),
        Value::Boolean(b) => rmp::encode::write_bool(buf, *b).unwrap(),
        Value::Integer(i) => {
            rmp::encode::write_sint(buf, *i).unwrap();
        }
        Value::Float(f) => {
            rmp::encode::write_f64(buf, *f).unwrap();
        }
        Value::Text(s) => {
            rmp::encode::write_str(buf, s).unwrap();
        }
        Value::Blob(b) => {
            rmp::encode::write_bin(buf, b).unwrap();
        }
        Value::Geometry(g) => {
            let bytes = g.as_bytes();
            rmp::encode::write_ext_meta(buf, bytes.len() as u32, GEOMETRY_EXT_TYPE).unwrap();
            buf.extend_from_slice(bytes);
        }
    }
}

pub fn encode_array_len(buf: &mut Vec<u8>, len: u32) {
    rmp::encode::write_array_len(buf, len).unwrap();
}

pub fn encode_bin(buf: &mut Vec<u8>, data: &[u8]) {
    rmp::encode::write_bin(buf, data).unwrap();
}

/// A minimal MessagePack reader over a byte slice, producing precise framing
/// errors instead of panicking on malformed input.
pub struct MsgpackReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MsgpackReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ValueDecodeError> {
        let chunk = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(ValueDecodeError::Truncated)?;
        self.pos += n;
        Ok(chunk)
    }

    fn take_u8(&mut self) -> Result<u8, ValueDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, ValueDecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, ValueDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, ValueDecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_array_len(&mut self) -> Result<u32, ValueDecodeError> {
        let marker = self.take_u8()?;
        match marker {
            0x90..=0x9f => Ok(u32::from(marker & 0x0f)),
            0xdc => Ok(u32::from(self.take_u16()?)),
            0xdd => self.take_u32(),
            other => Err(ValueDecodeError::UnexpectedMarker(other)),
        }
    }

    pub fn read_bin(&mut self) -> Result<&'a [u8], ValueDecodeError> {
        let marker = self.take_u8()?;
        let len = match marker {
            0xc4 => usize::from(self.take_u8()?),
            0xc5 => usize::from(self.take_u16()?),
            0xc6 => self.take_u32()? as usize,
            other => return Err(ValueDecodeError::UnexpectedMarker(other)),
        };
        self.take(len)
    }

    pub fn read_value(&mut self) -> Result<Value, ValueDecodeError> {
        let marker = self.take_u8()?;
        let value = match marker {
            0xc0 => Value::Null,
            0xc2 => Value::Boolean(false),
            0xc3 => Value::Boolean(true),
            0x00..=0x7f => Value::Integer(i64::from(marker)),
            0xe0..=0xff => Value::Integer(i64::from(marker as i8)),
            0xcc => Value::Integer(i64::from(self.take_u8()?)),
            0xcd => Value::Integer(i64::from(self.take_u16()?)),
            0xce => Value::Integer(i64::from(self.take_u32()?)),
            0xcf => {
                let v = self.take_u64()?;
                Value::Integer(i64::try_from(v).map_err(|_| ValueDecodeError::IntegerOverflow)?)
            }
            0xd0 => Value::Integer(i64::from(self.take_u8()? as i8)),
            0xd1 => Value::Integer(i64::from(self.take_u16()? as i16)),
            0xd2 => Value::Integer(i64::from(self.take_u32()? as i32)),
            0xd3 => Value::Integer(self.take_u64()? as i64),
            0xca => {
                let bits = self.take_u32()?;
                Value::Float(f64::from(f32::from_bits(bits)))
            }
            0xcb => Value::Float(f64::from_bits(self.take_u64()?)),
            0xa0..=0xbf => {
                let len = usize::from(marker & 0x1f);
                self.read_str_value(len)?
            }
            0xd9 => {
                let len = usize::from(self.take_u8()?);
                self.read_str_value(len)?
            }
            0xda => {
                let len = usize::from(self.take_u16()?);
                self.read_str_value(len)?
            }
            0xdb => {
                let len = self.take_u32()? as usize;
                self.read_str_value(len)?
            }
            0xc4 => {
                let len = usize::from(self.take_u8()?);
                Value::Blob(self.take(len)?.to_vec())
            }
            0xc5 => {
                let len = usize::from(self.take_u16()?);
                Value::Blob(self.take(len)?.to_vec())
            }
            0xc6 => {
                let len = self.take_u32()? as usize;
                Value::Blob(self.take(len)?.to_vec())
            }
            0xd4 => self.read_ext_value(1)?,
            0xd5 => self.read_ext_value(2)?,
            0xd6 => self.read_ext_value(4)?,
            0xd7 => self.read_ext_value(8)?,
            0xd8 => self.read_ext_value(16)?,
            0xc7 => {
                let len = usize::from(self.take_u8()?);
                self.read_ext_value(len)?
            }
            0xc8 => {
                let len = usize::from(self.take_u16()?);
                self.read_ext_value(len)?
            }
            0xc9 => {
                let len = self.take_u32()? as usize;
                self.read_ext_value(len)?
            }
            other => return Err(ValueDecodeError::UnexpectedMarker(other)),
        };
        Ok(value)
    }

    fn read_str_value(&mut self, len: usize) -> Result<Value, ValueDecodeError> {
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| ValueDecodeError::InvalidUtf8)?;
        Ok(Value::Text(s.to_string()))
    }

    fn read_ext_value(&mut self, len: usize) -> Result<Value, ValueDecodeError> {
        let ext_type = self.take_u8()? as i8;
        let data = self.take(len)?;
        if ext_type == GEOMETRY_EXT_TYPE {
            Ok(Value::Geometry(Geometry::from_stored(data.to_vec())))
        } else {
            Err(ValueDecodeError::UnknownExtType(ext_type))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) -> Value {
        let mut buf = Vec::new();
        encode_value(&mut buf, value);
        let mut reader = MsgpackReader::new(&buf);
        let decoded = reader.read_value().unwrap();
        assert!(reader.at_end());
        decoded
    }

    #[test]
    fn test_roundtrip_scalars() {
        for value in [
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Integer(0),
            Value::Integer(127),
            Value::Integer(-32),
            Value::Integer(65535),
            Value::Integer(-1_000_000_007),
            Value::Integer(i64::MAX),
            Value::Integer(i64::MIN),
            Value::Float(0.25),
            Value::Float(-1.5e300),
            Value::Text(String::new()),
            Value::Text("Te Whare".to_string()),
            Value::Blob(vec![0, 1, 2, 255]),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_roundtrip_geometry() {
        let g = Geometry::from_hex_wkb("0101000000000000000000F03F0000000000000040").unwrap();
        let value = Value::Geometry(g);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_canonical_integer_width() {
        // Minimal-length markers: 5 must encode as a single positive fixint.
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::Integer(5));
        assert_eq!(buf, vec![0x05]);
    }

    #[test]
    fn test_float_nan_equality() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(nan, roundtrip(&nan));
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = Vec::new();
        encode_value(&mut buf, &Value::Text("hello".to_string()));
        buf.truncate(3);
        let mut reader = MsgpackReader::new(&buf);
        assert_eq!(reader.read_value(), Err(ValueDecodeError::Truncated));
    }

    #[test]
    fn test_pk_to_track_text() {
        assert_eq!(pk_to_track_text(&[Value::Integer(42)]), "42");
        assert_eq!(
            pk_to_track_text(&[Value::Text("a".into()), Value::Integer(1)]),
            "a\u{1e}1"
        );
    }
}
