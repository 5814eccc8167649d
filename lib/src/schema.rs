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
//! The dataset schema model.
//!
//! A schema is an ordered sequence of columns. Each column has a stable
//! 128-bit id which survives renames and reorders; feature blobs reference
//! columns by id (via the legend), never by position, which is what keeps
//! blobs byte-stable under trivial schema evolution.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;

use blake2::Blake2b512;
use digest::Digest as _;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::value::Value;

/// Stable 128-bit column identifier, rendered UUID-style in `schema.json`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId([u8; 16]);

impl ColumnId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn try_from_str(s: &str) -> Option<Self> {
        let hex_digits: String = s.chars().filter(|c| *c != '-').collect();
        if s.split('-').count() != 5 || hex_digits.len() != 32 {
            return None;
        }
        let bytes = hex::decode(hex_digits).ok()?;
        Some(Self(bytes.try_into().unwrap()))
    }
}

impl Display for ColumnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

impl Debug for ColumnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ColumnId({self})")
    }
}

/// Logical column type. Extra type info (sizes, lengths, geometry subtype,
/// CRS attachment) is part of the type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    /// `size` is one of 8, 16, 32, 64 bits.
    Integer { size: u8 },
    /// `size` is one of 32, 64 bits.
    Float { size: u8 },
    Numeric {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Text { length: Option<u32> },
    Blob { length: Option<u32> },
    Date,
    Time,
    /// `timezone` is `Some("UTC")` or `None` (zoneless).
    Timestamp { timezone: Option<String> },
    Interval,
    Geometry {
        /// E.g. "POINT", "MULTIPOLYGON", "GEOMETRY".
        geometry_type: String,
        /// Name of a CRS attached to the dataset, e.g. "EPSG:2193".
        crs_name: Option<String>,
    },
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "float",
            Self::Numeric { .. } => "numeric",
            Self::Text { .. } => "text",
            Self::Blob { .. } => "blob",
            Self::Date => "date",
            Self::Time => "time",
            Self::Timestamp { .. } => "timestamp",
            Self::Interval => "interval",
            Self::Geometry { .. } => "geometry",
        }
    }

    /// Canonical string form, hashed into deterministic column ids.
    pub fn canonical_string(&self) -> String {
        match self {
            Self::Integer { size } => format!("integer:{size}"),
            Self::Float { size } => format!("float:{size}"),
            Self::Numeric { precision, scale } => format!(
                "numeric:{}:{}",
                precision.map_or(String::new(), |p| p.to_string()),
                scale.map_or(String::new(), |s| s.to_string())
            ),
            Self::Text { length } => {
                format!("text:{}", length.map_or(String::new(), |l| l.to_string()))
            }
            Self::Blob { length } => {
                format!("blob:{}", length.map_or(String::new(), |l| l.to_string()))
            }
            Self::Timestamp { timezone } => {
                format!("timestamp:{}", timezone.as_deref().unwrap_or(""))
            }
            Self::Geometry {
                geometry_type,
                crs_name,
            } => format!(
                "geometry:{}:{}",
                geometry_type,
                crs_name.as_deref().unwrap_or("")
            ),
            other => other.name().to_string(),
        }
    }

    /// Whether `value` can be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match (self, value) {
            (Self::Boolean, Value::Boolean(_)) => true,
            (Self::Integer { .. }, Value::Integer(_)) => true,
            (Self::Float { .. }, Value::Float(_)) => true,
            // Temporal and numeric values are carried as strings.
            (
                Self::Numeric { .. }
                | Self::Text { .. }
                | Self::Date
                | Self::Time
                | Self::Timestamp { .. }
                | Self::Interval,
                Value::Text(_),
            ) => true,
            (Self::Blob { .. }, Value::Blob(_)) => true,
            (Self::Geometry { .. }, Value::Geometry(_)) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    /// Position of this column within the primary key, or None if the column
    /// is not part of the primary key.
    pub pk_index: Option<u32>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, pk_index: Option<u32>) -> Self {
        let name = name.into();
        let id = encode_column_id(&name, &data_type, b"");
        Self {
            id,
            name,
            data_type,
            pk_index,
        }
    }
}

/// Derives a column id deterministically from the column's identity, so that
/// repeated imports of the same source produce the same ids.
pub fn encode_column_id(name: &str, data_type: &DataType, salt: &[u8]) -> ColumnId {
    let mut hasher = Blake2b512::new();
    hasher.update(salt);
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(data_type.canonical_string().as_bytes());
    let digest = hasher.finalize();
    ColumnId::from_bytes(digest[..16].try_into().unwrap())
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Invalid schema.json: {0}")]
    InvalidJson(String),
    #[error("Column {name:?} has invalid data type {data_type:?}")]
    InvalidDataType { name: String, data_type: String },
}

/// Counts of each kind of change between two schemas, used to decide whether
/// an edit can be applied with `ALTER TABLE` or needs a table rewrite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiffTypeCounts {
    pub inserts: usize,
    pub deletes: usize,
    pub renames: usize,
    pub type_updates: usize,
    pub pk_updates: usize,
    pub reorders: usize,
}

impl DiffTypeCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when the only changes are column additions/removals, which keep
    /// existing feature blobs decodable against their legends.
    pub fn only_adds_and_deletes(&self) -> bool {
        self.renames == 0 && self.type_updates == 0 && self.pk_updates == 0
    }
}

// The flat column-object layout of schema.json.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnDict {
    id: String,
    name: String,
    data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary_key_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    geometry_type: Option<String>,
    #[serde(rename = "geometryCRS", skip_serializing_if = "Option::is_none")]
    geometry_crs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
}

impl ColumnDict {
    fn from_column(col: &Column) -> Self {
        let mut dict = Self {
            id: col.id.to_string(),
            name: col.name.clone(),
            data_type: col.data_type.name().to_string(),
            primary_key_index: col.pk_index,
            size: None,
            length: None,
            precision: None,
            scale: None,
            geometry_type: None,
            geometry_crs: None,
            timezone: None,
        };
        match &col.data_type {
            DataType::Integer { size } | DataType::Float { size } => dict.size = Some(*size),
            DataType::Numeric { precision, scale } => {
                dict.precision = *precision;
                dict.scale = *scale;
            }
            DataType::Text { length } | DataType::Blob { length } => dict.length = *length,
            DataType::Timestamp { timezone } => dict.timezone = timezone.clone(),
            DataType::Geometry {
                geometry_type,
                crs_name,
            } => {
                dict.geometry_type = Some(geometry_type.clone());
                dict.geometry_crs = crs_name.clone();
            }
            _ => {}
        }
        dict
    }

    fn into_column(self) -> Result<Column, SchemaError> {
        let invalid = |name: &str, data_type: &str| SchemaError::InvalidDataType {
            name: name.to_string(),
            data_type: data_type.to_string(),
        };
        let data_type = match self.data_type.as_str() {
            "boolean" => DataType::Boolean,
            "integer" => DataType::Integer {
                size: match self.size.unwrap_or(64) {
                    s @ (8 | 16 | 32 | 64) => s,
                    _ => return Err(invalid(&self.name, &self.data_type)),
                },
            },
            "float" => DataType::Float {
                size: match self.size.unwrap_or(64) {
                    s @ (32 | 64) => s,
                    _ => return Err(invalid(&self.name, &self.data_type)),
                },
            },
            "numeric" => DataType::Numeric {
                precision: self.precision,
                scale: self.scale,
            },
            "text" => DataType::Text {
                length: self.length,
            },
            "blob" => DataType::Blob {
                length: self.length,
            },
            "date" => DataType::Date,
            "time" => DataType::Time,
            "timestamp" => DataType::Timestamp {
                timezone: self.timezone,
            },
            "interval" => DataType::Interval,
            "geometry" => DataType::Geometry {
                geometry_type: self.geometry_type.unwrap_or_else(|| "GEOMETRY".to_string()),
                crs_name: self.geometry_crs,
            },
            _ => return Err(invalid(&self.name, &self.data_type)),
        };
        let id = ColumnId::try_from_str(&self.id)
            .ok_or_else(|| SchemaError::InvalidJson(format!("bad column id {:?}", self.id)))?;
        Ok(Column {
            id,
            name: self.name,
            data_type,
            pk_index: self.primary_key_index,
        })
    }
}

/// An ordered sequence of columns. The primary key is the ordered subsequence
/// of columns whose `pk_index` is set, sorted by that index.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: &ColumnId) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == *id)
    }

    /// Primary-key columns ordered by their pk index.
    pub fn pk_columns(&self) -> Vec<&Column> {
        let mut pks: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| c.pk_index.is_some())
            .collect();
        pks.sort_by_key(|c| c.pk_index);
        pks
    }

    pub fn first_pk_column(&self) -> Option<&Column> {
        self.pk_columns().first().copied()
    }

    pub fn geometry_columns(&self) -> Vec<&Column> {
        self.columns
            .iter()
            .filter(|c| matches!(c.data_type, DataType::Geometry { .. }))
            .collect()
    }

    /// The single geometry column's name, if there is exactly one.
    pub fn geometry_column_name(&self) -> Option<&str> {
        match self.geometry_columns().as_slice() {
            [col] => Some(col.name.as_str()),
            _ => None,
        }
    }

    /// Whether the primary key is a single integer column, which working-copy
    /// backends can represent natively.
    pub fn has_int_pk(&self) -> bool {
        matches!(
            self.pk_columns().as_slice(),
            [Column {
                data_type: DataType::Integer { .. },
                ..
            }]
        )
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, SchemaError> {
        let dicts: Vec<ColumnDict> = serde_json::from_value(json.clone())
            .map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        let columns = dicts
            .into_iter()
            .map(ColumnDict::into_column)
            .collect::<Result<_, _>>()?;
        Ok(Self { columns })
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(
            self.columns
                .iter()
                .map(ColumnDict::from_column)
                .collect::<Vec<_>>(),
        )
        .unwrap()
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec_pretty(&self.to_json()).unwrap();
        bytes.push(b'\n');
        bytes
    }

    /// Produces a copy of this schema that reuses `old`'s column ids wherever
    /// a column has the same name and an equal type; truly new columns keep
    /// their own (freshly generated) ids.
    pub fn aligned_to(&self, old: &Self) -> Self {
        self.aligned_to_with(old, |old_col, new_col| {
            old_col.data_type == new_col.data_type
        })
    }

    /// Like [`Schema::aligned_to`], but with a caller-supplied column
    /// alignment hook. The hook may mutate the new column to undo a known
    /// type approximation; it returns true when the columns should be
    /// considered the same column.
    pub fn aligned_to_with(
        &self,
        old: &Self,
        mut try_align: impl FnMut(&Column, &mut Column) -> bool,
    ) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|col| {
                let mut aligned = col.clone();
                if let Some(old_col) = old.column_by_name(&col.name) {
                    if try_align(old_col, &mut aligned) {
                        aligned.id = old_col.id;
                    }
                }
                aligned
            })
            .collect();
        Self { columns }
    }

    /// Classifies the changes from `self` to `new`, matching columns by id.
    pub fn diff_type_counts(&self, new: &Self) -> DiffTypeCounts {
        let mut counts = DiffTypeCounts::default();
        for old_col in &self.columns {
            match new.column_by_id(&old_col.id) {
                None => counts.deletes += 1,
                Some(new_col) => {
                    if old_col.name != new_col.name {
                        counts.renames += 1;
                    }
                    if old_col.data_type != new_col.data_type {
                        counts.type_updates += 1;
                    }
                    if old_col.pk_index != new_col.pk_index {
                        counts.pk_updates += 1;
                    }
                }
            }
        }
        for new_col in &new.columns {
            if self.column_by_id(&new_col.id).is_none() {
                counts.inserts += 1;
            }
        }
        // Positions of surviving columns, in both orders.
        let old_order: Vec<&ColumnId> = self
            .columns
            .iter()
            .filter(|c| new.column_by_id(&c.id).is_some())
            .map(|c| &c.id)
            .collect();
        let new_order: Vec<&ColumnId> = new
            .columns
            .iter()
            .filter(|c| self.column_by_id(&c.id).is_some())
            .map(|c| &c.id)
            .collect();
        counts.reorders = old_order
            .iter()
            .zip(&new_order)
            .filter(|(a, b)| a != b)
            .count();
        counts
    }

    /// Checks a whole row against this schema, returning the name of the
    /// first column whose value violates its type.
    pub fn find_violation(&self, row: &[Value]) -> Option<&str> {
        self.columns
            .iter()
            .zip(row)
            .find(|(col, value)| !col.data_type.accepts(value))
            .map(|(col, _)| col.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_schema() -> Schema {
        Schema::new(vec![
            Column::new("fid", DataType::Integer { size: 64 }, Some(0)),
            Column::new(
                "geom",
                DataType::Geometry {
                    geometry_type: "POINT".to_string(),
                    crs_name: Some("EPSG:4326".to_string()),
                },
                None,
            ),
            Column::new("name", DataType::Text { length: None }, None),
        ])
    }

    #[test]
    fn test_json_roundtrip() {
        let schema = sample_schema();
        let json = schema.to_json();
        let parsed = Schema::from_json(&json).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn test_column_id_display_roundtrip() {
        let id = encode_column_id("fid", &DataType::Integer { size: 64 }, b"salt");
        let s = id.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(ColumnId::try_from_str(&s), Some(id));
    }

    #[test]
    fn test_encode_column_id_deterministic() {
        let a = encode_column_id("name", &DataType::Text { length: None }, b"x");
        let b = encode_column_id("name", &DataType::Text { length: None }, b"x");
        let c = encode_column_id("name", &DataType::Text { length: None }, b"y");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_aligned_to_preserves_ids() {
        let old = sample_schema();
        // Rebuilt from an external source: same names/types, fresh ids, plus
        // one new column.
        let mut columns: Vec<Column> = old
            .columns()
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.id = encode_column_id(&c.name, &c.data_type, b"different-salt");
                c
            })
            .collect();
        columns.push(Column::new("added", DataType::Boolean, None));
        let aligned = Schema::new(columns).aligned_to(&old);

        for old_col in old.columns() {
            assert_eq!(aligned.column_by_name(&old_col.name).unwrap().id, old_col.id);
        }
        assert!(aligned.column_by_name("added").is_some());
    }

    #[test]
    fn test_diff_type_counts() {
        let old = sample_schema();
        let mut new_cols: Vec<Column> = old.columns().to_vec();
        new_cols[2].name = "title".to_string(); // rename keeps the id
        new_cols.push(Column::new("extra", DataType::Float { size: 64 }, None));
        let new = Schema::new(new_cols);
        let counts = old.diff_type_counts(&new);
        assert_eq!(counts.inserts, 1);
        assert_eq!(counts.deletes, 0);
        assert_eq!(counts.renames, 1);
        assert_eq!(counts.type_updates, 0);
        assert_eq!(counts.pk_updates, 0);
        assert_eq!(counts.reorders, 0);
        assert!(counts.only_adds_and_deletes() || counts.renames == 1);
    }

    #[test]
    fn test_add_then_remove_does_not_perturb_ids() {
        let original = sample_schema();
        let mut with_extra = original.columns().to_vec();
        with_extra.insert(1, Column::new("flag", DataType::Boolean, None));
        let second = Schema::new(with_extra).aligned_to(&original);

        let third_cols: Vec<Column> = second
            .columns()
            .iter()
            .filter(|c| c.name != "flag")
            .cloned()
            .collect();
        let third = Schema::new(third_cols).aligned_to(&second);

        assert_eq!(third, original);
    }

    #[test]
    fn test_find_violation() {
        let schema = sample_schema();
        let ok = vec![
            Value::Integer(1),
            Value::Null,
            Value::Text("x".to_string()),
        ];
        assert_eq!(schema.find_violation(&ok), None);
        let bad = vec![
            Value::Text("not an int".to_string()),
            Value::Null,
            Value::Null,
        ];
        assert_eq!(schema.find_violation(&bad), Some("fid"));
    }
}
