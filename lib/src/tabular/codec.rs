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
//! The feature blob codec.
//!
//! A feature blob is the MessagePack array `[legend_hash, [values…]]`. The
//! legend (stored once per schema under `meta/legend/<hash>`) lists the
//! column ids the values were encoded against, primary-key columns first.
//! Primary-key values are not stored in the blob at all; they are recovered
//! from the feature's path. Pairing values with column ids rather than with
//! ordinal positions is what makes old blobs decodable after columns are
//! added or removed.

use std::collections::HashMap;

use blake2::Blake2b512;
use digest::Digest as _;
use thiserror::Error;

use crate::schema::ColumnId;
use crate::schema::Schema;
use crate::tabular::Row;
use crate::value::MsgpackReader;
use crate::value::Value;
use crate::value::ValueDecodeError;
use crate::value::encode_array_len;
use crate::value::encode_bin;
use crate::value::encode_value;

/// Length of a legend hash in bytes.
pub const LEGEND_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Corrupt feature blob: {0}")]
    CorruptBlob(String),
    #[error("Feature blob references unknown legend {0}")]
    UnknownLegend(String),
    #[error("Value for column {column:?} violates its type")]
    SchemaViolation { column: String },
}

impl From<ValueDecodeError> for CodecError {
    fn from(err: ValueDecodeError) -> Self {
        Self::CorruptBlob(err.to_string())
    }
}

/// The ordered column-id list a group of feature blobs was encoded against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Legend {
    pk_ids: Vec<ColumnId>,
    non_pk_ids: Vec<ColumnId>,
}

impl Legend {
    pub fn from_schema(schema: &Schema) -> Self {
        let pk_ids = schema.pk_columns().iter().map(|c| c.id).collect();
        let non_pk_ids = schema
            .columns()
            .iter()
            .filter(|c| c.pk_index.is_none())
            .map(|c| c.id)
            .collect();
        Self { pk_ids, non_pk_ids }
    }

    pub fn pk_ids(&self) -> &[ColumnId] {
        &self.pk_ids
    }

    pub fn non_pk_ids(&self) -> &[ColumnId] {
        &self.non_pk_ids
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_array_len(&mut buf, 2);
        for ids in [&self.pk_ids, &self.non_pk_ids] {
            encode_array_len(&mut buf, ids.len() as u32);
            for id in ids {
                encode_value(&mut buf, &Value::Text(id.to_string()));
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = MsgpackReader::new(bytes);
        let outer = reader.read_array_len()?;
        if outer != 2 {
            return Err(CodecError::CorruptBlob(format!(
                "legend has {outer} sections, expected 2"
            )));
        }
        let mut sections = Vec::with_capacity(2);
        for _ in 0..2 {
            let len = reader.read_array_len()?;
            let mut ids = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match reader.read_value()? {
                    Value::Text(s) => {
                        let id = ColumnId::try_from_str(&s).ok_or_else(|| {
                            CodecError::CorruptBlob(format!("bad column id {s:?} in legend"))
                        })?;
                        ids.push(id);
                    }
                    other => {
                        return Err(CodecError::CorruptBlob(format!(
                            "unexpected legend entry {other:?}"
                        )));
                    }
                }
            }
            sections.push(ids);
        }
        let non_pk_ids = sections.pop().unwrap();
        let pk_ids = sections.pop().unwrap();
        Ok(Self { pk_ids, non_pk_ids })
    }

    /// Content hash of the encoded legend; the legend's name under
    /// `meta/legend/`.
    pub fn hash(&self) -> [u8; LEGEND_HASH_LEN] {
        let digest = Blake2b512::digest(self.encode());
        digest[..LEGEND_HASH_LEN].try_into().unwrap()
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash())
    }
}

/// Encodes a row (ordered per `schema`) into a feature blob. The primary-key
/// values are omitted; they live in the path.
pub fn encode_feature(schema: &Schema, legend: &Legend, row: &Row) -> Result<Vec<u8>, CodecError> {
    if let Some(column) = schema.find_violation(row) {
        return Err(CodecError::SchemaViolation {
            column: column.to_string(),
        });
    }
    let by_id: HashMap<ColumnId, &Value> = schema
        .columns()
        .iter()
        .zip(row)
        .map(|(col, value)| (col.id, value))
        .collect();
    let mut buf = Vec::new();
    encode_array_len(&mut buf, 2);
    encode_bin(&mut buf, &legend.hash());
    encode_array_len(&mut buf, legend.non_pk_ids.len() as u32);
    for id in &legend.non_pk_ids {
        encode_value(&mut buf, by_id.get(id).copied().unwrap_or(&Value::Null));
    }
    Ok(buf)
}

/// Reads the legend hash out of a feature blob without decoding the values.
pub fn peek_legend_hash(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut reader = MsgpackReader::new(bytes);
    let outer = reader.read_array_len()?;
    if outer != 2 {
        return Err(CodecError::CorruptBlob(format!(
            "feature blob has {outer} elements, expected 2"
        )));
    }
    Ok(reader.read_bin()?.to_vec())
}

/// Decodes a feature blob into a row ordered per `schema`.
///
/// `pk` carries the primary-key values recovered from the feature's path.
/// `lookup_legend` resolves a legend hash to the legend it names. Columns
/// added since the blob was written decode as Null; values for columns that
/// have since been dropped are ignored.
pub fn decode_feature(
    schema: &Schema,
    pk: &[Value],
    bytes: &[u8],
    mut lookup_legend: impl FnMut(&[u8]) -> Option<Legend>,
) -> Result<Row, CodecError> {
    let mut reader = MsgpackReader::new(bytes);
    let outer = reader.read_array_len()?;
    if outer != 2 {
        return Err(CodecError::CorruptBlob(format!(
            "feature blob has {outer} elements, expected 2"
        )));
    }
    let legend_hash = reader.read_bin()?;
    let legend = lookup_legend(legend_hash)
        .ok_or_else(|| CodecError::UnknownLegend(hex::encode(legend_hash)))?;

    let count = reader.read_array_len()? as usize;
    if count != legend.non_pk_ids.len() {
        return Err(CodecError::CorruptBlob(format!(
            "feature blob has {count} values, legend expects {}",
            legend.non_pk_ids.len()
        )));
    }
    let mut by_id: HashMap<ColumnId, Value> = HashMap::with_capacity(count + pk.len());
    for id in &legend.non_pk_ids {
        by_id.insert(*id, reader.read_value()?);
    }
    if !reader.at_end() {
        return Err(CodecError::CorruptBlob(
            "trailing bytes after feature values".to_string(),
        ));
    }
    if pk.len() != legend.pk_ids.len() {
        return Err(CodecError::CorruptBlob(format!(
            "feature path has {} key values, legend expects {}",
            pk.len(),
            legend.pk_ids.len()
        )));
    }
    for (id, value) in legend.pk_ids.iter().zip(pk) {
        by_id.insert(*id, value.clone());
    }

    let row: Row = schema
        .columns()
        .iter()
        .map(|col| by_id.remove(&col.id).unwrap_or(Value::Null))
        .collect();
    if let Some(column) = schema.find_violation(&row) {
        return Err(CodecError::SchemaViolation {
            column: column.to_string(),
        });
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::schema::DataType;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("fid", DataType::Integer { size: 64 }, Some(0)),
            Column::new("name", DataType::Text { length: None }, None),
            Column::new("rank", DataType::Integer { size: 32 }, None),
        ])
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let schema = schema();
        let legend = Legend::from_schema(&schema);
        let row: Row = vec![
            Value::Integer(3),
            Value::Text("Te Whare".to_string()),
            Value::Null,
        ];
        let blob = encode_feature(&schema, &legend, &row).unwrap();
        let decoded = decode_feature(&schema, &[Value::Integer(3)], &blob, |hash| {
            assert_eq!(hash, legend.hash());
            Some(legend.clone())
        })
        .unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_legend_roundtrip() {
        let legend = Legend::from_schema(&schema());
        let decoded = Legend::decode(&legend.encode()).unwrap();
        assert_eq!(decoded, legend);
        assert_eq!(decoded.hash(), legend.hash());
    }

    #[test]
    fn test_added_column_decodes_as_null() {
        let old_schema = schema();
        let legend = Legend::from_schema(&old_schema);
        let row: Row = vec![
            Value::Integer(1),
            Value::Text("x".to_string()),
            Value::Integer(5),
        ];
        let blob = encode_feature(&old_schema, &legend, &row).unwrap();

        let mut new_cols = old_schema.columns().to_vec();
        new_cols.push(Column::new("added", DataType::Boolean, None));
        let new_schema = Schema::new(new_cols);

        let decoded = decode_feature(&new_schema, &[Value::Integer(1)], &blob, |_| {
            Some(legend.clone())
        })
        .unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[3], Value::Null);
    }

    #[test]
    fn test_dropped_column_value_ignored() {
        let old_schema = schema();
        let legend = Legend::from_schema(&old_schema);
        let row: Row = vec![
            Value::Integer(1),
            Value::Text("x".to_string()),
            Value::Integer(5),
        ];
        let blob = encode_feature(&old_schema, &legend, &row).unwrap();

        let new_cols: Vec<Column> = old_schema
            .columns()
            .iter()
            .filter(|c| c.name != "rank")
            .cloned()
            .collect();
        let new_schema = Schema::new(new_cols);

        let decoded = decode_feature(&new_schema, &[Value::Integer(1)], &blob, |_| {
            Some(legend.clone())
        })
        .unwrap();
        assert_eq!(
            decoded,
            vec![Value::Integer(1), Value::Text("x".to_string())]
        );
    }

    #[test]
    fn test_unknown_legend() {
        let schema = schema();
        let legend = Legend::from_schema(&schema);
        let row: Row = vec![Value::Integer(1), Value::Null, Value::Null];
        let blob = encode_feature(&schema, &legend, &row).unwrap();
        let result = decode_feature(&schema, &[Value::Integer(1)], &blob, |_| None);
        assert!(matches!(result, Err(CodecError::UnknownLegend(_))));
    }

    #[test]
    fn test_malformed_framing() {
        let schema = schema();
        let result = decode_feature(&schema, &[], b"\x93\x01\x02\x03", |_| None);
        assert!(matches!(result, Err(CodecError::CorruptBlob(_))));
    }
}
