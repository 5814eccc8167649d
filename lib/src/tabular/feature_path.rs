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
//! Maps a primary-key tuple to a bounded-fanout tree path.
//!
//! The canonical key encoding is the MessagePack array of the key values.
//! Its blake2b hash spreads features across `levels` levels of `branches`-way
//! fanout so that no tree grows beyond a few hundred entries; the leaf
//! filename is URL-safe base64 of the canonical encoding, so the key tuple is
//! recoverable from the leaf alone. Two distinct keys may collide on the
//! prefix path but never on the leaf filename.
//!
//! The parameters are stored in the dataset's `meta/path-structure.json` so
//! that they can evolve; readers honour whatever a dataset declares.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use blake2::Blake2b512;
use digest::Digest as _;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::path::TreePathBuf;
use crate::value::MsgpackReader;
use crate::value::Value;
use crate::value::encode_array_len;
use crate::value::encode_value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathDecodeError {
    #[error("Feature filename is not valid base64: {0}")]
    BadBase64(String),
    #[error("Feature filename does not decode to a key tuple: {0}")]
    BadKeyEncoding(String),
    #[error("Unsupported path-structure: {0}")]
    UnsupportedStructure(String),
}

/// The fanout parameters of a dataset's feature tree, persisted as
/// `meta/path-structure.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStructure {
    pub scheme: String,
    pub branches: u32,
    pub levels: u32,
    pub encoding: String,
}

impl Default for PathStructure {
    fn default() -> Self {
        Self {
            scheme: "msgpack/hash".to_string(),
            branches: 256,
            levels: 2,
            encoding: "base64url".to_string(),
        }
    }
}

impl PathStructure {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, PathDecodeError> {
        let structure: Self = serde_json::from_slice(bytes)
            .map_err(|e| PathDecodeError::UnsupportedStructure(e.to_string()))?;
        structure.check_supported()?;
        Ok(structure)
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec_pretty(self).unwrap();
        bytes.push(b'\n');
        bytes
    }

    fn check_supported(&self) -> Result<(), PathDecodeError> {
        if self.scheme != "msgpack/hash"
            || self.encoding != "base64url"
            || self.branches != 256
            || !(1..=4).contains(&self.levels)
        {
            return Err(PathDecodeError::UnsupportedStructure(format!(
                "{self:?}"
            )));
        }
        Ok(())
    }

    /// The dataset-relative path (below `feature/`) for the given key.
    pub fn encode_path(&self, pk: &[Value]) -> TreePathBuf {
        let canonical = encode_pk_canonical(pk);
        let digest = Blake2b512::digest(&canonical);
        let mut path = String::new();
        for level in 0..self.levels as usize {
            path.push_str(&hex::encode([digest[level]]));
            path.push('/');
        }
        path.push_str(&URL_SAFE_NO_PAD.encode(&canonical));
        TreePathBuf::from_internal_string(path).unwrap()
    }

    /// The first subtree name for the given key; the unit of distribution for
    /// parallel import.
    pub fn partition_name(&self, pk: &[Value]) -> String {
        let canonical = encode_pk_canonical(pk);
        let digest = Blake2b512::digest(&canonical);
        hex::encode([digest[0]])
    }

    /// All possible first-level subtree names.
    pub fn tree_names(&self) -> impl Iterator<Item = String> {
        (0..=255u8).map(|b| hex::encode([b]))
    }
}

/// Canonical encoding of a primary-key tuple: integers are encoded
/// sign-aware at minimal width and strings as UTF-8, so the encoding is
/// platform-independent and injective.
pub fn encode_pk_canonical(pk: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_array_len(&mut buf, pk.len() as u32);
    for value in pk {
        encode_value(&mut buf, value);
    }
    buf
}

pub fn decode_pk_canonical(bytes: &[u8]) -> Result<Vec<Value>, PathDecodeError> {
    let mut reader = MsgpackReader::new(bytes);
    let bad = |e: crate::value::ValueDecodeError| PathDecodeError::BadKeyEncoding(e.to_string());
    let len = reader.read_array_len().map_err(bad)?;
    let mut pk = Vec::with_capacity(len as usize);
    for _ in 0..len {
        pk.push(reader.read_value().map_err(bad)?);
    }
    if !reader.at_end() {
        return Err(PathDecodeError::BadKeyEncoding(
            "trailing bytes after key tuple".to_string(),
        ));
    }
    Ok(pk)
}

/// Recovers the primary-key tuple from a feature leaf filename.
pub fn decode_leaf(leaf: &str) -> Result<Vec<Value>, PathDecodeError> {
    let canonical = URL_SAFE_NO_PAD
        .decode(leaf)
        .map_err(|_| PathDecodeError::BadBase64(leaf.to_string()))?;
    decode_pk_canonical(&canonical)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(vec![Value::Integer(1)]; "small int")]
    #[test_case(vec![Value::Integer(-99999)]; "negative int")]
    #[test_case(vec![Value::Integer(i64::MAX)]; "large int")]
    #[test_case(vec![Value::Text("ügly/keys&stuff".to_string())]; "unicode text")]
    #[test_case(vec![Value::Integer(7), Value::Text("b".to_string())]; "composite")]
    fn test_path_roundtrip(pk: Vec<Value>) {
        let structure = PathStructure::default();
        let path = structure.encode_path(&pk);
        let leaf = path.components().next_back().unwrap();
        assert_eq!(decode_leaf(leaf.as_internal_str()).unwrap(), pk);
    }

    #[test]
    fn test_path_shape() {
        let structure = PathStructure::default();
        let path = structure.encode_path(&[Value::Integer(42)]);
        let components: Vec<_> = path
            .components()
            .map(|c| c.as_internal_str().to_string())
            .collect();
        assert_eq!(components.len(), 3);
        assert_eq!(components[0].len(), 2);
        assert_eq!(components[1].len(), 2);
        assert_eq!(components[0], structure.partition_name(&[Value::Integer(42)]));
    }

    #[test]
    fn test_path_is_stable() {
        // The path for a given key must never change across releases; it is
        // part of the on-disk format.
        let structure = PathStructure::default();
        let a = structure.encode_path(&[Value::Integer(3)]);
        let b = structure.encode_path(&[Value::Integer(3)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_structure_json_roundtrip() {
        let structure = PathStructure::default();
        let parsed = PathStructure::from_json_bytes(&structure.to_json_bytes()).unwrap();
        assert_eq!(parsed, structure);
    }

    #[test]
    fn test_unsupported_structure_rejected() {
        let json = br#"{"scheme":"other","branches":64,"levels":9,"encoding":"hex"}"#;
        assert!(PathStructure::from_json_bytes(json).is_err());
    }

    #[test]
    fn test_tree_names() {
        let structure = PathStructure::default();
        let names: Vec<_> = structure.tree_names().collect();
        assert_eq!(names.len(), 256);
        assert_eq!(names[0], "00");
        assert_eq!(names[255], "ff");
    }
}
