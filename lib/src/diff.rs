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
//! Diff structures: deltas keyed by `(dataset path, section, item key)`.
//!
//! A delta has an old and/or a new half; each half is a `(key, value)` pair.
//! Meta values are small and loaded eagerly; feature scans stream lazily and
//! only materialise into these maps once a command collects them.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::tabular::Row;
use crate::tile::TileEntry;

/// The three item sections of a dataset diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiffSection {
    Meta,
    Feature,
    Tile,
}

impl DiffSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Feature => "feature",
            Self::Tile => "tile",
        }
    }
}

/// The value carried by one half of a delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemValue {
    /// A plain-text meta item (title, description, WKT, XML).
    Text(String),
    /// A JSON meta item (schema.json, format.json, path-structure.json).
    Json(serde_json::Value),
    /// A feature row, ordered per the dataset schema.
    Feature(Row),
    /// A tile pointer entry.
    Tile(TileEntry),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Insert,
    Update,
    Delete,
}

/// One changed item: an old half, a new half, or both. Each half is the item
/// key plus its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    pub old: Option<(String, ItemValue)>,
    pub new: Option<(String, ItemValue)>,
}

impl Delta {
    pub fn insert(key: impl Into<String>, value: ItemValue) -> Self {
        Self {
            old: None,
            new: Some((key.into(), value)),
        }
    }

    pub fn delete(key: impl Into<String>, value: ItemValue) -> Self {
        Self {
            old: Some((key.into(), value)),
            new: None,
        }
    }

    pub fn update(
        old_key: impl Into<String>,
        old_value: ItemValue,
        new_key: impl Into<String>,
        new_value: ItemValue,
    ) -> Self {
        Self {
            old: Some((old_key.into(), old_value)),
            new: Some((new_key.into(), new_value)),
        }
    }

    pub fn kind(&self) -> DeltaKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => DeltaKind::Insert,
            (Some(_), None) => DeltaKind::Delete,
            (Some(_), Some(_)) => DeltaKind::Update,
            (None, None) => unreachable!("delta with no halves"),
        }
    }

    /// The key this delta is filed under: the new key if present, else the
    /// old one.
    pub fn key(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|(key, _)| key.as_str())
            .unwrap()
    }

    pub fn old_value(&self) -> Option<&ItemValue> {
        self.old.as_ref().map(|(_, value)| value)
    }

    pub fn new_value(&self) -> Option<&ItemValue> {
        self.new.as_ref().map(|(_, value)| value)
    }
}

/// An ordered collection of deltas for one section of one dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaDiff {
    deltas: BTreeMap<String, Delta>,
}

impl DeltaDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_delta(&mut self, delta: Delta) {
        self.deltas.insert(delta.key().to_string(), delta);
    }

    pub fn remove(&mut self, key: &str) -> Option<Delta> {
        self.deltas.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Delta> {
        self.deltas.get(key)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Delta)> {
        self.deltas.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values()
    }

    pub fn into_values(self) -> impl Iterator<Item = Delta> {
        self.deltas.into_values()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let mut inserts = 0;
        let mut updates = 0;
        let mut deletes = 0;
        for delta in self.deltas.values() {
            match delta.kind() {
                DeltaKind::Insert => inserts += 1,
                DeltaKind::Update => updates += 1,
                DeltaKind::Delete => deletes += 1,
            }
        }
        (inserts, updates, deletes)
    }

    /// Builds a diff of two key→value maps.
    pub fn diff_maps(
        old: &BTreeMap<String, ItemValue>,
        new: &BTreeMap<String, ItemValue>,
    ) -> Self {
        let mut result = Self::new();
        for (key, old_value) in old {
            match new.get(key) {
                None => result.add_delta(Delta::delete(key.clone(), old_value.clone())),
                Some(new_value) if new_value != old_value => {
                    result.add_delta(Delta::update(
                        key.clone(),
                        old_value.clone(),
                        key.clone(),
                        new_value.clone(),
                    ));
                }
                Some(_) => {}
            }
        }
        for (key, new_value) in new {
            if !old.contains_key(key) {
                result.add_delta(Delta::insert(key.clone(), new_value.clone()));
            }
        }
        result
    }
}

impl IntoIterator for DeltaDiff {
    type Item = (String, Delta);
    type IntoIter = std::collections::btree_map::IntoIter<String, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.into_iter()
    }
}

impl FromIterator<Delta> for DeltaDiff {
    fn from_iter<T: IntoIterator<Item = Delta>>(iter: T) -> Self {
        let mut result = Self::new();
        for delta in iter {
            result.add_delta(delta);
        }
        result
    }
}

/// All changes to one dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetDiff {
    pub meta: DeltaDiff,
    pub feature: DeltaDiff,
    pub tile: DeltaDiff,
}

impl DatasetDiff {
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.feature.is_empty() && self.tile.is_empty()
    }

    pub fn section(&self, section: DiffSection) -> &DeltaDiff {
        match section {
            DiffSection::Meta => &self.meta,
            DiffSection::Feature => &self.feature,
            DiffSection::Tile => &self.tile,
        }
    }
}

/// All changes in a repository, keyed by dataset path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoDiff {
    datasets: BTreeMap<String, DatasetDiff>,
}

impl RepoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset_path: impl Into<String>, diff: DatasetDiff) {
        self.datasets.insert(dataset_path.into(), diff);
    }

    pub fn get(&self, dataset_path: &str) -> Option<&DatasetDiff> {
        self.datasets.get(dataset_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DatasetDiff)> {
        self.datasets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.values().all(DatasetDiff::is_empty)
    }

    /// Drops datasets whose diff came out empty.
    pub fn prune(&mut self) {
        self.datasets.retain(|_, diff| !diff.is_empty());
    }
}

impl IntoIterator for RepoDiff {
    type Item = (String, DatasetDiff);
    type IntoIter = std::collections::btree_map::IntoIter<String, DatasetDiff>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.into_iter()
    }
}

/// Above this many inserts+deletes, rename detection is not worth the blob
/// hashing.
const FIND_RENAMES_MAX_DELTAS: usize = 400;

/// Matches inserts + deletes into renames on a best-effort basis: at most one
/// matching insert and delete merge into an update per content hash. Modifies
/// `feature_diff` in place. `content_hash` returns a stable hash of a value's
/// encoded form, or None if the value cannot be hashed.
pub fn find_renames(
    feature_diff: &mut DeltaDiff,
    mut content_hash: impl FnMut(&ItemValue) -> Option<Vec<u8>>,
) {
    let (inserts, _, deletes) = feature_diff.counts();
    if inserts + deletes > FIND_RENAMES_MAX_DELTAS {
        return;
    }
    let mut insert_keys: HashMap<Vec<u8>, String> = HashMap::new();
    let mut delete_keys: HashMap<Vec<u8>, String> = HashMap::new();
    for delta in feature_diff.values() {
        match delta.kind() {
            DeltaKind::Insert => {
                if let Some(hash) = content_hash(delta.new_value().unwrap()) {
                    insert_keys.insert(hash, delta.key().to_string());
                }
            }
            DeltaKind::Delete => {
                if let Some(hash) = content_hash(delta.old_value().unwrap()) {
                    delete_keys.insert(hash, delta.key().to_string());
                }
            }
            DeltaKind::Update => {}
        }
    }
    for (hash, delete_key) in delete_keys {
        if let Some(insert_key) = insert_keys.get(&hash) {
            let delete_delta = feature_diff.remove(&delete_key).unwrap();
            let insert_delta = feature_diff.remove(insert_key).unwrap();
            feature_diff.add_delta(Delta {
                old: delete_delta.old,
                new: insert_delta.new,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn feature(values: Vec<Value>) -> ItemValue {
        ItemValue::Feature(values)
    }

    #[test]
    fn test_delta_kind_and_key() {
        let insert = Delta::insert("5", feature(vec![Value::Integer(5)]));
        assert_eq!(insert.kind(), DeltaKind::Insert);
        assert_eq!(insert.key(), "5");

        let update = Delta::update(
            "5",
            feature(vec![Value::Integer(5)]),
            "6",
            feature(vec![Value::Integer(6)]),
        );
        assert_eq!(update.kind(), DeltaKind::Update);
        assert_eq!(update.key(), "6");
    }

    #[test]
    fn test_diff_maps() {
        let mut old = BTreeMap::new();
        old.insert("title".to_string(), ItemValue::Text("Old".to_string()));
        old.insert("keep".to_string(), ItemValue::Text("same".to_string()));
        old.insert("gone".to_string(), ItemValue::Text("bye".to_string()));
        let mut new = BTreeMap::new();
        new.insert("title".to_string(), ItemValue::Text("New".to_string()));
        new.insert("keep".to_string(), ItemValue::Text("same".to_string()));
        new.insert("added".to_string(), ItemValue::Text("hi".to_string()));

        let diff = DeltaDiff::diff_maps(&old, &new);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff.get("title").unwrap().kind(), DeltaKind::Update);
        assert_eq!(diff.get("gone").unwrap().kind(), DeltaKind::Delete);
        assert_eq!(diff.get("added").unwrap().kind(), DeltaKind::Insert);
        assert_eq!(diff.get("keep"), None);
    }

    #[test]
    fn test_find_renames() {
        let mut diff = DeltaDiff::new();
        let moved = vec![Value::Null, Value::Text("same content".to_string())];
        diff.add_delta(Delta::delete("1", feature(moved.clone())));
        diff.add_delta(Delta::insert("2", feature(moved.clone())));
        diff.add_delta(Delta::insert(
            "3",
            feature(vec![Value::Text("unrelated".to_string())]),
        ));

        find_renames(&mut diff, |value| match value {
            ItemValue::Feature(row) => Some(format!("{row:?}").into_bytes()),
            _ => None,
        });

        assert_eq!(diff.len(), 2);
        let rename = diff.get("2").unwrap();
        assert_eq!(rename.kind(), DeltaKind::Update);
        assert_eq!(rename.old.as_ref().unwrap().0, "1");
        assert_eq!(diff.get("3").unwrap().kind(), DeltaKind::Insert);
    }

    #[test]
    fn test_repo_diff_prune() {
        let mut repo_diff = RepoDiff::new();
        repo_diff.insert("empty", DatasetDiff::default());
        let mut ds = DatasetDiff::default();
        ds.feature
            .add_delta(Delta::insert("1", feature(vec![Value::Integer(1)])));
        repo_diff.insert("full", ds);
        repo_diff.prune();
        assert!(repo_diff.get("empty").is_none());
        assert!(repo_diff.get("full").is_some());
    }
}
