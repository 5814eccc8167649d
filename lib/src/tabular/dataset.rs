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
//! Reader for tabular datasets: meta items, feature iteration, random-access
//! feature lookup, and feature diffing.

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing::instrument;

use crate::dataset::DatasetError;
use crate::dataset::DatasetResult;
use crate::dataset::DatasetType;
use crate::dataset::FEATURE_DIRNAME;
use crate::dataset::read_meta_items;
use crate::diff::Delta;
use crate::diff::DeltaDiff;
use crate::diff::ItemValue;
use crate::path::TreePath;
use crate::path::TreePathBuf;
use crate::schema::Schema;
use crate::spatial_filter::DatasetFilter;
use crate::tabular::Row;
use crate::tabular::codec;
use crate::tabular::codec::Legend;
use crate::tabular::feature_path;
use crate::tabular::feature_path::PathStructure;
use crate::tree::Tree;
use crate::tree::TreeEntriesIterator;
use crate::tree::diff_trees;
use crate::value::Value;
use crate::value::pk_to_track_text;

pub const SCHEMA_META_ITEM: &str = "schema.json";
pub const PATH_STRUCTURE_META_ITEM: &str = "path-structure.json";
pub const LEGEND_META_DIR: &str = "legend";

#[derive(Debug, Clone)]
pub struct TableDataset {
    path: String,
    tree: Tree,
    dataset_type: DatasetType,
    schema: Schema,
    path_structure: PathStructure,
    legends: HashMap<Vec<u8>, Legend>,
}

impl TableDataset {
    pub fn open(path: String, tree: Tree) -> DatasetResult<Self> {
        let meta_items = read_meta_items(&tree)?;
        let version_text = match meta_items.get(crate::dataset::VERSION_META_ITEM) {
            Some(ItemValue::Text(text)) => text.trim().to_string(),
            _ => String::new(),
        };
        let dataset_type = match version_text.as_str() {
            "2" => DatasetType::TableV2,
            "3" => DatasetType::TableV3,
            _ => {
                return Err(DatasetError::UnsupportedDatasetVersion {
                    path,
                    version: version_text,
                });
            }
        };
        let schema = match meta_items.get(SCHEMA_META_ITEM) {
            Some(ItemValue::Json(json)) => Schema::from_json(json)?,
            _ => {
                return Err(DatasetError::MissingMetaItem {
                    path,
                    item: SCHEMA_META_ITEM.to_string(),
                });
            }
        };
        let path_structure = match meta_items.get(PATH_STRUCTURE_META_ITEM) {
            Some(ItemValue::Json(json)) => {
                PathStructure::from_json_bytes(&serde_json::to_vec(json).unwrap())?
            }
            _ => PathStructure::default(),
        };
        // Legends are binary msgpack; read them straight from the tree rather
        // than through the text-oriented meta map.
        let mut legends = HashMap::new();
        let meta_name = crate::path::TreePathComponent::new(crate::dataset::META_DIRNAME).unwrap();
        if let Some(meta_tree) = tree.sub_tree(meta_name)? {
            let legend_dir = crate::path::TreePathComponent::new(LEGEND_META_DIR).unwrap();
            if let Some(legend_tree) = meta_tree.sub_tree(legend_dir)? {
                for entry in legend_tree.entries_recursive() {
                    let (blob_path, blob_id) = entry?;
                    let bytes = tree.store().read_blob(&blob_id)?;
                    let legend = Legend::decode(&bytes)?;
                    // Key by the blob's own name: a foreign writer may have
                    // serialised the same legend with different framing.
                    let name = blob_path.components().next_back().unwrap();
                    if let Ok(named_hash) = hex::decode(name.as_internal_str()) {
                        legends.insert(named_hash, legend.clone());
                    }
                    legends.insert(legend.hash().to_vec(), legend);
                }
            }
        }
        Ok(Self {
            path,
            tree,
            dataset_type,
            schema,
            path_structure,
            legends,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn dataset_type(&self) -> DatasetType {
        self.dataset_type
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path_structure(&self) -> &PathStructure {
        &self.path_structure
    }

    pub fn current_legend(&self) -> Legend {
        Legend::from_schema(&self.schema)
    }

    pub fn meta_items(&self) -> DatasetResult<BTreeMap<String, ItemValue>> {
        read_meta_items(&self.tree)
    }

    /// CRS definitions attached to this dataset: identifier → WKT.
    pub fn crs_definitions(&self) -> DatasetResult<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        for (name, value) in self.meta_items()? {
            if let (Some(id), ItemValue::Text(wkt)) = (
                name.strip_prefix("crs/").and_then(|n| n.strip_suffix(".wkt")),
                &value,
            ) {
                result.insert(id.to_string(), wkt.clone());
            }
        }
        Ok(result)
    }

    /// The WKT of the CRS attached to this dataset's geometry column, if any.
    pub fn geometry_crs_wkt(&self) -> DatasetResult<Option<String>> {
        let crs_name = self.schema.geometry_columns().first().and_then(|col| {
            match &col.data_type {
                crate::schema::DataType::Geometry { crs_name, .. } => crs_name.clone(),
                _ => None,
            }
        });
        let Some(crs_name) = crs_name else {
            return Ok(None);
        };
        Ok(self.crs_definitions()?.remove(&crs_name))
    }

    fn feature_tree(&self) -> DatasetResult<Option<Tree>> {
        let name = crate::path::TreePathComponent::new(FEATURE_DIRNAME).unwrap();
        Ok(self.tree.sub_tree(name)?)
    }

    /// The dataset-relative path of the feature with the given key.
    pub fn encode_feature_path(&self, pk: &[Value]) -> TreePathBuf {
        TreePath::from_internal_string(FEATURE_DIRNAME)
            .unwrap()
            .concat(&self.path_structure.encode_path(pk))
    }

    /// Encodes a row into `(dataset-relative path, blob bytes)` using the
    /// current schema's legend.
    pub fn encode_feature_blob(&self, row: &Row) -> DatasetResult<(TreePathBuf, Vec<u8>)> {
        let legend = self.current_legend();
        let pk = self.pk_values(row);
        let blob = codec::encode_feature(&self.schema, &legend, row)?;
        Ok((self.encode_feature_path(&pk), blob))
    }

    /// Extracts the primary-key values from a row (ordered per pk index).
    pub fn pk_values(&self, row: &Row) -> Vec<Value> {
        self.schema
            .pk_columns()
            .iter()
            .map(|col| {
                let position = self
                    .schema
                    .columns()
                    .iter()
                    .position(|c| c.id == col.id)
                    .unwrap();
                row[position].clone()
            })
            .collect()
    }

    fn decode_blob(&self, pk: &[Value], bytes: &[u8]) -> DatasetResult<Row> {
        Ok(codec::decode_feature(&self.schema, pk, bytes, |hash| {
            self.legends.get(hash).cloned()
        })?)
    }

    /// Lazily iterates every feature. Finite and non-restartable; iteration
    /// order follows the hashed path order, which is deterministic for a
    /// given tree.
    pub fn features(&self) -> FeatureIter<'_> {
        let walk = match self.feature_tree() {
            Ok(Some(tree)) => Some(tree.entries_recursive()),
            Ok(None) => None,
            Err(err) => {
                return FeatureIter {
                    dataset: self,
                    walk: None,
                    pending_error: Some(err),
                };
            }
        };
        FeatureIter {
            dataset: self,
            walk,
            pending_error: None,
        }
    }

    pub fn feature_count(&self) -> DatasetResult<usize> {
        let mut count = 0;
        for feature in self.features() {
            feature?;
            count += 1;
        }
        Ok(count)
    }

    /// O(log N) lookup of a feature by primary key.
    pub fn get_feature(&self, pk: &[Value]) -> DatasetResult<Row> {
        self.try_get_feature(pk)?
            .ok_or_else(|| DatasetError::FeatureNotFound {
                path: self.path.clone(),
                key: pk_to_track_text(pk),
            })
    }

    pub fn try_get_feature(&self, pk: &[Value]) -> DatasetResult<Option<Row>> {
        let path = self.encode_feature_path(pk);
        let Some(value) = self.tree.path_value_relative(&path)? else {
            return Ok(None);
        };
        let crate::backend::TreeValue::Blob(blob_id) = value else {
            return Ok(None);
        };
        let bytes = self.tree.store().read_blob(&blob_id)?;
        Ok(Some(self.decode_blob(pk, &bytes)?))
    }

    /// Batch lookup. Missing keys either error (default) or are skipped.
    pub fn get_features<'a>(
        &'a self,
        pks: impl IntoIterator<Item = Vec<Value>> + 'a,
        ignore_missing: bool,
    ) -> impl Iterator<Item = DatasetResult<Row>> + 'a {
        pks.into_iter().filter_map(move |pk| {
            match self.try_get_feature(&pk) {
                Ok(Some(row)) => Some(Ok(row)),
                Ok(None) if ignore_missing => None,
                Ok(None) => Some(Err(DatasetError::FeatureNotFound {
                    path: self.path.clone(),
                    key: pk_to_track_text(&pk),
                })),
                Err(err) => Some(Err(err)),
            }
        })
    }

    /// Raw feature blob lookup, used by the importer for deduplication.
    pub fn get_feature_blob(
        &self,
        rel_path: &TreePath,
    ) -> DatasetResult<Option<(crate::backend::BlobId, Vec<u8>)>> {
        let Some(value) = self.tree.path_value_relative(rel_path)? else {
            return Ok(None);
        };
        let crate::backend::TreeValue::Blob(blob_id) = value else {
            return Ok(None);
        };
        let bytes = self.tree.store().read_blob(&blob_id)?;
        Ok(Some((blob_id, bytes)))
    }

    /// `(meta-item name, bytes)` pairs for every legend this dataset carries,
    /// so that a replacing import can preserve them.
    pub fn legend_blobs(&self) -> Vec<(String, Vec<u8>)> {
        let mut result: Vec<(String, Vec<u8>)> = self
            .legends
            .values()
            .map(|legend| {
                (
                    format!("{LEGEND_META_DIR}/{}", legend.hex_hash()),
                    legend.encode(),
                )
            })
            .collect();
        result.sort();
        result
    }

    /// Diffs the feature sections of two datasets. Either side may be absent
    /// (dataset created or deleted). Features not matching `filter` are
    /// neither reported as inserts nor as deletes.
    #[instrument(skip_all, fields(dataset = old.or(new).map(|ds| ds.path())))]
    pub fn diff_feature(
        old: Option<&Self>,
        new: Option<&Self>,
        filter: &DatasetFilter,
    ) -> DatasetResult<DeltaDiff> {
        let old_tree = old.map(|ds| ds.feature_tree()).transpose()?.flatten();
        let new_tree = new.map(|ds| ds.feature_tree()).transpose()?.flatten();
        let mut result = DeltaDiff::new();
        for entry in diff_trees(old_tree.as_ref(), new_tree.as_ref())? {
            let leaf = entry
                .path
                .components()
                .next_back()
                .unwrap()
                .as_internal_str()
                .to_string();
            let pk = feature_path::decode_leaf(&leaf)?;
            let key = pk_to_track_text(&pk);
            let old_row = match (&entry.old, old) {
                (Some(blob_id), Some(ds)) => {
                    let bytes = ds.tree.store().read_blob(blob_id)?;
                    Some(ds.decode_blob(&pk, &bytes)?)
                }
                _ => None,
            };
            let new_row = match (&entry.new, new) {
                (Some(blob_id), Some(ds)) => {
                    let bytes = ds.tree.store().read_blob(blob_id)?;
                    Some(ds.decode_blob(&pk, &bytes)?)
                }
                _ => None,
            };
            let old_row = old_row.filter(|row| filter.matches_row(old.unwrap().schema(), row));
            let new_row = new_row.filter(|row| filter.matches_row(new.unwrap().schema(), row));
            match (old_row, new_row) {
                (Some(old_row), Some(new_row)) => {
                    result.add_delta(Delta::update(
                        key.clone(),
                        ItemValue::Feature(old_row),
                        key,
                        ItemValue::Feature(new_row),
                    ));
                }
                (Some(old_row), None) => {
                    result.add_delta(Delta::delete(key, ItemValue::Feature(old_row)));
                }
                (None, Some(new_row)) => {
                    result.add_delta(Delta::insert(key, ItemValue::Feature(new_row)));
                }
                (None, None) => {}
            }
        }
        Ok(result)
    }
}

/// Lazy feature sequence over a dataset's feature subtree.
pub struct FeatureIter<'a> {
    dataset: &'a TableDataset,
    walk: Option<TreeEntriesIterator>,
    pending_error: Option<DatasetError>,
}

impl Iterator for FeatureIter<'_> {
    type Item = DatasetResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        let walk = self.walk.as_mut()?;
        let (path, blob_id) = match walk.next()? {
            Ok(entry) => entry,
            Err(err) => return Some(Err(err.into())),
        };
        let leaf = path.components().next_back().unwrap();
        let pk = match feature_path::decode_leaf(leaf.as_internal_str()) {
            Ok(pk) => pk,
            Err(err) => return Some(Err(err.into())),
        };
        let bytes = match self.dataset.tree.store().read_blob(&blob_id) {
            Ok(bytes) => bytes,
            Err(err) => return Some(Err(err.into())),
        };
        Some(self.dataset.decode_blob(&pk, &bytes))
    }
}
