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
//! Datasets: named, versioned units of user data inside a commit tree.
//!
//! A tree is a dataset root iff it contains a `meta` subtree with a `version`
//! blob. Tabular datasets additionally hold `meta/schema.json` and a
//! `feature/` subtree; tile datasets hold `meta/format.json` and a `tile/`
//! subtree.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::TreeValue;
use crate::diff::DeltaDiff;
use crate::diff::ItemValue;
use crate::path::TreePath;
use crate::path::TreePathComponent;
use crate::tabular::codec::CodecError;
use crate::tabular::dataset::TableDataset;
use crate::tabular::feature_path::PathDecodeError;
use crate::tile::TileDataset;
use crate::tile::TileError;
use crate::tree::Tree;

pub const META_DIRNAME: &str = "meta";
pub const FEATURE_DIRNAME: &str = "feature";
pub const TILE_DIRNAME: &str = "tile";
pub const VERSION_META_ITEM: &str = "version";

/// The type of a dataset, as recorded in its meta items.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatasetType {
    TableV2,
    TableV3,
    PointCloud,
    Raster,
}

impl DatasetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableV2 => "tabular-v2",
            Self::TableV3 => "tabular-v3",
            Self::PointCloud => "point-cloud",
            Self::Raster => "raster",
        }
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, Self::TableV2 | Self::TableV3)
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Path(#[from] PathDecodeError),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Schema(#[from] crate::schema::SchemaError),
    #[error("Dataset {path} has no {item} meta item")]
    MissingMetaItem { path: String, item: String },
    #[error("Feature {key} not found in dataset {path}")]
    FeatureNotFound { path: String, key: String },
    #[error("Dataset {path} has unsupported version {version:?}")]
    UnsupportedDatasetVersion { path: String, version: String },
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Reads every meta item below the dataset's `meta/` subtree into a map from
/// item name (slash-delimited, relative to `meta/`) to value. `*.json` items
/// parse as JSON; everything else is UTF-8 text.
pub fn read_meta_items(dataset_tree: &Tree) -> DatasetResult<BTreeMap<String, ItemValue>> {
    let mut items = BTreeMap::new();
    let meta_name = TreePathComponent::new(META_DIRNAME).unwrap();
    let Some(meta_tree) = dataset_tree.sub_tree(meta_name)? else {
        return Ok(items);
    };
    for entry in meta_tree.entries_recursive() {
        let (path, blob_id) = entry?;
        let name = path
            .strip_prefix(meta_tree.dir())
            .unwrap()
            .as_internal_file_string()
            .to_string();
        // Legends are internal binary blobs keyed by content hash; they are
        // managed alongside the schema, not as user-visible meta items.
        if name.starts_with("legend/") {
            continue;
        }
        let bytes = dataset_tree.store().read_blob(&blob_id)?;
        let value = meta_item_from_bytes(&name, &bytes);
        items.insert(name, value);
    }
    Ok(items)
}

pub fn meta_item_from_bytes(name: &str, bytes: &[u8]) -> ItemValue {
    if name.ends_with(".json") {
        if let Ok(json) = serde_json::from_slice(bytes) {
            return ItemValue::Json(json);
        }
    }
    ItemValue::Text(String::from_utf8_lossy(bytes).into_owned())
}

pub fn meta_item_to_bytes(value: &ItemValue) -> Vec<u8> {
    match value {
        ItemValue::Json(json) => {
            let mut bytes = serde_json::to_vec_pretty(json).unwrap();
            bytes.push(b'\n');
            bytes
        }
        ItemValue::Text(text) => text.as_bytes().to_vec(),
        other => panic!("not a meta item: {other:?}"),
    }
}

/// Is this tree a dataset root?
pub fn is_dataset_tree(tree: &Tree) -> bool {
    let meta_name = TreePathComponent::new(META_DIRNAME).unwrap();
    match tree.value(meta_name) {
        Some(TreeValue::Tree(_)) => {}
        _ => return false,
    }
    match tree.sub_tree(meta_name) {
        Ok(Some(meta_tree)) => matches!(
            meta_tree.value(TreePathComponent::new(VERSION_META_ITEM).unwrap()),
            Some(TreeValue::Blob(_))
        ),
        _ => false,
    }
}

/// One dataset in a commit tree.
#[derive(Debug, Clone)]
pub enum Dataset {
    Table(TableDataset),
    Tile(TileDataset),
}

impl Dataset {
    /// Opens the dataset rooted at `tree`, deciding its concrete type from
    /// its meta items.
    pub fn open(path: String, tree: Tree) -> DatasetResult<Self> {
        let meta_name = TreePathComponent::new(META_DIRNAME).unwrap();
        let meta_tree =
            tree.sub_tree(meta_name)?
                .ok_or_else(|| DatasetError::MissingMetaItem {
                    path: path.clone(),
                    item: META_DIRNAME.to_string(),
                })?;
        let format_json = TreePathComponent::new("format.json").unwrap();
        if matches!(meta_tree.value(format_json), Some(TreeValue::Blob(_))) {
            Ok(Self::Tile(TileDataset::open(path, tree)?))
        } else {
            Ok(Self::Table(TableDataset::open(path, tree)?))
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Table(ds) => ds.path(),
            Self::Tile(ds) => ds.path(),
        }
    }

    pub fn dataset_type(&self) -> DatasetType {
        match self {
            Self::Table(ds) => ds.dataset_type(),
            Self::Tile(ds) => ds.dataset_type(),
        }
    }

    pub fn tree(&self) -> &Tree {
        match self {
            Self::Table(ds) => ds.tree(),
            Self::Tile(ds) => ds.tree(),
        }
    }

    pub fn meta_items(&self) -> DatasetResult<BTreeMap<String, ItemValue>> {
        match self {
            Self::Table(ds) => ds.meta_items(),
            Self::Tile(ds) => ds.meta_items(),
        }
    }

    pub fn as_table(&self) -> Option<&TableDataset> {
        match self {
            Self::Table(ds) => Some(ds),
            Self::Tile(_) => None,
        }
    }

    pub fn as_tile(&self) -> Option<&TileDataset> {
        match self {
            Self::Tile(ds) => Some(ds),
            Self::Table(_) => None,
        }
    }

    /// Diff of the meta sections of two datasets (either side may be absent).
    pub fn diff_meta(old: Option<&Self>, new: Option<&Self>) -> DatasetResult<DeltaDiff> {
        let old_items = old.map(Self::meta_items).transpose()?.unwrap_or_default();
        let new_items = new.map(Self::meta_items).transpose()?.unwrap_or_default();
        Ok(DeltaDiff::diff_maps(&old_items, &new_items))
    }
}

/// Finds every dataset in a commit tree. Dataset trees never nest; the walk
/// stops descending once a dataset root is found.
pub fn find_datasets(root: &Tree) -> DatasetResult<Vec<Dataset>> {
    let mut result = Vec::new();
    find_datasets_into(root, &mut result)?;
    Ok(result)
}

fn find_datasets_into(tree: &Tree, result: &mut Vec<Dataset>) -> DatasetResult<()> {
    if is_dataset_tree(tree) {
        let path = tree.dir().as_internal_file_string().to_string();
        result.push(Dataset::open(path, tree.clone())?);
        return Ok(());
    }
    for entry in tree.entries_non_recursive() {
        if let TreeValue::Tree(_) = entry.value() {
            if let Some(subtree) = tree.sub_tree(entry.name())? {
                find_datasets_into(&subtree, result)?;
            }
        }
    }
    Ok(())
}

/// Looks up a single dataset by its slash-delimited path.
pub fn get_dataset(root: &Tree, path: &str) -> DatasetResult<Option<Dataset>> {
    let Ok(tree_path) = TreePath::from_internal_string(path) else {
        return Ok(None);
    };
    let Some(subtree) = root.sub_tree_recursive(tree_path)? else {
        return Ok(None);
    };
    if !is_dataset_tree(&subtree) {
        return Ok(None);
    }
    Ok(Some(Dataset::open(path.to_string(), subtree)?))
}
