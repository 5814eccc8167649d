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
//! A view over the datasets of one commit tree, and the diff → apply →
//! commit pipeline operating on it.

use std::sync::Arc;

use itertools::Itertools as _;
use tracing::instrument;

use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::Signature;
use crate::backend::TreeId;
use crate::backend::TreeValue;
use crate::dataset::Dataset;
use crate::dataset::FEATURE_DIRNAME;
use crate::dataset::META_DIRNAME;
use crate::dataset::meta_item_to_bytes;
use crate::diff::DatasetDiff;
use crate::diff::Delta;
use crate::diff::DeltaKind;
use crate::diff::ItemValue;
use crate::diff::RepoDiff;
use crate::error::Error;
use crate::error::Result;
use crate::path::TreePath;
use crate::path::TreePathBuf;
use crate::schema::Schema;
use crate::spatial_filter::SpatialFilter;
use crate::store::Store;
use crate::tabular::Row;
use crate::tabular::codec;
use crate::tabular::codec::Legend;
use crate::tabular::dataset::TableDataset;
use crate::tabular::feature_path::PathStructure;
use crate::tile::TileDataset;
use crate::tile::TileEntry;
use crate::tile::tile_path;
use crate::tree::Tree;
use crate::tree_builder::TreeBuilder;
use crate::value::Value;

/// Name of the blob at the tree root recording the repository-structure
/// version.
pub const REPO_VERSION_BLOB: &str = ".repo-version";

pub const SUPPORTED_REPO_VERSIONS: &[u32] = &[2, 3];
pub const CURRENT_REPO_VERSION: u32 = 3;

/// The datasets of one commit (or bare tree).
#[derive(Debug, Clone)]
pub struct RepositoryStructure {
    store: Arc<Store>,
    commit_id: Option<CommitId>,
    root: Tree,
}

impl RepositoryStructure {
    pub fn at_commit(store: &Arc<Store>, commit_id: &CommitId) -> Result<Self> {
        let commit = store.get_commit(commit_id)?;
        let root = store.get_root_tree(&commit.root_tree)?;
        Ok(Self {
            store: store.clone(),
            commit_id: Some(commit_id.clone()),
            root,
        })
    }

    pub fn at_tree(store: &Arc<Store>, tree_id: TreeId) -> Result<Self> {
        let root = store.get_root_tree(&tree_id)?;
        Ok(Self {
            store: store.clone(),
            commit_id: None,
            root,
        })
    }

    pub fn empty(store: &Arc<Store>) -> Result<Self> {
        let tree_id = store.empty_tree_id().clone();
        Self::at_tree(store, tree_id)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn commit_id(&self) -> Option<&CommitId> {
        self.commit_id.as_ref()
    }

    pub fn root_tree(&self) -> &Tree {
        &self.root
    }

    /// The repository-structure version declared by this tree. An empty tree
    /// has no version blob and counts as the current version.
    pub fn version(&self) -> Result<u32> {
        let path = TreePath::from_internal_string(REPO_VERSION_BLOB).unwrap();
        match self.root.path_value(path)? {
            Some(TreeValue::Blob(blob_id)) => {
                let bytes = self.store.read_blob(&blob_id)?;
                let text = String::from_utf8_lossy(&bytes);
                text.trim()
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidFileFormat {
                        message: format!("Invalid repository version marker {text:?}"),
                    })
            }
            _ => Ok(CURRENT_REPO_VERSION),
        }
    }

    pub fn check_version_supported(&self) -> Result<()> {
        let version = self.version()?;
        if SUPPORTED_REPO_VERSIONS.contains(&version) {
            Ok(())
        } else {
            Err(Error::UnsupportedVersion { version })
        }
    }

    pub fn datasets(&self) -> Result<Vec<Dataset>> {
        Ok(crate::dataset::find_datasets(&self.root)?)
    }

    pub fn get_dataset(&self, path: &str) -> Result<Option<Dataset>> {
        Ok(crate::dataset::get_dataset(&self.root, path)?)
    }

    /// Commit↔commit diff. Never touches the working copy.
    #[instrument(skip_all)]
    pub fn diff(&self, other: &Self, filter: &SpatialFilter) -> Result<RepoDiff> {
        let mut result = RepoDiff::new();
        let old_datasets = self.datasets()?;
        let new_datasets = other.datasets()?;
        let paths: Vec<String> = old_datasets
            .iter()
            .chain(&new_datasets)
            .map(|ds| ds.path().to_string())
            .sorted()
            .dedup()
            .collect();
        for path in paths {
            let old = old_datasets.iter().find(|ds| ds.path() == path);
            let new = new_datasets.iter().find(|ds| ds.path() == path);
            let mut ds_diff = DatasetDiff {
                meta: Dataset::diff_meta(old, new)?,
                ..Default::default()
            };
            let old_table = old.and_then(Dataset::as_table);
            let new_table = new.and_then(Dataset::as_table);
            if old_table.is_some() || new_table.is_some() {
                let resolved = resolve_filter_for_table(filter, old_table.or(new_table).unwrap())?;
                ds_diff.feature =
                    TableDataset::diff_feature(old_table, new_table, &resolved)?;
            }
            let old_tile = old.and_then(Dataset::as_tile);
            let new_tile = new.and_then(Dataset::as_tile);
            if old_tile.is_some() || new_tile.is_some() {
                let resolved = filter.resolve_for_crs84(&path);
                ds_diff.tile = TileDataset::diff_tile(old_tile, new_tile, &resolved)?;
            }
            result.insert(path, ds_diff);
        }
        result.prune();
        Ok(result)
    }

    /// Applies a diff on top of this tree and returns the new tree id.
    ///
    /// Conflicts (a delete or update whose old value is not in the base, an
    /// insert whose key already exists) are accumulated and reported
    /// together. `allow_missing_old_values` turns the old-value checks off,
    /// for re-applying a patch whose base is already partially gone.
    #[instrument(skip_all)]
    pub fn apply_diff(&self, diff: &RepoDiff, allow_missing_old_values: bool) -> Result<TreeId> {
        let mut builder = TreeBuilder::new(self.store.clone(), self.root.id().clone());
        let mut conflicts: Vec<String> = Vec::new();

        for (ds_path, ds_diff) in diff.iter() {
            let dest = TreePath::from_internal_string(ds_path)
                .map_err(|e| Error::invalid_operation(e.to_string()))?;
            let base = self.get_dataset(ds_path)?;
            let base_table = base.as_ref().and_then(Dataset::as_table);

            self.apply_meta_deltas(
                &mut builder,
                dest,
                &base,
                ds_diff,
                allow_missing_old_values,
                &mut conflicts,
            )?;

            // The schema features encode against: the patched one if the
            // patch changes it.
            let schema = match ds_diff.meta.get("schema.json").and_then(Delta::new_value) {
                Some(ItemValue::Json(json)) => Some(Schema::from_json(json).map_err(|e| {
                    Error::schema_violation(e.to_string())
                })?),
                Some(_) => {
                    return Err(Error::schema_violation(format!(
                        "schema.json for {ds_path} is not JSON"
                    )));
                }
                None => base_table.map(|table| table.schema().clone()),
            };
            let path_structure = base_table
                .map(|table| table.path_structure().clone())
                .unwrap_or_default();

            if !ds_diff.feature.is_empty() {
                let Some(schema) = &schema else {
                    return Err(Error::schema_violation(format!(
                        "Cannot apply feature changes to {ds_path}: no schema"
                    )));
                };
                let legend = Legend::from_schema(schema);
                let legend_path = dest.concat(
                    TreePath::from_internal_string(&format!(
                        "{META_DIRNAME}/legend/{}",
                        legend.hex_hash()
                    ))
                    .unwrap(),
                );
                builder.set(
                    legend_path,
                    TreeValue::Blob(self.store.write_blob(&legend.encode())?),
                );
                for (_, delta) in ds_diff.feature.iter() {
                    self.apply_feature_delta(
                        &mut builder,
                        dest,
                        ds_path,
                        base_table,
                        schema,
                        &path_structure,
                        &legend,
                        delta,
                        allow_missing_old_values,
                        &mut conflicts,
                    )?;
                }
            }

            for (_, delta) in ds_diff.tile.iter() {
                self.apply_tile_delta(
                    &mut builder,
                    dest,
                    ds_path,
                    base.as_ref().and_then(Dataset::as_tile),
                    delta,
                    allow_missing_old_values,
                    &mut conflicts,
                )?;
            }
        }

        if !conflicts.is_empty() {
            conflicts.sort();
            return Err(Error::PatchDoesNotApply { conflicts });
        }
        Ok(builder.write_tree()?)
    }

    fn apply_meta_deltas(
        &self,
        builder: &mut TreeBuilder,
        dest: &TreePath,
        base: &Option<Dataset>,
        ds_diff: &crate::diff::DatasetDiff,
        allow_missing_old_values: bool,
        conflicts: &mut Vec<String>,
    ) -> Result<()> {
        let base_meta = base
            .as_ref()
            .map(Dataset::meta_items)
            .transpose()?
            .unwrap_or_default();
        for (key, delta) in ds_diff.meta.iter() {
            let ds_path = dest.as_internal_file_string();
            let base_value = base_meta.get(key);
            match delta.kind() {
                DeltaKind::Insert => {
                    if base_value.is_some() {
                        conflicts.push(format!("{ds_path}: meta item {key} already exists"));
                        continue;
                    }
                }
                DeltaKind::Update | DeltaKind::Delete => {
                    if !allow_missing_old_values && base_value != delta.old_value() {
                        conflicts.push(format!(
                            "{ds_path}: meta item {key} is not as expected"
                        ));
                        continue;
                    }
                }
            }
            let item_path = dest.concat(
                TreePath::from_internal_string(&format!("{META_DIRNAME}/{key}")).unwrap(),
            );
            match delta.new_value() {
                Some(value) => {
                    let blob_id = self.store.write_blob(&meta_item_to_bytes(value))?;
                    builder.set(item_path, TreeValue::Blob(blob_id));
                }
                None => builder.remove(item_path),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_feature_delta(
        &self,
        builder: &mut TreeBuilder,
        dest: &TreePath,
        ds_path: &str,
        base_table: Option<&TableDataset>,
        schema: &Schema,
        path_structure: &PathStructure,
        legend: &Legend,
        delta: &Delta,
        allow_missing_old_values: bool,
        conflicts: &mut Vec<String>,
    ) -> Result<()> {
        let feature_path = |row: &Row| -> TreePathBuf {
            let pk = pk_of(schema, row);
            dest.concat(
                &TreePath::from_internal_string(FEATURE_DIRNAME)
                    .unwrap()
                    .concat(&path_structure.encode_path(&pk)),
            )
        };
        let base_row = |row: &Row| -> Result<Option<Row>> {
            match base_table {
                Some(table) => Ok(table.try_get_feature(&pk_of(schema, row))?),
                None => Ok(None),
            }
        };
        match (delta.old_value(), delta.new_value()) {
            (Some(ItemValue::Feature(old_row)), None) => {
                if !allow_missing_old_values && base_row(old_row)?.as_ref() != Some(old_row) {
                    conflicts.push(format!(
                        "{ds_path}: feature {} is not as expected",
                        delta.key()
                    ));
                    return Ok(());
                }
                builder.remove(feature_path(old_row));
            }
            (None, Some(ItemValue::Feature(new_row))) => {
                if !allow_missing_old_values && base_row(new_row)?.is_some() {
                    conflicts.push(format!(
                        "{ds_path}: feature {} already exists",
                        delta.key()
                    ));
                    return Ok(());
                }
                let blob = codec::encode_feature(schema, legend, new_row)
                    .map_err(|e| Error::schema_violation(e.to_string()))?;
                builder.set(
                    feature_path(new_row),
                    TreeValue::Blob(self.store.write_blob(&blob)?),
                );
            }
            (Some(ItemValue::Feature(old_row)), Some(ItemValue::Feature(new_row))) => {
                if !allow_missing_old_values && base_row(old_row)?.as_ref() != Some(old_row) {
                    conflicts.push(format!(
                        "{ds_path}: feature {} is not as expected",
                        delta.key()
                    ));
                    return Ok(());
                }
                let old_path = feature_path(old_row);
                let new_path = feature_path(new_row);
                if old_path != new_path {
                    builder.remove(old_path);
                }
                let blob = codec::encode_feature(schema, legend, new_row)
                    .map_err(|e| Error::schema_violation(e.to_string()))?;
                builder.set(new_path, TreeValue::Blob(self.store.write_blob(&blob)?));
            }
            _ => {
                return Err(Error::invalid_operation(format!(
                    "{ds_path}: feature delta {} does not carry feature values",
                    delta.key()
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_tile_delta(
        &self,
        builder: &mut TreeBuilder,
        dest: &TreePath,
        ds_path: &str,
        base_tile: Option<&TileDataset>,
        delta: &Delta,
        allow_missing_old_values: bool,
        conflicts: &mut Vec<String>,
    ) -> Result<()> {
        let pointer_path = |tile: &TileEntry| -> Result<TreePathBuf> {
            Ok(dest.concat(&tile_path(&tile.name).map_err(|e| Error::InvalidFileFormat {
                message: e.to_string(),
            })?))
        };
        let base_entry = |tile: &TileEntry| -> Result<Option<TileEntry>> {
            match base_tile {
                Some(ds) => Ok(ds.get_tile(&tile.name)?),
                None => Ok(None),
            }
        };
        match (delta.old_value(), delta.new_value()) {
            (Some(ItemValue::Tile(old_tile)), None) => {
                if !allow_missing_old_values && base_entry(old_tile)?.as_ref() != Some(old_tile) {
                    conflicts.push(format!(
                        "{ds_path}: tile {} is not as expected",
                        delta.key()
                    ));
                    return Ok(());
                }
                builder.remove(pointer_path(old_tile)?);
            }
            (None, Some(ItemValue::Tile(new_tile))) => {
                if !allow_missing_old_values && base_entry(new_tile)?.is_some() {
                    conflicts.push(format!("{ds_path}: tile {} already exists", delta.key()));
                    return Ok(());
                }
                let blob_id = self.store.write_blob(&new_tile.encode_pointer())?;
                builder.set(pointer_path(new_tile)?, TreeValue::Blob(blob_id));
            }
            (Some(ItemValue::Tile(old_tile)), Some(ItemValue::Tile(new_tile))) => {
                if !allow_missing_old_values && base_entry(old_tile)?.as_ref() != Some(old_tile) {
                    conflicts.push(format!(
                        "{ds_path}: tile {} is not as expected",
                        delta.key()
                    ));
                    return Ok(());
                }
                if old_tile.name != new_tile.name {
                    builder.remove(pointer_path(old_tile)?);
                }
                let blob_id = self.store.write_blob(&new_tile.encode_pointer())?;
                builder.set(pointer_path(new_tile)?, TreeValue::Blob(blob_id));
            }
            _ => {
                return Err(Error::invalid_operation(format!(
                    "{ds_path}: tile delta {} does not carry tile values",
                    delta.key()
                )));
            }
        }
        Ok(())
    }

    /// Applies `diff` on top of this structure's tree and writes a commit
    /// advancing `target_ref`.
    pub fn commit_diff(
        &self,
        target_ref: &str,
        diff: &RepoDiff,
        message: &str,
        allow_empty: bool,
        author: Signature,
        committer: Signature,
    ) -> Result<CommitId> {
        let new_tree_id = self.apply_diff(diff, false)?;
        if !allow_empty && &new_tree_id == self.root.id() {
            return Err(Error::no_changes());
        }
        let commit = Commit {
            parents: self.commit_id.iter().cloned().collect(),
            root_tree: new_tree_id,
            author,
            committer,
            message: message.to_string(),
        };
        let (commit_id, _) = self.store.write_commit(commit)?;
        self.store.set_ref(target_ref, &commit_id)?;
        Ok(commit_id)
    }
}

/// Extracts the primary-key values of a row for the given schema.
pub fn pk_of(schema: &Schema, row: &Row) -> Vec<Value> {
    schema
        .pk_columns()
        .iter()
        .map(|col| {
            let position = schema
                .columns()
                .iter()
                .position(|c| c.id == col.id)
                .unwrap();
            row.get(position).cloned().unwrap_or(Value::Null)
        })
        .collect()
}

/// Resolves a spatial filter into a table dataset's CRS.
pub fn resolve_filter_for_table(
    filter: &SpatialFilter,
    table: &TableDataset,
) -> Result<crate::spatial_filter::DatasetFilter> {
    let crs_name = table
        .schema()
        .geometry_columns()
        .first()
        .and_then(|col| match &col.data_type {
            crate::schema::DataType::Geometry { crs_name, .. } => crs_name.clone(),
            _ => None,
        });
    let crs_wkt = table.geometry_crs_wkt()?;
    Ok(filter.resolve_for_crs(table.path(), crs_name.as_deref(), crs_wkt.as_deref()))
}
