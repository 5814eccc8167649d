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
//! Tile-directory working copy.
//!
//! Tile datasets are projected as plain files: `<workdir>/<dataset>/<name>`.
//! Tile contents come from the local LFS object cache (`<repo>/lfs/<hex>`);
//! a tile whose content has not been fetched is skipped, since transport is
//! outside the engine. State lives in a small SQLite database next to the
//! object database; edits are detected by re-hashing files against the base
//! tree rather than by triggers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use sha2::Digest as _;
use sha2::Sha256;
use tracing::debug;
use tracing::instrument;

use crate::backend::TreeId;
use crate::dataset::Dataset;
use crate::diff::DatasetDiff;
use crate::diff::Delta;
use crate::diff::ItemValue;
use crate::diff::RepoDiff;
use crate::error::Error;
use crate::error::Result;
use crate::object_id::ObjectId as _;
use crate::spatial_filter::SpatialFilter;
use crate::store::Store;
use crate::structure::RepositoryStructure;
use crate::tile::TileDataset;
use crate::tile::TileEntry;
use crate::working_copy::table_defs;

const STATE_DB_NAME: &str = "workdir-state.db";
const LFS_DIRNAME: &str = "lfs";

pub struct TileDirectoryWorkingCopy {
    store: Arc<Store>,
    workdir: PathBuf,
    repo_dir: PathBuf,
}

impl TileDirectoryWorkingCopy {
    pub fn new(store: Arc<Store>, workdir: impl Into<PathBuf>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workdir: workdir.into(),
            repo_dir: repo_dir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn state_db_path(&self) -> PathBuf {
        self.repo_dir.join(STATE_DB_NAME)
    }

    fn lfs_path(&self, oid: &str) -> Option<PathBuf> {
        let hex = oid.strip_prefix("sha256:")?;
        Some(self.repo_dir.join(LFS_DIRNAME).join(hex))
    }

    fn open_state_db(&self) -> Result<Connection> {
        Connection::open(self.state_db_path()).map_err(|e| Error::ConnectionError {
            message: "Cannot open the working copy state database".to_string(),
            cause: e.to_string(),
        })
    }

    pub fn create_and_initialise(&self) -> Result<()> {
        fs::create_dir_all(&self.workdir).map_err(io_error)?;
        fs::create_dir_all(self.repo_dir.join(LFS_DIRNAME)).map_err(io_error)?;
        let conn = self.open_state_db()?;
        let statements = table_defs::create_tables_sql(
            table_defs::TablePrefix::Kart,
            None,
            "TEXT",
            |ident| format!("\"{ident}\""),
        );
        for sql in statements {
            conn.execute(&sql, []).map_err(db_error)?;
        }
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.open_state_db()?;
        let mut stmt = conn
            .prepare("SELECT value FROM \"_kart_state\" WHERE table_name = ?1 AND key = ?2")
            .map_err(db_error)?;
        let mut rows = stmt
            .query((table_defs::ALL_TABLES, key))
            .map_err(db_error)?;
        match rows.next().map_err(db_error)? {
            Some(row) => Ok(Some(row.get(0).map_err(db_error)?)),
            None => Ok(None),
        }
    }

    fn set_state(&self, key: &str, value: Option<&str>) -> Result<()> {
        let conn = self.open_state_db()?;
        conn.execute(
            "DELETE FROM \"_kart_state\" WHERE table_name = ?1 AND key = ?2",
            (table_defs::ALL_TABLES, key),
        )
        .map_err(db_error)?;
        if let Some(value) = value {
            conn.execute(
                "INSERT INTO \"_kart_state\" (table_name, key, value) VALUES (?1, ?2, ?3)",
                (table_defs::ALL_TABLES, key, value),
            )
            .map_err(db_error)?;
        }
        Ok(())
    }

    pub fn base_tree_id(&self) -> Result<Option<TreeId>> {
        let Some(text) = self.get_state(table_defs::TREE_STATE_KEY)? else {
            return Ok(None);
        };
        if text.is_empty() {
            return Ok(Some(self.store.empty_tree_id().clone()));
        }
        TreeId::try_from_hex(&text)
            .map(Some)
            .ok_or_else(|| Error::Uncategorized {
                message: format!("Invalid tree id {text:?} in working copy state"),
            })
    }

    fn base_structure(&self) -> Result<RepositoryStructure> {
        match self.base_tree_id()? {
            Some(tree_id) => RepositoryStructure::at_tree(&self.store, tree_id),
            None => RepositoryStructure::empty(&self.store),
        }
    }

    fn dataset_dir(&self, dataset_path: &str) -> PathBuf {
        let mut dir = self.workdir.clone();
        dir.extend(dataset_path.split('/'));
        dir
    }

    fn write_tile_file(&self, dataset_path: &str, tile: &TileEntry) -> Result<()> {
        let Some(source) = self.lfs_path(&tile.oid) else {
            debug!(tile = tile.name, "tile has a non-sha256 oid; skipping");
            return Ok(());
        };
        if !source.exists() {
            debug!(
                tile = tile.name,
                "tile content not present in the local cache; skipping"
            );
            return Ok(());
        }
        let dir = self.dataset_dir(dataset_path);
        fs::create_dir_all(&dir).map_err(io_error)?;
        fs::copy(&source, dir.join(&tile.name)).map_err(io_error)?;
        Ok(())
    }

    /// Populates the working copy for every tile dataset of `target` and
    /// stamps the base tree.
    #[instrument(skip_all)]
    pub fn write_full(&self, target: &RepositoryStructure, filter: &SpatialFilter) -> Result<()> {
        self.create_and_initialise()?;
        for dataset in target.datasets()? {
            let Dataset::Tile(tile_ds) = &dataset else {
                continue;
            };
            let resolved = filter.resolve_for_crs84(tile_ds.path());
            for tile in tile_ds.tiles(&resolved)? {
                self.write_tile_file(tile_ds.path(), &tile)?;
            }
        }
        self.set_state(
            table_defs::TREE_STATE_KEY,
            Some(&target.root_tree().id().hex()),
        )?;
        match filter.hex_hash() {
            Some(hash) => {
                self.set_state(table_defs::SPATIAL_FILTER_HASH_KEY, Some(&hash))?;
            }
            None => self.set_state(table_defs::SPATIAL_FILTER_HASH_KEY, None)?,
        }
        Ok(())
    }

    fn scan_dataset_files(&self, dataset_path: &str) -> Result<BTreeMap<String, PathBuf>> {
        let dir = self.dataset_dir(dataset_path);
        let mut files = BTreeMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(io_error(err)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error)?;
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.insert(name.to_string(), path);
                }
            }
        }
        Ok(files)
    }

    fn hash_file(path: &Path) -> Result<(String, u64)> {
        let bytes = fs::read(path).map_err(io_error)?;
        let digest = Sha256::digest(&bytes);
        Ok((format!("sha256:{}", hex::encode(digest)), bytes.len() as u64))
    }

    fn entry_for_file(
        &self,
        tile_ds: &TileDataset,
        name: &str,
        path: &Path,
        committed: Option<&TileEntry>,
    ) -> Result<TileEntry> {
        let (oid, size) = Self::hash_file(path)?;
        Ok(match committed {
            Some(old) => TileEntry {
                oid,
                size,
                ..old.clone()
            },
            None => {
                let format = match tile_ds.dataset_type() {
                    crate::dataset::DatasetType::PointCloud => "laz-1.4".to_string(),
                    _ => "geotiff".to_string(),
                };
                TileEntry {
                    name: name.to_string(),
                    oid,
                    size,
                    format,
                    native_extent: None,
                    crs84_extent: None,
                    pam_oid: None,
                    pam_size: None,
                    pam_name: None,
                    source_oid: None,
                }
            }
        })
    }

    /// Diffs the live directory against the base tree: one delta per tile
    /// file added, changed or deleted. Tiles hidden by the filter are
    /// neither written nor reported as deletes.
    #[instrument(skip_all)]
    pub fn diff_to_tree(&self, filter: &SpatialFilter) -> Result<RepoDiff> {
        let base = self.base_structure()?;
        let mut result = RepoDiff::new();
        for dataset in base.datasets()? {
            let Dataset::Tile(tile_ds) = &dataset else {
                continue;
            };
            let resolved = filter.resolve_for_crs84(tile_ds.path());
            let committed: BTreeMap<String, TileEntry> = tile_ds
                .tiles(&resolved)?
                .into_iter()
                .map(|tile| (tile.name.clone(), tile))
                .collect();
            let files = self.scan_dataset_files(tile_ds.path())?;
            let mut ds_diff = DatasetDiff::default();
            for (name, tile) in &committed {
                match files.get(name) {
                    None => {
                        ds_diff
                            .tile
                            .add_delta(Delta::delete(name.clone(), ItemValue::Tile(tile.clone())));
                    }
                    Some(path) => {
                        let live = self.entry_for_file(tile_ds, name, path, Some(tile))?;
                        if &live != tile {
                            ds_diff.tile.add_delta(Delta::update(
                                name.clone(),
                                ItemValue::Tile(tile.clone()),
                                name.clone(),
                                ItemValue::Tile(live),
                            ));
                        }
                    }
                }
            }
            for (name, path) in &files {
                if !committed.contains_key(name) {
                    let live = self.entry_for_file(tile_ds, name, path, None)?;
                    ds_diff
                        .tile
                        .add_delta(Delta::insert(name.clone(), ItemValue::Tile(live)));
                }
            }
            result.insert(tile_ds.path().to_string(), ds_diff);
        }
        result.prune();
        Ok(result)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.diff_to_tree(&SpatialFilter::match_all())?.is_empty())
    }

    pub fn check_not_dirty(&self) -> Result<()> {
        if self.is_dirty()? {
            Err(Error::UncommittedChanges)
        } else {
            Ok(())
        }
    }

    /// Resets the directory to `target`. Without `discard_changes`, edits
    /// survive unless the base→target step touches the same tiles.
    #[instrument(skip_all, fields(discard = discard_changes))]
    pub fn reset(
        &self,
        target: &RepositoryStructure,
        discard_changes: bool,
        filter: &SpatialFilter,
    ) -> Result<()> {
        let base = self.base_structure()?;
        let step_diff = base.diff(target, filter)?;
        let wc_diff = self.diff_to_tree(filter)?;
        if !discard_changes && !wc_diff.is_empty() {
            for (ds_path, ds_diff) in wc_diff.iter() {
                let Some(step_ds) = step_diff.get(ds_path) else {
                    continue;
                };
                for (name, _) in ds_diff.tile.iter() {
                    if step_ds.tile.get(name).is_some() {
                        return Err(Error::UncommittedChanges);
                    }
                }
            }
        }

        for dataset in target.datasets()? {
            let Dataset::Tile(tile_ds) = &dataset else {
                continue;
            };
            let resolved = filter.resolve_for_crs84(tile_ds.path());
            let committed: BTreeMap<String, TileEntry> = tile_ds
                .tiles(&resolved)?
                .into_iter()
                .map(|tile| (tile.name.clone(), tile))
                .collect();
            let edited: std::collections::BTreeSet<String> = if discard_changes {
                Default::default()
            } else {
                wc_diff
                    .get(tile_ds.path())
                    .map(|ds_diff| {
                        ds_diff
                            .tile
                            .iter()
                            .map(|(name, _)| name.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let files = self.scan_dataset_files(tile_ds.path())?;
            for (name, path) in &files {
                if !committed.contains_key(name) && !edited.contains(name) {
                    fs::remove_file(path).map_err(io_error)?;
                }
            }
            for (name, tile) in &committed {
                if edited.contains(name) {
                    continue;
                }
                let needs_write = match files.get(name) {
                    None => true,
                    Some(path) => {
                        let (oid, _) = Self::hash_file(path)?;
                        oid != tile.oid
                    }
                };
                if needs_write {
                    self.write_tile_file(tile_ds.path(), tile)?;
                }
            }
        }

        // Datasets deleted by the step lose their directories.
        for dataset in base.datasets()? {
            let Dataset::Tile(tile_ds) = &dataset else {
                continue;
            };
            if target.get_dataset(tile_ds.path())?.is_none() && discard_changes {
                let dir = self.dataset_dir(tile_ds.path());
                if dir.exists() {
                    fs::remove_dir_all(&dir).map_err(io_error)?;
                }
            }
        }

        self.set_state(
            table_defs::TREE_STATE_KEY,
            Some(&target.root_tree().id().hex()),
        )?;
        Ok(())
    }

    /// Stamps the new base; file contents already match what was committed.
    pub fn soft_reset_after_commit(
        &self,
        new_base: &RepositoryStructure,
        _committed: &RepoDiff,
    ) -> Result<()> {
        self.set_state(
            table_defs::TREE_STATE_KEY,
            Some(&new_base.root_tree().id().hex()),
        )
    }

    /// Stores a blob into the local LFS cache; returns its oid. Used by
    /// imports and tests.
    pub fn store_lfs_blob(&self, contents: &[u8]) -> Result<String> {
        let digest = Sha256::digest(contents);
        let hex = hex::encode(digest);
        let dir = self.repo_dir.join(LFS_DIRNAME);
        fs::create_dir_all(&dir).map_err(io_error)?;
        fs::write(dir.join(&hex), contents).map_err(io_error)?;
        Ok(format!("sha256:{hex}"))
    }

    pub fn delete(&self) -> Result<()> {
        let db = self.state_db_path();
        if db.exists() {
            fs::remove_file(db).map_err(io_error)?;
        }
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> Error {
    Error::Uncategorized {
        message: err.to_string(),
    }
}

fn db_error(err: rusqlite::Error) -> Error {
    Error::Uncategorized {
        message: err.to_string(),
    }
}
