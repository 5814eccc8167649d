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
//! Tile (raster / point-cloud) datasets.
//!
//! Tile contents live outside the object database; the committed tree holds
//! only LFS-style pointer files under `tile/<aa>/<bb>/<filename>`, where
//! `aa`/`bb` are the first two bytes of the SHA-1 of the filename.

use std::collections::BTreeMap;

use sha1::Digest as _;
use sha1::Sha1;
use thiserror::Error;

use crate::dataset::DatasetError;
use crate::dataset::DatasetResult;
use crate::dataset::DatasetType;
use crate::dataset::TILE_DIRNAME;
use crate::dataset::read_meta_items;
use crate::diff::Delta;
use crate::diff::DeltaDiff;
use crate::diff::ItemValue;
use crate::geometry::Envelope;
use crate::path::TreePathBuf;
use crate::spatial_filter::DatasetFilter;
use crate::tree::Tree;
use crate::tree::diff_trees;

pub const FORMAT_META_ITEM: &str = "format.json";
pub const POINTER_VERSION: &str = "https://git-lfs.github.com/spec/v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileError {
    #[error("Invalid tile pointer for {name}: {reason}")]
    InvalidPointer { name: String, reason: String },
    #[error("Invalid tile filename {0:?}")]
    InvalidFilename(String),
}

/// Normalises a tile filename for storage: the basename of the source path
/// with its extension lower-cased. Must be stable within a repository.
pub fn normalise_tile_filename(source_name: &str) -> Result<String, TileError> {
    let base = source_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(source_name)
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(TileError::InvalidFilename(source_name.to_string()));
    }
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            Ok(format!("{stem}.{}", ext.to_lowercase()))
        }
        _ => Ok(base.to_string()),
    }
}

/// The dataset-relative path of a tile pointer: `tile/<aa>/<bb>/<filename>`.
pub fn tile_path(filename: &str) -> Result<TreePathBuf, TileError> {
    let digest = Sha1::digest(filename.as_bytes());
    let path = format!(
        "{TILE_DIRNAME}/{}/{}/{filename}",
        hex::encode([digest[0]]),
        hex::encode([digest[1]])
    );
    TreePathBuf::from_internal_string(path)
        .map_err(|_| TileError::InvalidFilename(filename.to_string()))
}

/// One entry of a tile dataset: the pointer to an externally stored file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileEntry {
    /// Normalised filename, e.g. `auckland_0_0.laz`.
    pub name: String,
    /// Content hash of the tile file, e.g. `sha256:<hex>`.
    pub oid: String,
    pub size: u64,
    /// Format identifier, e.g. `laz-1.4/copc-1.0` or `geotiff/cog`.
    pub format: String,
    /// CRS-specific bounding volume, free-form.
    pub native_extent: Option<String>,
    /// 2D extent in CRS84 as `min_lon,max_lon,min_lat,max_lat`; used for
    /// spatial filtering.
    pub crs84_extent: Option<String>,
    /// Sidecar file (e.g. a raster PAM file), if any.
    pub pam_oid: Option<String>,
    pub pam_size: Option<u64>,
    pub pam_name: Option<String>,
    /// Hash of the original source file if the tile was converted on import.
    pub source_oid: Option<String>,
}

impl TileEntry {
    /// Serialises to the pointer-file byte form: the LFS version line first,
    /// then `key value` lines sorted by key.
    pub fn encode_pointer(&self) -> Vec<u8> {
        let mut lines: Vec<(String, String)> = vec![
            ("format".to_string(), self.format.clone()),
            ("oid".to_string(), self.oid.clone()),
            ("size".to_string(), self.size.to_string()),
        ];
        if let Some(extent) = &self.crs84_extent {
            lines.push(("crs84Extent".to_string(), extent.clone()));
        }
        if let Some(extent) = &self.native_extent {
            lines.push(("nativeExtent".to_string(), extent.clone()));
        }
        if let Some(oid) = &self.pam_oid {
            lines.push(("pamOid".to_string(), oid.clone()));
        }
        if let Some(size) = &self.pam_size {
            lines.push(("pamSize".to_string(), size.to_string()));
        }
        if let Some(name) = &self.pam_name {
            lines.push(("pamName".to_string(), name.clone()));
        }
        if let Some(oid) = &self.source_oid {
            lines.push(("sourceOid".to_string(), oid.clone()));
        }
        lines.sort();
        let mut out = format!("version {POINTER_VERSION}\n");
        for (key, value) in lines {
            out.push_str(&key);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn decode_pointer(name: &str, bytes: &[u8]) -> Result<Self, TileError> {
        let invalid = |reason: &str| TileError::InvalidPointer {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let text = std::str::from_utf8(bytes).map_err(|_| invalid("not UTF-8"))?;
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(' ').ok_or_else(|| invalid("bad line"))?;
            fields.insert(key, value);
        }
        let oid = fields.get("oid").ok_or_else(|| invalid("missing oid"))?;
        let size = fields
            .get("size")
            .ok_or_else(|| invalid("missing size"))?
            .parse::<u64>()
            .map_err(|_| invalid("bad size"))?;
        let parse_u64 = |key: &str| -> Result<Option<u64>, TileError> {
            fields
                .get(key)
                .map(|v| v.parse::<u64>().map_err(|_| invalid(&format!("bad {key}"))))
                .transpose()
        };
        Ok(Self {
            name: name.to_string(),
            oid: oid.to_string(),
            size,
            format: fields.get("format").copied().unwrap_or_default().to_string(),
            native_extent: fields.get("nativeExtent").map(|v| v.to_string()),
            crs84_extent: fields.get("crs84Extent").map(|v| v.to_string()),
            pam_oid: fields.get("pamOid").map(|v| v.to_string()),
            pam_size: parse_u64("pamSize")?,
            pam_name: fields.get("pamName").map(|v| v.to_string()),
            source_oid: fields.get("sourceOid").map(|v| v.to_string()),
        })
    }

    /// Parses the CRS84 extent field into an envelope.
    pub fn crs84_envelope(&self) -> Option<Envelope> {
        let extent = self.crs84_extent.as_deref()?;
        let parts: Vec<f64> = extent
            .split(',')
            .map(|p| p.trim().parse::<f64>().ok())
            .collect::<Option<_>>()?;
        match parts.as_slice() {
            [min_x, max_x, min_y, max_y] => Some(Envelope {
                min_x: *min_x,
                max_x: *max_x,
                min_y: *min_y,
                max_y: *max_y,
            }),
            _ => None,
        }
    }
}

/// Reader for tile datasets.
#[derive(Debug, Clone)]
pub struct TileDataset {
    path: String,
    tree: Tree,
    dataset_type: DatasetType,
}

impl TileDataset {
    pub fn open(path: String, tree: Tree) -> DatasetResult<Self> {
        let meta_items = read_meta_items(&tree)?;
        let format = match meta_items.get(FORMAT_META_ITEM) {
            Some(ItemValue::Json(json)) => json.clone(),
            _ => {
                return Err(DatasetError::MissingMetaItem {
                    path,
                    item: FORMAT_META_ITEM.to_string(),
                });
            }
        };
        let format_text = format
            .get("fileType")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let dataset_type = if format_text.contains("laz") || format_text.contains("las") {
            DatasetType::PointCloud
        } else {
            DatasetType::Raster
        };
        Ok(Self {
            path,
            tree,
            dataset_type,
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

    pub fn meta_items(&self) -> DatasetResult<BTreeMap<String, ItemValue>> {
        read_meta_items(&self.tree)
    }

    pub fn crs_wkt(&self) -> DatasetResult<Option<String>> {
        Ok(match self.meta_items()?.remove("crs.wkt") {
            Some(ItemValue::Text(wkt)) => Some(wkt),
            _ => None,
        })
    }

    fn tile_tree(&self) -> DatasetResult<Option<Tree>> {
        let name = crate::path::TreePathComponent::new(TILE_DIRNAME).unwrap();
        Ok(self.tree.sub_tree(name)?)
    }

    /// All tile entries, filtered spatially.
    pub fn tiles(&self, filter: &DatasetFilter) -> DatasetResult<Vec<TileEntry>> {
        let mut result = Vec::new();
        let Some(tile_tree) = self.tile_tree()? else {
            return Ok(result);
        };
        for entry in tile_tree.entries_recursive() {
            let (path, blob_id) = entry?;
            let name = path.components().next_back().unwrap().as_internal_str();
            let bytes = self.tree.store().read_blob(&blob_id)?;
            let tile = TileEntry::decode_pointer(name, &bytes)?;
            if filter.matches_tile(&tile) {
                result.push(tile);
            }
        }
        Ok(result)
    }

    /// O(log N) lookup of a tile by filename.
    pub fn get_tile(&self, filename: &str) -> DatasetResult<Option<TileEntry>> {
        let rel_path = tile_path(filename)?;
        let Some(value) = self.tree.path_value_relative(&rel_path)? else {
            return Ok(None);
        };
        let crate::backend::TreeValue::Blob(blob_id) = value else {
            return Ok(None);
        };
        let bytes = self.tree.store().read_blob(&blob_id)?;
        Ok(Some(TileEntry::decode_pointer(filename, &bytes)?))
    }

    /// Diffs the tile sections of two datasets. Tiles not matching `filter`
    /// are neither reported as inserts nor as deletes.
    pub fn diff_tile(
        old: Option<&Self>,
        new: Option<&Self>,
        filter: &DatasetFilter,
    ) -> DatasetResult<DeltaDiff> {
        let old_tree = old.map(|ds| ds.tile_tree()).transpose()?.flatten();
        let new_tree = new.map(|ds| ds.tile_tree()).transpose()?.flatten();
        let mut result = DeltaDiff::new();
        for entry in diff_trees(old_tree.as_ref(), new_tree.as_ref())? {
            let name = entry
                .path
                .components()
                .next_back()
                .unwrap()
                .as_internal_str()
                .to_string();
            let load = |ds: &Self, blob_id| -> DatasetResult<TileEntry> {
                let bytes = ds.tree.store().read_blob(blob_id)?;
                Ok(TileEntry::decode_pointer(&name, &bytes)?)
            };
            let old_tile = match (&entry.old, old) {
                (Some(blob_id), Some(ds)) => Some(load(ds, blob_id)?),
                _ => None,
            };
            let new_tile = match (&entry.new, new) {
                (Some(blob_id), Some(ds)) => Some(load(ds, blob_id)?),
                _ => None,
            };
            let old_tile = old_tile.filter(|tile| filter.matches_tile(tile));
            let new_tile = new_tile.filter(|tile| filter.matches_tile(tile));
            match (old_tile, new_tile) {
                (Some(old_tile), Some(new_tile)) => {
                    result.add_delta(Delta::update(
                        name.clone(),
                        ItemValue::Tile(old_tile),
                        name,
                        ItemValue::Tile(new_tile),
                    ));
                }
                (Some(old_tile), None) => {
                    result.add_delta(Delta::delete(name, ItemValue::Tile(old_tile)));
                }
                (None, Some(new_tile)) => {
                    result.add_delta(Delta::insert(name, ItemValue::Tile(new_tile)));
                }
                (None, None) => {}
            }
        }
        Ok(result)
    }

    /// The dataset-relative pointer path for a tile entry.
    pub fn pointer_path(entry: &TileEntry) -> Result<TreePathBuf, TileError> {
        tile_path(&entry.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> TileEntry {
        TileEntry {
            name: "auckland_0_0.laz".to_string(),
            oid: "sha256:adbc1dc7fc99c88fcb627b9c40cdb56c211b791fe9cf83fe066b1a9932c12569"
                .to_string(),
            size: 51489,
            format: "laz-1.4/copc-1.0".to_string(),
            native_extent: Some("1754987.85,1755987.77,5920219.76,5921219.64,-1.28,93.17".into()),
            crs84_extent: Some("174.73844,174.74945,-36.85123,-36.84206".into()),
            pam_oid: None,
            pam_size: None,
            pam_name: None,
            source_oid: None,
        }
    }

    #[test]
    fn test_pointer_roundtrip() {
        let tile = entry();
        let bytes = tile.encode_pointer();
        let decoded = TileEntry::decode_pointer(&tile.name, &bytes).unwrap();
        assert_eq!(decoded, tile);
    }

    #[test]
    fn test_pointer_starts_with_version() {
        let bytes = entry().encode_pointer();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("version https://git-lfs.github.com/spec/v1\n"));
    }

    #[test]
    fn test_tile_path_shape() {
        let path = tile_path("auckland_0_0.laz").unwrap();
        let components: Vec<_> = path
            .components()
            .map(|c| c.as_internal_str().to_string())
            .collect();
        assert_eq!(components.len(), 4);
        assert_eq!(components[0], TILE_DIRNAME);
        assert_eq!(components[1].len(), 2);
        assert_eq!(components[2].len(), 2);
        assert_eq!(components[3], "auckland_0_0.laz");
    }

    #[test]
    fn test_normalise_tile_filename() {
        assert_eq!(
            normalise_tile_filename("/data/tiles/Auckland_0_0.LAZ").unwrap(),
            "Auckland_0_0.laz"
        );
        assert_eq!(normalise_tile_filename("plain").unwrap(), "plain");
        assert!(normalise_tile_filename("dir/").is_err());
    }

    #[test]
    fn test_crs84_envelope() {
        let envelope = entry().crs84_envelope().unwrap();
        assert!(envelope.min_x < envelope.max_x);
        assert!(envelope.min_y < envelope.max_y);
        assert_eq!(entry().crs84_envelope().unwrap().min_x, 174.73844);
    }

    #[test]
    fn test_bad_pointer() {
        assert!(matches!(
            TileEntry::decode_pointer("x.laz", b"version foo\nsize notanumber\n"),
            Err(TileError::InvalidPointer { .. })
        ));
    }
}
