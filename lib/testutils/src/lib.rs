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

#![allow(missing_docs)]

//! Test utilities for the meridian-lib crate: temporary repositories,
//! sample datasets, and a linear stand-in for the CRS reprojection
//! collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_lib::backend::CommitId;
use meridian_lib::diff::ItemValue;
use meridian_lib::error::Result;
use meridian_lib::fast_import::FastImportSettings;
use meridian_lib::fast_import::fast_import_tables;
use meridian_lib::geometry::Geometry;
use meridian_lib::repo::Repository;
use meridian_lib::repo::config_keys;
use meridian_lib::schema::Column;
use meridian_lib::schema::DataType;
use meridian_lib::schema::Schema;
use meridian_lib::spatial_filter::CrsTransform;
use meridian_lib::tabular::Row;
use meridian_lib::tabular::import_source::MemoryImportSource;
use meridian_lib::value::Value;
use tempfile::TempDir;

pub const POINTS_PATH: &str = "nz_pa_points_topo_150k";

pub const WGS84_WKT: &str = concat!(
    "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,",
    "AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],",
    "PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],",
    "UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],",
    "AUTHORITY[\"EPSG\",\"4326\"]]"
);

/// A temporary repository; dropped with its directory.
pub struct TestRepo {
    pub repo: Repository,
    _temp_dir: TempDir,
}

impl TestRepo {
    pub fn init() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(temp_dir.path().join("repo"), false, None).unwrap();
        repo.set_config(config_keys::USER_NAME, "Pita Te Whare").unwrap();
        repo.set_config(config_keys::USER_EMAIL, "pita@example.com")
            .unwrap();
        Self {
            repo,
            _temp_dir: temp_dir,
        }
    }
}

/// A point geometry in normalised GeoPackage form.
pub fn point(x: f64, y: f64) -> Geometry {
    let mut wkb = vec![1u8];
    wkb.extend_from_slice(&1u32.to_le_bytes());
    wkb.extend_from_slice(&x.to_le_bytes());
    wkb.extend_from_slice(&y.to_le_bytes());
    Geometry::from_wkb(&wkb).unwrap()
}

/// The six-column schema of the sample points dataset.
pub fn points_schema() -> Schema {
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
        Column::new("t50_fid", DataType::Integer { size: 32 }, None),
        Column::new("name_ascii", DataType::Text { length: Some(75) }, None),
        Column::new("macronated", DataType::Boolean, None),
        Column::new("name", DataType::Text { length: Some(75) }, None),
    ])
}

/// Deterministic sample rows with fids `1..=count`.
pub fn points_rows(count: usize) -> Vec<Row> {
    (1..=count as i64)
        .map(|fid| {
            vec![
                Value::Integer(fid),
                Value::Geometry(point(
                    170.0 + (fid % 700) as f64 * 0.01,
                    -45.0 + (fid % 900) as f64 * 0.01,
                )),
                Value::Integer(2_000_000 + fid),
                Value::Text(format!("point {fid}")),
                Value::Boolean(fid % 5 == 0),
                Value::Text(format!("Point {fid}")),
            ]
        })
        .collect()
}

pub fn points_source(rows: Vec<Row>) -> MemoryImportSource {
    let mut meta = BTreeMap::new();
    meta.insert(
        "title".to_string(),
        ItemValue::Text("NZ Pa Points (Topo, 1:50k)".to_string()),
    );
    meta.insert(
        "description".to_string(),
        ItemValue::Text("Pa sites of the NZ Topo50 map series.".to_string()),
    );
    meta.insert(
        "crs/EPSG:4326.wkt".to_string(),
        ItemValue::Text(WGS84_WKT.to_string()),
    );
    MemoryImportSource::new(POINTS_PATH, points_schema(), meta, rows)
}

/// Imports `count` sample points as a new commit on HEAD and returns its id.
pub fn import_points(repo: &Repository, count: usize) -> Result<CommitId> {
    import_points_with_workers(repo, count, 1)
}

pub fn import_points_with_workers(
    repo: &Repository,
    count: usize,
    num_workers: usize,
) -> Result<CommitId> {
    let source = points_source(points_rows(count));
    let settings = FastImportSettings {
        num_workers,
        ..Default::default()
    };
    fast_import_tables(
        repo.store(),
        "HEAD",
        repo.author_signature()?,
        repo.committer_signature()?,
        &[&source],
        &settings,
    )
}

/// A linear stand-in for the reprojection collaborator: shifts and scales
/// coordinates so that tests can use distinct source/target spaces without a
/// real geodesy library.
#[derive(Debug)]
pub struct LinearTransform {
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

impl CrsTransform for LinearTransform {
    fn transform_points(
        &self,
        _from: &str,
        _to: &str,
        points: &mut [(f64, f64)],
    ) -> std::result::Result<(), String> {
        for p in points {
            p.0 = p.0 * self.scale + self.offset_x;
            p.1 = p.1 * self.scale + self.offset_y;
        }
        Ok(())
    }
}

/// Builds a raster tile dataset commit directly through the object store:
/// `tiles` is `(filename, crs84_extent)` pairs. Returns the new HEAD commit.
pub fn commit_raster_dataset(
    repo: &Repository,
    dataset_path: &str,
    tiles: &[(&str, &str)],
) -> Result<CommitId> {
    use meridian_lib::backend::BulkImportOptions;
    use meridian_lib::path::TreePath;
    use meridian_lib::tile::TileEntry;
    use meridian_lib::tile::tile_path;

    let head = repo.store().resolve_ref("HEAD")?;
    let options = BulkImportOptions {
        ref_name: "refs/import/raster-fixture".to_string(),
        from: head,
        author: repo.author_signature()?,
        committer: repo.committer_signature()?,
        message: format!("Import {} tiles to {dataset_path}", tiles.len()),
    };
    let backend = repo.store().backend();
    let mut session = backend.start_bulk_import(options)?;
    let meta = [
        ("meta/version", b"3\n".to_vec()),
        (
            "meta/format.json",
            b"{\n  \"fileType\": \"geotiff\",\n  \"profile\": \"cloud-optimized\"\n}\n".to_vec(),
        ),
        (
            "meta/schema.json",
            b"[\n  {\n    \"id\": \"00000000-0000-0000-0000-000000000001\",\n    \
              \"name\": \"band_1\",\n    \"dataType\": \"integer\",\n    \"size\": 8\n  }\n]\n"
                .to_vec(),
        ),
        ("meta/crs.wkt", WGS84_WKT.as_bytes().to_vec()),
    ];
    for (name, bytes) in meta {
        let path = format!("{dataset_path}/{name}");
        session.write_inline_blob(TreePath::from_internal_string(&path).unwrap(), &bytes)?;
    }
    for (index, (name, crs84_extent)) in tiles.iter().enumerate() {
        let content = format!("raster tile {index}").into_bytes();
        let oid = lfs_oid(&content);
        // Stash the content where the tile-directory working copy looks for
        // it.
        let lfs_dir = repo.repo_dir().join("lfs");
        std::fs::create_dir_all(&lfs_dir).unwrap();
        std::fs::write(lfs_dir.join(oid.strip_prefix("sha256:").unwrap()), &content).unwrap();

        let entry = TileEntry {
            name: (*name).to_string(),
            oid,
            size: content.len() as u64,
            format: "geotiff/cog".to_string(),
            native_extent: None,
            crs84_extent: Some((*crs84_extent).to_string()),
            pam_oid: None,
            pam_size: None,
            pam_name: None,
            source_oid: None,
        };
        let pointer_path = format!(
            "{dataset_path}/{}",
            tile_path(name).unwrap().as_internal_file_string()
        );
        session.write_inline_blob(
            TreePath::from_internal_string(&pointer_path).unwrap(),
            &entry.encode_pointer(),
        )?;
    }
    let commit_id = session.finish()?;
    repo.store().set_ref("HEAD", &commit_id)?;
    repo.store().delete_ref("refs/import/raster-fixture")?;
    Ok(commit_id)
}

fn lfs_oid(contents: &[u8]) -> String {
    use sha2::Digest as _;
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(contents)))
}
