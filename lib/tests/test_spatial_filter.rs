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

use std::sync::Arc;

use meridian_lib::diff::DeltaKind;
use meridian_lib::spatial_filter::SpatialFilter;
use meridian_lib::structure::RepositoryStructure;
use meridian_lib::working_copy::WorkingCopy;
use meridian_lib::working_copy::tile_directory::TileDirectoryWorkingCopy;
use testutils::LinearTransform;
use testutils::TestRepo;
use testutils::commit_raster_dataset;

const RASTER_PATH: &str = "erorangi";

/// The scenario filter: an EPSG:2193 polygon. The linear stand-in transform
/// maps it to roughly lon 173.770..173.774, lat -41.078..-41.065.
const FILTER_SPEC: &str = "EPSG:2193;POLYGON((\
    1770472 5935376,1774360 5935376,1774360 5922016,1770472 5922016,1770472 5935376))";

fn scenario_filter() -> SpatialFilter {
    SpatialFilter::from_spec(FILTER_SPEC)
        .unwrap()
        .with_transform(Arc::new(LinearTransform {
            scale: 1e-6,
            offset_x: 172.0,
            offset_y: -47.0,
        }))
}

/// Two tiles: one inside the filter area, one far away.
const TILE_INSIDE: (&str, &str) = ("erorangi_0_0.tif", "173.771,173.773,-41.076,-41.070");
const TILE_OUTSIDE: (&str, &str) = ("erorangi_0_1.tif", "174.500,174.600,-40.000,-39.900");

fn tile_wc(repo: &meridian_lib::repo::Repository) -> TileDirectoryWorkingCopy {
    repo.set_config("workingcopy.path", "tiles").unwrap();
    match repo.working_copy().unwrap().unwrap() {
        WorkingCopy::TileDirectory(wc) => wc,
        other => panic!("expected a tile working copy, got {}", other.backend_name()),
    }
}

#[test]
fn test_filtered_checkout_writes_only_matching_tile() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    commit_raster_dataset(repo, RASTER_PATH, &[TILE_INSIDE, TILE_OUTSIDE]).unwrap();

    let wc = tile_wc(repo);
    let head = repo.structure("HEAD").unwrap();
    wc.write_full(&head, &scenario_filter()).unwrap();

    let dataset_dir = wc.workdir().join(RASTER_PATH);
    assert!(dataset_dir.join(TILE_INSIDE.0).is_file());
    assert!(!dataset_dir.join(TILE_OUTSIDE.0).exists());

    // A filtered working copy is clean: the hidden tile is not a delete.
    assert!(wc.diff_to_tree(&scenario_filter()).unwrap().is_empty());
}

#[test]
fn test_show_reports_only_matching_tile() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    commit_raster_dataset(repo, RASTER_PATH, &[TILE_INSIDE, TILE_OUTSIDE]).unwrap();

    // `show` of the import commit: diff against the empty parent.
    let head = repo.structure("HEAD").unwrap();
    let empty = RepositoryStructure::empty(repo.store()).unwrap();
    let diff = empty.diff(&head, &scenario_filter()).unwrap();

    let ds_diff = diff.get(RASTER_PATH).unwrap();
    let inserts: Vec<&str> = ds_diff
        .tile
        .values()
        .filter(|delta| delta.kind() == DeltaKind::Insert)
        .map(|delta| delta.key())
        .collect();
    assert_eq!(inserts, vec![TILE_INSIDE.0]);

    // Unfiltered, both tiles appear.
    let unfiltered = empty.diff(&head, &SpatialFilter::match_all()).unwrap();
    assert_eq!(unfiltered.get(RASTER_PATH).unwrap().tile.len(), 2);
}

#[test]
fn test_tile_edit_tracking() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    commit_raster_dataset(repo, RASTER_PATH, &[TILE_INSIDE, TILE_OUTSIDE]).unwrap();

    let wc = tile_wc(repo);
    let head = repo.structure("HEAD").unwrap();
    wc.write_full(&head, &SpatialFilter::match_all()).unwrap();
    assert!(!wc.is_dirty().unwrap());

    // Overwrite one tile and delete the other.
    let dataset_dir = wc.workdir().join(RASTER_PATH);
    std::fs::write(dataset_dir.join(TILE_INSIDE.0), b"edited raster data").unwrap();
    std::fs::remove_file(dataset_dir.join(TILE_OUTSIDE.0)).unwrap();

    let diff = wc.diff_to_tree(&SpatialFilter::match_all()).unwrap();
    let ds_diff = diff.get(RASTER_PATH).unwrap();
    let (inserts, updates, deletes) = ds_diff.tile.counts();
    assert_eq!((inserts, updates, deletes), (0, 1, 1));

    // Reset with discard restores both files from the LFS cache.
    wc.reset(&head, true, &SpatialFilter::match_all()).unwrap();
    assert!(!wc.is_dirty().unwrap());
    assert!(dataset_dir.join(TILE_OUTSIDE.0).is_file());
}

#[test]
fn test_feature_filtering_in_working_copy() {
    use meridian_lib::value::Value;
    use testutils::import_points;

    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 50).unwrap();

    // The 50 sample points sit at lon 170.01..170.50 in 0.01 steps.
    // Restrict to a window that keeps the first half of them.
    let filter = SpatialFilter::from_spec(
        "EPSG:4326;POLYGON((170 -46, 170.255 -46, 170.255 -44, 170 -44, 170 -46))",
    )
    .unwrap();

    let head = repo.structure("HEAD").unwrap();
    let empty = RepositoryStructure::empty(repo.store()).unwrap();
    let filtered = empty.diff(&head, &filter).unwrap();
    let unfiltered = empty.diff(&head, &SpatialFilter::match_all()).unwrap();

    let ds = filtered.get(testutils::POINTS_PATH).unwrap();
    assert_eq!(
        unfiltered.get(testutils::POINTS_PATH).unwrap().feature.len(),
        50
    );
    assert_eq!(ds.feature.len(), 25);

    // Every reported feature really falls inside the window.
    for delta in ds.feature.values() {
        let meridian_lib::diff::ItemValue::Feature(row) = delta.new_value().unwrap() else {
            panic!("feature delta without a feature");
        };
        let Value::Geometry(g) = &row[1] else {
            panic!("expected a geometry");
        };
        let envelope = g.envelope().unwrap().unwrap();
        assert!(envelope.max_x <= 170.255);
    }
}
