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

use assert_matches::assert_matches;
use meridian_lib::dataset::Dataset;
use meridian_lib::diff::DatasetDiff;
use meridian_lib::diff::Delta;
use meridian_lib::diff::ItemValue;
use meridian_lib::diff::RepoDiff;
use meridian_lib::error::Error;
use meridian_lib::spatial_filter::SpatialFilter;
use meridian_lib::tabular::Row;
use meridian_lib::value::Value;
use testutils::POINTS_PATH;
use testutils::TestRepo;
use testutils::import_points;
use testutils::point;
use testutils::points_rows;

fn feature_row(fid: i64) -> Row {
    points_rows(fid as usize).pop().unwrap()
}

fn edits_diff(repo: &meridian_lib::repo::Repository) -> RepoDiff {
    let head = repo.structure("HEAD").unwrap();
    let table = head
        .get_dataset(POINTS_PATH)
        .unwrap()
        .unwrap()
        .as_table()
        .cloned()
        .unwrap();

    let mut ds_diff = DatasetDiff::default();
    // One insert...
    let mut inserted = feature_row(1);
    inserted[0] = Value::Integer(99999);
    ds_diff
        .feature
        .add_delta(Delta::insert("99999", ItemValue::Feature(inserted)));
    // ...one update...
    let old_row = table.get_feature(&[Value::Integer(3)]).unwrap();
    let mut new_row = old_row.clone();
    new_row[5] = Value::Text("Te Whare".to_string());
    ds_diff.feature.add_delta(Delta::update(
        "3",
        ItemValue::Feature(old_row),
        "3",
        ItemValue::Feature(new_row),
    ));
    // ...four deletes.
    for fid in 5..=8 {
        let row = table.get_feature(&[Value::Integer(fid)]).unwrap();
        ds_diff
            .feature
            .add_delta(Delta::delete(fid.to_string(), ItemValue::Feature(row)));
    }
    let mut diff = RepoDiff::new();
    diff.insert(POINTS_PATH, ds_diff);
    diff
}

#[test]
fn test_commit_diff_and_roundtrip() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 20).unwrap();
    let old_head = repo.structure("HEAD").unwrap();

    let diff = edits_diff(repo);
    let commit_id = repo.commit_diff(&diff, "edit some points", false).unwrap();
    assert_eq!(repo.head_commit_id().unwrap(), Some(commit_id));

    let new_head = repo.structure("HEAD").unwrap();
    let table = new_head
        .get_dataset(POINTS_PATH)
        .unwrap()
        .unwrap()
        .as_table()
        .cloned()
        .unwrap();
    assert_eq!(table.feature_count().unwrap(), 20 + 1 - 4);
    assert_eq!(
        table.get_feature(&[Value::Integer(3)]).unwrap()[5],
        Value::Text("Te Whare".to_string())
    );
    assert!(table.try_get_feature(&[Value::Integer(6)]).unwrap().is_none());
    assert!(table.try_get_feature(&[Value::Integer(99999)]).unwrap().is_some());

    // After commit, the new tree equals apply(old_tree, diff)...
    let applied_tree = old_head.apply_diff(&diff, false).unwrap();
    assert_eq!(&applied_tree, new_head.root_tree().id());

    // ...and diff(a, b) applied to a yields b's tree (round-trip).
    let recomputed = old_head.diff(&new_head, &SpatialFilter::match_all()).unwrap();
    let reapplied_tree = old_head.apply_diff(&recomputed, false).unwrap();
    assert_eq!(&reapplied_tree, new_head.root_tree().id());
}

#[test]
fn test_empty_commit() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 5).unwrap();
    let head_before = repo.structure("HEAD").unwrap();

    let empty = RepoDiff::new();
    let err = repo.commit_diff(&empty, "nothing", false).unwrap_err();
    assert_matches!(err, Error::NotFound { .. });
    assert_eq!(err.exit_code(), meridian_lib::error::exit_code::NO_CHANGES);

    // With --allow-empty the commit is created and reuses the parent's tree.
    let commit_id = repo.commit_diff(&empty, "empty on purpose", true).unwrap();
    let commit = repo.store().get_commit(&commit_id).unwrap();
    assert_eq!(&commit.root_tree, head_before.root_tree().id());
    assert_eq!(commit.parents, vec![head_before.commit_id().unwrap().clone()]);
}

#[test]
fn test_patch_does_not_apply_collects_all_conflicts() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 10).unwrap();
    let head = repo.structure("HEAD").unwrap();

    let mut ds_diff = DatasetDiff::default();
    // Insert of a key that already exists.
    ds_diff
        .feature
        .add_delta(Delta::insert("1", ItemValue::Feature(feature_row(1))));
    // Delete whose old value does not match the base.
    let mut wrong = feature_row(2);
    wrong[5] = Value::Text("somebody else".to_string());
    ds_diff
        .feature
        .add_delta(Delta::delete("2", ItemValue::Feature(wrong)));
    // Update whose old half is missing from the base entirely.
    let mut missing_old = feature_row(3);
    missing_old[0] = Value::Integer(424242);
    let mut missing_new = missing_old.clone();
    missing_new[5] = Value::Text("new".to_string());
    ds_diff.feature.add_delta(Delta::update(
        "424242",
        ItemValue::Feature(missing_old),
        "424242",
        ItemValue::Feature(missing_new),
    ));
    let mut diff = RepoDiff::new();
    diff.insert(POINTS_PATH, ds_diff);

    let err = head.apply_diff(&diff, false).unwrap_err();
    let Error::PatchDoesNotApply { conflicts } = err else {
        panic!("expected PatchDoesNotApply, got {err:?}");
    };
    // All three conflicts are reported together, not just the first.
    assert_eq!(conflicts.len(), 3);

    // With allow_missing_old_values the same patch goes through.
    assert!(head.apply_diff(&diff, true).is_ok());
}

#[test]
fn test_apply_meta_delta_changes_schema() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 3).unwrap();
    let head = repo.structure("HEAD").unwrap();
    let table = head
        .get_dataset(POINTS_PATH)
        .unwrap()
        .unwrap()
        .as_table()
        .cloned()
        .unwrap();

    // Add a column to the schema.
    let mut columns = table.schema().columns().to_vec();
    columns.push(meridian_lib::schema::Column::new(
        "elevation",
        meridian_lib::schema::DataType::Float { size: 64 },
        None,
    ));
    let new_schema = meridian_lib::schema::Schema::new(columns);

    let mut ds_diff = DatasetDiff::default();
    ds_diff.meta.add_delta(Delta::update(
        "schema.json",
        ItemValue::Json(table.schema().to_json()),
        "schema.json",
        ItemValue::Json(new_schema.to_json()),
    ));
    // And a feature that uses it.
    let mut row = feature_row(2);
    row[0] = Value::Integer(100);
    row.push(Value::Float(12.5));
    let mut with_geom = row.clone();
    with_geom[1] = Value::Geometry(point(173.0, -41.0));
    ds_diff
        .feature
        .add_delta(Delta::insert("100", ItemValue::Feature(with_geom)));
    let mut diff = RepoDiff::new();
    diff.insert(POINTS_PATH, ds_diff);

    repo.commit_diff(&diff, "add elevation column", false).unwrap();

    let new_head = repo.structure("HEAD").unwrap();
    let new_table = new_head
        .get_dataset(POINTS_PATH)
        .unwrap()
        .unwrap()
        .as_table()
        .cloned()
        .unwrap();
    assert_eq!(new_table.schema().len(), 7);
    // Old features decode with a null in the added column.
    let old_feature = new_table.get_feature(&[Value::Integer(1)]).unwrap();
    assert_eq!(old_feature[6], Value::Null);
    // The new feature has its value.
    let new_feature = new_table.get_feature(&[Value::Integer(100)]).unwrap();
    assert_eq!(new_feature[6], Value::Float(12.5));

    // Unaffected column ids survived the schema edit.
    let Dataset::Table(_) = new_head.datasets().unwrap().remove(0) else {
        panic!();
    };
    for col in table.schema().columns() {
        assert_eq!(
            new_table.schema().column_by_name(&col.name).unwrap().id,
            col.id
        );
    }
}
