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
use meridian_lib::diff::DeltaKind;
use meridian_lib::diff::ItemValue;
use meridian_lib::error::Error;
use meridian_lib::repo::Repository;
use meridian_lib::spatial_filter::SpatialFilter;
use meridian_lib::tabular::Row;
use meridian_lib::value::Value;
use meridian_lib::working_copy::WorkingCopy;
use meridian_lib::working_copy::base::UserEdit;
use meridian_lib::working_copy::gpkg::GpkgWorkingCopy;
use testutils::POINTS_PATH;
use testutils::TestRepo;
use testutils::import_points;
use testutils::points_rows;

fn gpkg_wc(repo: &Repository) -> GpkgWorkingCopy {
    match repo.working_copy().unwrap().unwrap() {
        WorkingCopy::Gpkg(wc) => wc,
        other => panic!("expected a GPKG working copy, got {}", other.backend_name()),
    }
}

fn head_table(repo: &Repository) -> meridian_lib::tabular::dataset::TableDataset {
    repo.structure("HEAD")
        .unwrap()
        .get_dataset(POINTS_PATH)
        .unwrap()
        .unwrap()
        .as_table()
        .cloned()
        .unwrap()
}

/// Makes the three canonical edits: insert fid 99999, rename fid 3 to
/// "Te Whare", delete fids 5..=8.
fn make_edits(repo: &Repository, wc: &GpkgWorkingCopy) {
    let table = head_table(repo);
    let mut inserted: Row = points_rows(1).pop().unwrap();
    inserted[0] = Value::Integer(99999);
    wc.apply_user_edit(&table, UserEdit::Insert(inserted)).unwrap();

    let mut updated = table.get_feature(&[Value::Integer(3)]).unwrap();
    updated[5] = Value::Text("Te Whare".to_string());
    wc.apply_user_edit(&table, UserEdit::Update(updated)).unwrap();

    for fid in 5..=8 {
        wc.apply_user_edit(&table, UserEdit::Delete(Value::Integer(fid)))
            .unwrap();
    }
}

#[test]
fn test_checkout_then_edit_then_commit() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 20).unwrap();
    repo.checkout().unwrap();

    let wc = gpkg_wc(repo);
    let head = repo.structure("HEAD").unwrap();
    assert_eq!(
        wc.base_tree_id().unwrap().as_ref(),
        Some(head.root_tree().id())
    );
    assert!(!wc.is_dirty().unwrap());
    wc.check_not_dirty().unwrap();

    make_edits(repo, &wc);
    assert!(wc.is_dirty().unwrap());
    assert_matches!(wc.check_not_dirty(), Err(Error::UncommittedChanges));

    // Status: 1 insert, 1 update, 4 deletes.
    let diff = wc.diff_to_tree(&SpatialFilter::match_all()).unwrap();
    let ds_diff = diff.get(POINTS_PATH).unwrap();
    assert_eq!(ds_diff.feature.counts(), (1, 1, 4));
    assert!(ds_diff.meta.is_empty());
    let update = ds_diff.feature.get("3").unwrap();
    assert_eq!(update.kind(), DeltaKind::Update);
    assert_matches!(
        update.new_value(),
        Some(ItemValue::Feature(row)) if row[5] == Value::Text("Te Whare".to_string())
    );

    // Commit the working-copy diff; the track table empties and the state
    // advances to the new head tree.
    let commit_id = repo.commit_diff(&diff, "edit points", false).unwrap();
    assert!(!wc.is_dirty().unwrap());
    let new_head = repo.structure("HEAD").unwrap();
    assert_eq!(new_head.commit_id(), Some(&commit_id));
    assert_eq!(
        wc.base_tree_id().unwrap().as_ref(),
        Some(new_head.root_tree().id())
    );

    // The committed tree holds the edits.
    let table = head_table(repo);
    assert_eq!(
        table.get_feature(&[Value::Integer(3)]).unwrap()[5],
        Value::Text("Te Whare".to_string())
    );
    assert!(table.try_get_feature(&[Value::Integer(5)]).unwrap().is_none());
    assert_eq!(table.feature_count().unwrap(), 20 + 1 - 4);
}

#[test]
fn test_reset_preserves_edits() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 20).unwrap();

    // A second commit touching only fid 9, so HEAD^ differs from HEAD.
    {
        let table = head_table(repo);
        let old_row = table.get_feature(&[Value::Integer(9)]).unwrap();
        let mut new_row = old_row.clone();
        new_row[3] = Value::Text("renamed in second commit".to_string());
        let mut ds_diff = meridian_lib::diff::DatasetDiff::default();
        ds_diff.feature.add_delta(meridian_lib::diff::Delta::update(
            "9",
            ItemValue::Feature(old_row),
            "9",
            ItemValue::Feature(new_row),
        ));
        let mut diff = meridian_lib::diff::RepoDiff::new();
        diff.insert(POINTS_PATH, ds_diff);
        repo.commit_diff(&diff, "touch fid 9", false).unwrap();
    }

    repo.checkout().unwrap();
    let wc = gpkg_wc(repo);
    make_edits(repo, &wc);

    // Reset to HEAD^ without discarding: the edits survive and stay
    // tracked; fid 9 reverts to its first-commit value.
    let parent = repo.structure("HEAD^").unwrap();
    wc.reset(&parent, false, &SpatialFilter::match_all()).unwrap();
    assert_eq!(
        wc.base_tree_id().unwrap().as_ref(),
        Some(parent.root_tree().id())
    );
    assert!(wc.is_dirty().unwrap());

    let diff = wc.diff_to_tree(&SpatialFilter::match_all()).unwrap();
    let ds_diff = diff.get(POINTS_PATH).unwrap();
    assert_eq!(ds_diff.feature.counts(), (1, 1, 4));
    // fid 9 does not appear: it matches the new base again.
    assert!(ds_diff.feature.get("9").is_none());
}

#[test]
fn test_reset_conflicting_edit_is_refused() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 20).unwrap();

    // Second commit touches fid 3 - the same row the user will edit.
    {
        let table = head_table(repo);
        let old_row = table.get_feature(&[Value::Integer(3)]).unwrap();
        let mut new_row = old_row.clone();
        new_row[3] = Value::Text("conflicting".to_string());
        let mut ds_diff = meridian_lib::diff::DatasetDiff::default();
        ds_diff.feature.add_delta(meridian_lib::diff::Delta::update(
            "3",
            ItemValue::Feature(old_row),
            "3",
            ItemValue::Feature(new_row),
        ));
        let mut diff = meridian_lib::diff::RepoDiff::new();
        diff.insert(POINTS_PATH, ds_diff);
        repo.commit_diff(&diff, "touch fid 3", false).unwrap();
    }

    repo.checkout().unwrap();
    let wc = gpkg_wc(repo);
    make_edits(repo, &wc);

    let parent = repo.structure("HEAD^").unwrap();
    let err = wc
        .reset(&parent, false, &SpatialFilter::match_all())
        .unwrap_err();
    assert_matches!(err, Error::UncommittedChanges);
    // State unchanged: still at HEAD, still dirty.
    let head = repo.structure("HEAD").unwrap();
    assert_eq!(
        wc.base_tree_id().unwrap().as_ref(),
        Some(head.root_tree().id())
    );
    assert!(wc.is_dirty().unwrap());
}

#[test]
fn test_reset_discards_edits() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 20).unwrap();
    repo.checkout().unwrap();

    let wc = gpkg_wc(repo);
    make_edits(repo, &wc);
    assert!(wc.is_dirty().unwrap());

    let head = repo.structure("HEAD").unwrap();
    wc.reset(&head, true, &SpatialFilter::match_all()).unwrap();

    assert!(!wc.is_dirty().unwrap());
    assert_eq!(
        wc.base_tree_id().unwrap().as_ref(),
        Some(head.root_tree().id())
    );
    let diff = wc.diff_to_tree(&SpatialFilter::match_all()).unwrap();
    assert!(diff.is_empty());
}

#[test]
fn test_edit_then_revert_is_not_a_diff() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 5).unwrap();
    repo.checkout().unwrap();

    let wc = gpkg_wc(repo);
    let table = head_table(repo);
    let original = table.get_feature(&[Value::Integer(2)]).unwrap();
    let mut changed = original.clone();
    changed[5] = Value::Text("temporary".to_string());
    wc.apply_user_edit(&table, UserEdit::Update(changed)).unwrap();
    wc.apply_user_edit(&table, UserEdit::Update(original)).unwrap();

    // The row is tracked but identical to the base; the diff hides it.
    let diff = wc.diff_to_tree(&SpatialFilter::match_all()).unwrap();
    assert!(diff.is_empty());
}
