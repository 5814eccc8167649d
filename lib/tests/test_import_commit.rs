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
use meridian_lib::backend::TreeValue;
use meridian_lib::dataset::Dataset;
use meridian_lib::diff::ItemValue;
use meridian_lib::error::Error;
use meridian_lib::error::exit_code;
use meridian_lib::fast_import::FastImportSettings;
use meridian_lib::fast_import::ReplaceExisting;
use meridian_lib::fast_import::fast_import_tables;
use meridian_lib::path::TreePath;
use meridian_lib::value::Value;
use testutils::POINTS_PATH;
use testutils::TestRepo;
use testutils::import_points;
use testutils::points_rows;
use testutils::points_source;

#[test]
fn test_init_import_commit() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;

    let commit_id = import_points(repo, 2143).unwrap();
    assert_eq!(repo.head_commit_id().unwrap(), Some(commit_id));

    let head = repo.structure("HEAD").unwrap();
    assert_eq!(head.version().unwrap(), 3);

    // The version marker blob sits at the tree root.
    let version_blob = head
        .root_tree()
        .path_value(TreePath::from_internal_string(".repo-version").unwrap())
        .unwrap();
    assert_matches!(version_blob, Some(TreeValue::Blob(_)));

    let datasets = head.datasets().unwrap();
    assert_eq!(datasets.len(), 1);
    let Dataset::Table(table) = &datasets[0] else {
        panic!("expected a tabular dataset");
    };
    assert_eq!(table.path(), POINTS_PATH);
    assert_eq!(table.schema().len(), 6);
    assert_eq!(table.feature_count().unwrap(), 2143);

    // schema.json is a meta item of the dataset tree.
    let meta = table.meta_items().unwrap();
    let ItemValue::Json(schema_json) = meta.get("schema.json").unwrap() else {
        panic!("schema.json must be JSON");
    };
    assert_eq!(schema_json.as_array().unwrap().len(), 6);

    // Random access by primary key.
    let row = table.get_feature(&[Value::Integer(3)]).unwrap();
    assert_eq!(row[0], Value::Integer(3));
    assert_eq!(row[3], Value::Text("point 3".to_string()));
    let missing = table.get_feature(&[Value::Integer(99999)]);
    assert_matches!(missing, Err(_));

    // Batch access skips missing keys when asked to.
    let found: Vec<_> = table
        .get_features(
            vec![vec![Value::Integer(1)], vec![Value::Integer(99999)]],
            true,
        )
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn test_import_into_existing_path_fails() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 10).unwrap();

    let source = points_source(points_rows(5));
    let err = fast_import_tables(
        repo.store(),
        "HEAD",
        repo.author_signature().unwrap(),
        repo.committer_signature().unwrap(),
        &[&source],
        &FastImportSettings::default(),
    )
    .unwrap_err();
    assert_matches!(err, Error::InvalidOperation { .. });
    assert_eq!(err.exit_code(), exit_code::INVALID_OPERATION);
}

#[test]
fn test_replace_existing_reuses_blobs() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let first_commit = import_points(repo, 50).unwrap();

    // Re-import the same content over the top of itself.
    let source = points_source(points_rows(50));
    let settings = FastImportSettings {
        replace_existing: ReplaceExisting::Given,
        allow_empty: true,
        ..Default::default()
    };
    let second_commit = fast_import_tables(
        repo.store(),
        "HEAD",
        repo.author_signature().unwrap(),
        repo.committer_signature().unwrap(),
        &[&source],
        &settings,
    )
    .unwrap();

    let first = repo.store().get_commit(&first_commit).unwrap();
    let second = repo.store().get_commit(&second_commit).unwrap();
    // Identical content deduplicates to the identical tree.
    assert_eq!(first.root_tree, second.root_tree);
}

#[test]
fn test_import_leaves_no_temp_refs() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    import_points(repo, 10).unwrap();
    assert_eq!(repo.store().backend().list_refs("refs/import/").unwrap(), vec![]);
}

#[test]
fn test_import_rejects_invalid_dataset_path() {
    let test_repo = TestRepo::init();
    let repo = &test_repo.repo;
    let bad_source = meridian_lib::tabular::import_source::MemoryImportSource::new(
        "bad:name",
        testutils::points_schema(),
        Default::default(),
        points_rows(1),
    );
    let err = fast_import_tables(
        repo.store(),
        "HEAD",
        repo.author_signature().unwrap(),
        repo.committer_signature().unwrap(),
        &[&bad_source],
        &FastImportSettings::default(),
    )
    .unwrap_err();
    assert_matches!(err, Error::DatasetPath(_));
}
