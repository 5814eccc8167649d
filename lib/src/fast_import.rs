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
//! The fast-importer: streams blobs into the object database through up to
//! 64 bulk-import sessions and produces a single commit.
//!
//! To import in parallel:
//!   * there is one controller and one connection to the source;
//!   * there are multiple bulk-import workers, each writing its own
//!     temporary ref;
//!   * every worker receives every meta blob, so the workers agree on the
//!     dataset-level data;
//!   * each feature blob is routed by its first subtree name, so no two
//!     workers ever write into the same subtree;
//!   * afterwards the workers' trees are merged; by construction this merge
//!     cannot conflict.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::backend::BulkImportOptions;
use crate::backend::BulkImportSession;
use crate::backend::CommitId;
use crate::backend::Signature;
use crate::dataset::Dataset;
use crate::dataset::FEATURE_DIRNAME;
use crate::dataset::META_DIRNAME;
use crate::dataset::meta_item_to_bytes;
use crate::error::Error;
use crate::error::Result;
use crate::path::TreePath;
use crate::path::validate_dataset_paths;
use crate::schema::Schema;
use crate::store::Store;
use crate::structure::REPO_VERSION_BLOB;
use crate::structure::RepositoryStructure;
use crate::tabular::codec;
use crate::tabular::codec::Legend;
use crate::tabular::feature_path::PathStructure;
use crate::tabular::import_source::ImportSource;
use crate::tabular::import_source::aggregate_import_message;
use crate::tree_builder::TreeBuilder;

const MAX_WORKERS: usize = 64;

/// What to do when an import destination already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceExisting {
    /// Don't replace any existing datasets; fail if a destination exists.
    /// Imports start from the existing HEAD state.
    DontReplace,
    /// Any datasets in the import replace existing datasets with the same
    /// name. Datasets not in the import are untouched.
    Given,
    /// All existing datasets are replaced by the given datasets.
    All,
}

#[derive(Debug, Clone)]
pub struct FastImportSettings {
    pub num_workers: usize,
    pub replace_existing: ReplaceExisting,
    pub allow_empty: bool,
    /// Commit message; generated from the sources when None.
    pub message: Option<String>,
}

impl Default for FastImportSettings {
    fn default() -> Self {
        Self {
            num_workers: 4,
            replace_existing: ReplaceExisting::DontReplace,
            allow_empty: false,
            message: None,
        }
    }
}

static IMPORT_REF_COUNTER: AtomicU64 = AtomicU64::new(0);

fn new_import_ref() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let count = IMPORT_REF_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "refs/import/{:08x}-{nanos:08x}-{count:04x}",
        std::process::id()
    )
}

/// Imports all of the given sources as datasets and commits the result to
/// `target_ref`. Returns the new commit.
#[instrument(skip_all, fields(sources = sources.len(), workers = settings.num_workers))]
pub fn fast_import_tables(
    store: &Arc<Store>,
    target_ref: &str,
    author: Signature,
    committer: Signature,
    sources: &[&dyn ImportSource],
    settings: &FastImportSettings,
) -> Result<CommitId> {
    let num_workers = settings.num_workers.clamp(1, MAX_WORKERS);
    if settings.num_workers > MAX_WORKERS {
        return Err(Error::invalid_operation(format!(
            "Can't import with more than {MAX_WORKERS} workers"
        )));
    }

    let orig_commit = store.resolve_ref(target_ref).map_err(Error::from)?;

    // The tree we look at for considering what datasets already exist depends
    // on what we want to replace.
    let starting_commit = match settings.replace_existing {
        ReplaceExisting::All => None,
        _ => orig_commit.clone(),
    };
    let starting = starting_commit
        .as_ref()
        .map(|id| RepositoryStructure::at_commit(store, id))
        .transpose()?;

    let mut existing_paths: Vec<String> = Vec::new();
    if let Some(starting) = &starting {
        for dataset in starting.datasets()? {
            existing_paths.push(dataset.path().to_string());
        }
    }
    let mut all_paths = existing_paths.clone();
    for source in sources {
        if settings.replace_existing == ReplaceExisting::DontReplace
            && existing_paths.iter().any(|p| p == source.dest_path())
        {
            return Err(Error::invalid_operation(format!(
                "Cannot import to {}/ - already exists in repository",
                source.dest_path()
            )));
        }
        if !all_paths.iter().any(|p| p == source.dest_path()) {
            all_paths.push(source.dest_path().to_string());
        }
    }
    validate_dataset_paths(all_paths.iter().map(String::as_str))?;

    let message = settings
        .message
        .clone()
        .unwrap_or_else(|| aggregate_import_message(sources));

    let mut import_refs: Vec<String> = Vec::new();
    let result = run_import(
        store,
        orig_commit.as_ref(),
        starting.as_ref(),
        num_workers,
        &author,
        &committer,
        &message,
        sources,
        settings,
        &mut import_refs,
    );
    // Remove the import refs whether or not the import succeeded; a failure
    // must not leave temporary refs behind.
    for ref_name in &import_refs {
        if let Err(err) = store.delete_ref(ref_name) {
            debug!(ref_name, ?err, "could not delete import ref");
        }
    }
    let new_commit_id = result?;
    store.set_ref(target_ref, &new_commit_id).map_err(Error::from)?;
    Ok(new_commit_id)
}

#[allow(clippy::too_many_arguments)]
fn run_import(
    store: &Arc<Store>,
    orig_commit: Option<&CommitId>,
    starting: Option<&RepositoryStructure>,
    num_workers: usize,
    author: &Signature,
    committer: &Signature,
    message: &str,
    sources: &[&dyn ImportSource],
    settings: &FastImportSettings,
    import_refs: &mut Vec<String>,
) -> Result<CommitId> {
    let from = match settings.replace_existing {
        ReplaceExisting::All => None,
        _ => orig_commit.cloned(),
    };

    let mut workers: Vec<Box<dyn BulkImportSession + '_>> = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let ref_name = new_import_ref();
        import_refs.push(ref_name.clone());
        let options = BulkImportOptions {
            ref_name,
            from: from.clone(),
            author: author.clone(),
            committer: committer.clone(),
            message: message.to_string(),
        };
        workers.push(store.backend().start_bulk_import(options)?);
    }

    // The blob that records the repository-structure version is written by
    // the first commit.
    if starting.is_none() {
        let path = TreePath::from_internal_string(REPO_VERSION_BLOB).unwrap();
        workers[0].write_inline_blob(path, b"3\n")?;
    }

    for source in sources {
        import_single_source(starting, &mut workers, *source, settings)?;
    }

    let mut commit_ids = Vec::with_capacity(workers.len());
    for worker in workers {
        commit_ids.push(worker.finish()?);
    }

    // Each temporary ref holds part of the import; join the feature subtrees
    // of workers 1.. into worker 0's tree.
    let first_commit = store.get_commit(&commit_ids[0])?;
    let new_tree_id = if commit_ids.len() > 1 {
        info!(trees = commit_ids.len(), "joining parallel-imported trees");
        let mut builder = TreeBuilder::new(store.clone(), first_commit.root_tree.clone());
        for commit_id in &commit_ids[1..] {
            let commit = store.get_commit(commit_id)?;
            let structure = RepositoryStructure::at_tree(store, commit.root_tree.clone())?;
            for dataset in structure.datasets()? {
                let Dataset::Table(table) = &dataset else {
                    continue;
                };
                let feature_dir = crate::path::TreePathComponent::new(FEATURE_DIRNAME).unwrap();
                let Some(feature_tree) = table.tree().sub_tree(feature_dir)? else {
                    continue;
                };
                for entry in feature_tree.entries_non_recursive() {
                    let path = feature_tree.dir().join(entry.name());
                    builder.set(path, entry.value().clone());
                }
            }
        }
        builder.write_tree()?
    } else {
        first_commit.root_tree.clone()
    };

    if !settings.allow_empty {
        let orig_tree_id = orig_commit
            .map(|id| store.get_commit(id).map(|c| c.root_tree.clone()))
            .transpose()?;
        if Some(&new_tree_id) == orig_tree_id.as_ref() {
            return Err(Error::no_changes());
        }
    }

    // Reuse the commit details already written to the temp refs, but with the
    // joined tree.
    let commit = crate::backend::Commit {
        parents: first_commit.parents.clone(),
        root_tree: new_tree_id,
        author: first_commit.author.clone(),
        committer: first_commit.committer.clone(),
        message: first_commit.message.clone(),
    };
    let (commit_id, _) = store.write_commit(commit)?;
    Ok(commit_id)
}

/// Routes a feature partition name (first subtree name) to a worker index.
fn worker_for_partition(partition: &str, num_workers: usize) -> usize {
    usize::from_str_radix(partition, 16).unwrap_or(0) % num_workers
}

fn import_single_source(
    starting: Option<&RepositoryStructure>,
    workers: &mut [Box<dyn BulkImportSession + '_>],
    source: &dyn ImportSource,
    settings: &FastImportSettings,
) -> Result<()> {
    let dest = TreePath::from_internal_string(source.dest_path())
        .map_err(|e| Error::invalid_operation(e.to_string()))?;

    let replacing_dataset = match (settings.replace_existing, starting) {
        (ReplaceExisting::Given, Some(starting)) => starting
            .get_dataset(source.dest_path())?
            .and_then(|ds| match ds {
                Dataset::Table(table) => Some(table),
                Dataset::Tile(_) => None,
            }),
        _ => None,
    };

    // Align the schema to the replaced dataset so that unchanged columns keep
    // their ids and unchanged features keep their blobs.
    let schema = match &replacing_dataset {
        Some(old) => source.schema().aligned_to(old.schema()),
        None => source.schema().clone(),
    };
    let legend = Legend::from_schema(&schema);
    let path_structure = PathStructure::default();

    if settings.replace_existing == ReplaceExisting::Given {
        // Clear the existing dataset before importing over the top of it.
        for worker in workers.iter_mut() {
            worker.delete_path(dest)?;
        }
        // We just deleted the legends, but we still need them to reimport
        // data efficiently. Copy them from the original dataset.
        if let Some(old) = &replacing_dataset {
            for (name, bytes) in old.legend_blobs() {
                let path = dest.concat(
                    TreePath::from_internal_string(&format!("{META_DIRNAME}/{name}")).unwrap(),
                );
                for worker in workers.iter_mut() {
                    worker.write_inline_blob(&path, &bytes)?;
                }
            }
        }
    }

    // Only compare against old blobs when it can actually pay off: same PK,
    // columns only added or removed.
    let compare_against_old = replacing_dataset.as_ref().is_some_and(|old| {
        let counts = old.schema().diff_type_counts(&schema);
        counts.pk_updates == 0 && (counts.inserts > 0 || counts.deletes > 0)
    });

    info!(
        count = source.feature_count(),
        dest = source.dest_path(),
        "importing features"
    );

    // Features first; meta items second, since some importers refine their
    // metadata as they read.
    let pk_positions: Vec<usize> = schema
        .pk_columns()
        .iter()
        .map(|col| {
            schema
                .columns()
                .iter()
                .position(|c| c.id == col.id)
                .unwrap()
        })
        .collect();
    for row in source.features() {
        let row = row.map_err(|e| Error::Uncategorized {
            message: e.to_string(),
        })?;
        if let Some(column) = schema.find_violation(&row) {
            return Err(Error::schema_violation(format!(
                "Value for column {column:?} in {} violates its type",
                source.dest_path()
            )));
        }
        let pk: Vec<_> = pk_positions.iter().map(|i| row[*i].clone()).collect();
        let rel_path = TreePath::from_internal_string(FEATURE_DIRNAME)
            .unwrap()
            .concat(&path_structure.encode_path(&pk));
        let blob = codec::encode_feature(&schema, &legend, &row)
            .map_err(|e| Error::schema_violation(e.to_string()))?;
        let full_path = dest.concat(&rel_path);
        let partition = path_structure.partition_name(&pk);
        let worker = &mut workers[worker_for_partition(&partition, workers.len())];
        let reused = compare_against_old
            && match replacing_dataset
                .as_ref()
                .unwrap()
                .get_feature_blob(&rel_path)
            {
                Ok(Some((old_blob_id, old_bytes))) if old_bytes == blob => {
                    // Identical encoded form: reuse the stored blob.
                    worker.copy_blob(&full_path, &old_blob_id)?;
                    true
                }
                _ => false,
            };
        if !reused {
            worker.write_inline_blob(&full_path, &blob)?;
        }
    }

    // Meta items go to every worker, so that each worker's partial tree is a
    // well-formed dataset and all workers agree on the dataset-level data.
    let meta = collect_meta_blobs(&schema, &legend, &path_structure, source);
    for (name, bytes) in meta {
        let path = dest
            .concat(TreePath::from_internal_string(&format!("{META_DIRNAME}/{name}")).unwrap());
        for worker in workers.iter_mut() {
            worker.write_inline_blob(&path, &bytes)?;
        }
    }
    Ok(())
}

fn collect_meta_blobs(
    schema: &Schema,
    legend: &Legend,
    path_structure: &PathStructure,
    source: &dyn ImportSource,
) -> Vec<(String, Vec<u8>)> {
    let mut result = vec![
        ("version".to_string(), b"3\n".to_vec()),
        ("schema.json".to_string(), schema.to_json_bytes()),
        (
            "path-structure.json".to_string(),
            path_structure.to_json_bytes(),
        ),
        (
            format!("legend/{}", legend.hex_hash()),
            legend.encode(),
        ),
    ];
    for (name, value) in source.meta_items() {
        result.push((name, meta_item_to_bytes(&value)));
    }
    result
}

/// A bulk-import session that drives an external helper process speaking the
/// line-oriented fast-import stream on its standard input. Used by backends
/// whose object database has an out-of-process bulk-insert mode; the simple
/// backend writes in-process instead.
///
/// The child is an owned handle: dropping the session without `finish`
/// kills it. A pipe closed early surfaces as `BrokenImportPipe`; a non-zero
/// exit as `ImportHelperFailed` carrying the raw status.
pub struct StreamImportSession {
    child: std::process::Child,
    stdin: Option<std::io::BufWriter<std::process::ChildStdin>>,
    resolve: Option<Box<dyn FnOnce() -> crate::backend::BackendResult<CommitId> + Send>>,
}

impl StreamImportSession {
    pub fn spawn(
        mut command: std::process::Command,
        options: &BulkImportOptions,
        resolve: Box<dyn FnOnce() -> crate::backend::BackendResult<CommitId> + Send>,
    ) -> crate::backend::BackendResult<Self> {
        use crate::object_id::ObjectId as _;

        let mut child = command
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| crate::backend::BackendError::Other(e.into()))?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let mut session = Self {
            child,
            stdin: Some(std::io::BufWriter::with_capacity(128 * 1024, stdin)),
            resolve: Some(resolve),
        };
        let header = {
            let message = options.message.as_bytes();
            let mut header = format!(
                "commit {}\nauthor {}\ncommitter {}\ndata {}\n",
                options.ref_name,
                format_signature(&options.author),
                format_signature(&options.committer),
                message.len(),
            )
            .into_bytes();
            header.extend_from_slice(message);
            header.push(b'\n');
            if let Some(from) = &options.from {
                header.extend_from_slice(format!("from {}\n", from.hex()).as_bytes());
            }
            header
        };
        session.write_stream(&header)?;
        Ok(session)
    }

    fn write_stream(&mut self, bytes: &[u8]) -> crate::backend::BackendResult<()> {
        use std::io::Write as _;
        let stdin = self
            .stdin
            .as_mut()
            .expect("session already finished");
        stdin.write_all(bytes).map_err(map_pipe_err)
    }
}

fn map_pipe_err(err: std::io::Error) -> crate::backend::BackendError {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        crate::backend::BackendError::BrokenImportPipe { source: err.into() }
    } else {
        crate::backend::BackendError::Other(err.into())
    }
}

fn format_signature(signature: &Signature) -> String {
    let offset = signature.timestamp.tz_offset;
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.abs();
    format!(
        "{} <{}> {} {sign}{:02}{:02}",
        signature.name,
        signature.email,
        signature.timestamp.timestamp.0.div_euclid(1000),
        offset / 60,
        offset % 60,
    )
}

impl BulkImportSession for StreamImportSession {
    fn write_inline_blob(
        &mut self,
        path: &TreePath,
        data: &[u8],
    ) -> crate::backend::BackendResult<()> {
        let header = format!(
            "M 644 inline {}\ndata {}\n",
            path.as_internal_file_string(),
            data.len()
        );
        self.write_stream(header.as_bytes())?;
        self.write_stream(data)?;
        self.write_stream(b"\n")
    }

    fn copy_blob(
        &mut self,
        path: &TreePath,
        id: &crate::backend::BlobId,
    ) -> crate::backend::BackendResult<()> {
        use crate::object_id::ObjectId as _;
        let line = format!("M 644 {} {}\n", id.hex(), path.as_internal_file_string());
        self.write_stream(line.as_bytes())
    }

    fn delete_path(&mut self, path: &TreePath) -> crate::backend::BackendResult<()> {
        let line = format!("D {}\n", path.as_internal_file_string());
        self.write_stream(line.as_bytes())
    }

    fn finish(mut self: Box<Self>) -> crate::backend::BackendResult<CommitId> {
        use std::io::Write as _;
        self.write_stream(b"\ndone\n")?;
        let mut stdin = self.stdin.take().unwrap();
        stdin.flush().map_err(map_pipe_err)?;
        drop(stdin);
        let status = self
            .child
            .wait()
            .map_err(|e| crate::backend::BackendError::Other(e.into()))?;
        if !status.success() {
            return Err(crate::backend::BackendError::ImportHelperFailed {
                // A signal-kill has no exit code; report it in the 128+ range.
                status: status.code().unwrap_or(128 + 9),
            });
        }
        (self.resolve.take().unwrap())()
    }
}

impl Drop for StreamImportSession {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            // Never finished: kill the helper rather than deadlocking on a
            // half-written stream.
            drop(self.stdin.take());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_for_partition_is_stable() {
        assert_eq!(worker_for_partition("00", 8), 0);
        assert_eq!(worker_for_partition("09", 8), 1);
        assert_eq!(worker_for_partition("ff", 8), 255 % 8);
        // Bad partition names fall back to worker 0 rather than panicking.
        assert_eq!(worker_for_partition("zz", 8), 0);
    }

    #[test]
    fn test_import_refs_are_unique() {
        let a = new_import_ref();
        let b = new_import_ref();
        assert_ne!(a, b);
        assert!(a.starts_with("refs/import/"));
    }

    #[cfg(unix)]
    mod stream_session {
        use std::process::Command;

        use assert_matches::assert_matches;

        use super::*;
        use crate::backend::BackendError;
        use crate::backend::MillisSinceEpoch;
        use crate::backend::Timestamp;

        fn options() -> BulkImportOptions {
            BulkImportOptions {
                ref_name: "refs/import/test".to_string(),
                from: None,
                author: Signature {
                    name: "Someone".to_string(),
                    email: "someone@example.com".to_string(),
                    timestamp: Timestamp {
                        timestamp: MillisSinceEpoch(1_600_000_000_000),
                        tz_offset: 780,
                    },
                },
                committer: Signature {
                    name: "Someone".to_string(),
                    email: "someone@example.com".to_string(),
                    timestamp: Timestamp {
                        timestamp: MillisSinceEpoch(1_600_000_000_000),
                        tz_offset: 780,
                    },
                },
                message: "import".to_string(),
            }
        }

        #[test]
        fn test_stream_protocol_bytes() {
            let temp_dir = tempfile::tempdir().unwrap();
            let out_path = temp_dir.path().join("stream");
            let mut command = Command::new("sh");
            command.arg("-c").arg(format!(
                "cat > {}",
                out_path.to_str().unwrap()
            ));
            let expected_id = CommitId::from_hex("aabb");
            let resolve_id = expected_id.clone();
            let mut session =
                StreamImportSession::spawn(command, &options(), Box::new(move || Ok(resolve_id)))
                    .unwrap();
            let path = TreePath::from_internal_string("ds/meta/title").unwrap();
            session.write_inline_blob(path, b"Title").unwrap();
            session
                .delete_path(TreePath::from_internal_string("ds/feature/aa").unwrap())
                .unwrap();
            let id = Box::new(session).finish().unwrap();
            assert_eq!(id, expected_id);

            let written = std::fs::read_to_string(&out_path).unwrap();
            assert!(written.starts_with("commit refs/import/test\n"));
            assert!(written.contains("author Someone <someone@example.com> 1600000000 +1300\n"));
            assert!(written.contains("data 6\nimport\n"));
            assert!(written.contains("M 644 inline ds/meta/title\ndata 5\nTitle\n"));
            assert!(written.contains("D ds/feature/aa\n"));
            assert!(written.ends_with("\ndone\n"));
        }

        #[test]
        fn test_helper_failure_is_translated() {
            let mut command = Command::new("sh");
            command.arg("-c").arg("cat > /dev/null; exit 3");
            let session =
                StreamImportSession::spawn(command, &options(), Box::new(|| unreachable!()))
                    .unwrap();
            let err = Box::new(session).finish().unwrap_err();
            assert_matches!(err, BackendError::ImportHelperFailed { status: 3 });
            assert_eq!(Error::from(err).exit_code(), 131);
        }
    }
}
