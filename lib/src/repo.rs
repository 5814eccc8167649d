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
//! The repository facade.
//!
//! Two on-disk styles exist. A *tidy-style* repository hides the object
//! database in `./.repo/` and keeps the root free for the working copy; a
//! `.git` pointer file plus a deliberately unreadable index make foreign
//! Git tooling fail fast instead of corrupting derived state. A *bare-style*
//! repository keeps the object database at the root and has no working copy.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

use sha1::Digest as _;
use sha1::Sha1;
use tracing::instrument;

use crate::backend::CommitId;
use crate::backend::Signature;
use crate::backend::Timestamp;
use crate::diff::RepoDiff;
use crate::error::Error;
use crate::error::Result;
use crate::error::exit_code;
use crate::simple_backend::SimpleBackend;
use crate::spatial_filter::SpatialFilter;
use crate::store::Store;
use crate::structure::RepositoryStructure;
use crate::working_copy::WorkingCopy;

pub const REPO_DIRNAME: &str = ".repo";
const GIT_POINTER_FILE: &str = ".git";
const INDEX_FILE: &str = "index";
const MERGE_HEAD_FILE: &str = "MERGE_HEAD";
const CONFIG_FILE: &str = "config.toml";

/// Configuration keys found in the repository config.
pub mod config_keys {
    pub const REPO_VERSION: &str = "repo.version";
    pub const WORKINGCOPY_PATH: &str = "workingcopy.path";
    pub const WORKINGCOPY_BARE: &str = "workingcopy.bare";
    pub const SPATIALFILTER_GEOMETRY: &str = "spatialfilter.geometry";
    pub const SPATIALFILTER_CRS: &str = "spatialfilter.crs";
    pub const SPATIALFILTER_REFERENCE: &str = "spatialfilter.reference";
    pub const SPATIALFILTER_OBJECTID: &str = "spatialfilter.objectid";
    pub const USER_NAME: &str = "user.name";
    pub const USER_EMAIL: &str = "user.email";
}

/// NORMAL, or MERGING while a merge has unresolved conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoState {
    Normal,
    Merging,
}

/// Bytes of the locked index: a v2 git index with zero entries plus a
/// required extension whose tag does not start with an uppercase letter, so
/// compliant tools refuse to read it. See the git index-format docs.
pub fn locked_index_bytes() -> Vec<u8> {
    let mut data = Vec::with_capacity(12 + 8 + 20);
    data.extend_from_slice(b"DIRC");
    data.extend_from_slice(&2u32.to_be_bytes()); // index version
    data.extend_from_slice(&0u32.to_be_bytes()); // entry count
    data.extend_from_slice(b".rep"); // required-extension tag
    data.extend_from_slice(&0u32.to_be_bytes()); // extension payload length
    let checksum = Sha1::digest(&data);
    data.extend_from_slice(&checksum);
    data
}

/// The repository facade: object database handle, config, head reference,
/// state, and at most one working copy.
pub struct Repository {
    store: Arc<Store>,
    /// The directory user files live in (tidy) or the repo dir itself
    /// (bare).
    workdir: PathBuf,
    /// The directory holding the object database and repo files.
    repo_dir: PathBuf,
    bare: bool,
    config: Mutex<toml_edit::DocumentMut>,
}

impl Repository {
    /// Initialises a new repository. Tidy-style unless `bare`; tidy-style
    /// repositories default their working copy to `<dirname>.gpkg`.
    #[instrument(skip_all, fields(path = %root_path.as_ref().display(), bare))]
    pub fn init(
        root_path: impl AsRef<Path>,
        bare: bool,
        wc_location: Option<String>,
    ) -> Result<Self> {
        let root_path = root_path.as_ref();
        fs::create_dir_all(root_path).map_err(io_error)?;
        if fs::read_dir(root_path).map_err(io_error)?.next().is_some() {
            return Err(Error::invalid_operation(format!(
                "{} isn't empty",
                root_path.display()
            )));
        }

        let repo_dir = if bare {
            root_path.to_path_buf()
        } else {
            root_path.join(REPO_DIRNAME)
        };
        fs::create_dir_all(&repo_dir).map_err(io_error)?;
        SimpleBackend::init(&repo_dir)?;

        if !bare {
            // Lock the repo against foreign git tooling: a .git pointer file
            // plus an index carrying a required extension they cannot read.
            fs::write(
                root_path.join(GIT_POINTER_FILE),
                format!("gitdir: {REPO_DIRNAME}\n"),
            )
            .map_err(io_error)?;
            fs::write(repo_dir.join(INDEX_FILE), locked_index_bytes()).map_err(io_error)?;
        }

        let mut config = toml_edit::DocumentMut::new();
        config[config_keys::REPO_VERSION] = toml_edit::value(3i64);
        config[config_keys::WORKINGCOPY_BARE] = toml_edit::value(bare);
        if !bare {
            let default_location = wc_location.unwrap_or_else(|| {
                let stem = root_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "data".to_string());
                format!("{stem}.gpkg")
            });
            config[config_keys::WORKINGCOPY_PATH] = toml_edit::value(default_location);
        }
        fs::write(repo_dir.join(CONFIG_FILE), config.to_string()).map_err(io_error)?;

        Self::open(root_path)
    }

    /// Opens an existing repository, detecting its style.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (workdir, repo_dir, bare) = if path.join(REPO_DIRNAME).is_dir() {
            (path.clone(), path.join(REPO_DIRNAME), false)
        } else if path.join("refs").is_dir() {
            (path.clone(), path.clone(), true)
        } else {
            return Err(Error::not_found_with_code(
                "Current directory is not an existing repository",
                exit_code::NO_REPOSITORY,
            ));
        };
        let config_text = fs::read_to_string(repo_dir.join(CONFIG_FILE)).unwrap_or_default();
        let config: toml_edit::DocumentMut =
            config_text.parse().map_err(|e| Error::Uncategorized {
                message: format!("Invalid repository config: {e}"),
            })?;
        let backend = SimpleBackend::load(&repo_dir);
        let store = Store::new(Box::new(backend));
        let repo = Self {
            store,
            workdir,
            repo_dir,
            bare,
            config: Mutex::new(config),
        };
        if let Some(head) = repo.head_commit_id()? {
            RepositoryStructure::at_commit(&repo.store, &head)?.check_version_supported()?;
        }
        Ok(repo)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    pub fn is_bare(&self) -> bool {
        self.bare
    }

    // --- config ---

    pub fn get_config(&self, key: &str) -> Option<String> {
        let config = self.config.lock().unwrap();
        config
            .get(key)
            .and_then(|item| item.as_value())
            .map(|value| match value {
                toml_edit::Value::String(s) => s.value().clone(),
                other => other.to_string().trim().to_string(),
            })
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        config[key] = toml_edit::value(value);
        fs::write(self.repo_dir.join(CONFIG_FILE), config.to_string()).map_err(io_error)
    }

    pub fn del_config(&self, key: &str) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        config.remove(key);
        fs::write(self.repo_dir.join(CONFIG_FILE), config.to_string()).map_err(io_error)
    }

    // --- state ---

    pub fn state(&self) -> RepoState {
        if self.repo_dir.join(MERGE_HEAD_FILE).exists() {
            RepoState::Merging
        } else {
            RepoState::Normal
        }
    }

    pub fn ensure_state_is(&self, expected: RepoState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            return Ok(());
        }
        let message = match actual {
            RepoState::Merging => {
                "This command does not work while the repository is in \"merging\" state.\n\
                 Use `merge --abort` to abandon the merge and get back to the previous state."
            }
            RepoState::Normal => {
                "This command only works when the repository is in \"merging\" state, \
                 but it is in \"normal\" state."
            }
        };
        Err(Error::invalid_operation(message))
    }

    pub fn begin_merging(&self, merge_head: &CommitId) -> Result<()> {
        use crate::object_id::ObjectId as _;
        fs::write(
            self.repo_dir.join(MERGE_HEAD_FILE),
            format!("{}\n", merge_head.hex()),
        )
        .map_err(io_error)
    }

    pub fn end_merging(&self) -> Result<()> {
        let path = self.repo_dir.join(MERGE_HEAD_FILE);
        if path.exists() {
            fs::remove_file(path).map_err(io_error)?;
        }
        Ok(())
    }

    // --- refs and structure ---

    pub fn head_commit_id(&self) -> Result<Option<CommitId>> {
        Ok(self.store.resolve_ref("HEAD")?)
    }

    /// Resolves `refish`: a ref name, a commit id hex, with optional `^`
    /// suffixes selecting first parents.
    pub fn resolve_refish(&self, refish: &str) -> Result<CommitId> {
        let base = refish.trim_end_matches('^');
        let ancestor_hops = refish.len() - base.len();
        let mut commit_id = match self.store.resolve_ref(base)? {
            Some(id) => id,
            None => CommitId::try_from_hex(base).ok_or_else(|| {
                Error::not_found_with_code(
                    format!("No commit or reference {refish:?}"),
                    exit_code::NO_COMMIT,
                )
            })?,
        };
        for _ in 0..ancestor_hops {
            let commit = self.store.get_commit(&commit_id)?;
            commit_id = commit.parents.first().cloned().ok_or_else(|| {
                Error::not_found_with_code(
                    format!("{refish:?} has no parent commit"),
                    exit_code::NO_COMMIT,
                )
            })?;
        }
        Ok(commit_id)
    }

    /// The datasets view of `refish` (default HEAD).
    pub fn structure(&self, refish: &str) -> Result<RepositoryStructure> {
        let commit_id = self.resolve_refish(refish)?;
        RepositoryStructure::at_commit(&self.store, &commit_id)
    }

    /// The datasets of `refish` keyed by path.
    pub fn datasets(&self, refish: &str) -> Result<Vec<crate::dataset::Dataset>> {
        self.structure(refish)?.datasets()
    }

    // --- identity ---

    fn signature(&self) -> Result<Signature> {
        let name = self.get_config(config_keys::USER_NAME);
        let email = self.get_config(config_keys::USER_EMAIL);
        match (name, email) {
            (Some(name), Some(email)) => Ok(Signature {
                name,
                email,
                timestamp: Timestamp::now(),
            }),
            _ => Err(Error::not_found_with_code(
                "No user name or email configured; set user.name and user.email",
                exit_code::NO_USER,
            )),
        }
    }

    pub fn author_signature(&self) -> Result<Signature> {
        self.signature()
    }

    pub fn committer_signature(&self) -> Result<Signature> {
        self.signature()
    }

    // --- spatial filter ---

    /// The configured spatial filter: inline geometry + CRS, or a pointer to
    /// a committed blob.
    pub fn spatial_filter(&self) -> Result<SpatialFilter> {
        if let (Some(crs), Some(geometry)) = (
            self.get_config(config_keys::SPATIALFILTER_CRS),
            self.get_config(config_keys::SPATIALFILTER_GEOMETRY),
        ) {
            return SpatialFilter::from_spec(&format!("{crs};{geometry}"));
        }
        if let Some(oid) = self.get_config(config_keys::SPATIALFILTER_OBJECTID) {
            let blob_id = crate::backend::BlobId::try_from_hex(&oid).ok_or_else(|| {
                Error::not_found_with_code(
                    format!("No spatial filter object was found in the repository at {oid}"),
                    exit_code::NO_SPATIAL_FILTER,
                )
            })?;
            let bytes = self.store.read_blob(&blob_id).map_err(|_| {
                Error::not_found_with_code(
                    format!("No spatial filter object was found in the repository at {oid}"),
                    exit_code::NO_SPATIAL_FILTER,
                )
            })?;
            return SpatialFilter::from_file_contents(&String::from_utf8_lossy(&bytes));
        }
        Ok(SpatialFilter::match_all())
    }

    // --- working copy ---

    /// The working copy configured for this repository, if any. The instance
    /// is constructed on demand from config.
    pub fn working_copy(&self) -> Result<Option<WorkingCopy>> {
        if self.bare {
            return Ok(None);
        }
        let Some(location) = self.get_config(config_keys::WORKINGCOPY_PATH) else {
            return Ok(None);
        };
        Ok(Some(WorkingCopy::from_location(
            &location,
            &self.workdir,
            &self.repo_dir,
            self.store.clone(),
        )?))
    }

    /// Creates and populates the working copy at HEAD.
    pub fn checkout(&self) -> Result<()> {
        let Some(wc) = self.working_copy()? else {
            return Err(Error::not_found_with_code(
                "Repository has no working copy",
                exit_code::NO_WORKING_COPY,
            ));
        };
        let head = self.structure("HEAD")?;
        let filter = self.spatial_filter()?;
        wc.create_and_initialise()?;
        wc.write_full(&head, &filter)?;
        Ok(())
    }

    /// Applies `diff` on top of HEAD, advances HEAD, and soft-resets the
    /// working copy so the committed rows stop being tracked.
    #[instrument(skip_all)]
    pub fn commit_diff(
        &self,
        diff: &RepoDiff,
        message: &str,
        allow_empty: bool,
    ) -> Result<CommitId> {
        self.ensure_state_is(RepoState::Normal)?;
        let head = self.structure("HEAD")?;
        let commit_id = head.commit_diff(
            "HEAD",
            diff,
            message,
            allow_empty,
            self.author_signature()?,
            self.committer_signature()?,
        )?;
        if let Some(wc) = self.working_copy()? {
            // An unmaterialised working copy has no state to advance.
            if wc.base_tree_id()?.is_some() {
                let new_base = RepositoryStructure::at_commit(&self.store, &commit_id)?;
                wc.soft_reset_after_commit(&new_base, diff)?;
            }
        }
        Ok(commit_id)
    }

    /// Status-style diff: committed base vs live working copy.
    pub fn diff_working_copy(&self) -> Result<RepoDiff> {
        let Some(wc) = self.working_copy()? else {
            return Err(Error::not_found_with_code(
                "Repository has no working copy",
                exit_code::NO_WORKING_COPY,
            ));
        };
        wc.diff_to_tree(&self.spatial_filter()?)
    }

    /// Bounded wrapper for periodic object-database maintenance.
    pub fn gc(&self, keep_newer_than: Duration) -> Result<()> {
        let keep_newer = SystemTime::now()
            .checked_sub(keep_newer_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(self.store.backend().gc(keep_newer)?)
    }
}

fn io_error(err: std::io::Error) -> Error {
    Error::Uncategorized {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_index_bytes() {
        let bytes = locked_index_bytes();
        // 12-byte header, 8-byte extension, 20-byte checksum.
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..4], b"DIRC");
        assert_eq!(&bytes[4..8], &2u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_be_bytes());
        // The required-extension tag must not start with an uppercase
        // letter, so that compliant tools refuse the index.
        assert_eq!(&bytes[12..16], b".rep");
        assert!(!bytes[12].is_ascii_uppercase());
        assert_eq!(&bytes[16..20], &0u32.to_be_bytes());
        let checksum = Sha1::digest(&bytes[..20]);
        assert_eq!(&bytes[20..], checksum.as_slice());
    }

    #[test]
    fn test_init_tidy_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("r");
        let repo = Repository::init(&root, false, None).unwrap();
        assert!(!repo.is_bare());
        assert!(root.join(REPO_DIRNAME).is_dir());
        assert_eq!(
            fs::read_to_string(root.join(GIT_POINTER_FILE)).unwrap(),
            "gitdir: .repo\n"
        );
        assert_eq!(
            fs::read(root.join(REPO_DIRNAME).join(INDEX_FILE)).unwrap(),
            locked_index_bytes()
        );
        assert_eq!(repo.get_config(config_keys::WORKINGCOPY_PATH).unwrap(), "r.gpkg");
        assert_eq!(repo.state(), RepoState::Normal);
    }

    #[test]
    fn test_init_bare_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("bare");
        let repo = Repository::init(&root, true, None).unwrap();
        assert!(repo.is_bare());
        assert!(root.join("refs").is_dir());
        assert!(!root.join(REPO_DIRNAME).exists());
        assert!(repo.working_copy().unwrap().is_none());
    }

    #[test]
    fn test_init_refuses_non_empty_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("r");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("something"), b"x").unwrap();
        assert!(Repository::init(&root, false, None).is_err());
    }

    #[test]
    fn test_merging_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(temp_dir.path().join("r"), false, None).unwrap();
        assert!(repo.ensure_state_is(RepoState::Normal).is_ok());
        repo.begin_merging(&CommitId::from_hex("ab")).unwrap();
        assert_eq!(repo.state(), RepoState::Merging);
        assert!(repo.ensure_state_is(RepoState::Normal).is_err());
        repo.end_merging().unwrap();
        assert_eq!(repo.state(), RepoState::Normal);
    }
}
