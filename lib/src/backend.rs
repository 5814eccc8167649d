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

use std::any::Any;
use std::fmt::Debug;
use std::slice;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::TimeZone as _;
use thiserror::Error;

use crate::object_id::ObjectId as _;
use crate::object_id::id_type;
use crate::path::TreePath;
use crate::path::TreePathComponent;
use crate::path::TreePathComponentBuf;

id_type!(
    /// Identifier for a [`Commit`] based on its content.
    pub CommitId
);
id_type!(pub TreeId);
id_type!(pub BlobId);

#[derive(Debug, Error)]
#[error("Out-of-range date")]
pub struct TimestampOutOfRange;

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }

    pub fn to_datetime(
        &self,
    ) -> Result<chrono::DateTime<chrono::FixedOffset>, TimestampOutOfRange> {
        let utc = match chrono::Utc.timestamp_opt(
            self.timestamp.0.div_euclid(1000),
            (self.timestamp.0.rem_euclid(1000)) as u32 * 1000000,
        ) {
            chrono::LocalResult::None => {
                return Err(TimestampOutOfRange);
            }
            chrono::LocalResult::Single(x) => x,
            chrono::LocalResult::Ambiguous(y, _z) => y,
        };

        Ok(utc.with_timezone(
            &chrono::FixedOffset::east_opt(self.tz_offset * 60)
                .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap()),
        ))
    }
}

/// Represents a [`Commit`] signature.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Commit {
    pub parents: Vec<CommitId>,
    pub root_tree: TreeId,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

/// Error that may occur during backend initialization.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct BackendInitError(pub Box<dyn std::error::Error + Send + Sync>);

/// Object-database error that may occur after the backend is loaded.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(
        "Invalid hash length for object of type {object_type} (expected {expected} bytes, got \
         {actual} bytes): {hash}"
    )]
    InvalidHashLength {
        expected: usize,
        actual: usize,
        object_type: String,
        hash: String,
    },
    #[error("Object {hash} of type {object_type} not found")]
    ObjectNotFound {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when reading object {hash} of type {object_type}")]
    ReadObject {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Could not write object of type {object_type}")]
    WriteObject {
        object_type: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Reference {name} not found")]
    RefNotFound { name: String },
    #[error("Error accessing reference {name}")]
    ReadRef {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Bulk-import pipe to the object database closed early")]
    BrokenImportPipe {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Bulk-import helper exited with status {status}")]
    ImportHelperFailed { status: i32 },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
    /// A valid operation attempted, but failed because it isn't supported by
    /// the particular backend.
    #[error("{0}")]
    Unsupported(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum TreeValue {
    Blob(BlobId),
    Tree(TreeId),
}

impl TreeValue {
    pub fn hex(&self) -> String {
        match self {
            Self::Blob(id) => id.hex(),
            Self::Tree(id) => id.hex(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TreeEntry<'a> {
    name: &'a TreePathComponent,
    value: &'a TreeValue,
}

impl<'a> TreeEntry<'a> {
    pub fn new(name: &'a TreePathComponent, value: &'a TreeValue) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &'a TreePathComponent {
        self.name
    }

    pub fn value(&self) -> &'a TreeValue {
        self.value
    }
}

pub struct TreeEntriesNonRecursiveIterator<'a> {
    iter: slice::Iter<'a, (TreePathComponentBuf, TreeValue)>,
}

impl<'a> Iterator for TreeEntriesNonRecursiveIterator<'a> {
    type Item = TreeEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter
            .next()
            .map(|(name, value)| TreeEntry { name, value })
    }
}

#[derive(Default, PartialEq, Eq, Debug, Clone)]
pub struct Tree {
    entries: Vec<(TreePathComponentBuf, TreeValue)>,
}

impl Tree {
    pub fn from_sorted_entries(entries: Vec<(TreePathComponentBuf, TreeValue)>) -> Self {
        debug_assert!(entries.is_sorted_by(|(a, _), (b, _)| a < b));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &TreePathComponent> {
        self.entries.iter().map(|(name, _)| name.as_ref())
    }

    pub fn entries(&self) -> TreeEntriesNonRecursiveIterator<'_> {
        TreeEntriesNonRecursiveIterator {
            iter: self.entries.iter(),
        }
    }

    pub fn entry(&self, name: &TreePathComponent) -> Option<TreeEntry<'_>> {
        let index = self
            .entries
            .binary_search_by_key(&name, |(name, _)| name)
            .ok()?;
        let (name, value) = &self.entries[index];
        Some(TreeEntry { name, value })
    }

    pub fn value(&self, name: &TreePathComponent) -> Option<&TreeValue> {
        self.entry(name).map(|entry| entry.value)
    }
}

/// Commit details used when a bulk-import session writes its commit.
#[derive(Debug, Clone)]
pub struct BulkImportOptions {
    /// Temporary ref the session's commit is written to.
    pub ref_name: String,
    /// Parent commit, or None to start from an empty tree.
    pub from: Option<CommitId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

/// A streaming path→blob writer used by the fast-importer. One session per
/// worker; sessions for the same import never receive paths under the same
/// feature subtree, so they cannot conflict.
pub trait BulkImportSession: Send {
    /// Writes `data` as a blob at `path` in the session's pending tree.
    fn write_inline_blob(&mut self, path: &TreePath, data: &[u8]) -> BackendResult<()>;

    /// Records an already-stored blob at `path` (deduplicated import).
    fn copy_blob(&mut self, path: &TreePath, id: &BlobId) -> BackendResult<()>;

    /// Deletes `path` (blob or whole subtree) from the session's pending tree.
    fn delete_path(&mut self, path: &TreePath) -> BackendResult<()>;

    /// Finalises the session: writes the pending tree and its commit to the
    /// session's temporary ref, returning the commit id.
    fn finish(self: Box<Self>) -> BackendResult<CommitId>;
}

/// Defines the interface to the content-addressed object database. The core
/// never reimplements object storage; everything goes through this trait.
#[async_trait]
pub trait Backend: Any + Send + Sync + Debug {
    /// A unique name that identifies this backend.
    fn name(&self) -> &str;

    fn empty_tree_id(&self) -> &TreeId;

    async fn read_blob(&self, id: &BlobId) -> BackendResult<Vec<u8>>;

    async fn write_blob(&self, contents: &[u8]) -> BackendResult<BlobId>;

    async fn read_tree(&self, path: &TreePath, id: &TreeId) -> BackendResult<Tree>;

    async fn write_tree(&self, path: &TreePath, contents: &Tree) -> BackendResult<TreeId>;

    async fn read_commit(&self, id: &CommitId) -> BackendResult<Commit>;

    /// Writes a commit and returns its ID and the commit itself. The commit
    /// should contain the data that was actually written, which may differ
    /// from the data passed in (e.g. reduced timestamp precision).
    async fn write_commit(&self, contents: Commit) -> BackendResult<(CommitId, Commit)>;

    /// Resolves a reference name to a commit, following symbolic references.
    /// Returns None if the reference does not exist.
    fn resolve_ref(&self, name: &str) -> BackendResult<Option<CommitId>>;

    fn set_ref(&self, name: &str, target: &CommitId) -> BackendResult<()>;

    fn delete_ref(&self, name: &str) -> BackendResult<()>;

    /// Lists references whose name starts with `prefix`.
    fn list_refs(&self, prefix: &str) -> BackendResult<Vec<(String, CommitId)>>;

    /// Opens a bulk-insert session. A backend with an external bulk-insert
    /// helper spawns it here; the default writes through the ordinary object
    /// interface in-process.
    fn start_bulk_import(
        &self,
        options: BulkImportOptions,
    ) -> BackendResult<Box<dyn BulkImportSession + '_>>;

    /// Perform garbage collection. Objects reachable from a reference, and
    /// objects created after `keep_newer`, are preserved.
    fn gc(&self, keep_newer: SystemTime) -> BackendResult<()>;
}

impl dyn Backend {
    /// Returns reference of the implementation type.
    pub fn downcast_ref<T: Backend>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref()
    }
}
