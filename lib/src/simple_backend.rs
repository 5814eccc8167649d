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

//! A plain-file object database. Objects are content-addressed with blake2b
//! and stored one file per object; references are files whose content is a
//! commit id, or `ref: <name>` for symbolic references.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use blake2::Blake2b512;
use digest::Digest as _;
use pollster::FutureExt as _;
use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::backend::Backend;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BlobId;
use crate::backend::BulkImportOptions;
use crate::backend::BulkImportSession;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::MillisSinceEpoch;
use crate::backend::Signature;
use crate::backend::Timestamp;
use crate::backend::Tree;
use crate::backend::TreeId;
use crate::backend::TreeValue;
use crate::object_id::ObjectId;
use crate::path::TreePath;
use crate::path::TreePathBuf;
use crate::path::TreePathComponentBuf;

const OBJECT_ID_LENGTH: usize = 32;

fn map_not_found_err(err: std::io::Error, id: &impl ObjectId) -> BackendError {
    if err.kind() == std::io::ErrorKind::NotFound {
        BackendError::ObjectNotFound {
            object_type: id.object_type(),
            hash: id.hex(),
            source: Box::new(err),
        }
    } else {
        BackendError::ReadObject {
            object_type: id.object_type(),
            hash: id.hex(),
            source: Box::new(err),
        }
    }
}

fn to_other_err(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> BackendError {
    BackendError::Other(err.into())
}

fn hash_object(data: &[u8]) -> Vec<u8> {
    Blake2b512::digest(data)[..OBJECT_ID_LENGTH].to_vec()
}

#[derive(Debug)]
pub struct SimpleBackend {
    path: PathBuf,
    empty_tree_id: TreeId,
}

impl SimpleBackend {
    pub fn name() -> &'static str {
        "Simple"
    }

    pub fn init(store_path: &Path) -> BackendResult<Self> {
        for dir in ["commits", "trees", "blobs", "refs"] {
            fs::create_dir_all(store_path.join(dir)).map_err(to_other_err)?;
        }
        let backend = Self::load(store_path);
        let empty_tree_id = backend
            .write_tree(TreePath::root(), &Tree::default())
            .block_on()?;
        assert_eq!(empty_tree_id, backend.empty_tree_id);
        backend.set_symbolic_ref("HEAD", "refs/heads/main")?;
        Ok(backend)
    }

    pub fn load(store_path: &Path) -> Self {
        let empty_tree_id = TreeId::new(hash_object(&serialize_tree(&Tree::default())));
        Self {
            path: store_path.to_path_buf(),
            empty_tree_id,
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.path
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.path.join("blobs").join(id.hex())
    }

    fn tree_path(&self, id: &TreeId) -> PathBuf {
        self.path.join("trees").join(id.hex())
    }

    fn commit_path(&self, id: &CommitId) -> PathBuf {
        self.path.join("commits").join(id.hex())
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        // "HEAD" lives at the store root; "refs/..." under the refs dir.
        self.path.join(name)
    }

    fn write_object(&self, final_path: &Path, data: &[u8]) -> BackendResult<()> {
        if final_path.exists() {
            return Ok(());
        }
        let temp_file = NamedTempFile::new_in(&self.path).map_err(to_other_err)?;
        temp_file.as_file().write_all(data).map_err(to_other_err)?;
        // Straight rename: the content hash makes concurrent writes of the
        // same object identical.
        temp_file.persist(final_path).map_err(to_other_err)?;
        Ok(())
    }

    pub fn set_symbolic_ref(&self, name: &str, target: &str) -> BackendResult<()> {
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(to_other_err)?;
        }
        fs::write(path, format!("ref: {target}\n")).map_err(to_other_err)?;
        Ok(())
    }

    /// Reads a ref file; returns the symbolic target or the commit id text.
    fn read_ref_file(&self, name: &str) -> BackendResult<Option<String>> {
        match fs::read_to_string(self.ref_path(name)) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::ReadRef {
                name: name.to_string(),
                source: Box::new(err),
            }),
        }
    }

    /// Follows symbolic refs until a direct ref name is found. Returns the
    /// final ref name, whether or not it exists yet.
    fn resolve_ref_name(&self, name: &str) -> BackendResult<String> {
        let mut name = name.to_string();
        for _ in 0..10 {
            match self.read_ref_file(&name)? {
                Some(content) if content.starts_with("ref: ") => {
                    name = content["ref: ".len()..].to_string();
                }
                _ => return Ok(name),
            }
        }
        Err(BackendError::ReadRef {
            name,
            source: "too many levels of symbolic references".into(),
        })
    }

    fn write_tree_sync(&self, tree: &Tree) -> BackendResult<TreeId> {
        let data = serialize_tree(tree);
        let id = TreeId::new(hash_object(&data));
        self.write_object(&self.tree_path(&id), &data)?;
        Ok(id)
    }

    fn read_tree_sync(&self, id: &TreeId) -> BackendResult<Tree> {
        let buf = fs::read(self.tree_path(id)).map_err(|err| map_not_found_err(err, id))?;
        deserialize_tree(&buf)
    }
}

#[async_trait]
impl Backend for SimpleBackend {
    fn name(&self) -> &str {
        Self::name()
    }

    fn empty_tree_id(&self) -> &TreeId {
        &self.empty_tree_id
    }

    async fn read_blob(&self, id: &BlobId) -> BackendResult<Vec<u8>> {
        fs::read(self.blob_path(id)).map_err(|err| map_not_found_err(err, id))
    }

    async fn write_blob(&self, contents: &[u8]) -> BackendResult<BlobId> {
        let id = BlobId::new(hash_object(contents));
        self.write_object(&self.blob_path(&id), contents)?;
        Ok(id)
    }

    async fn read_tree(&self, _path: &TreePath, id: &TreeId) -> BackendResult<Tree> {
        self.read_tree_sync(id)
    }

    async fn write_tree(&self, _path: &TreePath, tree: &Tree) -> BackendResult<TreeId> {
        self.write_tree_sync(tree)
    }

    async fn read_commit(&self, id: &CommitId) -> BackendResult<Commit> {
        let buf = fs::read(self.commit_path(id)).map_err(|err| map_not_found_err(err, id))?;
        deserialize_commit(&buf)
    }

    async fn write_commit(&self, commit: Commit) -> BackendResult<(CommitId, Commit)> {
        let data = serialize_commit(&commit);
        let id = CommitId::new(hash_object(&data));
        self.write_object(&self.commit_path(&id), &data)?;
        Ok((id, commit))
    }

    fn resolve_ref(&self, name: &str) -> BackendResult<Option<CommitId>> {
        let direct = self.resolve_ref_name(name)?;
        match self.read_ref_file(&direct)? {
            None => Ok(None),
            Some(content) => {
                let id = CommitId::try_from_hex(&content).ok_or_else(|| BackendError::ReadRef {
                    name: direct,
                    source: format!("invalid ref content {content:?}").into(),
                })?;
                Ok(Some(id))
            }
        }
    }

    fn set_ref(&self, name: &str, target: &CommitId) -> BackendResult<()> {
        let direct = self.resolve_ref_name(name)?;
        let path = self.ref_path(&direct);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(to_other_err)?;
        }
        fs::write(path, format!("{}\n", target.hex())).map_err(to_other_err)?;
        Ok(())
    }

    fn delete_ref(&self, name: &str) -> BackendResult<()> {
        match fs::remove_file(self.ref_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(to_other_err(err)),
        }
    }

    fn list_refs(&self, prefix: &str) -> BackendResult<Vec<(String, CommitId)>> {
        let mut result = Vec::new();
        let root = self.path.join("refs");
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(to_other_err(err)),
            };
            for entry in entries {
                let entry = entry.map_err(to_other_err)?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(&self.path).unwrap();
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !name.starts_with(prefix) {
                        continue;
                    }
                    if let Some(id) = self.resolve_ref(&name)? {
                        result.push((name, id));
                    }
                }
            }
        }
        result.sort();
        Ok(result)
    }

    fn start_bulk_import(
        &self,
        options: BulkImportOptions,
    ) -> BackendResult<Box<dyn BulkImportSession + '_>> {
        Ok(Box::new(SimpleImportSession {
            backend: self,
            options,
            overrides: BTreeMap::new(),
        }))
    }

    fn gc(&self, _keep_newer: SystemTime) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Override {
    Tombstone,
    Replace(TreeValue),
}

/// In-process bulk-import session: accumulates path overrides and flushes
/// them as trees bottom-up on `finish`.
struct SimpleImportSession<'a> {
    backend: &'a SimpleBackend,
    options: BulkImportOptions,
    overrides: BTreeMap<TreePathBuf, Override>,
}

impl BulkImportSession for SimpleImportSession<'_> {
    fn write_inline_blob(&mut self, path: &TreePath, data: &[u8]) -> BackendResult<()> {
        let id = self.backend.write_blob(data).block_on()?;
        self.overrides
            .insert(path.to_owned(), Override::Replace(TreeValue::Blob(id)));
        Ok(())
    }

    fn copy_blob(&mut self, path: &TreePath, id: &BlobId) -> BackendResult<()> {
        self.overrides.insert(
            path.to_owned(),
            Override::Replace(TreeValue::Blob(id.clone())),
        );
        Ok(())
    }

    fn delete_path(&mut self, path: &TreePath) -> BackendResult<()> {
        // Drop any pending writes below the deleted path.
        let dir_prefix = path.to_internal_dir_string();
        self.overrides.retain(|p, _| {
            !p.as_internal_file_string().starts_with(&dir_prefix) && p.as_ref() != path
        });
        self.overrides.insert(path.to_owned(), Override::Tombstone);
        Ok(())
    }

    fn finish(self: Box<Self>) -> BackendResult<CommitId> {
        let backend = self.backend;
        let base_tree_id = match &self.options.from {
            Some(commit_id) => backend.read_commit(commit_id).block_on()?.root_tree,
            None => backend.empty_tree_id.clone(),
        };

        // Materialise the trees on the path from the root to every override.
        // A directory at or below a deleted path starts fresh: writes after a
        // delete must not see the old contents.
        let tombstoned: Vec<TreePathBuf> = self
            .overrides
            .iter()
            .filter(|(_, o)| matches!(o, Override::Tombstone))
            .map(|(path, _)| path.clone())
            .collect();
        let starts_fresh =
            |dir: &TreePath| tombstoned.iter().any(|t| dir.starts_with(t));
        let mut trees: BTreeMap<TreePathBuf, BTreeMap<TreePathComponentBuf, TreeValue>> =
            BTreeMap::new();
        let root_tree = backend.read_tree_sync(&base_tree_id)?;
        trees.insert(
            TreePathBuf::root(),
            root_tree
                .entries()
                .map(|e| (e.name().to_owned(), e.value().clone()))
                .collect(),
        );
        for path in self.overrides.keys() {
            let mut dir = TreePathBuf::root();
            for component in path.parent().unwrap().components() {
                let child_dir = dir.join(component);
                let subtree = if starts_fresh(&child_dir) {
                    Tree::default()
                } else {
                    let parent_entries = trees.get(dir.as_ref() as &TreePath).unwrap();
                    match parent_entries.get(component) {
                        Some(TreeValue::Tree(id)) => backend.read_tree_sync(id)?,
                        _ => Tree::default(),
                    }
                };
                trees.entry(child_dir.clone()).or_insert_with(|| {
                    subtree
                        .entries()
                        .map(|e| (e.name().to_owned(), e.value().clone()))
                        .collect()
                });
                dir = child_dir;
            }
        }

        for (path, file_override) in &self.overrides {
            let (dir, basename) = path.split().unwrap();
            let entries = trees.get_mut(dir).unwrap();
            match file_override {
                Override::Replace(value) => {
                    entries.insert(basename.to_owned(), value.clone());
                }
                Override::Tombstone => {
                    entries.remove(basename);
                }
            }
        }

        // Write trees in reverse lexicographical order, starting with trees
        // without children.
        let root_tree_id = loop {
            let (dir, entries) = trees.pop_last().unwrap();
            match dir.split() {
                Some((parent, basename)) => {
                    let parent_entries = trees.get_mut(parent).unwrap();
                    if entries.is_empty() {
                        if let Some(TreeValue::Tree(_)) = parent_entries.get(basename) {
                            parent_entries.remove(basename);
                        }
                    } else {
                        let tree = Tree::from_sorted_entries(entries.into_iter().collect());
                        let id = backend.write_tree_sync(&tree)?;
                        parent_entries.insert(basename.to_owned(), TreeValue::Tree(id));
                    }
                }
                None => {
                    assert!(trees.is_empty());
                    let tree = Tree::from_sorted_entries(entries.into_iter().collect());
                    break backend.write_tree_sync(&tree)?;
                }
            }
        };

        let commit = Commit {
            parents: self.options.from.iter().cloned().collect(),
            root_tree: root_tree_id,
            author: self.options.author.clone(),
            committer: self.options.committer.clone(),
            message: self.options.message.clone(),
        };
        let (commit_id, _) = backend.write_commit(commit).block_on()?;
        backend.set_ref(&self.options.ref_name, &commit_id)?;
        Ok(commit_id)
    }
}

#[derive(Serialize, Deserialize)]
struct TreeEntryRepr(String, String, String);

fn serialize_tree(tree: &Tree) -> Vec<u8> {
    let entries: Vec<TreeEntryRepr> = tree
        .entries()
        .map(|entry| {
            let (kind, hash) = match entry.value() {
                TreeValue::Blob(id) => ("blob", id.hex()),
                TreeValue::Tree(id) => ("tree", id.hex()),
            };
            TreeEntryRepr(
                entry.name().as_internal_str().to_owned(),
                kind.to_owned(),
                hash,
            )
        })
        .collect();
    serde_json::to_vec(&entries).unwrap()
}

fn deserialize_tree(buf: &[u8]) -> BackendResult<Tree> {
    let entries: Vec<TreeEntryRepr> = serde_json::from_slice(buf).map_err(to_other_err)?;
    let entries = entries
        .into_iter()
        .map(|TreeEntryRepr(name, kind, hash)| {
            let value = match kind.as_str() {
                "blob" => TreeValue::Blob(
                    BlobId::try_from_hex(&hash).ok_or_else(|| to_other_err("bad blob id"))?,
                ),
                "tree" => TreeValue::Tree(
                    TreeId::try_from_hex(&hash).ok_or_else(|| to_other_err("bad tree id"))?,
                ),
                other => return Err(to_other_err(format!("bad tree entry kind {other:?}"))),
            };
            let name = TreePathComponentBuf::new(name).map_err(to_other_err)?;
            Ok((name, value))
        })
        .collect::<BackendResult<Vec<_>>>()?;
    Ok(Tree::from_sorted_entries(entries))
}

#[derive(Serialize, Deserialize)]
struct SignatureRepr {
    name: String,
    email: String,
    millis_since_epoch: i64,
    tz_offset: i32,
}

#[derive(Serialize, Deserialize)]
struct CommitRepr {
    parents: Vec<String>,
    tree: String,
    author: SignatureRepr,
    committer: SignatureRepr,
    message: String,
}

fn signature_repr(signature: &Signature) -> SignatureRepr {
    SignatureRepr {
        name: signature.name.clone(),
        email: signature.email.clone(),
        millis_since_epoch: signature.timestamp.timestamp.0,
        tz_offset: signature.timestamp.tz_offset,
    }
}

fn signature_from_repr(repr: SignatureRepr) -> Signature {
    Signature {
        name: repr.name,
        email: repr.email,
        timestamp: Timestamp {
            timestamp: MillisSinceEpoch(repr.millis_since_epoch),
            tz_offset: repr.tz_offset,
        },
    }
}

fn serialize_commit(commit: &Commit) -> Vec<u8> {
    let repr = CommitRepr {
        parents: commit.parents.iter().map(|id| id.hex()).collect(),
        tree: commit.root_tree.hex(),
        author: signature_repr(&commit.author),
        committer: signature_repr(&commit.committer),
        message: commit.message.clone(),
    };
    serde_json::to_vec(&repr).unwrap()
}

fn deserialize_commit(buf: &[u8]) -> BackendResult<Commit> {
    let repr: CommitRepr = serde_json::from_slice(buf).map_err(to_other_err)?;
    let parents = repr
        .parents
        .iter()
        .map(|hash| CommitId::try_from_hex(hash).ok_or_else(|| to_other_err("bad commit id")))
        .collect::<BackendResult<Vec<_>>>()?;
    let root_tree =
        TreeId::try_from_hex(&repr.tree).ok_or_else(|| to_other_err("bad tree id"))?;
    Ok(Commit {
        parents,
        root_tree,
        author: signature_from_repr(repr.author),
        committer: signature_from_repr(repr.committer),
        message: repr.message,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn create_signature() -> Signature {
        Signature {
            name: "Someone".to_string(),
            email: "someone@example.com".to_string(),
            timestamp: Timestamp {
                timestamp: MillisSinceEpoch(0),
                tz_offset: 0,
            },
        }
    }

    #[test]
    fn test_write_read_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SimpleBackend::init(temp_dir.path()).unwrap();
        let commit = Commit {
            parents: vec![],
            root_tree: backend.empty_tree_id().clone(),
            author: create_signature(),
            committer: create_signature(),
            message: "initial".to_string(),
        };
        let (id, _) = backend.write_commit(commit.clone()).block_on().unwrap();
        let read = backend.read_commit(&id).block_on().unwrap();
        assert_eq!(read, commit);
    }

    #[test]
    fn test_blob_content_addressing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SimpleBackend::init(temp_dir.path()).unwrap();
        let a = backend.write_blob(b"hello").block_on().unwrap();
        let b = backend.write_blob(b"hello").block_on().unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.read_blob(&a).block_on().unwrap(), b"hello");
    }

    #[test]
    fn test_missing_object() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SimpleBackend::init(temp_dir.path()).unwrap();
        let id = BlobId::from_hex("00ff00ff");
        assert_matches!(
            backend.read_blob(&id).block_on(),
            Err(BackendError::ObjectNotFound { .. })
        );
    }

    #[test]
    fn test_symbolic_head() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SimpleBackend::init(temp_dir.path()).unwrap();
        assert_eq!(backend.resolve_ref("HEAD").unwrap(), None);

        let commit = Commit {
            parents: vec![],
            root_tree: backend.empty_tree_id().clone(),
            author: create_signature(),
            committer: create_signature(),
            message: String::new(),
        };
        let (id, _) = backend.write_commit(commit).block_on().unwrap();
        // Writing through HEAD moves the branch it points at.
        backend.set_ref("HEAD", &id).unwrap();
        assert_eq!(backend.resolve_ref("HEAD").unwrap(), Some(id.clone()));
        assert_eq!(
            backend.resolve_ref("refs/heads/main").unwrap(),
            Some(id.clone())
        );
        assert_eq!(
            backend.list_refs("refs/heads/").unwrap(),
            vec![("refs/heads/main".to_string(), id)]
        );
    }

    #[test]
    fn test_bulk_import_session() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SimpleBackend::init(temp_dir.path()).unwrap();
        let options = BulkImportOptions {
            ref_name: "refs/import/test".to_string(),
            from: None,
            author: create_signature(),
            committer: create_signature(),
            message: "import".to_string(),
        };
        let mut session = backend.start_bulk_import(options).unwrap();
        session
            .write_inline_blob(
                TreePath::from_internal_string("ds/meta/title").unwrap(),
                b"Title",
            )
            .unwrap();
        session
            .write_inline_blob(
                TreePath::from_internal_string("ds/feature/aa/x").unwrap(),
                b"feature-x",
            )
            .unwrap();
        let commit_id = session.finish().unwrap();

        assert_eq!(
            backend.resolve_ref("refs/import/test").unwrap(),
            Some(commit_id.clone())
        );
        let commit = backend.read_commit(&commit_id).block_on().unwrap();
        let root = backend
            .read_tree(TreePath::root(), &commit.root_tree)
            .block_on()
            .unwrap();
        let names: Vec<_> = root
            .names()
            .map(|n| n.as_internal_str().to_string())
            .collect();
        assert_eq!(names, vec!["ds"]);
    }
}
