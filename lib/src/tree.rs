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

use std::fmt::Debug;
use std::fmt::Error;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use itertools::Itertools as _;

use crate::backend;
use crate::backend::BackendResult;
use crate::backend::BlobId;
use crate::backend::TreeEntriesNonRecursiveIterator;
use crate::backend::TreeId;
use crate::backend::TreeValue;
use crate::path::TreePath;
use crate::path::TreePathBuf;
use crate::path::TreePathComponent;
use crate::store::Store;

#[derive(Clone)]
pub struct Tree {
    store: Arc<Store>,
    dir: TreePathBuf,
    id: TreeId,
    data: Arc<backend::Tree>,
}

impl Debug for Tree {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Tree")
            .field("dir", &self.dir)
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.dir == other.dir
    }
}

impl Eq for Tree {}

impl Hash for Tree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dir.hash(state);
        self.id.hash(state);
    }
}

impl Tree {
    pub fn new(store: Arc<Store>, dir: TreePathBuf, id: TreeId, data: Arc<backend::Tree>) -> Self {
        Self {
            store,
            dir,
            id,
            data,
        }
    }

    pub fn empty(store: Arc<Store>, dir: TreePathBuf) -> Self {
        let id = store.empty_tree_id().clone();
        Self {
            store,
            dir,
            id,
            data: Arc::new(backend::Tree::default()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn dir(&self) -> &TreePath {
        &self.dir
    }

    pub fn id(&self) -> &TreeId {
        &self.id
    }

    pub fn data(&self) -> &backend::Tree {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn entries_non_recursive(&self) -> TreeEntriesNonRecursiveIterator<'_> {
        self.data.entries()
    }

    /// All blobs below this tree, depth-first, as `(path, blob id)`.
    pub fn entries_recursive(&self) -> TreeEntriesIterator {
        TreeEntriesIterator::new(self.clone())
    }

    pub fn value(&self, basename: &TreePathComponent) -> Option<&TreeValue> {
        self.data.value(basename)
    }

    pub fn path_value(&self, path: &TreePath) -> BackendResult<Option<TreeValue>> {
        assert_eq!(self.dir(), TreePath::root());
        self.path_value_relative(path)
    }

    /// Like [`Tree::path_value`], but `path` is relative to this tree rather
    /// than to the repository root.
    pub fn path_value_relative(&self, path: &TreePath) -> BackendResult<Option<TreeValue>> {
        match path.split() {
            Some((dir, basename)) => {
                let tree = self.sub_tree_recursive(dir)?;
                Ok(tree.and_then(|tree| tree.data.value(basename).cloned()))
            }
            None => Ok(Some(TreeValue::Tree(self.id.clone()))),
        }
    }

    pub fn sub_tree(&self, name: &TreePathComponent) -> BackendResult<Option<Self>> {
        if let Some(sub_tree) = self.data.value(name) {
            match sub_tree {
                TreeValue::Tree(sub_tree_id) => {
                    let subdir = self.dir.join(name);
                    let sub_tree = self.store.get_tree(subdir, sub_tree_id)?;
                    Ok(Some(sub_tree))
                }
                _ => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    fn known_sub_tree(&self, subdir: TreePathBuf, id: &TreeId) -> BackendResult<Self> {
        self.store.get_tree(subdir, id)
    }

    /// Look up the tree at the given path.
    pub fn sub_tree_recursive(&self, path: &TreePath) -> BackendResult<Option<Self>> {
        let mut current_tree = self.clone();
        for name in path.components() {
            match current_tree.sub_tree(name)? {
                None => {
                    return Ok(None);
                }
                Some(sub_tree) => {
                    current_tree = sub_tree;
                }
            }
        }
        Ok(Some(current_tree))
    }
}

pub struct TreeEntriesIterator {
    stack: Vec<TreeEntriesDirItem>,
}

struct TreeEntriesDirItem {
    tree: Tree,
    entries: Vec<(TreePathBuf, TreeValue)>,
}

impl From<Tree> for TreeEntriesDirItem {
    fn from(tree: Tree) -> Self {
        let mut entries = tree
            .entries_non_recursive()
            .map(|entry| (tree.dir().join(entry.name()), entry.value().clone()))
            .collect_vec();
        entries.reverse();
        Self { tree, entries }
    }
}

impl TreeEntriesIterator {
    fn new(tree: Tree) -> Self {
        Self {
            stack: vec![TreeEntriesDirItem::from(tree)],
        }
    }
}

impl Iterator for TreeEntriesIterator {
    type Item = BackendResult<(TreePathBuf, BlobId)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(top) = self.stack.last_mut() {
            if let Some((path, value)) = top.entries.pop() {
                match value {
                    TreeValue::Tree(id) => match top.tree.known_sub_tree(path, &id) {
                        Ok(subtree) => self.stack.push(TreeEntriesDirItem::from(subtree)),
                        Err(err) => return Some(Err(err)),
                    },
                    TreeValue::Blob(id) => return Some(Ok((path, id))),
                };
            } else {
                self.stack.pop();
            }
        }
        None
    }
}

/// A blob-level difference between two trees: the path, the blob on the old
/// side (if any) and the blob on the new side (if any). A path changing kind
/// between blob and subtree reports the blob half only on the side where it
/// is a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeDiffEntry {
    pub path: TreePathBuf,
    pub old: Option<BlobId>,
    pub new: Option<BlobId>,
}

/// Walks two trees in lockstep, collecting every blob-level difference.
/// Subtrees with equal ids are skipped without descending, so the cost is
/// proportional to the difference, not to the tree size.
pub fn diff_trees(old: Option<&Tree>, new: Option<&Tree>) -> BackendResult<Vec<TreeDiffEntry>> {
    let mut result = Vec::new();
    diff_trees_into(old, new, &mut result)?;
    Ok(result)
}

fn diff_trees_into(
    old: Option<&Tree>,
    new: Option<&Tree>,
    result: &mut Vec<TreeDiffEntry>,
) -> BackendResult<()> {
    if let (Some(old), Some(new)) = (old, new) {
        if old.id() == new.id() {
            return Ok(());
        }
    }
    let empty = backend::Tree::default();
    let old_data = old.map_or(&empty, |t| t.data());
    let new_data = new.map_or(&empty, |t| t.data());
    let names = old_data
        .names()
        .merge(new_data.names())
        .dedup()
        .map(|name| name.to_owned())
        .collect_vec();
    for name in names {
        let old_value = old_data.value(&name);
        let new_value = new_data.value(&name);
        if old_value == new_value {
            continue;
        }
        let dir = old.or(new).unwrap().dir();
        let path = dir.join(&name);
        let mut old_blob = None;
        let mut new_blob = None;
        let mut old_subtree = None;
        let mut new_subtree = None;
        match old_value {
            Some(TreeValue::Blob(id)) => old_blob = Some(id.clone()),
            Some(TreeValue::Tree(id)) => {
                old_subtree = Some(old.unwrap().known_sub_tree(path.clone(), id)?);
            }
            None => {}
        }
        match new_value {
            Some(TreeValue::Blob(id)) => new_blob = Some(id.clone()),
            Some(TreeValue::Tree(id)) => {
                new_subtree = Some(new.unwrap().known_sub_tree(path.clone(), id)?);
            }
            None => {}
        }
        if old_subtree.is_some() || new_subtree.is_some() {
            if let Some(id) = old_blob.take() {
                result.push(TreeDiffEntry {
                    path: path.clone(),
                    old: Some(id),
                    new: None,
                });
            }
            if let Some(id) = new_blob.take() {
                result.push(TreeDiffEntry {
                    path: path.clone(),
                    old: None,
                    new: Some(id),
                });
            }
            diff_trees_into(old_subtree.as_ref(), new_subtree.as_ref(), result)?;
        } else {
            result.push(TreeDiffEntry {
                path,
                old: old_blob,
                new: new_blob,
            });
        }
    }
    Ok(())
}
