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

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;

use pollster::FutureExt as _;

use crate::backend;
use crate::backend::Backend;
use crate::backend::BackendResult;
use crate::backend::BlobId;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::TreeId;
use crate::path::TreePath;
use crate::path::TreePathBuf;
use crate::tree::Tree;

// There are more tree objects than commits, and trees are often shared across
// commits.
const COMMIT_CACHE_CAPACITY: usize = 100;
const TREE_CACHE_CAPACITY: usize = 1000;

/// Wraps the low-level backend and makes it return more convenient types.
/// Also adds caching, and turns the async backend interface into the
/// synchronous one the rest of the crate uses.
pub struct Store {
    backend: Box<dyn Backend>,
    commit_cache: Mutex<HashMap<CommitId, Arc<backend::Commit>>>,
    tree_cache: Mutex<HashMap<(TreePathBuf, TreeId), Arc<backend::Tree>>>,
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Store")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Box<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            commit_cache: Mutex::new(HashMap::new()),
            tree_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Returns backend as the implementation type.
    pub fn backend_impl<T: Backend>(&self) -> Option<&T> {
        self.backend.downcast_ref()
    }

    pub fn empty_tree_id(&self) -> &TreeId {
        self.backend.empty_tree_id()
    }

    pub fn get_commit(&self, id: &CommitId) -> BackendResult<Arc<Commit>> {
        if let Some(commit) = self.commit_cache.lock().unwrap().get(id) {
            return Ok(commit.clone());
        }
        let commit = Arc::new(self.backend.read_commit(id).block_on()?);
        let mut cache = self.commit_cache.lock().unwrap();
        if cache.len() >= COMMIT_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(id.clone(), commit.clone());
        Ok(commit)
    }

    pub fn write_commit(&self, commit: Commit) -> BackendResult<(CommitId, Commit)> {
        let (id, commit) = self.backend.write_commit(commit).block_on()?;
        let mut cache = self.commit_cache.lock().unwrap();
        if cache.len() >= COMMIT_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(id.clone(), Arc::new(commit.clone()));
        Ok((id, commit))
    }

    pub fn get_tree(self: &Arc<Self>, dir: TreePathBuf, id: &TreeId) -> BackendResult<Tree> {
        let data = self.get_backend_tree(&dir, id)?;
        Ok(Tree::new(self.clone(), dir, id.clone(), data))
    }

    pub fn get_root_tree(self: &Arc<Self>, id: &TreeId) -> BackendResult<Tree> {
        self.get_tree(TreePathBuf::root(), id)
    }

    fn get_backend_tree(&self, dir: &TreePath, id: &TreeId) -> BackendResult<Arc<backend::Tree>> {
        let key = (dir.to_owned(), id.clone());
        if let Some(tree) = self.tree_cache.lock().unwrap().get(&key) {
            return Ok(tree.clone());
        }
        let data = Arc::new(self.backend.read_tree(dir, id).block_on()?);
        let mut cache = self.tree_cache.lock().unwrap();
        if cache.len() >= TREE_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(key, data.clone());
        Ok(data)
    }

    pub fn write_tree(
        self: &Arc<Self>,
        dir: &TreePath,
        contents: backend::Tree,
    ) -> BackendResult<Tree> {
        let id = self.backend.write_tree(dir, &contents).block_on()?;
        let data = Arc::new(contents);
        {
            let mut cache = self.tree_cache.lock().unwrap();
            if cache.len() >= TREE_CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert((dir.to_owned(), id.clone()), data.clone());
        }
        Ok(Tree::new(self.clone(), dir.to_owned(), id, data))
    }

    pub fn read_blob(&self, id: &BlobId) -> BackendResult<Vec<u8>> {
        self.backend.read_blob(id).block_on()
    }

    pub fn write_blob(&self, contents: &[u8]) -> BackendResult<BlobId> {
        self.backend.write_blob(contents).block_on()
    }

    pub fn resolve_ref(&self, name: &str) -> BackendResult<Option<CommitId>> {
        self.backend.resolve_ref(name)
    }

    pub fn set_ref(&self, name: &str, target: &CommitId) -> BackendResult<()> {
        self.backend.set_ref(name, target)
    }

    pub fn delete_ref(&self, name: &str) -> BackendResult<()> {
        self.backend.delete_ref(name)
    }
}
