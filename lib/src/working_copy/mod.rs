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
//! Working copies: live, editable projections of one commit.
//!
//! Every backend carries the same two bookkeeping tables (see
//! [`table_defs`]) and the same state machine:
//!
//! ```text
//! uninitialised --create_and_initialise--> empty
//! empty --write_full(T)--> clean@T
//! clean@T --user edits--> dirty@T
//! dirty@T --commit + soft_reset_after_commit(C)--> clean@C
//! clean@T --reset(T', discard)--> clean@T'
//! clean@T --reset(T', keep) [no conflicts]--> dirty@T' (edits carried)
//! dirty@T --reset(T', keep) [conflicts]--> error; state unchanged
//! ```

pub mod base;
pub mod gpkg;
pub mod mysql;
pub mod postgres;
pub mod sql_session;
pub mod sqlserver;
pub mod table_defs;
pub mod tile_directory;

use std::path::Path;
use std::sync::Arc;

use crate::backend::TreeId;
use crate::diff::RepoDiff;
use crate::error::Result;
use crate::spatial_filter::SpatialFilter;
use crate::store::Store;
use crate::structure::RepositoryStructure;
use crate::working_copy::gpkg::GpkgWorkingCopy;
use crate::working_copy::mysql::MySqlWorkingCopy;
use crate::working_copy::postgres::PostgresWorkingCopy;
use crate::working_copy::sqlserver::SqlServerWorkingCopy;
use crate::working_copy::tile_directory::TileDirectoryWorkingCopy;

/// The working-copy backends, as a tagged variant. Capability differences
/// (approximated types, trigger SQL) live in each variant's adapter.
pub enum WorkingCopy {
    Gpkg(GpkgWorkingCopy),
    Postgres(PostgresWorkingCopy),
    MySql(MySqlWorkingCopy),
    SqlServer(SqlServerWorkingCopy),
    TileDirectory(TileDirectoryWorkingCopy),
}

impl WorkingCopy {
    /// Chooses the backend from a configured location string: a database URL
    /// for the server backends, a `*.gpkg` path for GeoPackage, any other
    /// path for a tile directory.
    pub fn from_location(
        location: &str,
        workdir: &Path,
        repo_dir: &Path,
        store: Arc<Store>,
    ) -> Result<Self> {
        if location.starts_with("postgresql://") {
            return Ok(Self::Postgres(postgres::new_postgres_working_copy(
                location, store,
            )?));
        }
        if location.starts_with("mysql://") {
            return Ok(Self::MySql(mysql::new_mysql_working_copy(location, store)?));
        }
        if location.starts_with("mssql://") {
            return Ok(Self::SqlServer(sqlserver::new_sqlserver_working_copy(
                location, store,
            )?));
        }
        if location.ends_with(".gpkg") {
            let path = workdir.join(location);
            return Ok(Self::Gpkg(gpkg::new_gpkg_working_copy(path, store)));
        }
        Ok(Self::TileDirectory(TileDirectoryWorkingCopy::new(
            store,
            workdir.join(location),
            repo_dir,
        )))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Gpkg(_) => "GPKG",
            Self::Postgres(_) => "PostgreSQL",
            Self::MySql(_) => "MySQL",
            Self::SqlServer(_) => "SQL Server",
            Self::TileDirectory(_) => "TileDirectory",
        }
    }

    pub fn create_and_initialise(&self) -> Result<()> {
        match self {
            Self::Gpkg(wc) => wc.create_and_initialise(),
            Self::Postgres(wc) => wc.create_and_initialise(),
            Self::MySql(wc) => wc.create_and_initialise(),
            Self::SqlServer(wc) => wc.create_and_initialise(),
            Self::TileDirectory(wc) => wc.create_and_initialise(),
        }
    }

    pub fn write_full(
        &self,
        target: &RepositoryStructure,
        filter: &SpatialFilter,
    ) -> Result<()> {
        match self {
            Self::Gpkg(wc) => wc.write_full(target, filter),
            Self::Postgres(wc) => wc.write_full(target, filter),
            Self::MySql(wc) => wc.write_full(target, filter),
            Self::SqlServer(wc) => wc.write_full(target, filter),
            Self::TileDirectory(wc) => wc.write_full(target, filter),
        }
    }

    pub fn reset(
        &self,
        target: &RepositoryStructure,
        discard_changes: bool,
        filter: &SpatialFilter,
    ) -> Result<()> {
        match self {
            Self::Gpkg(wc) => wc.reset(target, discard_changes, filter),
            Self::Postgres(wc) => wc.reset(target, discard_changes, filter),
            Self::MySql(wc) => wc.reset(target, discard_changes, filter),
            Self::SqlServer(wc) => wc.reset(target, discard_changes, filter),
            Self::TileDirectory(wc) => wc.reset(target, discard_changes, filter),
        }
    }

    pub fn diff_to_tree(&self, filter: &SpatialFilter) -> Result<RepoDiff> {
        match self {
            Self::Gpkg(wc) => wc.diff_to_tree(filter),
            Self::Postgres(wc) => wc.diff_to_tree(filter),
            Self::MySql(wc) => wc.diff_to_tree(filter),
            Self::SqlServer(wc) => wc.diff_to_tree(filter),
            Self::TileDirectory(wc) => wc.diff_to_tree(filter),
        }
    }

    pub fn soft_reset_after_commit(
        &self,
        new_base: &RepositoryStructure,
        committed: &RepoDiff,
    ) -> Result<()> {
        match self {
            Self::Gpkg(wc) => wc.soft_reset_after_commit(new_base, committed),
            Self::Postgres(wc) => wc.soft_reset_after_commit(new_base, committed),
            Self::MySql(wc) => wc.soft_reset_after_commit(new_base, committed),
            Self::SqlServer(wc) => wc.soft_reset_after_commit(new_base, committed),
            Self::TileDirectory(wc) => wc.soft_reset_after_commit(new_base, committed),
        }
    }

    pub fn check_not_dirty(&self) -> Result<()> {
        match self {
            Self::Gpkg(wc) => wc.check_not_dirty(),
            Self::Postgres(wc) => wc.check_not_dirty(),
            Self::MySql(wc) => wc.check_not_dirty(),
            Self::SqlServer(wc) => wc.check_not_dirty(),
            Self::TileDirectory(wc) => wc.check_not_dirty(),
        }
    }

    pub fn is_dirty(&self) -> Result<bool> {
        match self {
            Self::Gpkg(wc) => wc.is_dirty(),
            Self::Postgres(wc) => wc.is_dirty(),
            Self::MySql(wc) => wc.is_dirty(),
            Self::SqlServer(wc) => wc.is_dirty(),
            Self::TileDirectory(wc) => wc.is_dirty(),
        }
    }

    /// The tree the working copy is synchronised to, or None before
    /// `write_full`.
    pub fn base_tree_id(&self) -> Result<Option<TreeId>> {
        match self {
            Self::Gpkg(wc) => wc.base_tree_id(),
            Self::Postgres(wc) => wc.base_tree_id(),
            Self::MySql(wc) => wc.base_tree_id(),
            Self::SqlServer(wc) => wc.base_tree_id(),
            Self::TileDirectory(wc) => wc.base_tree_id(),
        }
    }
}
