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

//! Library for Meridian: version control for geospatial datasets.
//!
//! Datasets (vector feature tables and raster/point-cloud tile sets) are
//! decomposed into trees of content-addressed blobs inside an ordinary
//! object database, and projected into live working copies (GeoPackage,
//! PostgreSQL, MySQL, SQL Server, or a tile directory) that can be edited
//! with conventional tools. Commits, diffs, resets and imports reconcile
//! the committed trees with the live stores.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod backend;
pub mod crs;
pub mod dataset;
pub mod diff;
pub mod error;
pub mod fast_import;
pub mod geometry;
pub mod object_id;
pub mod path;
pub mod repo;
pub mod schema;
pub mod simple_backend;
pub mod spatial_filter;
pub mod store;
pub mod structure;
pub mod tabular;
pub mod tile;
pub mod tree;
pub mod tree_builder;
pub mod value;
pub mod working_copy;
