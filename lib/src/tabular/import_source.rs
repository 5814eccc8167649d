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
//! Sources of tabular data to import.
//!
//! External format conversion (GDAL/OGR, SQL dumps) happens outside the
//! engine; whatever produces the rows implements [`ImportSource`] and the
//! fast-importer consumes it.

use std::collections::BTreeMap;

use crate::dataset::DatasetResult;
use crate::diff::ItemValue;
use crate::schema::Schema;
use crate::tabular::Row;

/// A stream of rows (plus schema and meta items) destined for one dataset
/// path.
pub trait ImportSource {
    /// The dataset path this source imports to.
    fn dest_path(&self) -> &str;

    fn schema(&self) -> &Schema;

    /// Meta items other than the schema: title, description,
    /// `crs/<id>.wkt`, `metadata.xml`.
    fn meta_items(&self) -> BTreeMap<String, ItemValue>;

    fn feature_count(&self) -> usize;

    /// A finite, non-restartable stream of rows ordered per the schema.
    fn features(&self) -> Box<dyn Iterator<Item = DatasetResult<Row>> + '_>;

    /// One line describing this source for a generated commit message.
    fn describe(&self) -> String {
        format!(
            "Import {} features to {}",
            self.feature_count(),
            self.dest_path()
        )
    }
}

/// Generates a commit message covering all sources of one import.
pub fn aggregate_import_message(sources: &[&dyn ImportSource]) -> String {
    sources
        .iter()
        .map(|source| source.describe())
        .collect::<Vec<_>>()
        .join("\n")
}

/// An in-memory import source, used by tests and by callers that already
/// have their rows materialised.
pub struct MemoryImportSource {
    dest_path: String,
    schema: Schema,
    meta_items: BTreeMap<String, ItemValue>,
    features: Vec<Row>,
}

impl MemoryImportSource {
    pub fn new(
        dest_path: impl Into<String>,
        schema: Schema,
        meta_items: BTreeMap<String, ItemValue>,
        features: Vec<Row>,
    ) -> Self {
        Self {
            dest_path: dest_path.into(),
            schema,
            meta_items,
            features,
        }
    }
}

impl ImportSource for MemoryImportSource {
    fn dest_path(&self) -> &str {
        &self.dest_path
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn meta_items(&self) -> BTreeMap<String, ItemValue> {
        self.meta_items.clone()
    }

    fn feature_count(&self) -> usize {
        self.features.len()
    }

    fn features(&self) -> Box<dyn Iterator<Item = DatasetResult<Row>> + '_> {
        Box::new(self.features.iter().cloned().map(Ok))
    }
}
