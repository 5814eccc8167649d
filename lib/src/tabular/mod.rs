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

//! Tabular (vector feature) datasets.

pub mod codec;
pub mod dataset;
pub mod feature_path;
pub mod import_source;

use crate::value::Value;

/// One row of a tabular dataset, with values ordered to match the schema's
/// column order.
pub type Row = Vec<Value>;
