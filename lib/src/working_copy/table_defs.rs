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
//! Definitions of the engine's own working-copy tables.
//!
//! Every backend carries a `state` table (per-table key/value pairs; the
//! distinguished row `("*", "tree")` is the base tree id) and a `track`
//! table (primary keys touched since the base was set, fed by triggers).
//!
//! The write prefix is `_kart_` (GPKG: `gpkg_kart_`, so the tables are
//! hidden); the legacy `_sno_` / `gpkg_sno_` prefixes are recognised when
//! reading an existing working copy, but never written.

pub const STATE: &str = "state";
pub const TRACK: &str = "track";

/// The state row key holding the base tree id; its `table_name` is `"*"`.
pub const TREE_STATE_KEY: &str = "tree";
pub const ALL_TABLES: &str = "*";

/// The state row key holding the spatial-filter hash.
pub const SPATIAL_FILTER_HASH_KEY: &str = "spatial-filter-hash";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TablePrefix {
    /// `_kart_state` / `_kart_track` — current, written by this version.
    Kart,
    /// `gpkg_kart_state` / `gpkg_kart_track` — current, GPKG variant.
    GpkgKart,
    /// `_sno_state` / `_sno_track` — legacy, read-compatible only.
    Sno,
    /// `gpkg_sno_state` / `gpkg_sno_track` — legacy, GPKG variant.
    GpkgSno,
}

impl TablePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kart => "_kart_",
            Self::GpkgKart => "gpkg_kart_",
            Self::Sno => "_sno_",
            Self::GpkgSno => "gpkg_sno_",
        }
    }

    pub fn table_name(&self, short_name: &str) -> String {
        format!("{}{short_name}", self.as_str())
    }

    /// Prefixes tried when opening an existing working copy, current first.
    pub fn read_order_flat() -> &'static [Self] {
        &[Self::Kart, Self::Sno]
    }

    pub fn read_order_gpkg() -> &'static [Self] {
        &[Self::GpkgKart, Self::GpkgSno]
    }
}

/// `CREATE TABLE` statements for the state and track tables.
///
/// `key_type` is the column type used for the key columns: plain `TEXT`
/// everywhere except MySQL (`VARCHAR(256)`) and SQL Server (`NVARCHAR(400)`),
/// whose index length limits require a bounded type.
pub fn create_tables_sql(
    prefix: TablePrefix,
    db_schema: Option<&str>,
    key_type: &str,
    quote: impl Fn(&str) -> String,
) -> Vec<String> {
    let qualify = |name: &str| match db_schema {
        Some(schema) => format!("{}.{}", quote(schema), quote(name)),
        None => quote(name),
    };
    let state = qualify(&prefix.table_name(STATE));
    let track = qualify(&prefix.table_name(TRACK));
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {state} (\
             table_name {key_type} NOT NULL, \
             key {key_type} NOT NULL, \
             value TEXT NOT NULL, \
             PRIMARY KEY (table_name, key))"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {track} (\
             table_name {key_type} NOT NULL, \
             pk {key_type} NOT NULL, \
             PRIMARY KEY (table_name, pk))"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert_eq!(TablePrefix::Kart.table_name(STATE), "_kart_state");
        assert_eq!(TablePrefix::GpkgKart.table_name(TRACK), "gpkg_kart_track");
        assert_eq!(TablePrefix::Sno.table_name(TRACK), "_sno_track");
        assert_eq!(TablePrefix::GpkgSno.table_name(STATE), "gpkg_sno_state");
    }

    #[test]
    fn test_create_tables_sql() {
        let sql = create_tables_sql(TablePrefix::Kart, None, "TEXT", |s| format!("\"{s}\""));
        assert_eq!(sql.len(), 2);
        assert!(sql[0].contains("\"_kart_state\""));
        assert!(sql[0].contains("PRIMARY KEY (table_name, key)"));
        assert!(sql[1].contains("\"_kart_track\""));
    }
}
