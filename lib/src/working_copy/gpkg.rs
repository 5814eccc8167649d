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
//! GeoPackage working copy.
//!
//! A single SQLite file holding the user tables, the GPKG spec tables
//! (`gpkg_contents`, `gpkg_geometry_columns`, `gpkg_spatial_ref_sys`,
//! `gpkg_metadata*`, `gpkg_extensions`) and the engine's own
//! `gpkg_kart_state` / `gpkg_kart_track` tables. GPKG requires an INTEGER
//! primary key; datasets whose true key is not an integer get a synthetic
//! one, recorded in the state table and hidden again on diff.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use tracing::debug;

use crate::crs::get_identifier_int;
use crate::crs::parse_authority;
use crate::diff::ItemValue;
use crate::error::Error;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::schema::Column;
use crate::schema::DataType;
use crate::schema::Schema;
use crate::schema::encode_column_id;
use crate::tabular::dataset::TableDataset;
use crate::value::Value;
use crate::working_copy::base::SqlAdapter;
use crate::working_copy::base::SqlWorkingCopy;
use crate::working_copy::base::TableContext;
use crate::working_copy::base::sql_error;
use crate::working_copy::sql_session::PlaceholderStyle;
use crate::working_copy::sql_session::SqlError;
use crate::working_copy::sql_session::SqlRow;
use crate::working_copy::sql_session::SqlSession;
use crate::working_copy::sql_session::SqlValue;
use crate::working_copy::table_defs::TablePrefix;

/// The synthetic integer key column used when the dataset's true primary key
/// cannot be a GPKG primary key.
pub const AUTO_INT_PK: &str = "auto_int_pk";

const EPSG_4326_WKT: &str = concat!(
    "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,",
    "AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],",
    "PRIMEM[\"Greenwich\",0,AUTHORITY[\"EPSG\",\"8901\"]],",
    "UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],",
    "AUTHORITY[\"EPSG\",\"4326\"]]"
);

pub type GpkgWorkingCopy = SqlWorkingCopy<GpkgAdapter>;

pub fn new_gpkg_working_copy(
    path: impl Into<PathBuf>,
    store: std::sync::Arc<crate::store::Store>,
) -> GpkgWorkingCopy {
    SqlWorkingCopy::new(GpkgAdapter { path: path.into() }, store)
}

#[derive(Debug)]
pub struct GpkgAdapter {
    path: PathBuf,
}

impl GpkgAdapter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn geometry_with_srid(geometry: &Geometry, srid: i32) -> Vec<u8> {
        let mut bytes = geometry.as_bytes().to_vec();
        if bytes.len() >= 8 {
            bytes[4..8].copy_from_slice(&srid.to_le_bytes());
        }
        bytes
    }

    fn rtree_name(table_name: &str, column: &str) -> String {
        format!("rtree_{table_name}_{column}")
    }
}

struct GpkgSession {
    conn: Connection,
}

fn to_rusqlite(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        SqlValue::Int(i) => rusqlite::types::Value::Integer(*i),
        SqlValue::Float(f) => rusqlite::types::Value::Real(*f),
        SqlValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
        SqlValue::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

fn from_value_ref(value: rusqlite::types::ValueRef<'_>) -> SqlValue {
    match value {
        rusqlite::types::ValueRef::Null => SqlValue::Null,
        rusqlite::types::ValueRef::Integer(i) => SqlValue::Int(i),
        rusqlite::types::ValueRef::Real(f) => SqlValue::Float(f),
        rusqlite::types::ValueRef::Text(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
        rusqlite::types::ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    }
}

impl SqlSession for GpkgSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> std::result::Result<u64, SqlError> {
        let params = rusqlite::params_from_iter(params.iter().map(to_rusqlite));
        let changed = self.conn.execute(sql, params).map_err(SqlError::query)?;
        Ok(changed as u64)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Vec<SqlRow>, SqlError> {
        let mut stmt = self.conn.prepare(sql).map_err(SqlError::query)?;
        let column_count = stmt.column_count();
        let params = rusqlite::params_from_iter(params.iter().map(to_rusqlite));
        let mut rows = stmt.query(params).map_err(SqlError::query)?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().map_err(SqlError::query)? {
            let mut cells = Vec::with_capacity(column_count);
            for i in 0..column_count {
                cells.push(from_value_ref(row.get_ref(i).map_err(SqlError::query)?));
            }
            result.push(cells);
        }
        Ok(result)
    }

    fn begin(&mut self) -> std::result::Result<(), SqlError> {
        self.conn
            .execute_batch("BEGIN TRANSACTION;")
            .map_err(SqlError::query)
    }

    fn commit(&mut self) -> std::result::Result<(), SqlError> {
        self.conn.execute_batch("COMMIT;").map_err(SqlError::query)
    }

    fn rollback(&mut self) -> std::result::Result<(), SqlError> {
        self.conn
            .execute_batch("ROLLBACK;")
            .map_err(SqlError::query)
    }
}

impl SqlAdapter for GpkgAdapter {
    fn backend_name(&self) -> &'static str {
        "GPKG"
    }

    fn write_prefix(&self) -> TablePrefix {
        TablePrefix::GpkgKart
    }

    fn read_prefixes(&self) -> &'static [TablePrefix] {
        TablePrefix::read_order_gpkg()
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn demotes_non_int_pk(&self) -> bool {
        true
    }

    fn connect(&self) -> std::result::Result<Box<dyn SqlSession>, SqlError> {
        let conn = Connection::open(&self.path).map_err(SqlError::connect)?;
        conn.execute_batch("PRAGMA foreign_keys = OFF;")
            .map_err(SqlError::connect)?;
        Ok(Box::new(GpkgSession { conn }))
    }

    fn initialise_sql(&self) -> Vec<String> {
        // See http://www.geopackage.org/spec/#table_definition_sql
        vec![
            "CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (\
             srs_name TEXT NOT NULL, \
             srs_id INTEGER PRIMARY KEY, \
             organization TEXT NOT NULL, \
             organization_coordsys_id INTEGER NOT NULL, \
             definition TEXT NOT NULL, \
             description TEXT)"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS gpkg_contents (\
             table_name TEXT NOT NULL PRIMARY KEY, \
             data_type TEXT NOT NULL, \
             identifier TEXT UNIQUE, \
             description TEXT DEFAULT '', \
             last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')), \
             min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE, \
             srs_id INTEGER, \
             CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) \
             REFERENCES gpkg_spatial_ref_sys(srs_id))"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (\
             table_name TEXT NOT NULL, \
             column_name TEXT NOT NULL, \
             geometry_type_name TEXT NOT NULL, \
             srs_id INTEGER NOT NULL, \
             z TINYINT NOT NULL, \
             m TINYINT NOT NULL, \
             CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name), \
             CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) \
             REFERENCES gpkg_contents(table_name), \
             CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) \
             REFERENCES gpkg_spatial_ref_sys(srs_id))"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS gpkg_metadata (\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             md_scope TEXT NOT NULL DEFAULT 'dataset', \
             md_standard_uri TEXT NOT NULL, \
             mime_type TEXT NOT NULL DEFAULT 'text/xml', \
             metadata TEXT NOT NULL DEFAULT '')"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS gpkg_metadata_reference (\
             reference_scope TEXT NOT NULL, \
             table_name TEXT, \
             column_name TEXT, \
             row_id_value INTEGER, \
             timestamp DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')), \
             md_file_id INTEGER NOT NULL, \
             md_parent_id INTEGER, \
             CONSTRAINT crmr_mfi_fk FOREIGN KEY (md_file_id) \
             REFERENCES gpkg_metadata(id), \
             CONSTRAINT crmr_mpi_fk FOREIGN KEY (md_parent_id) \
             REFERENCES gpkg_metadata(id))"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS gpkg_extensions (\
             table_name TEXT, \
             column_name TEXT, \
             extension_name TEXT NOT NULL, \
             definition TEXT NOT NULL, \
             scope TEXT NOT NULL, \
             CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name))"
                .to_string(),
            format!(
                "INSERT OR REPLACE INTO gpkg_spatial_ref_sys \
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
                 VALUES \
                 ('Undefined cartesian SRS', -1, 'NONE', -1, 'undefined', \
                  'undefined cartesian coordinate reference system'), \
                 ('Undefined geographic SRS', 0, 'NONE', 0, 'undefined', \
                  'undefined geographic coordinate reference system'), \
                 ('WGS 84 geodetic', 4326, 'EPSG', 4326, '{EPSG_4326_WKT}', \
                  'longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid')"
            ),
        ]
    }

    fn column_sql_type(&self, column: &Column, _ctx: &TableContext) -> String {
        match &column.data_type {
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Integer { size: 8 } => "TINYINT".to_string(),
            DataType::Integer { size: 16 } => "SMALLINT".to_string(),
            DataType::Integer { size: 32 } => "MEDIUMINT".to_string(),
            DataType::Integer { .. } => "INTEGER".to_string(),
            DataType::Float { size: 32 } => "FLOAT".to_string(),
            DataType::Float { .. } => "REAL".to_string(),
            DataType::Text { length: Some(n) } => format!("TEXT({n})"),
            DataType::Text { length: None } => "TEXT".to_string(),
            DataType::Blob { length: Some(n) } => format!("BLOB({n})"),
            DataType::Blob { length: None } => "BLOB".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp {
                timezone: Some(tz),
            } if tz == "UTC" => "DATETIME".to_string(),
            // GPKG has no types for these; they are approximated as text.
            DataType::Timestamp { .. }
            | DataType::Time
            | DataType::Numeric { .. }
            | DataType::Interval => "TEXT".to_string(),
            DataType::Geometry { geometry_type, .. } => geometry_type.clone(),
        }
    }

    fn try_align_schema_col(&self, old: &Column, new: &mut Column) -> bool {
        // Types approximated as text lose their extra type info on the
        // round trip.
        let approximated_as_text = matches!(
            old.data_type,
            DataType::Numeric { .. }
                | DataType::Interval
                | DataType::Time
                | DataType::Timestamp { timezone: None }
        );
        if approximated_as_text && matches!(new.data_type, DataType::Text { length: None }) {
            new.data_type = old.data_type.clone();
        }
        // GPKG primary keys have to be int64, so smaller integer primary
        // keys are approximated as int64.
        if let (DataType::Integer { size: old_size }, DataType::Integer { size: new_size }) =
            (&old.data_type, &mut new.data_type)
        {
            if new.pk_index.is_some() && new_size != old_size {
                *new_size = *old_size;
            }
        }
        old.data_type == new.data_type
    }

    fn value_to_sql(&self, value: &Value, column: &Column, ctx: &TableContext) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Boolean(b) => SqlValue::Bool(*b),
            Value::Integer(i) => SqlValue::Int(*i),
            Value::Float(f) => SqlValue::Float(*f),
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Blob(b) => SqlValue::Bytes(b.clone()),
            Value::Geometry(g) => {
                // Stored geometries carry srs_id 0; the live GPKG column owns
                // the real srs.
                SqlValue::Bytes(Self::geometry_with_srid(g, ctx.crs_id_for(column)))
            }
        }
    }

    fn sql_to_value(&self, value: SqlValue, column: &Column, _ctx: &TableContext) -> Result<Value> {
        Ok(match (&column.data_type, value) {
            (_, SqlValue::Null) => Value::Null,
            (DataType::Boolean, SqlValue::Int(i)) => Value::Boolean(i != 0),
            (DataType::Boolean, SqlValue::Bool(b)) => Value::Boolean(b),
            (DataType::Integer { .. }, SqlValue::Int(i)) => Value::Integer(i),
            (DataType::Float { .. }, SqlValue::Float(f)) => Value::Float(f),
            (DataType::Float { .. }, SqlValue::Int(i)) => Value::Float(i as f64),
            (DataType::Geometry { .. }, SqlValue::Bytes(b)) => Value::Geometry(
                Geometry::from_gpkg_bytes(&b).map_err(|e| Error::GeometryError {
                    message: e.to_string(),
                })?,
            ),
            (DataType::Blob { .. }, SqlValue::Bytes(b)) => Value::Blob(b),
            (_, SqlValue::Text(s)) => Value::Text(s),
            (_, SqlValue::Int(i)) => Value::Integer(i),
            (_, SqlValue::Float(f)) => Value::Float(f),
            (_, SqlValue::Bytes(b)) => Value::Blob(b),
            (_, SqlValue::Bool(b)) => Value::Boolean(b),
        })
    }

    fn create_table_sql(&self, ctx: &TableContext) -> Vec<String> {
        let mut columns: Vec<String> = Vec::with_capacity(ctx.schema.len() + 1);
        if ctx.pk_demoted {
            // GPKG requires an INTEGER primary key; the true key is demoted
            // to a UNIQUE NOT NULL column and re-inflated on diff.
            columns.push(format!(
                "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                self.quote(AUTO_INT_PK)
            ));
        }
        for col in ctx.schema.columns() {
            let mut spec = format!(
                "{} {}",
                self.quote(&col.name),
                self.column_sql_type(col, ctx)
            );
            if col.pk_index.is_some() {
                if ctx.pk_demoted {
                    spec.push_str(" UNIQUE NOT NULL");
                } else {
                    spec = format!(
                        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                        self.quote(&col.name)
                    );
                }
            }
            columns.push(spec);
        }
        vec![format!(
            "CREATE TABLE {} ({})",
            self.table_identifier(&ctx.table_name),
            columns.join(", ")
        )]
    }

    fn create_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>> {
        let table = self.table_identifier(&ctx.table_name);
        let track = self.table_identifier(&self.write_prefix().table_name("track"));
        let pk = self.quote(&ctx.pk_column()?.name);
        // sqlite doesn't allow parameter substitution in CREATE TRIGGER, so
        // the table name is inlined as a string literal.
        let name_literal = ctx.table_name.replace('\'', "''");
        let trigger = |suffix: &str| {
            self.quote(&format!(
                "{}{}_{suffix}",
                self.write_prefix().as_str(),
                ctx.table_name
            ))
        };
        Ok(vec![
            format!(
                "CREATE TRIGGER {} AFTER INSERT ON {table} BEGIN \
                 INSERT OR REPLACE INTO {track} (table_name, pk) \
                 VALUES ('{name_literal}', NEW.{pk}); END;",
                trigger("ins")
            ),
            format!(
                "CREATE TRIGGER {} AFTER UPDATE ON {table} BEGIN \
                 INSERT OR REPLACE INTO {track} (table_name, pk) \
                 VALUES ('{name_literal}', NEW.{pk}), ('{name_literal}', OLD.{pk}); END;",
                trigger("upd")
            ),
            format!(
                "CREATE TRIGGER {} AFTER DELETE ON {table} BEGIN \
                 INSERT OR REPLACE INTO {track} (table_name, pk) \
                 VALUES ('{name_literal}', OLD.{pk}); END;",
                trigger("del")
            ),
        ])
    }

    fn drop_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        ["ins", "upd", "del"]
            .iter()
            .map(|suffix| {
                format!(
                    "DROP TRIGGER IF EXISTS {}",
                    self.quote(&format!(
                        "{}{}_{suffix}",
                        self.write_prefix().as_str(),
                        ctx.table_name
                    ))
                )
            })
            .collect()
    }

    fn write_meta(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        dataset: &TableDataset,
    ) -> Result<()> {
        let meta_items = dataset.meta_items()?;
        let title = match meta_items.get("title") {
            Some(ItemValue::Text(t)) if !t.is_empty() => t.clone(),
            _ => ctx.table_name.clone(),
        };
        let description = match meta_items.get("description") {
            Some(ItemValue::Text(d)) => d.clone(),
            _ => String::new(),
        };

        for (crs_name, wkt) in &ctx.crs_definitions {
            let srs_id = get_identifier_int(wkt);
            let (organization, coordsys_id) = parse_authority(wkt)
                .map(|(org, code)| (org, code.parse::<i64>().unwrap_or(i64::from(srs_id))))
                .unwrap_or_else(|| ("NONE".to_string(), i64::from(srs_id)));
            session
                .execute(
                    "INSERT OR REPLACE INTO gpkg_spatial_ref_sys \
                     (srs_name, srs_id, organization, organization_coordsys_id, definition) \
                     VALUES (?, ?, ?, ?, ?)",
                    &[
                        SqlValue::Text(crs_name.clone()),
                        SqlValue::Int(i64::from(srs_id)),
                        SqlValue::Text(organization),
                        SqlValue::Int(coordsys_id),
                        SqlValue::Text(wkt.clone()),
                    ],
                )
                .map_err(sql_error)?;
        }

        let geometry_column = ctx.schema.geometry_columns().first().map(|col| {
            (
                col.name.clone(),
                match &col.data_type {
                    DataType::Geometry { geometry_type, .. } => geometry_type.clone(),
                    _ => "GEOMETRY".to_string(),
                },
                ctx.crs_id_for(col),
            )
        });
        let data_type = if geometry_column.is_some() {
            "features"
        } else {
            "attributes"
        };
        // An identifier conflicting with another table's gets prefixed, since
        // gpkg_contents.identifier is UNIQUE.
        let identifier_used: Option<i64> = session
            .scalar_int(
                "SELECT count(*) FROM gpkg_contents WHERE identifier = ? AND table_name != ?",
                &[
                    SqlValue::Text(title.clone()),
                    SqlValue::Text(ctx.table_name.clone()),
                ],
            )
            .map_err(sql_error)?;
        let identifier = if identifier_used.unwrap_or(0) > 0 {
            format!("{}: {title}", ctx.table_name)
        } else {
            title
        };
        session
            .execute(
                "INSERT OR REPLACE INTO gpkg_contents \
                 (table_name, data_type, identifier, description, last_change, srs_id) \
                 VALUES (?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%fZ','now'), ?)",
                &[
                    SqlValue::Text(ctx.table_name.clone()),
                    SqlValue::Text(data_type.to_string()),
                    SqlValue::Text(identifier),
                    SqlValue::Text(description),
                    match &geometry_column {
                        Some((_, _, srs_id)) => SqlValue::Int(i64::from(*srs_id)),
                        None => SqlValue::Int(0),
                    },
                ],
            )
            .map_err(sql_error)?;

        if let Some((column_name, geometry_type, srs_id)) = geometry_column {
            session
                .execute(
                    "INSERT OR REPLACE INTO gpkg_geometry_columns \
                     (table_name, column_name, geometry_type_name, srs_id, z, m) \
                     VALUES (?, ?, ?, ?, 0, 0)",
                    &[
                        SqlValue::Text(ctx.table_name.clone()),
                        SqlValue::Text(column_name),
                        SqlValue::Text(geometry_type),
                        SqlValue::Int(i64::from(srs_id)),
                    ],
                )
                .map_err(sql_error)?;
        }

        if let Some(ItemValue::Text(xml)) = meta_items.get("metadata.xml") {
            session
                .execute(
                    "INSERT INTO gpkg_metadata (md_scope, md_standard_uri, mime_type, metadata) \
                     VALUES ('dataset', 'http://www.isotc211.org/2005/gmd', 'text/xml', ?)",
                    &[SqlValue::Text(xml.clone())],
                )
                .map_err(sql_error)?;
            session
                .execute(
                    "INSERT INTO gpkg_metadata_reference \
                     (reference_scope, table_name, md_file_id) \
                     VALUES ('table', ?, (SELECT max(id) FROM gpkg_metadata))",
                    &[SqlValue::Text(ctx.table_name.clone())],
                )
                .map_err(sql_error)?;
        }
        Ok(())
    }

    fn delete_meta(&self, session: &mut dyn SqlSession, ctx: &TableContext) -> Result<()> {
        let table_name = SqlValue::Text(ctx.table_name.clone());
        for sql in [
            "DELETE FROM gpkg_metadata_reference WHERE table_name = ?",
            "DELETE FROM gpkg_extensions WHERE table_name = ?",
            "DELETE FROM gpkg_geometry_columns WHERE table_name = ?",
            "DELETE FROM gpkg_contents WHERE table_name = ?",
        ] {
            session
                .execute(sql, std::slice::from_ref(&table_name))
                .map_err(sql_error)?;
        }
        Ok(())
    }

    fn after_write_table(&self, session: &mut dyn SqlSession, ctx: &TableContext) -> Result<()> {
        // Maintain the GPKG spatial index as an on-write side-effect. The
        // rtree module may be unavailable in a stripped-down SQLite; the
        // index is an optimisation, not a requirement.
        let Some(geom_col) = ctx.schema.geometry_column_name() else {
            return Ok(());
        };
        let geom_col = geom_col.to_string();
        let rtree = Self::rtree_name(&ctx.table_name, &geom_col);
        let create = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING rtree(id, minx, maxx, miny, maxy)",
            self.quote(&rtree)
        );
        if let Err(err) = session.execute(&create, &[]) {
            debug!(?err, "rtree unavailable; skipping spatial index");
            return Ok(());
        }
        session
            .execute(&format!("DELETE FROM {}", self.quote(&rtree)), &[])
            .map_err(sql_error)?;
        let rows = session
            .query(
                &format!(
                    "SELECT rowid, {} FROM {}",
                    self.quote(&geom_col),
                    self.table_identifier(&ctx.table_name)
                ),
                &[],
            )
            .map_err(sql_error)?;
        for row in rows {
            let (Some(SqlValue::Int(rowid)), Some(SqlValue::Bytes(bytes))) =
                (row.first(), row.get(1))
            else {
                continue;
            };
            let Ok(geometry) = Geometry::from_gpkg_bytes(bytes) else {
                continue;
            };
            let Ok(Some(envelope)) = geometry.envelope() else {
                continue;
            };
            session
                .execute(
                    &format!(
                        "INSERT INTO {} (id, minx, maxx, miny, maxy) VALUES (?, ?, ?, ?, ?)",
                        self.quote(&rtree)
                    ),
                    &[
                        SqlValue::Int(*rowid),
                        SqlValue::Float(envelope.min_x),
                        SqlValue::Float(envelope.max_x),
                        SqlValue::Float(envelope.min_y),
                        SqlValue::Float(envelope.max_y),
                    ],
                )
                .map_err(sql_error)?;
        }
        session
            .execute(
                "INSERT OR REPLACE INTO gpkg_extensions \
                 (table_name, column_name, extension_name, definition, scope) \
                 VALUES (?, ?, 'gpkg_rtree_index', \
                 'http://www.geopackage.org/spec/#extension_rtree', 'write-only')",
                &[
                    SqlValue::Text(ctx.table_name.clone()),
                    SqlValue::Text(geom_col),
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn supported_meta_items(&self) -> &'static [&'static str] {
        &["title", "description", "schema.json"]
    }

    fn meta_items(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
    ) -> Result<BTreeMap<String, ItemValue>> {
        let mut items = BTreeMap::new();

        let contents = session
            .query_one(
                "SELECT identifier, description FROM gpkg_contents WHERE table_name = ?",
                &[SqlValue::Text(ctx.table_name.clone())],
            )
            .map_err(sql_error)?;
        if let Some(row) = contents {
            if let Some(mut identifier) = row.first().and_then(|v| v.as_text().map(String::from)) {
                // Strip the uniqueness prefix added on write.
                let prefix = format!("{}: ", ctx.table_name);
                if let Some(stripped) = identifier.strip_prefix(&prefix) {
                    identifier = stripped.to_string();
                }
                if identifier != ctx.table_name {
                    items.insert("title".to_string(), ItemValue::Text(identifier));
                }
            }
            if let Some(description) = row.get(1).and_then(|v| v.as_text()) {
                if !description.is_empty() {
                    items.insert(
                        "description".to_string(),
                        ItemValue::Text(description.to_string()),
                    );
                }
            }
        }

        let geometry_info = session
            .query_one(
                "SELECT column_name, geometry_type_name, srs_id \
                 FROM gpkg_geometry_columns WHERE table_name = ?",
                &[SqlValue::Text(ctx.table_name.clone())],
            )
            .map_err(sql_error)?;

        let mut crs_name_by_srs: BTreeMap<i64, String> = BTreeMap::new();
        if let Some(row) = &geometry_info {
            if let Some(srs_id) = row.get(2).and_then(SqlValue::as_int) {
                let srs = session
                    .query_one(
                        "SELECT organization, organization_coordsys_id, definition \
                         FROM gpkg_spatial_ref_sys WHERE srs_id = ?",
                        &[SqlValue::Int(srs_id)],
                    )
                    .map_err(sql_error)?;
                if let Some(srs_row) = srs {
                    let organization = srs_row
                        .first()
                        .and_then(|v| v.as_text())
                        .unwrap_or("NONE")
                        .to_uppercase();
                    let code = srs_row.get(1).and_then(SqlValue::as_int).unwrap_or(srs_id);
                    let crs_name = format!("{organization}:{code}");
                    if let Some(definition) = srs_row.get(2).and_then(|v| v.as_text()) {
                        items.insert(
                            crate::crs::wkt_meta_item_name(&crs_name),
                            ItemValue::Text(definition.to_string()),
                        );
                    }
                    crs_name_by_srs.insert(srs_id, crs_name);
                }
            }
        }

        let schema = self.introspect_schema(session, ctx, geometry_info, &crs_name_by_srs)?;
        items.insert("schema.json".to_string(), ItemValue::Json(schema.to_json()));
        Ok(items)
    }

    fn table_exists(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
    ) -> std::result::Result<bool, SqlError> {
        let count = session.scalar_int(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::Text(table_name.to_string())],
        )?;
        Ok(count.unwrap_or(0) > 0)
    }
}

impl GpkgAdapter {
    /// Rebuilds a schema from the live table, reversing the GPKG type map.
    /// Column ids are derived deterministically; `aligned_to_with` later maps
    /// them back onto the committed ids where the columns survived.
    fn introspect_schema(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        geometry_info: Option<SqlRow>,
        crs_name_by_srs: &BTreeMap<i64, String>,
    ) -> Result<Schema> {
        let (geom_col_name, geom_type, geom_srs) = match &geometry_info {
            Some(row) => (
                row.first().and_then(|v| v.as_text()).map(String::from),
                row.get(1)
                    .and_then(|v| v.as_text())
                    .unwrap_or("GEOMETRY")
                    .to_string(),
                row.get(2).and_then(SqlValue::as_int),
            ),
            None => (None, "GEOMETRY".to_string(), None),
        };
        let pragma = format!(
            "PRAGMA table_info({})",
            self.table_identifier(&ctx.table_name)
        );
        let rows = session.query(&pragma, &[]).map_err(sql_error)?;
        let mut columns = Vec::new();
        for row in rows {
            // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
            let Some(name) = row.get(1).and_then(|v| v.as_text()).map(String::from) else {
                continue;
            };
            if ctx.pk_demoted && name == AUTO_INT_PK {
                continue;
            }
            let declared = row
                .get(2)
                .and_then(|v| v.as_text())
                .unwrap_or("")
                .to_uppercase();
            let is_pk = row.get(5).and_then(SqlValue::as_int).unwrap_or(0) > 0;
            let data_type = if Some(&name) == geom_col_name.as_ref() {
                DataType::Geometry {
                    geometry_type: geom_type.clone(),
                    crs_name: geom_srs.and_then(|srs| crs_name_by_srs.get(&srs).cloned()),
                }
            } else {
                sql_type_to_data_type(&declared)
            };
            let pk_index = if ctx.pk_demoted {
                // The real key column is the one recorded in the committed
                // schema; recover its pk position by name.
                ctx.schema
                    .column_by_name(&name)
                    .and_then(|col| col.pk_index)
            } else if is_pk {
                Some(0)
            } else {
                None
            };
            let id = ctx
                .schema
                .column_by_name(&name)
                .map(|col| col.id)
                .unwrap_or_else(|| {
                    encode_column_id(&name, &data_type, ctx.table_name.as_bytes())
                });
            columns.push(Column {
                id,
                name,
                data_type,
                pk_index,
            });
        }
        Ok(Schema::new(columns))
    }
}

fn sql_type_to_data_type(declared: &str) -> DataType {
    let base = declared
        .split_once('(')
        .map(|(base, _)| base)
        .unwrap_or(declared)
        .trim();
    let length = declared
        .split_once('(')
        .and_then(|(_, rest)| rest.trim_end_matches(')').parse::<u32>().ok());
    match base {
        "BOOLEAN" => DataType::Boolean,
        "TINYINT" => DataType::Integer { size: 8 },
        "SMALLINT" => DataType::Integer { size: 16 },
        "MEDIUMINT" => DataType::Integer { size: 32 },
        "INT" | "INTEGER" | "BIGINT" => DataType::Integer { size: 64 },
        "FLOAT" => DataType::Float { size: 32 },
        "REAL" | "DOUBLE" => DataType::Float { size: 64 },
        "DATE" => DataType::Date,
        "DATETIME" => DataType::Timestamp {
            timezone: Some("UTC".to_string()),
        },
        "BLOB" => DataType::Blob { length },
        _ => DataType::Text { length },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_map_roundtrip() {
        for (declared, expected) in [
            ("BOOLEAN", DataType::Boolean),
            ("TINYINT", DataType::Integer { size: 8 }),
            ("MEDIUMINT", DataType::Integer { size: 32 }),
            ("INTEGER", DataType::Integer { size: 64 }),
            ("FLOAT", DataType::Float { size: 32 }),
            ("REAL", DataType::Float { size: 64 }),
            ("TEXT(40)", DataType::Text { length: Some(40) }),
            ("TEXT", DataType::Text { length: None }),
        ] {
            assert_eq!(sql_type_to_data_type(declared), expected);
        }
    }

    #[test]
    fn test_geometry_with_srid() {
        let g = Geometry::from_hex_wkb("0101000000000000000000F03F0000000000000040").unwrap();
        let with_srid = GpkgAdapter::geometry_with_srid(&g, 2193);
        assert_eq!(&with_srid[4..8], &2193i32.to_le_bytes());
        // Normalising strips the srid again.
        let back = Geometry::from_gpkg_bytes(&with_srid).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_try_align_approximated_types() {
        let adapter = GpkgAdapter {
            path: PathBuf::new(),
        };
        let old = Column::new(
            "amount",
            DataType::Numeric {
                precision: Some(10),
                scale: Some(2),
            },
            None,
        );
        let mut new = Column::new("amount", DataType::Text { length: None }, None);
        assert!(adapter.try_align_schema_col(&old, &mut new));
        assert_eq!(new.data_type, old.data_type);

        let old_pk = Column::new("fid", DataType::Integer { size: 32 }, Some(0));
        let mut new_pk = Column::new("fid", DataType::Integer { size: 64 }, Some(0));
        assert!(adapter.try_align_schema_col(&old_pk, &mut new_pk));
    }
}
