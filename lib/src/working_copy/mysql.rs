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
//! MySQL working copy.
//!
//! The working copy is a database inside a MySQL server, given as
//! `mysql://HOST[:PORT]/DBNAME`. MySQL has no `CREATE TRIGGER OR REPLACE`
//! and no trigger disabling, so suspension drops and recreates the three
//! tracking triggers inside the transaction. The state/track key columns are
//! `VARCHAR(256)`: an unbounded key type would exceed MySQL's index length
//! limit.

use std::collections::BTreeMap;

use mysql::prelude::Queryable as _;

use crate::diff::ItemValue;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::schema::Column;
use crate::schema::DataType;
use crate::schema::Schema;
use crate::schema::encode_column_id;
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

pub type MySqlWorkingCopy = SqlWorkingCopy<MySqlAdapter>;

pub fn new_mysql_working_copy(
    location: &str,
    store: std::sync::Arc<crate::store::Store>,
) -> Result<MySqlWorkingCopy> {
    let adapter = MySqlAdapter::from_location(location)?;
    Ok(SqlWorkingCopy::new(adapter, store))
}

#[derive(Debug)]
pub struct MySqlAdapter {
    url: String,
    db_name: String,
}

impl MySqlAdapter {
    pub fn from_location(location: &str) -> Result<Self> {
        let rest = location.strip_prefix("mysql://").ok_or_else(|| {
            crate::error::Error::invalid_operation(
                "MySQL working copy location must start with mysql://".to_string(),
            )
        })?;
        let (_, db_name) = rest.split_once('/').ok_or_else(|| {
            crate::error::Error::invalid_operation(
                "Expected a MySQL working copy location in the form mysql://HOST[:PORT]/DBNAME"
                    .to_string(),
            )
        })?;
        if db_name.is_empty() || db_name.contains('/') {
            return Err(crate::error::Error::invalid_operation(
                "Expected a MySQL working copy location in the form mysql://HOST[:PORT]/DBNAME"
                    .to_string(),
            ));
        }
        Ok(Self {
            url: location.to_string(),
            db_name: db_name.to_string(),
        })
    }

    fn trigger_name(&self, table_name: &str, suffix: &str) -> String {
        self.quote(&format!("_kart_trk_{table_name}_{suffix}"))
    }
}

struct MySqlSession {
    conn: mysql::Conn,
}

fn to_mysql(value: &SqlValue) -> mysql::Value {
    match value {
        SqlValue::Null => mysql::Value::NULL,
        SqlValue::Bool(b) => mysql::Value::Int(i64::from(*b)),
        SqlValue::Int(i) => mysql::Value::Int(*i),
        SqlValue::Float(f) => mysql::Value::Double(*f),
        SqlValue::Text(s) => mysql::Value::Bytes(s.as_bytes().to_vec()),
        SqlValue::Bytes(b) => mysql::Value::Bytes(b.clone()),
    }
}

fn mysql_params(values: &[SqlValue]) -> mysql::Params {
    if values.is_empty() {
        mysql::Params::Empty
    } else {
        mysql::Params::Positional(values.iter().map(to_mysql).collect())
    }
}

fn from_mysql(value: mysql::Value, binary: bool) -> SqlValue {
    match value {
        mysql::Value::NULL => SqlValue::Null,
        mysql::Value::Int(i) => SqlValue::Int(i),
        mysql::Value::UInt(u) => SqlValue::Int(u as i64),
        mysql::Value::Float(f) => SqlValue::Float(f64::from(f)),
        mysql::Value::Double(f) => SqlValue::Float(f),
        mysql::Value::Bytes(b) => {
            if binary {
                SqlValue::Bytes(b)
            } else {
                match String::from_utf8(b) {
                    Ok(s) => SqlValue::Text(s),
                    Err(e) => SqlValue::Bytes(e.into_bytes()),
                }
            }
        }
        mysql::Value::Date(y, mo, d, h, mi, s, _us) => {
            SqlValue::Text(format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{s:02}"))
        }
        mysql::Value::Time(neg, d, h, m, s, _us) => {
            let sign = if neg { "-" } else { "" };
            SqlValue::Text(format!("{sign}{:02}:{m:02}:{s:02}", u32::from(h) + d * 24))
        }
    }
}

impl SqlSession for MySqlSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> std::result::Result<u64, SqlError> {
        self.conn
            .exec_drop(sql, mysql_params(params))
            .map_err(SqlError::query)?;
        Ok(self.conn.affected_rows())
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Vec<SqlRow>, SqlError> {
        let rows: Vec<mysql::Row> = self
            .conn
            .exec(sql, mysql_params(params))
            .map_err(SqlError::query)?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let binary_flags: Vec<bool> = row
                .columns_ref()
                .iter()
                .map(|col| {
                    col.flags()
                        .contains(mysql::consts::ColumnFlags::BINARY_FLAG)
                })
                .collect();
            let values = row.unwrap();
            result.push(
                values
                    .into_iter()
                    .zip(binary_flags)
                    .map(|(value, binary)| from_mysql(value, binary))
                    .collect(),
            );
        }
        Ok(result)
    }

    fn begin(&mut self) -> std::result::Result<(), SqlError> {
        self.conn
            .query_drop("START TRANSACTION")
            .map_err(SqlError::query)
    }

    fn commit(&mut self) -> std::result::Result<(), SqlError> {
        self.conn.query_drop("COMMIT").map_err(SqlError::query)
    }

    fn rollback(&mut self) -> std::result::Result<(), SqlError> {
        self.conn.query_drop("ROLLBACK").map_err(SqlError::query)
    }
}

impl SqlAdapter for MySqlAdapter {
    fn backend_name(&self) -> &'static str {
        "MySQL"
    }

    fn write_prefix(&self) -> TablePrefix {
        TablePrefix::Kart
    }

    fn db_schema(&self) -> Option<&str> {
        Some(&self.db_name)
    }

    fn key_column_type(&self) -> &'static str {
        "VARCHAR(256)"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn quote(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn connect(&self) -> std::result::Result<Box<dyn SqlSession>, SqlError> {
        let opts = mysql::Opts::from_url(&self.url).map_err(SqlError::connect)?;
        let conn = mysql::Conn::new(opts).map_err(SqlError::connect)?;
        Ok(Box::new(MySqlSession { conn }))
    }

    fn initialise_sql(&self) -> Vec<String> {
        vec![format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.quote(&self.db_name)
        )]
    }

    fn column_sql_type(&self, column: &Column, ctx: &TableContext) -> String {
        match &column.data_type {
            DataType::Boolean => "BIT".to_string(),
            DataType::Integer { size: 8 } => "TINYINT".to_string(),
            DataType::Integer { size: 16 } => "SMALLINT".to_string(),
            DataType::Integer { size: 32 } => "INT".to_string(),
            DataType::Integer { .. } => "BIGINT".to_string(),
            DataType::Float { size: 32 } => "FLOAT".to_string(),
            DataType::Float { .. } => "DOUBLE PRECISION".to_string(),
            DataType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({p},{s})"),
            DataType::Numeric { .. } => "NUMERIC".to_string(),
            DataType::Text { length: Some(n) } if *n <= 16383 => format!("VARCHAR({n})"),
            DataType::Text { .. } => "LONGTEXT".to_string(),
            DataType::Blob { length: Some(n) } if *n <= 65535 => format!("VARBINARY({n})"),
            DataType::Blob { .. } => "LONGBLOB".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Time => "TIME".to_string(),
            DataType::Timestamp { timezone: Some(_) } => "TIMESTAMP".to_string(),
            DataType::Timestamp { timezone: None } => "DATETIME".to_string(),
            // MySQL has no interval type; approximated as text.
            DataType::Interval => "TEXT".to_string(),
            DataType::Geometry { geometry_type, .. } => {
                let srid = ctx.crs_id_for(column);
                if srid > 0 {
                    format!("{geometry_type} SRID {srid}")
                } else {
                    geometry_type.clone()
                }
            }
        }
    }

    fn try_align_schema_col(&self, old: &Column, new: &mut Column) -> bool {
        if matches!(old.data_type, DataType::Interval)
            && matches!(new.data_type, DataType::Text { .. })
        {
            new.data_type = DataType::Interval;
        }
        old.data_type == new.data_type
    }

    fn column_write_expr(&self, column: &Column, ctx: &TableContext, placeholder: &str) -> String {
        match &column.data_type {
            DataType::Geometry { .. } => {
                let srid = ctx.crs_id_for(column);
                format!("ST_GeomFromWKB({placeholder}, {srid})")
            }
            _ => placeholder.to_string(),
        }
    }

    fn column_read_expr(&self, column: &Column, _ctx: &TableContext) -> String {
        let quoted = self.quote(&column.name);
        match &column.data_type {
            DataType::Geometry { .. } => format!("ST_AsBinary({quoted})"),
            DataType::Numeric { .. } => format!("CAST({quoted} AS CHAR)"),
            _ => quoted,
        }
    }

    fn value_to_sql(&self, value: &Value, _column: &Column, _ctx: &TableContext) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Boolean(b) => SqlValue::Bool(*b),
            Value::Integer(i) => SqlValue::Int(*i),
            Value::Float(f) => SqlValue::Float(*f),
            Value::Text(s) => SqlValue::Text(s.clone()),
            Value::Blob(b) => SqlValue::Bytes(b.clone()),
            Value::Geometry(g) => {
                SqlValue::Bytes(g.to_wkb().map(<[u8]>::to_vec).unwrap_or_default())
            }
        }
    }

    fn sql_to_value(&self, value: SqlValue, column: &Column, _ctx: &TableContext) -> Result<Value> {
        Ok(match (&column.data_type, value) {
            (_, SqlValue::Null) => Value::Null,
            (DataType::Boolean, SqlValue::Int(i)) => Value::Boolean(i != 0),
            (DataType::Boolean, SqlValue::Bool(b)) => Value::Boolean(b),
            (DataType::Boolean, SqlValue::Bytes(b)) => {
                Value::Boolean(b.first().copied().unwrap_or(0) != 0)
            }
            (DataType::Integer { .. }, SqlValue::Int(i)) => Value::Integer(i),
            (DataType::Float { .. }, SqlValue::Float(f)) => Value::Float(f),
            (DataType::Float { .. }, SqlValue::Int(i)) => Value::Float(i as f64),
            (DataType::Geometry { .. }, SqlValue::Bytes(b)) => Value::Geometry(
                Geometry::from_wkb(&b).map_err(|e| crate::error::Error::GeometryError {
                    message: e.to_string(),
                })?,
            ),
            (DataType::Blob { .. }, SqlValue::Bytes(b)) => Value::Blob(b),
            (DataType::Text { .. }, SqlValue::Bytes(b)) => {
                Value::Text(String::from_utf8_lossy(&b).into_owned())
            }
            (_, SqlValue::Text(s)) => Value::Text(s),
            (_, SqlValue::Int(i)) => Value::Integer(i),
            (_, SqlValue::Float(f)) => Value::Float(f),
            (_, SqlValue::Bool(b)) => Value::Boolean(b),
            (_, SqlValue::Bytes(b)) => Value::Blob(b),
        })
    }

    fn create_table_sql(&self, ctx: &TableContext) -> Vec<String> {
        let has_int_pk = ctx.schema.has_int_pk();
        let mut columns: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .map(|col| {
                let mut spec = format!(
                    "{} {}",
                    self.quote(&col.name),
                    self.column_sql_type(col, ctx)
                );
                if col.pk_index.is_some() {
                    spec.push_str(" NOT NULL");
                    if has_int_pk {
                        spec.push_str(" AUTO_INCREMENT");
                    }
                }
                spec
            })
            .collect();
        let pk_names: Vec<String> = ctx
            .schema
            .pk_columns()
            .iter()
            .map(|col| self.quote(&col.name))
            .collect();
        if !pk_names.is_empty() {
            columns.push(format!("PRIMARY KEY ({})", pk_names.join(", ")));
        }
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table_identifier(&ctx.table_name),
            columns.join(", ")
        )]
    }

    fn create_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>> {
        let table = self.table_identifier(&ctx.table_name);
        let track = self.table_identifier(&self.write_prefix().table_name("track"));
        let pk = self.quote(&ctx.pk_column()?.name);
        let name_literal = ctx.table_name.replace('\'', "''");
        Ok(vec![
            format!(
                "CREATE TRIGGER {} AFTER INSERT ON {table} FOR EACH ROW \
                 REPLACE INTO {track} (table_name, pk) VALUES ('{name_literal}', NEW.{pk})",
                self.trigger_name(&ctx.table_name, "ins"),
            ),
            format!(
                "CREATE TRIGGER {} AFTER UPDATE ON {table} FOR EACH ROW \
                 REPLACE INTO {track} (table_name, pk) \
                 VALUES ('{name_literal}', OLD.{pk}), ('{name_literal}', NEW.{pk})",
                self.trigger_name(&ctx.table_name, "upd"),
            ),
            format!(
                "CREATE TRIGGER {} AFTER DELETE ON {table} FOR EACH ROW \
                 REPLACE INTO {track} (table_name, pk) VALUES ('{name_literal}', OLD.{pk})",
                self.trigger_name(&ctx.table_name, "del"),
            ),
        ])
    }

    fn drop_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        ["ins", "upd", "del"]
            .iter()
            .map(|suffix| {
                format!(
                    "DROP TRIGGER IF EXISTS {}",
                    self.trigger_name(&ctx.table_name, suffix)
                )
            })
            .collect()
    }

    fn meta_items(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
    ) -> Result<BTreeMap<String, ItemValue>> {
        let rows = session
            .query(
                "SELECT column_name, data_type, character_maximum_length, \
                        numeric_precision, numeric_scale, column_key \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
                &[
                    SqlValue::Text(self.db_name.clone()),
                    SqlValue::Text(ctx.table_name.clone()),
                ],
            )
            .map_err(sql_error)?;
        let mut columns = Vec::new();
        for row in rows {
            let Some(name) = row.first().and_then(|v| v.as_text()).map(String::from) else {
                continue;
            };
            let declared = row
                .get(1)
                .and_then(|v| v.as_text())
                .unwrap_or_default()
                .to_uppercase();
            let length = row.get(2).and_then(SqlValue::as_int).map(|v| v as u32);
            let precision = row.get(3).and_then(SqlValue::as_int).map(|v| v as u32);
            let scale = row.get(4).and_then(SqlValue::as_int).map(|v| v as u32);
            let data_type = match declared.as_str() {
                "BIT" => DataType::Boolean,
                "TINYINT" => DataType::Integer { size: 8 },
                "SMALLINT" => DataType::Integer { size: 16 },
                "INT" | "MEDIUMINT" => DataType::Integer { size: 32 },
                "BIGINT" => DataType::Integer { size: 64 },
                "FLOAT" => DataType::Float { size: 32 },
                "DOUBLE" => DataType::Float { size: 64 },
                "DECIMAL" | "NUMERIC" => DataType::Numeric { precision, scale },
                "DATE" => DataType::Date,
                "TIME" => DataType::Time,
                "TIMESTAMP" => DataType::Timestamp {
                    timezone: Some("UTC".to_string()),
                },
                "DATETIME" => DataType::Timestamp { timezone: None },
                "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                    DataType::Blob { length }
                }
                "GEOMETRY" | "POINT" | "LINESTRING" | "POLYGON" | "MULTIPOINT"
                | "MULTILINESTRING" | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => ctx
                    .schema
                    .column_by_name(&name)
                    .map(|col| col.data_type.clone())
                    .unwrap_or(DataType::Geometry {
                        geometry_type: declared.clone(),
                        crs_name: None,
                    }),
                "VARCHAR" | "CHAR" => DataType::Text { length },
                _ => DataType::Text { length: None },
            };
            let pk_index = ctx
                .schema
                .column_by_name(&name)
                .and_then(|col| col.pk_index)
                .or_else(|| {
                    (row.get(5).and_then(|v| v.as_text()) == Some("PRI")).then_some(0)
                });
            let id = ctx
                .schema
                .column_by_name(&name)
                .map(|col| col.id)
                .unwrap_or_else(|| encode_column_id(&name, &data_type, ctx.table_name.as_bytes()));
            columns.push(Column {
                id,
                name,
                data_type,
                pk_index,
            });
        }
        let mut items = BTreeMap::new();
        items.insert(
            "schema.json".to_string(),
            ItemValue::Json(Schema::new(columns).to_json()),
        );
        Ok(items)
    }

    fn table_exists(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
    ) -> std::result::Result<bool, SqlError> {
        let count = session.scalar_int(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?",
            &[
                SqlValue::Text(self.db_name.clone()),
                SqlValue::Text(table_name.to_string()),
            ],
        )?;
        Ok(count.unwrap_or(0) > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_location() {
        let adapter = MySqlAdapter::from_location("mysql://db.example.com:3306/my_repo").unwrap();
        assert_eq!(adapter.db_name, "my_repo");
        assert!(MySqlAdapter::from_location("mysql://hostonly").is_err());
        assert!(MySqlAdapter::from_location("postgresql://h/d").is_err());
    }

    #[test]
    fn test_quote_uses_backticks() {
        let adapter = MySqlAdapter::from_location("mysql://h/d").unwrap();
        assert_eq!(adapter.quote("ta`ble"), "`ta``ble`");
        assert_eq!(adapter.table_identifier("t"), "`d`.`t`");
    }

    #[test]
    fn test_interval_approximated_as_text() {
        let adapter = MySqlAdapter::from_location("mysql://h/d").unwrap();
        let old = Column::new("gap", DataType::Interval, None);
        let mut new = Column::new("gap", DataType::Text { length: None }, None);
        assert!(adapter.try_align_schema_col(&old, &mut new));
    }
}
