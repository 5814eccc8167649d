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
//! PostgreSQL / PostGIS working copy.
//!
//! The working copy is a schema (namespace) inside a PostgreSQL database,
//! given as `postgresql://HOST/DBNAME/DBSCHEMA`. Tracking uses one trigger
//! function shared by all tables. Geometry columns use PostGIS typmods
//! (`GEOMETRY(POINT, 2193)`), which enforce the declared subtype and CRS id
//! the way a CHECK constraint would.

use std::collections::BTreeMap;

use postgres::NoTls;
use postgres::types::IsNull;
use postgres::types::ToSql;
use postgres::types::Type;
use postgres::types::to_sql_checked;

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

pub type PostgresWorkingCopy = SqlWorkingCopy<PostgresAdapter>;

pub fn new_postgres_working_copy(
    location: &str,
    store: std::sync::Arc<crate::store::Store>,
) -> Result<PostgresWorkingCopy> {
    let adapter = PostgresAdapter::from_location(location)?;
    Ok(SqlWorkingCopy::new(adapter, store))
}

#[derive(Debug)]
pub struct PostgresAdapter {
    /// Connection URL without the trailing schema component.
    url: String,
    db_schema: String,
}

impl PostgresAdapter {
    /// Splits `postgresql://HOST[:PORT]/DBNAME/DBSCHEMA` into the database
    /// URL and the working-copy schema.
    pub fn from_location(location: &str) -> Result<Self> {
        let rest = location
            .strip_prefix("postgresql://")
            .ok_or_else(|| crate::error::Error::invalid_operation(
                "PostgreSQL working copy location must start with postgresql://".to_string(),
            ))?;
        let mut parts = rest.splitn(3, '/');
        let host = parts.next().unwrap_or_default();
        let dbname = parts.next();
        let db_schema = parts.next();
        let (Some(dbname), Some(db_schema)) = (dbname, db_schema) else {
            return Err(crate::error::Error::invalid_operation(
                "Expected a PostgreSQL working copy location in the form \
                 postgresql://HOST[:PORT]/DBNAME/DBSCHEMA"
                    .to_string(),
            ));
        };
        Ok(Self {
            url: format!("postgresql://{host}/{dbname}"),
            db_schema: db_schema.to_string(),
        })
    }

    fn track_trigger_function(&self) -> String {
        format!(
            "{}.{}",
            self.quote(&self.db_schema),
            self.quote("_kart_track_proc")
        )
    }
}

/// Binds a [`SqlValue`] to whatever parameter type the prepared statement
/// expects; nulls bind to any type.
#[derive(Debug)]
struct PgValue<'a>(&'a SqlValue);

impl ToSql for PgValue<'_> {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut postgres::types::private::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Int(i) => match *ty {
                Type::INT2 => (*i as i16).to_sql(ty, out),
                Type::INT4 => (*i as i32).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            SqlValue::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            SqlValue::Text(s) => s.as_str().to_sql(ty, out),
            SqlValue::Bytes(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

struct PostgresSession {
    client: postgres::Client,
}

fn pg_params(values: &[SqlValue]) -> Vec<PgValue<'_>> {
    values.iter().map(PgValue).collect()
}

fn pg_row_to_sql_row(row: &postgres::Row) -> std::result::Result<SqlRow, SqlError> {
    let mut cells = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let cell = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, SqlValue::Bool),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, SqlValue::Int),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, SqlValue::Float),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, SqlValue::Bytes),
            _ => row
                .try_get::<_, Option<String>>(i)
                .map_err(SqlError::query)?
                .map_or(SqlValue::Null, SqlValue::Text),
        };
        cells.push(cell);
    }
    Ok(cells)
}

impl SqlSession for PostgresSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> std::result::Result<u64, SqlError> {
        let params = pg_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client.execute(sql, &refs).map_err(SqlError::query)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Vec<SqlRow>, SqlError> {
        let params = pg_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(sql, &refs).map_err(SqlError::query)?;
        rows.iter().map(pg_row_to_sql_row).collect()
    }

    fn begin(&mut self) -> std::result::Result<(), SqlError> {
        self.client.batch_execute("BEGIN").map_err(SqlError::query)
    }

    fn commit(&mut self) -> std::result::Result<(), SqlError> {
        self.client.batch_execute("COMMIT").map_err(SqlError::query)
    }

    fn rollback(&mut self) -> std::result::Result<(), SqlError> {
        self.client
            .batch_execute("ROLLBACK")
            .map_err(SqlError::query)
    }
}

impl SqlAdapter for PostgresAdapter {
    fn backend_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn write_prefix(&self) -> TablePrefix {
        TablePrefix::Kart
    }

    fn db_schema(&self) -> Option<&str> {
        Some(&self.db_schema)
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn connect(&self) -> std::result::Result<Box<dyn SqlSession>, SqlError> {
        let client = postgres::Client::connect(&self.url, NoTls).map_err(SqlError::connect)?;
        Ok(Box::new(PostgresSession { client }))
    }

    fn initialise_sql(&self) -> Vec<String> {
        let track = self.table_identifier(&self.write_prefix().table_name("track"));
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote(&self.db_schema)),
            format!(
                r#"CREATE OR REPLACE FUNCTION {func}()
    RETURNS TRIGGER AS $body$
DECLARE
    pk_field text := quote_ident(TG_ARGV[0]);
    pk_old text;
    pk_new text;
BEGIN
    IF (TG_OP = 'INSERT' OR TG_OP = 'UPDATE') THEN
        EXECUTE 'SELECT $1.' || pk_field USING NEW INTO pk_new;

        INSERT INTO {track} (table_name,pk) VALUES
        (TG_TABLE_NAME::TEXT, pk_new)
        ON CONFLICT DO NOTHING;
    END IF;
    IF (TG_OP = 'UPDATE' OR TG_OP = 'DELETE') THEN
        EXECUTE 'SELECT $1.' || pk_field USING OLD INTO pk_old;

        INSERT INTO {track} (table_name,pk) VALUES
        (TG_TABLE_NAME::TEXT, pk_old)
        ON CONFLICT DO NOTHING;

        IF (TG_OP = 'DELETE') THEN
            RETURN OLD;
        END IF;
    END IF;
    RETURN NEW;
END;
$body$
LANGUAGE plpgsql
SECURITY DEFINER"#,
                func = self.track_trigger_function(),
            ),
        ]
    }

    fn column_sql_type(&self, column: &Column, ctx: &TableContext) -> String {
        match &column.data_type {
            DataType::Boolean => "BOOLEAN".to_string(),
            // PostgreSQL has no int8; approximated as SMALLINT.
            DataType::Integer { size: 8 | 16 } => "SMALLINT".to_string(),
            DataType::Integer { size: 32 } => "INTEGER".to_string(),
            DataType::Integer { .. } => "BIGINT".to_string(),
            DataType::Float { size: 32 } => "REAL".to_string(),
            DataType::Float { .. } => "DOUBLE PRECISION".to_string(),
            DataType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({p},{s})"),
            DataType::Numeric { .. } => "NUMERIC".to_string(),
            DataType::Text { length: Some(n) } => format!("VARCHAR({n})"),
            DataType::Text { length: None } => "TEXT".to_string(),
            DataType::Blob { .. } => "BYTEA".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Time => "TIME".to_string(),
            DataType::Timestamp { timezone: Some(_) } => "TIMESTAMPTZ".to_string(),
            DataType::Timestamp { timezone: None } => "TIMESTAMP".to_string(),
            DataType::Interval => "INTERVAL".to_string(),
            DataType::Geometry { geometry_type, .. } => {
                let srid = ctx.crs_id_for(column);
                format!("GEOMETRY({geometry_type},{srid})")
            }
        }
    }

    fn try_align_schema_col(&self, old: &Column, new: &mut Column) -> bool {
        // int8 round-trips as int16.
        if let (DataType::Integer { size: 8 }, DataType::Integer { size: size @ 16 }) =
            (&old.data_type, &mut new.data_type)
        {
            *size = 8;
        }
        old.data_type == new.data_type
    }

    fn column_write_expr(&self, column: &Column, ctx: &TableContext, placeholder: &str) -> String {
        match &column.data_type {
            DataType::Geometry { .. } => {
                let srid = ctx.crs_id_for(column);
                format!("ST_GeomFromWKB({placeholder}, {srid})")
            }
            DataType::Date
            | DataType::Time
            | DataType::Timestamp { .. }
            | DataType::Interval
            | DataType::Numeric { .. } => {
                format!("CAST({placeholder} AS {})", self.column_sql_type(column, ctx))
            }
            _ => placeholder.to_string(),
        }
    }

    fn column_read_expr(&self, column: &Column, _ctx: &TableContext) -> String {
        let quoted = self.quote(&column.name);
        match &column.data_type {
            DataType::Geometry { .. } => format!("ST_AsBinary({quoted})"),
            DataType::Date
            | DataType::Time
            | DataType::Timestamp { .. }
            | DataType::Interval
            | DataType::Numeric { .. } => format!("{quoted}::text"),
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
            (DataType::Boolean, SqlValue::Bool(b)) => Value::Boolean(b),
            (DataType::Integer { .. }, SqlValue::Int(i)) => Value::Integer(i),
            (DataType::Float { .. }, SqlValue::Float(f)) => Value::Float(f),
            (DataType::Geometry { .. }, SqlValue::Bytes(b)) => Value::Geometry(
                Geometry::from_wkb(&b).map_err(|e| crate::error::Error::GeometryError {
                    message: e.to_string(),
                })?,
            ),
            (DataType::Blob { .. }, SqlValue::Bytes(b)) => Value::Blob(b),
            (_, SqlValue::Text(s)) => Value::Text(s),
            (_, SqlValue::Int(i)) => Value::Integer(i),
            (_, SqlValue::Float(f)) => Value::Float(f),
            (_, SqlValue::Bool(b)) => Value::Boolean(b),
            (_, SqlValue::Bytes(b)) => Value::Blob(b),
        })
    }

    fn create_table_sql(&self, ctx: &TableContext) -> Vec<String> {
        let mut columns: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .map(|col| {
                format!(
                    "{} {}",
                    self.quote(&col.name),
                    self.column_sql_type(col, ctx)
                )
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
        let pk = ctx.pk_column()?.name.replace('\'', "''");
        Ok(vec![format!(
            "CREATE TRIGGER {trigger} \
             AFTER INSERT OR UPDATE OR DELETE ON {table} \
             FOR EACH ROW EXECUTE PROCEDURE {func}('{pk}')",
            trigger = self.quote("_kart_track_trigger"),
            table = self.table_identifier(&ctx.table_name),
            func = self.track_trigger_function(),
        )])
    }

    fn drop_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        vec![format!(
            "DROP TRIGGER IF EXISTS {trigger} ON {table}",
            trigger = self.quote("_kart_track_trigger"),
            table = self.table_identifier(&ctx.table_name),
        )]
    }

    fn suspend_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {table} DISABLE TRIGGER {trigger}",
            table = self.table_identifier(&ctx.table_name),
            trigger = self.quote("_kart_track_trigger"),
        )]
    }

    fn resume_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {table} ENABLE TRIGGER {trigger}",
            table = self.table_identifier(&ctx.table_name),
            trigger = self.quote("_kart_track_trigger"),
        )])
    }

    fn supported_meta_items(&self) -> &'static [&'static str] {
        // PostGIS has nowhere obvious to put titles or descriptions.
        &["schema.json"]
    }

    fn meta_items(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
    ) -> Result<BTreeMap<String, ItemValue>> {
        let rows = session
            .query(
                "SELECT column_name, data_type, character_maximum_length, \
                        numeric_precision, numeric_scale \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[
                    SqlValue::Text(self.db_schema.clone()),
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
                "BOOLEAN" => DataType::Boolean,
                "SMALLINT" => DataType::Integer { size: 16 },
                "INTEGER" => DataType::Integer { size: 32 },
                "BIGINT" => DataType::Integer { size: 64 },
                "REAL" => DataType::Float { size: 32 },
                "DOUBLE PRECISION" => DataType::Float { size: 64 },
                "NUMERIC" => DataType::Numeric { precision, scale },
                "BYTEA" => DataType::Blob { length: None },
                "DATE" => DataType::Date,
                t if t.starts_with("TIME WITHOUT") || t == "TIME" => DataType::Time,
                t if t.starts_with("TIMESTAMP WITH") => DataType::Timestamp {
                    timezone: Some("UTC".to_string()),
                },
                t if t.starts_with("TIMESTAMP") => DataType::Timestamp { timezone: None },
                "INTERVAL" => DataType::Interval,
                "USER-DEFINED" => {
                    // PostGIS geometry; recover the typmod details from the
                    // committed schema where possible.
                    ctx.schema
                        .column_by_name(&name)
                        .map(|col| col.data_type.clone())
                        .unwrap_or(DataType::Geometry {
                            geometry_type: "GEOMETRY".to_string(),
                            crs_name: None,
                        })
                }
                _ => DataType::Text { length },
            };
            let pk_index = ctx
                .schema
                .column_by_name(&name)
                .and_then(|col| col.pk_index);
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
            "SELECT count(*)::bigint FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2",
            &[
                SqlValue::Text(self.db_schema.clone()),
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
        let adapter =
            PostgresAdapter::from_location("postgresql://localhost:5432/gis/my_repo").unwrap();
        assert_eq!(adapter.url, "postgresql://localhost:5432/gis");
        assert_eq!(adapter.db_schema, "my_repo");
        assert!(PostgresAdapter::from_location("postgresql://localhost/gis").is_err());
        assert!(PostgresAdapter::from_location("mysql://x/y/z").is_err());
    }

    #[test]
    fn test_type_map() {
        let adapter = PostgresAdapter::from_location("postgresql://h/d/s").unwrap();
        let ctx_schema = Schema::new(vec![Column::new(
            "fid",
            DataType::Integer { size: 64 },
            Some(0),
        )]);
        let ctx = TableContext {
            table_name: "t".to_string(),
            schema: ctx_schema,
            crs_ids: Default::default(),
            crs_definitions: Default::default(),
            pk_demoted: false,
        };
        let int8 = Column::new("a", DataType::Integer { size: 8 }, None);
        assert_eq!(adapter.column_sql_type(&int8, &ctx), "SMALLINT");
        let ts = Column::new(
            "b",
            DataType::Timestamp {
                timezone: Some("UTC".to_string()),
            },
            None,
        );
        assert_eq!(adapter.column_sql_type(&ts, &ctx), "TIMESTAMPTZ");
    }

    #[test]
    fn test_int8_approximation_aligns() {
        let adapter = PostgresAdapter::from_location("postgresql://h/d/s").unwrap();
        let old = Column::new("age", DataType::Integer { size: 8 }, None);
        let mut new = Column::new("age", DataType::Integer { size: 16 }, None);
        assert!(adapter.try_align_schema_col(&old, &mut new));
        assert_eq!(new.data_type, DataType::Integer { size: 8 });
    }
}
