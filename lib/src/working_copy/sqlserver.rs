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
//! SQL Server working copy.
//!
//! The working copy is a schema inside a SQL Server database, given as
//! `mssql://HOST[:PORT]/DBNAME/DBSCHEMA`. Tracking uses one `AFTER INSERT,
//! UPDATE, DELETE` trigger per table that `MERGE`s into the track table.
//! The TDS client is async; each session owns a current-thread runtime and
//! blocks on it, keeping the public surface synchronous like the other
//! backends. TDS offers no geometry subtype constraint, so only the SRID is
//! carried (on the stored values themselves).

use std::collections::BTreeMap;

use tiberius::ColumnData;
use tokio_util::compat::Compat;
use tokio_util::compat::TokioAsyncWriteCompatExt as _;

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

pub type SqlServerWorkingCopy = SqlWorkingCopy<SqlServerAdapter>;

pub fn new_sqlserver_working_copy(
    location: &str,
    store: std::sync::Arc<crate::store::Store>,
) -> Result<SqlServerWorkingCopy> {
    let adapter = SqlServerAdapter::from_location(location)?;
    Ok(SqlWorkingCopy::new(adapter, store))
}

#[derive(Debug)]
pub struct SqlServerAdapter {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    db_name: String,
    db_schema: String,
}

impl SqlServerAdapter {
    pub fn from_location(location: &str) -> Result<Self> {
        let bad = || {
            crate::error::Error::invalid_operation(
                "Expected a SQL Server working copy location in the form \
                 mssql://HOST[:PORT]/DBNAME/DBSCHEMA"
                    .to_string(),
            )
        };
        let rest = location.strip_prefix("mssql://").ok_or_else(bad)?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().unwrap_or_default();
        let db_name = parts.next().ok_or_else(bad)?;
        let db_schema = parts.next().ok_or_else(bad)?;
        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
                (
                    Some((user.to_string(), password.to_string())),
                    host_port,
                )
            }
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().map_err(|_| bad())?),
            None => (host_port.to_string(), 1433),
        };
        Ok(Self {
            host,
            port,
            credentials,
            db_name: db_name.to_string(),
            db_schema: db_schema.to_string(),
        })
    }

    fn trigger_name(&self, table_name: &str) -> String {
        format!(
            "{}.{}",
            self.quote(&self.db_schema),
            self.quote(&format!("_kart_trk_{table_name}"))
        )
    }
}

struct SqlServerSession {
    runtime: tokio::runtime::Runtime,
    client: tiberius::Client<Compat<tokio::net::TcpStream>>,
}

fn to_tds(value: &SqlValue) -> ColumnData<'static> {
    match value {
        SqlValue::Null => ColumnData::String(None),
        SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
        SqlValue::Int(i) => ColumnData::I64(Some(*i)),
        SqlValue::Float(f) => ColumnData::F64(Some(*f)),
        SqlValue::Text(s) => ColumnData::String(Some(s.clone().into())),
        SqlValue::Bytes(b) => ColumnData::Binary(Some(b.clone().into())),
    }
}

#[derive(Debug)]
struct TdsValue(ColumnData<'static>);

impl tiberius::ToSql for TdsValue {
    fn to_sql(&self) -> ColumnData<'_> {
        self.0.clone()
    }
}

fn from_tds(value: ColumnData<'_>) -> SqlValue {
    match value {
        ColumnData::Bit(v) => v.map_or(SqlValue::Null, SqlValue::Bool),
        ColumnData::U8(v) => v.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
        ColumnData::I16(v) => v.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
        ColumnData::I32(v) => v.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
        ColumnData::I64(v) => v.map_or(SqlValue::Null, SqlValue::Int),
        ColumnData::F32(v) => v.map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))),
        ColumnData::F64(v) => v.map_or(SqlValue::Null, SqlValue::Float),
        ColumnData::String(v) => v.map_or(SqlValue::Null, |v| SqlValue::Text(v.into_owned())),
        ColumnData::Binary(v) => v.map_or(SqlValue::Null, |v| SqlValue::Bytes(v.into_owned())),
        _ => SqlValue::Null,
    }
}

impl SqlSession for SqlServerSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> std::result::Result<u64, SqlError> {
        let params: Vec<TdsValue> = params.iter().map(|v| TdsValue(to_tds(v))).collect();
        let refs: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|p| p as &dyn tiberius::ToSql).collect();
        let result = self
            .runtime
            .block_on(self.client.execute(sql, &refs))
            .map_err(SqlError::query)?;
        Ok(result.total())
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Vec<SqlRow>, SqlError> {
        let params: Vec<TdsValue> = params.iter().map(|v| TdsValue(to_tds(v))).collect();
        let refs: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|p| p as &dyn tiberius::ToSql).collect();
        let rows = self
            .runtime
            .block_on(async {
                let stream = self.client.query(sql, &refs).await?;
                stream.into_first_result().await
            })
            .map_err(SqlError::query)?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().map(from_tds).collect())
            .collect())
    }

    fn begin(&mut self) -> std::result::Result<(), SqlError> {
        self.runtime
            .block_on(self.client.simple_query("BEGIN TRANSACTION"))
            .map_err(SqlError::query)?;
        Ok(())
    }

    fn commit(&mut self) -> std::result::Result<(), SqlError> {
        self.runtime
            .block_on(self.client.simple_query("COMMIT TRANSACTION"))
            .map_err(SqlError::query)?;
        Ok(())
    }

    fn rollback(&mut self) -> std::result::Result<(), SqlError> {
        self.runtime
            .block_on(self.client.simple_query("ROLLBACK TRANSACTION"))
            .map_err(SqlError::query)?;
        Ok(())
    }
}

impl SqlAdapter for SqlServerAdapter {
    fn backend_name(&self) -> &'static str {
        "SQL Server"
    }

    fn write_prefix(&self) -> TablePrefix {
        TablePrefix::Kart
    }

    fn db_schema(&self) -> Option<&str> {
        Some(&self.db_schema)
    }

    fn key_column_type(&self) -> &'static str {
        "NVARCHAR(400)"
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::AtP
    }

    fn quote(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn connect(&self) -> std::result::Result<Box<dyn SqlSession>, SqlError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SqlError::connect)?;
        let mut config = tiberius::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.db_name);
        if let Some((user, password)) = &self.credentials {
            config.authentication(tiberius::AuthMethod::sql_server(user, password));
        }
        config.trust_cert();
        let client = runtime
            .block_on(async {
                let tcp = tokio::net::TcpStream::connect(config.get_addr()).await?;
                tcp.set_nodelay(true)?;
                tiberius::Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(std::io::Error::other)
            })
            .map_err(SqlError::connect)?;
        Ok(Box::new(SqlServerSession { runtime, client }))
    }

    fn initialise_sql(&self) -> Vec<String> {
        let schema_literal = self.db_schema.replace('\'', "''");
        vec![format!(
            "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = '{schema_literal}') \
             EXEC('CREATE SCHEMA {}')",
            self.quote(&self.db_schema)
        )]
    }

    fn column_sql_type(&self, column: &Column, _ctx: &TableContext) -> String {
        match &column.data_type {
            DataType::Boolean => "BIT".to_string(),
            DataType::Integer { size: 8 } => "TINYINT".to_string(),
            DataType::Integer { size: 16 } => "SMALLINT".to_string(),
            DataType::Integer { size: 32 } => "INT".to_string(),
            DataType::Integer { .. } => "BIGINT".to_string(),
            DataType::Float { size: 32 } => "REAL".to_string(),
            DataType::Float { .. } => "FLOAT".to_string(),
            DataType::Numeric {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({p},{s})"),
            DataType::Numeric { .. } => "NUMERIC".to_string(),
            DataType::Text { length: Some(n) } if *n <= 4000 => format!("NVARCHAR({n})"),
            DataType::Text { .. } => "NVARCHAR(MAX)".to_string(),
            DataType::Blob { length: Some(n) } if *n <= 8000 => format!("VARBINARY({n})"),
            DataType::Blob { .. } => "VARBINARY(MAX)".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Time => "TIME".to_string(),
            DataType::Timestamp { timezone: Some(_) } => "DATETIMEOFFSET".to_string(),
            DataType::Timestamp { timezone: None } => "DATETIME2".to_string(),
            // SQL Server has no interval type; approximated as text.
            DataType::Interval => "NVARCHAR(MAX)".to_string(),
            DataType::Geometry { .. } => "GEOMETRY".to_string(),
        }
    }

    fn try_align_schema_col(&self, old: &Column, new: &mut Column) -> bool {
        if matches!(old.data_type, DataType::Interval)
            && matches!(new.data_type, DataType::Text { .. })
        {
            new.data_type = DataType::Interval;
        }
        // The geometry subtype and CRS attachment are not declared in TDS;
        // they round-trip via the committed schema.
        if let (
            DataType::Geometry { .. },
            DataType::Geometry {
                geometry_type,
                crs_name,
            },
        ) = (&old.data_type, &mut new.data_type)
        {
            if let DataType::Geometry {
                geometry_type: old_type,
                crs_name: old_crs,
            } = &old.data_type
            {
                geometry_type.clone_from(old_type);
                crs_name.clone_from(old_crs);
            }
        }
        old.data_type == new.data_type
    }

    fn column_write_expr(&self, column: &Column, ctx: &TableContext, placeholder: &str) -> String {
        match &column.data_type {
            DataType::Geometry { .. } => {
                let srid = ctx.crs_id_for(column);
                format!("geometry::STGeomFromWKB({placeholder}, {srid})")
            }
            DataType::Date
            | DataType::Time
            | DataType::Timestamp { .. }
            | DataType::Numeric { .. } => {
                format!(
                    "CAST({placeholder} AS {})",
                    self.column_sql_type(column, ctx)
                )
            }
            _ => placeholder.to_string(),
        }
    }

    fn column_read_expr(&self, column: &Column, _ctx: &TableContext) -> String {
        let quoted = self.quote(&column.name);
        match &column.data_type {
            DataType::Geometry { .. } => format!("{quoted}.STAsBinary()"),
            DataType::Date
            | DataType::Time
            | DataType::Timestamp { .. }
            | DataType::Numeric { .. } => format!("CAST({quoted} AS NVARCHAR(MAX))"),
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
            (DataType::Boolean, SqlValue::Int(i)) => Value::Boolean(i != 0),
            (DataType::Integer { .. }, SqlValue::Int(i)) => Value::Integer(i),
            (DataType::Float { .. }, SqlValue::Float(f)) => Value::Float(f),
            (DataType::Float { .. }, SqlValue::Int(i)) => Value::Float(i as f64),
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
                let mut spec = format!(
                    "{} {}",
                    self.quote(&col.name),
                    self.column_sql_type(col, ctx)
                );
                if col.pk_index.is_some() {
                    spec.push_str(" NOT NULL");
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
            "CREATE TABLE {} ({})",
            self.table_identifier(&ctx.table_name),
            columns.join(", ")
        )]
    }

    fn drop_table_sql(&self, ctx: &TableContext) -> Vec<String> {
        vec![format!(
            "IF OBJECT_ID('{}', 'U') IS NOT NULL DROP TABLE {}",
            format!("{}.{}", self.db_schema, ctx.table_name).replace('\'', "''"),
            self.table_identifier(&ctx.table_name)
        )]
    }

    fn create_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>> {
        let table = self.table_identifier(&ctx.table_name);
        let track = self.table_identifier(&self.write_prefix().table_name("track"));
        let pk = self.quote(&ctx.pk_column()?.name);
        let name_literal = ctx.table_name.replace('\'', "''");
        // Placeholders are not allowed in CREATE TRIGGER; literals are
        // inlined.
        Ok(vec![format!(
            "CREATE TRIGGER {trigger} ON {table} \
             AFTER INSERT, UPDATE, DELETE AS \
             BEGIN \
                 MERGE {track} TRA \
                 USING \
                     (SELECT '{name_literal}', {pk} FROM inserted \
                     UNION SELECT '{name_literal}', {pk} FROM deleted) \
                     AS SRC (table_name, pk) \
                 ON SRC.table_name = TRA.table_name AND SRC.pk = TRA.pk \
                 WHEN NOT MATCHED THEN INSERT (table_name, pk) \
                 VALUES (SRC.table_name, SRC.pk); \
             END;",
            trigger = self.trigger_name(&ctx.table_name),
        )])
    }

    fn drop_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        let object = format!("{}._kart_trk_{}", self.db_schema, ctx.table_name)
            .replace('\'', "''");
        vec![format!(
            "IF OBJECT_ID('{object}', 'TR') IS NOT NULL DROP TRIGGER {}",
            self.trigger_name(&ctx.table_name)
        )]
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
                 WHERE table_schema = @P1 AND table_name = @P2 \
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
            let length = row
                .get(2)
                .and_then(SqlValue::as_int)
                .filter(|n| *n > 0)
                .map(|v| v as u32);
            let precision = row.get(3).and_then(SqlValue::as_int).map(|v| v as u32);
            let scale = row.get(4).and_then(SqlValue::as_int).map(|v| v as u32);
            let data_type = match declared.as_str() {
                "BIT" => DataType::Boolean,
                "TINYINT" => DataType::Integer { size: 8 },
                "SMALLINT" => DataType::Integer { size: 16 },
                "INT" => DataType::Integer { size: 32 },
                "BIGINT" => DataType::Integer { size: 64 },
                "REAL" => DataType::Float { size: 32 },
                "FLOAT" => DataType::Float { size: 64 },
                "DECIMAL" | "NUMERIC" => DataType::Numeric { precision, scale },
                "DATE" => DataType::Date,
                "TIME" => DataType::Time,
                "DATETIMEOFFSET" => DataType::Timestamp {
                    timezone: Some("UTC".to_string()),
                },
                "DATETIME" | "DATETIME2" | "SMALLDATETIME" => {
                    DataType::Timestamp { timezone: None }
                }
                "BINARY" | "VARBINARY" | "IMAGE" => DataType::Blob { length },
                "GEOMETRY" | "GEOGRAPHY" => ctx
                    .schema
                    .column_by_name(&name)
                    .map(|col| col.data_type.clone())
                    .unwrap_or(DataType::Geometry {
                        geometry_type: "GEOMETRY".to_string(),
                        crs_name: None,
                    }),
                "NVARCHAR" | "VARCHAR" | "NCHAR" | "CHAR" | "NTEXT" | "TEXT" => {
                    DataType::Text { length }
                }
                _ => DataType::Text { length: None },
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
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema = @P1 AND table_name = @P2",
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
            SqlServerAdapter::from_location("mssql://db.example.com:1433/gis/my_repo").unwrap();
        assert_eq!(adapter.host, "db.example.com");
        assert_eq!(adapter.port, 1433);
        assert_eq!(adapter.db_name, "gis");
        assert_eq!(adapter.db_schema, "my_repo");
        let defaulted = SqlServerAdapter::from_location("mssql://host/gis/s").unwrap();
        assert_eq!(defaulted.port, 1433);
        assert!(SqlServerAdapter::from_location("mssql://host/gis").is_err());
    }

    #[test]
    fn test_quote_uses_brackets() {
        let adapter = SqlServerAdapter::from_location("mssql://h/d/s").unwrap();
        assert_eq!(adapter.quote("ta]ble"), "[ta]]ble]");
        assert_eq!(adapter.table_identifier("t"), "[s].[t]");
    }

    #[test]
    fn test_merge_trigger_sql_shape() {
        let adapter = SqlServerAdapter::from_location("mssql://h/d/s").unwrap();
        let schema = Schema::new(vec![Column::new(
            "fid",
            DataType::Integer { size: 64 },
            Some(0),
        )]);
        let ctx = TableContext {
            table_name: "points".to_string(),
            schema,
            crs_ids: Default::default(),
            crs_definitions: Default::default(),
            pk_demoted: false,
        };
        let sql = adapter.create_triggers_sql(&ctx).unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("AFTER INSERT, UPDATE, DELETE"));
        assert!(sql[0].contains("MERGE [s].[_kart_track] TRA"));
        assert!(sql[0].contains("WHEN NOT MATCHED THEN INSERT"));
    }
}
