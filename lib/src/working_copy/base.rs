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
//! The shared engine behind every SQL-based working copy.
//!
//! A backend contributes an [`SqlAdapter`]: connection, dialect, type maps,
//! trigger SQL and backend-specific meta handling. Everything else — the
//! state machine, tracking semantics, reset/diff/soft-reset logic — lives
//! here and is identical across GeoPackage, PostgreSQL, MySQL and SQL
//! Server.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use blake2::Blake2b512;
use digest::Digest as _;
use tracing::debug;
use tracing::instrument;

use crate::backend::TreeId;
use crate::crs::get_identifier_int;
use crate::dataset::Dataset;
use crate::diff::DatasetDiff;
use crate::diff::Delta;
use crate::diff::DeltaDiff;
use crate::diff::DeltaKind;
use crate::diff::ItemValue;
use crate::diff::RepoDiff;
use crate::diff::find_renames;
use crate::error::Error;
use crate::error::Result;
use crate::object_id::ObjectId as _;
use crate::schema::Column;
use crate::schema::DataType;
use crate::schema::Schema;
use crate::spatial_filter::SpatialFilter;
use crate::store::Store;
use crate::structure::RepositoryStructure;
use crate::structure::pk_of;
use crate::structure::resolve_filter_for_table;
use crate::tabular::Row;
use crate::tabular::codec;
use crate::tabular::codec::Legend;
use crate::tabular::dataset::TableDataset;
use crate::value::Value;
use crate::value::pk_to_track_text;
use crate::working_copy::sql_session::PlaceholderStyle;
use crate::working_copy::sql_session::SqlError;
use crate::working_copy::sql_session::SqlSession;
use crate::working_copy::sql_session::SqlValue;
use crate::working_copy::table_defs;
use crate::working_copy::table_defs::TablePrefix;

/// Per-dataset context shared by adapter calls: the live table name, the
/// schema, and the integer CRS id of each geometry column.
pub struct TableContext {
    pub table_name: String,
    pub schema: Schema,
    pub crs_ids: HashMap<String, i32>,
    pub crs_definitions: BTreeMap<String, String>,
    pub pk_demoted: bool,
}

impl TableContext {
    pub fn for_dataset(dataset: &TableDataset) -> Result<Self> {
        let crs_definitions = dataset.crs_definitions()?;
        let mut crs_ids = HashMap::new();
        for col in dataset.schema().geometry_columns() {
            if let DataType::Geometry {
                crs_name: Some(crs_name),
                ..
            } = &col.data_type
            {
                let id = crs_definitions
                    .get(crs_name)
                    .map(|wkt| get_identifier_int(wkt))
                    .or_else(|| {
                        crs_name
                            .split_once(':')
                            .and_then(|(_, code)| code.parse().ok())
                    })
                    .unwrap_or(0);
                crs_ids.insert(col.name.clone(), id);
            }
        }
        let schema = dataset.schema().clone();
        let pk_demoted = !schema.has_int_pk();
        Ok(Self {
            table_name: dataset.path().to_string(),
            schema,
            crs_ids,
            crs_definitions,
            pk_demoted,
        })
    }

    pub fn crs_id_for(&self, column: &Column) -> i32 {
        self.crs_ids.get(&column.name).copied().unwrap_or(0)
    }

    pub fn pk_column(&self) -> Result<&Column> {
        self.schema
            .first_pk_column()
            .ok_or_else(|| Error::schema_violation(format!("{} has no primary key", self.table_name)))
    }
}

/// What a concrete backend contributes to [`SqlWorkingCopy`].
pub trait SqlAdapter {
    fn backend_name(&self) -> &'static str;

    /// The prefix the state/track tables are written with.
    fn write_prefix(&self) -> TablePrefix;

    /// Prefixes recognised when reading an existing working copy.
    fn read_prefixes(&self) -> &'static [TablePrefix] {
        TablePrefix::read_order_flat()
    }

    /// Database schema (namespace) the working copy lives in, if any.
    fn db_schema(&self) -> Option<&str> {
        None
    }

    /// Key-column type of the state/track tables.
    fn key_column_type(&self) -> &'static str {
        "TEXT"
    }

    fn placeholder_style(&self) -> PlaceholderStyle;

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn connect(&self) -> std::result::Result<Box<dyn SqlSession>, SqlError>;

    /// Statements run once at `create_and_initialise`: namespace/database
    /// creation, backend-wide helper objects (the PostgreSQL trigger
    /// function, the GeoPackage spec tables).
    fn initialise_sql(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether this backend replaces a non-integer primary key with a
    /// synthetic integer one (GPKG requires an INTEGER key).
    fn demotes_non_int_pk(&self) -> bool {
        false
    }

    /// The SQL type for a column, including any approximation the backend
    /// needs.
    fn column_sql_type(&self, column: &Column, ctx: &TableContext) -> String;

    /// Undo a known type approximation when comparing a round-tripped column
    /// against the committed one; returns true when the columns should count
    /// as the same.
    fn try_align_schema_col(&self, old: &Column, new: &mut Column) -> bool;

    /// The expression to write a bound parameter into a column (geometry
    /// columns wrap the placeholder in a from-WKB constructor).
    fn column_write_expr(&self, column: &Column, ctx: &TableContext, placeholder: &str) -> String {
        let _ = (column, ctx);
        placeholder.to_string()
    }

    /// The expression to read a column back out (geometry columns convert to
    /// WKB).
    fn column_read_expr(&self, column: &Column, ctx: &TableContext) -> String {
        let _ = ctx;
        self.quote(&column.name)
    }

    fn value_to_sql(&self, value: &Value, column: &Column, ctx: &TableContext) -> SqlValue;

    fn sql_to_value(&self, value: SqlValue, column: &Column, ctx: &TableContext) -> Result<Value>;

    /// `CREATE TABLE` plus any per-table companion statements.
    fn create_table_sql(&self, ctx: &TableContext) -> Vec<String>;

    fn drop_table_sql(&self, ctx: &TableContext) -> Vec<String> {
        vec![format!(
            "DROP TABLE IF EXISTS {}",
            self.table_identifier(&ctx.table_name)
        )]
    }

    fn add_column_sql(&self, ctx: &TableContext, column: &Column) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table_identifier(&ctx.table_name),
            self.quote(&column.name),
            self.column_sql_type(column, ctx)
        )
    }

    fn drop_column_sql(&self, ctx: &TableContext, column_name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.table_identifier(&ctx.table_name),
            self.quote(column_name)
        )
    }

    fn create_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>>;

    fn drop_triggers_sql(&self, ctx: &TableContext) -> Vec<String>;

    /// Temporarily stop the triggers from firing; default is drop/recreate
    /// inside the enclosing transaction.
    fn suspend_triggers_sql(&self, ctx: &TableContext) -> Vec<String> {
        self.drop_triggers_sql(ctx)
    }

    fn resume_triggers_sql(&self, ctx: &TableContext) -> Result<Vec<String>> {
        self.create_triggers_sql(ctx)
    }

    /// Populates backend-specific metadata tables for a dataset (e.g.
    /// `gpkg_contents`).
    fn write_meta(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        dataset: &TableDataset,
    ) -> Result<()> {
        let _ = (session, ctx, dataset);
        Ok(())
    }

    fn delete_meta(&self, session: &mut dyn SqlSession, ctx: &TableContext) -> Result<()> {
        let _ = (session, ctx);
        Ok(())
    }

    /// Post-populate hook, e.g. building the GPKG spatial index.
    fn after_write_table(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
    ) -> Result<()> {
        let _ = (session, ctx);
        Ok(())
    }

    /// The meta items the working copy can represent; used to decide which
    /// committed meta items participate in diffs.
    fn supported_meta_items(&self) -> &'static [&'static str] {
        &["schema.json"]
    }

    /// Reads the working copy's own view of a dataset's meta items (derived
    /// from its metadata tables and table introspection).
    fn meta_items(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
    ) -> Result<BTreeMap<String, ItemValue>>;

    fn table_exists(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
    ) -> std::result::Result<bool, SqlError>;

    fn table_identifier(&self, table_name: &str) -> String {
        match self.db_schema() {
            Some(schema) => format!("{}.{}", self.quote(schema), self.quote(table_name)),
            None => self.quote(table_name),
        }
    }
}

/// A SQL working copy: adapter + shared engine.
pub struct SqlWorkingCopy<A: SqlAdapter> {
    adapter: A,
    store: Arc<Store>,
}

impl<A: SqlAdapter> SqlWorkingCopy<A> {
    pub fn new(adapter: A, store: Arc<Store>) -> Self {
        Self { adapter, store }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runs `f` inside one transaction on a fresh session. Every public
    /// operation opens exactly one of these; the steps inside an operation
    /// share the open session by receiving it as an argument. If `f` fails,
    /// the whole transaction rolls back and no partial state is left behind.
    pub fn session<T>(
        &self,
        f: impl FnOnce(&mut dyn SqlSession) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.adapter.connect().map_err(connect_error)?;
        session.begin().map_err(sql_error)?;
        let result = f(session.as_mut());
        let finish = match &result {
            Ok(_) => session.commit(),
            Err(_) => session.rollback(),
        };
        if let (Ok(_), Err(err)) = (&result, finish) {
            return Err(sql_error(err));
        }
        result
    }

    fn state_table(&self) -> String {
        self.adapter
            .table_identifier(&self.adapter.write_prefix().table_name(table_defs::STATE))
    }

    fn track_table(&self) -> String {
        self.adapter
            .table_identifier(&self.adapter.write_prefix().table_name(table_defs::TRACK))
    }

    fn ph(&self, i: usize) -> String {
        self.adapter.placeholder_style().placeholder(i)
    }

    pub fn get_state(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        // Fall back to a legacy-prefix state table when the current one is
        // absent (read-compatibility with older working copies).
        for prefix in self.adapter.read_prefixes() {
            let state = prefix.table_name(table_defs::STATE);
            if !self
                .adapter
                .table_exists(session, &state)
                .map_err(sql_error)?
            {
                continue;
            }
            let sql = format!(
                "SELECT value FROM {} WHERE table_name = {} AND key = {}",
                self.adapter.table_identifier(&state),
                self.ph(1),
                self.ph(2),
            );
            let row = session
                .query_one(
                    &sql,
                    &[
                        SqlValue::Text(table_name.to_string()),
                        SqlValue::Text(key.to_string()),
                    ],
                )
                .map_err(sql_error)?;
            return Ok(row.and_then(|r| r.first().and_then(|v| v.as_text().map(String::from))));
        }
        Ok(None)
    }

    pub fn set_state(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let state = self.state_table();
        let delete = format!(
            "DELETE FROM {state} WHERE table_name = {} AND key = {}",
            self.ph(1),
            self.ph(2)
        );
        session
            .execute(
                &delete,
                &[
                    SqlValue::Text(table_name.to_string()),
                    SqlValue::Text(key.to_string()),
                ],
            )
            .map_err(sql_error)?;
        if let Some(value) = value {
            let insert = format!(
                "INSERT INTO {state} (table_name, key, value) VALUES ({}, {}, {})",
                self.ph(1),
                self.ph(2),
                self.ph(3)
            );
            session
                .execute(
                    &insert,
                    &[
                        SqlValue::Text(table_name.to_string()),
                        SqlValue::Text(key.to_string()),
                        SqlValue::Text(value.to_string()),
                    ],
                )
                .map_err(sql_error)?;
        }
        Ok(())
    }

    /// The tree id the working copy is synchronised to. None when the state
    /// table does not exist yet; an empty value means the empty tree.
    pub fn base_tree_id(&self) -> Result<Option<TreeId>> {
        self.session(|session| {
            let Some(text) =
                self.get_state(session, table_defs::ALL_TABLES, table_defs::TREE_STATE_KEY)?
            else {
                return Ok(None);
            };
            if text.is_empty() {
                return Ok(Some(self.store.empty_tree_id().clone()));
            }
            Ok(Some(TreeId::try_from_hex(&text).ok_or_else(|| {
                Error::Uncategorized {
                    message: format!("Invalid tree id {text:?} in working copy state"),
                }
            })?))
        })
    }

    fn stamp_tree(&self, session: &mut dyn SqlSession, tree_id: &TreeId) -> Result<()> {
        self.set_state(
            session,
            table_defs::ALL_TABLES,
            table_defs::TREE_STATE_KEY,
            Some(&tree_id.hex()),
        )
    }

    fn base_structure(&self, session: &mut dyn SqlSession) -> Result<RepositoryStructure> {
        let text = self.get_state(session, table_defs::ALL_TABLES, table_defs::TREE_STATE_KEY)?;
        match text.as_deref() {
            None | Some("") => RepositoryStructure::empty(&self.store),
            Some(hex) => {
                let tree_id = TreeId::try_from_hex(hex).ok_or_else(|| Error::Uncategorized {
                    message: format!("Invalid tree id {hex:?} in working copy state"),
                })?;
                RepositoryStructure::at_tree(&self.store, tree_id)
            }
        }
    }

    /// Creates the database/namespace and installs the state and track
    /// tables.
    #[instrument(skip_all, fields(backend = self.adapter.backend_name()))]
    pub fn create_and_initialise(&self) -> Result<()> {
        self.session(|session| {
            for sql in self.adapter.initialise_sql() {
                session.execute(&sql, &[]).map_err(sql_error)?;
            }
            let statements = table_defs::create_tables_sql(
                self.adapter.write_prefix(),
                self.adapter.db_schema(),
                self.adapter.key_column_type(),
                |ident| self.adapter.quote(ident),
            );
            for sql in statements {
                session.execute(&sql, &[]).map_err(sql_error)?;
            }
            Ok(())
        })
    }

    /// Populates the working copy from scratch for every tabular dataset of
    /// `target`, installs the tracking triggers, and stamps the base tree.
    #[instrument(skip_all)]
    pub fn write_full(
        &self,
        target: &RepositoryStructure,
        filter: &SpatialFilter,
    ) -> Result<()> {
        self.session(|session| {
            for dataset in target.datasets()? {
                let Dataset::Table(table) = &dataset else {
                    continue;
                };
                self.write_table(session, table, filter)?;
            }
            self.stamp_tree(session, target.root_tree().id())?;
            match filter.hex_hash() {
                Some(hash) => self.set_state(
                    session,
                    table_defs::ALL_TABLES,
                    table_defs::SPATIAL_FILTER_HASH_KEY,
                    Some(&hash),
                )?,
                None => self.set_state(
                    session,
                    table_defs::ALL_TABLES,
                    table_defs::SPATIAL_FILTER_HASH_KEY,
                    None,
                )?,
            }
            Ok(())
        })
    }

    fn write_table(
        &self,
        session: &mut dyn SqlSession,
        table: &TableDataset,
        filter: &SpatialFilter,
    ) -> Result<()> {
        let ctx = TableContext::for_dataset(table)?;
        for sql in self.adapter.create_table_sql(&ctx) {
            session.execute(&sql, &[]).map_err(sql_error)?;
        }
        self.adapter.write_meta(session, &ctx, table)?;
        let resolved = resolve_filter_for_table(filter, table)?;
        let insert_sql = self.insert_sql(&ctx);
        for row in table.features() {
            let row = row?;
            if !resolved.matches_row(&ctx.schema, &row) {
                continue;
            }
            let params = self.row_params(&ctx, &row);
            session.execute(&insert_sql, &params).map_err(sql_error)?;
        }
        if ctx.pk_demoted && self.adapter.demotes_non_int_pk() {
            self.set_state(session, &ctx.table_name, "pk-demoted", Some("true"))?;
        }
        for sql in self.adapter.create_triggers_sql(&ctx)? {
            session.execute(&sql, &[]).map_err(sql_error)?;
        }
        self.adapter.after_write_table(session, &ctx)?;
        Ok(())
    }

    fn insert_sql(&self, ctx: &TableContext) -> String {
        let style = self.adapter.placeholder_style();
        let columns: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .map(|col| self.adapter.quote(&col.name))
            .collect();
        let values: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| self.adapter.column_write_expr(col, ctx, &style.placeholder(i + 1)))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.adapter.table_identifier(&ctx.table_name),
            columns.join(", "),
            values.join(", ")
        )
    }

    fn row_params(&self, ctx: &TableContext, row: &Row) -> Vec<SqlValue> {
        ctx.schema
            .columns()
            .iter()
            .zip(row)
            .map(|(col, value)| self.adapter.value_to_sql(value, col, ctx))
            .collect()
    }

    fn select_row(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        pk: &Value,
    ) -> Result<Option<Row>> {
        let pk_column = ctx.pk_column()?;
        let read_exprs: Vec<String> = ctx
            .schema
            .columns()
            .iter()
            .map(|col| self.adapter.column_read_expr(col, ctx))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            read_exprs.join(", "),
            self.adapter.table_identifier(&ctx.table_name),
            self.adapter.quote(&pk_column.name),
            self.ph(1)
        );
        let param = self.adapter.value_to_sql(pk, pk_column, ctx);
        let Some(sql_row) = session.query_one(&sql, &[param]).map_err(sql_error)? else {
            return Ok(None);
        };
        let row = ctx
            .schema
            .columns()
            .iter()
            .zip(sql_row)
            .map(|(col, value)| self.adapter.sql_to_value(value, col, ctx))
            .collect::<Result<Row>>()?;
        Ok(Some(row))
    }

    fn delete_row(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        pk: &Value,
    ) -> Result<()> {
        let pk_column = ctx.pk_column()?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.adapter.table_identifier(&ctx.table_name),
            self.adapter.quote(&pk_column.name),
            self.ph(1)
        );
        let param = self.adapter.value_to_sql(pk, pk_column, ctx);
        session.execute(&sql, &[param]).map_err(sql_error)?;
        Ok(())
    }

    fn upsert_row(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        row: &Row,
    ) -> Result<()> {
        let pk = pk_of(&ctx.schema, row);
        if let [single] = pk.as_slice() {
            self.delete_row(session, ctx, single)?;
        }
        let params = self.row_params(ctx, row);
        session
            .execute(&self.insert_sql(ctx), &params)
            .map_err(sql_error)?;
        Ok(())
    }

    fn tracked_pks(&self, session: &mut dyn SqlSession) -> Result<Vec<(String, String)>> {
        for prefix in self.adapter.read_prefixes() {
            let track = prefix.table_name(table_defs::TRACK);
            if !self
                .adapter
                .table_exists(session, &track)
                .map_err(sql_error)?
            {
                continue;
            }
            let sql = format!(
                "SELECT table_name, pk FROM {} ORDER BY table_name, pk",
                self.adapter.table_identifier(&track)
            );
            let rows = session.query(&sql, &[]).map_err(sql_error)?;
            return Ok(rows
                .into_iter()
                .filter_map(|row| {
                    let table = row.first()?.as_text()?.to_string();
                    let pk = row.get(1)?.as_text()?.to_string();
                    Some((table, pk))
                })
                .collect());
        }
        Ok(Vec::new())
    }

    fn clear_track(
        &self,
        session: &mut dyn SqlSession,
        table_name: Option<&str>,
    ) -> Result<()> {
        let track = self.track_table();
        match table_name {
            Some(table_name) => {
                let sql = format!("DELETE FROM {track} WHERE table_name = {}", self.ph(1));
                session
                    .execute(&sql, &[SqlValue::Text(table_name.to_string())])
                    .map_err(sql_error)?;
            }
            None => {
                session
                    .execute(&format!("DELETE FROM {track}"), &[])
                    .map_err(sql_error)?;
            }
        }
        Ok(())
    }

    fn clear_track_pk(
        &self,
        session: &mut dyn SqlSession,
        table_name: &str,
        pk_text: &str,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE table_name = {} AND pk = {}",
            self.track_table(),
            self.ph(1),
            self.ph(2)
        );
        session
            .execute(
                &sql,
                &[
                    SqlValue::Text(table_name.to_string()),
                    SqlValue::Text(pk_text.to_string()),
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        self.session(|session| Ok(!self.tracked_pks(session)?.is_empty()))
    }

    /// Raises `UncommittedChanges` when the track table is non-empty.
    pub fn check_not_dirty(&self) -> Result<()> {
        if self.is_dirty()? {
            Err(Error::UncommittedChanges)
        } else {
            Ok(())
        }
    }

    /// Converts the text form of a tracked pk back into a typed value.
    fn parse_track_pk(&self, schema: &Schema, pk_text: &str) -> Result<Value> {
        let pk_column = schema.first_pk_column().ok_or_else(|| {
            Error::schema_violation("tracked table has no primary key".to_string())
        })?;
        Ok(match &pk_column.data_type {
            DataType::Integer { .. } => match pk_text.parse::<i64>() {
                Ok(i) => Value::Integer(i),
                Err(_) => Value::Text(pk_text.to_string()),
            },
            _ => Value::Text(pk_text.to_string()),
        })
    }

    /// Joins the track table against each tracked table and emits one delta
    /// per touched row, plus meta diffs derived from the backend's own
    /// metadata tables.
    #[instrument(skip_all)]
    pub fn diff_to_tree(&self, filter: &SpatialFilter) -> Result<RepoDiff> {
        self.session(|session| {
            let base = self.base_structure(session)?;
            self.diff_to_structure(session, &base, filter)
        })
    }

    fn diff_to_structure(
        &self,
        session: &mut dyn SqlSession,
        base: &RepositoryStructure,
        filter: &SpatialFilter,
    ) -> Result<RepoDiff> {
        let mut result = RepoDiff::new();
        let tracked = self.tracked_pks(session)?;
        for dataset in base.datasets()? {
            let Dataset::Table(table) = &dataset else {
                continue;
            };
            let ctx = TableContext::for_dataset(table)?;
            let resolved = resolve_filter_for_table(filter, table)?;
            let mut ds_diff = DatasetDiff::default();

            ds_diff.meta = self.diff_meta(session, &ctx, table)?;
            let can_find_renames = ds_diff.meta.get("schema.json").is_none();

            for (_, pk_text) in tracked.iter().filter(|(t, _)| t == table.path()) {
                let pk = self.parse_track_pk(&ctx.schema, pk_text)?;
                let db_row = self.select_row(session, &ctx, &pk)?;
                let db_row = db_row.filter(|row| resolved.matches_row(&ctx.schema, row));
                let repo_row = table.try_get_feature(std::slice::from_ref(&pk))?;
                let repo_row =
                    repo_row.filter(|row| resolved.matches_row(&ctx.schema, row));
                match (repo_row, db_row) {
                    (Some(repo_row), Some(db_row)) if repo_row == db_row => {
                        // Changed and then changed back.
                    }
                    (Some(repo_row), Some(db_row)) => {
                        ds_diff.feature.add_delta(Delta::update(
                            pk_text.clone(),
                            ItemValue::Feature(repo_row),
                            pk_text.clone(),
                            ItemValue::Feature(db_row),
                        ));
                    }
                    (Some(repo_row), None) => {
                        ds_diff
                            .feature
                            .add_delta(Delta::delete(pk_text.clone(), ItemValue::Feature(repo_row)));
                    }
                    (None, Some(db_row)) => {
                        ds_diff
                            .feature
                            .add_delta(Delta::insert(pk_text.clone(), ItemValue::Feature(db_row)));
                    }
                    (None, None) => {}
                }
            }

            if can_find_renames {
                let schema = ctx.schema.clone();
                let legend = Legend::from_schema(&schema);
                find_renames(&mut ds_diff.feature, |value| match value {
                    ItemValue::Feature(row) => codec::encode_feature(&schema, &legend, row)
                        .ok()
                        .map(|blob| Blake2b512::digest(&blob).to_vec()),
                    _ => None,
                });
            }
            result.insert(table.path().to_string(), ds_diff);
        }
        result.prune();
        Ok(result)
    }

    fn diff_meta(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        table: &TableDataset,
    ) -> Result<DeltaDiff> {
        let supported = self.adapter.supported_meta_items();
        let ds_items: BTreeMap<String, ItemValue> = table
            .meta_items()?
            .into_iter()
            .filter(|(name, _)| {
                supported.contains(&name.as_str()) || name.starts_with("crs/")
            })
            .collect();
        let mut wc_items = self.adapter.meta_items(session, ctx)?;
        // Undo the backend's type approximations so they don't show up as
        // schema edits.
        if let (Some(ItemValue::Json(ds_schema)), Some(ItemValue::Json(wc_schema))) =
            (ds_items.get("schema.json"), wc_items.get("schema.json"))
        {
            let ds_schema = Schema::from_json(ds_schema)
                .map_err(|e| Error::schema_violation(e.to_string()))?;
            let wc_schema = Schema::from_json(wc_schema)
                .map_err(|e| Error::schema_violation(e.to_string()))?;
            let aligned = wc_schema.aligned_to_with(&ds_schema, |old, new| {
                self.adapter.try_align_schema_col(old, new)
            });
            wc_items.insert("schema.json".to_string(), ItemValue::Json(aligned.to_json()));
        }
        Ok(DeltaDiff::diff_maps(&ds_items, &wc_items))
    }

    /// Resets the working copy to `target`.
    ///
    /// With `discard_changes`, uncommitted edits are thrown away. Without it,
    /// the reset refuses (`UncommittedChanges`) when any edit overlaps the
    /// base→target diff; otherwise the edits are carried over and remain
    /// tracked on the new base.
    #[instrument(skip_all, fields(discard = discard_changes))]
    pub fn reset(
        &self,
        target: &RepositoryStructure,
        discard_changes: bool,
        filter: &SpatialFilter,
    ) -> Result<()> {
        self.session(|session| {
            let base = self.base_structure(session)?;
            let step_diff = base.diff(target, filter)?;
            let tracked = self.tracked_pks(session)?;

            if !discard_changes && !tracked.is_empty() {
                self.check_edits_can_be_carried(&step_diff, &tracked, &base, target)?;
            }

            // Datasets present on either side of the step.
            let mut touched: BTreeSet<String> = BTreeSet::new();
            for (path, _) in step_diff.iter() {
                touched.insert(path.clone());
            }

            for ds_path in touched {
                let base_table = base
                    .get_dataset(&ds_path)?
                    .and_then(|ds| ds.as_table().cloned());
                let target_table = target
                    .get_dataset(&ds_path)?
                    .and_then(|ds| ds.as_table().cloned());
                let ds_diff = step_diff.get(&ds_path).unwrap();
                self.reset_one_dataset(
                    session,
                    &ds_path,
                    base_table.as_ref(),
                    target_table.as_ref(),
                    ds_diff,
                    discard_changes,
                    filter,
                )?;
            }

            if discard_changes {
                // Revert rows the user touched in untouched datasets too.
                let tracked = self.tracked_pks(session)?;
                for (ds_path, pk_text) in &tracked {
                    let Some(Dataset::Table(target_table)) =
                        target.get_dataset(ds_path)?
                    else {
                        continue;
                    };
                    let ctx = TableContext::for_dataset(&target_table)?;
                    let suspended = self.adapter.suspend_triggers_sql(&ctx);
                    for sql in &suspended {
                        session.execute(sql, &[]).map_err(sql_error)?;
                    }
                    let pk = self.parse_track_pk(&ctx.schema, pk_text)?;
                    match target_table.try_get_feature(std::slice::from_ref(&pk))? {
                        Some(row) => self.upsert_row(session, &ctx, &row)?,
                        None => self.delete_row(session, &ctx, &pk)?,
                    }
                    for sql in self.adapter.resume_triggers_sql(&ctx)? {
                        session.execute(&sql, &[]).map_err(sql_error)?;
                    }
                }
                self.clear_track(session, None)?;
            }

            self.stamp_tree(session, target.root_tree().id())?;
            Ok(())
        })
    }

    /// An uncommitted edit conflicts with the reset when the base→target
    /// step touches the same row or rewrites the dataset's schema.
    fn check_edits_can_be_carried(
        &self,
        step_diff: &RepoDiff,
        tracked: &[(String, String)],
        base: &RepositoryStructure,
        target: &RepositoryStructure,
    ) -> Result<()> {
        for (ds_path, pk_text) in tracked {
            let Some(ds_diff) = step_diff.get(ds_path) else {
                continue;
            };
            if ds_diff.meta.get("schema.json").is_some() {
                return Err(Error::UncommittedChanges);
            }
            if ds_diff.feature.get(pk_text).is_some() {
                return Err(Error::UncommittedChanges);
            }
            // A dataset deleted by the step cannot carry edits.
            if base.get_dataset(ds_path)?.is_some() && target.get_dataset(ds_path)?.is_none() {
                return Err(Error::UncommittedChanges);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn reset_one_dataset(
        &self,
        session: &mut dyn SqlSession,
        ds_path: &str,
        base_table: Option<&TableDataset>,
        target_table: Option<&TableDataset>,
        ds_diff: &DatasetDiff,
        discard_changes: bool,
        filter: &SpatialFilter,
    ) -> Result<()> {
        match (base_table, target_table) {
            (None, None) => Ok(()),
            (None, Some(target_table)) => {
                // Dataset created by the step.
                self.write_table(session, target_table, filter)
            }
            (Some(base_table), None) => {
                // Dataset deleted by the step.
                let ctx = TableContext::for_dataset(base_table)?;
                for sql in self.adapter.drop_triggers_sql(&ctx) {
                    session.execute(&sql, &[]).map_err(sql_error)?;
                }
                self.adapter.delete_meta(session, &ctx)?;
                for sql in self.adapter.drop_table_sql(&ctx) {
                    session.execute(&sql, &[]).map_err(sql_error)?;
                }
                self.clear_track(session, Some(ds_path))?;
                let delete_state = format!(
                    "DELETE FROM {} WHERE table_name = {}",
                    self.state_table(),
                    self.ph(1)
                );
                session
                    .execute(&delete_state, &[SqlValue::Text(ds_path.to_string())])
                    .map_err(sql_error)?;
                Ok(())
            }
            (Some(base_table), Some(target_table)) => {
                let schema_changed = ds_diff.meta.get("schema.json").is_some();
                let counts = base_table
                    .schema()
                    .diff_type_counts(target_table.schema());
                if schema_changed && !counts.only_adds_and_deletes() {
                    // Schema rewrite: drop and repopulate the whole table.
                    let ctx = TableContext::for_dataset(base_table)?;
                    for sql in self.adapter.drop_triggers_sql(&ctx) {
                        session.execute(&sql, &[]).map_err(sql_error)?;
                    }
                    self.adapter.delete_meta(session, &ctx)?;
                    for sql in self.adapter.drop_table_sql(&ctx) {
                        session.execute(&sql, &[]).map_err(sql_error)?;
                    }
                    return self.write_table(session, target_table, filter);
                }

                let target_ctx = TableContext::for_dataset(target_table)?;
                let suspended = self.adapter.suspend_triggers_sql(&target_ctx);
                for sql in &suspended {
                    session.execute(sql, &[]).map_err(sql_error)?;
                }
                if schema_changed {
                    for col in target_table.schema().columns() {
                        if base_table.schema().column_by_id(&col.id).is_none() {
                            let sql = self.adapter.add_column_sql(&target_ctx, col);
                            session.execute(&sql, &[]).map_err(sql_error)?;
                        }
                    }
                    for col in base_table.schema().columns() {
                        if target_table.schema().column_by_id(&col.id).is_none() {
                            let sql = self.adapter.drop_column_sql(&target_ctx, &col.name);
                            session.execute(&sql, &[]).map_err(sql_error)?;
                        }
                    }
                    self.adapter.write_meta(session, &target_ctx, target_table)?;
                }
                let tracked: BTreeSet<String> = if discard_changes {
                    BTreeSet::new()
                } else {
                    self.tracked_pks(session)?
                        .into_iter()
                        .filter(|(t, _)| t == ds_path)
                        .map(|(_, pk)| pk)
                        .collect()
                };
                for (key, delta) in ds_diff.feature.iter() {
                    if tracked.contains(key) {
                        // The user's edit wins; it stays tracked against the
                        // new base.
                        continue;
                    }
                    match delta.kind() {
                        DeltaKind::Delete => {
                            if let Some(ItemValue::Feature(old_row)) = delta.old_value() {
                                let pk = pk_of(&target_ctx.schema, old_row);
                                if let [single] = pk.as_slice() {
                                    self.delete_row(session, &target_ctx, single)?;
                                }
                            }
                        }
                        DeltaKind::Insert | DeltaKind::Update => {
                            if let Some(ItemValue::Feature(new_row)) = delta.new_value() {
                                self.upsert_row(session, &target_ctx, new_row)?;
                            }
                        }
                    }
                }
                for sql in self.adapter.resume_triggers_sql(&target_ctx)? {
                    session.execute(&sql, &[]).map_err(sql_error)?;
                }
                self.adapter.after_write_table(session, &target_ctx)?;
                Ok(())
            }
        }
    }

    /// Clears the track entries for the rows that were just committed and
    /// stamps the new base tree; other dirty rows stay tracked.
    #[instrument(skip_all)]
    pub fn soft_reset_after_commit(
        &self,
        new_base: &RepositoryStructure,
        committed: &RepoDiff,
    ) -> Result<()> {
        self.session(|session| {
            for (ds_path, ds_diff) in committed.iter() {
                for (key, _) in ds_diff.feature.iter() {
                    self.clear_track_pk(session, ds_path, key)?;
                }
            }
            self.stamp_tree(session, new_base.root_tree().id())?;
            Ok(())
        })
    }

    /// Writes a row edit through the working copy (test and tooling helper;
    /// normal user edits arrive through the database itself, where the
    /// triggers record them).
    pub fn apply_user_edit(&self, dataset: &TableDataset, edit: UserEdit) -> Result<()> {
        self.session(|session| {
            let ctx = TableContext::for_dataset(dataset)?;
            match edit {
                UserEdit::Insert(row) | UserEdit::Update(row) => {
                    self.upsert_row(session, &ctx, &row)?;
                    self.record_track(session, &ctx, &row)?;
                }
                UserEdit::Delete(pk) => {
                    self.delete_row(session, &ctx, &pk)?;
                    let sql = format!(
                        "INSERT INTO {} (table_name, pk) VALUES ({}, {})",
                        self.track_table(),
                        self.ph(1),
                        self.ph(2)
                    );
                    let _ = session.execute(
                        &sql,
                        &[
                            SqlValue::Text(ctx.table_name.clone()),
                            SqlValue::Text(pk.to_track_text()),
                        ],
                    );
                }
            }
            Ok(())
        })
    }

    fn record_track(
        &self,
        session: &mut dyn SqlSession,
        ctx: &TableContext,
        row: &Row,
    ) -> Result<()> {
        let pk = pk_of(&ctx.schema, row);
        let sql = format!(
            "INSERT INTO {} (table_name, pk) VALUES ({}, {})",
            self.track_table(),
            self.ph(1),
            self.ph(2)
        );
        // The insert may race with the trigger having already recorded the
        // same pk; a duplicate is fine.
        let _ = session.execute(
            &sql,
            &[
                SqlValue::Text(ctx.table_name.clone()),
                SqlValue::Text(pk_to_track_text(&pk)),
            ],
        );
        Ok(())
    }

    /// Drops the working copy's database objects.
    pub fn delete(&self) -> Result<()> {
        self.session(|session| {
            let base = self.base_structure(session)?;
            for dataset in base.datasets()? {
                let Dataset::Table(table) = &dataset else {
                    continue;
                };
                let ctx = TableContext::for_dataset(table)?;
                for sql in self.adapter.drop_triggers_sql(&ctx) {
                    let _ = session.execute(&sql, &[]);
                }
                for sql in self.adapter.drop_table_sql(&ctx) {
                    session.execute(&sql, &[]).map_err(sql_error)?;
                }
            }
            for short in [table_defs::STATE, table_defs::TRACK] {
                let table = self
                    .adapter
                    .table_identifier(&self.adapter.write_prefix().table_name(short));
                session
                    .execute(&format!("DROP TABLE IF EXISTS {table}"), &[])
                    .map_err(sql_error)?;
            }
            Ok(())
        })
    }
}

/// A row edit applied through [`SqlWorkingCopy::apply_user_edit`].
pub enum UserEdit {
    Insert(Row),
    Update(Row),
    Delete(Value),
}

pub(crate) fn sql_error(err: SqlError) -> Error {
    match err {
        SqlError::Connect { message } => Error::ConnectionError {
            message: "Cannot connect to the working copy".to_string(),
            cause: message,
        },
        SqlError::Query { message } => {
            debug!(message, "working copy query failed");
            Error::Uncategorized { message }
        }
    }
}

pub(crate) fn connect_error(err: SqlError) -> Error {
    Error::ConnectionError {
        message: "Cannot connect to the working copy".to_string(),
        cause: err.to_string(),
    }
}
