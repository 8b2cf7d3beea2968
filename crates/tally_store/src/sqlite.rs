use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use sea_query::{
    Alias, Asterisk, ColumnDef, Expr, OnConflict, Query, QueryBuilder, SelectStatement,
    SqliteQueryBuilder, Table, Value as SeaValue,
};
use time::OffsetDateTime;

use tally_core::clock::format_timestamp;
use tally_core::detector::quote_ident;
use tally_core::{
    ColumnInfo, ColumnSpec, ColumnType, MetricBackend, MetricRecord, MetricValue, MetricsError,
    MetricsResult, OperationKind, QueryScope, SchemaInspector, SchemaMutator, TracedOp,
    TracedParam,
};

use crate::config::{DatabaseConfig, TallyConfig};
use crate::trace::{self, TraceGuard, TraceSlot};

/// Metric backend over a single SQLite connection.
///
/// Every call locks the connection for its own duration only, so compute
/// functions may issue fetches from inside [`MetricBackend::transaction`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    columns: Mutex<HashMap<String, Vec<ColumnInfo>>>,
    trace: TraceSlot,
    savepoints: AtomicUsize,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> MetricsResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|err| MetricsError::storage(format!("sqlite open error: {err}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> MetricsResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| MetricsError::storage(format!("sqlite open error: {err}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashMap::new()),
            trace: Mutex::new(None),
            savepoints: AtomicUsize::new(0),
        }
    }

    pub fn connect(config: &TallyConfig, base_dir: &Path) -> MetricsResult<Self> {
        match &config.database {
            DatabaseConfig::Sqlite { .. } => Self::open(config.sqlite_path(base_dir)?),
            DatabaseConfig::Memory => Self::open_in_memory(),
        }
    }

    /// Open the store configured by `base_dir/tally.json`, creating a default
    /// sqlite config there on first use.
    pub fn open_dir(base_dir: &Path) -> MetricsResult<Self> {
        let config = TallyConfig::load_or_init(base_dir)?;
        log::info!("opening {} metric store in {}", config.backend_name(), base_dir.display());
        Self::connect(&config, base_dir)
    }

    /// Run `func` against the raw connection. Must not call back into the store.
    pub fn with_conn<T, F>(&self, func: F) -> MetricsResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| MetricsError::storage("sqlite connection poisoned"))?;
        func(&guard).map_err(storage_error)
    }

    fn record_op(&self, build: impl FnOnce() -> TracedOp) {
        if let Some(ops) = trace::lock(&self.trace).as_mut() {
            ops.push(build());
        }
    }

    fn query_scalar(&self, sql: &str) -> MetricsResult<MetricValue> {
        let value = self.with_conn(|conn| {
            conn.query_row(sql, [], |row| Ok(read_value(row.get_ref(0)?)))
                .optional()
        })?;
        Ok(value.unwrap_or(MetricValue::Null))
    }

    fn load_record(&self, table: &str, id: i64) -> MetricsResult<Option<MetricRecord>> {
        let sql = Query::select()
            .column(Asterisk)
            .from(Alias::new(table))
            .and_where(Expr::col(Alias::new("id")).eq(id))
            .limit(1)
            .to_string(SqliteQueryBuilder);
        let values = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            stmt.query_row([], |row| {
                let mut values = BTreeMap::new();
                for (index, name) in names.iter().enumerate() {
                    values.insert(name.clone(), read_value(row.get_ref(index)?));
                }
                Ok(values)
            })
            .optional()
        })?;
        Ok(values.map(|values| MetricRecord::new(table, id, values)))
    }

    fn execute_schema(&self, sql: &str, table: &str) -> MetricsResult<()> {
        log::debug!("schema: {sql}");
        self.with_conn(|conn| conn.execute_batch(sql))?;
        self.refresh_columns(table);
        Ok(())
    }
}

impl SchemaInspector for SqliteStore {
    fn table_exists(&self, table: &str) -> MetricsResult<bool> {
        let found = self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    fn columns(&self, table: &str) -> MetricsResult<Vec<ColumnInfo>> {
        if let Some(cached) = self
            .columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
        {
            return Ok(cached.clone());
        }
        let pragma = format!("PRAGMA table_info({})", quote_ident(table));
        let columns = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&pragma)?;
            let rows = stmt.query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                })
            })?;
            let columns = rows.collect::<rusqlite::Result<Vec<_>>>();
            columns
        })?;
        self.columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    fn refresh_columns(&self, table: &str) {
        self.columns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
    }
}

impl SchemaMutator for SqliteStore {
    fn create_store_table(&self, table: &str) -> MetricsResult<()> {
        let sql = Table::create()
            .table(Alias::new(table))
            .if_not_exists()
            .col(
                ColumnDef::new(Alias::new("id"))
                    .integer()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(Alias::new("created_at")).string().null())
            .col(ColumnDef::new(Alias::new("updated_at")).string().null())
            .to_string(SqliteQueryBuilder);
        self.execute_schema(&sql, table)
    }

    fn add_column(&self, table: &str, column: &ColumnSpec) -> MetricsResult<()> {
        let mut column_def = ColumnDef::new(Alias::new(column.name.as_str()));
        match column.column_type {
            ColumnType::String => {
                column_def.string();
            }
            ColumnType::Text => {
                column_def.text();
            }
            ColumnType::Integer => {
                column_def.integer();
            }
            ColumnType::Float => {
                column_def.double();
            }
            ColumnType::Boolean => {
                column_def.boolean();
            }
            ColumnType::DateTime => {
                column_def.date_time();
            }
        }
        if column.nullable {
            column_def.null();
        } else {
            column_def.not_null();
        }
        if let Some(default) = &column.default {
            column_def.default(default.to_sql_value());
        }
        let sql = Table::alter()
            .table(Alias::new(table))
            .add_column(&mut column_def)
            .to_string(SqliteQueryBuilder);
        self.execute_schema(&sql, table)
    }

    fn drop_column(&self, table: &str, column: &str) -> MetricsResult<()> {
        let sql = Table::alter()
            .table(Alias::new(table))
            .drop_column(Alias::new(column))
            .to_string(SqliteQueryBuilder);
        self.execute_schema(&sql, table)
    }
}

impl QueryScope for SqliteStore {
    fn fetch_value(&self, query: &SelectStatement) -> MetricsResult<MetricValue> {
        self.record_op(|| traced(OperationKind::Query, query));
        self.query_scalar(&query.to_string(SqliteQueryBuilder))
    }

    fn lookup(&self, table: &str, column: &str, id: i64) -> MetricsResult<MetricValue> {
        let query = Query::select()
            .column(Alias::new(column))
            .from(Alias::new(table))
            .and_where(Expr::col(Alias::new("id")).eq(id))
            .limit(1)
            .to_owned();
        self.record_op(|| {
            traced(
                OperationKind::Lookup {
                    table: table.to_string(),
                },
                &query,
            )
        });
        self.query_scalar(&query.to_string(SqliteQueryBuilder))
    }
}

impl MetricBackend for SqliteStore {
    fn execute(&self, sql: &str) -> MetricsResult<usize> {
        log::debug!("execute: {sql}");
        self.with_conn(|conn| conn.execute(sql, []))
    }

    fn stamp_column(&self, table: &str, column: &str, at: OffsetDateTime) -> MetricsResult<usize> {
        let sql = Query::update()
            .table(Alias::new(table))
            .value(Alias::new(column), format_timestamp(at)?)
            .to_string(SqliteQueryBuilder);
        self.execute(&sql)
    }

    fn transaction<T, F>(&self, scope: &str, f: F) -> MetricsResult<T>
    where
        F: FnOnce() -> MetricsResult<T>,
    {
        let depth = self.savepoints.fetch_add(1, Ordering::SeqCst);
        let savepoint = format!("tally_{depth}");
        if let Err(err) = self.with_conn(|conn| conn.execute_batch(&format!("SAVEPOINT {savepoint}"))) {
            self.savepoints.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }
        let outcome = f();
        let finished = match &outcome {
            Ok(_) => self.with_conn(|conn| conn.execute_batch(&format!("RELEASE {savepoint}"))),
            Err(err) => {
                log::debug!("rolling back {scope}: {err}");
                self.with_conn(|conn| {
                    conn.execute_batch(&format!(
                        "ROLLBACK TO {savepoint}; RELEASE {savepoint}"
                    ))
                })
            }
        };
        self.savepoints.fetch_sub(1, Ordering::SeqCst);
        finished?;
        outcome
    }

    fn find_or_create_record(&self, table: &str, id: i64) -> MetricsResult<MetricRecord> {
        if let Some(record) = self.load_record(table, id)? {
            return Ok(record);
        }
        self.ensure_records(table, &[id])?;
        self.load_record(table, id)?
            .ok_or_else(|| MetricsError::not_found(format!("{table} row {id} after insert")))
    }

    fn ensure_records(&self, table: &str, ids: &[i64]) -> MetricsResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = format_timestamp(OffsetDateTime::now_utc())?;
        let stamps: Vec<&str> = self
            .columns(table)?
            .iter()
            .filter_map(|column| match column.name.as_str() {
                "created_at" => Some("created_at"),
                "updated_at" => Some("updated_at"),
                _ => None,
            })
            .collect();

        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(table))
            .columns(
                std::iter::once("id")
                    .chain(stamps.iter().copied())
                    .map(Alias::new),
            )
            .on_conflict(OnConflict::column(Alias::new("id")).do_nothing().to_owned());
        for id in ids {
            let mut values = vec![Expr::value(*id)];
            values.extend(stamps.iter().map(|_| Expr::value(now.clone())));
            insert
                .values(values)
                .map_err(|err| MetricsError::storage(err.to_string()))?;
        }
        self.execute(&insert.to_string(SqliteQueryBuilder))
    }

    fn save_record(&self, record: &mut MetricRecord) -> MetricsResult<()> {
        if !record.is_dirty() {
            return Ok(());
        }
        let mut update = Query::update();
        update.table(Alias::new(record.table()));
        for (column, value) in record.changes() {
            update.value(Alias::new(column), value.to_sql_value());
        }
        if record.has_column("updated_at") {
            update.value(
                Alias::new("updated_at"),
                format_timestamp(OffsetDateTime::now_utc())?,
            );
        }
        update.and_where(Expr::col(Alias::new("id")).eq(record.id()));
        self.execute(&update.to_string(SqliteQueryBuilder))?;
        record.mark_clean();
        Ok(())
    }

    fn delete_record(&self, table: &str, id: i64) -> MetricsResult<()> {
        let sql = Query::delete()
            .from_table(Alias::new(table))
            .and_where(Expr::col(Alias::new("id")).eq(id))
            .to_string(SqliteQueryBuilder);
        self.execute(&sql)?;
        Ok(())
    }

    fn with_operation_trace<T, F>(&self, f: F) -> (T, Vec<TracedOp>)
    where
        F: FnOnce() -> T,
    {
        let guard = TraceGuard::install(&self.trace);
        let result = f();
        (result, guard.finish())
    }
}

fn traced(kind: OperationKind, query: &SelectStatement) -> TracedOp {
    let (sql, values) = query.build(SqliteQueryBuilder);
    let params = values
        .0
        .iter()
        .map(|value| TracedParam {
            literal: SqliteQueryBuilder.value_to_string(value),
            integer: signed_integer(value),
        })
        .collect();
    TracedOp { kind, sql, params }
}

fn signed_integer(value: &SeaValue) -> Option<i64> {
    match value {
        SeaValue::TinyInt(Some(value)) => Some(i64::from(*value)),
        SeaValue::SmallInt(Some(value)) => Some(i64::from(*value)),
        SeaValue::Int(Some(value)) => Some(i64::from(*value)),
        SeaValue::BigInt(Some(value)) => Some(*value),
        _ => None,
    }
}

fn read_value(value: ValueRef<'_>) -> MetricValue {
    match value {
        ValueRef::Null => MetricValue::Null,
        ValueRef::Integer(value) => MetricValue::Integer(value),
        ValueRef::Real(value) => MetricValue::Real(value),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            MetricValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn storage_error(err: rusqlite::Error) -> MetricsError {
    MetricsError::storage(err.to_string())
}
