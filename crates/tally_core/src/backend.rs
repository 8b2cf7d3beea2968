//! Capability traits a storage backend implements for the metrics core.

use sea_query::SelectStatement;
use time::OffsetDateTime;

use crate::{ColumnType, MetricRecord, MetricValue, MetricsResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<MetricValue>,
}

impl ColumnSpec {
    /// String columns are non-null with an empty default, everything else is
    /// nullable without a default.
    pub fn for_type(name: impl Into<String>, column_type: ColumnType) -> Self {
        if column_type.is_string() {
            Self {
                name: name.into(),
                column_type,
                nullable: false,
                default: Some(MetricValue::Text(String::new())),
            }
        } else {
            Self {
                name: name.into(),
                column_type,
                nullable: true,
                default: None,
            }
        }
    }
}

pub trait SchemaInspector {
    fn table_exists(&self, table: &str) -> MetricsResult<bool>;
    fn columns(&self, table: &str) -> MetricsResult<Vec<ColumnInfo>>;
    /// Forget cached column metadata for `table`.
    fn refresh_columns(&self, table: &str);
}

pub trait SchemaMutator {
    /// Create a metric store table holding only the reserved columns.
    fn create_store_table(&self, table: &str) -> MetricsResult<()>;
    fn add_column(&self, table: &str, column: &ColumnSpec) -> MetricsResult<()>;
    fn drop_column(&self, table: &str, column: &str) -> MetricsResult<()>;
}

/// A bound parameter of a traced statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracedParam {
    /// The value rendered as an SQL literal.
    pub literal: String,
    /// Set for signed integers. Ids bind as signed values; limits and
    /// offsets bind unsigned and are never mistaken for an id.
    pub integer: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    /// Single-row read of `table` by id.
    Lookup { table: String },
}

/// One primitive fetch issued through a [`QueryScope`].
///
/// `sql` uses `?` placeholders, one per entry of `params`, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracedOp {
    pub kind: OperationKind,
    pub sql: String,
    pub params: Vec<TracedParam>,
}

/// Read access handed to metric compute functions.
pub trait QueryScope {
    /// First column of the first row, or null when no row matches.
    fn fetch_value(&self, query: &SelectStatement) -> MetricsResult<MetricValue>;
    fn lookup(&self, table: &str, column: &str, id: i64) -> MetricsResult<MetricValue>;
}

pub trait MetricBackend: SchemaInspector + SchemaMutator + QueryScope {
    fn execute(&self, sql: &str) -> MetricsResult<usize>;

    /// Set `column` to `at` on every row of `table`.
    fn stamp_column(&self, table: &str, column: &str, at: OffsetDateTime) -> MetricsResult<usize>;

    /// Run `f` atomically; an error rolls back everything `f` wrote.
    fn transaction<T, F>(&self, scope: &str, f: F) -> MetricsResult<T>
    where
        F: FnOnce() -> MetricsResult<T>;

    fn find_or_create_record(&self, table: &str, id: i64) -> MetricsResult<MetricRecord>;

    /// Insert an empty row for every id in `ids` that has none yet.
    /// Returns the number of rows created.
    fn ensure_records(&self, table: &str, ids: &[i64]) -> MetricsResult<usize>;

    /// Persist the record's pending changes and mark it clean.
    fn save_record(&self, record: &mut MetricRecord) -> MetricsResult<()>;

    fn delete_record(&self, table: &str, id: i64) -> MetricsResult<()>;

    /// Run `f` and report every primitive fetch it issued through this backend.
    /// Whatever trace was active before is restored afterwards, even on panic.
    fn with_operation_trace<T, F>(&self, f: F) -> (T, Vec<TracedOp>)
    where
        F: FnOnce() -> T;
}

/// A domain record that owns metrics.
pub trait Entity {
    fn id(&self) -> i64;

    /// True while the entity holds unsaved changes.
    fn has_pending_changes(&self) -> bool {
        false
    }
}

/// Loads the entity population of one type.
pub trait EntitySource<E> {
    fn count(&self) -> MetricsResult<u64>;
    fn first(&self) -> MetricsResult<Option<E>>;
    fn for_each_batch(
        &self,
        batch_size: usize,
        f: &mut dyn FnMut(Vec<E>) -> MetricsResult<()>,
    ) -> MetricsResult<()>;
}
