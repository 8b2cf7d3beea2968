use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::clock::parse_timestamp;
use crate::{MetricValue, MetricsError, MetricsResult};

/// Identity and bookkeeping columns every metric store carries.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

pub fn timestamp_column(metric: &str) -> String {
    format!("updated_{metric}_at")
}

pub fn is_reserved(column: &str) -> bool {
    RESERVED_COLUMNS.contains(&column)
}

/// One row of the metric store, keyed by the owning entity's id.
///
/// Only columns that existed when the row was loaded can be written; writes
/// to anything else fail with [`MetricsError::PendingColumn`].
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    table: String,
    id: i64,
    values: BTreeMap<String, MetricValue>,
    dirty: BTreeSet<String>,
}

impl MetricRecord {
    pub fn new(table: impl Into<String>, id: i64, values: BTreeMap<String, MetricValue>) -> Self {
        Self {
            table: table.into(),
            id,
            values,
            dirty: BTreeSet::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn get(&self, column: &str) -> Option<&MetricValue> {
        self.values.get(column)
    }

    pub fn set(&mut self, column: &str, value: MetricValue) -> MetricsResult<()> {
        let slot = self
            .values
            .get_mut(column)
            .ok_or_else(|| MetricsError::pending_column(column))?;
        *slot = value;
        self.dirty.insert(column.to_string());
        Ok(())
    }

    /// When `metric` was last computed, if the stamp is present and readable.
    pub fn computed_at(&self, metric: &str) -> Option<OffsetDateTime> {
        self.values
            .get(&timestamp_column(metric))
            .and_then(MetricValue::as_str)
            .and_then(parse_timestamp)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn changes(&self) -> Vec<(String, MetricValue)> {
        self.dirty
            .iter()
            .filter_map(|column| {
                self.values
                    .get(column)
                    .map(|value| (column.clone(), value.clone()))
            })
            .collect()
    }

    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }
}
