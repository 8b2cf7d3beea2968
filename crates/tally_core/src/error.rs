use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("cannot determine extra metric columns on self-storing table {table}; remove them manually")]
    SchemaAmbiguity { table: String },
    #[error("schema migration error: {message}")]
    SchemaMigration { message: String },
    #[error("metric {metric} failed to compute: {message}")]
    Compute { metric: String, message: String },
    #[error("metric column {column} does not exist yet")]
    PendingColumn { column: String },
    #[error("detected aggregate for {metric} failed: {message}")]
    DetectedAggregate { metric: String, message: String },
    #[error("declared aggregate for {metric} failed: {message}")]
    DeclaredAggregate { metric: String, message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
}

impl MetricsError {
    pub fn schema_ambiguity(table: impl Into<String>) -> Self {
        Self::SchemaAmbiguity {
            table: table.into(),
        }
    }

    pub fn schema_migration(message: impl Into<String>) -> Self {
        Self::SchemaMigration {
            message: message.into(),
        }
    }

    pub fn compute(metric: impl Into<String>, message: impl ToString) -> Self {
        Self::Compute {
            metric: metric.into(),
            message: message.to_string(),
        }
    }

    pub fn pending_column(column: impl Into<String>) -> Self {
        Self::PendingColumn {
            column: column.into(),
        }
    }

    pub fn detected_aggregate(metric: impl Into<String>, message: impl ToString) -> Self {
        Self::DetectedAggregate {
            metric: metric.into(),
            message: message.to_string(),
        }
    }

    pub fn declared_aggregate(metric: impl Into<String>, message: impl ToString) -> Self {
        Self::DeclaredAggregate {
            metric: metric.into(),
            message: message.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// True for failures the evaluator and materializer downgrade instead of raising.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PendingColumn { .. } | Self::DetectedAggregate { .. }
        )
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;
