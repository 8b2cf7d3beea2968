pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod evaluator;
pub mod materializer;
pub mod record;
pub mod registry;
pub mod schema;
pub mod value;

pub use backend::{
    ColumnInfo, ColumnSpec, Entity, EntitySource, MetricBackend, OperationKind, QueryScope,
    SchemaInspector, SchemaMutator, TracedOp, TracedParam,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MetricsConfig;
pub use context::MetricsContext;
pub use detector::{collect_metrics, DetectedAggregate, Detection};
pub use error::{MetricsError, MetricsResult};
pub use evaluator::{destroy_record, evaluate, evaluate_all, Instance};
pub use materializer::{update_all, MaterializeOptions, MaterializeReport};
pub use record::{timestamp_column, MetricRecord, RESERVED_COLUMNS};
pub use registry::{
    ComputeFn, EntityType, Frequency, MetricAccessor, MetricDefinition, MetricOptions,
    MetricRegistry, StoreBinding,
};
pub use schema::{
    extra_columns, migrate, missing_columns, remigrate, required_columns, SchemaChanges,
};
pub use value::{ColumnType, MetricValue};
