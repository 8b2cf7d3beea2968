use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use time::Duration;

use crate::backend::{Entity, MetricBackend, QueryScope};
use crate::context::MetricsContext;
use crate::evaluator::{evaluate, Instance};
use crate::{ColumnType, MetricValue, MetricsError, MetricsResult};

pub type ComputeFn<E> =
    Arc<dyn Fn(&E, &dyn QueryScope) -> MetricsResult<MetricValue> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frequency {
    Every(Duration),
    /// Never reuse a cached value.
    Always,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricOptions {
    /// `None` falls back to the configured default frequency.
    pub frequency: Option<Frequency>,
    pub once: bool,
    pub column_type: Option<ColumnType>,
}

impl MetricOptions {
    pub fn every(mut self, window: Duration) -> Self {
        self.frequency = Some(Frequency::Every(window));
        self
    }

    pub fn always(mut self) -> Self {
        self.frequency = Some(Frequency::Always);
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = Some(column_type);
        self
    }
}

pub struct MetricDefinition<E> {
    name: String,
    compute: Option<ComputeFn<E>>,
    aggregate: Option<String>,
    options: MetricOptions,
}

impl<E> MetricDefinition<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compute: None,
            aggregate: None,
            options: MetricOptions::default(),
        }
    }

    pub fn compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&E, &dyn QueryScope) -> MetricsResult<MetricValue> + Send + Sync + 'static,
    {
        self.compute = Some(Arc::new(f));
        self
    }

    pub fn aggregate(mut self, template: impl Into<String>) -> Self {
        self.aggregate = Some(template.into());
        self
    }

    pub fn options(mut self, options: MetricOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_fn(&self) -> Option<&ComputeFn<E>> {
        self.compute.as_ref()
    }

    pub fn aggregate_template(&self) -> Option<&str> {
        self.aggregate.as_deref()
    }

    pub fn metric_options(&self) -> &MetricOptions {
        &self.options
    }

    fn validate(&self) -> MetricsResult<()> {
        if self.name.is_empty() {
            return Err(MetricsError::invalid("metric name must not be empty"));
        }
        if self.compute.is_none() && self.aggregate.is_none() {
            return Err(MetricsError::invalid(format!(
                "metric {} needs a compute function or an aggregate template",
                self.name
            )));
        }
        Ok(())
    }
}

impl<E> Clone for MetricDefinition<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            compute: self.compute.clone(),
            aggregate: self.aggregate.clone(),
            options: self.options.clone(),
        }
    }
}

impl<E> fmt::Debug for MetricDefinition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("name", &self.name)
            .field("compute", &self.compute.is_some())
            .field("aggregate", &self.aggregate)
            .field("options", &self.options)
            .finish()
    }
}

/// Where an entity type's cached metric values live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBinding {
    /// A side table keyed by the entity id.
    Companion { table: String },
    /// Metric columns live on the entity's own table.
    SelfStoring { table: String },
}

impl StoreBinding {
    pub fn companion(table: impl Into<String>) -> Self {
        Self::Companion {
            table: table.into(),
        }
    }

    pub fn self_storing(table: impl Into<String>) -> Self {
        Self::SelfStoring {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Companion { table } | Self::SelfStoring { table } => table,
        }
    }

    pub fn is_self_storing(&self) -> bool {
        matches!(self, Self::SelfStoring { .. })
    }
}

/// Per-type registration record: the metric store binding plus the ordered
/// metric definitions.
pub struct EntityType<E> {
    id: String,
    store: StoreBinding,
    segment_categories: Vec<String>,
    metrics: Vec<MetricDefinition<E>>,
}

impl<E> EntityType<E> {
    pub fn new(id: impl Into<String>, store: StoreBinding) -> Self {
        Self {
            id: id.into(),
            store,
            segment_categories: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn with_segment_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.segment_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &StoreBinding {
        &self.store
    }

    /// Register (or replace) a computed metric and return its accessor.
    pub fn metric<F>(
        &mut self,
        name: impl Into<String>,
        options: MetricOptions,
        compute: F,
    ) -> MetricAccessor<E>
    where
        F: Fn(&E, &dyn QueryScope) -> MetricsResult<MetricValue> + Send + Sync + 'static,
    {
        let definition = MetricDefinition::new(name).options(options).compute(compute);
        let accessor = MetricAccessor::new(definition.name());
        self.insert(definition);
        accessor
    }

    pub fn aggregate_metric(
        &mut self,
        name: impl Into<String>,
        template: impl Into<String>,
    ) -> MetricsResult<()> {
        self.define(MetricDefinition::new(name).aggregate(template))
            .map(|_| ())
    }

    /// Insert a fully built definition. Returns an accessor when the
    /// definition can be evaluated per instance.
    pub fn define(
        &mut self,
        definition: MetricDefinition<E>,
    ) -> MetricsResult<Option<MetricAccessor<E>>> {
        definition.validate()?;
        let accessor = definition
            .compute
            .as_ref()
            .map(|_| MetricAccessor::new(definition.name()));
        self.insert(definition);
        Ok(accessor)
    }

    fn insert(&mut self, definition: MetricDefinition<E>) {
        match self
            .metrics
            .iter_mut()
            .find(|existing| existing.name == definition.name)
        {
            Some(existing) => *existing = definition,
            None => self.metrics.push(definition),
        }
    }

    pub fn definition(&self, name: &str) -> Option<&MetricDefinition<E>> {
        self.metrics.iter().find(|definition| definition.name == name)
    }

    pub fn metrics(&self) -> &[MetricDefinition<E>] {
        &self.metrics
    }

    pub fn names(&self) -> Vec<String> {
        self.metrics
            .iter()
            .map(|definition| definition.name.clone())
            .collect()
    }

    pub fn remove_metric(&mut self, name: &str) -> Option<MetricDefinition<E>> {
        let index = self
            .metrics
            .iter()
            .position(|definition| definition.name == name)?;
        Some(self.metrics.remove(index))
    }

    /// Take every definition out, leaving the type with no metrics.
    pub fn clear_metrics(&mut self) -> Vec<MetricDefinition<E>> {
        std::mem::take(&mut self.metrics)
    }

    pub fn restore_metrics(&mut self, metrics: Vec<MetricDefinition<E>>) {
        self.metrics = metrics;
    }

    /// Storage type for a metric column (or its timestamp companion).
    pub fn value_type(&self, column: &str) -> ColumnType {
        if let Some(column_type) = self
            .definition(column)
            .and_then(|definition| definition.options.column_type)
        {
            return column_type;
        }
        if let Some(category) = column.strip_prefix("by_") {
            if self
                .segment_categories
                .iter()
                .any(|candidate| candidate == category)
            {
                return ColumnType::String;
            }
        }
        if column.ends_with("_at") {
            return ColumnType::DateTime;
        }
        ColumnType::Integer
    }

    /// Metrics without a declared aggregate template.
    pub fn single_only(&self) -> Vec<&MetricDefinition<E>> {
        self.metrics
            .iter()
            .filter(|definition| definition.aggregate.is_none())
            .collect()
    }

    pub fn aggregate_metrics(&self) -> Vec<&MetricDefinition<E>> {
        self.metrics
            .iter()
            .filter(|definition| definition.aggregate.is_some())
            .collect()
    }
}

impl<E> fmt::Debug for EntityType<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("segment_categories", &self.segment_categories)
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Convenience handle for one registered metric.
pub struct MetricAccessor<E> {
    name: String,
    _entity: PhantomData<fn(&E)>,
}

impl<E> MetricAccessor<E> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<E: Entity> MetricAccessor<E> {
    pub fn get<B: MetricBackend>(
        &self,
        ctx: &MetricsContext<'_, B>,
        entity_type: &EntityType<E>,
        instance: &mut Instance<E>,
        force: bool,
    ) -> MetricsResult<MetricValue> {
        evaluate(ctx, entity_type, instance, &self.name, force)
    }
}

impl<E> Clone for MetricAccessor<E> {
    fn clone(&self) -> Self {
        Self::new(&self.name)
    }
}

impl<E> fmt::Debug for MetricAccessor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetricAccessor").field(&self.name).finish()
    }
}

/// Entity types keyed by caller-supplied identifiers.
///
/// Registration is expected to finish before evaluation starts; the registry
/// itself is not synchronised.
#[derive(Default)]
pub struct MetricRegistry {
    types: BTreeMap<String, Box<dyn Any + Send + Sync>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type<E: 'static>(
        &mut self,
        entity_type: EntityType<E>,
    ) -> MetricsResult<&mut EntityType<E>> {
        let id = entity_type.id.clone();
        self.types.insert(id.clone(), Box::new(entity_type));
        self.entity_type_mut(&id)
    }

    pub fn entity_type<E: 'static>(&self, id: &str) -> MetricsResult<&EntityType<E>> {
        self.types
            .get(id)
            .ok_or_else(|| MetricsError::not_found(format!("entity type {id}")))?
            .downcast_ref::<EntityType<E>>()
            .ok_or_else(|| MetricsError::invalid(format!("entity type {id} has another entity")))
    }

    pub fn entity_type_mut<E: 'static>(&mut self, id: &str) -> MetricsResult<&mut EntityType<E>> {
        self.types
            .get_mut(id)
            .ok_or_else(|| MetricsError::not_found(format!("entity type {id}")))?
            .downcast_mut::<EntityType<E>>()
            .ok_or_else(|| MetricsError::invalid(format!("entity type {id} has another entity")))
    }

    pub fn unregister_type(&mut self, id: &str) -> bool {
        self.types.remove(id).is_some()
    }

    pub fn type_ids(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.types.clear();
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}
