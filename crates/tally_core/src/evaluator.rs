//! Per-instance metric evaluation with caching and staleness.

use time::OffsetDateTime;

use crate::backend::{Entity, MetricBackend};
use crate::clock::format_timestamp;
use crate::context::MetricsContext;
use crate::record::timestamp_column;
use crate::registry::{EntityType, Frequency, StoreBinding};
use crate::{MetricRecord, MetricValue, MetricsError, MetricsResult};

/// An entity together with its lazily loaded metric record.
#[derive(Debug)]
pub struct Instance<E> {
    entity: E,
    record: Option<MetricRecord>,
}

impl<E: Entity> Instance<E> {
    pub fn new(entity: E) -> Self {
        Self {
            entity,
            record: None,
        }
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn into_entity(self) -> E {
        self.entity
    }

    /// The loaded record, if any access has loaded it yet.
    pub fn record(&self) -> Option<&MetricRecord> {
        self.record.as_ref()
    }

    /// Find-or-create the metric record on first use.
    pub fn metrics<B: MetricBackend>(
        &mut self,
        backend: &B,
        store: &StoreBinding,
    ) -> MetricsResult<&mut MetricRecord> {
        let record = match self.record.take() {
            Some(record) => record,
            None => backend.find_or_create_record(store.table(), self.entity.id())?,
        };
        Ok(self.record.insert(record))
    }

    /// Drop the cached record so the next access reloads it.
    pub fn reload(&mut self) {
        self.record = None;
    }

    /// Persist a record whose save was deferred. Returns whether anything was
    /// written.
    pub fn flush<B: MetricBackend>(&mut self, backend: &B) -> MetricsResult<bool> {
        match self.record {
            Some(ref mut record) if record.is_dirty() => {
                backend.save_record(record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Compute (or reuse) one metric for one entity.
///
/// Cached values are reused unless `force` is set, the metric is `once` and
/// already has a value, or the last computation is younger than the metric's
/// frequency. A fresh value is written to the record and saved right away
/// unless the entity has pending changes.
pub fn evaluate<E, B>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    instance: &mut Instance<E>,
    name: &str,
    force: bool,
) -> MetricsResult<MetricValue>
where
    E: Entity,
    B: MetricBackend,
{
    let definition = entity_type.definition(name).ok_or_else(|| {
        MetricsError::not_found(format!("metric {name} on {}", entity_type.id()))
    })?;
    let compute = definition.compute_fn().ok_or_else(|| {
        MetricsError::invalid(format!("metric {name} has no compute function"))
    })?;
    let options = definition.metric_options();
    let frequency = options
        .frequency
        .unwrap_or_else(|| Frequency::Every(ctx.config().default_frequency()));

    let record = instance.metrics(ctx.backend(), entity_type.store())?;
    if !force {
        if let Frequency::Every(window) = frequency {
            let previous = record.get(name).cloned().unwrap_or(MetricValue::Null);
            if options.once && !previous.is_null() {
                return Ok(previous);
            }
            if let Some(computed_at) = record.computed_at(name) {
                if ctx.now() - computed_at < window {
                    return Ok(previous);
                }
            }
        }
    }

    let value = compute(instance.entity(), ctx.backend())
        .map_err(|err| MetricsError::compute(name, err))?
        .normalized();

    let now = ctx.now();
    let record = instance.metrics(ctx.backend(), entity_type.store())?;
    match write_value(record, name, &value, now) {
        Ok(()) => {}
        Err(MetricsError::PendingColumn { column }) => {
            log::debug!("metric column {column} not migrated yet; returning {name} unsaved");
        }
        Err(err) => return Err(err),
    }

    if instance.entity().has_pending_changes() {
        log::debug!(
            "deferring {name} for {} {}: entity has unsaved changes",
            entity_type.id(),
            instance.entity().id()
        );
    } else {
        instance.flush(ctx.backend())?;
    }
    Ok(value)
}

fn write_value(
    record: &mut MetricRecord,
    name: &str,
    value: &MetricValue,
    now: OffsetDateTime,
) -> MetricsResult<()> {
    record.set(name, value.clone())?;
    record.set(
        &timestamp_column(name),
        MetricValue::Text(format_timestamp(now)?),
    )
}

/// Evaluate every computed metric of the type on one entity.
pub fn evaluate_all<E, B>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    instance: &mut Instance<E>,
    force: bool,
) -> MetricsResult<Vec<(String, MetricValue)>>
where
    E: Entity,
    B: MetricBackend,
{
    let mut values = Vec::new();
    for definition in entity_type.metrics() {
        if definition.compute_fn().is_none() {
            continue;
        }
        let value = evaluate(ctx, entity_type, instance, definition.name(), force)?;
        values.push((definition.name().to_string(), value));
    }
    Ok(values)
}

/// Remove the metric row of a destroyed entity.
pub fn destroy_record<E, B>(backend: &B, entity_type: &EntityType<E>, id: i64) -> MetricsResult<()>
where
    B: MetricBackend,
{
    if entity_type.store().is_self_storing() {
        return Ok(());
    }
    backend.delete_record(entity_type.store().table(), id)
}
