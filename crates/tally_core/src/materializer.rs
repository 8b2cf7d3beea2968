//! Full-population recomputation of an entity type's metrics.

use crate::backend::{Entity, EntitySource, MetricBackend};
use crate::context::MetricsContext;
use crate::detector::collect_metrics;
use crate::evaluator::{evaluate, Instance};
use crate::record::timestamp_column;
use crate::registry::EntityType;
use crate::schema::{migrate, SchemaChanges};
use crate::{MetricsError, MetricsResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaterializeOptions {
    /// Recompute per-row metrics even when their cached values are fresh.
    pub force: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Every registered metric, in registration order.
    pub metrics: Vec<String>,
    pub schema: SchemaChanges,
    pub detected: Vec<String>,
    pub singular: Vec<String>,
    pub bad_guesses: Vec<String>,
    pub declared: Vec<String>,
    /// Entities visited by per-row passes, counted once per pass.
    pub rows_evaluated: u64,
}

/// Reconcile the schema, then recompute every metric for the whole population.
///
/// Per-row passes commit one transaction per batch, so a failure leaves
/// earlier batches updated. Generated bulk statements that fail are retried
/// per row; declared aggregate templates that fail abort the run.
pub fn update_all<E, B, S>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    source: &S,
    options: MaterializeOptions,
) -> MetricsResult<MaterializeReport>
where
    E: Entity,
    B: MetricBackend,
    S: EntitySource<E> + ?Sized,
{
    ctx.config().validate()?;
    let schema = migrate(ctx.backend(), entity_type)?;
    let mut report = MaterializeReport {
        metrics: entity_type.names(),
        schema,
        ..MaterializeReport::default()
    };

    if source.count()? == 0 {
        return Ok(report);
    }
    let Some(sample) = source.first()? else {
        return Ok(report);
    };
    let detection = collect_metrics(ctx, entity_type, &sample)?;

    if !detection.singular.is_empty() {
        if ctx.config().advisories_enabled() {
            advise_slow_metrics(entity_type.id(), &detection.singular);
        }
        report.rows_evaluated +=
            evaluate_in_batches(ctx, entity_type, source, &detection.singular, options.force)?;
    }
    report.singular = detection.singular;

    let backend = ctx.backend();
    let has_bulk = !detection.detected.is_empty() || !entity_type.aggregate_metrics().is_empty();
    if has_bulk && !entity_type.store().is_self_storing() {
        let created = ensure_store_rows(ctx, entity_type, source)?;
        log::debug!("{}: created {created} store rows", entity_type.id());
    }
    for aggregate in detection.detected {
        match backend.execute(&aggregate.statement) {
            Ok(rows) => {
                log::debug!("{}: bulk update touched {rows} rows", aggregate.metric);
                report.detected.push(aggregate.metric);
            }
            Err(err) => {
                let err = MetricsError::detected_aggregate(&aggregate.metric, err);
                log::warn!("{err}; scheduling as singular");
                report.bad_guesses.push(aggregate.metric);
            }
        }
    }
    if !report.bad_guesses.is_empty() {
        if ctx.config().advisories_enabled() {
            println!(
                "{} bad guesses found, scheduling as singular metrics.",
                report.bad_guesses.len()
            );
        }
        report.rows_evaluated +=
            evaluate_in_batches(ctx, entity_type, source, &report.bad_guesses, options.force)?;
    }

    let table = entity_type.store().table();
    for definition in entity_type.aggregate_metrics() {
        let name = definition.name();
        let Some(template) = definition.aggregate_template() else {
            continue;
        };
        backend
            .execute(template)
            .map_err(|err| MetricsError::declared_aggregate(name, err))?;
        backend
            .stamp_column(table, &timestamp_column(name), ctx.now())
            .map_err(|err| MetricsError::declared_aggregate(name, err))?;
        report.declared.push(name.to_string());
    }

    log::info!(
        "materialized {} metrics for {}: {} detected, {} singular, {} bad guesses, {} declared",
        report.metrics.len(),
        entity_type.id(),
        report.detected.len(),
        report.singular.len(),
        report.bad_guesses.len(),
        report.declared.len()
    );
    Ok(report)
}

fn evaluate_in_batches<E, B, S>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    source: &S,
    names: &[String],
    force: bool,
) -> MetricsResult<u64>
where
    E: Entity,
    B: MetricBackend,
    S: EntitySource<E> + ?Sized,
{
    let table = entity_type.store().table();
    let mut visited = 0u64;
    source.for_each_batch(ctx.config().batch_size, &mut |batch| {
        let size = batch.len() as u64;
        ctx.backend().transaction(table, || {
            for entity in batch {
                let mut instance = Instance::new(entity);
                for name in names {
                    evaluate(ctx, entity_type, &mut instance, name, force)?;
                }
            }
            Ok(())
        })?;
        visited += size;
        log::debug!("{}: evaluated {visited} rows", entity_type.id());
        Ok(())
    })?;
    Ok(visited)
}

/// Bulk statements only update rows that exist, so give every entity one.
fn ensure_store_rows<E, B, S>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    source: &S,
) -> MetricsResult<usize>
where
    E: Entity,
    B: MetricBackend,
    S: EntitySource<E> + ?Sized,
{
    let table = entity_type.store().table();
    let mut created = 0;
    source.for_each_batch(ctx.config().batch_size, &mut |batch| {
        let ids: Vec<i64> = batch.iter().map(Entity::id).collect();
        created += ctx
            .backend()
            .transaction(table, || ctx.backend().ensure_records(table, &ids))?;
        Ok(())
    })?;
    Ok(created)
}

fn advise_slow_metrics(type_id: &str, singular: &[String]) {
    println!("Slow Metrics Found :: {}", singular.len());
    println!(" --  --  --  -- ");
    println!("Go implement their aggregate methods in {type_id} to speed this up.");
    println!("{}", singular.join(", "));
    println!();
}
