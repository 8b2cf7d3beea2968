//! Reconciles the metric store's columns with the registered metrics.

use crate::backend::{ColumnSpec, SchemaInspector, SchemaMutator};
use crate::record::{is_reserved, timestamp_column};
use crate::registry::EntityType;
use crate::{MetricsError, MetricsResult};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaChanges {
    pub created_table: bool,
    pub dropped: Vec<String>,
    pub added: Vec<String>,
}

impl SchemaChanges {
    pub fn is_empty(&self) -> bool {
        !self.created_table && self.dropped.is_empty() && self.added.is_empty()
    }
}

/// Metric names followed by their timestamp companions.
pub fn required_columns<E>(entity_type: &EntityType<E>) -> Vec<String> {
    let names = entity_type.names();
    let stamps: Vec<String> = names.iter().map(|name| timestamp_column(name)).collect();
    names.into_iter().chain(stamps).collect()
}

fn managed_columns<B: SchemaInspector + ?Sized>(
    backend: &B,
    table: &str,
) -> MetricsResult<Vec<String>> {
    backend.refresh_columns(table);
    Ok(backend
        .columns(table)?
        .into_iter()
        .map(|column| column.name)
        .filter(|name| !is_reserved(name))
        .collect())
}

pub fn missing_columns<E, B>(backend: &B, entity_type: &EntityType<E>) -> MetricsResult<Vec<String>>
where
    B: SchemaInspector + ?Sized,
{
    let existing = managed_columns(backend, entity_type.store().table())?;
    Ok(required_columns(entity_type)
        .into_iter()
        .filter(|column| !existing.contains(column))
        .collect())
}

/// Managed columns no registered metric accounts for. Fails on self-storing
/// types, where entity columns cannot be told apart from stale metrics.
pub fn extra_columns<E, B>(backend: &B, entity_type: &EntityType<E>) -> MetricsResult<Vec<String>>
where
    B: SchemaInspector + ?Sized,
{
    let store = entity_type.store();
    if store.is_self_storing() {
        return Err(MetricsError::schema_ambiguity(store.table()));
    }
    let required = required_columns(entity_type);
    Ok(managed_columns(backend, store.table())?
        .into_iter()
        .filter(|column| !required.contains(column))
        .collect())
}

/// Drop extra columns, then add missing ones. A no-op for self-storing types.
pub fn migrate<E, B>(backend: &B, entity_type: &EntityType<E>) -> MetricsResult<SchemaChanges>
where
    B: SchemaInspector + SchemaMutator + ?Sized,
{
    let mut changes = SchemaChanges::default();
    let store = entity_type.store();
    if store.is_self_storing() {
        return Ok(changes);
    }
    let table = store.table();

    if !backend.table_exists(table)? {
        backend
            .create_store_table(table)
            .map_err(|err| MetricsError::schema_migration(format!("create {table}: {err}")))?;
        log::info!("created metric store {table}");
        changes.created_table = true;
    }

    for column in extra_columns(backend, entity_type)? {
        backend.drop_column(table, &column).map_err(|err| {
            MetricsError::schema_migration(format!("drop {table}.{column}: {err}"))
        })?;
        log::info!("dropped metric column {table}.{column}");
        changes.dropped.push(column);
    }

    for column in missing_columns(backend, entity_type)? {
        let spec = ColumnSpec::for_type(column.as_str(), entity_type.value_type(&column));
        backend.add_column(table, &spec).map_err(|err| {
            MetricsError::schema_migration(format!("add {table}.{column}: {err}"))
        })?;
        log::info!(
            "added metric column {table}.{column} ({})",
            spec.column_type.as_str()
        );
        changes.added.push(column);
    }

    backend.refresh_columns(table);
    Ok(changes)
}

/// Drop every managed column and add them back from scratch.
pub fn remigrate<E, B>(backend: &B, entity_type: &mut EntityType<E>) -> MetricsResult<SchemaChanges>
where
    B: SchemaInspector + SchemaMutator + ?Sized,
{
    let snapshot = entity_type.clear_metrics();
    let cleared = migrate(backend, entity_type);
    entity_type.restore_metrics(snapshot);
    let cleared = cleared?;
    let mut rebuilt = migrate(backend, entity_type)?;
    rebuilt.created_table |= cleared.created_table;
    rebuilt.dropped = cleared.dropped;
    Ok(rebuilt)
}
