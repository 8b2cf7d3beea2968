//! Detects metrics whose compute function can run as one bulk UPDATE.
//!
//! The compute function is traced against a sample entity. When it issued
//! exactly one fetch, the sample id inside that fetch is swapped for a
//! reference to the metric store's id column and the fetch becomes a
//! correlated subquery of an `UPDATE` over every row.

use crate::backend::{Entity, MetricBackend, OperationKind, TracedOp};
use crate::clock::format_timestamp;
use crate::context::MetricsContext;
use crate::record::timestamp_column;
use crate::registry::EntityType;
use crate::{MetricsError, MetricsResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedAggregate {
    pub metric: String,
    pub statement: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Detection {
    pub detected: Vec<DetectedAggregate>,
    pub singular: Vec<String>,
}

pub fn collect_metrics<E, B>(
    ctx: &MetricsContext<'_, B>,
    entity_type: &EntityType<E>,
    sample: &E,
) -> MetricsResult<Detection>
where
    E: Entity,
    B: MetricBackend,
{
    let table = entity_type.store().table();
    let stamp = format_timestamp(ctx.now())?;
    let mut detection = Detection::default();

    for definition in entity_type.single_only() {
        let Some(compute) = definition.compute_fn() else {
            continue;
        };
        let name = definition.name();
        let (outcome, ops) = ctx
            .backend()
            .with_operation_trace(|| compute(sample, ctx.backend()));
        outcome.map_err(|err| MetricsError::compute(name, err))?;

        match correlated_subquery(&ops, sample.id(), table) {
            Some(subquery) => {
                log::debug!("{name}: detected aggregate over {table}");
                detection.detected.push(DetectedAggregate {
                    metric: name.to_string(),
                    statement: bulk_statement(table, name, &subquery, &stamp),
                });
            }
            None => {
                log::debug!("{name}: singular ({} operations traced)", ops.len());
                detection.singular.push(name.to_string());
            }
        }
    }

    Ok(detection)
}

/// The single traced fetch rewritten to correlate with `table`'s rows, or
/// `None` when the trace cannot be turned into a bulk statement.
///
/// A by-id lookup only hands a raw column to the compute function, which may
/// transform it further, so it never counts as an aggregate.
pub fn correlated_subquery(ops: &[TracedOp], sample_id: i64, table: &str) -> Option<String> {
    let [op] = ops else {
        return None;
    };
    if matches!(op.kind, OperationKind::Lookup { .. }) {
        return None;
    }
    let subquery = correlate(op, sample_id, table)?;
    if is_self_lookup(&subquery, table) {
        return None;
    }
    Some(subquery)
}

/// Inline the parameters of `op`, replacing the sample id with `table.id`.
pub fn correlate(op: &TracedOp, sample_id: i64, table: &str) -> Option<String> {
    let correlation = format!("{}.{}", quote_ident(table), quote_ident("id"));
    let mut params = op.params.iter();
    let mut sql = String::with_capacity(op.sql.len() + correlation.len());
    let mut quote: Option<char> = None;

    for ch in op.sql.chars() {
        match quote {
            Some(open) => {
                if ch == open {
                    quote = None;
                }
                sql.push(ch);
            }
            None if ch == '\'' || ch == '"' || ch == '`' => {
                quote = Some(ch);
                sql.push(ch);
            }
            None if ch == '?' => {
                let param = params.next()?;
                if param.integer == Some(sample_id) {
                    sql.push_str(&correlation);
                } else {
                    sql.push_str(&param.literal);
                }
            }
            None => sql.push(ch),
        }
    }

    if params.next().is_some() {
        return None;
    }
    Some(sql)
}

/// True when `subquery` merely reads the store row itself by id.
fn is_self_lookup(subquery: &str, table: &str) -> bool {
    let normalized: String = subquery
        .replace(['"', '`'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let table = table.to_ascii_lowercase();
    let from = format!(" from {table} where ");
    let Some(position) = normalized.find(&from) else {
        return false;
    };
    let predicate = normalized[position + from.len()..]
        .trim_end_matches(" limit 1")
        .trim();
    let correlation = format!("{table}.id");
    predicate == format!("{correlation} = {correlation}") || predicate == format!("id = {correlation}")
}

pub fn bulk_statement(table: &str, metric: &str, subquery: &str, stamp: &str) -> String {
    format!(
        "UPDATE {} SET {} = ({subquery}), {} = '{stamp}'",
        quote_ident(table),
        quote_ident(metric),
        quote_ident(&timestamp_column(metric)),
    )
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::{bulk_statement, correlate, correlated_subquery, quote_ident};
    use crate::backend::{OperationKind, TracedOp, TracedParam};

    fn int(value: i64) -> TracedParam {
        TracedParam {
            literal: value.to_string(),
            integer: Some(value),
        }
    }

    fn text(value: &str) -> TracedParam {
        TracedParam {
            literal: format!("'{value}'"),
            integer: None,
        }
    }

    fn query(sql: &str, params: Vec<TracedParam>) -> TracedOp {
        TracedOp {
            kind: OperationKind::Query,
            sql: sql.to_string(),
            params,
        }
    }

    #[test]
    fn sample_id_becomes_correlation() {
        let op = query(
            r#"SELECT COUNT(*) FROM "pets" WHERE "pets"."user_id" = ? AND "pets"."age" > ?"#,
            vec![int(7), int(2)],
        );
        let sql = correlate(&op, 7, "user_metrics").expect("correlated");
        assert_eq!(
            sql,
            r#"SELECT COUNT(*) FROM "pets" WHERE "pets"."user_id" = "user_metrics"."id" AND "pets"."age" > 2"#
        );
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let op = query(
            r#"SELECT COUNT(*) FROM "pets" WHERE "name" <> 'why?' AND "user_id" = ? AND "type" = ?"#,
            vec![int(3), text("cat")],
        );
        let sql = correlate(&op, 3, "user_metrics").expect("correlated");
        assert!(sql.contains("'why?'"));
        assert!(sql.ends_with(r#""user_id" = "user_metrics"."id" AND "type" = 'cat'"#));
    }

    #[test]
    fn parameter_count_mismatch_is_not_rewritten() {
        let op = query("SELECT ? + ?", vec![int(1)]);
        assert!(correlate(&op, 1, "t").is_none());
        let op = query("SELECT 1", vec![int(1)]);
        assert!(correlate(&op, 1, "t").is_none());
    }

    #[test]
    fn zero_or_many_operations_are_singular() {
        assert!(correlated_subquery(&[], 1, "user_metrics").is_none());
        let op = query(r#"SELECT MAX("age") FROM "pets" WHERE "user_id" = ?"#, vec![int(1)]);
        assert!(correlated_subquery(&[op.clone(), op.clone()], 1, "user_metrics").is_none());
        assert!(correlated_subquery(&[op], 1, "user_metrics").is_some());
    }

    #[test]
    fn reading_the_store_row_is_singular() {
        let lookup = TracedOp {
            kind: OperationKind::Lookup {
                table: "user_metrics".into(),
            },
            sql: r#"SELECT "pets_count" FROM "user_metrics" WHERE "id" = ? LIMIT ?"#.into(),
            params: vec![int(4), int(1)],
        };
        assert!(correlated_subquery(&[lookup], 4, "user_metrics").is_none());

        let select_all = query(
            r#"SELECT * FROM "user_metrics" WHERE "user_metrics"."id" = ? LIMIT 1"#,
            vec![int(4)],
        );
        assert!(correlated_subquery(&[select_all], 4, "user_metrics").is_none());
    }

    #[test]
    fn lookups_on_any_table_are_singular() {
        let lookup = TracedOp {
            kind: OperationKind::Lookup {
                table: "users".into(),
            },
            sql: r#"SELECT "name" FROM "users" WHERE "id" = ? LIMIT ?"#.into(),
            params: vec![int(4), int(1)],
        };
        assert!(correlated_subquery(&[lookup.clone()], 4, "user_metrics").is_none());
        // the same statement issued as a plain query still correlates
        let as_query = TracedOp {
            kind: OperationKind::Query,
            ..lookup
        };
        assert_eq!(
            correlated_subquery(&[as_query], 4, "user_metrics").as_deref(),
            Some(r#"SELECT "name" FROM "users" WHERE "id" = "user_metrics"."id" LIMIT 1"#)
        );
    }

    #[test]
    fn bulk_statement_sets_value_and_stamp() {
        let sql = bulk_statement(
            "user_metrics",
            "pets_count",
            "SELECT 1",
            "2024-01-01T00:00:00Z",
        );
        assert_eq!(
            sql,
            r#"UPDATE "user_metrics" SET "pets_count" = (SELECT 1), "updated_pets_count_at" = '2024-01-01T00:00:00Z'"#
        );
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }
}
