//! Filter attributes to `events` columns, and typed parameter binding.
//!
//! Filter values arrive as untyped JSON. Each column has one SQL type, so a
//! value that does not fit its column is bound as `NULL`, which never
//! compares true. Literals go through the same coercion the in-process
//! predicate applies ([`coerce_integer`], [`coerce_timestamp`]), so both
//! select the same events.

use evlog_core::event_store::EventStoreError;
use evlog_core::filter::{Filters, SqlParam, SqlValue, coerce_integer, coerce_timestamp};
use serde_json::Value;
use sqlx::Arguments;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;

/// SQL type of an `events` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    BigInt,
    Timestamp,
    Text,
    Json,
}

/// Column backing a filterable attribute, if any.
pub(crate) fn column_for(attribute: &str) -> Option<(&'static str, ColumnKind)> {
    let column = match attribute {
        "id" => ("id", ColumnKind::BigInt),
        "timestamp" => ("timestamp", ColumnKind::Timestamp),
        "processId" => ("process_id", ColumnKind::Text),
        "connectionId" => ("connection_id", ColumnKind::Text),
        "sessionId" => ("session_id", ColumnKind::Text),
        "ipAddress" => ("ip_address", ColumnKind::Text),
        "aggregateRoot" => ("aggregate_root", ColumnKind::Text),
        "actor" => ("actor", ColumnKind::Json),
        _ => return None,
    };
    Some(column)
}

/// Rewrite camelCase attributes to column names.
///
/// Returns `None` if any attribute has no column: such a filter can match
/// nothing, and the caller short-circuits instead of sending invalid SQL.
pub(crate) fn to_columns(filters: &Filters) -> Option<Filters> {
    if filters.iter().any(|(attribute, _)| column_for(attribute).is_none()) {
        return None;
    }
    Some(filters.clone().map_attributes(|attribute| {
        column_for(attribute).map_or_else(|| attribute.to_string(), |(column, _)| column.to_string())
    }))
}

/// Append bound parameters for a rendered clause over column names.
pub(crate) fn push_params(args: &mut PgArguments, params: &[SqlParam]) -> Result<(), EventStoreError> {
    for param in params {
        let kind = column_kind(&param.attribute);
        let result = match (&param.value, kind) {
            (SqlValue::Scalar(v), ColumnKind::BigInt) => args.add(coerce_integer(v)),
            (SqlValue::Scalar(v), ColumnKind::Timestamp) => args.add(coerce_timestamp(v)),
            (SqlValue::Scalar(v), ColumnKind::Text) => args.add(v.as_str().map(str::to_string)),
            (SqlValue::Scalar(v), ColumnKind::Json) => args.add((!v.is_null()).then(|| Json(v.clone()))),
            (SqlValue::Array(vs), ColumnKind::BigInt) => {
                args.add(vs.iter().filter_map(coerce_integer).collect::<Vec<_>>())
            }
            (SqlValue::Array(vs), ColumnKind::Timestamp) => {
                args.add(vs.iter().filter_map(coerce_timestamp).collect::<Vec<_>>())
            }
            (SqlValue::Array(vs), ColumnKind::Text) => args.add(
                vs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            ),
            (SqlValue::Array(vs), ColumnKind::Json) => args.add(
                vs.iter()
                    .filter(|v| !v.is_null())
                    .cloned()
                    .map(Json)
                    .collect::<Vec<_>>(),
            ),
        };
        result.map_err(|e| {
            EventStoreError::DatabaseError(format!("Failed to bind '{}': {e}", param.attribute))
        })?;
    }
    Ok(())
}

fn column_kind(column: &str) -> ColumnKind {
    match column {
        "id" => ColumnKind::BigInt,
        "timestamp" => ColumnKind::Timestamp,
        "actor" => ColumnKind::Json,
        _ => ColumnKind::Text,
    }
}
