//! Conversions between JSON payload values and typed physical columns.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use duckdb::types::Value as SqlValue;
use plugstore_model::{canonical_json, is_scalar, StorageColumnType, StorageDdlColumnSpec};
use serde_json::{Number, Value};

/// Layout DuckDB uses when a TIMESTAMP is cast to VARCHAR.
const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A payload value ready for binding, with its read-back JSON form.
#[derive(Debug, Clone)]
pub(crate) struct Encoded {
    pub sql: SqlValue,
    pub json: Value,
}

/// Bind placeholder for a column; timestamps travel as text.
pub(crate) fn placeholder(column_type: StorageColumnType) -> &'static str {
    match column_type {
        StorageColumnType::Datetime => "CAST(? AS TIMESTAMP)",
        _ => "?",
    }
}

/// Select expression for a column, so every type reads back through a plain Rust type.
pub(crate) fn select_expr(column: &StorageDdlColumnSpec, quoted: &str) -> String {
    match column.column_type {
        StorageColumnType::Datetime => format!("CAST({quoted} AS VARCHAR)"),
        _ => quoted.to_string(),
    }
}

/// Validate and convert one payload value for `column`.
///
/// `for_query` restricts JSON columns to scalar values.
pub(crate) fn encode_value(
    column: &StorageDdlColumnSpec,
    nullable: bool,
    value: &Value,
    for_query: bool,
) -> StorageResult<Encoded> {
    let name = &column.name;
    if value.is_null() {
        if !nullable {
            return Err(StorageError::not_allowed(format!("Field '{name}' does not allow null")));
        }
        return Ok(Encoded {
            sql: SqlValue::Null,
            json: Value::Null,
        });
    }

    let expects = |what: &str| StorageError::not_allowed(format!("Field '{name}' expects {what}"));

    match column.column_type {
        StorageColumnType::String => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(expects("string")),
            };
            Ok(Encoded {
                sql: SqlValue::Text(text.clone()),
                json: Value::String(text),
            })
        }
        StorageColumnType::Integer => {
            let n = value.as_i64().ok_or_else(|| expects("integer"))?;
            Ok(Encoded {
                sql: SqlValue::BigInt(n),
                json: Value::from(n),
            })
        }
        StorageColumnType::Number => {
            let n = match value {
                Value::Number(n) => n.as_f64().ok_or_else(|| expects("number"))?,
                _ => return Err(expects("number")),
            };
            Ok(Encoded {
                sql: SqlValue::Double(n),
                json: Number::from_f64(n).map_or(Value::Null, Value::Number),
            })
        }
        StorageColumnType::Boolean => {
            let b = value.as_bool().ok_or_else(|| expects("boolean"))?;
            Ok(Encoded {
                sql: SqlValue::Boolean(b),
                json: Value::Bool(b),
            })
        }
        StorageColumnType::Json => {
            if for_query && !is_scalar(value) {
                return Err(StorageError::not_allowed(format!(
                    "Field '{name}' supports scalar equality only"
                )));
            }
            let text = canonical_json(value)
                .map_err(|_| StorageError::not_allowed(format!("Field '{name}' must be JSON serializable")))?;
            Ok(Encoded {
                sql: SqlValue::Text(text),
                json: value.clone(),
            })
        }
        StorageColumnType::Datetime => {
            let text = value.as_str().ok_or_else(|| expects("datetime (ISO-8601 string)"))?;
            let parsed = parse_datetime(text).ok_or_else(|| expects("datetime (ISO-8601 string)"))?;
            Ok(Encoded {
                sql: SqlValue::Text(parsed.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
                json: Value::String(parsed.to_rfc3339()),
            })
        }
    }
}

/// Parse an ISO-8601 timestamp. Naive values are read as UTC.
pub(crate) fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", SQL_TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Read column `idx` of a result row as JSON according to its declared type.
pub(crate) fn decode_column(
    row: &duckdb::Row<'_>,
    idx: usize,
    column: &StorageDdlColumnSpec,
) -> duckdb::Result<Value> {
    let value = match column.column_type {
        StorageColumnType::String => row.get::<_, Option<String>>(idx)?.map(Value::String),
        StorageColumnType::Integer => row.get::<_, Option<i64>>(idx)?.map(Value::from),
        StorageColumnType::Number => row
            .get::<_, Option<f64>>(idx)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        StorageColumnType::Boolean => row.get::<_, Option<bool>>(idx)?.map(Value::Bool),
        StorageColumnType::Json => row
            .get::<_, Option<String>>(idx)?
            .and_then(|text| serde_json::from_str(&text).ok()),
        StorageColumnType::Datetime => row.get::<_, Option<String>>(idx)?.map(|text| {
            NaiveDateTime::parse_from_str(&text, SQL_TIMESTAMP_FORMAT)
                .map(|naive| Value::String(naive.and_utc().to_rfc3339()))
                .unwrap_or(Value::String(text))
        }),
    };
    Ok(value.unwrap_or(Value::Null))
}
