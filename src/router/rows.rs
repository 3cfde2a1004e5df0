//! Binds a loosely-typed parameter list onto a `sqlx` query and decodes
//! whatever comes back into column-name/value maps, matching the driver
//! contract spec §6 requires of any shard endpoint ("parameterized
//! queries returning column-name/value maps") without committing callers
//! to a compile-time row type per statement.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

use crate::error::{AppError, AppResult};

/// One row of a query result, column name -> JSON-encoded value.
pub type ShardRow = HashMap<String, Value>;

/// Binds `params` onto `query` in order. Each JSON value maps to the
/// Postgres type `sqlx` would otherwise infer at compile time: null binds
/// as `NULL`, bool/i64/f64/String bind directly, everything else
/// (arrays, objects) binds as `JSONB`.
pub fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}

/// Decodes a `PgRow` of unknown shape into a column-name/value map. Column
/// types outside this list surface as their textual representation rather
/// than failing the whole row, since the core does not control shard-side
/// schemas.
pub fn row_to_map(row: &PgRow) -> AppResult<ShardRow> {
    let mut out = ShardRow::with_capacity(row.columns().len());
    for column in row.columns() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOL" => row
                .try_get::<Option<bool>, _>(column.ordinal())
                .map_err(AppError::query_failed)?
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            "INT2" | "INT4" | "INT8" => row
                .try_get::<Option<i64>, _>(column.ordinal())
                .map_err(AppError::query_failed)?
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "FLOAT4" | "FLOAT8" | "NUMERIC" => row
                .try_get::<Option<f64>, _>(column.ordinal())
                .map_err(AppError::query_failed)?
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(column.ordinal())
                .map_err(AppError::query_failed)?
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<Option<String>, _>(column.ordinal())
                .map_err(AppError::query_failed)?
                .map(Value::String)
                .unwrap_or(Value::Null),
        };
        out.insert(name, value);
    }
    Ok(out)
}
