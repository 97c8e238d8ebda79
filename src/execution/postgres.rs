//! PostgreSQL warehouse backed by a sqlx pool

use super::engine::{ExecutionFailure, ExecutionLimits, RawColumn, RowSet, Warehouse};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Executor as _, Row, Statement as _, TypeInfo};
use tracing::{debug, warn};

/// SQLSTATE for a statement cancelled by `statement_timeout`
const QUERY_CANCELED: &str = "57014";

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<RowSet, ExecutionFailure> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(e, limits))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, limits))?;
        // SET cannot take bind parameters
        let timeout_ms = limits.statement_timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, limits))?;

        let capped = capped_sql(sql, limits.fetch_limit());
        let statement = (&mut *tx)
            .prepare(capped.as_str())
            .await
            .map_err(|e| map_sqlx_error(e, limits))?;
        let columns: Vec<RawColumn> = statement
            .columns()
            .iter()
            .map(|c| RawColumn {
                name: c.name().to_string(),
                type_name: c.type_info().name().to_string(),
            })
            .collect();

        let mut rows = Vec::new();
        {
            let mut stream = sqlx::query(&capped).fetch(&mut *tx);
            while let Some(row) = stream.try_next().await.map_err(|e| map_sqlx_error(e, limits))? {
                rows.push(decode_row(&row, &columns));
                if rows.len() >= limits.fetch_limit() {
                    break;
                }
            }
        }

        // Nothing was written; dropping would also roll back
        tx.rollback().await.map_err(|e| map_sqlx_error(e, limits))?;
        debug!(rows = rows.len(), "Fetched rows");
        Ok(RowSet { columns, rows })
    }

    async fn health_check(&self) -> Result<(), ExecutionFailure> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| ExecutionFailure::ConnectionUnavailable(e.to_string()))
    }
}

/// Wrap the statement so the server stops producing rows at the limit.
/// A subquery keeps its own ORDER BY under a plain LIMIT.
fn capped_sql(sql: &str, limit: usize) -> String {
    format!("SELECT * FROM ({}) AS capped LIMIT {}", sql, limit)
}

fn map_sqlx_error(err: sqlx::Error, limits: &ExecutionLimits) -> ExecutionFailure {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            ExecutionFailure::Timeout(limits.statement_timeout)
        }
        sqlx::Error::Database(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            ExecutionFailure::Database(err.to_string())
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::WorkerCrashed => ExecutionFailure::ConnectionUnavailable(err.to_string()),
        _ => ExecutionFailure::Database(err.to_string()),
    }
}

fn decode_row(row: &PgRow, columns: &[RawColumn]) -> Vec<Value> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, column)| match decode_value(row, idx, &column.type_name) {
            Ok(value) => value,
            Err(e) => {
                warn!(column = %column.name, type_name = %column.type_name, error = %e, "Could not decode value");
                Value::Null
            }
        })
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| json!(v)),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| json!(v)),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(|v| json!(v)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| json!(v)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(|v| json!(v)),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(idx)?.map(decimal_to_json),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::String)
        }
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)?
            .map(|v| Value::String(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx)?,
        other => {
            warn!(type_name = other, "Unsupported column type, rendering null");
            None
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decimal_to_json(value: Decimal) -> Value {
    match value.to_f64() {
        Some(f) => json!(f),
        None => Value::String(value.to_string()),
    }
}
