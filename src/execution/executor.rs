//! Executor - runs accepted statements and shapes their results

use super::engine::{ExecutionFailure, ExecutionLimits, RowSet, Warehouse};
use super::result::{ColumnMeta, QueryResult, Row, SemanticType};
use crate::validation::AcceptedSql;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub struct Executor {
    warehouse: Arc<dyn Warehouse>,
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(warehouse: Arc<dyn Warehouse>, limits: ExecutionLimits) -> Self {
        Self { warehouse, limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub async fn health_check(&self) -> Result<(), ExecutionFailure> {
        self.warehouse.health_check().await
    }

    /// Execute an accepted statement. Failures are never retried here.
    pub async fn execute(&self, accepted: &AcceptedSql) -> Result<QueryResult, ExecutionFailure> {
        let start = Instant::now();
        let fetched = tokio::time::timeout(
            self.limits.client_deadline(),
            self.warehouse.fetch(&accepted.sql, &self.limits),
        )
        .await
        .unwrap_or(Err(ExecutionFailure::Timeout(self.limits.statement_timeout)));

        let row_set = match fetched {
            Ok(row_set) => row_set,
            Err(failure) => {
                error!(
                    warehouse = self.warehouse.name(),
                    kind = %failure.error_kind(),
                    "Execution failed: {}",
                    failure
                );
                return Err(failure);
            }
        };

        let result = shape_result(row_set, self.limits.row_cap, start.elapsed().as_millis() as u64);
        info!(
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = result.elapsed_ms,
            "Statement executed"
        );
        Ok(result)
    }
}

fn shape_result(row_set: RowSet, row_cap: usize, elapsed_ms: u64) -> QueryResult {
    let RowSet { columns, mut rows } = row_set;
    let truncated = rows.len() > row_cap;
    rows.truncate(row_cap);

    let names = unique_names(columns.iter().map(|c| c.name.as_str()));
    let metas: Vec<ColumnMeta> = columns
        .iter()
        .enumerate()
        .zip(&names)
        .map(|((idx, column), name)| {
            let semantic_type = match SemanticType::from_pg_type(&column.type_name) {
                SemanticType::Unknown => {
                    SemanticType::from_values(rows.iter().filter_map(|r| r.get(idx)))
                }
                known => known,
            };
            ColumnMeta {
                name: name.clone(),
                semantic_type,
            }
        })
        .collect();

    let rows: Vec<Row> = rows
        .into_iter()
        .map(|values| names.iter().cloned().zip(values).collect())
        .collect();

    QueryResult {
        columns: metas,
        row_count: rows.len(),
        rows,
        truncated,
        elapsed_ms,
    }
}

/// Suffix repeated column names (`id`, `id_2`) so every value keeps a key.
fn unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .map(|name| {
            let mut candidate = name.to_string();
            let mut n = 2;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, n);
                n += 1;
            }
            candidate
        })
        .collect()
}
