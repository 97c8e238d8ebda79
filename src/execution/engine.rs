//! Warehouse Trait - contract between the executor and a database backend
//!
//! A warehouse runs one accepted statement under the given limits and hands
//! back raw rows. Truncation, typing and timing are the executor's job.

use crate::error::ErrorKind;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Server-side statement timeout
    pub statement_timeout: Duration,
    /// Maximum rows returned to the caller
    pub row_cap: usize,
    /// Extra client-side wait on top of the statement timeout
    pub client_grace: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            row_cap: 1000,
            client_grace: Duration::from_secs(1),
        }
    }
}

impl ExecutionLimits {
    /// Rows a warehouse should fetch: one past the cap, to detect truncation
    pub fn fetch_limit(&self) -> usize {
        self.row_cap.saturating_add(1)
    }

    pub fn client_deadline(&self) -> Duration {
        self.statement_timeout + self.client_grace
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Database type name, e.g. `INT4` or `NUMERIC`
    pub type_name: String,
}

/// Rows as fetched, positionally aligned with `columns`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("statement exceeded {0:?}")]
    Timeout(Duration),

    #[error("database rejected the statement: {0}")]
    Database(String),

    #[error("database unavailable: {0}")]
    ConnectionUnavailable(String),
}

impl ExecutionFailure {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ExecutionFailure::Timeout(_) => ErrorKind::ExecutionTimeout,
            ExecutionFailure::Database(_) => ErrorKind::ExecutionError,
            ExecutionFailure::ConnectionUnavailable(_) => ErrorKind::ConnectionUnavailable,
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Backend name (e.g., "postgres")
    fn name(&self) -> &str;

    /// Run a read-only statement, returning at most `limits.fetch_limit()` rows
    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<RowSet, ExecutionFailure>;

    async fn health_check(&self) -> Result<(), ExecutionFailure>;
}
