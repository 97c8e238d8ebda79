use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TeleSqlError {
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for TeleSqlError {
    fn from(err: sqlx::Error) -> Self {
        TeleSqlError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TeleSqlError>;

/// Reason a request ended in failure, or a failure the pipeline recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    EmptyQuestion,
    GenerationTimeout,
    GenerationProviderError,
    EmptyCandidate,
    SyntaxRejected,
    MultiStatementRejected,
    WriteOperationRejected,
    DisallowedConstructRejected,
    UnknownIdentifierRejected,
    ExecutionTimeout,
    ExecutionError,
    ConnectionUnavailable,
}

impl ErrorKind {
    /// The candidate itself was unusable. Only these earn a regeneration
    /// round-trip.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::EmptyCandidate
                | ErrorKind::SyntaxRejected
                | ErrorKind::MultiStatementRejected
                | ErrorKind::WriteOperationRejected
                | ErrorKind::DisallowedConstructRejected
                | ErrorKind::UnknownIdentifierRejected
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::EmptyQuestion => "EmptyQuestion",
            ErrorKind::GenerationTimeout => "GenerationTimeout",
            ErrorKind::GenerationProviderError => "GenerationProviderError",
            ErrorKind::EmptyCandidate => "EmptyCandidate",
            ErrorKind::SyntaxRejected => "SyntaxRejected",
            ErrorKind::MultiStatementRejected => "MultiStatementRejected",
            ErrorKind::WriteOperationRejected => "WriteOperationRejected",
            ErrorKind::DisallowedConstructRejected => "DisallowedConstructRejected",
            ErrorKind::UnknownIdentifierRejected => "UnknownIdentifierRejected",
            ErrorKind::ExecutionTimeout => "ExecutionTimeout",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::ConnectionUnavailable => "ConnectionUnavailable",
        };
        write!(f, "{}", name)
    }
}
