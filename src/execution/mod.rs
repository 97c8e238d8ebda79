//! Guarded execution of accepted statements

pub mod engine;
pub mod executor;
pub mod postgres;
pub mod result;

pub use engine::{ExecutionFailure, ExecutionLimits, RawColumn, RowSet, Warehouse};
pub use executor::Executor;
pub use postgres::PgWarehouse;
pub use result::{ColumnMeta, QueryResult, Row, SemanticType};
