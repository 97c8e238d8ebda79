pub mod catalog;
pub mod chart;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod execution;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod sanitizer;
pub mod validation;

pub use catalog::{CatalogHandle, SchemaCatalog};
pub use error::{ErrorKind, Result, TeleSqlError};
pub use pipeline::{PipelineOutcome, QueryPipeline, QuestionRequest, Stage};
