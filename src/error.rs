//! Run-level error taxonomy.
//!
//! Per-document problems ([`ExtractError`](crate::extract::ExtractError),
//! [`CompletionError`](crate::completion::CompletionError)) are contained
//! inside a run and show up only in its summary counts. The errors here are
//! the ones that abort a run, and all of them are raised before any
//! per-document work starts, except `Database`.

use thiserror::Error;

use crate::schema::SchemaError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A referenced source table does not exist.
    #[error("table not found: {0}")]
    NotFound(String),

    /// A table name that cannot be safely used as an SQL identifier.
    #[error("invalid table name '{0}': expected [A-Za-z_][A-Za-z0-9_]*, at most 64 characters")]
    InvalidTableName(String),

    /// The source directory cannot be enumerated.
    #[error("cannot scan {path}: {message}")]
    Scan { path: String, message: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(#[from] SchemaError),

    /// The run cannot start with the current configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
