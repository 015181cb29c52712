//! Error types for the sqlbatch engine
//!
//! Variants follow the pipeline's failure taxonomy: configuration problems are
//! fatal before any unit starts, expansion problems are fatal to one query,
//! source problems are retried, and store problems are counted by the loader.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// Job, environment or stage configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configured stage name has no implementation
    #[error("Unknown stage '{0}'. Known stages: export, load (load_local), postwork, report")]
    UnknownStage(String),

    /// A range parameter is malformed or runs backwards
    #[error("Invalid range '{raw}': {reason}")]
    InvalidRange { raw: String, reason: String },

    /// A query references a placeholder that no parameter defines
    #[error("Query '{query}' references undefined parameter '{name}'")]
    MissingParameter { query: String, name: String },

    /// Source connection or query failure; retried with a fresh connection
    #[error("Source error: {0}")]
    Source(String),

    /// A fetch made no progress within the stall window
    #[error("Fetch stalled for more than {0}s")]
    Stalled(u64),

    /// A unit failed on every attempt
    #[error("Unit {unit} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        unit: String,
        attempts: u32,
        message: String,
    },

    /// Partition file encode/decode failure
    #[error("Partition file error for '{path}': {message}")]
    Codec { path: PathBuf, message: String },

    /// Run ledger failure
    #[error("Run ledger error: {0}")]
    Ledger(String),

    /// Destination store failure
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A partition table name matches an existing table only when case is ignored
    #[error("Table '{table}' collides with existing table '{existing}'")]
    TableCollision { table: String, existing: String },

    /// A postwork script failed against the local store
    #[error("Postwork script '{file}' failed: {message}")]
    Postwork { file: String, message: String },

    #[error("Database driver error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] sqlbatch_common::CommonError),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a ledger error
    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    /// Create an invalid range error
    pub fn invalid_range(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Create a codec error
    pub fn codec(path: impl Into<PathBuf>, msg: impl std::fmt::Display) -> Self {
        Self::Codec {
            path: path.into(),
            message: msg.to_string(),
        }
    }
}
