//! Error types for the sqlbatch CLI
//!
//! Messages are user-facing and say what to check next.

use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Required file is missing
    #[error("File not found: '{0}'. Verify the path, or pass --workdir if it is relative.")]
    FileNotFound(String),

    /// A `k=v` argument could not be split
    #[error("Invalid {what} '{value}': expected KEY=VALUE")]
    InvalidPair { what: &'static str, value: String },

    /// Engine failure
    #[error(transparent)]
    Engine(#[from] sqlbatch_engine::EngineError),
}

impl CliError {
    pub fn invalid_pair(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidPair {
            what,
            value: value.into(),
        }
    }
}
