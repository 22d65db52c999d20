//! Domain-specific error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

use crate::ProgramName;

/// Errors raised by a persistence collaborator.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backing store could not be opened or initialised
    #[error("Failed to open store at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// A single query or statement failed
    #[error("Query failed ({operation}): {reason}")]
    Query {
        operation: &'static str,
        reason: String,
    },

    /// The program is not in the catalog
    #[error("Program not found: {name}")]
    ProgramNotFound { name: ProgramName },

    /// The store was closed by shutdown
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    /// Shorthand for a failed query.
    pub fn query(operation: &'static str, reason: impl ToString) -> Self {
        Self::Query {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors loading the daemon configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
