//! Error types for Warden Core

use std::path::PathBuf;

/// Errors from the durable storage layer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// IO error at a concrete path
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key is empty, absolute, or escapes the storage root
    #[error("invalid storage key: '{0}'")]
    InvalidKey(String),

    /// Record could not be encoded or decoded
    #[error("serialization error in '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Blocking task panicked or was cancelled
    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// Create IO error for path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create serialization error for key
    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }
}

/// Errors building an error classifier from its rule table
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// A rule pattern is not a valid regex
    #[error("invalid classification pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
