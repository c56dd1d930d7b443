//! Error types for snapshots and rollback

use std::path::PathBuf;
use warden_core::{SnapshotId, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot storage error: {0}")]
    Storage(#[from] StorageError),

    /// No snapshot with this id
    #[error("snapshot not found: {0}")]
    NotFound(SnapshotId),

    /// Glob could not be compiled
    #[error("invalid path pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Relative path resolves outside the snapshot root
    #[error("path '{0}' escapes the snapshot root")]
    PathEscapesRoot(String),

    #[error("manifest {path} unreadable: {message}")]
    Manifest { path: PathBuf, message: String },

    /// Blocking capture task panicked
    #[error("capture task failed: {0}")]
    Task(String),
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
