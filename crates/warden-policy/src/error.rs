//! Error types for policies, metric validation and the audit chain

use std::path::PathBuf;
use warden_core::{KillSwitchError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    KillSwitch(#[from] KillSwitchError),

    #[error("failed to read policy document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid YAML/JSON or does not fit the schema
    #[error("failed to parse {format} policy document: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    /// Document parsed but failed validation
    #[error("invalid policy document: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },

    #[error("audit chain broken at sequence {sequence}: {reason}")]
    AuditChain { sequence: u64, reason: String },

    #[error("unreadable audit record at line {line}: {message}")]
    AuditCorrupt { line: usize, message: String },

    #[error("policy load task failed: {0}")]
    Task(String),
}
