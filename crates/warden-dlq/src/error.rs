//! Error types for the dead-letter queue

use warden_core::{DlqItemId, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dlq storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("dlq item not found: {0}")]
    NotFound(DlqItemId),

    /// Exhausted or frozen items only move through `reprocess`
    #[error("dlq item {0} is exhausted; reprocess it first")]
    NotRetryable(DlqItemId),
}
