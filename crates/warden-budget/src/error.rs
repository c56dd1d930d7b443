//! Error types for the budget guardian

use crate::state::RunStatus;
use warden_core::{KillSwitchError, RunId, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("budget storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    KillSwitch(#[from] KillSwitchError),

    /// Run was never initialized
    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    #[error("unknown budget profile: '{0}'")]
    UnknownProfile(String),

    /// Negative or non-finite usage figures
    #[error("invalid usage for unit '{unit_id}': {message}")]
    InvalidUsage { unit_id: String, message: String },

    #[error("run {run_id} cannot {action} while {status}")]
    InvalidTransition {
        run_id: RunId,
        status: RunStatus,
        action: &'static str,
    },
}
