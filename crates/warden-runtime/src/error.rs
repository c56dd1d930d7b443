//! Errors surfaced by the governance decision API

use crate::config::ConfigError;
use crate::governor::OperationHandle;
use warden_budget::{BudgetError, BudgetRejection};
use warden_core::{ClassifierError, ErrorClass, KillSwitchError, StorageError};
use warden_dlq::{DlqError, DlqItem};
use warden_monitor::InfiniteLoopError;
use warden_policy::PolicyError;
use warden_snapshot::{Diff, RollbackReport, SnapshotError, VerificationError};

/// A commit that failed verification and was left for the caller to resolve
///
/// The tree still holds the operation's changes; pass `handle` to
/// [`Governor::abort`](crate::Governor::abort) to roll them back.
#[derive(Debug)]
pub struct RejectedCommit {
    pub error: VerificationError,
    pub handle: OperationHandle,
}

/// A verified commit refused by a `rollback_operation` or `block_operation`
/// action on one of its commit events
#[derive(Debug)]
pub struct VetoedCommit {
    pub policy: String,
    pub reason: String,
    pub diff: Diff,
    /// Present when the tree was restored
    pub rollback: Option<RollbackReport>,
    /// Present when `rollback_on_failure` is off; the changes are still on disk
    pub handle: Option<OperationHandle>,
}

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    /// Kill switch is active or could not be read
    #[error("kill switch active: {reason}")]
    KillSwitchActive { reason: String },

    /// Operation refused by a `block_operation` policy action
    #[error("operation '{operation}' is blocked: {reason}")]
    Blocked { operation: String, reason: String },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    BudgetRejected(Box<BudgetRejection>),

    #[error(transparent)]
    Dlq(#[from] DlqError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InfiniteLoop(#[from] InfiniteLoopError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    KillSwitch(#[from] KillSwitchError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    /// Verification failed and rollback was not requested
    #[error("{}", .0.error)]
    Rejected(Box<RejectedCommit>),

    /// Verification failed and the tree was restored
    #[error("{error}; rolled back ({} restored, {} removed, {} unrestorable)",
        .report.restored.len(), .report.removed.len(), .report.unrestorable.len())]
    RolledBack {
        error: VerificationError,
        report: RollbackReport,
    },

    /// Verification timed out inside a run; the tree was restored and the
    /// operation queued as TRANSIENT
    #[error("{error}; rolled back and queued for retry as {}", .item.id)]
    Deferred {
        error: VerificationError,
        report: RollbackReport,
        item: Box<DlqItem>,
    },

    #[error("commit vetoed by policy '{}': {}", .0.policy, .0.reason)]
    Vetoed(Box<VetoedCommit>),
}

impl GovernanceError {
    /// Taxonomy class of the failure
    ///
    /// Rejections (see [`is_rejection`](Self::is_rejection)) are POLICY and
    /// always propagate to the caller; they are never queued.
    #[must_use]
    pub fn error_class(&self) -> ErrorClass {
        match self {
            _ if self.is_rejection() => ErrorClass::Policy,
            Self::Rejected(rejected) => rejected.error.error_class(),
            Self::RolledBack { error, .. } => error.error_class(),
            Self::Deferred { .. } => ErrorClass::Transient,
            Self::Storage(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Refused by the kill switch, a policy or the budget
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::KillSwitchActive { .. }
                | Self::Blocked { .. }
                | Self::BudgetRejected(_)
                | Self::Vetoed(_)
        )
    }

    /// Verification failure behind a rejected, rolled-back or deferred commit
    #[must_use]
    pub fn verification(&self) -> Option<&VerificationError> {
        match self {
            Self::Rejected(rejected) => Some(&rejected.error),
            Self::RolledBack { error, .. } | Self::Deferred { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<BudgetRejection> for GovernanceError {
    fn from(rejection: BudgetRejection) -> Self {
        Self::BudgetRejected(Box::new(rejection))
    }
}
