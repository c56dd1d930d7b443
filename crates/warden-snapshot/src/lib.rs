//! Warden Snapshot
//!
//! Working-tree capture, diffing and reversal:
//!
//! - [`SnapshotStore`]: immutable, content-hashed tree snapshots with retention
//! - [`diff()`]: added/modified/deleted paths, dependency changes, risk level
//! - [`RiskDomainRegistry`]: ordered globs naming sensitive paths
//! - [`VerificationEngine`]: staged verification with timed probes
//!
//! Rollback restores files from content captured in the "before" snapshot.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod diff;
pub mod error;
pub mod glob;
pub mod risk;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use diff::{
    diff, DependencyChange, DependencyChangeKind, Diff, DiffOptions, ModifiedFile, RiskLevel,
    UnexpectedChange,
};
pub use error::SnapshotError;
pub use glob::{glob_to_regex, GlobSet};
pub use risk::{RiskAssessment, RiskDomain, RiskDomainRegistry};
pub use snapshot::{FileRecord, Manifest, Snapshot};
pub use store::{RollbackReport, SnapshotConfig, SnapshotStore};
pub use verify::{
    CommandProbe, ProbeError, ProbeOutcome, VerificationConfig, VerificationContext,
    VerificationEngine, VerificationError, VerificationFailure, VerificationProbe,
    VerificationStage,
};
