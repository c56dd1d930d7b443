//! Warden Policy
//!
//! Declarative policies evaluated against the governance event stream:
//!
//! - [`PolicyDocument`]: tagged-union YAML/JSON schema, validated at load
//! - [`PolicyLoader`]: bounded, content-addressed document loading
//! - [`PolicyRuntime`]: bus subscriber that runs corrective actions
//! - [`MetricValidator`]: drift limits and approval gates for protected metrics
//! - [`AuditLog`]: SHA-256 chained record of every decision

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod context;
pub mod document;
pub mod error;
pub mod loader;
pub mod metric;
pub mod runtime;

pub use audit::{AuditEntry, AuditKind, AuditLog, AuditRecord, AUDIT_LOG_KEY};
pub use context::EvaluationContext;
pub use document::{
    ActionKind, Condition, Policy, PolicyAction, PolicyDocument, COMMIT_EVENTS, SUPPORTED_VERSION,
};
pub use error::PolicyError;
pub use loader::{parse_document, DocumentFormat, PolicyConfig, PolicyLoader};
pub use metric::{MetricChange, MetricDecision, MetricProtection, MetricValidator};
pub use runtime::{
    ActionRecord, ActionStatus, BlockedOperation, ControllerError, DomainController,
    PolicyResult, PolicyRuntime, POLICY_RUNTIME_ACTOR,
};
