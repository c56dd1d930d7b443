//! Warden Runtime
//!
//! Wires every Warden component into one [`GovernanceContext`] and exposes
//! the decision API hosts call around autonomous work:
//!
//! - [`Governor::begin_operation`] / [`Governor::commit`] / [`Governor::abort`]:
//!   snapshot, verify, and commit or roll back
//! - [`Governor::checkpoint`]: loop detection inside an operation
//! - [`Governor::execute_unit`]: budget check, timeout, dead-letter routing
//! - [`Governor::validate_metric`]: gated, audited metric movement
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_runtime::{GovernanceContext, Governor, OperationOptions, WardenConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = GovernanceContext::from_config(WardenConfig::load("warden.toml")?).await?;
//! let governor = Governor::new(ctx);
//!
//! let handle = governor.begin_operation("refactor", OperationOptions::default()).await?;
//! // ... let the agent edit the tree ...
//! let report = governor.commit(handle).await?;
//! println!("risk: {}", report.diff.risk_level);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod governor;

pub use config::{ConfigError, RiskDomainsConfig, WardenConfig, DEFAULT_CONFIG_FILE};
pub use context::{GovernanceContext, GovernanceContextBuilder};
pub use error::{GovernanceError, RejectedCommit, VetoedCommit};
pub use governor::{
    AbortReport, CommitReport, GcReport, Governor, OperationHandle, OperationOptions,
    PreflightReport, UnitOutcome, WorkUnit, GOVERNOR_ACTOR,
};
