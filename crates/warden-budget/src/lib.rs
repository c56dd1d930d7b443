//! Warden Budget
//!
//! [`BudgetGuardian`] caps money and time per run and per sub-agent, records
//! usage idempotently per unit id, and fronts the durable kill switch.
//!
//! # Example
//!
//! ```rust,ignore
//! let check = guardian.check_budget(&run_id, 0.02, 1_500, Some(&agent)).await?;
//! if let Some(rejection) = check.rejection() {
//!     return Err(rejection.into());
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod guardian;
pub mod limits;
pub mod state;

pub use error::BudgetError;
pub use guardian::{BudgetGuardian, CEILING_EPSILON};
pub use limits::{AgentLimits, BudgetConfig, BudgetLimits};
pub use state::{
    AgentRemaining, AgentUsage, BudgetCheck, BudgetDimension, BudgetRejection, BudgetState,
    BudgetWarning, RecommendedAction, RejectionScope, RunStatus, UsageOutcome, UsageRecord,
};
