//! Per-run budget state and check results

use crate::limits::BudgetLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use warden_core::{AgentId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Killed,
    BudgetExceeded,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Killed => "killed",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }

    /// No further work may be charged
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Killed | Self::BudgetExceeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub cost_usd: f64,
    pub time_ms: u64,
    pub calls: u64,
}

/// Which utilisation dimension crossed a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Cost,
    Time,
    Items,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub dimension: BudgetDimension,
    /// Band that was crossed, e.g. `0.75`
    pub threshold: f64,
    pub utilisation: f64,
    pub at: DateTime<Utc>,
}

/// Durable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub run_id: RunId,
    pub session_id: String,
    pub profile: String,
    pub start_time: DateTime<Utc>,
    pub total_cost_usd: f64,
    pub total_time_ms: u64,
    pub items_processed: u64,
    pub items_remaining: u64,
    pub limits: BudgetLimits,
    #[serde(default)]
    pub per_agent_usage: BTreeMap<String, AgentUsage>,
    pub status: RunStatus,
    #[serde(default)]
    pub warnings: Vec<BudgetWarning>,
    /// Unit ids already charged
    #[serde(default)]
    pub recorded_units: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetState {
    #[must_use]
    pub fn remaining_cost_usd(&self) -> f64 {
        (self.limits.max_cost_per_run - self.total_cost_usd).max(0.0)
    }

    #[must_use]
    pub fn remaining_time_ms(&self) -> u64 {
        self.limits
            .max_time_per_run_ms
            .saturating_sub(self.total_time_ms)
    }

    /// Whether a band was already recorded for a dimension
    #[must_use]
    pub fn has_warning(&self, dimension: BudgetDimension, threshold: f64) -> bool {
        self.warnings
            .iter()
            .any(|w| w.dimension == dimension && (w.threshold - threshold).abs() < f64::EPSILON)
    }
}

/// Scope of a rejected check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionScope {
    KillSwitch,
    Run,
    Agent,
    Item,
}

impl fmt::Display for RejectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KillSwitch => "kill_switch",
            Self::Run => "run",
            Self::Agent => "agent",
            Self::Item => "item",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    ProceedWithCaution,
    SkipItem,
    ThrottleAgent,
    ResumeRun,
    StopRun,
    AwaitOperator,
}

/// Remaining allowance of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRemaining {
    pub agent_id: AgentId,
    pub cost_usd: Option<f64>,
    pub time_ms: Option<u64>,
    pub calls: Option<u64>,
}

/// Answer to "may this unit proceed?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub can_proceed: bool,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub rejection: Option<RejectionScope>,
    /// Highest utilisation band reached
    pub warning_level: Option<f64>,
    pub remaining_cost_usd: f64,
    pub remaining_time_ms: u64,
    pub agent_remaining: Option<AgentRemaining>,
    pub recommended_action: RecommendedAction,
}

impl BudgetCheck {
    /// Structured error for a rejected check
    #[must_use]
    pub fn rejection(&self) -> Option<BudgetRejection> {
        let scope = self.rejection?;
        Some(BudgetRejection {
            scope,
            reason: self.reason.clone().unwrap_or_default(),
            status: self.status,
            remaining_cost_usd: self.remaining_cost_usd,
            remaining_time_ms: self.remaining_time_ms,
            agent_remaining: self.agent_remaining.clone(),
            recommended_action: self.recommended_action,
        })
    }
}

/// Budget or kill-switch refusal; never retried automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("budget rejection ({scope}): {reason}")]
pub struct BudgetRejection {
    pub scope: RejectionScope,
    pub reason: String,
    pub status: RunStatus,
    pub remaining_cost_usd: f64,
    pub remaining_time_ms: u64,
    pub agent_remaining: Option<AgentRemaining>,
    pub recommended_action: RecommendedAction,
}

impl BudgetRejection {
    /// Kill switch and run-wide rejections stop further work
    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self.scope, RejectionScope::KillSwitch | RejectionScope::Run)
    }
}

/// Charge for one completed unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub unit_id: String,
    pub cost_usd: f64,
    pub time_ms: u64,
    pub agent_id: Option<AgentId>,
}

impl UsageRecord {
    #[must_use]
    pub fn new(unit_id: impl Into<String>, cost_usd: f64, time_ms: u64) -> Self {
        Self {
            unit_id: unit_id.into(),
            cost_usd,
            time_ms,
            agent_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOutcome {
    /// The unit had already been charged and was ignored
    pub duplicate: bool,
    pub total_cost_usd: f64,
    pub total_time_ms: u64,
    pub items_processed: u64,
}
