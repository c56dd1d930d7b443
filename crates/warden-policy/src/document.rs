//! Policy document schema
//!
//! ```yaml
//! version: 1
//! metrics:
//!   - metric: coverage
//!     min_delta: -5
//!     critical_threshold: 60
//! policies:
//!   - name: coverage-regression
//!     on: [metric_changed]
//!     when: { type: drop_exceeds, metric: coverage, amount: 2 }
//!     severity: high
//!     actions:
//!       - { type: restore_threshold, metric: coverage }
//!       - { type: notify, message: "coverage dropped" }
//! ```

use crate::context::EvaluationContext;
use crate::metric::MetricProtection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use warden_core::{EventType, Severity};

pub const SUPPORTED_VERSION: u32 = 1;

/// Events raised while a commit is still undecided. The governor evaluates
/// them inline and acts on the verdict; the bus subscriber skips them.
pub const COMMIT_EVENTS: [EventType; 2] = [EventType::UnexpectedChange, EventType::OperationVerified];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    pub version: u32,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub metrics: Vec<MetricProtection>,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Event types that trigger evaluation
    pub on: Vec<EventType>,
    #[serde(default = "Condition::always")]
    pub when: Condition,
    pub actions: Vec<PolicyAction>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl Policy {
    #[must_use]
    pub fn triggers_on(&self, event_type: EventType) -> bool {
        self.enabled && self.on.contains(&event_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    MetricBelow {
        #[serde(default)]
        metric: Option<String>,
        threshold: f64,
    },
    MetricAbove {
        #[serde(default)]
        metric: Option<String>,
        threshold: f64,
    },
    /// `old - new > amount`
    DropExceeds {
        #[serde(default)]
        metric: Option<String>,
        amount: f64,
    },
    /// `new - old > amount`
    IncreaseExceeds {
        #[serde(default)]
        metric: Option<String>,
        amount: f64,
    },
    FieldEquals {
        field: String,
        value: Value,
    },
    ActorIs {
        actor: String,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    fn always() -> Self {
        Self::Always
    }

    #[must_use]
    pub fn matches(&self, ctx: &EvaluationContext) -> bool {
        match self {
            Self::Always => true,
            Self::MetricBelow { metric, threshold } => {
                ctx.is_metric(metric.as_deref()) && ctx.new_value.is_some_and(|v| v < *threshold)
            }
            Self::MetricAbove { metric, threshold } => {
                ctx.is_metric(metric.as_deref()) && ctx.new_value.is_some_and(|v| v > *threshold)
            }
            Self::DropExceeds { metric, amount } => {
                ctx.is_metric(metric.as_deref()) && ctx.delta().is_some_and(|d| -d > *amount)
            }
            Self::IncreaseExceeds { metric, amount } => {
                ctx.is_metric(metric.as_deref()) && ctx.delta().is_some_and(|d| d > *amount)
            }
            Self::FieldEquals { field, value } => ctx.field(field) == Some(value),
            Self::ActorIs { actor } => &ctx.actor == actor,
            Self::All { conditions } => conditions.iter().all(|c| c.matches(ctx)),
            Self::Any { conditions } => conditions.iter().any(|c| c.matches(ctx)),
            Self::Not { condition } => !condition.matches(ctx),
        }
    }

    fn collect_problems(&self, policy: &str, out: &mut Vec<String>) {
        match self {
            Self::MetricBelow { threshold, .. } | Self::MetricAbove { threshold, .. } => {
                if !threshold.is_finite() {
                    out.push(format!("policy '{policy}': threshold must be finite"));
                }
            }
            Self::DropExceeds { amount, .. } | Self::IncreaseExceeds { amount, .. } => {
                if !amount.is_finite() || *amount < 0.0 {
                    out.push(format!("policy '{policy}': amount must be a finite, non-negative number"));
                }
            }
            Self::FieldEquals { field, .. } => {
                if field.trim().is_empty() {
                    out.push(format!("policy '{policy}': field_equals needs a field"));
                }
            }
            Self::All { conditions } | Self::Any { conditions } => {
                if conditions.is_empty() {
                    out.push(format!("policy '{policy}': all/any needs at least one condition"));
                }
                for c in conditions {
                    c.collect_problems(policy, out);
                }
            }
            Self::Not { condition } => condition.collect_problems(policy, out),
            Self::Always | Self::ActorIs { .. } => {}
        }
    }
}

/// Kind of corrective action, the key for controller registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestoreThreshold,
    RevertConfiguration,
    BlockOperation,
    RollbackOperation,
    AdjustTarget,
    ActivateKillSwitch,
    Notify,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestoreThreshold => "restore_threshold",
            Self::RevertConfiguration => "revert_configuration",
            Self::BlockOperation => "block_operation",
            Self::RollbackOperation => "rollback_operation",
            Self::AdjustTarget => "adjust_target",
            Self::ActivateKillSwitch => "activate_kill_switch",
            Self::Notify => "notify",
        }
    }

    /// Allowed to run while the kill switch is active
    #[must_use]
    pub fn is_protective(self) -> bool {
        !matches!(self, Self::AdjustTarget)
    }

    /// Moves a protected metric, so passes the metric validator first
    #[must_use]
    pub fn moves_metric(self) -> bool {
        matches!(self, Self::RestoreThreshold | Self::AdjustTarget)
    }

    /// Applied on a commit's own events, the commit is rolled back
    #[must_use]
    pub fn vetoes_commit(self) -> bool {
        matches!(self, Self::RollbackOperation | Self::BlockOperation)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Move the metric back to `value`, or to the event's old value
    RestoreThreshold {
        #[serde(default)]
        metric: Option<String>,
        #[serde(default)]
        value: Option<f64>,
    },
    RevertConfiguration {
        #[serde(default)]
        target: Option<String>,
    },
    /// Refuse future operations named `operation` (or the event's `operation`)
    BlockOperation {
        #[serde(default)]
        operation: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Roll back the operation being committed
    RollbackOperation {
        #[serde(default)]
        reason: Option<String>,
    },
    AdjustTarget {
        #[serde(default)]
        metric: Option<String>,
        delta: f64,
    },
    ActivateKillSwitch {
        #[serde(default)]
        reason: Option<String>,
    },
    Notify {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        severity: Option<Severity>,
    },
}

impl PolicyAction {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::RestoreThreshold { .. } => ActionKind::RestoreThreshold,
            Self::RevertConfiguration { .. } => ActionKind::RevertConfiguration,
            Self::BlockOperation { .. } => ActionKind::BlockOperation,
            Self::RollbackOperation { .. } => ActionKind::RollbackOperation,
            Self::AdjustTarget { .. } => ActionKind::AdjustTarget,
            Self::ActivateKillSwitch { .. } => ActionKind::ActivateKillSwitch,
            Self::Notify { .. } => ActionKind::Notify,
        }
    }
}

impl PolicyDocument {
    /// Every schema problem, empty when the document is usable
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.version != SUPPORTED_VERSION {
            out.push(format!(
                "unsupported version {} (expected {SUPPORTED_VERSION})",
                self.version
            ));
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            let name = policy.name.trim();
            if name.is_empty() {
                out.push("policy with an empty name".to_string());
            } else if !names.insert(name) {
                out.push(format!("duplicate policy name '{name}'"));
            }
            if policy.on.is_empty() {
                out.push(format!("policy '{name}': 'on' lists no event types"));
            }
            if policy.actions.is_empty() {
                out.push(format!("policy '{name}': no actions"));
            }
            policy.when.collect_problems(name, &mut out);
            for action in &policy.actions {
                if matches!(action, PolicyAction::RollbackOperation { .. })
                    && !policy.on.iter().any(|ty| COMMIT_EVENTS.contains(ty))
                {
                    out.push(format!(
                        "policy '{name}': rollback_operation needs operation_verified or unexpected_change in 'on'"
                    ));
                }
                if let PolicyAction::AdjustTarget { delta, .. } = action {
                    if !delta.is_finite() {
                        out.push(format!("policy '{name}': adjust_target delta must be finite"));
                    }
                }
                if let PolicyAction::RestoreThreshold { value: Some(v), .. } = action {
                    if !v.is_finite() {
                        out.push(format!("policy '{name}': restore_threshold value must be finite"));
                    }
                }
            }
        }

        let mut metrics = HashSet::new();
        for protection in &self.metrics {
            if !metrics.insert(protection.metric.as_str()) {
                out.push(format!("duplicate metric protection '{}'", protection.metric));
            }
            out.extend(protection.problems());
        }
        out
    }
}
