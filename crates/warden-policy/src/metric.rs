//! Protected-metric change validation
//!
//! A protection bounds how far and in which direction a metric may move in
//! one change. Changes past the approval bounds need a named approver; a
//! missing approver rejects the change.

use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::error::PolicyError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Drift limits for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricProtection {
    pub metric: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Smallest allowed `new - old`
    #[serde(default)]
    pub min_delta: Option<f64>,
    /// Largest allowed `new - old`
    #[serde(default)]
    pub max_delta: Option<f64>,
    /// New values below this are rejected outright
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    /// `|delta|` above this needs an approver
    #[serde(default)]
    pub approval_threshold: Option<f64>,
    /// New values below this need an approver
    #[serde(default)]
    pub approval_floor: Option<f64>,
}

impl MetricProtection {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            description: None,
            min_delta: None,
            max_delta: None,
            critical_threshold: None,
            approval_threshold: None,
            approval_floor: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn delta_range(mut self, min: f64, max: f64) -> Self {
        self.min_delta = Some(min);
        self.max_delta = Some(max);
        self
    }

    #[inline]
    #[must_use]
    pub fn critical_threshold(mut self, value: f64) -> Self {
        self.critical_threshold = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn approval_threshold(mut self, value: f64) -> Self {
        self.approval_threshold = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn approval_floor(mut self, value: f64) -> Self {
        self.approval_floor = Some(value);
        self
    }

    /// Problems with this protection, empty when consistent
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.metric.trim().is_empty() {
            problems.push("metric protection has an empty metric name".to_string());
        }
        let bounds = [
            ("min_delta", self.min_delta),
            ("max_delta", self.max_delta),
            ("critical_threshold", self.critical_threshold),
            ("approval_threshold", self.approval_threshold),
            ("approval_floor", self.approval_floor),
        ];
        for (field, value) in bounds {
            if value.is_some_and(|v| !v.is_finite()) {
                problems.push(format!("metric '{}': {field} must be finite", self.metric));
            }
        }
        if let (Some(min), Some(max)) = (self.min_delta, self.max_delta) {
            if min > max {
                problems.push(format!("metric '{}': min_delta exceeds max_delta", self.metric));
            }
        }
        if self.approval_threshold.is_some_and(|t| t < 0.0) {
            problems.push(format!("metric '{}': approval_threshold must be >= 0", self.metric));
        }
        if let (Some(critical), Some(floor)) = (self.critical_threshold, self.approval_floor) {
            if floor < critical {
                problems.push(format!(
                    "metric '{}': approval_floor lies below critical_threshold",
                    self.metric
                ));
            }
        }
        problems
    }
}

/// A proposed metric movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricChange {
    pub metric: String,
    pub old_value: f64,
    pub new_value: f64,
    pub actor: String,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl MetricChange {
    pub fn new(metric: impl Into<String>, old_value: f64, new_value: f64, actor: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            old_value,
            new_value,
            actor: actor.into(),
            approver: None,
            reason: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn approved_by(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn delta(&self) -> f64 {
        self.new_value - self.old_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reason: String,
    pub violations: Vec<String>,
    pub delta: f64,
}

/// Validates metric changes and records every decision in the audit chain
#[derive(Debug)]
pub struct MetricValidator {
    protections: RwLock<IndexMap<String, MetricProtection>>,
    audit: Arc<AuditLog>,
}

impl MetricValidator {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            protections: RwLock::new(IndexMap::new()),
            audit,
        }
    }

    /// Add or replace a protection; returns the previous one
    pub fn protect(&self, protection: MetricProtection) -> Option<MetricProtection> {
        self.protections
            .write()
            .insert(protection.metric.clone(), protection)
    }

    pub fn unprotect(&self, metric: &str) -> Option<MetricProtection> {
        self.protections.write().shift_remove(metric)
    }

    #[must_use]
    pub fn protection(&self, metric: &str) -> Option<MetricProtection> {
        self.protections.read().get(metric).cloned()
    }

    #[must_use]
    pub fn protections(&self) -> Vec<MetricProtection> {
        self.protections.read().values().cloned().collect()
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Pure decision without auditing
    #[must_use]
    pub fn evaluate(&self, change: &MetricChange) -> MetricDecision {
        let delta = change.delta();
        if !change.old_value.is_finite() || !change.new_value.is_finite() {
            return MetricDecision {
                allowed: false,
                requires_approval: false,
                reason: "metric values must be finite".to_string(),
                violations: vec!["non-finite value".to_string()],
                delta,
            };
        }

        let Some(protection) = self.protection(&change.metric) else {
            return MetricDecision {
                allowed: true,
                requires_approval: false,
                reason: "metric is not protected".to_string(),
                violations: Vec::new(),
                delta,
            };
        };

        let mut violations = Vec::new();
        if let Some(min) = protection.min_delta {
            if delta < min {
                violations.push(format!("delta {delta} below minimum {min}"));
            }
        }
        if let Some(max) = protection.max_delta {
            if delta > max {
                violations.push(format!("delta {delta} above maximum {max}"));
            }
        }
        if let Some(critical) = protection.critical_threshold {
            if change.new_value < critical {
                violations.push(format!(
                    "value {} below critical threshold {critical}",
                    change.new_value
                ));
            }
        }
        if !violations.is_empty() {
            return MetricDecision {
                allowed: false,
                requires_approval: false,
                reason: format!("change to '{}' violates its protection", change.metric),
                violations,
                delta,
            };
        }

        let mut approval_reasons = Vec::new();
        if let Some(threshold) = protection.approval_threshold {
            if delta.abs() > threshold {
                approval_reasons.push(format!("|delta| {} exceeds {threshold}", delta.abs()));
            }
        }
        if let Some(floor) = protection.approval_floor {
            if change.new_value < floor {
                approval_reasons.push(format!(
                    "value {} below approval floor {floor}",
                    change.new_value
                ));
            }
        }

        let requires_approval = !approval_reasons.is_empty();
        let approver = change
            .approver
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty());
        match (requires_approval, approver) {
            (false, _) => MetricDecision {
                allowed: true,
                requires_approval: false,
                reason: "within protection limits".to_string(),
                violations: Vec::new(),
                delta,
            },
            (true, Some(approver)) => MetricDecision {
                allowed: true,
                requires_approval: true,
                reason: format!("approved by {approver}"),
                violations: Vec::new(),
                delta,
            },
            (true, None) => MetricDecision {
                allowed: false,
                requires_approval: true,
                reason: format!("approval required: {}", approval_reasons.join(", ")),
                violations: approval_reasons,
                delta,
            },
        }
    }

    /// Decide and audit; an audit failure fails the validation
    ///
    /// # Errors
    /// The audit record could not be written
    pub async fn validate(&self, change: &MetricChange) -> Result<MetricDecision, PolicyError> {
        let decision = self.evaluate(change);
        self.audit
            .append(AuditEntry::new(
                AuditKind::MetricChange,
                &change.metric,
                &change.actor,
                json!({
                    "old_value": change.old_value,
                    "new_value": change.new_value,
                    "approver": change.approver,
                    "reason": change.reason,
                    "decision": decision,
                }),
            ))
            .await?;

        if decision.allowed {
            tracing::debug!(metric = %change.metric, delta = decision.delta, "metric change allowed");
        } else {
            tracing::warn!(
                metric = %change.metric,
                delta = decision.delta,
                reason = %decision.reason,
                "metric change rejected"
            );
        }
        Ok(decision)
    }
}
