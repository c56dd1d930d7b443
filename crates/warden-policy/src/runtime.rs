//! Event-driven policy evaluation and corrective actions
//!
//! The runtime subscribes to the event bus. For every event it evaluates the
//! enabled policies that list the event's type, then runs each matched
//! policy's actions in order:
//!
//! 1. The kill switch is re-read. While it is active only protective actions
//!    run; `adjust_target` is skipped.
//! 2. Metric-moving actions pass the [`MetricValidator`] and are `gated`
//!    when it rejects them.
//! 3. Domain actions go to the [`DomainController`] registered for their
//!    kind; kill switch, block and notify are handled here.
//!
//! Commit events (`operation_verified`, `unexpected_change`) are evaluated
//! by the governor that owns the commit, which rolls the operation back when
//! a `rollback_operation` or `block_operation` action applies. The bus
//! subscriber skips them so they are evaluated once.
//!
//! A failed action is logged, audited and published as
//! `policy_action_failed`. It is not retried. When the policy is `critical`
//! the kill switch is activated as well.

use crate::audit::{AuditEntry, AuditKind, AuditLog};
use crate::context::EvaluationContext;
use crate::document::{ActionKind, Policy, PolicyAction, PolicyDocument, COMMIT_EVENTS};
use crate::metric::{MetricChange, MetricValidator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use warden_core::{
    EventBus, EventSubscriber, EventType, GovernanceEvent, KillSwitch, KillSwitchActor,
    SharedClock, Severity, SubscriberError,
};

pub const POLICY_RUNTIME_ACTOR: &str = "policy-runtime";

/// Controller failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ControllerError(pub String);

impl ControllerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Host-side actuator for one kind of corrective action
#[async_trait]
pub trait DomainController: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the action; the returned value is recorded as the outcome detail
    async fn apply(
        &self,
        action: &PolicyAction,
        ctx: &EvaluationContext,
    ) -> Result<Value, ControllerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    /// Rejected by the metric validator
    Gated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: ActionKind,
    pub status: ActionStatus,
    pub detail: String,
}

impl ActionRecord {
    fn new(action: ActionKind, status: ActionStatus, detail: impl Into<String>) -> Self {
        Self {
            action,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy_name: String,
    pub matched: bool,
    pub actions_triggered: Vec<ActionRecord>,
}

impl PolicyResult {
    #[must_use]
    pub fn failed_actions(&self) -> usize {
        self.actions_triggered
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .count()
    }

    /// First applied action that vetoes the commit the event belongs to
    #[must_use]
    pub fn veto(&self) -> Option<&ActionRecord> {
        self.actions_triggered
            .iter()
            .find(|a| a.status == ActionStatus::Applied && a.action.vetoes_commit())
    }
}

/// An operation refused by a `block_operation` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedOperation {
    pub operation: String,
    pub policy: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
}

pub struct PolicyRuntime {
    policies: RwLock<Vec<Policy>>,
    controllers: DashMap<ActionKind, Arc<dyn DomainController>>,
    blocked: DashMap<String, BlockedOperation>,
    validator: Arc<MetricValidator>,
    kill_switch: Arc<KillSwitch>,
    audit: Arc<AuditLog>,
    bus: Weak<EventBus>,
    clock: SharedClock,
}

impl std::fmt::Debug for PolicyRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRuntime")
            .field("policies", &self.policies.read().len())
            .field("controllers", &self.controllers.len())
            .field("blocked", &self.blocked.len())
            .finish_non_exhaustive()
    }
}

impl PolicyRuntime {
    /// The runtime keeps a weak handle to `bus` so subscribing it does not
    /// create a reference cycle.
    pub fn new(
        validator: Arc<MetricValidator>,
        kill_switch: Arc<KillSwitch>,
        bus: &Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            controllers: DashMap::new(),
            blocked: DashMap::new(),
            audit: Arc::clone(validator.audit()),
            validator,
            kill_switch,
            bus: Arc::downgrade(bus),
            clock,
        }
    }

    /// Add a document's policies and metric protections
    ///
    /// A policy whose name is already installed is replaced in place.
    pub fn install(&self, document: &PolicyDocument) {
        for protection in &document.metrics {
            self.validator.protect(protection.clone());
        }
        let mut policies = self.policies.write();
        for policy in &document.policies {
            match policies.iter_mut().find(|p| p.name == policy.name) {
                Some(existing) => *existing = policy.clone(),
                None => policies.push(policy.clone()),
            }
        }
        info!(
            installed = document.policies.len(),
            total = policies.len(),
            "policies installed"
        );
    }

    pub fn remove_policy(&self, name: &str) -> Option<Policy> {
        let mut policies = self.policies.write();
        let idx = policies.iter().position(|p| p.name == name)?;
        Some(policies.remove(idx))
    }

    #[must_use]
    pub fn policies(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    /// Register the controller for `kind`, replacing any previous one
    pub fn register_controller(&self, kind: ActionKind, controller: Arc<dyn DomainController>) {
        debug!(%kind, controller = controller.name(), "domain controller registered");
        self.controllers.insert(kind, controller);
    }

    #[must_use]
    pub fn is_blocked(&self, operation: &str) -> Option<BlockedOperation> {
        self.blocked.get(operation).map(|b| b.value().clone())
    }

    pub fn unblock(&self, operation: &str) -> Option<BlockedOperation> {
        self.blocked.remove(operation).map(|(_, b)| b)
    }

    #[must_use]
    pub fn blocked_operations(&self) -> Vec<BlockedOperation> {
        self.blocked.iter().map(|b| b.value().clone()).collect()
    }

    async fn publish(&self, event_type: EventType, data: Value) {
        if let Some(bus) = self.bus.upgrade() {
            bus.publish(GovernanceEvent::new(event_type, POLICY_RUNTIME_ACTOR, data).at(self.clock.now()))
                .await;
        }
    }

    async fn record_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(entry).await {
            error!(error = %e, "failed to write policy audit record");
        }
    }

    /// Evaluate every policy against `event` and run matched actions
    ///
    /// Events published by the runtime itself are ignored.
    pub async fn evaluate(&self, event: &GovernanceEvent) -> Vec<PolicyResult> {
        if event.actor == POLICY_RUNTIME_ACTOR {
            return Vec::new();
        }
        let ctx = EvaluationContext::from_event(event);
        let candidates: Vec<Policy> = self
            .policies
            .read()
            .iter()
            .filter(|p| p.triggers_on(event.event_type))
            .cloned()
            .collect();

        let mut results = Vec::new();
        for policy in candidates {
            if !policy.when.matches(&ctx) {
                continue;
            }
            info!(policy = %policy.name, event = %event.event_type, "policy matched");
            let mut records = Vec::with_capacity(policy.actions.len());
            for action in &policy.actions {
                let record = self.run_action(&policy, action, &ctx).await;
                if record.status == ActionStatus::Failed {
                    self.on_action_failed(&policy, &record, event).await;
                }
                records.push(record);
            }

            let result = PolicyResult {
                policy_name: policy.name.clone(),
                matched: true,
                actions_triggered: records,
            };
            self.record_audit(AuditEntry::new(
                AuditKind::PolicyDecision,
                &policy.name,
                POLICY_RUNTIME_ACTOR,
                json!({
                    "event_id": event.id,
                    "event_type": event.event_type,
                    "severity": policy.severity,
                    "actions": result.actions_triggered,
                }),
            ))
            .await;
            self.publish(
                EventType::PolicyTriggered,
                json!({
                    "policy": policy.name,
                    "severity": policy.severity,
                    "trigger": event.event_type,
                    "message": notify_message(&policy),
                    "actions": result.actions_triggered,
                }),
            )
            .await;
            results.push(result);
        }
        results
    }

    async fn on_action_failed(&self, policy: &Policy, record: &ActionRecord, event: &GovernanceEvent) {
        warn!(
            policy = %policy.name,
            action = %record.action,
            detail = %record.detail,
            "corrective action failed"
        );
        self.record_audit(AuditEntry::new(
            AuditKind::PolicyActionFailed,
            &policy.name,
            POLICY_RUNTIME_ACTOR,
            json!({
                "event_id": event.id,
                "action": record.action,
                "detail": record.detail,
            }),
        ))
        .await;
        self.publish(
            EventType::PolicyActionFailed,
            json!({
                "policy": policy.name,
                "action": record.action,
                "detail": record.detail,
                "severity": policy.severity,
            }),
        )
        .await;

        if policy.severity == Severity::Critical {
            let reason = format!(
                "critical policy '{}' could not apply {}: {}",
                policy.name, record.action, record.detail
            );
            if let Err(detail) = self.activate_kill_switch(reason).await {
                warn!(policy = %policy.name, %detail, "kill switch not activated");
            }
        }
    }

    async fn activate_kill_switch(&self, reason: String) -> Result<(), String> {
        match self
            .kill_switch
            .activate(reason.clone(), KillSwitchActor::PolicyRuntime)
            .await
        {
            Ok(state) if state.triggered => {
                self.publish(
                    EventType::KillSwitchActivated,
                    json!({"reason": reason, "actor": KillSwitchActor::PolicyRuntime.as_str()}),
                )
                .await;
                Ok(())
            }
            Ok(_) => Err("kill switch is disabled for automated actors".to_string()),
            Err(e) => {
                error!(error = %e, "policy runtime failed to activate kill switch");
                Err(e.to_string())
            }
        }
    }

    async fn run_action(
        &self,
        policy: &Policy,
        action: &PolicyAction,
        ctx: &EvaluationContext,
    ) -> ActionRecord {
        let kind = action.kind();
        if !kind.is_protective() && self.kill_switch.is_triggered_or_unknown().await {
            return ActionRecord::new(kind, ActionStatus::Skipped, "kill switch active");
        }

        if kind.moves_metric() {
            match self.gate_metric(action, ctx).await {
                Ok(()) => {}
                Err(record) => return record,
            }
        }

        match action {
            PolicyAction::ActivateKillSwitch { reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("policy '{}' triggered by {}", policy.name, ctx.event_type));
                match self.activate_kill_switch(reason).await {
                    Ok(()) => ActionRecord::new(kind, ActionStatus::Applied, "kill switch active"),
                    Err(detail) => ActionRecord::new(kind, ActionStatus::Failed, detail),
                }
            }
            PolicyAction::BlockOperation { operation, reason } => {
                let Some(operation) = operation.clone().or_else(|| {
                    ctx.field("operation")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }) else {
                    return ActionRecord::new(kind, ActionStatus::Failed, "no operation to block");
                };
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("blocked by policy '{}'", policy.name));
                self.blocked.insert(
                    operation.clone(),
                    BlockedOperation {
                        operation: operation.clone(),
                        policy: policy.name.clone(),
                        reason,
                        blocked_at: self.clock.now(),
                    },
                );
                if self.controllers.contains_key(&kind) {
                    return self.dispatch(kind, action, ctx).await;
                }
                ActionRecord::new(kind, ActionStatus::Applied, format!("operation '{operation}' blocked"))
            }
            PolicyAction::RollbackOperation { reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("rolled back by policy '{}'", policy.name));
                ActionRecord::new(kind, ActionStatus::Applied, reason)
            }
            PolicyAction::Notify { .. } => {
                if self.controllers.contains_key(&kind) {
                    return self.dispatch(kind, action, ctx).await;
                }
                ActionRecord::new(kind, ActionStatus::Applied, "carried by policy_triggered event")
            }
            PolicyAction::RestoreThreshold { .. }
            | PolicyAction::RevertConfiguration { .. }
            | PolicyAction::AdjustTarget { .. } => self.dispatch(kind, action, ctx).await,
        }
    }

    async fn dispatch(
        &self,
        kind: ActionKind,
        action: &PolicyAction,
        ctx: &EvaluationContext,
    ) -> ActionRecord {
        let Some(controller) = self.controllers.get(&kind).map(|c| Arc::clone(c.value())) else {
            return ActionRecord::new(kind, ActionStatus::Failed, "no controller registered");
        };
        match controller.apply(action, ctx).await {
            Ok(outcome) => {
                debug!(%kind, controller = controller.name(), "controller applied action");
                ActionRecord::new(kind, ActionStatus::Applied, outcome.to_string())
            }
            Err(e) => ActionRecord::new(kind, ActionStatus::Failed, format!("{}: {e}", controller.name())),
        }
    }

    /// Run a metric-moving action past the validator
    async fn gate_metric(&self, action: &PolicyAction, ctx: &EvaluationContext) -> Result<(), ActionRecord> {
        let kind = action.kind();
        let (metric, target) = match action {
            PolicyAction::RestoreThreshold { metric, value } => {
                (metric.clone().or_else(|| ctx.metric.clone()), value.or(ctx.old_value))
            }
            PolicyAction::AdjustTarget { metric, delta } => (
                metric.clone().or_else(|| ctx.metric.clone()),
                ctx.new_value.map(|v| v + delta),
            ),
            _ => return Ok(()),
        };
        let (Some(metric), Some(current), Some(target)) = (metric, ctx.new_value, target) else {
            return Err(ActionRecord::new(
                kind,
                ActionStatus::Failed,
                "event carries no metric value to act on",
            ));
        };

        let change = MetricChange::new(metric, current, target, POLICY_RUNTIME_ACTOR);
        match self.validator.validate(&change).await {
            Ok(decision) if decision.allowed => Ok(()),
            Ok(decision) => Err(ActionRecord::new(kind, ActionStatus::Gated, decision.reason)),
            Err(e) => Err(ActionRecord::new(
                kind,
                ActionStatus::Failed,
                format!("metric validation unavailable: {e}"),
            )),
        }
    }
}

fn notify_message(policy: &Policy) -> Option<String> {
    policy.actions.iter().find_map(|a| match a {
        PolicyAction::Notify { message, .. } => Some(
            message
                .clone()
                .unwrap_or_else(|| format!("policy '{}' triggered", policy.name)),
        ),
        _ => None,
    })
}

#[async_trait]
impl EventSubscriber for PolicyRuntime {
    fn name(&self) -> &str {
        POLICY_RUNTIME_ACTOR
    }

    async fn on_event(&self, event: &GovernanceEvent) -> Result<(), SubscriberError> {
        if COMMIT_EVENTS.contains(&event.event_type) {
            return Ok(());
        }
        let results = self.evaluate(event).await;
        let failed: usize = results.iter().map(PolicyResult::failed_actions).sum();
        if failed > 0 {
            return Err(SubscriberError::new(
                POLICY_RUNTIME_ACTOR,
                format!("{failed} corrective action(s) failed"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{parse_document, DocumentFormat};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use warden_core::{MemoryStorage, SharedStorage, SystemClock};

    struct Recording {
        calls: Mutex<Vec<ActionKind>>,
        fail: bool,
    }

    impl Recording {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl DomainController for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn apply(
            &self,
            action: &PolicyAction,
            _ctx: &EvaluationContext,
        ) -> Result<Value, ControllerError> {
            self.calls.lock().push(action.kind());
            if self.fail {
                Err(ControllerError::new("actuator offline"))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    struct Harness {
        runtime: PolicyRuntime,
        kill_switch: Arc<KillSwitch>,
        _bus: Arc<EventBus>,
    }

    fn harness(policies: &str) -> Harness {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let clock: SharedClock = Arc::new(SystemClock);
        let audit = Arc::new(AuditLog::new(storage.clone(), clock.clone()));
        let validator = Arc::new(MetricValidator::new(audit));
        let kill_switch = Arc::new(KillSwitch::new(storage, clock.clone()));
        let bus = Arc::new(EventBus::new());
        let runtime = PolicyRuntime::new(validator, kill_switch.clone(), &bus, clock);
        runtime.install(&parse_document(policies, DocumentFormat::Yaml).unwrap());
        Harness {
            runtime,
            kill_switch,
            _bus: bus,
        }
    }

    fn metric_event(old: f64, new: f64) -> GovernanceEvent {
        GovernanceEvent::new(
            EventType::MetricChanged,
            "agent",
            json!({"metric": "coverage", "old_value": old, "new_value": new}),
        )
    }

    const RESTORE: &str = r"
version: 1
metrics:
  - metric: coverage
    max_delta: 3
policies:
  - name: restore-coverage
    on: [metric_changed]
    when: { type: drop_exceeds, metric: coverage, amount: 1 }
    actions:
      - { type: restore_threshold }
";

    #[tokio::test]
    async fn matched_policy_dispatches_to_controller() {
        let h = harness(RESTORE);
        let controller = Recording::new(false);
        h.runtime
            .register_controller(ActionKind::RestoreThreshold, controller.clone());

        let results = h.runtime.evaluate(&metric_event(80.0, 78.0)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].actions_triggered[0].status, ActionStatus::Applied);
        assert_eq!(*controller.calls.lock(), vec![ActionKind::RestoreThreshold]);

        assert!(h.runtime.evaluate(&metric_event(80.0, 79.5)).await.is_empty());
    }

    #[tokio::test]
    async fn validator_gates_metric_moves() {
        let h = harness(RESTORE);
        let controller = Recording::new(false);
        h.runtime
            .register_controller(ActionKind::RestoreThreshold, controller.clone());

        // Restoring 70 -> 80 exceeds max_delta 3
        let results = h.runtime.evaluate(&metric_event(80.0, 70.0)).await;
        assert_eq!(results[0].actions_triggered[0].status, ActionStatus::Gated);
        assert!(controller.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn own_events_are_not_reevaluated() {
        let h = harness(RESTORE);
        let mut event = metric_event(80.0, 78.0);
        event.actor = POLICY_RUNTIME_ACTOR.to_string();
        assert!(h.runtime.evaluate(&event).await.is_empty());
    }

    const VETO: &str = r"
version: 1
policies:
  - name: no-high-risk
    on: [operation_verified]
    when: { type: field_equals, field: risk_level, value: high }
    actions:
      - { type: notify }
      - { type: rollback_operation, reason: high risk commit }
";

    #[tokio::test]
    async fn rollback_action_vetoes_the_commit() {
        let h = harness(VETO);
        let event = GovernanceEvent::new(
            EventType::OperationVerified,
            "governor",
            json!({"operation": "refactor", "risk_level": "high"}),
        );
        let results = h.runtime.evaluate(&event).await;
        let veto = results[0].veto().unwrap();
        assert_eq!(veto.action, ActionKind::RollbackOperation);
        assert_eq!(veto.detail, "high risk commit");

        let low = GovernanceEvent::new(
            EventType::OperationVerified,
            "governor",
            json!({"operation": "refactor", "risk_level": "low"}),
        );
        assert!(h.runtime.evaluate(&low).await.is_empty());
    }

    #[tokio::test]
    async fn subscriber_leaves_commit_events_to_the_governor() {
        let h = harness(VETO);
        let controller = Recording::new(false);
        h.runtime.register_controller(ActionKind::Notify, controller.clone());
        let event = GovernanceEvent::new(
            EventType::OperationVerified,
            "governor",
            json!({"risk_level": "high"}),
        );
        h.runtime.on_event(&event).await.unwrap();
        assert!(controller.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn adjust_target_is_skipped_while_kill_switch_active() {
        let h = harness(
            r"
version: 1
policies:
  - name: nudge
    on: [metric_changed]
    actions:
      - { type: adjust_target, delta: 1 }
      - { type: block_operation, operation: deploy }
",
        );
        h.runtime
            .register_controller(ActionKind::AdjustTarget, Recording::new(false));
        h.kill_switch
            .activate("operator stop", KillSwitchActor::Operator)
            .await
            .unwrap();

        let results = h.runtime.evaluate(&metric_event(80.0, 79.0)).await;
        let statuses: Vec<ActionStatus> = results[0]
            .actions_triggered
            .iter()
            .map(|a| a.status)
            .collect();
        assert_eq!(statuses, vec![ActionStatus::Skipped, ActionStatus::Applied]);
        assert!(h.runtime.is_blocked("deploy").is_some());
    }

    #[tokio::test]
    async fn failed_critical_action_trips_kill_switch() {
        let h = harness(
            r"
version: 1
policies:
  - name: revert-config
    on: [config_changed]
    severity: critical
    actions: [{ type: revert_configuration }]
",
        );
        h.runtime
            .register_controller(ActionKind::RevertConfiguration, Recording::new(true));

        let event = GovernanceEvent::new(EventType::ConfigChanged, "agent", json!({"key": "x"}));
        let results = h.runtime.evaluate(&event).await;
        assert_eq!(results[0].failed_actions(), 1);
        let state = h.kill_switch.state().await.unwrap();
        assert!(state.triggered);
        assert_eq!(state.triggered_by, Some(KillSwitchActor::PolicyRuntime));
    }

    #[tokio::test]
    async fn failed_non_critical_action_leaves_kill_switch_alone() {
        let h = harness(
            r"
version: 1
policies:
  - name: revert-config
    on: [config_changed]
    severity: medium
    actions: [{ type: revert_configuration }]
",
        );
        let event = GovernanceEvent::new(EventType::ConfigChanged, "agent", json!({}));
        let results = h.runtime.evaluate(&event).await;
        assert_eq!(results[0].actions_triggered[0].detail, "no controller registered");
        assert!(!h.kill_switch.is_triggered().await.unwrap());
    }

    #[tokio::test]
    async fn kill_switch_action_applies() {
        let h = harness(
            r"
version: 1
policies:
  - name: stop
    on: [budget_exceeded]
    actions: [{ type: activate_kill_switch, reason: budget blown }]
",
        );
        let event = GovernanceEvent::new(EventType::BudgetExceeded, "budget-guardian", json!({}));
        let results = h.runtime.evaluate(&event).await;
        assert_eq!(results[0].actions_triggered[0].status, ActionStatus::Applied);
        let state = h.kill_switch.state().await.unwrap();
        assert_eq!(state.reason.as_deref(), Some("budget blown"));
    }
}
