//! Governance decision and failure-routing API
//!
//! A governed operation is a snapshot pair around some work:
//!
//! ```text
//! begin_operation ──> (work, checkpoint*) ──> commit ──> committed
//!                                          │         └─> rolled back | rejected
//!                                          └─> abort ──> rolled back
//! ```
//!
//! [`OperationHandle`] carries the before snapshot and is consumed by
//! `commit` or `abort`, so verification can only run once both snapshots
//! exist. Units of work inside a run go through [`Governor::execute_unit`]
//! (budget check, timeout, dead-letter routing, usage charge) or the lower
//! level [`Governor::with_retry_and_dlq`].

use crate::context::GovernanceContext;
use crate::error::{GovernanceError, RejectedCommit, VetoedCommit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use warden_budget::UsageRecord;
use warden_core::storage::write_json;
use warden_core::{AgentId, ErrorClass, EventType, GovernanceEvent, OperationId, RunId, SnapshotId};
use warden_dlq::{DlqItem, Failure, RetrySweep};
use warden_monitor::{CheckpointOutcome, LoopProfile};
use warden_policy::{MetricChange, MetricDecision};
use warden_snapshot::{Diff, RiskAssessment, RollbackReport, Snapshot, VerificationContext};

pub const GOVERNOR_ACTOR: &str = "governor";

/// Per-operation switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOptions {
    /// Label of the before snapshot; defaults to `before:<name>`
    pub label: Option<String>,
    pub run_id: Option<RunId>,
    pub allow_unexpected_changes: bool,
    pub skip_risk_domains: bool,
    pub skip_type_check: bool,
    pub skip_lint: bool,
    /// Restore the before snapshot when verification fails
    pub rollback_on_failure: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            label: None,
            run_id: None,
            allow_unexpected_changes: false,
            skip_risk_domains: false,
            skip_type_check: false,
            skip_lint: false,
            rollback_on_failure: true,
        }
    }
}

impl OperationOptions {
    #[inline]
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[inline]
    #[must_use]
    pub fn allow_unexpected_changes(mut self) -> Self {
        self.allow_unexpected_changes = true;
        self
    }

    #[inline]
    #[must_use]
    pub fn skip_probes(mut self) -> Self {
        self.skip_type_check = true;
        self.skip_lint = true;
        self
    }

    /// Leave the tree untouched on verification failure
    #[inline]
    #[must_use]
    pub fn keep_changes_on_failure(mut self) -> Self {
        self.rollback_on_failure = false;
        self
    }

    fn verification(&self, base: VerificationContext) -> VerificationContext {
        VerificationContext {
            allow_unexpected_changes: self.allow_unexpected_changes,
            skip_risk_domains: self.skip_risk_domains,
            skip_type_check: self.skip_type_check,
            skip_lint: self.skip_lint,
            ..base
        }
    }
}

/// An operation between its before snapshot and its resolution
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    name: String,
    before: Snapshot,
    options: OperationOptions,
    started_at: DateTime<Utc>,
}

impl OperationHandle {
    /// Id to pass to [`Governor::checkpoint`]
    #[inline]
    #[must_use]
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn before(&self) -> &Snapshot {
        &self.before
    }

    #[inline]
    #[must_use]
    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    #[inline]
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitReport {
    pub operation_id: OperationId,
    pub diff: Diff,
    pub after: SnapshotId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortReport {
    pub operation_id: OperationId,
    pub diff: Diff,
    pub rollback: RollbackReport,
}

/// Risk of touching a set of paths, before any work is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub assessments: Vec<RiskAssessment>,
    pub requires_approval: bool,
}

impl PreflightReport {
    /// Assessments that matched a risk domain
    pub fn risky(&self) -> impl Iterator<Item = &RiskAssessment> {
        self.assessments.iter().filter(|a| a.risk.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub marked: Vec<SnapshotId>,
    pub purged: Vec<SnapshotId>,
    pub audit_records_dropped: usize,
}

/// One unit of work inside a run
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub run_id: RunId,
    pub item_id: String,
    pub payload: Value,
    pub context: Value,
    /// Overrides `unit_timeout_ms`
    pub timeout: Option<Duration>,
    pub estimated_cost_usd: f64,
    pub estimated_time_ms: u64,
    pub agent_id: Option<AgentId>,
}

impl WorkUnit {
    #[must_use]
    pub fn new(run_id: RunId, item_id: impl Into<String>) -> Self {
        Self {
            run_id,
            item_id: item_id.into(),
            payload: Value::Null,
            context: Value::Null,
            timeout: None,
            estimated_cost_usd: 0.0,
            estimated_time_ms: 0,
            agent_id: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[inline]
    #[must_use]
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    #[inline]
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[inline]
    #[must_use]
    pub fn estimate(mut self, cost_usd: f64, time_ms: u64) -> Self {
        self.estimated_cost_usd = cost_usd;
        self.estimated_time_ms = time_ms;
        self
    }

    #[inline]
    #[must_use]
    pub fn agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

/// How a unit ended
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome<T> {
    Completed(T),
    /// Failed and was routed to the dead-letter queue
    Queued(DlqItem),
}

impl<T> UnitOutcome<T> {
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Queued(_) => None,
        }
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Decision API over a [`GovernanceContext`]
#[derive(Debug, Clone)]
pub struct Governor {
    ctx: Arc<GovernanceContext>,
}

impl Governor {
    #[must_use]
    pub fn new(ctx: Arc<GovernanceContext>) -> Self {
        Self { ctx }
    }

    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<GovernanceContext> {
        &self.ctx
    }

    async fn publish(&self, event_type: EventType, actor: &str, data: Value) {
        self.ctx
            .bus
            .publish(GovernanceEvent::new(event_type, actor, data).at(self.ctx.clock.now()))
            .await;
    }

    /// Fail closed: an unreadable switch counts as active
    async fn ensure_not_killed(&self) -> Result<(), GovernanceError> {
        match self.ctx.kill_switch.state().await {
            Ok(state) if state.triggered => Err(GovernanceError::KillSwitchActive {
                reason: state.reason.unwrap_or_else(|| "no reason given".to_string()),
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "kill switch unreadable, refusing work");
                Err(GovernanceError::KillSwitchActive {
                    reason: format!("kill switch state unreadable: {e}"),
                })
            }
        }
    }

    /// Capture the before snapshot and open an operation
    ///
    /// # Errors
    /// [`GovernanceError::KillSwitchActive`], [`GovernanceError::Blocked`],
    /// or a capture failure
    pub async fn begin_operation(
        &self,
        name: &str,
        options: OperationOptions,
    ) -> Result<OperationHandle, GovernanceError> {
        self.ensure_not_killed().await?;
        if let Some(blocked) = self.ctx.policy.is_blocked(name) {
            warn!(operation = name, policy = %blocked.policy, "operation blocked by policy");
            return Err(GovernanceError::Blocked {
                operation: name.to_string(),
                reason: blocked.reason,
            });
        }

        let label = options
            .label
            .clone()
            .unwrap_or_else(|| format!("before:{name}"));
        let before = self.ctx.snapshots.capture(&label).await?;
        self.ctx.snapshots.pin(&before.id).await?;

        let handle = OperationHandle {
            id: OperationId::generate(),
            name: name.to_string(),
            started_at: self.ctx.clock.now(),
            before,
            options,
        };
        info!(
            operation = name,
            operation_id = %handle.id,
            snapshot = %handle.before.id,
            files = handle.before.file_count(),
            "operation started"
        );
        self.publish(
            EventType::OperationStarted,
            GOVERNOR_ACTOR,
            json!({
                "operation": name,
                "operation_id": handle.id,
                "run_id": handle.options.run_id,
                "snapshot": handle.before.id,
            }),
        )
        .await;
        self.publish_captured(&handle, &handle.before).await;
        Ok(handle)
    }

    async fn publish_captured(&self, handle: &OperationHandle, snapshot: &Snapshot) {
        self.publish(
            EventType::SnapshotCaptured,
            GOVERNOR_ACTOR,
            json!({
                "operation": handle.name,
                "operation_id": handle.id,
                "snapshot": snapshot.id,
                "label": snapshot.label,
                "files": snapshot.file_count(),
            }),
        )
        .await;
    }

    /// Evaluate policies on a commit event, then publish it
    ///
    /// Returns the first vetoing policy and its reason.
    async fn publish_commit_event(&self, event_type: EventType, data: Value) -> Option<(String, String)> {
        let event = GovernanceEvent::new(event_type, GOVERNOR_ACTOR, data).at(self.ctx.clock.now());
        let results = self.ctx.policy.evaluate(&event).await;
        self.ctx.bus.publish(event).await;
        results
            .iter()
            .find_map(|r| r.veto().map(|v| (r.policy_name.clone(), v.detail.clone())))
    }

    async fn publish_unexpected(&self, handle: &OperationHandle, diff: &Diff) -> Option<(String, String)> {
        let mut veto = None;
        for change in &diff.unexpected_changes {
            let vetoed = self
                .publish_commit_event(
                    EventType::UnexpectedChange,
                    json!({
                        "operation": handle.name,
                        "operation_id": handle.id,
                        "path": change.path,
                        "reason": change.reason,
                        "severity": change.severity,
                        "requires_approval": change.requires_approval,
                    }),
                )
                .await;
            veto = veto.or(vetoed);
        }
        veto
    }

    /// Capture the after snapshot, verify, and commit or roll back
    ///
    /// # Errors
    /// [`GovernanceError::RolledBack`] when verification failed and the tree
    /// was restored, [`GovernanceError::Rejected`] when verification failed
    /// and `rollback_on_failure` is off, [`GovernanceError::Deferred`] when a
    /// verification stage timed out inside a run, [`GovernanceError::Vetoed`]
    /// when a policy rolled back or blocked the verified change, or a
    /// snapshot failure
    pub async fn commit(&self, handle: OperationHandle) -> Result<CommitReport, GovernanceError> {
        let after = self.ctx.snapshots.capture(&format!("after:{}", handle.name)).await?;
        self.publish_captured(&handle, &after).await;

        let context = handle
            .options
            .verification(self.ctx.config.verification.context());
        match self.ctx.verifier.verify(&handle.before, &after, &context).await {
            Ok(diff) => {
                let unexpected = self.publish_unexpected(&handle, &diff).await;
                let unexpected_paths: Vec<&str> =
                    diff.unexpected_changes.iter().map(|u| u.path.as_str()).collect();
                let verified = self
                    .publish_commit_event(
                        EventType::OperationVerified,
                        json!({
                            "operation": handle.name,
                            "operation_id": handle.id,
                            "run_id": handle.options.run_id,
                            "risk_level": diff.risk_level,
                            "changed": diff.changed_count(),
                            "requires_approval": diff.requires_approval(),
                            "unexpected": unexpected_paths,
                        }),
                    )
                    .await;
                if let Some((policy, reason)) = unexpected.or(verified) {
                    return self.veto(handle, diff, policy, reason).await;
                }
                info!(
                    operation = %handle.name,
                    operation_id = %handle.id,
                    risk = %diff.risk_level,
                    changed = diff.changed_count(),
                    "operation committed"
                );
                self.publish(
                    EventType::OperationCommitted,
                    GOVERNOR_ACTOR,
                    json!({
                        "operation": handle.name,
                        "operation_id": handle.id,
                        "before": handle.before.id,
                        "after": after.id,
                        "risk_level": diff.risk_level,
                        "changed": diff.changed_count(),
                        "requires_approval": diff.requires_approval(),
                    }),
                )
                .await;
                self.release(&handle.before.id).await;
                self.ctx.loops.reset(&handle.id);
                Ok(CommitReport {
                    operation_id: handle.id,
                    diff,
                    after: after.id,
                })
            }
            Err(error) => {
                self.publish_unexpected(&handle, &error.diff).await;
                warn!(
                    operation = %handle.name,
                    operation_id = %handle.id,
                    stage = %error.stage,
                    failure = %error.failure,
                    "verification failed"
                );
                self.publish(
                    EventType::VerificationFailed,
                    GOVERNOR_ACTOR,
                    json!({
                        "operation": handle.name,
                        "operation_id": handle.id,
                        "stage": error.stage,
                        "failure": error.failure,
                        "risk_level": error.diff.risk_level,
                        "error_class": error.error_class(),
                    }),
                )
                .await;

                if !handle.options.rollback_on_failure {
                    return Err(GovernanceError::Rejected(Box::new(RejectedCommit { error, handle })));
                }
                let report = self.rollback(&handle, &error.diff).await?;
                self.ctx.loops.reset(&handle.id);
                if let (true, Some(run_id)) = (error.is_timeout(), &handle.options.run_id) {
                    let item = self
                        .ctx
                        .dlq
                        .add_failed_item(
                            run_id,
                            &handle.name,
                            json!({
                                "operation": handle.name,
                                "operation_id": handle.id,
                                "before": handle.before.id,
                            }),
                            Failure::classified(error.to_string(), ErrorClass::Transient),
                            json!({"stage": error.stage, "failure": error.failure}),
                        )
                        .await?;
                    warn!(
                        operation = %handle.name,
                        run_id = %run_id,
                        dlq_item = %item.id,
                        "verification timed out, operation queued for retry"
                    );
                    return Err(GovernanceError::Deferred {
                        error,
                        report,
                        item: Box::new(item),
                    });
                }
                Err(GovernanceError::RolledBack { error, report })
            }
        }
    }

    async fn veto(
        &self,
        handle: OperationHandle,
        diff: Diff,
        policy: String,
        reason: String,
    ) -> Result<CommitReport, GovernanceError> {
        warn!(
            operation = %handle.name,
            operation_id = %handle.id,
            %policy,
            %reason,
            "commit vetoed by policy"
        );
        if !handle.options.rollback_on_failure {
            return Err(GovernanceError::Vetoed(Box::new(VetoedCommit {
                policy,
                reason,
                diff,
                rollback: None,
                handle: Some(handle),
            })));
        }
        let report = self.rollback(&handle, &diff).await?;
        self.ctx.loops.reset(&handle.id);
        Err(GovernanceError::Vetoed(Box::new(VetoedCommit {
            policy,
            reason,
            diff,
            rollback: Some(report),
            handle: None,
        })))
    }

    /// Restore the before snapshot regardless of what changed
    ///
    /// # Errors
    /// Snapshot failure while capturing or restoring
    pub async fn abort(&self, handle: OperationHandle, reason: &str) -> Result<AbortReport, GovernanceError> {
        let after = self.ctx.snapshots.capture(&format!("abort:{}", handle.name)).await?;
        self.publish_captured(&handle, &after).await;
        let diff = self.ctx.verifier.diff(&handle.before, &after);
        let rollback = self.rollback(&handle, &diff).await?;

        info!(operation = %handle.name, operation_id = %handle.id, reason, "operation aborted");
        self.publish(
            EventType::OperationAborted,
            GOVERNOR_ACTOR,
            json!({
                "operation": handle.name,
                "operation_id": handle.id,
                "reason": reason,
                "restored": rollback.restored.len(),
                "removed": rollback.removed.len(),
                "unrestorable": rollback.unrestorable,
            }),
        )
        .await;
        self.ctx.loops.reset(&handle.id);
        Ok(AbortReport {
            operation_id: handle.id,
            diff,
            rollback,
        })
    }

    async fn rollback(&self, handle: &OperationHandle, diff: &Diff) -> Result<RollbackReport, GovernanceError> {
        let report = match self.ctx.snapshots.restore(&handle.before, diff).await {
            Ok(report) => report,
            Err(e) => {
                // Left pinned: the before snapshot is the only record of the prior tree
                error!(operation_id = %handle.id, error = %e, "rollback failed");
                self.publish(
                    EventType::RollbackFailed,
                    GOVERNOR_ACTOR,
                    json!({
                        "operation": handle.name,
                        "operation_id": handle.id,
                        "snapshot": handle.before.id,
                        "error": e.to_string(),
                    }),
                )
                .await;
                return Err(e.into());
            }
        };

        let event_type = if report.is_complete() {
            EventType::RollbackCompleted
        } else {
            warn!(
                operation_id = %handle.id,
                unrestorable = ?report.unrestorable,
                "rollback incomplete"
            );
            EventType::RollbackFailed
        };
        self.publish(
            event_type,
            GOVERNOR_ACTOR,
            json!({
                "operation": handle.name,
                "operation_id": handle.id,
                "snapshot": handle.before.id,
                "restored": report.restored,
                "removed": report.removed,
                "unrestorable": report.unrestorable,
            }),
        )
        .await;
        self.release(&handle.before.id).await;
        Ok(report)
    }

    async fn release(&self, snapshot: &SnapshotId) {
        if let Err(e) = self.ctx.snapshots.unpin(snapshot).await {
            warn!(snapshot = %snapshot, error = %e, "snapshot pin not released");
        }
    }

    /// Assess paths against the risk domains without touching the tree
    #[must_use]
    pub fn preflight<S: AsRef<str>>(&self, paths: &[S]) -> PreflightReport {
        let assessments = self.ctx.risk_domains.assess_risks(paths);
        let requires_approval = assessments.iter().any(|a| a.requires_approval);
        PreflightReport {
            assessments,
            requires_approval,
        }
    }

    /// Count one loop iteration of `operation_id`
    ///
    /// The first suspicious and the first fatal checkpoint persist the
    /// profile to `loops/<operation>.json` and publish an event.
    ///
    /// # Errors
    /// [`GovernanceError::InfiniteLoop`] once the iteration limit is exceeded
    pub async fn checkpoint(
        &self,
        operation_id: &OperationId,
        max_iterations: Option<u64>,
    ) -> Result<CheckpointOutcome, GovernanceError> {
        match self.ctx.loops.checkpoint(operation_id, max_iterations) {
            Ok(outcome) => {
                if let Some(profile) = &outcome.escalated {
                    self.record_loop(EventType::LoopSuspicious, profile, None).await;
                }
                Ok(outcome)
            }
            Err(err) => {
                if err.first {
                    self.record_loop(EventType::LoopFatal, &err.profile, Some(err.max_iterations))
                        .await;
                }
                Err(err.into())
            }
        }
    }

    async fn record_loop(&self, event_type: EventType, profile: &LoopProfile, max_iterations: Option<u64>) {
        let key = format!("loops/{}.json", profile.operation_id);
        if let Err(e) = write_json(self.ctx.storage.as_ref(), &key, profile).await {
            warn!(operation = %profile.operation_id, error = %e, "loop profile not persisted");
        }
        self.publish(
            event_type,
            GOVERNOR_ACTOR,
            json!({
                "operation": profile.operation_id,
                "operation_id": profile.operation_id,
                "iterations": profile.iterations,
                "rate_per_second": profile.rate_per_second,
                "duration_seconds": profile.duration_seconds,
                "max_iterations": max_iterations,
                "state": profile.state,
            }),
        )
        .await;
    }

    /// Clear loop counters on normal completion
    pub fn finish_loop(&self, operation_id: &OperationId) -> Option<LoopProfile> {
        self.ctx.loops.reset(operation_id)
    }

    /// Run `operation` under the unit timeout; failures go to the DLQ
    ///
    /// A timeout is queued as TRANSIENT. The unit is never retried in place.
    ///
    /// # Errors
    /// Only when queueing the failure itself fails
    pub async fn with_retry_and_dlq<T, F, Fut>(
        &self,
        unit: &WorkUnit,
        operation: F,
    ) -> Result<UnitOutcome<T>, GovernanceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let timeout = unit.timeout.unwrap_or_else(|| self.ctx.config.unit_timeout());
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Failure::classified(
                format!("unit timed out after {}ms", timeout.as_millis()),
                ErrorClass::Transient,
            )),
        };

        match result {
            Ok(value) => Ok(UnitOutcome::Completed(value)),
            Err(failure) => {
                warn!(
                    run_id = %unit.run_id,
                    item_id = %unit.item_id,
                    error = %failure.message,
                    "unit failed, routing to dead-letter queue"
                );
                let item = self
                    .ctx
                    .dlq
                    .add_failed_item(
                        &unit.run_id,
                        &unit.item_id,
                        unit.payload.clone(),
                        failure,
                        unit.context.clone(),
                    )
                    .await?;
                Ok(UnitOutcome::Queued(item))
            }
        }
    }

    /// Budget check, then [`with_retry_and_dlq`](Self::with_retry_and_dlq),
    /// then a usage charge for a completed unit
    ///
    /// The charge is the unit's cost estimate and the measured wall time.
    ///
    /// # Errors
    /// [`GovernanceError::BudgetRejected`] before the unit runs, or a
    /// budget/DLQ storage failure
    pub async fn execute_unit<T, F, Fut>(
        &self,
        unit: &WorkUnit,
        operation: F,
    ) -> Result<UnitOutcome<T>, GovernanceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let check = self
            .ctx
            .budget
            .check_budget(
                &unit.run_id,
                unit.estimated_cost_usd,
                unit.estimated_time_ms,
                unit.agent_id.as_ref(),
            )
            .await?;
        if let Some(rejection) = check.rejection() {
            warn!(
                run_id = %unit.run_id,
                item_id = %unit.item_id,
                scope = %rejection.scope,
                reason = %rejection.reason,
                "unit rejected by budget"
            );
            return Err(rejection.into());
        }

        let started = Instant::now();
        let outcome = self.with_retry_and_dlq(unit, operation).await?;
        if matches!(outcome, UnitOutcome::Completed(_)) {
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let mut record = UsageRecord::new(unit.item_id.clone(), unit.estimated_cost_usd, elapsed_ms);
            if let Some(agent) = &unit.agent_id {
                record = record.with_agent(agent.clone());
            }
            self.ctx.budget.record_usage(&unit.run_id, record).await?;
        }
        Ok(outcome)
    }

    /// Retry every due dead-letter item, each under the unit timeout
    ///
    /// The kill switch is re-read before every item; once it is active the
    /// remaining items stay pending and are counted in
    /// [`RetrySweep::skipped`].
    ///
    /// # Errors
    /// [`GovernanceError::KillSwitchActive`], or a DLQ storage failure
    pub async fn retry_pending<F, Fut>(
        &self,
        run_id: Option<&RunId>,
        handler: F,
    ) -> Result<RetrySweep, GovernanceError>
    where
        F: Fn(DlqItem) -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        self.ensure_not_killed().await?;
        let timeout = self.ctx.config.unit_timeout();
        let governor = self;
        let sweep = self
            .ctx
            .dlq
            .retry_due_while(
                run_id,
                move || async move { governor.ensure_not_killed().await.is_ok() },
                |item| {
                    let attempt = handler(item);
                    async move {
                        match tokio::time::timeout(timeout, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(Failure::classified(
                                format!("retry timed out after {}ms", timeout.as_millis()),
                                ErrorClass::Transient,
                            )),
                        }
                    }
                },
            )
            .await?;
        info!(
            attempted = sweep.attempted,
            recovered = sweep.recovered,
            rescheduled = sweep.rescheduled,
            exhausted = sweep.exhausted,
            skipped = sweep.skipped,
            "dead-letter retry sweep finished"
        );
        Ok(sweep)
    }

    /// Validate and audit a metric movement, then publish the decision
    ///
    /// # Errors
    /// The decision could not be written to the audit chain
    pub async fn validate_metric(&self, change: &MetricChange) -> Result<MetricDecision, GovernanceError> {
        let decision = self.ctx.metrics.validate(change).await?;
        let event_type = if decision.allowed {
            EventType::MetricChanged
        } else {
            EventType::MetricRejected
        };
        self.publish(
            event_type,
            &change.actor,
            json!({
                "metric": change.metric,
                "old_value": change.old_value,
                "new_value": change.new_value,
                "delta": decision.delta,
                "approver": change.approver,
                "requires_approval": decision.requires_approval,
                "reason": decision.reason,
                "violations": decision.violations,
            }),
        )
        .await;
        Ok(decision)
    }

    /// Expire old snapshots, purge those marked longer than `grace`, and
    /// drop audit records older than the snapshot retention window
    ///
    /// # Errors
    /// Storage failure
    pub async fn collect_garbage(&self, grace: chrono::Duration) -> Result<GcReport, GovernanceError> {
        let marked = self.ctx.snapshots.mark_expired().await?;
        let purged = self.ctx.snapshots.purge_marked(grace).await?;
        let retention = chrono::Duration::days(i64::from(self.ctx.config.snapshot.retention_days));
        let audit_records_dropped = self
            .ctx
            .audit
            .truncate_before(self.ctx.clock.now() - retention)
            .await?;
        info!(
            marked = marked.len(),
            purged = purged.len(),
            audit_records_dropped,
            "garbage collection finished"
        );
        Ok(GcReport {
            marked,
            purged,
            audit_records_dropped,
        })
    }
}
