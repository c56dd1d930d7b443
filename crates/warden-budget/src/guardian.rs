//! Budget guardian
//!
//! Every check starts with a fresh read of the kill switch, then walks run
//! status, run ceilings, the per-item ceiling and per-agent ceilings in that
//! order. Updates to one run are serialized by that run's async lock and
//! persisted before the lock is released; events go out after it.

use crate::error::BudgetError;
use crate::limits::BudgetConfig;
use crate::state::{
    AgentRemaining, AgentUsage, BudgetCheck, BudgetDimension, BudgetState, BudgetWarning,
    RecommendedAction, RejectionScope, RunStatus, UsageOutcome, UsageRecord,
};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use warden_core::storage::{read_json, write_json};
use warden_core::{
    AgentId, EventBus, EventType, GovernanceEvent, KillSwitch, KillSwitchActor, KillSwitchState,
    RunId, SharedClock, SharedStorage,
};

/// Tolerance for float accumulation when comparing against ceilings
pub const CEILING_EPSILON: f64 = 1e-9;

const ACTOR: &str = "budget-guardian";

type RunSlot = Arc<Mutex<Option<BudgetState>>>;

/// Enforces run and agent ceilings
#[derive(Debug)]
pub struct BudgetGuardian {
    config: BudgetConfig,
    storage: SharedStorage,
    kill_switch: Arc<KillSwitch>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    runs: DashMap<RunId, RunSlot>,
}

impl BudgetGuardian {
    #[must_use]
    pub fn new(
        config: BudgetConfig,
        storage: SharedStorage,
        kill_switch: Arc<KillSwitch>,
        bus: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            storage,
            kill_switch,
            bus,
            clock,
            runs: DashMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn key(run_id: &RunId) -> String {
        format!("budget/{run_id}.json")
    }

    fn slot(&self, run_id: &RunId) -> RunSlot {
        Arc::clone(self.runs.entry(run_id.clone()).or_default().value())
    }

    async fn load(&self, run_id: &RunId, slot: &mut Option<BudgetState>) -> Result<(), BudgetError> {
        if slot.is_none() {
            *slot = read_json(self.storage.as_ref(), &Self::key(run_id)).await?;
        }
        Ok(())
    }

    async fn persist(&self, state: &BudgetState) -> Result<(), BudgetError> {
        write_json(self.storage.as_ref(), &Self::key(&state.run_id), state).await?;
        Ok(())
    }

    async fn publish_all(&self, events: Vec<GovernanceEvent>) {
        for event in events {
            self.bus.publish(event).await;
        }
    }

    /// Create the run's budget state; returns the existing state if present
    ///
    /// # Errors
    /// Unknown profile or storage failure
    pub async fn initialize_run(
        &self,
        run_id: &RunId,
        session_id: &str,
        profile: Option<&str>,
        items_total: u64,
    ) -> Result<BudgetState, BudgetError> {
        let slot = self.slot(run_id);
        let mut guard = slot.lock().await;
        self.load(run_id, &mut guard).await?;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let (profile_name, limits) = self
            .config
            .profile(profile)
            .ok_or_else(|| BudgetError::UnknownProfile(profile.unwrap_or_default().to_string()))?;
        let now = self.clock.now();
        let state = BudgetState {
            run_id: run_id.clone(),
            session_id: session_id.to_string(),
            profile: profile_name.to_string(),
            start_time: now,
            total_cost_usd: 0.0,
            total_time_ms: 0,
            items_processed: 0,
            items_remaining: items_total,
            limits: limits.clone(),
            per_agent_usage: Default::default(),
            status: RunStatus::Running,
            warnings: Vec::new(),
            recorded_units: Default::default(),
            updated_at: now,
        };
        self.persist(&state).await?;
        tracing::info!(run_id = %run_id, profile = profile_name, items_total, "budget run initialized");
        *guard = Some(state.clone());
        Ok(state)
    }

    /// Current state of a run
    ///
    /// # Errors
    /// [`BudgetError::UnknownRun`] or storage failure
    pub async fn state(&self, run_id: &RunId) -> Result<BudgetState, BudgetError> {
        let slot = self.slot(run_id);
        let mut guard = slot.lock().await;
        self.load(run_id, &mut guard).await?;
        guard
            .clone()
            .ok_or_else(|| BudgetError::UnknownRun(run_id.clone()))
    }

    /// Decide whether a unit with the given estimate may start
    ///
    /// # Errors
    /// Unknown run, invalid estimate or storage failure
    pub async fn check_budget(
        &self,
        run_id: &RunId,
        cost_usd: f64,
        time_ms: u64,
        agent_id: Option<&AgentId>,
    ) -> Result<BudgetCheck, BudgetError> {
        let kill_reason = match self.kill_switch.state().await {
            Ok(state) if state.triggered => Some(format!(
                "kill switch active: {}",
                state.reason.as_deref().unwrap_or("no reason given")
            )),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "kill switch unreadable, rejecting");
                Some(format!("kill switch state unreadable: {e}"))
            }
        };
        if kill_reason.is_none() {
            validate_cost("<estimate>", cost_usd)?;
        }

        let slot = self.slot(run_id);
        let mut guard = slot.lock().await;
        self.load(run_id, &mut guard).await?;
        let state = guard
            .as_mut()
            .ok_or_else(|| BudgetError::UnknownRun(run_id.clone()))?;

        let mut events = Vec::new();
        let mut breach_kill = None;
        let check = self.evaluate(state, kill_reason, cost_usd, time_ms, agent_id, &mut events, &mut breach_kill);

        if !events.is_empty() {
            state.updated_at = self.clock.now();
            self.persist(state).await?;
        }
        drop(guard);

        if let Some(reason) = breach_kill {
            self.activate_kill_switch(&reason, KillSwitchActor::BudgetGuardian)
                .await?;
        }
        self.publish_all(events).await;
        Ok(check)
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn evaluate(
        &self,
        state: &mut BudgetState,
        kill_reason: Option<String>,
        cost_usd: f64,
        time_ms: u64,
        agent_id: Option<&AgentId>,
        events: &mut Vec<GovernanceEvent>,
        breach_kill: &mut Option<String>,
    ) -> BudgetCheck {
        let agent_remaining = agent_id.and_then(|a| agent_remaining(state, a));
        let reject = |state: &BudgetState,
                      scope: RejectionScope,
                      reason: String,
                      action: RecommendedAction,
                      agent_remaining: Option<AgentRemaining>| {
            tracing::warn!(run_id = %state.run_id, %scope, %reason, "budget check rejected");
            BudgetCheck {
                can_proceed: false,
                status: state.status,
                reason: Some(reason),
                rejection: Some(scope),
                warning_level: None,
                remaining_cost_usd: state.remaining_cost_usd(),
                remaining_time_ms: state.remaining_time_ms(),
                agent_remaining,
                recommended_action: action,
            }
        };

        // (a) kill switch
        if let Some(reason) = kill_reason {
            return reject(state, RejectionScope::KillSwitch, reason, RecommendedAction::AwaitOperator, agent_remaining);
        }

        // (b) run status
        match state.status {
            RunStatus::Running => {}
            RunStatus::Paused => {
                return reject(
                    state,
                    RejectionScope::Run,
                    "run is paused".to_string(),
                    RecommendedAction::ResumeRun,
                    agent_remaining,
                );
            }
            status => {
                return reject(
                    state,
                    RejectionScope::Run,
                    format!("run is {status}"),
                    RecommendedAction::StopRun,
                    agent_remaining,
                );
            }
        }

        // (c) run ceilings
        let limits = state.limits.clone();
        let projected_cost = state.total_cost_usd + cost_usd;
        let projected_time = state.total_time_ms.saturating_add(time_ms);
        let projected_items = state.items_processed.saturating_add(1);
        let breach = if projected_cost > limits.max_cost_per_run + CEILING_EPSILON {
            Some(format!(
                "run cost ceiling exceeded: {projected_cost:.4} > {:.4} USD",
                limits.max_cost_per_run
            ))
        } else if projected_time > limits.max_time_per_run_ms {
            Some(format!(
                "run time ceiling exceeded: {projected_time} > {} ms",
                limits.max_time_per_run_ms
            ))
        } else if projected_items > limits.max_items {
            Some(format!(
                "run item ceiling exceeded: {projected_items} > {}",
                limits.max_items
            ))
        } else {
            None
        };
        if let Some(reason) = breach {
            state.status = RunStatus::BudgetExceeded;
            events.push(GovernanceEvent::new(
                EventType::BudgetExceeded,
                ACTOR,
                json!({
                    "run_id": state.run_id,
                    "reason": reason,
                    "total_cost_usd": state.total_cost_usd,
                    "total_time_ms": state.total_time_ms,
                    "items_processed": state.items_processed,
                }),
            ));
            if self.config.kill_on_run_exceeded {
                *breach_kill = Some(format!("run {}: {reason}", state.run_id));
            }
            return reject(state, RejectionScope::Run, reason, RecommendedAction::StopRun, agent_remaining);
        }

        if cost_usd > limits.max_cost_per_item + CEILING_EPSILON {
            let reason = format!(
                "item cost {cost_usd:.4} exceeds per-item ceiling {:.4} USD",
                limits.max_cost_per_item
            );
            return reject(state, RejectionScope::Item, reason, RecommendedAction::SkipItem, agent_remaining);
        }

        // (d) per-agent ceilings
        if let Some(agent) = agent_id {
            if let Some(reason) = agent_breach(state, agent, cost_usd, time_ms) {
                return reject(state, RejectionScope::Agent, reason, RecommendedAction::ThrottleAgent, agent_remaining);
            }
        }

        // (e) advisory utilisation bands
        let now = self.clock.now();
        let mut warning_level: Option<f64> = None;
        #[allow(clippy::cast_precision_loss)]
        let dimensions = [
            (BudgetDimension::Cost, ratio(projected_cost, state.limits.max_cost_per_run)),
            (
                BudgetDimension::Time,
                ratio(projected_time as f64, state.limits.max_time_per_run_ms as f64),
            ),
            (
                BudgetDimension::Items,
                ratio(projected_items as f64, state.limits.max_items as f64),
            ),
        ];
        let mut thresholds = self.config.warning_thresholds.clone();
        thresholds.sort_by(f64::total_cmp);
        for (dimension, utilisation) in dimensions {
            for &threshold in &thresholds {
                if utilisation + CEILING_EPSILON < threshold {
                    continue;
                }
                warning_level = Some(warning_level.map_or(threshold, |w| w.max(threshold)));
                if state.has_warning(dimension, threshold) {
                    continue;
                }
                state.warnings.push(BudgetWarning {
                    dimension,
                    threshold,
                    utilisation,
                    at: now,
                });
                tracing::info!(run_id = %state.run_id, ?dimension, threshold, utilisation, "budget warning band reached");
                events.push(GovernanceEvent::new(
                    EventType::BudgetWarning,
                    ACTOR,
                    json!({
                        "run_id": state.run_id,
                        "dimension": dimension,
                        "threshold": threshold,
                        "utilisation": utilisation,
                    }),
                ));
            }
        }

        BudgetCheck {
            can_proceed: true,
            status: state.status,
            reason: None,
            rejection: None,
            warning_level,
            remaining_cost_usd: state.remaining_cost_usd(),
            remaining_time_ms: state.remaining_time_ms(),
            agent_remaining,
            recommended_action: if warning_level.is_some() {
                RecommendedAction::ProceedWithCaution
            } else {
                RecommendedAction::Proceed
            },
        }
    }

    /// Charge a completed unit; charging the same unit twice is a no-op
    ///
    /// # Errors
    /// Unknown run, negative or non-finite cost, storage failure
    pub async fn record_usage(&self, run_id: &RunId, record: UsageRecord) -> Result<UsageOutcome, BudgetError> {
        validate_cost(&record.unit_id, record.cost_usd)?;

        let slot = self.slot(run_id);
        let mut guard = slot.lock().await;
        self.load(run_id, &mut guard).await?;
        let state = guard
            .as_mut()
            .ok_or_else(|| BudgetError::UnknownRun(run_id.clone()))?;

        if state.recorded_units.contains(&record.unit_id) {
            tracing::debug!(run_id = %run_id, unit_id = %record.unit_id, "duplicate usage ignored");
            return Ok(UsageOutcome {
                duplicate: true,
                total_cost_usd: state.total_cost_usd,
                total_time_ms: state.total_time_ms,
                items_processed: state.items_processed,
            });
        }

        state.total_cost_usd += record.cost_usd;
        state.total_time_ms = state.total_time_ms.saturating_add(record.time_ms);
        state.items_processed = state.items_processed.saturating_add(1);
        state.items_remaining = state.items_remaining.saturating_sub(1);
        if let Some(agent) = &record.agent_id {
            let usage = state
                .per_agent_usage
                .entry(agent.as_str().to_string())
                .or_insert_with(AgentUsage::default);
            usage.cost_usd += record.cost_usd;
            usage.time_ms = usage.time_ms.saturating_add(record.time_ms);
            usage.calls = usage.calls.saturating_add(1);
        }
        state.recorded_units.insert(record.unit_id.clone());
        state.updated_at = self.clock.now();
        self.persist(state).await?;

        tracing::debug!(
            run_id = %run_id,
            unit_id = %record.unit_id,
            cost_usd = record.cost_usd,
            total_cost_usd = state.total_cost_usd,
            "usage recorded"
        );
        Ok(UsageOutcome {
            duplicate: false,
            total_cost_usd: state.total_cost_usd,
            total_time_ms: state.total_time_ms,
            items_processed: state.items_processed,
        })
    }

    async fn transition(
        &self,
        run_id: &RunId,
        action: &'static str,
        allowed: &[RunStatus],
        to: RunStatus,
    ) -> Result<BudgetState, BudgetError> {
        let slot = self.slot(run_id);
        let mut guard = slot.lock().await;
        self.load(run_id, &mut guard).await?;
        let state = guard
            .as_mut()
            .ok_or_else(|| BudgetError::UnknownRun(run_id.clone()))?;

        if state.status == to {
            return Ok(state.clone());
        }
        if !allowed.contains(&state.status) {
            return Err(BudgetError::InvalidTransition {
                run_id: run_id.clone(),
                status: state.status,
                action,
            });
        }
        let from = state.status;
        state.status = to;
        state.updated_at = self.clock.now();
        self.persist(state).await?;
        tracing::info!(run_id = %run_id, %from, %to, "run status changed");
        Ok(state.clone())
    }

    /// # Errors
    /// Run not running, unknown run or storage failure
    pub async fn pause_run(&self, run_id: &RunId) -> Result<BudgetState, BudgetError> {
        self.transition(run_id, "pause", &[RunStatus::Running], RunStatus::Paused)
            .await
    }

    /// # Errors
    /// Run not paused, unknown run or storage failure
    pub async fn resume_run(&self, run_id: &RunId) -> Result<BudgetState, BudgetError> {
        self.transition(run_id, "resume", &[RunStatus::Paused], RunStatus::Running)
            .await
    }

    /// # Errors
    /// Run already terminal, unknown run or storage failure
    pub async fn complete_run(&self, run_id: &RunId) -> Result<BudgetState, BudgetError> {
        self.transition(
            run_id,
            "complete",
            &[RunStatus::Running, RunStatus::Paused],
            RunStatus::Completed,
        )
        .await
    }

    /// Stop one run without touching the global kill switch
    ///
    /// # Errors
    /// Run already terminal, unknown run or storage failure
    pub async fn kill_run(&self, run_id: &RunId) -> Result<BudgetState, BudgetError> {
        self.transition(
            run_id,
            "kill",
            &[RunStatus::Running, RunStatus::Paused],
            RunStatus::Killed,
        )
        .await
    }

    /// # Errors
    /// Storage failure
    pub async fn activate_kill_switch(
        &self,
        reason: &str,
        actor: KillSwitchActor,
    ) -> Result<KillSwitchState, BudgetError> {
        let was_triggered = self.kill_switch.is_triggered().await.unwrap_or(false);
        let state = self.kill_switch.activate(reason, actor).await?;
        if state.triggered && !was_triggered {
            self.bus
                .emit(
                    EventType::KillSwitchActivated,
                    ACTOR,
                    json!({"reason": reason, "actor": actor}),
                )
                .await;
        }
        Ok(state)
    }

    /// # Errors
    /// Operator override held or storage failure
    pub async fn deactivate_kill_switch(&self, actor: KillSwitchActor) -> Result<KillSwitchState, BudgetError> {
        let was_triggered = self.kill_switch.is_triggered().await.unwrap_or(true);
        let state = self.kill_switch.deactivate(actor).await?;
        if was_triggered && !state.triggered {
            self.bus
                .emit(EventType::KillSwitchDeactivated, ACTOR, json!({"actor": actor}))
                .await;
        }
        Ok(state)
    }

    /// # Errors
    /// Storage failure
    pub async fn kill_switch_state(&self) -> Result<KillSwitchState, BudgetError> {
        Ok(self.kill_switch.state().await?)
    }
}

fn validate_cost(unit_id: &str, cost: f64) -> Result<(), BudgetError> {
    if cost.is_finite() && cost >= 0.0 {
        Ok(())
    } else {
        Err(BudgetError::InvalidUsage {
            unit_id: unit_id.to_string(),
            message: format!("cost must be finite and non-negative, got {cost}"),
        })
    }
}

fn ratio(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        if value > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        value / max
    }
}

fn agent_breach(state: &BudgetState, agent: &AgentId, cost: f64, time_ms: u64) -> Option<String> {
    let limits = state.limits.agent(agent.as_str())?;
    let usage = state
        .per_agent_usage
        .get(agent.as_str())
        .cloned()
        .unwrap_or_default();

    if let Some(max) = limits.max_cost_usd {
        if usage.cost_usd + cost > max + CEILING_EPSILON {
            return Some(format!(
                "agent {agent} cost ceiling exceeded: {:.4} > {max:.4} USD",
                usage.cost_usd + cost
            ));
        }
    }
    if let Some(max) = limits.max_time_ms {
        if usage.time_ms.saturating_add(time_ms) > max {
            return Some(format!(
                "agent {agent} time ceiling exceeded: {} > {max} ms",
                usage.time_ms.saturating_add(time_ms)
            ));
        }
    }
    if let Some(max) = limits.max_calls {
        if usage.calls.saturating_add(1) > max {
            return Some(format!("agent {agent} call ceiling reached: {max} calls"));
        }
    }
    None
}

fn agent_remaining(state: &BudgetState, agent: &AgentId) -> Option<AgentRemaining> {
    let limits = state.limits.agent(agent.as_str())?;
    let usage = state
        .per_agent_usage
        .get(agent.as_str())
        .cloned()
        .unwrap_or_default();
    Some(AgentRemaining {
        agent_id: agent.clone(),
        cost_usd: limits.max_cost_usd.map(|m| (m - usage.cost_usd).max(0.0)),
        time_ms: limits.max_time_ms.map(|m| m.saturating_sub(usage.time_ms)),
        calls: limits.max_calls.map(|m| m.saturating_sub(usage.calls)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{AgentLimits, BudgetLimits};
    use pretty_assertions::assert_eq;
    use warden_core::{ManualClock, MemoryStorage};

    fn guardian(limits: BudgetLimits, kill_on_exceeded: bool) -> (BudgetGuardian, Arc<KillSwitch>) {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let kill_switch = Arc::new(KillSwitch::new(storage.clone(), clock.clone()));
        let mut config = BudgetConfig::default();
        config.profiles.insert("test".into(), limits);
        config.default_profile = "test".into();
        config.kill_on_run_exceeded = kill_on_exceeded;
        let g = BudgetGuardian::new(config, storage, kill_switch.clone(), Arc::new(EventBus::new()), clock);
        (g, kill_switch)
    }

    fn limits() -> BudgetLimits {
        BudgetLimits {
            max_cost_per_run: 1.0,
            max_time_per_run_ms: 60_000,
            max_cost_per_item: 0.5,
            max_items: 10,
            per_agent: Default::default(),
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        let a = g.initialize_run(&run, "s1", None, 5).await.unwrap();
        let b = g.initialize_run(&run, "other", None, 99).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b.items_remaining, 5);
        assert!(matches!(
            g.initialize_run(&RunId::new("r2"), "s", Some("nope"), 1).await,
            Err(BudgetError::UnknownProfile(_))
        ));
    }

    #[tokio::test]
    async fn run_ceiling_rejects_and_marks_exceeded() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();

        for i in 0..3 {
            let check = g.check_budget(&run, 0.3, 100, None).await.unwrap();
            assert!(check.can_proceed);
            g.record_usage(&run, UsageRecord::new(format!("u{i}"), 0.3, 100))
                .await
                .unwrap();
        }
        let check = g.check_budget(&run, 0.3, 100, None).await.unwrap();
        assert!(!check.can_proceed);
        assert_eq!(check.rejection, Some(RejectionScope::Run));
        assert_eq!(check.recommended_action, RecommendedAction::StopRun);
        assert_eq!(g.state(&run).await.unwrap().status, RunStatus::BudgetExceeded);

        // Stays rejected even for free work
        let check = g.check_budget(&run, 0.0, 0, None).await.unwrap();
        assert!(!check.can_proceed);
    }

    #[tokio::test]
    async fn exact_ceiling_is_allowed() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        for i in 0..9 {
            g.record_usage(&run, UsageRecord::new(format!("u{i}"), 0.1, 0))
                .await
                .unwrap();
        }
        // 0.9 accumulated in floats plus 0.1 lands on 1.0 within tolerance
        let check = g.check_budget(&run, 0.1, 0, None).await.unwrap();
        assert!(check.can_proceed, "{:?}", check.reason);
    }

    #[tokio::test]
    async fn per_item_rejection_keeps_run_running() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        let check = g.check_budget(&run, 0.6, 0, None).await.unwrap();
        assert_eq!(check.rejection, Some(RejectionScope::Item));
        assert_eq!(g.state(&run).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn agent_ceiling_is_scoped_to_agent() {
        let mut l = limits();
        l.per_agent.insert(
            "writer".into(),
            AgentLimits {
                max_calls: Some(1),
                ..AgentLimits::default()
            },
        );
        let (g, _) = guardian(l, false);
        let run = RunId::new("r1");
        let writer = AgentId::new("writer");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        g.record_usage(
            &run,
            UsageRecord::new("u1", 0.01, 0).with_agent(writer.clone()),
        )
        .await
        .unwrap();

        let check = g.check_budget(&run, 0.01, 0, Some(&writer)).await.unwrap();
        assert_eq!(check.rejection, Some(RejectionScope::Agent));
        assert_eq!(check.agent_remaining.unwrap().calls, Some(0));

        let reader = AgentId::new("reader");
        assert!(g.check_budget(&run, 0.01, 0, Some(&reader)).await.unwrap().can_proceed);
    }

    #[tokio::test]
    async fn kill_switch_wins_over_everything() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        g.activate_kill_switch("operator stop", KillSwitchActor::Operator)
            .await
            .unwrap();

        let check = g.check_budget(&run, 0.0, 0, None).await.unwrap();
        assert_eq!(check.rejection, Some(RejectionScope::KillSwitch));
        assert!(check.rejection().unwrap().is_critical());

        g.deactivate_kill_switch(KillSwitchActor::Operator)
            .await
            .unwrap();
        assert!(g.check_budget(&run, 0.0, 0, None).await.unwrap().can_proceed);
    }

    #[tokio::test]
    async fn kill_switch_is_read_before_the_estimate_is_validated() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        assert!(matches!(
            g.check_budget(&run, -1.0, 0, None).await,
            Err(BudgetError::InvalidUsage { .. })
        ));

        g.activate_kill_switch("operator stop", KillSwitchActor::Operator)
            .await
            .unwrap();
        let check = g.check_budget(&run, -1.0, 0, None).await.unwrap();
        assert_eq!(check.rejection, Some(RejectionScope::KillSwitch));
        assert!(check.rejection().unwrap().is_critical());
    }

    #[tokio::test]
    async fn breach_can_trigger_kill_switch() {
        let (g, ks) = guardian(limits(), true);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        let check = g.check_budget(&run, 0.0, 120_000, None).await.unwrap();
        assert_eq!(check.rejection, Some(RejectionScope::Run));
        let state = ks.state().await.unwrap();
        assert!(state.triggered);
        assert_eq!(state.triggered_by, Some(KillSwitchActor::BudgetGuardian));
    }

    #[tokio::test]
    async fn warnings_recorded_once_per_band() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        g.record_usage(&run, UsageRecord::new("u1", 0.45, 0)).await.unwrap();
        g.record_usage(&run, UsageRecord::new("u2", 0.4, 0)).await.unwrap();

        let check = g.check_budget(&run, 0.01, 0, None).await.unwrap();
        assert!(check.can_proceed);
        assert_eq!(check.warning_level, Some(0.75));
        assert_eq!(check.recommended_action, RecommendedAction::ProceedWithCaution);

        g.check_budget(&run, 0.01, 0, None).await.unwrap();
        let cost_warnings = g
            .state(&run)
            .await
            .unwrap()
            .warnings
            .iter()
            .filter(|w| w.dimension == BudgetDimension::Cost)
            .count();
        assert_eq!(cost_warnings, 2);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_usage() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();
        assert!(!g.record_usage(&run, UsageRecord::new("u1", 0.2, 5)).await.unwrap().duplicate);
        let again = g.record_usage(&run, UsageRecord::new("u1", 0.2, 5)).await.unwrap();
        assert!(again.duplicate);
        assert!((again.total_cost_usd - 0.2).abs() < 1e-12);

        assert!(matches!(
            g.record_usage(&run, UsageRecord::new("u2", -1.0, 0)).await,
            Err(BudgetError::InvalidUsage { .. })
        ));
        assert!(matches!(
            g.record_usage(&run, UsageRecord::new("u3", f64::INFINITY, 0)).await,
            Err(BudgetError::InvalidUsage { .. })
        ));
    }

    #[tokio::test]
    async fn pause_resume_complete() {
        let (g, _) = guardian(limits(), false);
        let run = RunId::new("r1");
        g.initialize_run(&run, "s", None, 10).await.unwrap();

        g.pause_run(&run).await.unwrap();
        let check = g.check_budget(&run, 0.0, 0, None).await.unwrap();
        assert_eq!(check.recommended_action, RecommendedAction::ResumeRun);

        g.resume_run(&run).await.unwrap();
        g.complete_run(&run).await.unwrap();
        assert!(matches!(
            g.resume_run(&run).await,
            Err(BudgetError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_run_is_an_error() {
        let (g, _) = guardian(limits(), false);
        assert!(matches!(
            g.check_budget(&RunId::new("ghost"), 0.0, 0, None).await,
            Err(BudgetError::UnknownRun(_))
        ));
    }
}
