//! Durable kill switch
//!
//! A single record at `control/kill_switch.json`. Every query reads storage so
//! an operator can flip the switch from outside the process. Callers treat a
//! failed read as triggered.

use crate::clock::SharedClock;
use crate::error::StorageError;
use crate::storage::{read_json, write_json, SharedStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage key of the kill switch record
pub const KILL_SWITCH_KEY: &str = "control/kill_switch.json";

/// Who flipped the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchActor {
    Operator,
    BudgetGuardian,
    PolicyRuntime,
}

impl KillSwitchActor {
    #[inline]
    #[must_use]
    pub fn is_automated(self) -> bool {
        !matches!(self, Self::Operator)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::BudgetGuardian => "budget_guardian",
            Self::PolicyRuntime => "policy_runtime",
        }
    }
}

impl fmt::Display for KillSwitchActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted kill switch record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchState {
    /// Whether automated actors may trigger the switch
    pub enabled: bool,
    pub triggered: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<KillSwitchActor>,
    /// Set by operator activation; only an operator may clear it
    pub manual_override: bool,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            enabled: true,
            triggered: false,
            reason: None,
            triggered_at: None,
            triggered_by: None,
            manual_override: false,
        }
    }
}

/// Kill switch failures
#[derive(Debug, thiserror::Error)]
pub enum KillSwitchError {
    #[error("kill switch storage error: {0}")]
    Storage(#[from] StorageError),

    /// Operator-held switch cannot be released by an automated actor
    #[error("kill switch is held by operator override; {actor} cannot release it")]
    OverrideHeld { actor: KillSwitchActor },
}

/// Handle to the durable kill switch
#[derive(Debug)]
pub struct KillSwitch {
    storage: SharedStorage,
    clock: SharedClock,
    write_lock: tokio::sync::Mutex<()>,
}

impl KillSwitch {
    #[must_use]
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self {
            storage,
            clock,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Fresh read of the durable record
    ///
    /// # Errors
    /// Storage read or decode failure
    pub async fn state(&self) -> Result<KillSwitchState, KillSwitchError> {
        Ok(read_json(self.storage.as_ref(), KILL_SWITCH_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Whether the switch is triggered
    ///
    /// # Errors
    /// Storage read or decode failure
    pub async fn is_triggered(&self) -> Result<bool, KillSwitchError> {
        Ok(self.state().await?.triggered)
    }

    /// Whether the switch is triggered, reporting `true` when it cannot be read
    pub async fn is_triggered_or_unknown(&self) -> bool {
        match self.is_triggered().await {
            Ok(triggered) => triggered,
            Err(e) => {
                tracing::error!(error = %e, "kill switch unreadable, failing closed");
                true
            }
        }
    }

    /// Trigger the switch
    ///
    /// Automated actors are ignored while the switch is disabled. Operator
    /// activation always applies and sets the manual override.
    ///
    /// # Errors
    /// Storage failure
    pub async fn activate(
        &self,
        reason: impl Into<String>,
        actor: KillSwitchActor,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.state().await?;

        if actor.is_automated() && !state.enabled {
            tracing::warn!(%actor, "kill switch disabled, automated activation ignored");
            return Ok(state);
        }

        let is_operator = actor == KillSwitchActor::Operator;
        if state.triggered && (!is_operator || state.manual_override) {
            return Ok(state);
        }

        let reason = reason.into();
        if !state.triggered {
            state.triggered = true;
            state.reason = Some(reason.clone());
            state.triggered_at = Some(self.clock.now());
            state.triggered_by = Some(actor);
        }
        if is_operator {
            state.manual_override = true;
        }

        write_json(self.storage.as_ref(), KILL_SWITCH_KEY, &state).await?;
        tracing::warn!(%actor, %reason, "kill switch activated");
        Ok(state)
    }

    /// Release the switch
    ///
    /// # Errors
    /// [`KillSwitchError::OverrideHeld`] when an automated actor tries to
    /// release an operator-held switch; storage failure
    pub async fn deactivate(
        &self,
        actor: KillSwitchActor,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.state().await?;

        if state.manual_override && actor.is_automated() {
            return Err(KillSwitchError::OverrideHeld { actor });
        }
        if !state.triggered && !state.manual_override {
            return Ok(state);
        }

        state.triggered = false;
        state.reason = None;
        state.triggered_at = None;
        state.triggered_by = None;
        state.manual_override = false;

        write_json(self.storage.as_ref(), KILL_SWITCH_KEY, &state).await?;
        tracing::info!(%actor, "kill switch deactivated");
        Ok(state)
    }

    /// Allow or forbid automated activation
    ///
    /// # Errors
    /// Storage failure
    pub async fn set_enabled(&self, enabled: bool) -> Result<KillSwitchState, KillSwitchError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.state().await?;
        state.enabled = enabled;
        write_json(self.storage.as_ref(), KILL_SWITCH_KEY, &state).await?;
        Ok(state)
    }
}
