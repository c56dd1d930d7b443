//! Runaway loop detection
//!
//! Each operation id moves through Normal → Suspicious → Fatal. Suspicious is
//! reported once and is never an error; Fatal fails every later checkpoint
//! until the operation is reset.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use warden_core::{OperationId, SharedClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Normal,
    Suspicious,
    Fatal,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Suspicious => "suspicious",
            Self::Fatal => "fatal",
        })
    }
}

/// Counters for one operation at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopProfile {
    pub operation_id: OperationId,
    pub iterations: u64,
    pub rate_per_second: f64,
    pub duration_seconds: f64,
    pub whitelisted: bool,
    pub state: LoopState,
    pub recorded_at: DateTime<Utc>,
}

/// `[loops]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    pub max_iterations: u64,
    pub max_rate_per_second: f64,
    /// Operation ids that never escalate
    pub whitelist: Vec<String>,
    /// Escalated profiles kept in memory
    pub history_limit: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_rate_per_second: 50.0,
            whitelist: Vec::new(),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("infinite loop in '{}': {} iterations exceed limit of {max_iterations}", .profile.operation_id, .profile.iterations)]
pub struct InfiniteLoopError {
    pub max_iterations: u64,
    pub profile: LoopProfile,
    /// Set on the checkpoint that declared the loop fatal
    pub first: bool,
}

/// Result of a non-fatal checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointOutcome {
    pub state: LoopState,
    pub iterations: u64,
    pub rate_per_second: f64,
    /// Set on the checkpoint that first crossed the suspicious threshold
    pub escalated: Option<LoopProfile>,
}

#[derive(Debug)]
struct Tracker {
    iterations: u64,
    started_at: DateTime<Utc>,
    recent: VecDeque<DateTime<Utc>>,
    state: LoopState,
}

/// Per-operation loop state machine
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    clock: SharedClock,
    trackers: DashMap<OperationId, Tracker>,
    whitelist: RwLock<HashSet<String>>,
    history: Mutex<VecDeque<LoopProfile>>,
}

impl LoopDetector {
    #[must_use]
    pub fn new(config: LoopDetectorConfig, clock: SharedClock) -> Self {
        let whitelist = config.whitelist.iter().cloned().collect();
        Self {
            config,
            clock,
            trackers: DashMap::new(),
            whitelist: RwLock::new(whitelist),
            history: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &LoopDetectorConfig {
        &self.config
    }

    /// Count one iteration of `operation_id`
    ///
    /// # Errors
    /// [`InfiniteLoopError`] once cumulative iterations exceed the limit
    pub fn checkpoint(
        &self,
        operation_id: &OperationId,
        max_iterations: Option<u64>,
    ) -> Result<CheckpointOutcome, InfiniteLoopError> {
        let now = self.clock.now();
        let max_iterations = max_iterations.unwrap_or(self.config.max_iterations);
        let whitelisted = self.is_whitelisted(operation_id);

        let mut tracker = self
            .trackers
            .entry(operation_id.clone())
            .or_insert_with(|| Tracker {
                iterations: 0,
                started_at: now,
                recent: VecDeque::new(),
                state: LoopState::Normal,
            });

        tracker.iterations += 1;
        tracker.recent.push_back(now);
        let window_start = now - Duration::seconds(1);
        while tracker.recent.front().is_some_and(|t| *t <= window_start) {
            tracker.recent.pop_front();
        }

        #[allow(clippy::cast_precision_loss)]
        let rate = tracker.recent.len() as f64;
        let iterations = tracker.iterations;

        if whitelisted {
            return Ok(CheckpointOutcome {
                state: LoopState::Normal,
                iterations,
                rate_per_second: rate,
                escalated: None,
            });
        }

        if iterations > max_iterations || tracker.state == LoopState::Fatal {
            let first = tracker.state != LoopState::Fatal;
            tracker.state = LoopState::Fatal;
            let profile = Self::profile_of(operation_id, &tracker, rate, false, now);
            drop(tracker);
            if first {
                tracing::error!(
                    operation = %operation_id,
                    iterations,
                    max_iterations,
                    "loop declared fatal"
                );
                self.remember(profile.clone());
            }
            return Err(InfiniteLoopError {
                max_iterations,
                profile,
                first,
            });
        }

        let mut escalated = None;
        if rate > self.config.max_rate_per_second && tracker.state == LoopState::Normal {
            tracker.state = LoopState::Suspicious;
            let profile = Self::profile_of(operation_id, &tracker, rate, false, now);
            tracing::warn!(
                operation = %operation_id,
                iterations,
                rate_per_second = rate,
                "loop rate suspicious"
            );
            escalated = Some(profile);
        }
        let state = tracker.state;
        drop(tracker);

        if let Some(profile) = &escalated {
            self.remember(profile.clone());
        }

        Ok(CheckpointOutcome {
            state,
            iterations,
            rate_per_second: rate,
            escalated,
        })
    }

    /// Clear counters on normal completion, returning the final profile
    pub fn reset(&self, operation_id: &OperationId) -> Option<LoopProfile> {
        let whitelisted = self.is_whitelisted(operation_id);
        let now = self.clock.now();
        self.trackers.remove(operation_id).map(|(_, tracker)| {
            #[allow(clippy::cast_precision_loss)]
            let rate = tracker.recent.len() as f64;
            Self::profile_of(operation_id, &tracker, rate, whitelisted, now)
        })
    }

    /// Current counters, if the operation is tracked
    #[must_use]
    pub fn profile(&self, operation_id: &OperationId) -> Option<LoopProfile> {
        let whitelisted = self.is_whitelisted(operation_id);
        let now = self.clock.now();
        self.trackers.get(operation_id).map(|tracker| {
            let window_start = now - Duration::seconds(1);
            #[allow(clippy::cast_precision_loss)]
            let rate = tracker.recent.iter().filter(|t| **t > window_start).count() as f64;
            Self::profile_of(operation_id, &tracker, rate, whitelisted, now)
        })
    }

    pub fn whitelist(&self, operation_id: &OperationId) {
        self.whitelist.write().insert(operation_id.as_str().to_string());
    }

    pub fn unwhitelist(&self, operation_id: &OperationId) {
        self.whitelist.write().remove(operation_id.as_str());
    }

    #[must_use]
    pub fn is_whitelisted(&self, operation_id: &OperationId) -> bool {
        self.whitelist.read().contains(operation_id.as_str())
    }

    /// Escalated profiles, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<LoopProfile> {
        self.history.lock().iter().cloned().collect()
    }

    fn remember(&self, profile: LoopProfile) {
        let mut history = self.history.lock();
        history.push_back(profile);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    fn profile_of(
        operation_id: &OperationId,
        tracker: &Tracker,
        rate: f64,
        whitelisted: bool,
        now: DateTime<Utc>,
    ) -> LoopProfile {
        #[allow(clippy::cast_precision_loss)]
        let duration_seconds = (now - tracker.started_at).num_milliseconds() as f64 / 1000.0;
        LoopProfile {
            operation_id: operation_id.clone(),
            iterations: tracker.iterations,
            rate_per_second: rate,
            duration_seconds,
            whitelisted,
            state: tracker.state,
            recorded_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_core::ManualClock;

    fn detector(clock: &ManualClock, config: LoopDetectorConfig) -> LoopDetector {
        LoopDetector::new(config, Arc::new(clock.clone()))
    }

    #[test]
    fn exceeding_max_iterations_is_fatal() {
        let clock = ManualClock::starting_now();
        let det = detector(&clock, LoopDetectorConfig::default());
        let op = OperationId::new("scan");

        for _ in 0..5 {
            clock.advance_ms(100);
            assert!(det.checkpoint(&op, Some(5)).is_ok());
        }
        clock.advance_ms(100);
        let err = det.checkpoint(&op, Some(5)).unwrap_err();
        assert_eq!(err.profile.iterations, 6);
        assert_eq!(err.profile.state, LoopState::Fatal);
        assert!(err.first);

        // Stays fatal until reset
        let again = det.checkpoint(&op, Some(100)).unwrap_err();
        assert!(!again.first);
        assert_eq!(det.history().len(), 1);

        det.reset(&op);
        assert!(det.checkpoint(&op, Some(5)).is_ok());
    }

    #[test]
    fn high_rate_is_suspicious_once() {
        let clock = ManualClock::starting_now();
        let det = detector(
            &clock,
            LoopDetectorConfig {
                max_rate_per_second: 3.0,
                ..LoopDetectorConfig::default()
            },
        );
        let op = OperationId::new("burst");

        let mut escalations = 0;
        for _ in 0..10 {
            clock.advance_ms(10);
            let outcome = det.checkpoint(&op, None).unwrap();
            if outcome.escalated.is_some() {
                escalations += 1;
            }
        }
        assert_eq!(escalations, 1);
        assert_eq!(det.profile(&op).unwrap().state, LoopState::Suspicious);
    }

    #[test]
    fn slow_iterations_stay_normal() {
        let clock = ManualClock::starting_now();
        let det = detector(
            &clock,
            LoopDetectorConfig {
                max_rate_per_second: 2.0,
                ..LoopDetectorConfig::default()
            },
        );
        let op = OperationId::new("steady");
        for _ in 0..20 {
            clock.advance_ms(600);
            assert_eq!(det.checkpoint(&op, None).unwrap().state, LoopState::Normal);
        }
    }

    #[test]
    fn whitelisted_operations_never_escalate() {
        let clock = ManualClock::starting_now();
        let det = detector(
            &clock,
            LoopDetectorConfig {
                whitelist: vec!["poller".into()],
                ..LoopDetectorConfig::default()
            },
        );
        let op = OperationId::new("poller");
        for _ in 0..50 {
            let outcome = det.checkpoint(&op, Some(10)).unwrap();
            assert_eq!(outcome.state, LoopState::Normal);
        }
        let profile = det.reset(&op).unwrap();
        assert!(profile.whitelisted);
        assert_eq!(profile.iterations, 50);
    }

    #[test]
    fn history_is_bounded() {
        let clock = ManualClock::starting_now();
        let det = detector(
            &clock,
            LoopDetectorConfig {
                history_limit: 2,
                ..LoopDetectorConfig::default()
            },
        );
        for i in 0..4 {
            let op = OperationId::new(format!("op-{i}"));
            det.checkpoint(&op, Some(0)).unwrap_err();
        }
        let history = det.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].operation_id.as_str(), "op-2");
    }
}
