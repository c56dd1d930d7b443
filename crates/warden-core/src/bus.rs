//! Governance event bus
//!
//! Every component publishes [`GovernanceEvent`]s here. Subscribers are
//! awaited in registration order; a failing subscriber is logged and counted
//! in the [`PublishReport`] but never fails the publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of governance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OperationStarted,
    OperationCommitted,
    OperationAborted,
    SnapshotCaptured,
    UnexpectedChange,
    OperationVerified,
    VerificationFailed,
    RollbackCompleted,
    RollbackFailed,
    BudgetWarning,
    BudgetExceeded,
    KillSwitchActivated,
    KillSwitchDeactivated,
    LoopSuspicious,
    LoopFatal,
    MetricChanged,
    MetricRejected,
    ConfigChanged,
    DlqItemAdded,
    DlqItemExhausted,
    DlqItemRecovered,
    PolicyTriggered,
    PolicyActionFailed,
}

impl EventType {
    /// Every event type, in declaration order
    pub const ALL: [EventType; 23] = [
        Self::OperationStarted,
        Self::OperationCommitted,
        Self::OperationAborted,
        Self::SnapshotCaptured,
        Self::UnexpectedChange,
        Self::OperationVerified,
        Self::VerificationFailed,
        Self::RollbackCompleted,
        Self::RollbackFailed,
        Self::BudgetWarning,
        Self::BudgetExceeded,
        Self::KillSwitchActivated,
        Self::KillSwitchDeactivated,
        Self::LoopSuspicious,
        Self::LoopFatal,
        Self::MetricChanged,
        Self::MetricRejected,
        Self::ConfigChanged,
        Self::DlqItemAdded,
        Self::DlqItemExhausted,
        Self::DlqItemRecovered,
        Self::PolicyTriggered,
        Self::PolicyActionFailed,
    ];

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OperationStarted => "operation_started",
            Self::OperationCommitted => "operation_committed",
            Self::OperationAborted => "operation_aborted",
            Self::SnapshotCaptured => "snapshot_captured",
            Self::UnexpectedChange => "unexpected_change",
            Self::OperationVerified => "operation_verified",
            Self::VerificationFailed => "verification_failed",
            Self::RollbackCompleted => "rollback_completed",
            Self::RollbackFailed => "rollback_failed",
            Self::BudgetWarning => "budget_warning",
            Self::BudgetExceeded => "budget_exceeded",
            Self::KillSwitchActivated => "kill_switch_activated",
            Self::KillSwitchDeactivated => "kill_switch_deactivated",
            Self::LoopSuspicious => "loop_suspicious",
            Self::LoopFatal => "loop_fatal",
            Self::MetricChanged => "metric_changed",
            Self::MetricRejected => "metric_rejected",
            Self::ConfigChanged => "config_changed",
            Self::DlqItemAdded => "dlq_item_added",
            Self::DlqItemExhausted => "dlq_item_exhausted",
            Self::DlqItemRecovered => "dlq_item_recovered",
            Self::PolicyTriggered => "policy_triggered",
            Self::PolicyActionFailed => "policy_action_failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceEvent {
    /// Unique event id
    pub id: Uuid,
    /// Event kind
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Component or host that emitted the event
    pub actor: String,
    /// Free-form payload
    pub data: serde_json::Value,
    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl GovernanceEvent {
    /// Create an event stamped now
    #[must_use]
    pub fn new(event_type: EventType, actor: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            actor: actor.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Override the timestamp
    #[inline]
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Subscriber failure
#[derive(Debug, thiserror::Error)]
#[error("subscriber '{subscriber}' failed: {message}")]
pub struct SubscriberError {
    pub subscriber: String,
    pub message: String,
}

impl SubscriberError {
    pub fn new(subscriber: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            message: message.into(),
        }
    }
}

/// Receives governance events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> &str;

    /// Handle one event
    async fn on_event(&self, event: &GovernanceEvent) -> Result<(), SubscriberError>;
}

/// Outcome of one publish
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Subscribers that handled the event
    pub delivered: usize,
    /// Subscribers that returned an error
    pub failures: Vec<SubscriberError>,
}

impl PublishReport {
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fan-out bus
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .subscribers
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        f.debug_struct("EventBus").field("subscribers", &names).finish()
    }
}

impl EventBus {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "subscriber registered");
        self.subscribers.write().push(subscriber);
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber
    pub async fn publish(&self, event: GovernanceEvent) -> PublishReport {
        // Snapshot the list so no lock is held across awaits
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self.subscribers.read().clone();

        tracing::debug!(
            event_type = %event.event_type,
            actor = %event.actor,
            subscribers = subscribers.len(),
            "publishing event"
        );

        let mut report = PublishReport::default();
        for subscriber in subscribers {
            match subscriber.on_event(&event).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        event_type = %event.event_type,
                        subscriber = subscriber.name(),
                        error = %e,
                        "subscriber failed"
                    );
                    report.failures.push(e);
                }
            }
        }
        report
    }

    /// Build and publish an event
    pub async fn emit(
        &self,
        event_type: EventType,
        actor: &str,
        data: serde_json::Value,
    ) -> PublishReport {
        self.publish(GovernanceEvent::new(event_type, actor, data))
            .await
    }
}
