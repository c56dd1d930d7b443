//! Dead-letter records and their on-disk log format

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::{DlqItemId, ErrorClass, RunId};

/// When an item is next eligible for retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrySchedule {
    At(DateTime<Utc>),
    /// Frozen; only `reprocess` brings it back
    Exhausted,
}

impl RetrySchedule {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }

    #[must_use]
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(at) => Some(*at),
            Self::Exhausted => None,
        }
    }
}

/// A failed unit of work waiting for retry or triage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: DlqItemId,
    pub run_id: RunId,
    /// Caller-side identity of the unit; unique per run
    pub item_id: String,
    pub payload: Value,
    pub error_class: ErrorClass,
    pub error_message: String,
    pub first_failure_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub next_retry_at: RetrySchedule,
    #[serde(default)]
    pub context: Value,
}

impl DlqItem {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.next_retry_at.is_exhausted() || self.retry_count >= self.max_retries
    }

    /// Retryable and due at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_count < self.max_retries
            && self.next_retry_at.due_at().is_some_and(|at| at <= now)
    }
}

/// A failure report; an explicit class overrides the classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub class: Option<ErrorClass>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
        }
    }

    pub fn classified(message: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            message: message.into(),
            class: Some(class),
        }
    }
}

impl<E: std::error::Error> From<&E> for Failure {
    fn from(err: &E) -> Self {
        Self::new(err.to_string())
    }
}

/// One line of `dlq/runs/<run>.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DlqRecord {
    Upsert { item: DlqItem },
    Remove { id: DlqItemId, at: DateTime<Utc> },
}

/// Result of a single retry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Succeeded; the item left the queue
    Recovered(DlqItem),
    Rescheduled(DlqItem),
    Exhausted(DlqItem),
}

impl RetryOutcome {
    #[must_use]
    pub fn item(&self) -> &DlqItem {
        match self {
            Self::Recovered(item) | Self::Rescheduled(item) | Self::Exhausted(item) => item,
        }
    }
}

/// Counts per queue, optionally scoped to one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: usize,
    pub pending: usize,
    pub waiting: usize,
    pub exhausted: usize,
    pub transient: usize,
    pub permanent: usize,
    pub policy: usize,
}

/// Summary of a `retry_due` sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySweep {
    pub attempted: usize,
    pub recovered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Due items left pending because the sweep was halted
    pub skipped: usize,
}

impl RetrySweep {
    #[inline]
    #[must_use]
    pub fn halted(&self) -> bool {
        self.skipped > 0
    }
}
