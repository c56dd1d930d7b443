//! Durable dead-letter queue
//!
//! Each run owns an append-only log at `dlq/runs/<run>.jsonl`. New items are
//! appended; updates and removals compact the run's log by atomic rewrite so
//! the file always replays to the in-memory view. `dlq/index.json` is a
//! derived summary refreshed best-effort and by [`DeadLetterQueue::rebuild_index`];
//! it is never read back.

use crate::backoff::{BackoffPolicy, DlqConfig};
use crate::error::DlqError;
use crate::item::{DlqItem, DlqRecord, DlqStats, Failure, RetryOutcome, RetrySchedule, RetrySweep};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_core::storage::{parse_json_lines, write_json};
use warden_core::{
    DlqItemId, ErrorClass, ErrorClassifier, EventBus, EventType, GovernanceEvent, RunId,
    SharedClock, SharedStorage,
};

const ACTOR: &str = "dead-letter-queue";
const RUNS_PREFIX: &str = "dlq/runs/";
pub const DLQ_INDEX_KEY: &str = "dlq/index.json";

/// Summary row of `dlq/index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqIndexEntry {
    pub id: DlqItemId,
    pub run_id: RunId,
    pub item_id: String,
    pub error_class: ErrorClass,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: RetrySchedule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqIndex {
    pub generated_at: DateTime<Utc>,
    pub items: Vec<DlqIndexEntry>,
}

pub struct DeadLetterQueue {
    storage: SharedStorage,
    config: DlqConfig,
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
    bus: Arc<EventBus>,
    clock: SharedClock,
    items: Mutex<BTreeMap<DlqItemId, DlqItem>>,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn run_key(run_id: &RunId) -> String {
    format!("{RUNS_PREFIX}{run_id}.jsonl")
}

fn schedule_after(now: DateTime<Utc>, delay_ms: u64) -> RetrySchedule {
    let delay = Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX));
    RetrySchedule::At(now.checked_add_signed(delay).unwrap_or(now))
}

impl DeadLetterQueue {
    /// Open the queue, replaying every run log under `dlq/runs/`
    ///
    /// # Errors
    /// Storage failure while listing or reading logs
    pub async fn open(
        storage: SharedStorage,
        config: DlqConfig,
        classifier: ErrorClassifier,
        bus: Arc<EventBus>,
        clock: SharedClock,
    ) -> Result<Self, DlqError> {
        let mut items = BTreeMap::new();
        for key in storage.list(RUNS_PREFIX).await? {
            if !key.ends_with(".jsonl") {
                continue;
            }
            let Some(bytes) = storage.read(&key).await? else {
                continue;
            };
            for record in parse_json_lines::<DlqRecord>(&key, &bytes) {
                match record {
                    DlqRecord::Upsert { item } => {
                        items.insert(item.id.clone(), item);
                    }
                    DlqRecord::Remove { id, .. } => {
                        items.remove(&id);
                    }
                }
            }
        }
        debug!(items = items.len(), "dead-letter queue replayed");

        Ok(Self {
            storage,
            backoff: config.backoff(),
            config,
            classifier,
            bus,
            clock,
            items: Mutex::new(items),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn classify(&self, failure: &Failure) -> ErrorClass {
        failure
            .class
            .unwrap_or_else(|| self.classifier.classify(&failure.message))
    }

    /// Rewrite one run's log from the in-memory view
    async fn compact(
        &self,
        items: &BTreeMap<DlqItemId, DlqItem>,
        run_id: &RunId,
    ) -> Result<(), DlqError> {
        let key = run_key(run_id);
        let mut buf = Vec::new();
        for item in items.values().filter(|i| &i.run_id == run_id) {
            let record = DlqRecord::Upsert { item: item.clone() };
            let line = serde_json::to_vec(&record)
                .map_err(|e| warden_core::StorageError::serialization(&key, e))?;
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }
        if buf.is_empty() {
            self.storage.remove(&key).await?;
        } else {
            self.storage.write_atomic(&key, &buf).await?;
        }
        Ok(())
    }

    async fn refresh_index(&self, items: &BTreeMap<DlqItemId, DlqItem>) {
        if let Err(e) = self.write_index(items).await {
            warn!(error = %e, "failed to refresh dlq index");
        }
    }

    async fn write_index(&self, items: &BTreeMap<DlqItemId, DlqItem>) -> Result<usize, DlqError> {
        let index = DlqIndex {
            generated_at: self.clock.now(),
            items: items
                .values()
                .map(|item| DlqIndexEntry {
                    id: item.id.clone(),
                    run_id: item.run_id.clone(),
                    item_id: item.item_id.clone(),
                    error_class: item.error_class,
                    retry_count: item.retry_count,
                    max_retries: item.max_retries,
                    next_retry_at: item.next_retry_at,
                })
                .collect(),
        };
        write_json(self.storage.as_ref(), DLQ_INDEX_KEY, &index).await?;
        Ok(index.items.len())
    }

    async fn publish_all(&self, events: Vec<GovernanceEvent>) {
        for event in events {
            self.bus.publish(event).await;
        }
    }

    fn exhausted_event(&self, item: &DlqItem) -> GovernanceEvent {
        GovernanceEvent::new(
            EventType::DlqItemExhausted,
            ACTOR,
            json!({
                "dlq_id": item.id,
                "run_id": item.run_id,
                "item_id": item.item_id,
                "error_class": item.error_class,
                "error_message": item.error_message,
                "retry_count": item.retry_count,
            }),
        )
        .at(self.clock.now())
    }

    /// Queue a failed unit
    ///
    /// Re-adding the same `(run_id, item_id)` returns the queued item
    /// unchanged. Non-retryable classes are stored already exhausted.
    ///
    /// # Errors
    /// Storage failure while appending to the run log
    pub async fn add_failed_item(
        &self,
        run_id: &RunId,
        item_id: &str,
        payload: Value,
        failure: Failure,
        context: Value,
    ) -> Result<DlqItem, DlqError> {
        let mut items = self.items.lock().await;
        if let Some(existing) = items
            .values()
            .find(|i| &i.run_id == run_id && i.item_id == item_id)
        {
            debug!(run_id = %run_id, item_id, "unit already queued");
            return Ok(existing.clone());
        }

        let now = self.clock.now();
        let class = self.classify(&failure);
        let max_retries = if class.is_retryable() {
            self.config.max_retries
        } else {
            0
        };
        let (backoff_ms, next_retry_at) = if max_retries > 0 {
            let delay = self.backoff.delay_ms(0);
            (delay, schedule_after(now, delay))
        } else {
            (0, RetrySchedule::Exhausted)
        };

        let item = DlqItem {
            id: DlqItemId::generate(),
            run_id: run_id.clone(),
            item_id: item_id.to_string(),
            payload,
            error_class: class,
            error_message: failure.message,
            first_failure_at: now,
            last_retry_at: None,
            retry_count: 0,
            max_retries,
            backoff_ms,
            next_retry_at,
            context,
        };

        let record = DlqRecord::Upsert { item: item.clone() };
        warden_core::storage::append_json(self.storage.as_ref(), &run_key(run_id), &record).await?;
        items.insert(item.id.clone(), item.clone());
        self.refresh_index(&items).await;
        drop(items);

        metrics::counter!("warden_dlq_items_added_total", "class" => class.as_str()).increment(1);
        info!(
            run_id = %run_id,
            item_id,
            dlq_id = %item.id,
            class = %class,
            backoff_ms,
            "unit routed to dead-letter queue"
        );

        let mut events = vec![GovernanceEvent::new(
            EventType::DlqItemAdded,
            ACTOR,
            json!({
                "dlq_id": item.id,
                "run_id": item.run_id,
                "item_id": item.item_id,
                "error_class": class,
                "error_message": item.error_message,
                "max_retries": item.max_retries,
            }),
        )
        .at(now)];
        if item.is_exhausted() {
            events.push(self.exhausted_event(&item));
        }
        self.publish_all(events).await;

        Ok(item)
    }

    /// Items due now with retries left, earliest first
    pub async fn get_pending_retries(&self, run_id: Option<&RunId>) -> Vec<DlqItem> {
        let now = self.clock.now();
        let items = self.items.lock().await;
        let mut due: Vec<DlqItem> = items
            .values()
            .filter(|i| run_id.map_or(true, |r| &i.run_id == r))
            .filter(|i| i.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_retry_at
                .due_at()
                .cmp(&b.next_retry_at.due_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        due
    }

    pub async fn get(&self, id: &DlqItemId) -> Option<DlqItem> {
        self.items.lock().await.get(id).cloned()
    }

    /// Every queued item, optionally restricted to one run
    pub async fn list(&self, run_id: Option<&RunId>) -> Vec<DlqItem> {
        self.items
            .lock()
            .await
            .values()
            .filter(|i| run_id.map_or(true, |r| &i.run_id == r))
            .cloned()
            .collect()
    }

    /// Record the result of one retry
    ///
    /// # Errors
    /// Unknown id, an exhausted item, or storage failure
    pub async fn mark_retry_attempt(
        &self,
        id: &DlqItemId,
        result: Result<(), Failure>,
    ) -> Result<RetryOutcome, DlqError> {
        let mut items = self.items.lock().await;
        let Some(current) = items.get(id).cloned() else {
            return Err(DlqError::NotFound(id.clone()));
        };
        if current.is_exhausted() {
            return Err(DlqError::NotRetryable(id.clone()));
        }
        let now = self.clock.now();

        let failure = match result {
            Ok(()) => {
                let Some(item) = items.remove(id) else {
                    return Err(DlqError::NotFound(id.clone()));
                };
                if let Err(e) = self.compact(&items, &item.run_id).await {
                    items.insert(item.id.clone(), item);
                    return Err(e);
                }
                self.refresh_index(&items).await;
                drop(items);

                metrics::counter!("warden_dlq_items_recovered_total").increment(1);
                info!(run_id = %item.run_id, item_id = %item.item_id, dlq_id = %id, "retry succeeded");
                self.bus
                    .publish(
                        GovernanceEvent::new(
                            EventType::DlqItemRecovered,
                            ACTOR,
                            json!({
                                "dlq_id": item.id,
                                "run_id": item.run_id,
                                "item_id": item.item_id,
                                "retry_count": item.retry_count,
                            }),
                        )
                        .at(now),
                    )
                    .await;
                return Ok(RetryOutcome::Recovered(item));
            }
            Err(failure) => failure,
        };

        let class = self.classify(&failure);
        let mut item = current;
        item.retry_count += 1;
        item.last_retry_at = Some(now);
        item.error_class = class;
        item.error_message = failure.message;

        if !class.is_retryable() {
            item.max_retries = item.retry_count;
        }
        let exhausted = item.retry_count >= item.max_retries;
        if exhausted {
            item.next_retry_at = RetrySchedule::Exhausted;
        } else {
            item.backoff_ms = self.backoff.delay_ms(item.retry_count);
            item.next_retry_at = schedule_after(now, item.backoff_ms);
        }

        let previous = items.insert(item.id.clone(), item.clone());
        if let Err(e) = self.compact(&items, &item.run_id).await {
            if let Some(previous) = previous {
                items.insert(previous.id.clone(), previous);
            }
            return Err(e);
        }
        self.refresh_index(&items).await;
        drop(items);

        if exhausted {
            metrics::counter!("warden_dlq_items_exhausted_total", "class" => class.as_str())
                .increment(1);
            warn!(
                run_id = %item.run_id,
                item_id = %item.item_id,
                dlq_id = %id,
                retry_count = item.retry_count,
                class = %class,
                "dead-letter item exhausted"
            );
            self.bus.publish(self.exhausted_event(&item)).await;
            Ok(RetryOutcome::Exhausted(item))
        } else {
            metrics::counter!("warden_dlq_retries_rescheduled_total").increment(1);
            debug!(
                dlq_id = %id,
                retry_count = item.retry_count,
                backoff_ms = item.backoff_ms,
                "retry rescheduled"
            );
            Ok(RetryOutcome::Rescheduled(item))
        }
    }

    /// Unfreeze an item for manual reprocessing, due immediately
    ///
    /// At least one retry is granted even when `max_retries` is `Some(0)`.
    ///
    /// # Errors
    /// Unknown id or storage failure
    pub async fn reprocess(
        &self,
        id: &DlqItemId,
        max_retries: Option<u32>,
    ) -> Result<DlqItem, DlqError> {
        let mut items = self.items.lock().await;
        let Some(current) = items.get(id) else {
            return Err(DlqError::NotFound(id.clone()));
        };
        let now = self.clock.now();
        let mut item = current.clone();
        item.retry_count = 0;
        item.max_retries = max_retries.unwrap_or(self.config.max_retries).max(1);
        item.backoff_ms = 0;
        item.next_retry_at = RetrySchedule::At(now);

        let previous = items.insert(item.id.clone(), item.clone());
        if let Err(e) = self.compact(&items, &item.run_id).await {
            if let Some(previous) = previous {
                items.insert(previous.id.clone(), previous);
            }
            return Err(e);
        }
        self.refresh_index(&items).await;
        info!(dlq_id = %id, max_retries = item.max_retries, "dead-letter item reprocessed");
        Ok(item)
    }

    /// Drop an item without retrying it
    ///
    /// # Errors
    /// Unknown id or storage failure
    pub async fn discard(&self, id: &DlqItemId) -> Result<DlqItem, DlqError> {
        let mut items = self.items.lock().await;
        let Some(item) = items.remove(id) else {
            return Err(DlqError::NotFound(id.clone()));
        };
        if let Err(e) = self.compact(&items, &item.run_id).await {
            items.insert(item.id.clone(), item);
            return Err(e);
        }
        self.refresh_index(&items).await;
        metrics::counter!("warden_dlq_items_discarded_total").increment(1);
        info!(dlq_id = %id, run_id = %item.run_id, "dead-letter item discarded");
        Ok(item)
    }

    pub async fn stats(&self, run_id: Option<&RunId>) -> DlqStats {
        let now = self.clock.now();
        let items = self.items.lock().await;
        let mut stats = DlqStats::default();
        for item in items
            .values()
            .filter(|i| run_id.map_or(true, |r| &i.run_id == r))
        {
            stats.total += 1;
            if item.is_exhausted() {
                stats.exhausted += 1;
            } else if item.is_due(now) {
                stats.pending += 1;
            } else {
                stats.waiting += 1;
            }
            match item.error_class {
                ErrorClass::Transient => stats.transient += 1,
                ErrorClass::Permanent => stats.permanent += 1,
                ErrorClass::Policy => stats.policy += 1,
            }
        }
        stats
    }

    /// Regenerate `dlq/index.json`; returns the number of indexed items
    ///
    /// # Errors
    /// Storage failure
    pub async fn rebuild_index(&self) -> Result<usize, DlqError> {
        let items = self.items.lock().await;
        self.write_index(&items).await
    }

    /// Retry every due item through `handler`, one at a time
    ///
    /// # Errors
    /// Storage failure while recording an attempt
    pub async fn retry_due<F, Fut>(
        &self,
        run_id: Option<&RunId>,
        handler: F,
    ) -> Result<RetrySweep, DlqError>
    where
        F: Fn(DlqItem) -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        self.retry_due_while(run_id, || async { true }, handler).await
    }

    /// [`retry_due`](Self::retry_due), asking `proceed` before every item
    ///
    /// The first `false` halts the sweep; that item and every later one stay
    /// pending untouched and are counted as `skipped`.
    ///
    /// # Errors
    /// Storage failure while recording an attempt
    pub async fn retry_due_while<G, GFut, F, Fut>(
        &self,
        run_id: Option<&RunId>,
        proceed: G,
        handler: F,
    ) -> Result<RetrySweep, DlqError>
    where
        G: Fn() -> GFut,
        GFut: Future<Output = bool>,
        F: Fn(DlqItem) -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        let mut sweep = RetrySweep::default();
        let due = self.get_pending_retries(run_id).await;
        let total = due.len();
        for (position, item) in due.into_iter().enumerate() {
            if !proceed().await {
                sweep.skipped = total - position;
                info!(skipped = sweep.skipped, "retry sweep halted");
                break;
            }
            let id = item.id.clone();
            let result = handler(item).await;
            sweep.attempted += 1;
            match self.mark_retry_attempt(&id, result).await {
                Ok(RetryOutcome::Recovered(_)) => sweep.recovered += 1,
                Ok(RetryOutcome::Rescheduled(_)) => sweep.rescheduled += 1,
                Ok(RetryOutcome::Exhausted(_)) => sweep.exhausted += 1,
                // Discarded or reprocessed while the handler ran
                Err(DlqError::NotFound(_) | DlqError::NotRetryable(_)) => {
                    sweep.attempted -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use warden_core::{ClassificationTable, ManualClock, MemoryStorage, Storage};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        queue: DeadLetterQueue,
    }

    fn config() -> DlqConfig {
        DlqConfig {
            jitter_pct: 0.0,
            ..DlqConfig::default()
        }
    }

    async fn open_with(storage: Arc<MemoryStorage>, clock: Arc<ManualClock>) -> DeadLetterQueue {
        let classifier = ErrorClassifier::from_table(&ClassificationTable::default()).unwrap();
        DeadLetterQueue::open(
            storage,
            config(),
            classifier,
            Arc::new(EventBus::new()),
            clock,
        )
        .await
        .unwrap()
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::starting_now());
        let queue = open_with(storage.clone(), clock.clone()).await;
        Fixture {
            storage,
            clock,
            queue,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_scheduled_with_initial_backoff() {
        let f = fixture().await;
        let run = RunId::new("r1");
        let item = f
            .queue
            .add_failed_item(&run, "u1", json!({"n": 1}), Failure::new("request timed out"), Value::Null)
            .await
            .unwrap();
        assert_eq!(item.error_class, ErrorClass::Transient);
        assert_eq!(item.max_retries, 3);
        assert_eq!(item.backoff_ms, 1_000);
        assert!(f.queue.get_pending_retries(None).await.is_empty());

        f.clock.advance_ms(1_000);
        let due = f.queue.get_pending_retries(Some(&run)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, item.id);
    }

    #[tokio::test]
    async fn permanent_and_policy_failures_are_exhausted_on_arrival() {
        let f = fixture().await;
        let run = RunId::new("r1");
        let permanent = f
            .queue
            .add_failed_item(&run, "a", Value::Null, Failure::new("401 Unauthorized"), Value::Null)
            .await
            .unwrap();
        let policy = f
            .queue
            .add_failed_item(&run, "b", Value::Null, Failure::new("contains PII"), Value::Null)
            .await
            .unwrap();
        assert_eq!(permanent.error_class, ErrorClass::Permanent);
        assert_eq!(policy.error_class, ErrorClass::Policy);
        assert!(permanent.is_exhausted() && policy.is_exhausted());
        assert_eq!(permanent.max_retries, 0);

        f.clock.advance_ms(10_000_000);
        assert!(f.queue.get_pending_retries(None).await.is_empty());
        assert!(matches!(
            f.queue.mark_retry_attempt(&permanent.id, Ok(())).await,
            Err(DlqError::NotRetryable(_))
        ));
    }

    #[tokio::test]
    async fn explicit_class_overrides_classifier() {
        let f = fixture().await;
        let item = f
            .queue
            .add_failed_item(
                &RunId::new("r"),
                "u",
                Value::Null,
                Failure::classified("timeout", ErrorClass::Permanent),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(item.error_class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn same_unit_is_queued_once() {
        let f = fixture().await;
        let run = RunId::new("r");
        let a = f
            .queue
            .add_failed_item(&run, "u", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        let b = f
            .queue
            .add_failed_item(&run, "u", Value::Null, Failure::new("503"), Value::Null)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(f.queue.stats(None).await.total, 1);
    }

    #[tokio::test]
    async fn repeated_failures_back_off_then_exhaust() {
        let f = fixture().await;
        let run = RunId::new("r");
        let item = f
            .queue
            .add_failed_item(&run, "u", Value::Null, Failure::new("503 service unavailable"), Value::Null)
            .await
            .unwrap();

        let mut backoffs = Vec::new();
        for _ in 0..2 {
            match f.queue.mark_retry_attempt(&item.id, Err(Failure::new("timeout"))).await.unwrap() {
                RetryOutcome::Rescheduled(next) => backoffs.push(next.backoff_ms),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(backoffs, vec![2_000, 4_000]);

        let last = f
            .queue
            .mark_retry_attempt(&item.id, Err(Failure::new("timeout")))
            .await
            .unwrap();
        let RetryOutcome::Exhausted(last) = last else {
            panic!("expected exhaustion");
        };
        assert_eq!(last.retry_count, 3);
        assert!(last.retry_count <= last.max_retries);
        assert_eq!(last.next_retry_at, RetrySchedule::Exhausted);
    }

    #[tokio::test]
    async fn non_retryable_retry_failure_freezes_item() {
        let f = fixture().await;
        let item = f
            .queue
            .add_failed_item(&RunId::new("r"), "u", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        let outcome = f
            .queue
            .mark_retry_attempt(&item.id, Err(Failure::new("validation failed")))
            .await
            .unwrap();
        let RetryOutcome::Exhausted(frozen) = outcome else {
            panic!("expected frozen item");
        };
        assert_eq!(frozen.error_class, ErrorClass::Permanent);
        assert_eq!(frozen.retry_count, frozen.max_retries);
    }

    #[tokio::test]
    async fn success_removes_item_and_log() {
        let f = fixture().await;
        let run = RunId::new("r");
        let item = f
            .queue
            .add_failed_item(&run, "u", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        assert!(f.storage.read(&run_key(&run)).await.unwrap().is_some());

        let outcome = f.queue.mark_retry_attempt(&item.id, Ok(())).await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Recovered(_)));
        assert!(f.queue.get(&item.id).await.is_none());
        assert!(f.storage.read(&run_key(&run)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reprocess_unfreezes_exhausted_item() {
        let f = fixture().await;
        let item = f
            .queue
            .add_failed_item(&RunId::new("r"), "u", Value::Null, Failure::new("bad request"), Value::Null)
            .await
            .unwrap();
        assert!(item.is_exhausted());

        let revived = f.queue.reprocess(&item.id, Some(2)).await.unwrap();
        assert_eq!(revived.retry_count, 0);
        assert_eq!(revived.max_retries, 2);
        assert_eq!(f.queue.get_pending_retries(None).await.len(), 1);
    }

    #[tokio::test]
    async fn queue_state_replays_after_reopen() {
        let f = fixture().await;
        let run = RunId::new("r");
        let kept = f
            .queue
            .add_failed_item(&run, "keep", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        let gone = f
            .queue
            .add_failed_item(&run, "gone", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        f.queue
            .mark_retry_attempt(&kept.id, Err(Failure::new("timeout")))
            .await
            .unwrap();
        f.queue.discard(&gone.id).await.unwrap();

        let reopened = open_with(f.storage.clone(), f.clock.clone()).await;
        let items = reopened.list(None).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, kept.id);
        assert_eq!(items[0].retry_count, 1);
    }

    #[tokio::test]
    async fn retry_due_sweeps_and_tallies() {
        let f = fixture().await;
        let run = RunId::new("r");
        for unit in ["ok", "flaky"] {
            f.queue
                .add_failed_item(&run, unit, json!(unit), Failure::new("timeout"), Value::Null)
                .await
                .unwrap();
        }
        f.clock.advance_ms(1_000);

        let sweep = f
            .queue
            .retry_due(Some(&run), |item| async move {
                if item.payload == json!("ok") {
                    Ok(())
                } else {
                    Err(Failure::new("timeout"))
                }
            })
            .await
            .unwrap();
        assert_eq!(
            sweep,
            RetrySweep {
                attempted: 2,
                recovered: 1,
                rescheduled: 1,
                exhausted: 0,
                skipped: 0,
            }
        );
    }

    #[tokio::test]
    async fn halted_sweep_leaves_remaining_items_pending() {
        let f = fixture().await;
        let run = RunId::new("r");
        for unit in ["a", "b", "c"] {
            f.queue
                .add_failed_item(&run, unit, json!(unit), Failure::new("timeout"), Value::Null)
                .await
                .unwrap();
        }
        f.clock.advance_ms(1_000);

        let calls = std::sync::atomic::AtomicUsize::new(0);
        let calls = &calls;
        let sweep = f
            .queue
            .retry_due_while(
                Some(&run),
                || async move { calls.load(std::sync::atomic::Ordering::SeqCst) == 0 },
                |_item| async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(sweep.attempted, 1);
        assert_eq!(sweep.recovered, 1);
        assert_eq!(sweep.skipped, 2);
        assert!(sweep.halted());
        assert_eq!(f.queue.get_pending_retries(Some(&run)).await.len(), 2);
    }

    #[tokio::test]
    async fn index_is_rebuildable() {
        let f = fixture().await;
        f.queue
            .add_failed_item(&RunId::new("a"), "u", Value::Null, Failure::new("timeout"), Value::Null)
            .await
            .unwrap();
        f.storage.remove(DLQ_INDEX_KEY).await.unwrap();
        assert_eq!(f.queue.rebuild_index().await.unwrap(), 1);
        let index: DlqIndex =
            warden_core::storage::read_json(f.storage.as_ref(), DLQ_INDEX_KEY)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(index.items.len(), 1);
    }
}
