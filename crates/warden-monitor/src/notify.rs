//! Notification broadcaster
//!
//! `notify` never blocks: it looks up the route for an event type and pushes
//! one job per channel onto a bounded queue. A fixed pool of worker tasks
//! drains the queue. Full queues drop jobs; channel errors and timeouts are
//! counted and logged. Nothing here propagates an error to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use warden_core::storage::{append_json, parse_json_lines};
use warden_core::{EventSubscriber, GovernanceEvent, Severity, SharedStorage, SubscriberError};

/// Storage key of the rolling alert log
pub const ALERT_LOG_KEY: &str = "alerts/alerts.jsonl";

/// One message handed to channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("channel '{channel}' failed: {message}")]
pub struct ChannelError {
    pub channel: String,
    pub message: String,
}

impl ChannelError {
    pub fn new(channel: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            channel: channel.into(),
            message: message.to_string(),
        }
    }
}

/// Delivery target
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Writes notifications to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, n: &Notification) -> Result<(), ChannelError> {
        match n.severity {
            Severity::Critical | Severity::High => {
                tracing::warn!(event_type = %n.event_type, severity = %n.severity, details = %n.details, "notification");
            }
            _ => {
                tracing::info!(event_type = %n.event_type, severity = %n.severity, details = %n.details, "notification");
            }
        }
        Ok(())
    }
}

/// Appends notifications to a rolling log in storage
#[derive(Debug)]
pub struct AlertLogChannel {
    storage: SharedStorage,
    max_entries: usize,
    entries: tokio::sync::Mutex<Option<usize>>,
}

impl AlertLogChannel {
    #[must_use]
    pub fn new(storage: SharedStorage, max_entries: usize) -> Self {
        Self {
            storage,
            max_entries: max_entries.max(1),
            entries: tokio::sync::Mutex::new(None),
        }
    }

    /// Entries currently in the log
    ///
    /// # Errors
    /// Storage read failure
    pub async fn read_all(&self) -> Result<Vec<Notification>, ChannelError> {
        let bytes = self
            .storage
            .read(ALERT_LOG_KEY)
            .await
            .map_err(|e| ChannelError::new(self.name(), e))?;
        Ok(bytes
            .map(|b| parse_json_lines(ALERT_LOG_KEY, &b))
            .unwrap_or_default())
    }
}

#[async_trait]
impl NotificationChannel for AlertLogChannel {
    fn name(&self) -> &str {
        "alert_log"
    }

    async fn send(&self, n: &Notification) -> Result<(), ChannelError> {
        let mut entries = self.entries.lock().await;
        let count = match *entries {
            Some(count) => count,
            None => self.read_all().await?.len(),
        };

        append_json(self.storage.as_ref(), ALERT_LOG_KEY, n)
            .await
            .map_err(|e| ChannelError::new(self.name(), e))?;
        let mut count = count + 1;

        if count > self.max_entries {
            let all = self.read_all().await?;
            let keep = &all[all.len().saturating_sub(self.max_entries)..];
            let mut buf = Vec::new();
            for entry in keep {
                let line = serde_json::to_vec(entry).map_err(|e| ChannelError::new(self.name(), e))?;
                buf.extend_from_slice(&line);
                buf.push(b'\n');
            }
            self.storage
                .write_atomic(ALERT_LOG_KEY, &buf)
                .await
                .map_err(|e| ChannelError::new(self.name(), e))?;
            count = keep.len();
        }

        *entries = Some(count);
        Ok(())
    }
}

/// Posts notifications as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, n: &Notification) -> Result<(), ChannelError> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChannelError::new(self.name(), e))?;
        Ok(())
    }
}

/// Severity and channels for one event type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub severity: Severity,
    pub channels: Vec<String>,
}

impl RouteConfig {
    #[must_use]
    pub fn new(severity: Severity, channels: &[&str]) -> Self {
        Self {
            severity,
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

/// `[notifications]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    /// Event type name to route
    pub routes: BTreeMap<String, RouteConfig>,
    pub default_route: RouteConfig,
    pub webhook_url: Option<String>,
    pub alert_log_max_entries: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        let alert = ["log", "alert_log"];
        let page = ["log", "alert_log", "webhook"];
        let routes = [
            ("kill_switch_activated", RouteConfig::new(Severity::Critical, &page)),
            ("rollback_failed", RouteConfig::new(Severity::Critical, &page)),
            ("loop_fatal", RouteConfig::new(Severity::Critical, &alert)),
            ("budget_exceeded", RouteConfig::new(Severity::High, &alert)),
            ("verification_failed", RouteConfig::new(Severity::High, &alert)),
            ("unexpected_change", RouteConfig::new(Severity::High, &alert)),
            ("dlq_item_exhausted", RouteConfig::new(Severity::High, &alert)),
            ("policy_action_failed", RouteConfig::new(Severity::High, &alert)),
            ("metric_rejected", RouteConfig::new(Severity::Medium, &alert)),
            ("dlq_item_added", RouteConfig::new(Severity::Medium, &["log"])),
            ("loop_suspicious", RouteConfig::new(Severity::Medium, &["log"])),
            ("policy_triggered", RouteConfig::new(Severity::Medium, &["log"])),
            ("budget_warning", RouteConfig::new(Severity::Low, &["log"])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            workers: 2,
            queue_capacity: 256,
            send_timeout_ms: 5_000,
            routes,
            default_route: RouteConfig::new(Severity::Info, &["log"]),
            webhook_url: None,
            alert_log_max_entries: 1_000,
        }
    }
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationStats {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Job {
    channel: Arc<dyn NotificationChannel>,
    notification: Arc<Notification>,
}

/// What one `notify` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReceipt {
    pub enqueued: usize,
    pub dropped: usize,
}

/// Bounded fan-out to notification channels
pub struct NotificationBroadcaster {
    config: NotificationConfig,
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl fmt::Debug for NotificationBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.channels.keys().collect();
        names.sort();
        f.debug_struct("NotificationBroadcaster")
            .field("channels", &names)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl NotificationBroadcaster {
    /// Spawn workers and start accepting notifications
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(config: NotificationConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());
        let timeout = Duration::from_millis(config.send_timeout_ms);

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        deliver(worker, job, timeout, &counters).await;
                    }
                })
            })
            .collect();

        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();

        Self {
            config,
            channels,
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            counters,
        }
    }

    /// Broadcaster with the built-in channels its config names
    #[must_use]
    pub fn with_builtin_channels(config: NotificationConfig, storage: SharedStorage) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(LogChannel),
            Arc::new(AlertLogChannel::new(storage, config.alert_log_max_entries)),
        ];
        if let Some(url) = &config.webhook_url {
            channels.push(Arc::new(WebhookChannel::new(url.clone())));
        }
        Self::start(config, channels)
    }

    /// Route for an event type
    #[must_use]
    pub fn route(&self, event_type: &str) -> &RouteConfig {
        self.config
            .routes
            .get(event_type)
            .unwrap_or(&self.config.default_route)
    }

    /// Enqueue `details` for every channel routed for `event_type`
    pub fn notify(&self, event_type: &str, details: serde_json::Value) -> NotifyReceipt {
        let route = self.route(event_type);
        let notification = Arc::new(Notification {
            event_type: event_type.to_string(),
            severity: route.severity,
            details,
            timestamp: Utc::now(),
        });

        let tx = self.tx.lock().clone();
        let mut receipt = NotifyReceipt::default();
        let Some(tx) = tx else {
            tracing::debug!(event_type, "broadcaster stopped, notification discarded");
            return receipt;
        };

        for name in &route.channels {
            let Some(channel) = self.channels.get(name) else {
                tracing::debug!(event_type, channel = %name, "route names unregistered channel");
                continue;
            };
            let job = Job {
                channel: Arc::clone(channel),
                notification: Arc::clone(&notification),
            };
            match tx.try_send(job) {
                Ok(()) => {
                    self.counters.queued.fetch_add(1, Ordering::Relaxed);
                    receipt.enqueued += 1;
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("warden_notifications_dropped_total", "channel" => name.clone())
                        .increment(1);
                    tracing::warn!(event_type, channel = %name, "notification queue full, dropped");
                    receipt.dropped += 1;
                }
            }
        }
        receipt
    }

    #[must_use]
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for queued jobs to finish
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "notification worker ended abnormally");
            }
        }
    }
}

async fn deliver(worker: usize, job: Job, timeout: Duration, counters: &Counters) {
    let channel = job.channel.name().to_string();
    let result = tokio::time::timeout(timeout, job.channel.send(&job.notification)).await;
    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
    };

    match failure {
        None => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("warden_notifications_delivered_total", "channel" => channel).increment(1);
        }
        Some(error) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker,
                channel = %channel,
                event_type = %job.notification.event_type,
                %error,
                "notification delivery failed"
            );
            metrics::counter!("warden_notifications_failed_total", "channel" => channel).increment(1);
        }
    }
}

#[async_trait]
impl EventSubscriber for NotificationBroadcaster {
    fn name(&self) -> &str {
        "notification-broadcaster"
    }

    async fn on_event(&self, event: &GovernanceEvent) -> Result<(), SubscriberError> {
        let details = serde_json::json!({
            "actor": event.actor,
            "event_id": event.id,
            "data": event.data,
        });
        self.notify(event.event_type.as_str(), details);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use warden_core::MemoryStorage;

    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationChannel for Capture {
        fn name(&self) -> &str {
            "log"
        }
        async fn send(&self, n: &Notification) -> Result<(), ChannelError> {
            self.seen.lock().push(n.clone());
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationChannel for Broken {
        fn name(&self) -> &str {
            "alert_log"
        }
        async fn send(&self, _n: &Notification) -> Result<(), ChannelError> {
            Err(ChannelError::new("alert_log", "disk full"))
        }
    }

    struct Stuck;

    #[async_trait]
    impl NotificationChannel for Stuck {
        fn name(&self) -> &str {
            "log"
        }
        async fn send(&self, _n: &Notification) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_by_event_type() {
        let capture = Arc::new(Capture::default());
        let config = NotificationConfig {
            workers: 1,
            ..NotificationConfig::default()
        };
        let b = NotificationBroadcaster::start(config, vec![capture.clone()]);

        let receipt = b.notify("budget_exceeded", serde_json::json!({"run": "r1"}));
        // alert_log is routed but not registered here
        assert_eq!(receipt.enqueued, 1);
        b.notify("something_unrouted", serde_json::json!({}));
        b.shutdown().await;

        let seen = capture.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].severity, Severity::High);
        assert_eq!(seen[1].severity, Severity::Info);
        assert_eq!(b.stats().delivered, 2);
    }

    #[tokio::test]
    async fn channel_failures_are_counted_not_raised() {
        let capture = Arc::new(Capture::default());
        let b = NotificationBroadcaster::start(
            NotificationConfig::default(),
            vec![capture.clone(), Arc::new(Broken)],
        );
        let receipt = b.notify("loop_fatal", serde_json::json!({}));
        assert_eq!(receipt.enqueued, 2);
        b.shutdown().await;

        let stats = b.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let config = NotificationConfig {
            workers: 1,
            queue_capacity: 1,
            send_timeout_ms: 50,
            ..NotificationConfig::default()
        };
        let b = NotificationBroadcaster::start(config, vec![Arc::new(Stuck)]);
        let mut dropped = 0;
        for _ in 0..10 {
            dropped += b.notify("budget_warning", serde_json::json!({})).dropped;
        }
        assert!(dropped >= 8, "dropped {dropped}");
        b.shutdown().await;

        let stats = b.stats();
        assert_eq!(stats.dropped, dropped as u64);
        assert_eq!(stats.failed, stats.queued);
    }

    #[tokio::test]
    async fn alert_log_rolls_over() {
        let storage = Arc::new(MemoryStorage::new());
        let channel = AlertLogChannel::new(storage.clone(), 3);
        for i in 0..5 {
            let n = Notification {
                event_type: format!("e{i}"),
                severity: Severity::High,
                details: serde_json::json!({}),
                timestamp: Utc::now(),
            };
            channel.send(&n).await.unwrap();
        }
        let entries = channel.read_all().await.unwrap();
        let names: Vec<_> = entries.iter().map(|n| n.event_type.as_str()).collect();
        assert_eq!(names, vec!["e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn shutdown_discards_later_notifications() {
        let b = NotificationBroadcaster::start(NotificationConfig::default(), vec![Arc::new(LogChannel)]);
        b.shutdown().await;
        assert_eq!(b.notify("loop_fatal", serde_json::json!({})).enqueued, 0);
    }
}
