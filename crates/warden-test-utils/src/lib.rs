//! Testing utilities for the Warden workspace
//!
//! Shared fixtures: a temporary workspace, recording channels and
//! subscribers, canned verification probes.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden_core::{EventSubscriber, EventType, FsStorage, GovernanceEvent, SubscriberError};
use warden_monitor::{ChannelError, Notification, NotificationChannel};
use warden_snapshot::{ProbeError, ProbeOutcome, SnapshotConfig, VerificationProbe};

pub use warden_core::{ManualClock, MemoryStorage};

/// Temporary directory with a working tree under `tree/` and durable state
/// under `state/`
#[derive(Debug)]
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("tree")).expect("create tree dir");
        std::fs::create_dir_all(dir.path().join("state")).expect("create state dir");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("tree")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn storage(&self) -> Arc<FsStorage> {
        Arc::new(FsStorage::new(self.storage_root()))
    }

    /// Write a file under the tree, creating parent directories
    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.root().join(rel)).expect("remove file");
    }

    /// Snapshot config rooted at the tree, with no manifests or env capture
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            root: self.root(),
            env_prefixes: Vec::new(),
            ..SnapshotConfig::default()
        }
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification channel that keeps everything it receives
#[derive(Debug)]
pub struct RecordingChannel {
    name: String,
    received: Mutex<Vec<Notification>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.received.lock().iter().map(|n| n.event_type.clone()).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.received.lock().push(notification.clone());
        Ok(())
    }
}

/// Channel whose every delivery fails
#[derive(Debug)]
pub struct FailingChannel {
    name: String,
}

impl FailingChannel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string() })
    }
}

#[async_trait]
impl NotificationChannel for FailingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _notification: &Notification) -> Result<(), ChannelError> {
        Err(ChannelError::new(&self.name, "delivery refused"))
    }
}

/// Event subscriber that records every event it sees
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<GovernanceEvent>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GovernanceEvent> {
        self.events.lock().clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events.lock().iter().filter(|e| e.event_type == event_type).count()
    }

    pub fn last(&self, event_type: EventType) -> Option<GovernanceEvent> {
        self.events
            .lock()
            .iter()
            .rev()
            .find(|e| e.event_type == event_type)
            .cloned()
    }
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recording-subscriber"
    }

    async fn on_event(&self, event: &GovernanceEvent) -> Result<(), SubscriberError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Probe with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticProbe {
    name: String,
    result: Result<ProbeOutcome, String>,
}

impl StaticProbe {
    pub fn passing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            result: Ok(ProbeOutcome::pass()),
        })
    }

    pub fn failing(name: &str, output: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            result: Ok(ProbeOutcome::fail(output)),
        })
    }

    pub fn erroring(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            result: Err(message.to_string()),
        })
    }
}

#[async_trait]
impl VerificationProbe for StaticProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _root: &Path) -> Result<ProbeOutcome, ProbeError> {
        self.result.clone().map_err(ProbeError)
    }
}

/// Probe that passes after sleeping
#[derive(Debug, Clone)]
pub struct SlowProbe {
    name: String,
    delay: Duration,
}

impl SlowProbe {
    pub fn new(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl VerificationProbe for SlowProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _root: &Path) -> Result<ProbeOutcome, ProbeError> {
        tokio::time::sleep(self.delay).await;
        Ok(ProbeOutcome::pass())
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_now())
}
