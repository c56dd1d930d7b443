#![allow(dead_code)]

use std::sync::Arc;
use warden_monitor::NotificationChannel;
use warden_runtime::{GovernanceContext, GovernanceContextBuilder, Governor, WardenConfig};
use warden_test_utils::{manual_clock, ManualClock, RecordingChannel, RecordingSubscriber, TestWorkspace};

pub struct Harness {
    pub ws: TestWorkspace,
    pub ctx: Arc<GovernanceContext>,
    pub governor: Governor,
    pub events: Arc<RecordingSubscriber>,
    pub log: Arc<RecordingChannel>,
    pub clock: Arc<ManualClock>,
}

pub fn config(ws: &TestWorkspace) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.storage_root = ws.storage_root();
    config.snapshot = ws.snapshot_config();
    config.notifications.workers = 1;
    config.dlq.jitter_pct = 0.0;
    config.unit_timeout_ms = 2_000;
    config
}

pub async fn harness(ws: TestWorkspace) -> Harness {
    let config = config(&ws);
    harness_with(ws, config, |b| b).await
}

pub async fn harness_with(
    ws: TestWorkspace,
    config: WardenConfig,
    customize: impl FnOnce(GovernanceContextBuilder) -> GovernanceContextBuilder,
) -> Harness {
    let clock = manual_clock();
    let log = RecordingChannel::new("log");
    let builder = GovernanceContext::builder(config)
        .storage(ws.storage())
        .clock(clock.clone())
        .channels(vec![log.clone() as Arc<dyn NotificationChannel>]);
    let ctx = customize(builder).build().await.unwrap();
    let events = RecordingSubscriber::new();
    ctx.bus.subscribe(events.clone());
    Harness {
        governor: Governor::new(Arc::clone(&ctx)),
        ws,
        ctx,
        events,
        log,
        clock,
    }
}
