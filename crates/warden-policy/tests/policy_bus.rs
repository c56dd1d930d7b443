use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use warden_core::{
    EventBus, EventSubscriber, EventType, FsStorage, GovernanceEvent, KillSwitch, SharedClock,
    SharedStorage, SubscriberError, SystemClock,
};
use warden_policy::{
    AuditLog, MetricValidator, PolicyConfig, PolicyLoader, PolicyRuntime, POLICY_RUNTIME_ACTOR,
};

#[derive(Default)]
struct Seen(Mutex<Vec<(EventType, String)>>);

#[async_trait]
impl EventSubscriber for Seen {
    fn name(&self) -> &str {
        "seen"
    }

    async fn on_event(&self, event: &GovernanceEvent) -> Result<(), SubscriberError> {
        self.0.lock().push((event.event_type, event.actor.clone()));
        Ok(())
    }
}

const POLICIES: &str = r"
version: 1
policies:
  - name: halt-on-fatal-loop
    on: [loop_fatal]
    severity: critical
    actions:
      - { type: block_operation }
      - { type: activate_kill_switch }
      - { type: notify, message: runaway loop halted }
";

#[tokio::test]
async fn runtime_reacts_to_bus_events_from_loaded_document() {
    let dir = tempfile::tempdir().unwrap();
    let doc_path = dir.path().join("policies.yaml");
    std::fs::write(&doc_path, POLICIES).unwrap();

    let storage: SharedStorage = Arc::new(FsStorage::new(dir.path().join("state")));
    let clock: SharedClock = Arc::new(SystemClock);
    let audit = Arc::new(AuditLog::new(storage.clone(), clock.clone()));
    let kill_switch = Arc::new(KillSwitch::new(storage, clock.clone()));
    let bus = Arc::new(EventBus::new());
    let runtime = Arc::new(PolicyRuntime::new(
        Arc::new(MetricValidator::new(audit.clone())),
        kill_switch.clone(),
        &bus,
        clock,
    ));

    let loader = PolicyLoader::new(&PolicyConfig::default());
    let document = loader.load_path(&doc_path).await.unwrap();
    runtime.install(&document);

    let seen = Arc::new(Seen::default());
    bus.subscribe(runtime.clone());
    bus.subscribe(seen.clone());

    let report = bus
        .emit(
            EventType::LoopFatal,
            "loop-detector",
            json!({"operation": "refactor-all", "iterations": 1001}),
        )
        .await;
    assert!(report.is_clean());

    assert!(kill_switch.is_triggered().await.unwrap());
    assert_eq!(
        runtime.is_blocked("refactor-all").unwrap().policy,
        "halt-on-fatal-loop"
    );

    let seen = seen.0.lock().clone();
    assert!(seen.contains(&(EventType::PolicyTriggered, POLICY_RUNTIME_ACTOR.to_string())));
    assert!(seen.contains(&(EventType::KillSwitchActivated, POLICY_RUNTIME_ACTOR.to_string())));
    assert!(seen.contains(&(EventType::LoopFatal, "loop-detector".to_string())));

    assert_eq!(audit.verify_integrity().await.unwrap(), 1);
}
