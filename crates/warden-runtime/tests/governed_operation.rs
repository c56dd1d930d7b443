mod common;

use common::{config, harness, harness_with};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use warden_core::{ErrorClass, EventType, KillSwitchActor, OperationId, RunId};
use warden_dlq::Failure;
use warden_monitor::NotificationChannel;
use warden_runtime::{GovernanceError, OperationOptions, UnitOutcome, WorkUnit};
use warden_snapshot::{RiskLevel, VerificationStage};
use warden_test_utils::{FailingChannel, SlowProbe, StaticProbe, TestWorkspace};

fn workspace() -> TestWorkspace {
    let ws = TestWorkspace::new();
    ws.write("src/lib.rs", "pub fn answer() -> u32 { 41 }\n");
    ws.write(".env", "API_KEY=original\n");
    ws
}

#[tokio::test]
async fn clean_change_commits_at_low_risk() {
    let h = harness(workspace()).await;

    let handle = h
        .governor
        .begin_operation("fix-answer", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");
    let report = h.governor.commit(handle).await.unwrap();

    assert_eq!(report.diff.modified.len(), 1);
    assert_eq!(report.diff.risk_level, RiskLevel::Low);
    assert!(report.diff.unexpected_changes.is_empty());
    assert_eq!(
        h.events.types(),
        vec![
            EventType::OperationStarted,
            EventType::SnapshotCaptured,
            EventType::SnapshotCaptured,
            EventType::OperationVerified,
            EventType::OperationCommitted,
        ]
    );
    assert_eq!(
        h.ws.read("src/lib.rs").as_deref(),
        Some("pub fn answer() -> u32 { 42 }\n")
    );
}

#[tokio::test]
async fn risky_change_is_rolled_back() {
    let h = harness(workspace()).await;

    let handle = h
        .governor
        .begin_operation("rotate-key", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write(".env", "API_KEY=leaked\n");
    h.ws.write("src/extra.rs", "// stray\n");

    let err = h.governor.commit(handle).await.unwrap_err();
    let GovernanceError::RolledBack { error, report } = &err else {
        panic!("expected rollback, got {err:?}");
    };
    assert_eq!(error.stage, VerificationStage::RiskDomains);
    assert_eq!(error.diff.risk_level, RiskLevel::Critical);
    assert!(report.is_complete());
    assert_eq!(report.removed, vec!["src/extra.rs".to_string()]);
    assert!(report.restored.contains(&".env".to_string()));

    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=original\n"));
    assert!(!h.ws.exists("src/extra.rs"));

    assert_eq!(h.events.count(EventType::UnexpectedChange), 1);
    assert_eq!(h.events.count(EventType::VerificationFailed), 1);
    assert_eq!(h.events.count(EventType::RollbackCompleted), 1);
    assert_eq!(h.events.count(EventType::OperationCommitted), 0);

    h.ctx.shutdown().await;
    assert!(h.log.event_types().contains(&"verification_failed".to_string()));
}

#[tokio::test]
async fn rejected_commit_keeps_changes_until_aborted() {
    let h = harness(workspace()).await;

    let handle = h
        .governor
        .begin_operation("rotate-key", OperationOptions::default().keep_changes_on_failure())
        .await
        .unwrap();
    h.ws.write(".env", "API_KEY=leaked\n");

    let rejected = match h.governor.commit(handle).await {
        Err(GovernanceError::Rejected(rejected)) => rejected,
        other => panic!("expected rejection, got {other:?}"),
    };
    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=leaked\n"));
    assert_eq!(h.events.count(EventType::RollbackCompleted), 0);

    let aborted = h
        .governor
        .abort(rejected.handle, "operator declined")
        .await
        .unwrap();
    assert_eq!(aborted.rollback.restored, vec![".env".to_string()]);
    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=original\n"));
    assert_eq!(h.events.count(EventType::OperationAborted), 1);
}

#[tokio::test]
async fn approved_risky_change_commits() {
    let h = harness(workspace()).await;

    let handle = h
        .governor
        .begin_operation("rotate-key", OperationOptions::default().allow_unexpected_changes())
        .await
        .unwrap();
    h.ws.write(".env", "API_KEY=rotated\n");
    let report = h.governor.commit(handle).await.unwrap();

    assert_eq!(report.diff.risk_level, RiskLevel::Critical);
    assert!(report.diff.requires_approval());
    assert_eq!(h.events.count(EventType::UnexpectedChange), 1);
    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=rotated\n"));
}

#[tokio::test]
async fn kill_switch_refuses_new_operations() {
    let h = harness(workspace()).await;

    h.ctx
        .budget
        .activate_kill_switch("maintenance", KillSwitchActor::Operator)
        .await
        .unwrap();
    let err = h
        .governor
        .begin_operation("anything", OperationOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, GovernanceError::KillSwitchActive { reason } if reason == "maintenance"),
        "got {err:?}"
    );
    assert_eq!(h.events.count(EventType::OperationStarted), 0);

    h.ctx
        .budget
        .deactivate_kill_switch(KillSwitchActor::Operator)
        .await
        .unwrap();
    assert!(h
        .governor
        .begin_operation("anything", OperationOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn failing_type_check_rolls_back() {
    let ws = workspace();
    let cfg = config(&ws);
    let h = harness_with(ws, cfg, |b| {
        b.type_check(StaticProbe::failing("type_check", "error[E0308]: mismatched types"))
    })
    .await;

    let handle = h
        .governor
        .begin_operation("break-types", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { \"no\" }\n");

    let err = h.governor.commit(handle).await.unwrap_err();
    let verification = err.verification().expect("verification error");
    assert_eq!(verification.stage, VerificationStage::TypeCheck);
    assert_eq!(
        h.ws.read("src/lib.rs").as_deref(),
        Some("pub fn answer() -> u32 { 41 }\n")
    );
}

#[tokio::test]
async fn skipped_probes_do_not_run() {
    let ws = workspace();
    let cfg = config(&ws);
    let h = harness_with(ws, cfg, |b| b.lint(StaticProbe::erroring("lint", "linter crashed"))).await;

    let handle = h
        .governor
        .begin_operation("tidy", OperationOptions::default().skip_probes())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 40 + 2 }\n");
    assert!(h.governor.commit(handle).await.is_ok());
}

#[tokio::test]
async fn type_check_timeout_in_a_run_is_queued_for_retry() {
    let ws = workspace();
    let mut cfg = config(&ws);
    cfg.verification.probe_timeout_ms = 20;
    let h = harness_with(ws, cfg, |b| {
        b.type_check(SlowProbe::new("type_check", Duration::from_millis(500)))
    })
    .await;
    let run = RunId::new("run-1");

    let handle = h
        .governor
        .begin_operation("fix-answer", OperationOptions::default().run(run.clone()))
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");

    let err = h.governor.commit(handle).await.unwrap_err();
    let GovernanceError::Deferred { error, report, item } = &err else {
        panic!("expected the commit to be deferred, got {err:?}");
    };
    assert!(error.is_timeout());
    assert_eq!(report.restored, vec!["src/lib.rs".to_string()]);
    assert_eq!(item.error_class, ErrorClass::Transient);
    assert_eq!(item.item_id, "fix-answer");
    assert_eq!(err.error_class(), ErrorClass::Transient);

    let queued = h.ctx.dlq.list(Some(&run)).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(
        h.ws.read("src/lib.rs").as_deref(),
        Some("pub fn answer() -> u32 { 41 }\n")
    );
}

#[tokio::test]
async fn type_check_timeout_outside_a_run_is_only_rolled_back() {
    let ws = workspace();
    let mut cfg = config(&ws);
    cfg.verification.probe_timeout_ms = 20;
    let h = harness_with(ws, cfg, |b| {
        b.type_check(SlowProbe::new("type_check", Duration::from_millis(500)))
    })
    .await;

    let handle = h
        .governor
        .begin_operation("fix-answer", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");

    let err = h.governor.commit(handle).await.unwrap_err();
    assert!(matches!(err, GovernanceError::RolledBack { .. }), "got {err:?}");
    assert!(h.ctx.dlq.list(None).await.is_empty());
}

const ROLLBACK_REFACTORS: &str = r"
version: 1
policies:
  - name: no-refactors
    on: [operation_verified]
    when: { type: field_equals, field: operation, value: refactor }
    actions:
      - { type: rollback_operation, reason: refactors are frozen }
";

#[tokio::test]
async fn policy_rollback_overrides_a_verified_commit() {
    let ws = workspace();
    let doc = ws.path().join("policies.yaml");
    std::fs::write(&doc, ROLLBACK_REFACTORS).unwrap();
    let mut cfg = config(&ws);
    cfg.policy.documents = vec![doc];
    let h = harness_with(ws, cfg, |b| b).await;

    let handle = h
        .governor
        .begin_operation("refactor", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");

    let err = h.governor.commit(handle).await.unwrap_err();
    let GovernanceError::Vetoed(vetoed) = &err else {
        panic!("expected a policy veto, got {err:?}");
    };
    assert_eq!(vetoed.policy, "no-refactors");
    assert_eq!(vetoed.reason, "refactors are frozen");
    assert!(vetoed.rollback.as_ref().is_some_and(|r| r.is_complete()));
    assert!(err.is_rejection());
    assert_eq!(
        h.ws.read("src/lib.rs").as_deref(),
        Some("pub fn answer() -> u32 { 41 }\n")
    );
    assert_eq!(h.events.count(EventType::OperationCommitted), 0);
    assert_eq!(h.events.count(EventType::PolicyTriggered), 1);

    let handle = h
        .governor
        .begin_operation("fix-answer", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");
    assert!(h.governor.commit(handle).await.is_ok());
}

const BLOCK_ENV_EDITS: &str = r"
version: 1
policies:
  - name: env-is-frozen
    on: [unexpected_change]
    when: { type: field_equals, field: path, value: .env }
    actions:
      - { type: block_operation, reason: env edits need review }
";

#[tokio::test]
async fn blocking_policy_keeps_changes_when_asked() {
    let ws = workspace();
    let doc = ws.path().join("policies.yaml");
    std::fs::write(&doc, BLOCK_ENV_EDITS).unwrap();
    let mut cfg = config(&ws);
    cfg.policy.documents = vec![doc];
    let h = harness_with(ws, cfg, |b| b).await;

    let options = OperationOptions::default()
        .allow_unexpected_changes()
        .keep_changes_on_failure();
    let handle = h.governor.begin_operation("rotate-key", options).await.unwrap();
    h.ws.write(".env", "API_KEY=rotated\n");

    let vetoed = match h.governor.commit(handle).await {
        Err(GovernanceError::Vetoed(vetoed)) => vetoed,
        other => panic!("expected a policy veto, got {other:?}"),
    };
    assert!(vetoed.rollback.is_none());
    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=rotated\n"));

    let handle = vetoed.handle.expect("changes kept for the caller");
    h.governor.abort(handle, "env frozen").await.unwrap();
    assert_eq!(h.ws.read(".env").as_deref(), Some("API_KEY=original\n"));

    let err = h
        .governor
        .begin_operation("rotate-key", OperationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::Blocked { .. }), "got {err:?}");
}

#[tokio::test]
async fn failing_channel_never_fails_the_operation() {
    let ws = workspace();
    let cfg = config(&ws);
    let h = harness_with(ws, cfg, |b| {
        b.channels(vec![FailingChannel::new("log") as Arc<dyn NotificationChannel>])
    })
    .await;

    let handle = h
        .governor
        .begin_operation("fix-answer", OperationOptions::default())
        .await
        .unwrap();
    h.ws.write("src/lib.rs", "pub fn answer() -> u32 { 42 }\n");
    assert!(h.governor.commit(handle).await.is_ok());

    let run = RunId::new("run-1");
    h.ctx
        .budget
        .initialize_run(&run, "session-1", None, 1)
        .await
        .unwrap();
    let outcome = h
        .governor
        .execute_unit(&WorkUnit::new(run, "item-1"), || async { Ok::<_, Failure>(()) })
        .await
        .unwrap();
    assert_eq!(outcome, UnitOutcome::Completed(()));

    h.ctx.shutdown().await;
    let stats = h.ctx.notifier.stats();
    assert!(stats.failed > 0);
    assert_eq!(stats.delivered, 0);
}

#[tokio::test]
async fn preflight_flags_risky_paths() {
    let h = harness(workspace()).await;

    let report = h.governor.preflight(&["src/lib.rs", ".env"]);
    assert!(report.requires_approval);
    let risky: Vec<&str> = report.risky().map(|a| a.path.as_str()).collect();
    assert_eq!(risky, vec![".env"]);
    assert!(h.events.events().is_empty());
}

const HALT_ON_LOOP: &str = r"
version: 1
policies:
  - name: halt-on-fatal-loop
    on: [loop_fatal]
    severity: critical
    actions:
      - { type: block_operation }
      - { type: activate_kill_switch }
";

#[tokio::test]
async fn fatal_loop_triggers_policy_and_kill_switch() {
    let ws = workspace();
    let doc = ws.path().join("policies.yaml");
    std::fs::write(&doc, HALT_ON_LOOP).unwrap();
    let mut cfg = config(&ws);
    cfg.policy.documents = vec![doc];
    let h = harness_with(ws, cfg, |b| b).await;

    let id = OperationId::new("x");
    for _ in 0..100 {
        h.governor.checkpoint(&id, Some(100)).await.unwrap();
    }
    let err = h.governor.checkpoint(&id, Some(100)).await.unwrap_err();
    assert!(matches!(err, GovernanceError::InfiniteLoop(_)), "got {err:?}");
    assert!(h.governor.checkpoint(&id, Some(100)).await.is_err());

    assert_eq!(h.events.count(EventType::LoopSuspicious), 1);
    assert_eq!(h.events.count(EventType::LoopFatal), 1);
    assert!(h.ctx.kill_switch.is_triggered().await.unwrap());
    assert_eq!(
        h.ctx.policy.is_blocked("x").unwrap().policy,
        "halt-on-fatal-loop"
    );
    assert!(h.ws.storage_root().join("loops/x.json").exists());

    let err = h
        .governor
        .begin_operation("x", OperationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::KillSwitchActive { .. }));
}

#[tokio::test]
async fn whitelisted_loops_never_escalate() {
    let ws = workspace();
    let mut cfg = config(&ws);
    cfg.loops.whitelist = vec!["poller".to_string()];
    let h = harness_with(ws, cfg, |b| b).await;

    let id = OperationId::new("poller");
    for _ in 0..20 {
        h.governor.checkpoint(&id, Some(10)).await.unwrap();
    }
    assert_eq!(h.events.count(EventType::LoopSuspicious), 0);
    assert_eq!(h.events.count(EventType::LoopFatal), 0);
    assert!(h.governor.finish_loop(&id).is_some());
}
