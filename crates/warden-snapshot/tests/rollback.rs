use std::sync::Arc;
use warden_core::{FsStorage, SystemClock};
use warden_snapshot::{
    RiskDomainRegistry, RiskLevel, SnapshotConfig, SnapshotStore, VerificationContext,
    VerificationEngine, VerificationStage,
};

fn setup() -> (tempfile::TempDir, SnapshotStore, VerificationEngine) {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir_all(work.join("src")).unwrap();
    std::fs::write(work.join("src/main.rs"), "fn main() {}\n").unwrap();
    std::fs::write(work.join(".env"), "TOKEN=old\n").unwrap();
    std::fs::write(
        work.join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = \"1\"\n",
    )
    .unwrap();

    let storage = Arc::new(FsStorage::new(dir.path().join("state")));
    let config = SnapshotConfig {
        root: work.clone(),
        ..SnapshotConfig::default()
    };
    let store = SnapshotStore::new(storage, config, Arc::new(SystemClock)).unwrap();
    let engine = VerificationEngine::new(
        Arc::new(RiskDomainRegistry::with_defaults()),
        work,
        Default::default(),
    );
    (dir, store, engine)
}

#[tokio::test]
async fn secret_change_is_caught_and_rolled_back() {
    let (dir, store, engine) = setup();
    let work = dir.path().join("work");
    let before = store.capture("before").await.unwrap();

    std::fs::write(work.join(".env"), "TOKEN=leaked\n").unwrap();
    std::fs::write(work.join("src/extra.rs"), "pub fn x() {}\n").unwrap();
    let after = store.capture("after").await.unwrap();

    let err = engine
        .verify(&before, &after, &VerificationContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.stage, VerificationStage::RiskDomains);
    assert_eq!(err.diff.risk_level, RiskLevel::Critical);

    let report = store.restore(&before, &err.diff).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(
        std::fs::read_to_string(work.join(".env")).unwrap(),
        "TOKEN=old\n"
    );
    assert!(!work.join("src/extra.rs").exists());

    let again = store.capture("restored").await.unwrap();
    assert_eq!(again.fingerprint(), before.fingerprint());
}

#[tokio::test]
async fn dependency_bump_is_high_risk() {
    let (dir, store, engine) = setup();
    let work = dir.path().join("work");
    let before = store.capture("before").await.unwrap();
    assert_eq!(before.manifest.as_ref().unwrap().deps["serde"], "1");

    std::fs::write(
        work.join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n\n[dependencies]\nserde = \"2\"\n",
    )
    .unwrap();
    let after = store.capture("after").await.unwrap();

    let diff = engine
        .verify(&before, &after, &VerificationContext::default())
        .await
        .unwrap();
    assert_eq!(diff.risk_level, RiskLevel::High);
    assert_eq!(diff.dependency_changes.len(), 1);
}
