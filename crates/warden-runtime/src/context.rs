//! Governance context: every component, wired once
//!
//! The context owns one instance of each component and is shared by
//! reference ([`Arc`]) with every caller. It replaces process-wide
//! singletons: two contexts over different storage roots never interact.

use crate::config::WardenConfig;
use crate::error::GovernanceError;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use warden_budget::BudgetGuardian;
use warden_core::{
    ErrorClassifier, EventBus, EventSubscriber, FsStorage, KillSwitch, SharedClock, SharedStorage, SystemClock,
};
use warden_dlq::DeadLetterQueue;
use warden_monitor::{LoopDetector, NotificationBroadcaster, NotificationChannel};
use warden_policy::{
    ActionKind, AuditLog, DomainController, MetricValidator, PolicyLoader, PolicyRuntime,
};
use warden_snapshot::{RiskDomainRegistry, SnapshotStore, VerificationEngine, VerificationProbe};

pub struct GovernanceContext {
    pub config: WardenConfig,
    pub storage: SharedStorage,
    pub clock: SharedClock,
    pub bus: Arc<EventBus>,
    pub kill_switch: Arc<KillSwitch>,
    pub snapshots: SnapshotStore,
    pub risk_domains: Arc<RiskDomainRegistry>,
    pub verifier: VerificationEngine,
    pub budget: BudgetGuardian,
    pub dlq: DeadLetterQueue,
    pub loops: LoopDetector,
    pub notifier: Arc<NotificationBroadcaster>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<MetricValidator>,
    pub policy: Arc<PolicyRuntime>,
    pub policy_loader: PolicyLoader,
}

impl fmt::Debug for GovernanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceContext")
            .field("storage", &self.storage)
            .field("bus", &self.bus)
            .field("policy", &self.policy)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl GovernanceContext {
    #[inline]
    #[must_use]
    pub fn builder(config: WardenConfig) -> GovernanceContextBuilder {
        GovernanceContextBuilder::new(config)
    }

    /// Context with file storage under `config.storage_root`
    ///
    /// # Errors
    /// See [`GovernanceContextBuilder::build`]
    pub async fn from_config(config: WardenConfig) -> Result<Arc<Self>, GovernanceError> {
        Self::builder(config).build().await
    }

    /// Drain queued notifications
    pub async fn shutdown(&self) {
        self.notifier.shutdown().await;
    }
}

/// Builder for [`GovernanceContext`]
///
/// Storage, clock, notification channels and verification probes default to
/// what the config describes; tests and embedding hosts override them.
pub struct GovernanceContextBuilder {
    config: WardenConfig,
    storage: Option<SharedStorage>,
    clock: Option<SharedClock>,
    channels: Option<Vec<Arc<dyn NotificationChannel>>>,
    type_check: Option<Arc<dyn VerificationProbe>>,
    lint: Option<Arc<dyn VerificationProbe>>,
    controllers: Vec<(ActionKind, Arc<dyn DomainController>)>,
}

impl GovernanceContextBuilder {
    #[must_use]
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            storage: None,
            clock: None,
            channels: None,
            type_check: None,
            lint: None,
            controllers: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    #[inline]
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the built-in log, alert-log and webhook channels
    #[inline]
    #[must_use]
    pub fn channels(mut self, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        self.channels = Some(channels);
        self
    }

    #[inline]
    #[must_use]
    pub fn type_check(mut self, probe: Arc<dyn VerificationProbe>) -> Self {
        self.type_check = Some(probe);
        self
    }

    #[inline]
    #[must_use]
    pub fn lint(mut self, probe: Arc<dyn VerificationProbe>) -> Self {
        self.lint = Some(probe);
        self
    }

    #[inline]
    #[must_use]
    pub fn controller(mut self, kind: ActionKind, controller: Arc<dyn DomainController>) -> Self {
        self.controllers.push((kind, controller));
        self
    }

    /// Validate the config, open every component and install policies
    ///
    /// Must be called inside a tokio runtime: notification workers are
    /// spawned here.
    ///
    /// # Errors
    /// Invalid config, unreadable DLQ logs, or a policy document that fails
    /// to load
    pub async fn build(self) -> Result<Arc<GovernanceContext>, GovernanceError> {
        let Self {
            config,
            storage,
            clock,
            channels,
            type_check,
            lint,
            controllers,
        } = self;
        config.validate()?;

        let storage: SharedStorage =
            storage.unwrap_or_else(|| Arc::new(FsStorage::new(config.storage_root.clone())));
        let clock: SharedClock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bus = Arc::new(EventBus::new());
        let kill_switch = Arc::new(KillSwitch::new(Arc::clone(&storage), Arc::clone(&clock)));

        let snapshots = SnapshotStore::new(Arc::clone(&storage), config.snapshot.clone(), Arc::clone(&clock))?;
        let risk_domains = Arc::new(config.risk_domains.registry()?);
        let mut verifier = VerificationEngine::from_config(
            Arc::clone(&risk_domains),
            config.snapshot.root.clone(),
            &config.verification,
        );
        if let Some(probe) = type_check {
            verifier = verifier.with_type_check(probe);
        }
        if let Some(probe) = lint {
            verifier = verifier.with_lint(probe);
        }

        let budget = BudgetGuardian::new(
            config.budget.clone(),
            Arc::clone(&storage),
            Arc::clone(&kill_switch),
            Arc::clone(&bus),
            Arc::clone(&clock),
        );
        let dlq = DeadLetterQueue::open(
            Arc::clone(&storage),
            config.dlq.clone(),
            ErrorClassifier::from_table(&config.classification)?,
            Arc::clone(&bus),
            Arc::clone(&clock),
        )
        .await?;
        let loops = LoopDetector::new(config.loops.clone(), Arc::clone(&clock));

        let notifier = Arc::new(match channels {
            Some(channels) => NotificationBroadcaster::start(config.notifications.clone(), channels),
            None => NotificationBroadcaster::with_builtin_channels(
                config.notifications.clone(),
                Arc::clone(&storage),
            ),
        });

        let audit = Arc::new(AuditLog::new(Arc::clone(&storage), Arc::clone(&clock)));
        let metrics = Arc::new(MetricValidator::new(Arc::clone(&audit)));
        let policy = Arc::new(PolicyRuntime::new(
            Arc::clone(&metrics),
            Arc::clone(&kill_switch),
            &bus,
            Arc::clone(&clock),
        ));
        for (kind, controller) in controllers {
            policy.register_controller(kind, controller);
        }

        let policy_loader = PolicyLoader::new(&config.policy);
        let documents = policy_loader.load_all(&config.policy.documents).await?;
        for document in &documents {
            policy.install(document);
        }

        bus.subscribe(Arc::clone(&policy) as Arc<dyn EventSubscriber>);
        bus.subscribe(Arc::clone(&notifier) as Arc<dyn EventSubscriber>);

        info!(
            storage = ?storage,
            documents = documents.len(),
            policies = policy.policies().len(),
            risk_domains = risk_domains.len(),
            "governance context ready"
        );

        Ok(Arc::new(GovernanceContext {
            config,
            storage,
            clock,
            bus,
            kill_switch,
            snapshots,
            risk_domains,
            verifier,
            budget,
            dlq,
            loops,
            notifier,
            audit,
            metrics,
            policy,
            policy_loader,
        }))
    }
}
