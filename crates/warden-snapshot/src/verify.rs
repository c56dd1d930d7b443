//! Diff/verification engine
//!
//! Three stages run in order: risk-domain check, type-correctness probe, lint
//! probe. Any stage can be skipped; the first failing stage stops
//! verification. Probes are supplied by the host and always run under a
//! timeout.

use crate::diff::{diff, Diff, DiffOptions};
use crate::risk::RiskDomainRegistry;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warden_core::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    RiskDomains,
    TypeCheck,
    Lint,
}

impl fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RiskDomains => "risk_domains",
            Self::TypeCheck => "type_check",
            Self::Lint => "lint",
        })
    }
}

/// Probe result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub passed: bool,
    pub output: String,
}

impl ProbeOutcome {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }

    #[must_use]
    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// Probe could not run at all
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// Externally supplied check over the working tree
#[async_trait]
pub trait VerificationProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, root: &Path) -> Result<ProbeOutcome, ProbeError>;
}

/// Per-call verification switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationContext {
    /// Report unexpected changes in the diff without failing
    pub allow_unexpected_changes: bool,
    pub skip_risk_domains: bool,
    pub skip_type_check: bool,
    pub skip_lint: bool,
    pub probe_timeout: Duration,
}

impl Default for VerificationContext {
    fn default() -> Self {
        Self {
            allow_unexpected_changes: false,
            skip_risk_domains: false,
            skip_type_check: false,
            skip_lint: false,
            probe_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationFailure {
    UnexpectedChanges { paths: Vec<String> },
    ProbeFailed { probe: String, output: String },
    ProbeError { probe: String, message: String },
    Timeout { probe: String, after_ms: u64 },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedChanges { paths } => {
                write!(f, "{} unexpected change(s): {}", paths.len(), paths.join(", "))
            }
            Self::ProbeFailed { probe, .. } => write!(f, "probe '{probe}' reported failure"),
            Self::ProbeError { probe, message } => write!(f, "probe '{probe}' errored: {message}"),
            Self::Timeout { probe, after_ms } => {
                write!(f, "probe '{probe}' timed out after {after_ms}ms")
            }
        }
    }
}

/// Verification failed at `stage`
#[derive(Debug, Clone, thiserror::Error)]
#[error("verification failed at {stage}: {failure}")]
pub struct VerificationError {
    pub stage: VerificationStage,
    pub failure: VerificationFailure,
    pub diff: Box<Diff>,
}

impl VerificationError {
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, VerificationFailure::Timeout { .. })
    }

    /// Timeouts are transient; everything else needs a decision from the caller
    #[must_use]
    pub fn error_class(&self) -> ErrorClass {
        if self.is_timeout() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

/// `[verification]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Program and arguments for the type-check probe
    pub type_check_command: Option<Vec<String>>,
    /// Program and arguments for the lint probe
    pub lint_command: Option<Vec<String>>,
    pub probe_timeout_ms: u64,
    pub medium_threshold: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            type_check_command: None,
            lint_command: None,
            probe_timeout_ms: 120_000,
            medium_threshold: DiffOptions::default().medium_threshold,
        }
    }
}

impl VerificationConfig {
    #[must_use]
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            medium_threshold: self.medium_threshold,
        }
    }

    #[must_use]
    pub fn context(&self) -> VerificationContext {
        VerificationContext {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            ..VerificationContext::default()
        }
    }
}

/// Runs verification stages over a pair of snapshots
pub struct VerificationEngine {
    registry: Arc<RiskDomainRegistry>,
    options: DiffOptions,
    root: PathBuf,
    type_check: Option<Arc<dyn VerificationProbe>>,
    lint: Option<Arc<dyn VerificationProbe>>,
}

impl fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationEngine")
            .field("root", &self.root)
            .field("options", &self.options)
            .field("type_check", &self.type_check.as_ref().map(|p| p.name().to_string()))
            .field("lint", &self.lint.as_ref().map(|p| p.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl VerificationEngine {
    #[must_use]
    pub fn new(registry: Arc<RiskDomainRegistry>, root: impl Into<PathBuf>, options: DiffOptions) -> Self {
        Self {
            registry,
            options,
            root: root.into(),
            type_check: None,
            lint: None,
        }
    }

    /// Build an engine with command probes from config
    #[must_use]
    pub fn from_config(
        registry: Arc<RiskDomainRegistry>,
        root: impl Into<PathBuf>,
        config: &VerificationConfig,
    ) -> Self {
        let root = root.into();
        let mut engine = Self::new(registry, root.clone(), config.diff_options());
        if let Some(probe) = config.type_check_command.as_deref().and_then(|c| CommandProbe::from_argv("type_check", c)) {
            engine = engine.with_type_check(Arc::new(probe));
        }
        if let Some(probe) = config.lint_command.as_deref().and_then(|c| CommandProbe::from_argv("lint", c)) {
            engine = engine.with_lint(Arc::new(probe));
        }
        engine
    }

    #[inline]
    #[must_use]
    pub fn with_type_check(mut self, probe: Arc<dyn VerificationProbe>) -> Self {
        self.type_check = Some(probe);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_lint(mut self, probe: Arc<dyn VerificationProbe>) -> Self {
        self.lint = Some(probe);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RiskDomainRegistry> {
        &self.registry
    }

    /// Diff without running any stage
    #[must_use]
    pub fn diff(&self, before: &Snapshot, after: &Snapshot) -> Diff {
        diff(before, after, &self.registry, &self.options)
    }

    /// Run every enabled stage
    ///
    /// # Errors
    /// [`VerificationError`] from the first failing stage
    pub async fn verify(
        &self,
        before: &Snapshot,
        after: &Snapshot,
        context: &VerificationContext,
    ) -> Result<Diff, VerificationError> {
        let diff = self.diff(before, after);

        if !context.skip_risk_domains
            && !context.allow_unexpected_changes
            && !diff.unexpected_changes.is_empty()
        {
            let paths = diff.unexpected_changes.iter().map(|u| u.path.clone()).collect();
            return Err(VerificationError {
                stage: VerificationStage::RiskDomains,
                failure: VerificationFailure::UnexpectedChanges { paths },
                diff: Box::new(diff),
            });
        }

        let stages = [
            (VerificationStage::TypeCheck, context.skip_type_check, &self.type_check),
            (VerificationStage::Lint, context.skip_lint, &self.lint),
        ];
        for (stage, skip, probe) in stages {
            let Some(probe) = probe.as_ref().filter(|_| !skip) else {
                continue;
            };
            if let Some(failure) = self.run_probe(probe.as_ref(), context.probe_timeout).await {
                tracing::warn!(%stage, %failure, "verification stage failed");
                return Err(VerificationError {
                    stage,
                    failure,
                    diff: Box::new(diff),
                });
            }
        }

        tracing::debug!(risk = %diff.risk_level, changed = diff.changed_count(), "verification passed");
        Ok(diff)
    }

    async fn run_probe(&self, probe: &dyn VerificationProbe, timeout: Duration) -> Option<VerificationFailure> {
        let name = probe.name().to_string();
        match tokio::time::timeout(timeout, probe.run(&self.root)).await {
            Ok(Ok(outcome)) if outcome.passed => None,
            Ok(Ok(outcome)) => Some(VerificationFailure::ProbeFailed {
                probe: name,
                output: outcome.output,
            }),
            Ok(Err(e)) => Some(VerificationFailure::ProbeError {
                probe: name,
                message: e.0,
            }),
            Err(_) => Some(VerificationFailure::Timeout {
                probe: name,
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

const MAX_PROBE_OUTPUT: usize = 8 * 1024;

/// Probe that runs a host command in the snapshot root
#[derive(Debug, Clone)]
pub struct CommandProbe {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// `argv[0]` is the program; `None` for an empty argv
    #[must_use]
    pub fn from_argv(name: &str, argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(name, program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl VerificationProbe for CommandProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, root: &Path) -> Result<ProbeOutcome, ProbeError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError(format!("failed to spawn {}: {e}", self.program)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if text.len() > MAX_PROBE_OUTPUT {
            let mut cut = MAX_PROBE_OUTPUT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        Ok(ProbeOutcome {
            passed: output.status.success(),
            output: text,
        })
    }
}
