//! Warden configuration
//!
//! Loaded from a TOML file (`warden.toml` by default). Every section is
//! optional and falls back to its defaults:
//!
//! ```toml
//! storage_root = ".warden"
//! unit_timeout_ms = 300000
//!
//! [snapshot]
//! root = "."
//!
//! [risk_domains]
//! use_defaults = true
//! extra = [{ path_pattern = "deploy/**", severity = "high", reason = "deploy manifests" }]
//!
//! [budget]
//! default_profile = "standard"
//!
//! [dlq]
//! max_retries = 3
//!
//! [policy]
//! documents = ["policies/governance.yaml"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_budget::BudgetConfig;
use warden_core::{ClassificationTable, ErrorClassifier, TelemetryConfig};
use warden_dlq::DlqConfig;
use warden_monitor::{LoopDetectorConfig, NotificationConfig};
use warden_policy::PolicyConfig;
use warden_snapshot::{RiskDomain, RiskDomainRegistry, SnapshotConfig, SnapshotError, VerificationConfig};

/// Default config file name looked up by the CLI
pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// `[risk_domains]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskDomainsConfig {
    /// Start from the built-in domains
    pub use_defaults: bool,
    /// Registered after the built-ins, in order
    pub extra: Vec<RiskDomain>,
}

impl Default for RiskDomainsConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            extra: Vec::new(),
        }
    }
}

impl RiskDomainsConfig {
    /// # Errors
    /// An extra domain whose pattern does not compile
    pub fn registry(&self) -> Result<RiskDomainRegistry, SnapshotError> {
        let registry = if self.use_defaults {
            RiskDomainRegistry::with_defaults()
        } else {
            RiskDomainRegistry::new()
        };
        for domain in &self.extra {
            registry.add(domain.clone())?;
        }
        Ok(registry)
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Directory holding snapshots, budgets, DLQ logs and the audit chain
    pub storage_root: PathBuf,
    pub snapshot: SnapshotConfig,
    pub risk_domains: RiskDomainsConfig,
    pub verification: VerificationConfig,
    pub budget: BudgetConfig,
    pub dlq: DlqConfig,
    pub loops: LoopDetectorConfig,
    pub notifications: NotificationConfig,
    pub policy: PolicyConfig,
    pub classification: ClassificationTable,
    pub telemetry: TelemetryConfig,
    /// Timeout applied to every governed unit
    pub unit_timeout_ms: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(".warden"),
            snapshot: SnapshotConfig::default(),
            risk_domains: RiskDomainsConfig::default(),
            verification: VerificationConfig::default(),
            budget: BudgetConfig::default(),
            dlq: DlqConfig::default(),
            loops: LoopDetectorConfig::default(),
            notifications: NotificationConfig::default(),
            policy: PolicyConfig::default(),
            classification: ClassificationTable::default(),
            telemetry: TelemetryConfig::default(),
            unit_timeout_ms: 300_000,
        }
    }
}

impl WardenConfig {
    /// Read, parse and validate a config file
    ///
    /// # Errors
    /// Unreadable file, invalid TOML, or inconsistent values
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// # Errors
    /// Invalid TOML or inconsistent values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve relative paths against `base`
    #[must_use]
    pub fn relative_to(mut self, base: &Path) -> Self {
        if self.storage_root.is_relative() {
            self.storage_root = base.join(&self.storage_root);
        }
        if self.snapshot.root.is_relative() {
            self.snapshot.root = base.join(&self.snapshot.root);
        }
        for document in &mut self.policy.documents {
            if document.is_relative() {
                *document = base.join(&*document);
            }
        }
        self
    }

    #[inline]
    #[must_use]
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }

    /// # Errors
    /// [`ConfigError::Invalid`] listing every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if let Err(e) = self.budget.validate() {
            problems.push(format!("budget: {e}"));
        }
        if let Err(e) = self.dlq.validate() {
            problems.push(format!("dlq: {e}"));
        }
        if self.loops.max_iterations == 0 {
            problems.push("loops: max_iterations must be positive".to_string());
        }
        if !self.loops.max_rate_per_second.is_finite() || self.loops.max_rate_per_second <= 0.0 {
            problems.push("loops: max_rate_per_second must be positive".to_string());
        }
        if self.notifications.workers == 0 {
            problems.push("notifications: workers must be positive".to_string());
        }
        if self.notifications.queue_capacity == 0 {
            problems.push("notifications: queue_capacity must be positive".to_string());
        }
        if self.policy.max_concurrent_loads == 0 {
            problems.push("policy: max_concurrent_loads must be positive".to_string());
        }
        if let Err(e) = ErrorClassifier::from_table(&self.classification) {
            problems.push(format!("classification: {e}"));
        }
        if let Err(e) = self.risk_domains.registry() {
            problems.push(format!("risk_domains: {e}"));
        }
        if self.unit_timeout_ms == 0 {
            problems.push("unit_timeout_ms must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let config = WardenConfig::from_toml_str("").unwrap();
        assert_eq!(config.storage_root, PathBuf::from(".warden"));
        assert_eq!(config.dlq, DlqConfig::default());
        assert_eq!(config.policy.max_concurrent_loads, 2);
        assert_eq!(config.unit_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn sections_override_defaults() {
        let config = WardenConfig::from_toml_str(
            r#"
storage_root = "/var/lib/warden"
unit_timeout_ms = 1000

[dlq]
max_retries = 5

[risk_domains]
use_defaults = false
extra = [{ path_pattern = "deploy/**", severity = "high", reason = "deploy manifests", requires_approval = true }]

[telemetry]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.dlq.max_retries, 5);
        assert_eq!(config.dlq.initial_backoff_ms, 1000);
        assert_eq!(config.unit_timeout_ms, 1000);
        let registry = config.risk_domains.registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.match_path("deploy/prod.yaml").is_some());
    }

    #[test]
    fn inconsistent_values_are_all_reported() {
        let err = WardenConfig::from_toml_str(
            r"
[dlq]
backoff_multiplier = 0.5
jitter_pct = 2.0

[notifications]
workers = 0

[policy]
max_concurrent_loads = 0
",
        )
        .unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected Invalid, got {err}");
        };
        assert!(problems.iter().any(|p| p.starts_with("dlq:")));
        assert!(problems.iter().any(|p| p.contains("workers")));
        assert!(problems.iter().any(|p| p.contains("max_concurrent_loads")));
    }

    #[test]
    fn bad_classification_pattern_is_rejected() {
        let err = WardenConfig::from_toml_str(
            r#"
[classification]
default_class = "TRANSIENT"
rules = [{ class = "POLICY", patterns = ["(unclosed"] }]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("classification"));
    }

    #[test]
    fn load_reads_a_file_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "unit_timeout_ms = 2500\n\n[dlq]\nmax_retries = 7\n").unwrap();

        let config = WardenConfig::load(&path).unwrap();
        assert_eq!(config.unit_timeout(), Duration::from_millis(2500));
        assert_eq!(config.dlq.max_retries, 7);

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            WardenConfig::load(&missing),
            Err(ConfigError::Io { path, .. }) if path == missing
        ));
    }

    #[test]
    fn relative_paths_resolve_against_base() {
        let mut config = WardenConfig::default();
        config.policy.documents.push(PathBuf::from("policies/p.yaml"));
        let config = config.relative_to(Path::new("/srv/project"));
        assert_eq!(config.storage_root, PathBuf::from("/srv/project/.warden"));
        assert_eq!(config.policy.documents[0], PathBuf::from("/srv/project/policies/p.yaml"));
    }
}
