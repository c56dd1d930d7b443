//! Risk domain registry
//!
//! Ordered glob patterns naming paths that must never change silently.
//! Lookup walks registration order and the first matching domain wins.

use crate::error::SnapshotError;
use crate::glob::compile_glob;
use indexmap::IndexMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use warden_core::Severity;

/// Sensitive path class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskDomain {
    /// Glob over relative paths
    pub path_pattern: String,
    pub severity: Severity,
    pub reason: String,
    /// Changes need explicit approval before commit
    #[serde(default)]
    pub requires_approval: bool,
}

impl RiskDomain {
    #[must_use]
    pub fn new(
        path_pattern: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
        requires_approval: bool,
    ) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            severity,
            reason: reason.into(),
            requires_approval,
        }
    }
}

/// Risk verdict for one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub path: String,
    pub risk: Option<RiskDomain>,
    pub requires_approval: bool,
}

#[derive(Debug)]
struct CompiledDomain {
    domain: RiskDomain,
    regex: Regex,
}

/// Ordered, mutable set of risk domains
#[derive(Debug, Default)]
pub struct RiskDomainRegistry {
    domains: RwLock<IndexMap<String, CompiledDomain>>,
}

impl RiskDomainRegistry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with secrets, env files, CI workflows, lockfiles and migrations
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for domain in default_domains() {
            // Built-in globs contain only escaped literals and wildcards
            if let Err(e) = registry.add(domain) {
                tracing::error!(error = %e, "built-in risk domain rejected");
            }
        }
        registry
    }

    /// Registry from configured domains, in order
    ///
    /// # Errors
    /// First pattern that fails to compile
    pub fn from_domains(domains: impl IntoIterator<Item = RiskDomain>) -> Result<Self, SnapshotError> {
        let registry = Self::new();
        for domain in domains {
            registry.add(domain)?;
        }
        Ok(registry)
    }

    /// Append a domain; returns `false` if the pattern is already registered
    ///
    /// # Errors
    /// [`SnapshotError::InvalidPattern`]
    pub fn add(&self, domain: RiskDomain) -> Result<bool, SnapshotError> {
        let regex = compile_glob(&domain.path_pattern)?;
        let mut domains = self.domains.write();
        if domains.contains_key(&domain.path_pattern) {
            return Ok(false);
        }
        tracing::debug!(pattern = %domain.path_pattern, severity = %domain.severity, "risk domain added");
        domains.insert(domain.path_pattern.clone(), CompiledDomain { domain, regex });
        Ok(true)
    }

    /// Remove a domain by pattern, keeping the order of the rest
    pub fn remove(&self, path_pattern: &str) -> Option<RiskDomain> {
        self.domains
            .write()
            .shift_remove(path_pattern)
            .map(|c| c.domain)
    }

    /// First domain matching `path`
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<RiskDomain> {
        self.domains
            .read()
            .values()
            .find(|c| c.regex.is_match(path))
            .map(|c| c.domain.clone())
    }

    /// Assess each path, preserving input order
    #[must_use]
    pub fn assess_risks<S: AsRef<str>>(&self, paths: &[S]) -> Vec<RiskAssessment> {
        paths
            .iter()
            .map(|p| {
                let path = p.as_ref().to_string();
                let risk = self.match_path(&path);
                let requires_approval = risk.as_ref().is_some_and(|r| r.requires_approval);
                RiskAssessment {
                    path,
                    risk,
                    requires_approval,
                }
            })
            .collect()
    }

    /// Registered domains in evaluation order
    #[must_use]
    pub fn domains(&self) -> Vec<RiskDomain> {
        self.domains
            .read()
            .values()
            .map(|c| c.domain.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

/// Built-in risk domains
#[must_use]
pub fn default_domains() -> Vec<RiskDomain> {
    vec![
        RiskDomain::new("**/*.pem", Severity::Critical, "private key material", true),
        RiskDomain::new("**/*.key", Severity::Critical, "private key material", true),
        RiskDomain::new("**/secrets/**", Severity::Critical, "secrets directory", true),
        RiskDomain::new("**/.env", Severity::Critical, "environment secrets", true),
        RiskDomain::new("**/.env.*", Severity::Critical, "environment secrets", true),
        RiskDomain::new(".github/workflows/**", Severity::High, "CI pipeline definition", true),
        RiskDomain::new("**/migrations/**", Severity::High, "database migration", true),
        RiskDomain::new("**/Cargo.lock", Severity::Medium, "dependency lockfile", false),
        RiskDomain::new("**/package-lock.json", Severity::Medium, "dependency lockfile", false),
        RiskDomain::new("**/yarn.lock", Severity::Medium, "dependency lockfile", false),
    ]
}
