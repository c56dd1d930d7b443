//! Snapshot comparison
//!
//! A [`Diff`] is derived data: it is computed from two snapshots and a risk
//! registry and never stored on its own.

use crate::risk::RiskDomainRegistry;
use crate::snapshot::{Manifest, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use warden_core::{ContentHash, Severity, SnapshotId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedFile {
    pub path: String,
    pub before_hash: ContentHash,
    pub after_hash: ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyChangeKind {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyChange {
    pub name: String,
    pub kind: DependencyChangeKind,
    /// Dev-only dependency
    pub dev: bool,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Changed path that falls inside a risk domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnexpectedChange {
    pub path: String,
    pub reason: String,
    pub severity: Severity,
    pub requires_approval: bool,
}

/// Overall risk of a diff
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub before: SnapshotId,
    pub after: SnapshotId,
    pub added: Vec<String>,
    pub modified: Vec<ModifiedFile>,
    pub deleted: Vec<String>,
    pub dependency_changes: Vec<DependencyChange>,
    pub unexpected_changes: Vec<UnexpectedChange>,
    pub risk_level: RiskLevel,
}

impl Diff {
    /// Number of added, modified and deleted paths
    #[inline]
    #[must_use]
    pub fn changed_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_count() == 0 && self.dependency_changes.is_empty()
    }

    /// Every changed path, sorted
    #[must_use]
    pub fn changed_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .added
            .iter()
            .map(String::as_str)
            .chain(self.modified.iter().map(|m| m.path.as_str()))
            .chain(self.deleted.iter().map(String::as_str))
            .collect();
        paths.sort_unstable();
        paths
    }

    #[must_use]
    pub fn requires_approval(&self) -> bool {
        self.unexpected_changes.iter().any(|u| u.requires_approval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Changed-file count above which a diff is at least medium risk
    pub medium_threshold: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            medium_threshold: 10,
        }
    }
}

/// Compare two snapshots
#[must_use]
pub fn diff(
    before: &Snapshot,
    after: &Snapshot,
    registry: &RiskDomainRegistry,
    options: &DiffOptions,
) -> Diff {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();

    for (path, record) in &after.files {
        match before.files.get(path) {
            None => added.push(path.clone()),
            Some(old) if old.hash != record.hash => modified.push(ModifiedFile {
                path: path.clone(),
                before_hash: old.hash,
                after_hash: record.hash,
            }),
            Some(_) => {}
        }
    }
    for path in before.files.keys() {
        if !after.files.contains_key(path) {
            deleted.push(path.clone());
        }
    }

    let dependency_changes = dependency_changes(before.manifest.as_ref(), after.manifest.as_ref());

    let mut unexpected_changes: Vec<UnexpectedChange> = added
        .iter()
        .chain(modified.iter().map(|m| &m.path))
        .chain(deleted.iter())
        .filter_map(|path| {
            registry.match_path(path).map(|domain| UnexpectedChange {
                path: path.clone(),
                reason: domain.reason,
                severity: domain.severity,
                requires_approval: domain.requires_approval,
            })
        })
        .collect();
    unexpected_changes.sort_by(|a, b| a.path.cmp(&b.path));

    let changed = added.len() + modified.len() + deleted.len();
    let risk_level = if !unexpected_changes.is_empty() {
        RiskLevel::Critical
    } else if !dependency_changes.is_empty() {
        RiskLevel::High
    } else if changed > options.medium_threshold {
        RiskLevel::Medium
    } else if changed > 0 {
        RiskLevel::Low
    } else {
        RiskLevel::None
    };

    Diff {
        before: before.id.clone(),
        after: after.id.clone(),
        added,
        modified,
        deleted,
        dependency_changes,
        unexpected_changes,
        risk_level,
    }
}

fn dependency_changes(before: Option<&Manifest>, after: Option<&Manifest>) -> Vec<DependencyChange> {
    let empty = Manifest::default();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    let mut changes = compare_deps(&before.deps, &after.deps, false);
    changes.extend(compare_deps(&before.dev_deps, &after.dev_deps, true));
    changes
}

fn compare_deps(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
    dev: bool,
) -> Vec<DependencyChange> {
    let mut changes = Vec::new();
    for (name, req) in after {
        let kind = match before.get(name) {
            None => DependencyChangeKind::Added,
            Some(old) if old != req => DependencyChangeKind::Changed,
            Some(_) => continue,
        };
        changes.push(DependencyChange {
            name: name.clone(),
            kind,
            dev,
            before: before.get(name).cloned(),
            after: Some(req.clone()),
        });
    }
    for (name, req) in before {
        if !after.contains_key(name) {
            changes.push(DependencyChange {
                name: name.clone(),
                kind: DependencyChangeKind::Removed,
                dev,
                before: Some(req.clone()),
                after: None,
            });
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskDomain;
    use crate::snapshot::FileRecord;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn snap(files: &[(&str, &str)]) -> Snapshot {
        Snapshot {
            id: SnapshotId::generate(),
            timestamp: Utc::now(),
            label: "t".into(),
            revision: None,
            branch: None,
            files: files
                .iter()
                .map(|(p, c)| {
                    (
                        (*p).to_string(),
                        FileRecord {
                            hash: ContentHash::compute(c.as_bytes()),
                            size: c.len() as u64,
                            mtime: None,
                            content: Some((*c).to_string()),
                        },
                    )
                })
                .collect(),
            manifest: None,
            captured_env_keys: Vec::new(),
        }
    }

    #[test]
    fn classifies_added_modified_deleted() {
        let before = snap(&[("a.rs", "1"), ("b.rs", "2"), ("c.rs", "3")]);
        let after = snap(&[("a.rs", "1"), ("b.rs", "22"), ("d.rs", "4")]);
        let d = diff(&before, &after, &RiskDomainRegistry::new(), &DiffOptions::default());

        assert_eq!(d.added, vec!["d.rs"]);
        assert_eq!(d.deleted, vec!["c.rs"]);
        assert_eq!(d.modified.len(), 1);
        assert_eq!(d.modified[0].path, "b.rs");
        assert_eq!(d.risk_level, RiskLevel::Low);
    }

    #[test]
    fn identical_snapshots_have_no_risk() {
        let before = snap(&[("a.rs", "1")]);
        let after = snap(&[("a.rs", "1")]);
        let d = diff(&before, &after, &RiskDomainRegistry::new(), &DiffOptions::default());
        assert!(d.is_empty());
        assert_eq!(d.risk_level, RiskLevel::None);
    }

    #[test]
    fn risk_domain_change_is_critical() {
        let registry = RiskDomainRegistry::new();
        registry
            .add(RiskDomain::new("**/.env", Severity::Critical, "secrets", true))
            .unwrap();
        let before = snap(&[(".env", "A=1")]);
        let after = snap(&[(".env", "A=2")]);
        let d = diff(&before, &after, &registry, &DiffOptions::default());

        assert_eq!(d.risk_level, RiskLevel::Critical);
        assert_eq!(d.unexpected_changes.len(), 1);
        assert!(d.requires_approval());
    }

    #[test]
    fn dependency_change_is_high_and_many_files_medium() {
        let mut before = snap(&[]);
        let mut after = snap(&[]);
        before.manifest = Some(Manifest {
            deps: [("serde".to_string(), "1".to_string())].into(),
            ..Manifest::default()
        });
        after.manifest = Some(Manifest {
            deps: [("serde".to_string(), "2".to_string())].into(),
            ..Manifest::default()
        });
        let d = diff(&before, &after, &RiskDomainRegistry::new(), &DiffOptions::default());
        assert_eq!(d.risk_level, RiskLevel::High);
        assert_eq!(d.dependency_changes[0].kind, DependencyChangeKind::Changed);

        let files: Vec<(String, String)> = (0..11).map(|i| (format!("f{i}"), "x".into())).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let d = diff(&snap(&[]), &snap(&refs), &RiskDomainRegistry::new(), &DiffOptions::default());
        assert_eq!(d.risk_level, RiskLevel::Medium);
    }

    proptest! {
        #[test]
        fn every_changed_path_reported_once(
            before in prop::collection::btree_map("[a-d]{1,2}", "[xy]{1,2}", 0..8),
            after in prop::collection::btree_map("[a-d]{1,2}", "[xy]{1,2}", 0..8),
        ) {
            let b: Vec<(&str, &str)> = before.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let a: Vec<(&str, &str)> = after.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let d = diff(&snap(&b), &snap(&a), &RiskDomainRegistry::new(), &DiffOptions::default());

            let expected: BTreeSet<&str> = before
                .keys()
                .chain(after.keys())
                .filter(|k| before.get(*k) != after.get(*k))
                .map(String::as_str)
                .collect();
            let reported = d.changed_paths();
            let unique: BTreeSet<&str> = reported.iter().copied().collect();

            prop_assert_eq!(reported.len(), unique.len());
            prop_assert_eq!(unique, expected);
        }
    }
}
