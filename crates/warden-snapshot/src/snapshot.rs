//! Snapshot record and the readers that fill it
//!
//! A [`Snapshot`] is written once and never mutated. Besides per-file hashes
//! it records the dependency manifest, the git head and the names of
//! environment variables matching configured prefixes.

use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use warden_core::{ContentHash, SnapshotId};

/// Captured state of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: ContentHash,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
    /// UTF-8 content kept for rollback when the file is small enough
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Dependency manifest summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub deps: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_deps: BTreeMap<String, String>,
}

/// Immutable working-tree snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub files: BTreeMap<String, FileRecord>,
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub captured_env_keys: Vec<String>,
}

impl Snapshot {
    /// Hash over `(path, content hash)` pairs
    ///
    /// Two captures of an unchanged tree have equal fingerprints.
    #[must_use]
    pub fn fingerprint(&self) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        for (path, record) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(record.hash.as_bytes());
        }
        ContentHash::new(*hasher.finalize().as_bytes())
    }

    #[inline]
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

/// Parse the first manifest present in `root`
///
/// # Errors
/// [`SnapshotError::Manifest`] if a present manifest cannot be parsed
pub fn read_manifest(root: &Path, candidates: &[String]) -> Result<Option<Manifest>, SnapshotError> {
    for name in candidates {
        let path = root.join(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SnapshotError::io(path, e)),
        };
        let parsed = if name.ends_with(".json") {
            parse_package_json(&text)
        } else {
            parse_cargo_toml(&text)
        };
        return parsed.map(Some).map_err(|message| SnapshotError::Manifest { path, message });
    }
    Ok(None)
}

fn parse_package_json(text: &str) -> Result<Manifest, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let deps = |key: &str| -> BTreeMap<String, String> {
        value
            .get(key)
            .and_then(serde_json::Value::as_object)
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let req = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                        (k.clone(), req)
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(Manifest {
        name: value.get("name").and_then(|v| v.as_str()).map(str::to_string),
        version: value.get("version").and_then(|v| v.as_str()).map(str::to_string),
        deps: deps("dependencies"),
        dev_deps: deps("devDependencies"),
    })
}

fn parse_cargo_toml(text: &str) -> Result<Manifest, String> {
    let value: toml::Table = text.parse().map_err(|e: toml::de::Error| e.to_string())?;

    let table_deps = |table: Option<&toml::Value>| -> BTreeMap<String, String> {
        table
            .and_then(toml::Value::as_table)
            .map(|t| {
                t.iter()
                    .map(|(name, req)| (name.clone(), cargo_dep_requirement(req)))
                    .collect()
            })
            .unwrap_or_default()
    };

    let package = value.get("package").and_then(toml::Value::as_table);
    let field = |key: &str| {
        package
            .and_then(|p| p.get(key))
            .and_then(toml::Value::as_str)
            .map(str::to_string)
    };

    let mut deps = table_deps(
        value
            .get("workspace")
            .and_then(|w| w.get("dependencies")),
    );
    deps.extend(table_deps(value.get("dependencies")));

    Ok(Manifest {
        name: field("name"),
        version: field("version"),
        deps,
        dev_deps: table_deps(value.get("dev-dependencies")),
    })
}

fn cargo_dep_requirement(req: &toml::Value) -> String {
    if let Some(version) = req.as_str() {
        return version.to_string();
    }
    let Some(table) = req.as_table() else {
        return req.to_string();
    };
    let get = |k: &str| table.get(k).and_then(toml::Value::as_str);
    if let Some(version) = get("version") {
        version.to_string()
    } else if let Some(path) = get("path") {
        format!("path:{path}")
    } else if let Some(git) = get("git") {
        format!("git:{git}")
    } else if table.get("workspace").and_then(toml::Value::as_bool) == Some(true) {
        "workspace".to_string()
    } else {
        req.to_string()
    }
}

/// Read `(revision, branch)` from `.git` without spawning git
#[must_use]
pub fn read_git_head(root: &Path) -> (Option<String>, Option<String>) {
    let Some(git_dir) = resolve_git_dir(root) else {
        return (None, None);
    };
    let Ok(head) = std::fs::read_to_string(git_dir.join("HEAD")) else {
        return (None, None);
    };
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref: ") else {
        // Detached head
        return (Some(head.to_string()), None);
    };
    let branch = reference
        .strip_prefix("refs/heads/")
        .unwrap_or(reference)
        .to_string();

    let loose = std::fs::read_to_string(git_dir.join(reference))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let revision = loose.or_else(|| {
        let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
        packed.lines().find_map(|line| {
            let (sha, name) = line.split_once(' ')?;
            (name.trim() == reference).then(|| sha.to_string())
        })
    });

    (revision, Some(branch))
}

fn resolve_git_dir(root: &Path) -> Option<std::path::PathBuf> {
    let dot_git = root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    // Worktrees and submodules use a `gitdir:` pointer file
    let pointer = std::fs::read_to_string(&dot_git).ok()?;
    let target = pointer.trim().strip_prefix("gitdir: ")?;
    let target = Path::new(target);
    Some(if target.is_absolute() {
        target.to_path_buf()
    } else {
        root.join(target)
    })
}

/// Sorted names of environment variables starting with any prefix
#[must_use]
pub fn env_keys(prefixes: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = std::env::vars_os()
        .filter_map(|(k, _)| k.into_string().ok())
        .filter(|k| prefixes.iter().any(|p| k.starts_with(p.as_str())))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}
