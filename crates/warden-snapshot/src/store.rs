//! State snapshot store
//!
//! Captures are written at `snapshots/<id>.json`. Retention never deletes
//! synchronously: expired snapshots first get a marker under
//! `snapshots/marked/`, and a later purge removes marked, unpinned snapshots
//! once the grace period has passed. Pins are persisted under
//! `snapshots/pinned/` so they survive a restart.

use crate::diff::Diff;
use crate::error::SnapshotError;
use crate::glob::GlobSet;
use crate::snapshot::{env_keys, read_git_head, read_manifest, FileRecord, Snapshot};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use warden_core::storage::{read_json, write_json};
use warden_core::{ContentHash, SharedClock, SharedStorage, SnapshotId};

const SNAPSHOT_PREFIX: &str = "snapshots/";
const MARKED_PREFIX: &str = "snapshots/marked/";
const PINNED_PREFIX: &str = "snapshots/pinned/";

/// `[snapshot]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory that is captured and restored
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Candidate manifests, first existing is read
    pub manifest_files: Vec<String>,
    /// Largest UTF-8 file whose content is kept for rollback
    pub capture_content_max_bytes: u64,
    /// Environment variable name prefixes to record
    pub env_prefixes: Vec<String>,
    pub retention_days: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            include: vec!["**/*".to_string()],
            exclude: vec![
                "target/**".to_string(),
                ".git/**".to_string(),
                "node_modules/**".to_string(),
                ".warden/**".to_string(),
            ],
            manifest_files: vec!["Cargo.toml".to_string(), "package.json".to_string()],
            capture_content_max_bytes: 256 * 1024,
            env_prefixes: vec!["WARDEN_".to_string()],
            retention_days: 7,
        }
    }
}

/// Outcome of restoring a tree to a prior snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Paths rewritten from captured content
    pub restored: Vec<String>,
    /// Added paths that were deleted
    pub removed: Vec<String>,
    /// Paths whose prior content was not captured
    pub unrestorable: Vec<String>,
}

impl RollbackReport {
    /// Every change was reversed
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unrestorable.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExpiryMarker {
    id: SnapshotId,
    marked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PinMarker {
    id: SnapshotId,
    pinned_at: DateTime<Utc>,
}

/// Snapshot store over durable storage
#[derive(Debug)]
pub struct SnapshotStore {
    storage: SharedStorage,
    config: SnapshotConfig,
    clock: SharedClock,
    include: GlobSet,
    exclude: GlobSet,
    pins: DashMap<SnapshotId, usize>,
}

impl SnapshotStore {
    /// Create a store
    ///
    /// # Errors
    /// Invalid include or exclude glob
    pub fn new(
        storage: SharedStorage,
        config: SnapshotConfig,
        clock: SharedClock,
    ) -> Result<Self, SnapshotError> {
        let include = GlobSet::new(&config.include)?;
        let exclude = GlobSet::new(&config.exclude)?;
        Ok(Self {
            storage,
            config,
            clock,
            include,
            exclude,
            pins: DashMap::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    fn key(id: &SnapshotId) -> String {
        format!("{SNAPSHOT_PREFIX}{id}.json")
    }

    fn marker_key(id: &SnapshotId) -> String {
        format!("{MARKED_PREFIX}{id}.json")
    }

    fn pin_key(id: &SnapshotId) -> String {
        format!("{PINNED_PREFIX}{id}.json")
    }

    /// Capture the working tree
    ///
    /// # Errors
    /// Walk, read, manifest or storage failure
    pub async fn capture(&self, label: &str) -> Result<Snapshot, SnapshotError> {
        let root = self.config.root.clone();
        let include = self.include.clone();
        let exclude = self.exclude.clone();
        let max_content = self.config.capture_content_max_bytes;
        let manifest_files = self.config.manifest_files.clone();

        let (files, manifest, (revision, branch)) = tokio::task::spawn_blocking(move || {
            let files = scan_tree(&root, &include, &exclude, max_content)?;
            let manifest = read_manifest(&root, &manifest_files)?;
            Ok::<_, SnapshotError>((files, manifest, read_git_head(&root)))
        })
        .await
        .map_err(|e| SnapshotError::Task(e.to_string()))??;

        let snapshot = Snapshot {
            id: SnapshotId::generate(),
            timestamp: self.clock.now(),
            label: label.to_string(),
            revision,
            branch,
            files,
            manifest,
            captured_env_keys: env_keys(&self.config.env_prefixes),
        };

        write_json(self.storage.as_ref(), &Self::key(&snapshot.id), &snapshot).await?;
        tracing::info!(
            snapshot_id = %snapshot.id,
            label,
            files = snapshot.files.len(),
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Load a snapshot
    ///
    /// # Errors
    /// [`SnapshotError::NotFound`] for unknown ids
    pub async fn load(&self, id: &SnapshotId) -> Result<Snapshot, SnapshotError> {
        read_json(self.storage.as_ref(), &Self::key(id))
            .await?
            .ok_or_else(|| SnapshotError::NotFound(id.clone()))
    }

    /// Stored snapshot ids, oldest first
    ///
    /// # Errors
    /// Storage failure
    pub async fn list(&self) -> Result<Vec<SnapshotId>, SnapshotError> {
        let keys = self.storage.list(SNAPSHOT_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(SNAPSHOT_PREFIX))
            .filter(|rest| !rest.contains('/'))
            .filter_map(|rest| rest.strip_suffix(".json"))
            .map(SnapshotId::from)
            .collect())
    }

    /// Protect a snapshot from purge while a rollback may need it
    ///
    /// The first pin writes a marker that outlives the process.
    ///
    /// # Errors
    /// Storage failure writing the marker
    pub async fn pin(&self, id: &SnapshotId) -> Result<(), SnapshotError> {
        let first = {
            let mut count = self.pins.entry(id.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            let marker = PinMarker {
                id: id.clone(),
                pinned_at: self.clock.now(),
            };
            write_json(self.storage.as_ref(), &Self::pin_key(id), &marker).await?;
        }
        Ok(())
    }

    /// Drop one pin; the last one removes the persisted marker
    ///
    /// A marker left by an earlier process is removed as well.
    ///
    /// # Errors
    /// Storage failure removing the marker
    pub async fn unpin(&self, id: &SnapshotId) -> Result<(), SnapshotError> {
        let last = match self.pins.get_mut(id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => true,
        };
        if last {
            self.pins.remove(id);
            self.storage.remove(&Self::pin_key(id)).await?;
        }
        Ok(())
    }

    /// Pinned by this process or by a persisted marker
    ///
    /// # Errors
    /// Storage failure reading the marker
    pub async fn is_pinned(&self, id: &SnapshotId) -> Result<bool, SnapshotError> {
        if self.pins.contains_key(id) {
            return Ok(true);
        }
        Ok(self.storage.read(&Self::pin_key(id)).await?.is_some())
    }

    /// Mark snapshots older than the retention window
    ///
    /// # Errors
    /// Storage failure
    pub async fn mark_expired(&self) -> Result<Vec<SnapshotId>, SnapshotError> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(i64::from(self.config.retention_days));
        let mut marked = Vec::new();

        for id in self.list().await? {
            let marker_key = Self::marker_key(&id);
            if self.storage.read(&marker_key).await?.is_some() {
                continue;
            }
            let snapshot = match self.load(&id).await {
                Ok(s) => s,
                Err(SnapshotError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if snapshot.timestamp >= cutoff {
                continue;
            }
            let marker = ExpiryMarker {
                id: id.clone(),
                marked_at: now,
            };
            write_json(self.storage.as_ref(), &marker_key, &marker).await?;
            tracing::debug!(snapshot_id = %id, "snapshot marked expired");
            marked.push(id);
        }
        Ok(marked)
    }

    /// Delete marked, unpinned snapshots whose marker is older than `grace`
    ///
    /// # Errors
    /// Storage failure
    pub async fn purge_marked(&self, grace: Duration) -> Result<Vec<SnapshotId>, SnapshotError> {
        let now = self.clock.now();
        let mut purged = Vec::new();

        for key in self.storage.list(MARKED_PREFIX).await? {
            let Some(marker) = read_json::<ExpiryMarker>(self.storage.as_ref(), &key).await? else {
                continue;
            };
            if marker.marked_at + grace > now || self.is_pinned(&marker.id).await? {
                continue;
            }
            self.storage.remove(&Self::key(&marker.id)).await?;
            self.storage.remove(&key).await?;
            tracing::info!(snapshot_id = %marker.id, "snapshot purged");
            purged.push(marker.id);
        }
        Ok(purged)
    }

    /// Reverse the changes in `diff` using content captured in `before`
    ///
    /// # Errors
    /// Path outside the root or filesystem failure
    pub async fn restore(&self, before: &Snapshot, diff: &Diff) -> Result<RollbackReport, SnapshotError> {
        self.pin(&before.id).await?;
        let result = self.restore_inner(before, diff).await;
        if let Err(e) = self.unpin(&before.id).await {
            tracing::warn!(snapshot_id = %before.id, error = %e, "pin marker not removed");
        }
        result
    }

    async fn restore_inner(&self, before: &Snapshot, diff: &Diff) -> Result<RollbackReport, SnapshotError> {
        let mut report = RollbackReport::default();

        for path in &diff.added {
            let target = confined(&self.config.root, path)?;
            match tokio::fs::remove_file(&target).await {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.removed.push(path.clone()),
                Err(e) => return Err(SnapshotError::io(target, e)),
            }
        }

        let rewrite = diff
            .modified
            .iter()
            .map(|m| &m.path)
            .chain(diff.deleted.iter());
        for path in rewrite {
            let Some(content) = before.files.get(path).and_then(|r| r.content.as_ref()) else {
                report.unrestorable.push(path.clone());
                continue;
            };
            let target = confined(&self.config.root, path)?;
            write_file_atomic(&target, content.as_bytes()).await?;
            report.restored.push(path.clone());
        }

        tracing::info!(
            snapshot_id = %before.id,
            restored = report.restored.len(),
            removed = report.removed.len(),
            unrestorable = report.unrestorable.len(),
            "rollback applied"
        );
        Ok(report)
    }
}

fn scan_tree(
    root: &Path,
    include: &GlobSet,
    exclude: &GlobSet,
    max_content: u64,
) -> Result<BTreeMap<String, FileRecord>, SnapshotError> {
    let mut candidates = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            // Prune directories whose contents are excluded wholesale
            relative_key(root, entry.path()).map_or(true, |rel| !exclude.is_match(&format!("{rel}/")))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => continue,
            Err(e) => {
                let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                return Err(SnapshotError::io(path, std::io::Error::other(e.to_string())));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_key(root, entry.path()) else {
            continue;
        };
        if include.is_match(&rel) && !exclude.is_match(&rel) {
            candidates.push((rel, entry.into_path()));
        }
    }

    let records: Vec<Option<(String, FileRecord)>> = candidates
        .into_par_iter()
        .map(|(rel, path)| hash_file(&path, max_content).map(|r| r.map(|record| (rel, record))))
        .collect::<Result<_, _>>()?;

    Ok(records.into_iter().flatten().collect())
}

fn hash_file(path: &Path, max_content: u64) -> Result<Option<FileRecord>, SnapshotError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SnapshotError::io(path, e)),
    };
    let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);
    let size = metadata.len();

    let (hash, content) = if size <= max_content {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SnapshotError::io(path, e)),
        };
        let hash = ContentHash::compute(&bytes);
        (hash, String::from_utf8(bytes).ok())
    } else {
        match ContentHash::compute_file(path) {
            Ok(hash) => (hash, None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SnapshotError::io(path, e)),
        }
    };

    Ok(Some(FileRecord {
        hash,
        size,
        mtime,
        content,
    }))
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Resolve a relative snapshot path under `root`, refusing escapes
///
/// # Errors
/// [`SnapshotError::PathEscapesRoot`]
pub fn confined(root: &Path, rel: &str) -> Result<PathBuf, SnapshotError> {
    let rel_path = Path::new(rel);
    let ok = !rel.is_empty()
        && rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(SnapshotError::PathEscapesRoot(rel.to_string()));
    }
    Ok(root.join(rel_path))
}

async fn write_file_atomic(target: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SnapshotError::io(parent, e))?;
    }
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(format!(".warden-tmp-{}", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        return Err(SnapshotError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SnapshotError::io(target, e));
    }
    Ok(())
}
