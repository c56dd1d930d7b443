//! Durable key/value storage
//!
//! Keys are relative, `/`-separated paths (`budget/run-1.json`). Writes
//! replace a record atomically; appends add one newline-terminated line to a
//! log. [`FsStorage`] maps keys to files under a root directory;
//! [`MemoryStorage`] keeps everything in a `DashMap` for tests.

use crate::error::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Shared storage handle
pub type SharedStorage = Arc<dyn Storage>;

/// Durable storage interface
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Read a record, `None` if absent
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a record so readers never observe a partial write
    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Append one line to a log record, creating it if needed
    async fn append(&self, key: &str, line: &[u8]) -> Result<(), StorageError>;

    /// Remove a record, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Sorted keys beginning with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Read and decode a JSON record
///
/// # Errors
/// Storage failure or undecodable JSON
pub async fn read_json<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.read(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::serialization(key, e)),
        None => Ok(None),
    }
}

/// Encode and atomically write a JSON record
///
/// # Errors
/// Storage failure or unencodable value
pub async fn write_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StorageError::serialization(key, e))?;
    storage.write_atomic(key, &bytes).await
}

/// Encode a value as one JSON line and append it
///
/// # Errors
/// Storage failure or unencodable value
pub async fn append_json<T: Serialize + ?Sized>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::serialization(key, e))?;
    storage.append(key, &bytes).await
}

/// Decode a JSON-lines log, skipping a torn or corrupt line with a warning
#[must_use]
pub fn parse_json_lines<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Vec<T> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => out.push(value),
            Err(e) => {
                tracing::warn!(key, line = idx + 1, error = %e, "skipping unreadable log line");
            }
        }
    }
    out
}

/// Validate a storage key
///
/// # Errors
/// [`StorageError::InvalidKey`] for empty, absolute or escaping keys
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

const TMP_MARKER: &str = ".tmp-";

// Entry removed concurrently with the walk
fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Filesystem-backed storage rooted at a directory
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create storage under `root` (created lazily on first write)
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, s| p.join(s)))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!("{TMP_MARKER}{}", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp_name);

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(path, e));
        }
        Ok(())
    }

    async fn append(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => {
                        let path = e.path().map_or_else(|| root.clone(), Path::to_path_buf);
                        return Err(StorageError::io(
                            path,
                            std::io::Error::other(e.to_string()),
                        ));
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TMP_MARKER) || !key.starts_with(&prefix) {
                    continue;
                }
                keys.push(key);
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

/// In-memory storage
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    records: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Empty storage
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.records.get(key).map(|v| v.value().clone()))
    }

    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.records.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn append(&self, key: &str, line: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut entry = self.records.entry(key.to_string()).or_default();
        entry.extend_from_slice(line);
        entry.push(b'\n');
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.records.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
