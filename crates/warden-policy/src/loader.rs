//! Bounded, content-addressed policy document loading

use crate::document::PolicyDocument;
use crate::error::PolicyError;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use warden_core::ContentHash;

/// `[policy]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Documents installed at startup, in order
    pub documents: Vec<PathBuf>,
    pub max_concurrent_loads: usize,
    pub cache_capacity: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            max_concurrent_loads: 2,
            cache_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` is JSON; everything else is read as YAML
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
}

/// Parse and validate a document
///
/// # Errors
/// [`PolicyError::Parse`] for syntax and schema errors,
/// [`PolicyError::Invalid`] for semantic problems
pub fn parse_document(text: &str, format: DocumentFormat) -> Result<PolicyDocument, PolicyError> {
    let parsed = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
    };
    let document: PolicyDocument = parsed.map_err(|message| PolicyError::Parse {
        format: format.name(),
        message,
    })?;
    let problems = document.problems();
    if !problems.is_empty() {
        return Err(PolicyError::Invalid { problems });
    }
    Ok(document)
}

/// Loads policy documents under a global concurrency limit
///
/// Parsed documents are cached by the BLAKE3 hash of their bytes, so an
/// unchanged file is parsed once however often it is reloaded.
#[derive(Debug, Clone)]
pub struct PolicyLoader {
    cache: Cache<ContentHash, Arc<PolicyDocument>>,
    permits: Arc<Semaphore>,
}

impl PolicyLoader {
    #[must_use]
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            cache: Cache::new(config.cache_capacity),
            permits: Arc::new(Semaphore::new(config.max_concurrent_loads.max(1))),
        }
    }

    /// # Errors
    /// Unreadable file, or a document that fails to parse or validate
    pub async fn load_path(&self, path: &Path) -> Result<Arc<PolicyDocument>, PolicyError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PolicyError::Task(e.to_string()))?;
        let bytes = tokio::fs::read(path).await.map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document = self.load_bytes(&bytes, DocumentFormat::from_path(path)).await?;
        tracing::debug!(path = %path.display(), policies = document.policies.len(), "policy document loaded");
        Ok(document)
    }

    /// # Errors
    /// Non-UTF-8 input, or a document that fails to parse or validate
    pub async fn load_bytes(
        &self,
        bytes: &[u8],
        format: DocumentFormat,
    ) -> Result<Arc<PolicyDocument>, PolicyError> {
        let hash = ContentHash::compute(bytes);
        if let Some(cached) = self.cache.get(&hash).await {
            return Ok(cached);
        }

        let text = std::str::from_utf8(bytes).map_err(|e| PolicyError::Parse {
            format: format.name(),
            message: e.to_string(),
        })?;
        let document = Arc::new(parse_document(text, format)?);
        self.cache.insert(hash, Arc::clone(&document)).await;
        Ok(document)
    }

    /// Load every path concurrently, results in input order
    ///
    /// # Errors
    /// The first document that fails
    pub async fn load_all(&self, paths: &[PathBuf]) -> Result<Vec<Arc<PolicyDocument>>, PolicyError> {
        futures::future::try_join_all(paths.iter().map(|p| self.load_path(p))).await
    }

    #[must_use]
    pub fn cached_documents(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Permits currently free
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
