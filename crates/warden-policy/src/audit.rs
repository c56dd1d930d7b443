//! Hash-chained governance audit log
//!
//! Every metric or policy decision becomes one line of
//! `audit/governance.jsonl`. Each record stores the SHA-256 of its own
//! content plus the previous record's hash, so editing or dropping a record
//! in the middle breaks the chain. Only [`AuditLog::truncate_before`] may
//! shorten the log, and it does so from the front.

use crate::error::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use warden_core::storage::append_json;
use warden_core::{SharedClock, SharedStorage, StorageError};

pub const AUDIT_LOG_KEY: &str = "audit/governance.jsonl";

const GENESIS: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    MetricChange,
    PolicyDecision,
    PolicyActionFailed,
}

impl AuditKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::MetricChange => "metric_change",
            Self::PolicyDecision => "policy_decision",
            Self::PolicyActionFailed => "policy_action_failed",
        }
    }
}

/// Decision to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub kind: AuditKind,
    /// Metric or policy name
    pub subject: String,
    pub actor: String,
    pub decision: Value,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        subject: impl Into<String>,
        actor: impl Into<String>,
        decision: Value,
    ) -> Self {
        Self {
            kind,
            subject: subject.into(),
            actor: actor.into(),
            decision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub subject: String,
    pub actor: String,
    pub decision: Value,
    /// Hex SHA-256 of the previous record, zeros for the first
    pub prev_hash: String,
    pub hash: String,
}

fn compute_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    entry_kind: AuditKind,
    subject: &str,
    actor: &str,
    decision: &Value,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(entry_kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(subject.as_bytes());
    hasher.update([0]);
    hasher.update(actor.as_bytes());
    hasher.update([0]);
    hasher.update(decision.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditRecord {
    fn expected_hash(&self) -> String {
        compute_hash(
            self.sequence,
            &self.timestamp,
            self.kind,
            &self.subject,
            &self.actor,
            &self.decision,
            &self.prev_hash,
        )
    }
}

/// Append-only, hash-chained audit log
#[derive(Debug)]
pub struct AuditLog {
    storage: SharedStorage,
    clock: SharedClock,
    /// Next sequence and previous hash, loaded on first append
    tail: Mutex<Option<(u64, String)>>,
}

impl AuditLog {
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self {
            storage,
            clock,
            tail: Mutex::new(None),
        }
    }

    /// Append one decision, extending the chain
    ///
    /// # Errors
    /// Storage failure or an unreadable existing log
    pub async fn append(&self, entry: AuditEntry) -> Result<AuditRecord, PolicyError> {
        let mut tail = self.tail.lock().await;
        let (sequence, prev_hash) = match tail.take() {
            Some(t) => t,
            None => match self.records().await?.last() {
                Some(last) => (last.sequence + 1, last.hash.clone()),
                None => (0, hex::encode(GENESIS)),
            },
        };

        let timestamp = self.clock.now();
        let hash = compute_hash(
            sequence,
            &timestamp,
            entry.kind,
            &entry.subject,
            &entry.actor,
            &entry.decision,
            &prev_hash,
        );
        let record = AuditRecord {
            sequence,
            timestamp,
            kind: entry.kind,
            subject: entry.subject,
            actor: entry.actor,
            decision: entry.decision,
            prev_hash: prev_hash.clone(),
            hash,
        };

        if let Err(e) = append_json(self.storage.as_ref(), AUDIT_LOG_KEY, &record).await {
            *tail = Some((sequence, prev_hash));
            return Err(e.into());
        }
        *tail = Some((sequence + 1, record.hash.clone()));
        tracing::debug!(sequence, kind = ?record.kind, subject = %record.subject, "audit record appended");
        Ok(record)
    }

    /// Every record, strictly parsed
    ///
    /// # Errors
    /// Storage failure or [`PolicyError::AuditCorrupt`] for an unreadable line
    pub async fn records(&self) -> Result<Vec<AuditRecord>, PolicyError> {
        let Some(bytes) = self.storage.read(AUDIT_LOG_KEY).await? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| PolicyError::AuditCorrupt {
                line: idx + 1,
                message: e.to_string(),
            })?;
            out.push(record);
        }
        Ok(out)
    }

    /// Walk the chain; returns the number of verified records
    ///
    /// # Errors
    /// [`PolicyError::AuditChain`] at the first record whose hash, link or
    /// sequence does not match
    pub async fn verify_integrity(&self) -> Result<usize, PolicyError> {
        let records = self.records().await?;
        let mut previous: Option<&AuditRecord> = None;
        for record in &records {
            if let Some(prev) = previous {
                if record.sequence != prev.sequence + 1 {
                    return Err(PolicyError::AuditChain {
                        sequence: record.sequence,
                        reason: format!("expected sequence {}", prev.sequence + 1),
                    });
                }
                if record.prev_hash != prev.hash {
                    return Err(PolicyError::AuditChain {
                        sequence: record.sequence,
                        reason: "previous hash does not match".to_string(),
                    });
                }
            } else if record.sequence == 0 && record.prev_hash != hex::encode(GENESIS) {
                return Err(PolicyError::AuditChain {
                    sequence: 0,
                    reason: "first record does not start the chain".to_string(),
                });
            }
            if record.hash != record.expected_hash() {
                return Err(PolicyError::AuditChain {
                    sequence: record.sequence,
                    reason: "content hash mismatch".to_string(),
                });
            }
            previous = Some(record);
        }
        Ok(records.len())
    }

    /// Retention: drop records older than `cutoff`; returns how many went
    ///
    /// The first kept record keeps its original `prev_hash`, so the
    /// remaining chain still verifies.
    ///
    /// # Errors
    /// Storage failure or an unreadable log
    pub async fn truncate_before(&self, cutoff: DateTime<Utc>) -> Result<usize, PolicyError> {
        let mut tail = self.tail.lock().await;
        let records = self.records().await?;
        let total = records.len();
        let kept: Vec<&AuditRecord> = records.iter().filter(|r| r.timestamp >= cutoff).collect();
        let removed = total - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for record in &kept {
            let line = serde_json::to_vec(record)
                .map_err(|e| StorageError::serialization(AUDIT_LOG_KEY, e))?;
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }
        self.storage.write_atomic(AUDIT_LOG_KEY, &buf).await?;
        // Empty log keeps counting from where it left off
        *tail = records.last().map(|last| (last.sequence + 1, last.hash.clone()));
        tracing::info!(removed, kept = kept.len(), "audit log truncated");
        Ok(removed)
    }
}
