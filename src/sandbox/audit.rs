//! Append-only audit log of provider-path dispatch attempts.
//!
//! Entries are chained: each digest covers the previous digest plus the
//! entry's own fields, so any edit or removal inside the log shows up in
//! [`verify_chain`].

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::action::{ActionKind, ErrorKind};

/// `prev_digest` of the first entry.
pub const GENESIS_DIGEST: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 1. Assigned on append.
    pub seq: u64,
    pub action: ActionKind,
    pub params: Value,
    pub outcome: bool,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    /// Hex SHA-256 chain digest. Assigned on append.
    pub digest: String,
}

/// Fields covered by the digest, in a fixed order.
#[derive(Serialize)]
struct Sealed<'a> {
    seq: u64,
    action: &'a ActionKind,
    params: &'a Value,
    outcome: bool,
    timestamp: &'a DateTime<Utc>,
    agent_id: &'a str,
    error: &'a Option<String>,
    error_kind: &'a Option<ErrorKind>,
    review_id: &'a Option<String>,
}

impl AuditEntry {
    /// A successful attempt.
    pub fn success(
        action: ActionKind,
        params: Value,
        agent_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            action,
            params,
            outcome: true,
            timestamp,
            agent_id: agent_id.into(),
            error: None,
            error_kind: None,
            review_id: None,
            digest: String::new(),
        }
    }

    /// A failed attempt.
    pub fn failure(
        action: ActionKind,
        params: Value,
        agent_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            outcome: false,
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::success(action, params, agent_id, timestamp)
        }
    }

    pub fn with_review_id(mut self, review_id: Option<String>) -> Self {
        self.review_id = review_id;
        self
    }

    /// Digest of this entry chained onto `prev_digest`.
    pub fn compute_digest(&self, prev_digest: &str) -> anyhow::Result<String> {
        let body = serde_json::to_vec(&Sealed {
            seq: self.seq,
            action: &self.action,
            params: &self.params,
            outcome: self.outcome,
            timestamp: &self.timestamp,
            agent_id: &self.agent_id,
            error: &self.error,
            error_kind: &self.error_kind,
            review_id: &self.review_id,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(prev_digest.as_bytes());
        hasher.update(&body);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Result of re-walking the digest chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub entries: usize,
    pub verified: bool,
    /// Sequence number of the first entry whose digest or position is wrong.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken: Option<u64>,
}

pub fn verify_chain(entries: &[AuditEntry]) -> AuditReport {
    let mut prev = GENESIS_DIGEST.to_string();
    for (index, entry) in entries.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        let intact = entry.seq == expected_seq
            && entry
                .compute_digest(&prev)
                .map(|digest| digest == entry.digest)
                .unwrap_or(false);
        if !intact {
            return AuditReport {
                entries: entries.len(),
                verified: false,
                first_broken: Some(expected_seq),
            };
        }
        prev = entry.digest.clone();
    }
    AuditReport {
        entries: entries.len(),
        verified: true,
        first_broken: None,
    }
}

/// Storage seam for the audit log.
pub trait LogStore: Send + Sync {
    /// Assigns `seq` and `digest`, stores the entry and returns it as stored.
    fn append(&self, entry: AuditEntry) -> anyhow::Result<AuditEntry>;

    /// Every entry, oldest first.
    fn all(&self) -> Vec<AuditEntry>;

    fn len(&self) -> usize {
        self.all().len()
    }
}

#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLog {
    fn append(&self, mut entry: AuditEntry) -> anyhow::Result<AuditEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = entries
            .last()
            .map(|last| last.digest.clone())
            .unwrap_or_else(|| GENESIS_DIGEST.to_string());
        entry.seq = entries.len() as u64 + 1;
        entry.digest = entry.compute_digest(&prev)?;
        debug!(
            "Audit #{} {} outcome={} agent={}",
            entry.seq, entry.action, entry.outcome, entry.agent_id
        );
        entries.push(entry.clone());
        Ok(entry)
    }

    fn all(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
