//! Human review queue for actions that policy will not run unattended.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::action::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Deny,
}

impl ReviewDecision {
    fn status(self) -> ReviewStatus {
        match self {
            ReviewDecision::Approve => ReviewStatus::Approved,
            ReviewDecision::Deny => ReviewStatus::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub action: ActionKind,
    pub params: Value,
    pub requested_at: DateTime<Utc>,
    pub status: ReviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Storage seam for the review queue.
pub trait QueueStore: Send + Sync {
    /// Adds a pending item and returns its id.
    fn enqueue(&self, action: ActionKind, params: Value) -> String;

    /// Snapshot of every item, oldest first.
    fn list(&self) -> Vec<ReviewItem>;

    fn get(&self, id: &str) -> Option<ReviewItem>;

    /// Moves a pending item to its final status exactly once. Returns the
    /// resolved item, or `None` for unknown or already-resolved ids.
    fn resolve(&self, id: &str, decision: ReviewDecision, reviewer: &str) -> Option<ReviewItem>;

    /// Clears the queue.
    fn reset(&self) -> bool;

    fn pending_count(&self) -> usize {
        self.list()
            .iter()
            .filter(|item| item.status == ReviewStatus::Pending)
            .count()
    }
}

/// In-process queue.
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<Vec<ReviewItem>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueue {
    fn enqueue(&self, action: ActionKind, params: Value) -> String {
        let id = Uuid::new_v4().to_string();
        info!("Queued {action} for review: {id}");
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.push(ReviewItem {
            id: id.clone(),
            action,
            params,
            requested_at: Utc::now(),
            status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
        });
        id
    }

    fn list(&self) -> Vec<ReviewItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn get(&self, id: &str) -> Option<ReviewItem> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.iter().find(|item| item.id == id).cloned()
    }

    fn resolve(&self, id: &str, decision: ReviewDecision, reviewer: &str) -> Option<ReviewItem> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let item = items.iter_mut().find(|item| item.id == id)?;
        if item.status != ReviewStatus::Pending {
            debug!("Review {id} already {:?}", item.status);
            return None;
        }
        item.status = decision.status();
        item.reviewed_by = Some(reviewer.to_string());
        item.reviewed_at = Some(Utc::now());
        info!("Review {id} {:?} by {reviewer}", item.status);
        Some(item.clone())
    }

    fn reset(&self) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let cleared = items.len();
        items.clear();
        info!("Review queue reset ({cleared} items cleared)");
        true
    }
}
