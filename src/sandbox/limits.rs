use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::action::ErrorKind;

use super::capability::CapabilityToken;

/// Length of the rolling rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitViolation {
    #[error("rate limit of {limit} actions per minute exceeded for token {token}")]
    RateLimit { token: String, limit: u32 },

    #[error("budget of {budget} units exhausted for token {token} ({spent} spent)")]
    Budget {
        token: String,
        budget: u64,
        spent: u64,
    },
}

impl LimitViolation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LimitViolation::RateLimit { .. } => ErrorKind::RateLimitExceeded,
            LimitViolation::Budget { .. } => ErrorKind::BudgetExhausted,
        }
    }
}

/// Current consumption of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub token: String,
    pub in_window: u32,
    pub remaining_rate: u32,
    pub spent: u64,
    pub remaining_budget: u64,
}

#[derive(Default)]
struct Usage {
    admitted: VecDeque<Instant>,
    spent: u64,
}

impl Usage {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self) -> u32 {
        u32::try_from(self.admitted.len()).unwrap_or(u32::MAX)
    }
}

/// Per-token rate and budget accounting.
///
/// Check and record happen under one lock so concurrent dispatches
/// cannot both take the last slot.
#[derive(Default)]
pub struct UsageLedger {
    usage: Mutex<HashMap<String, Usage>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits one action of `cost` units against `token`, or reports which
    /// limit it would break. Nothing is recorded on violation.
    pub fn check_and_record(
        &self,
        token: &CapabilityToken,
        cost: u64,
    ) -> Result<(), LimitViolation> {
        let now = Instant::now();
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = usage.entry(token.id.clone()).or_default();
        entry.prune(now);

        if entry.in_window() >= token.rate_limit {
            return Err(LimitViolation::RateLimit {
                token: token.id.clone(),
                limit: token.rate_limit,
            });
        }
        if entry.spent.saturating_add(cost) > token.budget {
            return Err(LimitViolation::Budget {
                token: token.id.clone(),
                budget: token.budget,
                spent: entry.spent,
            });
        }

        entry.admitted.push_back(now);
        entry.spent += cost;
        Ok(())
    }

    pub fn snapshot(&self, token: &CapabilityToken) -> UsageSnapshot {
        let now = Instant::now();
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let (in_window, spent) = match usage.get_mut(&token.id) {
            Some(entry) => {
                entry.prune(now);
                (entry.in_window(), entry.spent)
            }
            None => (0, 0),
        };
        UsageSnapshot {
            token: token.id.clone(),
            in_window,
            remaining_rate: token.rate_limit.saturating_sub(in_window),
            spent,
            remaining_budget: token.budget.saturating_sub(spent),
        }
    }
}
