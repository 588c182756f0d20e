//! Action kinds and the uniform result contract returned by every dispatch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// What kind of side effect an action request performs.
///
/// `Custom(String)` covers kinds registered after the builtins
/// (and any kind string a caller sends that we don't recognise).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Log,
    StatusCheck,
    FileRead,
    FileWrite,
    NetworkFetch,
    ReadDb,
    WriteDb,
    SpawnProcess,
    TokenTransfer,
    Custom(String),
}

impl ActionKind {
    /// Every builtin kind, in registry order.
    pub const BUILTIN: [ActionKind; 9] = [
        ActionKind::Log,
        ActionKind::StatusCheck,
        ActionKind::FileRead,
        ActionKind::FileWrite,
        ActionKind::NetworkFetch,
        ActionKind::ReadDb,
        ActionKind::WriteDb,
        ActionKind::SpawnProcess,
        ActionKind::TokenTransfer,
    ];

    /// Kinds any caller may request without holding a capability token.
    pub fn is_minimal_safe(&self) -> bool {
        matches!(
            self,
            ActionKind::Log | ActionKind::StatusCheck | ActionKind::FileRead
        )
    }

    /// Kinds that always need a human approval, even with permission.
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            ActionKind::WriteDb | ActionKind::TokenTransfer | ActionKind::SpawnProcess
        )
    }

    /// Cost units charged against a token budget for one invocation.
    pub fn cost(&self) -> u64 {
        1
    }

    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Log => "LOG",
            ActionKind::StatusCheck => "STATUS_CHECK",
            ActionKind::FileRead => "FILE_READ",
            ActionKind::FileWrite => "FILE_WRITE",
            ActionKind::NetworkFetch => "NETWORK_FETCH",
            ActionKind::ReadDb => "READ_DB",
            ActionKind::WriteDb => "WRITE_DB",
            ActionKind::SpawnProcess => "SPAWN_PROCESS",
            ActionKind::TokenTransfer => "TOKEN_TRANSFER",
            ActionKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "LOG" => ActionKind::Log,
            "STATUS_CHECK" => ActionKind::StatusCheck,
            "FILE_READ" => ActionKind::FileRead,
            "FILE_WRITE" => ActionKind::FileWrite,
            "NETWORK_FETCH" => ActionKind::NetworkFetch,
            "READ_DB" => ActionKind::ReadDb,
            "WRITE_DB" => ActionKind::WriteDb,
            "SPAWN_PROCESS" => ActionKind::SpawnProcess,
            "TOKEN_TRANSFER" => ActionKind::TokenTransfer,
            _ => ActionKind::Custom(s.trim().to_string()),
        })
    }
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Machine-checkable failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Refused before reaching a provider. Not retryable with the same token.
    PolicyDeny,
    /// Waiting on a human reviewer.
    PendingReview,
    /// An external dependency (config, credential, network, tool) is absent.
    MissingTool,
    RateLimitExceeded,
    BudgetExhausted,
    /// Unexpected failure inside a provider or the dispatch path.
    ExecutionError,
    /// The provider ran and reported failure (non-zero exit, timeout, RPC error).
    ProviderFailed,
    /// The provider rejected the request shape before any side effect.
    InvalidParams,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PolicyDeny => "POLICY_DENY",
            ErrorKind::PendingReview => "PENDING_REVIEW",
            ErrorKind::MissingTool => "MISSING_TOOL",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::BudgetExhausted => "BUDGET_EXHAUSTED",
            ErrorKind::ExecutionError => "EXECUTION_ERROR",
            ErrorKind::ProviderFailed => "PROVIDER_FAILED",
            ErrorKind::InvalidParams => "INVALID_PARAMS",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure half of [`ActionResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionFailure {
    pub kind: ErrorKind,
    /// Diagnostic text. Never parse this; branch on `kind`.
    pub error: String,
    /// Unmet external dependencies, when the failure is remediable by configuration.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    /// Real data the provider captured before failing (exit code, stderr, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ActionFailure {
    pub fn new(kind: ErrorKind, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            error: error.into(),
            missing: Vec::new(),
            review_id: None,
            detail: None,
            timestamp,
        }
    }

    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = missing;
        self
    }

    pub fn with_review_id(mut self, review_id: impl Into<String>) -> Self {
        self.review_id = Some(review_id.into());
        self
    }

    pub fn with_detail(mut self, detail: Option<Value>) -> Self {
        self.detail = detail;
        self
    }
}

/// Uniform result of every dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult<T = Value> {
    Success { result: T, timestamp: DateTime<Utc> },
    Failure(ActionFailure),
}

impl<T> ActionResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ActionResult::Success { .. })
    }

    /// The failure kind, or `None` on success.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ActionResult::Success { .. } => None,
            ActionResult::Failure(failure) => Some(failure.kind),
        }
    }

    pub fn failure(&self) -> Option<&ActionFailure> {
        match self {
            ActionResult::Success { .. } => None,
            ActionResult::Failure(failure) => Some(failure),
        }
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            ActionResult::Success { result, .. } => Some(result),
            ActionResult::Failure(_) => None,
        }
    }

    pub fn review_id(&self) -> Option<&str> {
        self.failure().and_then(|f| f.review_id.as_deref())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ActionResult::Success { timestamp, .. } => *timestamp,
            ActionResult::Failure(failure) => failure.timestamp,
        }
    }
}

impl<T: Serialize> Serialize for ActionResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ActionResult::Success { result, timestamp } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("result", result)?;
                map.serialize_entry("timestamp", timestamp)?;
                map.end()
            }
            ActionResult::Failure(failure) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("kind", &failure.kind)?;
                map.serialize_entry("error", &failure.error)?;
                if !failure.missing.is_empty() {
                    map.serialize_entry("missing", &failure.missing)?;
                }
                if let Some(ref review_id) = failure.review_id {
                    map.serialize_entry("review_id", review_id)?;
                }
                if let Some(ref detail) = failure.detail {
                    map.serialize_entry("detail", detail)?;
                }
                map.serialize_entry("timestamp", &failure.timestamp)?;
                map.end()
            }
        }
    }
}
