pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::{ActionKind, ErrorKind};

/// Typed failure reported by a provider.
///
/// Providers must fail with one of these rather than return a
/// plausible-looking placeholder when they could not reach the real
/// external source.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Safety check refused the request before any side effect.
    #[error("DENY: {0}")]
    Denied(String),

    /// A required external dependency is absent. `missing` names each item.
    #[error("MISSING_TOOL: {}", .missing.join(", "))]
    MissingTool { missing: Vec<String> },

    /// The provider ran and the external side reported failure.
    #[error("{message}")]
    Failed {
        message: String,
        detail: Option<Value>,
    },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn missing(items: &[&str]) -> Self {
        ProviderError::MissingTool {
            missing: items.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ProviderError::Failed {
            message: message.into(),
            detail: None,
        }
    }

    /// Caller-facing failure kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Denied(_) => ErrorKind::PolicyDeny,
            ProviderError::MissingTool { .. } => ErrorKind::MissingTool,
            ProviderError::Failed { .. } => ErrorKind::ProviderFailed,
            ProviderError::InvalidParams(_) => ErrorKind::InvalidParams,
            ProviderError::Internal(_) => ErrorKind::ExecutionError,
        }
    }
}

/// Fetches a required string parameter.
pub fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ProviderError> {
    params[name]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidParams(format!("missing required parameter: {name}")))
}

/// The real, side-effecting implementation of one action kind.
///
/// Builtin and later-registered providers all implement this trait.
/// The dispatcher calls `invoke()` only after policy, approval and
/// rate/budget checks have passed.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The action kind this provider serves.
    fn kind(&self) -> ActionKind;

    /// Human-readable description shown by the operator console.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this provider accepts.
    fn parameters_schema(&self) -> Value;

    /// External dependencies this provider needs and which are currently
    /// absent. Empty when the provider is fully configured.
    fn missing_requirements(&self) -> Vec<String> {
        vec![]
    }

    /// Perform the side effect.
    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError>;
}

pub use registry::ProviderRegistry;
