//! Builtin provider: report facts about the running sandbox process.
//!
//! Everything returned is read from the OS or the live configuration at
//! call time.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::action::ActionKind;
use crate::config::{present, ProvidersConfig};
use crate::providers::{Provider, ProviderError};

pub struct StatusCheckProvider {
    config: ProvidersConfig,
}

impl StatusCheckProvider {
    pub fn new(config: &ProvidersConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Provider for StatusCheckProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::StatusCheck
    }

    fn description(&self) -> &str {
        "Report process, platform and provider configuration status."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn invoke(&self, _params: &Value) -> Result<Value, ProviderError> {
        let root_exists = tokio::fs::metadata(&self.config.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let cwd = std::env::current_dir()
            .map(|p| p.display().to_string())
            .map_err(|e| ProviderError::Internal(e.into()))?;

        Ok(json!({
            "pid": std::process::id(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cwd": cwd,
            "checked_at": chrono::Utc::now().to_rfc3339(),
            "sandbox_root": {
                "path": self.config.root.display().to_string(),
                "exists": root_exists,
            },
            "configured": {
                "process_allowlist": self.config.process.allowlist.len(),
                "store_connection": present(&self.config.store.connection).is_some(),
                "transfer_rpc_url": present(&self.config.transfer.rpc_url).is_some(),
                "transfer_wallet": present(&self.config.transfer.wallet).is_some(),
            },
        }))
    }
}
