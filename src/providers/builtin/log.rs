use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use crate::action::ActionKind;
use crate::providers::{required_str, Provider, ProviderError};

/// Routes a caller-supplied message through the process log.
pub struct LogProvider;

#[async_trait]
impl Provider for LogProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::Log
    }

    fn description(&self) -> &str {
        "Write a message to the sandbox log at the given level."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "level": { "type": "string", "enum": ["trace", "debug", "info", "warn", "error"] },
                "message": { "type": "string" }
            },
            "required": ["message"]
        })
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let message = required_str(params, "message")?;
        let level = params["level"].as_str().unwrap_or("info").to_ascii_lowercase();

        match level.as_str() {
            "trace" => trace!(target: "capgate::agent", "{message}"),
            "debug" => debug!(target: "capgate::agent", "{message}"),
            "info" => info!(target: "capgate::agent", "{message}"),
            "warn" | "warning" => warn!(target: "capgate::agent", "{message}"),
            "error" => error!(target: "capgate::agent", "{message}"),
            other => {
                return Err(ProviderError::InvalidParams(format!(
                    "unknown log level '{other}'"
                )))
            }
        }

        Ok(json!({ "logged": true, "level": level, "message": message }))
    }
}
