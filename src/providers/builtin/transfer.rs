//! Builtin provider: value transfer through a JSON-RPC endpoint.
//!
//! Needs both `transfer.rpc_url` and `transfer.wallet`. The result is
//! whatever the endpoint returned in its `result` field; an RPC `error`
//! object or an unreachable endpoint is a failure, never a receipt.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::action::ActionKind;
use crate::config::{present, NetworkConfig, TransferConfig};
use crate::providers::builtin::network::NETWORK_ACCESS;
use crate::providers::{required_str, Provider, ProviderError};

pub(crate) const TRANSFER_RPC_URL: &str = "transfer.rpc_url";
pub(crate) const TRANSFER_WALLET: &str = "transfer.wallet";

pub struct TokenTransferProvider {
    config: TransferConfig,
    client: reqwest::Client,
}

impl TokenTransferProvider {
    pub fn new(config: &TransferConfig, network: &NetworkConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(network.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config: config.clone(),
            client,
        }
    }

    fn endpoint(&self) -> (Option<&str>, Option<&str>) {
        (present(&self.config.rpc_url), present(&self.config.wallet))
    }
}

/// Names each absent transfer setting.
fn missing_keys(rpc_url: Option<&str>, wallet: Option<&str>) -> Vec<String> {
    let mut missing = Vec::new();
    if rpc_url.is_none() {
        missing.push(TRANSFER_RPC_URL.to_string());
    }
    if wallet.is_none() {
        missing.push(TRANSFER_WALLET.to_string());
    }
    missing
}

/// Accepts `amount` as a positive JSON number or numeric string.
fn parse_amount(params: &Value) -> Result<Value, ProviderError> {
    let amount = &params["amount"];
    let numeric = match amount {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    match numeric {
        Some(n) if n.is_finite() && n > 0.0 => Ok(amount.clone()),
        _ => Err(ProviderError::InvalidParams(
            "amount must be a positive number".into(),
        )),
    }
}

#[async_trait]
impl Provider for TokenTransferProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::TokenTransfer
    }

    fn description(&self) -> &str {
        "Transfer an amount to a recipient through the configured transfer RPC \
         endpoint, signed from the configured wallet."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "amount": { "type": ["number", "string"] },
                "to": { "type": "string" },
                "chain": { "type": "string" }
            },
            "required": ["amount", "to"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        let (rpc_url, wallet) = self.endpoint();
        missing_keys(rpc_url, wallet)
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let (rpc_url, wallet) = self.endpoint();
        let (Some(rpc_url), Some(wallet)) = (rpc_url, wallet) else {
            return Err(ProviderError::MissingTool {
                missing: missing_keys(rpc_url, wallet),
            });
        };

        let amount = parse_amount(params)?;
        let to = required_str(params, "to")?;
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut transfer = json!({ "from": wallet, "to": to, "amount": amount });
        if let Some(chain) = params["chain"].as_str() {
            transfer["chain"] = Value::String(chain.to_string());
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "transfer",
            "params": transfer,
        });

        let response = self
            .client
            .post(rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("Transfer endpoint unreachable: {e}");
                ProviderError::MissingTool {
                    missing: vec![NETWORK_ACCESS.to_string()],
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::failed(format!(
                "transfer endpoint returned HTTP {status}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::failed(format!("transfer endpoint sent invalid JSON: {e}")))?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(ProviderError::Failed {
                message: format!(
                    "transfer rejected: {}",
                    error["message"].as_str().unwrap_or("unknown RPC error")
                ),
                detail: Some(error.clone()),
            });
        }
        let Some(result) = reply.get("result").filter(|r| !r.is_null()) else {
            return Err(ProviderError::failed(
                "transfer endpoint reply has no result",
            ));
        };

        info!("Transfer of {amount} to {to} accepted");
        Ok(json!({
            "request_id": request_id,
            "to": to,
            "amount": amount,
            "receipt": result,
        }))
    }
}
