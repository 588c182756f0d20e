use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::action::ActionKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Named capability packs, issued with `sandbox.secret` on attach.
    #[serde(default)]
    pub capabilities: BTreeMap<String, CapabilityPackConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Identity recorded in audit entries when no token is attached.
    pub agent_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Token signing secret. Supports ${ENV_VAR} substitution.
    /// Empty means no token can be verified.
    #[serde(default)]
    pub secret: String,
    /// Kill switch: forces every action to be denied.
    #[serde(default)]
    pub emergency: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    /// Sandbox root for file providers and process working directories.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Executable names that may be spawned. Exact match only.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default = "default_process_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_network_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// SQLite database path, optionally `sqlite://`-prefixed.
    /// Supports ${ENV_VAR} substitution.
    #[serde(default)]
    pub connection: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransferConfig {
    /// JSON-RPC endpoint of the value-transfer service.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Wallet / key identifier the transfer is signed from.
    #[serde(default)]
    pub wallet: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CapabilityPackConfig {
    pub permissions: Vec<ActionKind>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_budget")]
    pub budget: u64,
}

fn default_scope() -> String {
    "sandbox:local".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("./.sandbox")
}

fn default_process_timeout() -> u64 {
    30
}

fn default_network_timeout() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    10
}

fn default_budget() -> u64 {
    100
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            process: ProcessConfig::default(),
            network: NetworkConfig::default(),
            store: StoreConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            timeout_secs: default_process_timeout(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_network_timeout(),
        }
    }
}

/// Treats blank strings (e.g. an unset `${VAR:-}`) as absent.
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SandboxConfig {
    pub fn secret(&self) -> Option<&str> {
        let secret = self.secret.trim();
        (!secret.is_empty()).then_some(secret)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding `${VAR}` / `${VAR:-default}` references.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
