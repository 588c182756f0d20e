//! Builtin provider: spawn an allow-listed executable.
//!
//! The executable name must match an allow-list entry exactly; anything
//! else is refused before `Command::spawn` is ever reached. Every run is
//! bounded by a timeout and the child is killed if the timeout fires.
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::action::ActionKind;
use crate::config::ProcessConfig;
use crate::providers::builtin::files::resolve_in_root;
use crate::providers::{required_str, Provider, ProviderError};

pub(crate) const NOT_ALLOWLISTED: &str = "command not allowlisted";

/// Captured stdout/stderr are truncated to this many characters each.
const MAX_CAPTURE: usize = 64 * 1024;

pub struct SpawnProcessProvider {
    allowlist: Vec<String>,
    timeout: Duration,
    root: PathBuf,
}

impl SpawnProcessProvider {
    pub fn new(config: &ProcessConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            allowlist: config.allowlist.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            root: root.into(),
        }
    }

    fn is_allowlisted(&self, cmd: &str) -> bool {
        !cmd.is_empty() && self.allowlist.iter().any(|allowed| allowed == cmd)
    }
}

/// Truncates captured output at a character boundary.
fn capture(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > MAX_CAPTURE {
        let truncated: String = text.chars().take(MAX_CAPTURE).collect();
        format!("{truncated}\n[output truncated at {MAX_CAPTURE} characters]")
    } else {
        text.into_owned()
    }
}

fn parse_args(params: &Value) -> Result<Vec<String>, ProviderError> {
    match &params["args"] {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ProviderError::InvalidParams("args must be strings".into()))
            })
            .collect(),
        _ => Err(ProviderError::InvalidParams("args must be an array of strings".into())),
    }
}

#[async_trait]
impl Provider for SpawnProcessProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::SpawnProcess
    }

    fn description(&self) -> &str {
        "Run an allow-listed executable with arguments inside the sandbox root. \
         Returns exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": { "type": "string", "description": "Executable name (must be allow-listed)" },
                "args": { "type": "array", "items": { "type": "string" } },
                "cwd": { "type": "string", "description": "Working directory relative to the sandbox root" }
            },
            "required": ["cmd"]
        })
    }

    fn missing_requirements(&self) -> Vec<String> {
        if self.allowlist.is_empty() {
            vec!["providers.process.allowlist".to_string()]
        } else {
            vec![]
        }
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let cmd = required_str(params, "cmd")?;
        if !self.is_allowlisted(cmd) {
            warn!("Refusing to spawn non-allowlisted command: {cmd}");
            return Err(ProviderError::Denied(NOT_ALLOWLISTED.into()));
        }
        let args = parse_args(params)?;
        let cwd = resolve_in_root(&self.root, params["cwd"].as_str().unwrap_or("."))?;

        debug!("Spawning {cmd} {args:?} in {}", cwd.display());
        let started = Instant::now();

        let child = Command::new(cmd)
            .args(&args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::MissingTool {
                    missing: vec![format!("executable '{cmd}'")],
                });
            }
            Err(e) => return Err(ProviderError::Internal(anyhow::anyhow!("spawn {cmd}: {e}"))),
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProviderError::Internal(anyhow::anyhow!("wait {cmd}: {e}"))),
            Err(_) => {
                warn!("{cmd} timed out after {}s", self.timeout.as_secs());
                return Err(ProviderError::Failed {
                    message: format!("{cmd} timed out after {}s", self.timeout.as_secs()),
                    detail: Some(json!({ "timed_out": true, "timeout_secs": self.timeout.as_secs() })),
                });
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let exit_code = output.status.code();
        let result = json!({
            "cmd": cmd,
            "args": args,
            "exit_code": exit_code,
            "stdout": capture(&output.stdout),
            "stderr": capture(&output.stderr),
            "elapsed_ms": elapsed_ms,
        });

        if output.status.success() {
            info!("{cmd} exited 0 in {elapsed_ms}ms");
            Ok(result)
        } else {
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            warn!("{cmd} exited with {code}");
            Err(ProviderError::Failed {
                message: format!("{cmd} exited with status {code}"),
                detail: Some(result),
            })
        }
    }
}
