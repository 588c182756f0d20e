use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::action::ActionKind;
use crate::sandbox::approval::ReviewDecision;
use crate::sandbox::{ExecuteOptions, Sandbox};

/// Reviewer recorded when `/approve` or `/deny` names none.
const DEFAULT_REVIEWER: &str = "operator";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Output(String),
    Silent,
    Quit,
}

/// Operator console: one slash command per line, JSON out.
pub struct Console {
    sandbox: Arc<Sandbox>,
}

impl Console {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }

    /// Handles one input line. Command errors are reported as a JSON
    /// `{"error": ...}` object rather than ending the session.
    pub async fn handle(&self, line: &str) -> Reply {
        match self.handle_command(line).await {
            Ok(reply) => reply,
            Err(e) => Reply::Output(json!({ "error": format!("{e:#}") }).to_string()),
        }
    }

    async fn handle_command(&self, line: &str) -> Result<Reply> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Reply::Silent);
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command.to_lowercase(), rest.trim()),
            None => (line.to_lowercase(), ""),
        };

        info!("Console command: {command}");

        match command.as_str() {
            "/exec" => self.cmd_execute(rest, ExecuteOptions::default()).await,
            "/dry" => self.cmd_execute(rest, ExecuteOptions::dry_run()).await,
            "/gate" => self.cmd_execute(rest, ExecuteOptions::human_gate()).await,
            "/approvals" => output(&self.sandbox.list_approvals()),
            "/approve" => self.cmd_review(rest, ReviewDecision::Approve).await,
            "/deny" => self.cmd_review(rest, ReviewDecision::Deny).await,
            "/reset" => output(&json!({ "reset": self.sandbox.reset_approvals() })),
            "/audit" => output(&self.sandbox.audit()),
            "/verify" => output(&self.sandbox.verify_audit()),
            "/attach" => self.cmd_attach(rest),
            "/emergency" => self.cmd_emergency(rest),
            "/status" => output(&self.sandbox.status()),
            "/providers" => output(&self.sandbox.providers()),
            "/help" => Ok(Reply::Output(help())),
            "/quit" | "/exit" => Ok(Reply::Quit),
            _ => bail!("unknown command: {command} (type /help)"),
        }
    }

    /// /exec KIND [JSON]
    async fn cmd_execute(&self, args: &str, options: ExecuteOptions) -> Result<Reply> {
        let (kind, params) = match args.split_once(char::is_whitespace) {
            Some((kind, json)) => (kind, json.trim()),
            None => (args, ""),
        };
        if kind.is_empty() {
            bail!("usage: /exec KIND [JSON]");
        }
        let kind = ActionKind::from(kind.to_string());
        let params: Value = if params.is_empty() {
            json!({})
        } else {
            serde_json::from_str(params).context("params must be a JSON value")?
        };
        let result = self.sandbox.execute(kind, params, options).await;
        output(&result)
    }

    /// /approve ID [REVIEWER], /deny ID [REVIEWER]
    async fn cmd_review(&self, args: &str, decision: ReviewDecision) -> Result<Reply> {
        let mut parts = args.split_whitespace();
        let id = parts.next().ok_or_else(|| anyhow!("usage: /approve|/deny ID [REVIEWER]"))?;
        let reviewer = parts.next().unwrap_or(DEFAULT_REVIEWER);

        match self.sandbox.review(id, decision, reviewer).await {
            Some(outcome) => output(&outcome),
            None => output(&json!({ "resolved": false, "review_id": id })),
        }
    }

    /// /attach PACK
    fn cmd_attach(&self, args: &str) -> Result<Reply> {
        if args.is_empty() {
            bail!("usage: /attach PACK (available: {})", self.sandbox.packs().join(", "));
        }
        let token = self.sandbox.attach_pack(args)?;
        output(&json!({
            "attached": token.id,
            "permissions": token.permissions,
            "rate_limit": token.rate_limit,
            "budget": token.budget,
        }))
    }

    /// /emergency on|off
    fn cmd_emergency(&self, args: &str) -> Result<Reply> {
        let on = match args.to_lowercase().as_str() {
            "on" | "true" | "1" => true,
            "off" | "false" | "0" => false,
            _ => bail!("usage: /emergency on|off"),
        };
        self.sandbox.set_emergency(on);
        output(&json!({ "emergency": on }))
    }
}

fn output<T: Serialize + ?Sized>(value: &T) -> Result<Reply> {
    Ok(Reply::Output(serde_json::to_string_pretty(value)?))
}

fn help() -> String {
    "\
Commands:
  /exec KIND [JSON]          Execute an action
  /dry KIND [JSON]           Check and echo an action without running it
  /gate KIND [JSON]          Queue an action for human review
  /approvals                 List review items
  /approve ID [REVIEWER]     Approve a pending item and run it
  /deny ID [REVIEWER]        Deny a pending item
  /reset                     Clear the review queue
  /audit                     Show the audit log
  /verify                    Verify the audit digest chain
  /attach PACK               Attach a configured capability pack
  /emergency on|off          Engage or release the emergency stop
  /status                    Sandbox status
  /providers                 Registered providers
  /help                      This message
  /quit                      Exit"
        .to_string()
}
