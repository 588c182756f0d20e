//! Execution sandbox: the single entry point through which an agent
//! requests side effects.
//!
//! Every request is run through, in order:
//!
//! 1. the policy engine (emergency stop, capability token, sensitive kinds)
//! 2. the human review queue, when policy or the caller asks for it
//! 3. the token's rate and budget limits
//! 4. the provider that performs the side effect
//!
//! Each attempt that reaches the provider lookup leaves exactly one entry
//! in the audit log.

pub mod approval;
pub mod audit;
pub mod capability;
pub mod limits;
pub mod policy;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::action::{ActionFailure, ActionKind, ActionResult, ErrorKind};
use crate::config::{CapabilityPackConfig, Config, SandboxConfig};
use crate::providers::{Provider, ProviderError, ProviderRegistry};

use approval::{MemoryQueue, QueueStore, ReviewDecision, ReviewItem};
use audit::{verify_chain, AuditEntry, AuditReport, LogStore, MemoryLog};
use capability::{CapabilityError, CapabilityToken, TokenStore};
use limits::{UsageLedger, UsageSnapshot};
use policy::PolicyDecision;

/// Per-call switches for [`Sandbox::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Validate and echo the request without invoking a provider.
    pub dry_run: bool,
    /// Send the request to human review even when policy would allow it.
    pub human_gate: bool,
}

impl ExecuteOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn human_gate() -> Self {
        Self {
            human_gate: true,
            ..Self::default()
        }
    }
}

/// What a reviewer's decision led to.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub item: ReviewItem,
    /// Result of the approved execution. `None` when the item was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub id: String,
    pub permissions: Vec<ActionKind>,
    pub rate_limit: u32,
    pub budget: u64,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    pub agent_id: String,
    pub scope: String,
    pub emergency: bool,
    pub token: Option<TokenSummary>,
    pub pending_approvals: usize,
    pub audit_entries: usize,
    pub providers: Vec<ActionKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub kind: ActionKind,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    pub parameters: Value,
}

pub struct Sandbox {
    agent_id: String,
    scope: String,
    registry: ProviderRegistry,
    tokens: TokenStore,
    packs: BTreeMap<String, CapabilityPackConfig>,
    ledger: UsageLedger,
    queue: Arc<dyn QueueStore>,
    log: Arc<dyn LogStore>,
    emergency: AtomicBool,
}

impl Sandbox {
    pub fn new(config: &SandboxConfig, registry: ProviderRegistry) -> Self {
        if config.emergency {
            warn!("Emergency stop is set in configuration; all actions will be denied");
        }
        if config.secret().is_none() {
            warn!("No sandbox secret configured; capability tokens cannot be attached");
        }
        Self {
            agent_id: config.agent_id.clone(),
            scope: config.scope.clone(),
            registry,
            tokens: TokenStore::new(config.secret().map(str::to_string)),
            packs: BTreeMap::new(),
            ledger: UsageLedger::new(),
            queue: Arc::new(MemoryQueue::new()),
            log: Arc::new(MemoryLog::new()),
            emergency: AtomicBool::new(config.emergency),
        }
    }

    /// Sandbox with every builtin provider and the configured capability packs.
    pub fn from_config(config: &Config) -> Self {
        let mut sandbox = Self::new(&config.sandbox, ProviderRegistry::builtin(&config.providers));
        sandbox.packs = config.capabilities.clone();
        sandbox
    }

    /// Replaces the in-memory queue and log.
    pub fn with_stores(mut self, queue: Arc<dyn QueueStore>, log: Arc<dyn LogStore>) -> Self {
        self.queue = queue;
        self.log = log;
        self
    }

    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) {
        self.registry.register(provider);
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Run one action request through policy, review, limits and its provider.
    ///
    /// Never returns `Err` and never panics: every failure comes back as an
    /// [`ActionResult::Failure`] with a machine-checkable [`ErrorKind`].
    pub async fn execute(
        &self,
        kind: ActionKind,
        params: Value,
        options: ExecuteOptions,
    ) -> ActionResult {
        let timestamp = Utc::now();
        // One snapshot per dispatch: a concurrent set_capability does not
        // affect a request already past this point.
        let token = self.tokens.current();
        let decision = policy::evaluate(&kind, token.as_deref(), self.is_emergency());
        debug!("Policy for {kind}: {decision:?}");

        match decision {
            PolicyDecision::Deny { reason } => {
                warn!("Denied {kind}: {reason}");
                return ActionResult::Failure(ActionFailure::new(
                    ErrorKind::PolicyDeny,
                    format!("POLICY_DENY: {reason}"),
                    timestamp,
                ));
            }
            PolicyDecision::Review { reason } => {
                return self.enqueue_for_review(kind, params, &reason, timestamp);
            }
            PolicyDecision::Allow if options.human_gate => {
                return self.enqueue_for_review(kind, params, "human gate requested", timestamp);
            }
            PolicyDecision::Allow => {}
        }

        if options.dry_run {
            info!("Dry run of {kind}");
            return ActionResult::Success {
                result: json!({ "action": kind, "params": params, "dry_run": true }),
                timestamp,
            };
        }

        self.dispatch(kind, params, token, None, timestamp).await
    }

    fn enqueue_for_review(
        &self,
        kind: ActionKind,
        params: Value,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> ActionResult {
        let review_id = self.queue.enqueue(kind.clone(), params);
        info!("{kind} pending review {review_id}: {reason}");
        ActionResult::Failure(
            ActionFailure::new(
                ErrorKind::PendingReview,
                format!("PENDING_REVIEW: {reason}"),
                timestamp,
            )
            .with_review_id(review_id),
        )
    }

    /// Provider path: lookup, limits, invocation, then one audit entry.
    async fn dispatch(
        &self,
        kind: ActionKind,
        params: Value,
        token: Option<Arc<CapabilityToken>>,
        review_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> ActionResult {
        let outcome = self
            .invoke_provider(&kind, &params, token.as_deref(), timestamp)
            .await;
        let agent_id = token.map_or_else(|| self.agent_id.clone(), |t| t.id.clone());
        self.finish(kind, params, agent_id, review_id, outcome, timestamp)
    }

    async fn invoke_provider(
        &self,
        kind: &ActionKind,
        params: &Value,
        token: Option<&CapabilityToken>,
        timestamp: DateTime<Utc>,
    ) -> Result<Value, ActionFailure> {
        let Some(provider) = self.registry.get(kind) else {
            return Err(ActionFailure::new(
                ErrorKind::MissingTool,
                format!("MISSING_TOOL: no provider registered for {kind}"),
                timestamp,
            )
            .with_missing(vec![kind.to_string()]));
        };

        if let Some(token) = token {
            self.ledger
                .check_and_record(token, kind.cost())
                .map_err(|violation| {
                    ActionFailure::new(violation.kind(), violation.to_string(), timestamp)
                })?;
        }

        info!("Invoking provider for {kind}");
        match AssertUnwindSafe(provider.invoke(params)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(provider_failure(e, timestamp)),
            Err(panic) => Err(ActionFailure::new(
                ErrorKind::ExecutionError,
                format!("provider for {kind} panicked: {}", panic_message(panic.as_ref())),
                timestamp,
            )),
        }
    }

    /// Audits the attempt and shapes the caller-facing result.
    fn finish(
        &self,
        kind: ActionKind,
        params: Value,
        agent_id: String,
        review_id: Option<String>,
        outcome: Result<Value, ActionFailure>,
        timestamp: DateTime<Utc>,
    ) -> ActionResult {
        let entry = match &outcome {
            Ok(_) => AuditEntry::success(kind.clone(), params, agent_id, timestamp),
            Err(failure) => {
                warn!("{kind} failed ({}): {}", failure.kind, failure.error);
                AuditEntry::failure(
                    kind.clone(),
                    params,
                    agent_id,
                    timestamp,
                    failure.kind,
                    failure.error.clone(),
                )
            }
        }
        .with_review_id(review_id.clone());

        if let Err(e) = self.log.append(entry) {
            error!("Audit append failed for {kind}: {e:#}");
            let failure = ActionFailure::new(
                ErrorKind::ExecutionError,
                format!("audit log append failed: {e:#}"),
                timestamp,
            );
            return ActionResult::Failure(match review_id {
                Some(id) => failure.with_review_id(id),
                None => failure,
            });
        }

        match outcome {
            Ok(result) => {
                info!("{kind} succeeded");
                ActionResult::Success { result, timestamp }
            }
            Err(failure) => ActionResult::Failure(match review_id {
                Some(id) => failure.with_review_id(id),
                None => failure,
            }),
        }
    }

    // -- Reviewer interface --

    pub fn list_approvals(&self) -> Vec<ReviewItem> {
        self.queue.list()
    }

    pub fn reset_approvals(&self) -> bool {
        warn!("Resetting review queue");
        self.queue.reset()
    }

    /// Records a reviewer decision. Returns `false` for unknown or
    /// already-resolved ids. Approval runs the captured request once.
    pub async fn resolve(&self, review_id: &str, decision: ReviewDecision, reviewer: &str) -> bool {
        self.review(review_id, decision, reviewer).await.is_some()
    }

    /// Like [`Sandbox::resolve`], but also returns the resolved item and
    /// the result of the approved execution.
    pub async fn review(
        &self,
        review_id: &str,
        decision: ReviewDecision,
        reviewer: &str,
    ) -> Option<ReviewOutcome> {
        let Some(item) = self.queue.resolve(review_id, decision, reviewer) else {
            warn!("Review {review_id} is unknown or already resolved");
            return None;
        };
        let result = match decision {
            ReviewDecision::Deny => None,
            ReviewDecision::Approve => Some(self.execute_approved(&item).await),
        };
        Some(ReviewOutcome { item, result })
    }

    async fn execute_approved(&self, item: &ReviewItem) -> ActionResult {
        let timestamp = Utc::now();
        let token = self.tokens.current();
        if self.is_emergency() {
            warn!("Approved {} ({}) refused: emergency stop active", item.action, item.id);
            let agent_id = token.map_or_else(|| self.agent_id.clone(), |t| t.id.clone());
            let failure = ActionFailure::new(
                ErrorKind::PolicyDeny,
                format!("POLICY_DENY: emergency stop active; {} refused", item.action),
                timestamp,
            );
            return self.finish(
                item.action.clone(),
                item.params.clone(),
                agent_id,
                Some(item.id.clone()),
                Err(failure),
                timestamp,
            );
        }
        info!("Executing approved {} ({})", item.action, item.id);
        self.dispatch(
            item.action.clone(),
            item.params.clone(),
            token,
            Some(item.id.clone()),
            timestamp,
        )
        .await
    }

    // -- Operator interface --

    /// Verifies and attaches `token`, replacing the active one. On error the
    /// previous token stays active.
    pub fn set_capability(&self, token: CapabilityToken) -> Result<(), CapabilityError> {
        let id = token.id.clone();
        match self.tokens.set(token) {
            Ok(()) => {
                info!("Capability token attached: {id}");
                Ok(())
            }
            Err(e) => {
                warn!("Capability token rejected: {e}");
                Err(e)
            }
        }
    }

    pub fn clear_capability(&self) {
        info!("Capability token cleared");
        self.tokens.clear();
    }

    pub fn capability(&self) -> Option<Arc<CapabilityToken>> {
        self.tokens.current()
    }

    /// Issues the named capability pack with the sandbox secret and attaches it.
    pub fn attach_pack(&self, name: &str) -> Result<CapabilityToken, CapabilityError> {
        let pack = self
            .packs
            .get(name)
            .ok_or_else(|| CapabilityError::UnknownPack(name.to_string()))?;
        let token = self.tokens.issue(
            name,
            pack.permissions.iter().cloned(),
            pack.rate_limit,
            pack.budget,
        )?;
        self.set_capability(token.clone())?;
        Ok(token)
    }

    pub fn packs(&self) -> Vec<String> {
        self.packs.keys().cloned().collect()
    }

    pub fn set_emergency(&self, on: bool) {
        if on {
            warn!("Emergency stop engaged");
        } else {
            info!("Emergency stop released");
        }
        self.emergency.store(on, Ordering::SeqCst);
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    // -- Reporting --

    pub fn audit(&self) -> Vec<AuditEntry> {
        self.log.all()
    }

    pub fn verify_audit(&self) -> AuditReport {
        let report = verify_chain(&self.log.all());
        if !report.verified {
            error!("Audit chain broken at entry {:?}", report.first_broken);
        }
        report
    }

    pub fn usage(&self) -> Option<UsageSnapshot> {
        self.tokens.current().map(|t| self.ledger.snapshot(&t))
    }

    pub fn status(&self) -> SandboxStatus {
        let token = self.tokens.current().map(|t| TokenSummary {
            id: t.id.clone(),
            permissions: t.permissions.iter().cloned().collect(),
            rate_limit: t.rate_limit,
            budget: t.budget,
            usage: self.ledger.snapshot(&t),
        });
        SandboxStatus {
            agent_id: self.agent_id.clone(),
            scope: self.scope.clone(),
            emergency: self.is_emergency(),
            token,
            pending_approvals: self.queue.pending_count(),
            audit_entries: self.log.len(),
            providers: self.registry.kinds(),
        }
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.registry
            .iter()
            .map(|p| ProviderInfo {
                kind: p.kind(),
                description: p.description().to_string(),
                missing: p.missing_requirements(),
                parameters: p.parameters_schema(),
            })
            .collect()
    }
}

fn provider_failure(e: ProviderError, timestamp: DateTime<Utc>) -> ActionFailure {
    let kind = e.kind();
    match e {
        ProviderError::MissingTool { missing } => {
            let message = format!("MISSING_TOOL: {}", missing.join(", "));
            ActionFailure::new(kind, message, timestamp).with_missing(missing)
        }
        ProviderError::Failed { message, detail } => {
            ActionFailure::new(kind, message, timestamp).with_detail(detail)
        }
        ProviderError::Internal(e) => ActionFailure::new(kind, format!("{e:#}"), timestamp),
        other => ActionFailure::new(kind, other.to_string(), timestamp),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::approval::ReviewStatus;
    use super::*;
    use crate::config::{ProvidersConfig, StoreConfig};

    const SECRET: &str = "test-secret";

    /// Records how often it was invoked and echoes its params.
    struct CountingProvider {
        kind: ActionKind,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new(kind: ActionKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn kind(&self) -> ActionKind {
            self.kind.clone()
        }
        fn description(&self) -> &str {
            "counting"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            Ok(json!({ "calls": calls, "params": params }))
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl Provider for PanickingProvider {
        fn kind(&self) -> ActionKind {
            ActionKind::Custom("EXPLODE".into())
        }
        fn description(&self) -> &str {
            "panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, _params: &Value) -> Result<Value, ProviderError> {
            panic!("provider blew up");
        }
    }

    struct BrokenLog;

    impl LogStore for BrokenLog {
        fn append(&self, _entry: AuditEntry) -> anyhow::Result<AuditEntry> {
            anyhow::bail!("disk full")
        }
        fn all(&self) -> Vec<AuditEntry> {
            Vec::new()
        }
    }

    fn sandbox_config() -> SandboxConfig {
        SandboxConfig {
            agent_id: "operator@local".into(),
            scope: "sandbox:test".into(),
            secret: SECRET.into(),
            emergency: false,
        }
    }

    fn providers_config(root: &std::path::Path) -> ProvidersConfig {
        ProvidersConfig {
            root: root.to_path_buf(),
            ..ProvidersConfig::default()
        }
    }

    fn sandbox(root: &std::path::Path) -> Sandbox {
        Sandbox::new(
            &sandbox_config(),
            ProviderRegistry::builtin(&providers_config(root)),
        )
    }

    fn token(perms: &[ActionKind], rate_limit: u32, budget: u64) -> CapabilityToken {
        CapabilityToken::issue("agent-basic", perms.iter().cloned(), rate_limit, budget, SECRET)
    }

    #[tokio::test]
    async fn test_token_without_permission_denies_and_skips_audit() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let writer = CountingProvider::new(ActionKind::FileWrite);
        sb.register_provider(writer.clone());
        sb.set_capability(token(&[ActionKind::Log, ActionKind::FileRead], 10, 100))
            .unwrap();

        let result = sb
            .execute(
                ActionKind::FileWrite,
                json!({"path": "x.txt", "data": "hi"}),
                ExecuteOptions::default(),
            )
            .await;

        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyDeny));
        assert!(result.failure().unwrap().error.contains("FILE_WRITE"));
        assert_eq!(writer.calls(), 0);
        assert!(sb.audit().is_empty());
        assert!(sb.list_approvals().is_empty());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_sensitive_action_pends_until_approved_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let transfer = CountingProvider::new(ActionKind::TokenTransfer);
        sb.register_provider(transfer.clone());
        sb.set_capability(token(&[ActionKind::TokenTransfer], 10, 100)).unwrap();

        let params = json!({"to": "0xabc", "amount": 5});
        let result = sb
            .execute(ActionKind::TokenTransfer, params.clone(), ExecuteOptions::default())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PendingReview));
        let review_id = result.review_id().unwrap().to_string();
        assert_eq!(transfer.calls(), 0);
        assert!(sb.audit().is_empty());

        assert!(sb.resolve(&review_id, ReviewDecision::Approve, "alice").await);
        assert_eq!(transfer.calls(), 1);

        let audit = sb.audit();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].outcome);
        assert_eq!(audit[0].review_id.as_deref(), Some(review_id.as_str()));
        assert_eq!(audit[0].params, params);
        assert_eq!(audit[0].agent_id, "agent-basic");

        // Second decision is refused and changes nothing.
        assert!(!sb.resolve(&review_id, ReviewDecision::Deny, "bob").await);
        let item = &sb.list_approvals()[0];
        assert_eq!(item.status, ReviewStatus::Approved);
        assert_eq!(item.reviewed_by.as_deref(), Some("alice"));
        assert_eq!(transfer.calls(), 1);
        assert_eq!(sb.audit().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_review_never_executes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let spawn = CountingProvider::new(ActionKind::SpawnProcess);
        sb.register_provider(spawn.clone());
        sb.set_capability(token(&[ActionKind::SpawnProcess], 10, 100)).unwrap();

        let result = sb
            .execute(ActionKind::SpawnProcess, json!({"cmd": "ls"}), ExecuteOptions::default())
            .await;
        let id = result.review_id().unwrap().to_string();

        let outcome = sb.review(&id, ReviewDecision::Deny, "bob").await.unwrap();
        assert_eq!(outcome.item.status, ReviewStatus::Denied);
        assert!(outcome.result.is_none());
        assert_eq!(spawn.calls(), 0);
        assert!(sb.audit().is_empty());
    }

    #[tokio::test]
    async fn test_no_token_safe_set_only() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());

        let status = sb
            .execute(ActionKind::StatusCheck, json!({}), ExecuteOptions::default())
            .await;
        assert!(status.is_ok());
        assert_eq!(status.result().unwrap()["pid"], std::process::id());

        let write = sb
            .execute(
                ActionKind::FileWrite,
                json!({"path": "a.txt", "data": "x"}),
                ExecuteOptions::default(),
            )
            .await;
        assert_eq!(write.error_kind(), Some(ErrorKind::PolicyDeny));
        assert!(!dir.path().join("a.txt").exists());

        let audit = sb.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, ActionKind::StatusCheck);
        assert_eq!(audit[0].agent_id, "operator@local");
    }

    #[tokio::test]
    async fn test_write_db_without_connection_is_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let sb = Sandbox::new(
            &sandbox_config(),
            ProviderRegistry::builtin(&ProvidersConfig {
                store: StoreConfig { connection: None },
                ..providers_config(dir.path())
            }),
        );
        sb.set_capability(token(&[ActionKind::WriteDb], 10, 100)).unwrap();

        let pending = sb
            .execute(
                ActionKind::WriteDb,
                json!({"key": "k", "value": "v"}),
                ExecuteOptions::default(),
            )
            .await;
        let id = pending.review_id().unwrap().to_string();

        let outcome = sb.review(&id, ReviewDecision::Approve, "alice").await.unwrap();
        let result = outcome.result.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::MissingTool));
        assert_eq!(result.failure().unwrap().missing, vec!["store.connection"]);
        assert_eq!(result.review_id(), Some(id.as_str()));

        let audit = sb.audit();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].outcome);
        assert_eq!(audit[0].error_kind, Some(ErrorKind::MissingTool));
    }

    #[tokio::test]
    async fn test_emergency_denies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let fetch = CountingProvider::new(ActionKind::NetworkFetch);
        sb.register_provider(fetch.clone());
        let mut all = ActionKind::BUILTIN.to_vec();
        all.push(ActionKind::Custom("DEPLOY".into()));
        sb.set_capability(token(&all, 100, 100)).unwrap();
        sb.set_emergency(true);

        for kind in all {
            let result = sb.execute(kind.clone(), json!({}), ExecuteOptions::default()).await;
            assert_eq!(result.error_kind(), Some(ErrorKind::PolicyDeny), "{kind}");
        }
        assert_eq!(fetch.calls(), 0);
        assert!(sb.audit().is_empty());
        assert!(sb.list_approvals().is_empty());

        sb.set_emergency(false);
        let result = sb
            .execute(ActionKind::NetworkFetch, json!({}), ExecuteOptions::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_emergency_at_approval_time_is_audited_denial() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let transfer = CountingProvider::new(ActionKind::TokenTransfer);
        sb.register_provider(transfer.clone());
        sb.set_capability(token(&[ActionKind::TokenTransfer], 10, 100)).unwrap();

        let pending = sb
            .execute(ActionKind::TokenTransfer, json!({}), ExecuteOptions::default())
            .await;
        let id = pending.review_id().unwrap().to_string();
        sb.set_emergency(true);

        let outcome = sb.review(&id, ReviewDecision::Approve, "alice").await.unwrap();
        assert_eq!(
            outcome.result.unwrap().error_kind(),
            Some(ErrorKind::PolicyDeny)
        );
        assert_eq!(transfer.calls(), 0);
        let audit = sb.audit();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].error_kind, Some(ErrorKind::PolicyDeny));
        assert_eq!(audit[0].review_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_dry_run_invokes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let fetch = CountingProvider::new(ActionKind::NetworkFetch);
        sb.register_provider(fetch.clone());
        sb.set_capability(token(&[ActionKind::NetworkFetch], 10, 100)).unwrap();

        let params = json!({"url": "https://example.com"});
        let result = sb
            .execute(ActionKind::NetworkFetch, params.clone(), ExecuteOptions::dry_run())
            .await;
        let echoed = result.result().unwrap();
        assert_eq!(echoed["dry_run"], true);
        assert_eq!(echoed["action"], "NETWORK_FETCH");
        assert_eq!(echoed["params"], params);
        assert_eq!(fetch.calls(), 0);
        assert!(sb.audit().is_empty());
        assert_eq!(sb.usage().unwrap().spent, 0);
    }

    #[tokio::test]
    async fn test_dry_run_still_enforces_policy() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        let result = sb
            .execute(ActionKind::FileWrite, json!({}), ExecuteOptions::dry_run())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyDeny));
    }

    #[tokio::test]
    async fn test_human_gate_queues_allowed_action() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let log = CountingProvider::new(ActionKind::Log);
        sb.register_provider(log.clone());

        let result = sb
            .execute(ActionKind::Log, json!({"message": "hi"}), ExecuteOptions::human_gate())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PendingReview));
        assert_eq!(log.calls(), 0);

        let id = result.review_id().unwrap().to_string();
        let outcome = sb.review(&id, ReviewDecision::Approve, "alice").await.unwrap();
        assert!(outcome.result.unwrap().is_ok());
        assert_eq!(log.calls(), 1);
        assert_eq!(sb.audit().len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_missing_tool_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        let deploy = ActionKind::Custom("DEPLOY".into());
        sb.set_capability(token(&[deploy.clone()], 10, 100)).unwrap();

        let result = sb.execute(deploy, json!({}), ExecuteOptions::default()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::MissingTool));
        assert_eq!(result.failure().unwrap().missing, vec!["DEPLOY"]);
        assert_eq!(sb.audit().len(), 1);
        assert!(!sb.audit()[0].outcome);
    }

    #[tokio::test]
    async fn test_provider_panic_becomes_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        sb.register_provider(Arc::new(PanickingProvider));
        sb.set_capability(token(&[ActionKind::Custom("EXPLODE".into())], 10, 100))
            .unwrap();

        let result = sb
            .execute(ActionKind::Custom("EXPLODE".into()), json!({}), ExecuteOptions::default())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionError));
        assert!(result.failure().unwrap().error.contains("provider blew up"));
        assert_eq!(sb.audit()[0].error_kind, Some(ErrorKind::ExecutionError));
    }

    #[tokio::test]
    async fn test_provider_deny_surfaces_as_policy_deny() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        let result = sb
            .execute(
                ActionKind::FileRead,
                json!({"path": "../../etc/passwd"}),
                ExecuteOptions::default(),
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyDeny));
        assert!(result.failure().unwrap().error.contains("path escapes sandbox"));
        assert_eq!(sb.audit().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_cannot_both_take_last_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let fetch = CountingProvider::new(ActionKind::NetworkFetch);
        sb.register_provider(fetch.clone());
        sb.set_capability(token(&[ActionKind::NetworkFetch], 1, 100)).unwrap();
        let sb = Arc::new(sb);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sb = Arc::clone(&sb);
                tokio::spawn(async move {
                    sb.execute(ActionKind::NetworkFetch, json!({}), ExecuteOptions::default())
                        .await
                })
            })
            .collect();

        let mut ok = 0;
        let mut limited = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            match result.error_kind() {
                None => ok += 1,
                Some(ErrorKind::RateLimitExceeded) => limited += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(limited, 7);
        assert_eq!(fetch.calls(), 1);
        assert_eq!(sb.audit().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_approvals_execute_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let transfer = CountingProvider::new(ActionKind::TokenTransfer);
        sb.register_provider(transfer.clone());
        sb.set_capability(token(&[ActionKind::TokenTransfer], 10, 100)).unwrap();
        let sb = Arc::new(sb);

        let result = sb
            .execute(
                ActionKind::TokenTransfer,
                json!({"to": "0xabc", "amount": 5}),
                ExecuteOptions::default(),
            )
            .await;
        let review_id = result.review_id().unwrap().to_string();

        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|reviewer| {
                let sb = Arc::clone(&sb);
                let review_id = review_id.clone();
                tokio::spawn(async move {
                    sb.resolve(&review_id, ReviewDecision::Approve, reviewer).await
                })
            })
            .collect();

        let mut resolved = 0;
        for handle in handles {
            if handle.await.unwrap() {
                resolved += 1;
            }
        }
        assert_eq!(resolved, 1);
        assert_eq!(transfer.calls(), 1);
        assert_eq!(sb.audit().len(), 1);
        assert_eq!(sb.list_approvals()[0].status, ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let mut sb = sandbox(dir.path());
        let fetch = CountingProvider::new(ActionKind::NetworkFetch);
        sb.register_provider(fetch.clone());
        sb.set_capability(token(&[ActionKind::NetworkFetch], 100, 2)).unwrap();

        for _ in 0..2 {
            let result = sb
                .execute(ActionKind::NetworkFetch, json!({}), ExecuteOptions::default())
                .await;
            assert!(result.is_ok());
        }
        let result = sb
            .execute(ActionKind::NetworkFetch, json!({}), ExecuteOptions::default())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::BudgetExhausted));
        assert_eq!(fetch.calls(), 2);
        assert_eq!(sb.usage().unwrap().remaining_budget, 0);
    }

    #[tokio::test]
    async fn test_audit_failure_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path()).with_stores(Arc::new(MemoryQueue::new()), Arc::new(BrokenLog));
        let result = sb
            .execute(ActionKind::StatusCheck, json!({}), ExecuteOptions::default())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionError));
        assert!(result.failure().unwrap().error.contains("disk full"));
    }

    #[tokio::test]
    async fn test_rejected_token_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.set_capability(token(&[ActionKind::Log], 10, 100)).unwrap();

        let forged = CapabilityToken::issue("agent-albion", [ActionKind::WriteDb], 10, 100, "guess");
        assert!(matches!(
            sb.set_capability(forged),
            Err(CapabilityError::InvalidSignature { .. })
        ));
        assert_eq!(sb.capability().unwrap().id, "agent-basic");

        let no_secret = Sandbox::new(
            &SandboxConfig {
                secret: String::new(),
                ..sandbox_config()
            },
            ProviderRegistry::new(),
        );
        assert_eq!(
            no_secret.set_capability(token(&[ActionKind::Log], 10, 100)),
            Err(CapabilityError::MissingSecret)
        );
    }

    #[tokio::test]
    async fn test_attach_pack() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::parse(&format!(
            r#"
[sandbox]
agent_id = "operator@local"
secret = "{SECRET}"

[providers]
root = "{}"

[capabilities.junior]
permissions = ["LOG", "FILE_READ", "TOKEN_TRANSFER"]
rate_limit = 5
budget = 50
"#,
            dir.path().display()
        ))
        .unwrap();
        let sb = Sandbox::from_config(&config);
        assert_eq!(sb.packs(), vec!["junior"]);

        let token = sb.attach_pack("junior").unwrap();
        assert!(token.verify(SECRET));
        assert_eq!(sb.capability().unwrap().id, "junior");
        assert!(matches!(
            sb.attach_pack("senior"),
            Err(CapabilityError::UnknownPack(_))
        ));

        let status = sb.status();
        let summary = status.token.unwrap();
        assert_eq!(summary.rate_limit, 5);
        assert_eq!(summary.usage.remaining_budget, 50);
    }

    #[tokio::test]
    async fn test_status_and_verified_audit() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        sb.execute(ActionKind::StatusCheck, json!({}), ExecuteOptions::default())
            .await;
        sb.execute(ActionKind::Log, json!({"message": "hello"}), ExecuteOptions::default())
            .await;
        sb.execute(ActionKind::Log, json!({}), ExecuteOptions::human_gate())
            .await;

        let report = sb.verify_audit();
        assert!(report.verified);
        assert_eq!(report.entries, 2);

        let status = sb.status();
        assert_eq!(status.agent_id, "operator@local");
        assert_eq!(status.scope, "sandbox:test");
        assert!(!status.emergency);
        assert!(status.token.is_none());
        assert_eq!(status.pending_approvals, 1);
        assert_eq!(status.audit_entries, 2);
        assert_eq!(status.providers.len(), ActionKind::BUILTIN.len());

        assert!(sb.reset_approvals());
        assert_eq!(sb.status().pending_approvals, 0);
    }

    #[test]
    fn test_provider_listing() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(dir.path());
        let providers = sb.providers();
        let store = providers
            .iter()
            .find(|p| p.kind == ActionKind::WriteDb)
            .unwrap();
        assert_eq!(store.missing, vec!["store.connection"]);
    }

    #[test]
    fn test_sandbox_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Sandbox>();
    }
}
