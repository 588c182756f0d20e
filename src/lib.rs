//! capgate: a capability-gated action-execution sandbox.
//!
//! Agents never touch the filesystem, network, store or process table
//! directly. They call [`Sandbox::execute`], which runs each request past
//! the policy engine, the review queue and the token's limits before the
//! matching [`Provider`] performs the side effect.

pub mod action;
pub mod config;
pub mod console;
pub mod providers;
pub mod sandbox;

pub use action::{ActionFailure, ActionKind, ActionResult, ErrorKind};
pub use config::Config;
pub use providers::{Provider, ProviderError, ProviderRegistry};
pub use sandbox::approval::{ReviewDecision, ReviewItem, ReviewStatus};
pub use sandbox::audit::{AuditEntry, AuditReport};
pub use sandbox::capability::{CapabilityError, CapabilityToken};
pub use sandbox::{ExecuteOptions, Sandbox, SandboxStatus};
