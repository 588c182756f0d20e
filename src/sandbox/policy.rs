//! Policy engine: decides whether an action may run, must be reviewed, or is refused.
//!
//! Pure function of its inputs. The dispatcher passes in a snapshot of the
//! active token and the emergency flag, so nothing here reads shared state.

use crate::action::ActionKind;

use super::capability::CapabilityToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
    Review { reason: String },
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Evaluate `kind` against the active token and emergency flag.
///
/// Rules, first match wins:
/// 1. emergency stop denies everything
/// 2. without a token only the minimal safe kinds are allowed
/// 3. kinds outside the token's permissions are denied
/// 4. sensitive kinds go to human review
/// 5. everything else is allowed
pub fn evaluate(
    kind: &ActionKind,
    token: Option<&CapabilityToken>,
    emergency: bool,
) -> PolicyDecision {
    if emergency {
        return PolicyDecision::Deny {
            reason: format!("emergency stop active; {kind} refused"),
        };
    }

    let Some(token) = token else {
        if kind.is_minimal_safe() {
            return PolicyDecision::Allow;
        }
        return PolicyDecision::Deny {
            reason: format!("{kind} requires a capability token"),
        };
    };

    if !token.permits(kind) {
        return PolicyDecision::Deny {
            reason: format!("token {} does not grant {kind}", token.id),
        };
    }

    if kind.is_sensitive() {
        return PolicyDecision::Review {
            reason: format!("{kind} is sensitive and needs human approval"),
        };
    }

    PolicyDecision::Allow
}
