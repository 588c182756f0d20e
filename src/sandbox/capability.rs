//! Capability tokens: signed grants of action kinds plus consumption limits.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::action::ActionKind;

type HmacSha256 = Hmac<Sha256>;

/// Why a token could not be attached.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("no signing secret configured; tokens cannot be verified")]
    MissingSecret,

    #[error("capability token {id} has an invalid signature")]
    InvalidSignature { id: String },

    #[error("unknown capability pack: {0}")]
    UnknownPack(String),
}

/// A scoped grant of permitted action kinds plus consumption limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: String,
    pub permissions: BTreeSet<ActionKind>,
    /// Maximum actions per rolling minute.
    pub rate_limit: u32,
    /// Maximum cumulative cost units.
    pub budget: u64,
    /// Hex HMAC-SHA256 of [`CapabilityToken::signing_payload`].
    pub signature: String,
}

impl CapabilityToken {
    /// Creates and signs a token with the issuing secret.
    pub fn issue(
        id: impl Into<String>,
        permissions: impl IntoIterator<Item = ActionKind>,
        rate_limit: u32,
        budget: u64,
        secret: &str,
    ) -> Self {
        let mut token = Self {
            id: id.into(),
            permissions: permissions.into_iter().collect(),
            rate_limit,
            budget,
            signature: String::new(),
        };
        token.signature = hex::encode(token.mac(secret).finalize().into_bytes());
        token
    }

    /// Bytes covered by the signature: the id, the sorted permission set,
    /// the rate limit and the budget.
    pub fn signing_payload(&self) -> String {
        let permissions: Vec<&str> = self.permissions.iter().map(ActionKind::as_str).collect();
        format!(
            "{}\n{}\n{}\n{}",
            self.id,
            permissions.join(","),
            self.rate_limit,
            self.budget
        )
    }

    fn mac(&self, secret: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(self.signing_payload().as_bytes());
        mac
    }

    /// Constant-time signature check against `secret`.
    pub fn verify(&self, secret: &str) -> bool {
        match hex::decode(&self.signature) {
            Ok(signature) => self.mac(secret).verify_slice(&signature).is_ok(),
            Err(_) => false,
        }
    }

    pub fn permits(&self, kind: &ActionKind) -> bool {
        self.permissions.contains(kind)
    }
}

/// Holds zero or one verified token.
///
/// Readers get an `Arc` snapshot, so a dispatch in flight keeps the token
/// it started with while a replacement is attached.
pub struct TokenStore {
    secret: Option<String>,
    active: RwLock<Option<Arc<CapabilityToken>>>,
}

impl TokenStore {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            active: RwLock::new(None),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Verifies `token` and makes it the active token. On error the
    /// previously active token stays in place.
    pub fn set(&self, token: CapabilityToken) -> Result<(), CapabilityError> {
        let secret = self.secret.as_deref().ok_or(CapabilityError::MissingSecret)?;
        if !token.verify(secret) {
            return Err(CapabilityError::InvalidSignature { id: token.id });
        }
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = Some(Arc::new(token));
        Ok(())
    }

    /// Issues a token signed with this store's secret.
    pub fn issue(
        &self,
        id: impl Into<String>,
        permissions: impl IntoIterator<Item = ActionKind>,
        rate_limit: u32,
        budget: u64,
    ) -> Result<CapabilityToken, CapabilityError> {
        let secret = self.secret.as_deref().ok_or(CapabilityError::MissingSecret)?;
        Ok(CapabilityToken::issue(id, permissions, rate_limit, budget, secret))
    }

    pub fn clear(&self) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = None;
    }

    pub fn current(&self) -> Option<Arc<CapabilityToken>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
