//! Opaque API token lifecycle.
//!
//! Tokens have the textual form `sk:<owner>:<random>`. The owner segment
//! makes every token listable and countable by a prefix scan, so the store
//! needs no secondary index. The value stored under a token is the encoded
//! [`Identity`] it grants; tokens are never mutated, only issued or deleted.
//!
//! The per-owner quota is checked by counting before storing. Two concurrent
//! issuances for one owner can both pass the check; the bound is best-effort.

pub mod audit;
pub mod handler;

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::{debug, warn};

use crate::config::TokenConfig;
use crate::identity::Identity;
use crate::store::TokenStore;
use crate::{Error, Result};

use audit::AuditEvent;

pub use handler::token_routes;

/// Reserved prefix of every opaque token.
pub const TOKEN_PREFIX: &str = "sk:";

/// Whether a bearer value is an opaque token rather than a provider token.
#[must_use]
pub fn is_opaque(bearer: &str) -> bool {
    bearer.starts_with(TOKEN_PREFIX)
}

/// Key prefix under which `owner`'s tokens live.
#[must_use]
pub fn owner_prefix(owner: &str) -> String {
    format!("{TOKEN_PREFIX}{owner}:")
}

/// The caller's owner, refusing callers that have none. An empty owner
/// would otherwise widen every scoped operation to all tokens.
fn scoped_owner(identity: &Identity) -> Result<&str> {
    let owner = identity.owner();
    if owner.is_empty() {
        return Err(Error::Unauthenticated);
    }
    Ok(owner)
}

/// Generate `sk:<owner>:<suffix>` with a random URL-safe suffix of `length`
/// characters.
#[must_use]
pub fn generate_token(owner: &str, length: usize) -> String {
    let mut suffix = String::with_capacity(length + 43);
    while suffix.len() < length {
        let random_bytes: [u8; 32] = rand::random();
        suffix.push_str(&URL_SAFE_NO_PAD.encode(random_bytes));
    }
    suffix.truncate(length);
    format!("{}{suffix}", owner_prefix(owner))
}

/// Issues, enumerates, revokes and resolves opaque tokens.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
}

impl TokenManager {
    /// Create a manager over `store`.
    pub fn new(store: Arc<dyn TokenStore>, config: TokenConfig) -> Self {
        Self { store, config }
    }

    /// The backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Issue a new token granting `identity`.
    ///
    /// # Errors
    ///
    /// [`Error::QuotaExceeded`] when the owner already holds the configured
    /// maximum; store errors otherwise.
    pub async fn issue(&self, identity: &Identity) -> Result<String> {
        identity.validate()?;

        let owner = scoped_owner(identity)?;
        let existing = self.store.list(&owner_prefix(owner)).await?.len();
        if existing >= self.config.max_per_user {
            warn!(
                owner = %owner,
                active = existing,
                max = self.config.max_per_user,
                "Max tokens per owner exceeded"
            );
            audit::emit(&AuditEvent::denied(
                format!("max tokens per owner ({}) exceeded", self.config.max_per_user),
                identity,
            ));
            return Err(Error::QuotaExceeded {
                max: self.config.max_per_user,
            });
        }

        let token = generate_token(owner, self.config.length);
        self.store
            .store(&token, &identity.encode()?, self.config.expiration)
            .await?;

        audit::emit(&AuditEvent::issued(&token, identity));
        Ok(token)
    }

    /// Every live token scoped to `owner`, sorted.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] for an empty owner.
    pub async fn list(&self, owner: &str) -> Result<Vec<String>> {
        if owner.is_empty() {
            return Err(Error::Unauthenticated);
        }
        let mut tokens = self.store.list(&owner_prefix(owner)).await?;
        tokens.sort_unstable();
        Ok(tokens)
    }

    /// Delete `token`. Deleting an unknown token succeeds.
    ///
    /// With `enforce_revoke_ownership` the token must sit under the caller's
    /// owner prefix, otherwise [`Error::Forbidden`].
    /// A caller without an owner is [`Error::Unauthenticated`].
    pub async fn revoke(&self, caller: &Identity, token: &str) -> Result<()> {
        let owner = scoped_owner(caller)?;
        if self.config.enforce_revoke_ownership && !token.starts_with(&owner_prefix(owner))
        {
            audit::emit(&AuditEvent::denied("token not owned by caller", caller));
            return Err(Error::Forbidden(
                "token is not owned by the caller".to_string(),
            ));
        }

        self.store.delete(token).await?;
        audit::emit(&AuditEvent::revoked(token, caller));
        Ok(())
    }

    /// Resolve an opaque token to the identity it grants.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] when the token is unknown, expired or its record
    /// cannot be decoded. Backend failures propagate unchanged.
    pub async fn resolve(&self, token: &str) -> Result<Identity> {
        let raw = match self.store.load(token).await {
            Ok(raw) => raw,
            Err(Error::NotFound) => {
                audit::emit(&AuditEvent::invalid(token, "not found"));
                return Err(Error::Invalid("unknown or expired token".to_string()));
            }
            Err(e) => return Err(e),
        };

        let identity = Identity::decode(&raw)
            .and_then(|identity| identity.validate().map(|()| identity))
            .map_err(|e| {
                audit::emit(&AuditEvent::invalid(token, e.to_string()));
                Error::Invalid("unreadable token record".to_string())
            })?;

        debug!(owner = %identity.owner(), "Resolved opaque token");
        audit::emit(&AuditEvent::used(token, &identity));
        Ok(identity)
    }
}
