//! Audit logging for opaque token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A new opaque token is stored |
//! | `token.used` | An opaque token authenticated a request |
//! | `token.revoked` | A token was deleted via `DELETE /_/tokens/{token}` |
//! | `token.denied` | Issuance or revocation was refused |
//! | `token.invalid` | A presented token was unknown, expired or unreadable |
//!
//! Token values are never logged in full; see [`redact`].

use serde::Serialize;

use crate::identity::Identity;

/// Structured audit event emitted for every token lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Owner prefix the token is scoped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Username of the acting identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Redacted token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Human-readable reason for denial or error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            owner: None,
            username: None,
            token: None,
            reason: None,
        }
    }

    fn with_identity(mut self, identity: &Identity) -> Self {
        self.owner = Some(identity.owner().to_string());
        self.username = Some(identity.username.clone());
        self
    }

    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(token: &str, identity: &Identity) -> Self {
        let mut ev = Self::new("token.issued").with_identity(identity);
        ev.token = Some(redact(token));
        ev
    }

    /// Construct a `token.used` event.
    #[must_use]
    pub fn used(token: &str, identity: &Identity) -> Self {
        let mut ev = Self::new("token.used").with_identity(identity);
        ev.token = Some(redact(token));
        ev
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(token: &str, caller: &Identity) -> Self {
        let mut ev = Self::new("token.revoked").with_identity(caller);
        ev.token = Some(redact(token));
        ev
    }

    /// Construct a `token.denied` event (quota or ownership).
    #[must_use]
    pub fn denied(reason: impl Into<String>, caller: &Identity) -> Self {
        let mut ev = Self::new("token.denied").with_identity(caller);
        ev.reason = Some(reason.into());
        ev
    }

    /// Construct a `token.invalid` event.
    #[must_use]
    pub fn invalid(token: &str, reason: impl Into<String>) -> Self {
        let mut ev = Self::new("token.invalid");
        ev.token = Some(redact(token));
        ev.reason = Some(reason.into());
        ev
    }
}

/// Keep the owner prefix and the last four characters of a token.
///
/// `sk:alice:AbCdEf…wxyz` becomes `sk:alice:…wxyz`.
#[must_use]
pub fn redact(token: &str) -> String {
    let (scope, secret) = match token.rfind(':') {
        Some(idx) => token.split_at(idx + 1),
        None => ("", token),
    };
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        format!("{scope}…")
    } else {
        format!("{scope}…{tail}")
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO kube_auth_proxy::tokens::audit audit={"event":"token.issued","owner":"alice",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "token audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn alice() -> Identity {
        Identity {
            uid: "alice".to_string(),
            username: "alice".to_string(),
            groups: vec!["team-x".to_string()],
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn redact_keeps_scope_and_tail() {
        assert_eq!(redact("sk:alice:abcdefghij"), "sk:alice:…ghij");
        assert_eq!(redact("sk:alice:ab"), "sk:alice:…");
        assert_eq!(redact("opaque"), "…aque");
    }

    #[test]
    fn issued_event_never_contains_full_token() {
        // GIVEN: a freshly issued token
        let token = "sk:alice:SECRETSECRETSECRET1234";

        // WHEN: the audit event is serialized
        let json = serde_json::to_string(&AuditEvent::issued(token, &alice())).unwrap();

        // THEN: the secret part is not present
        assert!(json.contains("token.issued"));
        assert!(json.contains("\"owner\":\"alice\""));
        assert!(!json.contains("SECRETSECRET"));
    }

    #[test]
    fn denied_event_contains_reason() {
        let event = AuditEvent::denied("quota", &alice());
        assert_eq!(event.event, "token.denied");
        assert_eq!(event.reason.as_deref(), Some("quota"));
        assert!(event.token.is_none());
    }

    #[test]
    fn invalid_event_has_no_identity() {
        let event = AuditEvent::invalid("sk:x:abcdef", "not found");
        assert_eq!(event.event, "token.invalid");
        assert!(event.owner.is_none());
    }
}
