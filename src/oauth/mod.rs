//! OAuth identity provider boundary.
//!
//! The provider is consumed through two calls: exchange an authorization code
//! for a provider token, and look up the profile behind a provider token.
//! Provider tokens are three-part dot-separated tokens whose payload carries a
//! `userId` claim; that claim is the subject id the profile is fetched for.
//!
//! - [`HttpIdentityProvider`]: the real provider over `reqwest`
//! - [`callback`]: browser redirect flow with CSRF state verification

pub mod callback;
mod client;

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::{Error, Result};

pub use callback::{OAuthFlow, StateStore, oauth_routes};
pub use client::HttpIdentityProvider;

/// Profile returned by the provider's user endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Subject id
    pub id: String,
    /// Login name
    pub name: String,
    /// Email address
    pub email: String,
    /// Real name
    pub realname: String,
    /// Phone number
    pub telephone: String,
    /// School
    pub school: String,
    /// Grade
    #[serde(rename = "studentGrade")]
    pub student_grade: String,
    /// Verified attributes
    pub verified: Vec<String>,
}

impl Profile {
    /// Build the impersonated identity for subject `uid`.
    ///
    /// The username is the subject id and the only group is `default_group`.
    #[must_use]
    pub fn into_identity(self, uid: &str, default_group: &str) -> Identity {
        let extra = BTreeMap::from([
            ("name".to_string(), self.name),
            ("email".to_string(), self.email),
            ("realname".to_string(), self.realname),
            ("telephone".to_string(), self.telephone),
            ("school".to_string(), self.school),
            ("studentGrade".to_string(), self.student_grade),
        ]);

        Identity {
            uid: uid.to_string(),
            username: uid.to_string(),
            groups: vec![default_group.to_string()],
            extra,
        }
    }
}

/// The external identity provider.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Authorization endpoint URL carrying `state`.
    fn authorize_url(&self, state: &str) -> Result<String>;

    /// Exchange an authorization code for a provider token.
    async fn exchange_code(&self, code: &str) -> Result<String>;

    /// Look up the profile of subject `uid` with the provider token.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] when the provider rejects the token.
    async fn fetch_profile(&self, token: &str, uid: &str) -> Result<Profile>;
}

#[derive(Deserialize)]
struct Claims {
    #[serde(rename = "userId")]
    user_id: serde_json::Value,
}

/// Extract the `userId` claim from a provider token.
///
/// The signature is not checked; the provider validates the token when the
/// profile is fetched with it.
///
/// # Errors
///
/// [`Error::Malformed`] unless the token has exactly three parts, the middle
/// part is unpadded base64url JSON, and `userId` is a string.
pub fn extract_user_id(token: &str) -> Result<String> {
    let parts: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = parts.as_slice() else {
        return Err(Error::Malformed("provider token is not a JWT".to_string()));
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Malformed(format!("failed to decode payload: {e}")))?;
    let claims: Claims = serde_json::from_slice(&decoded)
        .map_err(|e| Error::Malformed(format!("failed to parse payload: {e}")))?;

    match claims.user_id {
        serde_json::Value::String(uid) => Ok(uid),
        _ => Err(Error::Malformed("userId claim is not a string".to_string())),
    }
}

/// Resolve a provider token to an identity.
///
/// An empty `userId` claim, or a profile with neither an id nor a name, is
/// [`Error::Invalid`]: only the anonymous identity has no uid. Every other
/// failure of the provider surfaces as [`Error::Invalid`] too, so a caller
/// cannot tell a revoked token from an unreachable provider.
pub async fn resolve_identity(
    provider: &dyn IdentityProvider,
    token: &str,
    default_group: &str,
) -> Result<Identity> {
    let uid = extract_user_id(token)?;
    if uid.is_empty() {
        return Err(Error::Invalid("provider token has an empty userId".to_string()));
    }

    let profile = provider.fetch_profile(token, &uid).await.map_err(|e| match e {
        Error::Invalid(msg) => Error::Invalid(msg),
        other => Error::Invalid(format!("profile lookup failed: {other}")),
    })?;

    if profile.id.is_empty() && profile.name.is_empty() {
        return Err(Error::Invalid("profile has neither id nor name".to_string()));
    }

    Ok(profile.into_identity(&uid, default_group))
}


#[cfg(test)]
mod tests {
    use super::testing::{StaticProvider, provider_token};
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn extracts_string_user_id() {
        let token = provider_token(&json!({"userId": "u-42", "exp": 1}));
        assert_eq!(extract_user_id(&token).unwrap(), "u-42");
    }

    #[test]
    fn rejects_wrong_part_count() {
        assert!(matches!(extract_user_id("a.b"), Err(Error::Malformed(_))));
        assert!(matches!(extract_user_id("a.b.c.d"), Err(Error::Malformed(_))));
    }

    #[test]
    fn rejects_padded_or_non_base64_payload() {
        assert!(matches!(
            extract_user_id("a.!!!.c"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn rejects_numeric_or_missing_claim() {
        let numeric = provider_token(&json!({"userId": 42}));
        let missing = provider_token(&json!({"sub": "x"}));
        assert!(matches!(extract_user_id(&numeric), Err(Error::Malformed(_))));
        assert!(matches!(extract_user_id(&missing), Err(Error::Malformed(_))));
    }

    #[test]
    fn profile_maps_to_identity_extra() {
        let profile = Profile {
            id: "u-1".to_string(),
            name: "bob".to_string(),
            email: "bob@example.com".to_string(),
            student_grade: "2024".to_string(),
            ..Profile::default()
        };

        let identity = profile.into_identity("u-1", "competitors");

        assert_eq!(identity.uid, "u-1");
        assert_eq!(identity.username, "u-1");
        assert_eq!(identity.groups, vec!["competitors"]);
        assert_eq!(identity.extra["email"], "bob@example.com");
        assert_eq!(identity.extra["studentGrade"], "2024");
        assert_eq!(identity.extra.len(), 6);
    }

    #[test]
    fn profile_deserializes_provider_field_names() {
        let profile: Profile = serde_json::from_value(json!({
            "id": "u-1",
            "name": "bob",
            "studentGrade": "3",
            "verified": ["email"]
        }))
        .unwrap();
        assert_eq!(profile.student_grade, "3");
        assert_eq!(profile.verified, vec!["email"]);
        assert!(profile.email.is_empty());
    }

    #[tokio::test]
    async fn resolve_identity_with_empty_extra_still_has_group() {
        // GIVEN: a profile with only a name
        let mut provider = StaticProvider::default();
        provider.profiles.insert(
            "u-7".to_string(),
            Profile {
                name: "carol".to_string(),
                ..Profile::default()
            },
        );
        let token = provider_token(&json!({"userId": "u-7"}));

        // WHEN: resolved
        let identity = resolve_identity(&provider, &token, "competitors").await.unwrap();

        // THEN: the default group is always present
        assert_eq!(identity.groups, vec!["competitors"]);
        assert!(identity.validate().is_ok());
    }

    #[tokio::test]
    async fn resolve_identity_rejects_empty_profile() {
        let mut provider = StaticProvider::default();
        provider
            .profiles
            .insert("u-8".to_string(), Profile::default());
        let token = provider_token(&json!({"userId": "u-8"}));

        assert!(matches!(
            resolve_identity(&provider, &token, "g").await,
            Err(Error::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn resolve_identity_rejects_empty_user_id() {
        // GIVEN: a provider that would answer for the empty subject
        let mut provider = StaticProvider::default();
        provider.profiles.insert(
            String::new(),
            Profile {
                name: "mallory".to_string(),
                ..Profile::default()
            },
        );
        let token = provider_token(&json!({"userId": ""}));

        // WHEN: the token is resolved
        let result = resolve_identity(&provider, &token, "competitors").await;

        // THEN: it never becomes an identity without an owner
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn resolve_identity_maps_provider_failure_to_invalid() {
        let provider = StaticProvider::default();
        let token = provider_token(&json!({"userId": "unknown"}));

        assert!(matches!(
            resolve_identity(&provider, &token, "g").await,
            Err(Error::Invalid(_))
        ));
    }
}
