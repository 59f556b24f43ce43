//! Caller authentication.
//!
//! Resolution order:
//! - no credential: the fixed anonymous identity
//! - credential not of the form `Bearer <value>`: malformed
//! - `<value>` with the opaque token prefix: looked up in the token store
//! - anything else: a provider token, resolved through the provider profile
//!
//! Browsers cannot set headers on a WebSocket handshake, so an upgrade
//! request without `Authorization` may carry the credential in the `auth`
//! query parameter instead.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::oauth::{self, IdentityProvider};
use crate::tokens::{self, TokenManager};
use crate::{Error, Result};

/// Query parameter carrying the credential on WebSocket upgrades.
pub const WEBSOCKET_AUTH_PARAM: &str = "auth";

/// Resolves request credentials to identities.
pub struct Authenticator {
    tokens: Arc<TokenManager>,
    provider: Arc<dyn IdentityProvider>,
    default_group: String,
}

impl Authenticator {
    /// Create an authenticator.
    pub fn new(
        tokens: Arc<TokenManager>,
        provider: Arc<dyn IdentityProvider>,
        default_group: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            provider,
            default_group: default_group.into(),
        }
    }

    /// Resolve the identity behind a request's credential material.
    pub async fn authenticate(&self, headers: &HeaderMap, uri: &Uri) -> Result<Identity> {
        let Some(credential) = credential(headers, uri)? else {
            return Ok(Identity::anonymous());
        };

        let Some(bearer) = credential
            .strip_prefix("Bearer ")
            .or_else(|| credential.strip_prefix("bearer "))
        else {
            return Err(Error::Malformed(
                "expected Authorization: Bearer <token>".to_string(),
            ));
        };

        if tokens::is_opaque(bearer) {
            return self.tokens.resolve(bearer).await;
        }

        oauth::resolve_identity(self.provider.as_ref(), bearer, &self.default_group).await
    }
}

/// The raw credential of a request, if any.
///
/// An empty `Authorization` header counts as absent.
fn credential(headers: &HeaderMap, uri: &Uri) -> Result<Option<String>> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| Error::Malformed("Authorization header is not ASCII".to_string()))?;
        if !value.is_empty() {
            return Ok(Some(value.to_string()));
        }
    }

    if is_websocket_upgrade(headers) {
        let from_query = uri.query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, _)| k == WEBSOCKET_AUTH_PARAM)
                .map(|(_, v)| v.into_owned())
        });
        return Ok(from_query.filter(|v| !v.is_empty()));
    }

    Ok(None)
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Authentication middleware.
///
/// Inserts the resolved [`Identity`] into request extensions; rejects the
/// request before any handler runs if resolution fails.
pub async fn auth_middleware(
    State(authenticator): State<Arc<Authenticator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authenticator
        .authenticate(request.headers(), request.uri())
        .await
    {
        Ok(identity) => {
            debug!(path = %path, user = %identity.username, "Authenticated request");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Authentication failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::oauth::Profile;
    use crate::oauth::testing::{StaticProvider, provider_token};
    use crate::store::MemoryTokenStore;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn alice() -> Identity {
        Identity {
            uid: "alice".to_string(),
            username: "alice".to_string(),
            groups: vec!["team-x".to_string()],
            extra: BTreeMap::new(),
        }
    }

    fn authenticator() -> (Authenticator, Arc<TokenManager>) {
        let tokens = Arc::new(TokenManager::new(
            Arc::new(MemoryTokenStore::new()),
            TokenConfig::default(),
        ));
        let mut provider = StaticProvider::default();
        provider.profiles.insert(
            "u-9".to_string(),
            Profile {
                id: "u-9".to_string(),
                name: "dave".to_string(),
                ..Profile::default()
            },
        );
        (
            Authenticator::new(Arc::clone(&tokens), Arc::new(provider), "competitors"),
            tokens,
        )
    }

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    fn root() -> Uri {
        Uri::from_static("/api/v1/pods")
    }

    #[tokio::test]
    async fn no_credential_is_anonymous() {
        let (auth, _) = authenticator();
        let identity = auth.authenticate(&HeaderMap::new(), &root()).await.unwrap();
        assert_eq!(identity, Identity::anonymous());
    }

    #[tokio::test]
    async fn non_bearer_credential_is_malformed() {
        let (auth, _) = authenticator();
        let result = auth.authenticate(&headers("Basic dXNlcjpwYXNz"), &root()).await;
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn issued_opaque_token_round_trips() {
        // GIVEN: a token issued for alice
        let (auth, tokens) = authenticator();
        let token = tokens.issue(&alice()).await.unwrap();

        // WHEN: it is presented
        let identity = auth
            .authenticate(&headers(&format!("Bearer {token}")), &root())
            .await
            .unwrap();

        // THEN: alice's identity comes back verbatim
        assert_eq!(identity, alice());
    }

    #[tokio::test]
    async fn unknown_opaque_token_is_invalid() {
        let (auth, _) = authenticator();
        let result = auth
            .authenticate(&headers("Bearer sk:alice:abc123"), &root())
            .await;
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn opaque_prefix_wins_over_jwt_shape() {
        // GIVEN: a value that starts with the opaque prefix but is also JWT-shaped
        let (auth, _) = authenticator();
        let jwt_like = format!("sk:{}", provider_token(&json!({"userId": "u-9"})));

        // WHEN/THEN: it is looked up in the store, not sent to the provider
        let result = auth
            .authenticate(&headers(&format!("Bearer {jwt_like}")), &root())
            .await;
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn provider_token_resolves_with_default_group() {
        let (auth, _) = authenticator();
        let token = provider_token(&json!({"userId": "u-9"}));

        let identity = auth
            .authenticate(&headers(&format!("Bearer {token}")), &root())
            .await
            .unwrap();

        assert_eq!(identity.uid, "u-9");
        assert_eq!(identity.username, "u-9");
        assert_eq!(identity.groups, vec!["competitors"]);
        assert_eq!(identity.extra["name"], "dave");
    }

    #[tokio::test]
    async fn garbage_provider_token_is_malformed() {
        let (auth, _) = authenticator();
        let result = auth.authenticate(&headers("Bearer not-a-jwt"), &root()).await;
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[tokio::test]
    async fn every_successful_path_yields_groups() {
        let (auth, tokens) = authenticator();
        let opaque = tokens.issue(&alice()).await.unwrap();
        let provider = provider_token(&json!({"userId": "u-9"}));

        for credential in [None, Some(opaque), Some(provider)] {
            let request_headers =
                credential.map_or_else(HeaderMap::new, |c| headers(&format!("Bearer {c}")));
            let identity = auth.authenticate(&request_headers, &root()).await.unwrap();
            assert!(!identity.groups.is_empty());
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_reads_auth_query() {
        // GIVEN: an upgrade request carrying the credential in the query
        let (auth, tokens) = authenticator();
        let token = tokens.issue(&alice()).await.unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("auth", &format!("Bearer {token}"))
            .append_pair("follow", "true")
            .finish();
        let uri: Uri = format!("/api/v1/namespaces/x/pods/p/log?{query}").parse().unwrap();

        // WHEN/THEN: it authenticates as alice
        assert_eq!(auth.authenticate(&headers, &uri).await.unwrap(), alice());
    }

    #[tokio::test]
    async fn auth_query_is_ignored_without_upgrade() {
        let (auth, tokens) = authenticator();
        let token = tokens.issue(&alice()).await.unwrap();
        let uri: Uri = format!("/api?auth=Bearer%20{token}").parse().unwrap();

        let identity = auth.authenticate(&HeaderMap::new(), &uri).await.unwrap();

        assert!(identity.is_anonymous());
    }
}
