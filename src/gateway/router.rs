//! HTTP router and handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Extension, Json, Router, middleware, routing::get};
use serde::Serialize;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{Authenticator, auth_middleware};
use super::proxy::{UpstreamTransport, proxy_handler};
use crate::identity::Identity;
use crate::oauth::{OAuthFlow, oauth_routes};
use crate::tokens::{TokenManager, token_routes};

/// Shared application state
pub struct AppState {
    /// Credential resolution
    pub authenticator: Arc<Authenticator>,
    /// Opaque token lifecycle
    pub tokens: Arc<TokenManager>,
    /// Upstream client
    pub transport: Arc<UpstreamTransport>,
    /// Browser login flow
    pub oauth: Arc<OAuthFlow>,
}

/// `GET /_/whoami` response.
#[derive(Debug, Serialize)]
pub struct WhoAmI {
    /// Stable id; empty for anonymous
    pub uid: String,
    /// Login name
    pub username: String,
    /// Group memberships
    pub groups: Vec<String>,
    /// Profile attributes
    pub extra: BTreeMap<String, String>,
}

impl From<Identity> for WhoAmI {
    fn from(identity: Identity) -> Self {
        Self {
            uid: identity.uid,
            username: identity.username,
            groups: identity.groups,
            extra: identity.extra,
        }
    }
}

/// Create the router
///
/// `/_/healthz` and the OAuth flow are served without authentication.
/// Everything else passes the authentication middleware first: the whoami
/// and token endpoints are local, any other path is proxied upstream.
pub fn create_router(state: &AppState) -> Router {
    let authenticated = Router::new()
        .route("/_/whoami", get(whoami_handler))
        .fallback(proxy_handler)
        .with_state(Arc::clone(&state.transport))
        .merge(token_routes(Arc::clone(&state.tokens)))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.authenticator),
            auth_middleware,
        ));

    Router::new()
        .route("/_/healthz", get(health_handler))
        .merge(oauth_routes(Arc::clone(&state.oauth)))
        .fallback_service(authenticated)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Health check handler
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Resolved identity of the caller
async fn whoami_handler(Extension(identity): Extension<Identity>) -> Json<WhoAmI> {
    Json(WhoAmI::from(identity))
}
