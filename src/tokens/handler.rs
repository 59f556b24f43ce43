//! HTTP handlers for token management.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/_/tokens` | List the caller's tokens |
//! | `POST` | `/_/tokens` | Issue a token granting the caller's identity |
//! | `DELETE` | `/_/tokens/{token}` | Revoke a token by its exact value |
//!
//! The caller's [`Identity`] is resolved by the gateway's authentication
//! middleware and read from request extensions. Anonymous callers, and any
//! identity without a uid or username, have no owner to scope tokens to and
//! are rejected with `401`.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    routing::{delete, get},
};
use serde::Serialize;

use super::TokenManager;
use crate::identity::Identity;
use crate::{Error, Result};

/// `GET /_/tokens` response.
#[derive(Debug, Serialize)]
pub struct TokenList {
    /// Never `null`; empty when the caller holds no tokens.
    pub tokens: Vec<String>,
}

/// `POST /_/tokens` response.
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    /// The new opaque token.
    pub token: String,
}

/// `DELETE /_/tokens/{token}` response.
#[derive(Debug, Serialize)]
pub struct RevokeStatus {
    /// Always `"success"`.
    pub status: &'static str,
}

/// Build the token management routes.
pub fn token_routes(manager: Arc<TokenManager>) -> Router {
    Router::new()
        .route("/_/tokens", get(list_tokens).post(create_token))
        .route("/_/tokens/{token}", delete(revoke_token))
        .with_state(manager)
}

fn require_authenticated(identity: &Identity) -> Result<()> {
    if identity.is_anonymous() || identity.owner().is_empty() {
        return Err(Error::Unauthenticated);
    }
    Ok(())
}

async fn list_tokens(
    State(manager): State<Arc<TokenManager>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<TokenList>> {
    require_authenticated(&identity)?;
    let tokens = manager.list(identity.owner()).await?;
    Ok(Json(TokenList { tokens }))
}

async fn create_token(
    State(manager): State<Arc<TokenManager>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<IssuedToken>> {
    require_authenticated(&identity)?;
    let token = manager.issue(&identity).await?;
    Ok(Json(IssuedToken { token }))
}

async fn revoke_token(
    State(manager): State<Arc<TokenManager>>,
    Extension(identity): Extension<Identity>,
    Path(token): Path<String>,
) -> Result<Json<RevokeStatus>> {
    require_authenticated(&identity)?;
    manager.revoke(&identity, &token).await?;
    Ok(Json(RevokeStatus { status: "success" }))
}
