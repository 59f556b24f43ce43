//! Browser redirect flow.
//!
//! `/_/oauth/redirect` sends the browser to the provider with a fresh random
//! state. `/_/oauth/callback` only exchanges the code if it comes back with a
//! state we issued, that has not expired and has not been used before.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    response::Redirect,
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{IdentityProvider, Profile, extract_user_id, resolve_identity};
use crate::config::OAuthConfig;
use crate::reconcile::UserDirectory;
use crate::{Error, Result};

/// Default bound on outstanding redirect states.
const MAX_PENDING_STATES: usize = 4096;

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// `/_/oauth/userinfo` query parameters
#[derive(Debug, Deserialize)]
pub struct UserInfoParams {
    /// Provider token
    pub token: Option<String>,
}

/// Issued redirect states awaiting their callback, keyed by state.
///
/// The map is bounded: when it is full of unexpired states, issuance is
/// refused rather than evicting states a browser is still waiting on.
#[derive(Debug)]
pub struct StateStore {
    ttl: Duration,
    capacity: usize,
    pending: DashMap<String, Instant>,
}

impl StateStore {
    /// Create a store whose states expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, MAX_PENDING_STATES)
    }

    /// Create a store holding at most `capacity` outstanding states.
    #[must_use]
    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            pending: DashMap::new(),
        }
    }

    /// Issue and remember a new state.
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] while `capacity` unexpired states are pending.
    pub fn issue(&self) -> Result<String> {
        let now = Instant::now();
        if self.pending.len() >= self.capacity {
            self.pending.retain(|_, deadline| *deadline > now);
            if self.pending.len() >= self.capacity {
                warn!(pending = self.pending.len(), "Too many pending OAuth states");
                return Err(Error::Unavailable(
                    "too many pending logins, retry later".to_string(),
                ));
            }
        }

        let state = generate_state();
        self.pending.insert(state.clone(), now + self.ttl);
        Ok(state)
    }

    /// Consume `state` if it was issued and is unexpired.
    pub fn consume(&self, state: &str) -> bool {
        self.pending
            .remove(state)
            .is_some_and(|(_, deadline)| deadline > Instant::now())
    }

    /// Number of unexpired states.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|entry| *entry.value() > now)
            .count()
    }

    /// Whether no state is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generate a random state parameter
fn generate_state() -> String {
    let state_bytes: [u8; 24] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Everything the redirect flow needs.
pub struct OAuthFlow {
    /// Identity provider
    pub provider: Arc<dyn IdentityProvider>,
    /// Directory upserted after each login
    pub directory: Arc<dyn UserDirectory>,
    /// Outstanding redirect states
    pub states: StateStore,
    /// Provider configuration
    pub config: OAuthConfig,
}

impl OAuthFlow {
    /// Assemble the flow.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn UserDirectory>,
        config: OAuthConfig,
    ) -> Self {
        Self {
            provider,
            directory,
            states: StateStore::new(config.state_ttl),
            config,
        }
    }
}

/// Build the OAuth routes.
pub fn oauth_routes(flow: Arc<OAuthFlow>) -> Router {
    Router::new()
        .route("/_/oauth/redirect", get(handle_redirect))
        .route("/_/oauth/callback", get(handle_callback))
        .route("/_/oauth/userinfo", get(handle_userinfo))
        .with_state(flow)
}

async fn handle_redirect(State(flow): State<Arc<OAuthFlow>>) -> Result<Redirect> {
    let state = flow.states.issue()?;
    let url = flow.provider.authorize_url(&state)?;
    debug!("Redirecting to identity provider");
    Ok(Redirect::temporary(&url))
}

async fn handle_callback(
    State(flow): State<Arc<OAuthFlow>>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect> {
    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, "Provider returned an error");
        return Err(Error::BadRequest(format!("OAuth error: {error} - {description}")));
    }

    let Some(state) = params.state else {
        return Err(Error::BadRequest("State parameter not provided".to_string()));
    };
    if !flow.states.consume(&state) {
        warn!("OAuth state mismatch");
        return Err(Error::BadRequest("Invalid state parameter".to_string()));
    }

    let Some(code) = params.code else {
        return Err(Error::BadRequest(
            "Authorization code not provided".to_string(),
        ));
    };

    let token = flow.provider.exchange_code(&code).await?;
    let identity =
        resolve_identity(flow.provider.as_ref(), &token, &flow.config.default_group).await?;

    flow.directory.upsert(&identity).await?;
    info!(uid = %identity.uid, "OAuth login completed");

    Ok(Redirect::temporary(
        &flow.config.ui_redirect.replace("{token}", &token),
    ))
}

async fn handle_userinfo(
    State(flow): State<Arc<OAuthFlow>>,
    Query(params): Query<UserInfoParams>,
) -> Result<Json<Profile>> {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        return Err(Error::Unauthenticated);
    };
    let token = token.strip_prefix("Bearer ").unwrap_or(&token);

    let uid = extract_user_id(token)?;
    let mut profile = flow.provider.fetch_profile(token, &uid).await?;
    profile.id = uid;
    Ok(Json(profile))
}
