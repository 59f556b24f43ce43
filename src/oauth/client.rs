//! HTTP identity provider.

use std::fmt::Write as _;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{IdentityProvider, Profile};
use crate::config::OAuthConfig;
use crate::{Error, Result};

/// Marker the provider embeds in a response body when it rejects a token,
/// whatever the HTTP status.
const UNAUTHORIZED_MARKER: &str = r#""error":"Unauthorized""#;

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Identity provider reached over HTTP.
pub struct HttpIdentityProvider {
    http_client: Client,
    config: OAuthConfig,
}

impl HttpIdentityProvider {
    /// Create a provider client.
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    fn profile_url(&self, uid: &str) -> String {
        self.config
            .profile_url
            .replace("{uid}", &encode_path_segment(uid))
    }
}

/// Percent-encode `segment` for use as one URL path segment. Unreserved
/// bytes pass through; everything else, `/` included, becomes `%XX`.
fn encode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

#[async_trait::async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| Error::Config(format!("Invalid authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.app_id)
            .append_pair("redirect_uri", &self.config.callback_url)
            .append_pair("response_type", "code")
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<String> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.callback_url.as_str()),
            ("client_id", self.config.app_id.as_str()),
            ("client_secret", self.config.secret.as_str()),
        ];

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("Token request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() || body.contains(UNAUTHORIZED_MARKER) {
            warn!(status = %status, "Authorization code exchange rejected");
            return Err(Error::Invalid(format!(
                "Token exchange failed: HTTP {status}"
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Invalid(format!("Failed to parse token response: {e}")))?;
        debug!("Exchanged authorization code");
        Ok(token.access_token)
    }

    async fn fetch_profile(&self, token: &str, uid: &str) -> Result<Profile> {
        let response = self
            .http_client
            .get(self.profile_url(uid))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("Profile request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await?;
        if body.contains(UNAUTHORIZED_MARKER) {
            return Err(Error::Invalid("provider rejected the token".to_string()));
        }
        if !status.is_success() {
            return Err(Error::Invalid(format!("Profile lookup failed: HTTP {status}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::Invalid(format!("Failed to parse profile: {e}")))
    }
}
