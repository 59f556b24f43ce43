//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::StorageBackend;
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "KUBE_AUTH_PROXY_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Upstream API server and outbound transport
    pub upstream: UpstreamConfig,
    /// Service credential source
    pub credentials: CredentialsConfig,
    /// Token storage backend
    pub storage: StorageConfig,
    /// OAuth provider
    pub oauth: OAuthConfig,
    /// Opaque token issuance
    pub tokens: TokenConfig,
    /// User directory reconciliation
    pub reconcile: ReconcileConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Serve HTTPS when both files are set
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
            tls: TlsConfig::default(),
        }
    }
}

/// Listener TLS files (PEM)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate chain file
    pub cert_file: Option<String>,
    /// Private key file
    pub key_file: Option<String>,
}

impl TlsConfig {
    /// Both files configured
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// Upstream API server and outbound transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API server
    pub url: String,
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// TCP keep-alive interval
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
    /// How long idle pooled connections are kept
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Maximum idle pooled connections
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: in_cluster_endpoint(),
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 100,
        }
    }
}

/// The API server address advertised to in-cluster workloads.
fn in_cluster_endpoint() -> String {
    match (
        env::var("KUBERNETES_SERVICE_HOST"),
        env::var("KUBERNETES_SERVICE_PORT"),
    ) {
        (Ok(host), Ok(port)) if !host.is_empty() && !port.is_empty() => {
            if host.contains(':') {
                format!("https://[{host}]:{port}")
            } else {
                format!("https://{host}:{port}")
            }
        }
        _ => "https://kubernetes.default.svc".to_string(),
    }
}

/// Service credential source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Directory holding `ca.crt`, `token` and `namespace`
    pub secret_path: String,
    /// How often the files are re-read
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            secret_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
            refresh_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Token storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage URI: `memory:`, `redis://host/db?prefix=…`, `rediss://…`
    pub uri: String,
    /// Expiry sweep interval of the in-memory backend
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uri: "memory:".to_string(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// OAuth provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Client ID (supports `${VAR}`)
    pub app_id: String,
    /// Client secret (supports `${VAR}`)
    pub secret: String,
    /// Redirect URI registered with the provider
    pub callback_url: String,
    /// Provider authorization endpoint
    pub authorize_url: String,
    /// Provider token endpoint
    pub token_url: String,
    /// Profile endpoint; `{uid}` is replaced by the subject id
    pub profile_url: String,
    /// Group assigned to every provider-authenticated identity
    pub default_group: String,
    /// Where the callback sends the browser; `{token}` is replaced by the provider token
    pub ui_redirect: String,
    /// Lifetime of an issued redirect state
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            app_id: "${OAUTH_APP_ID}".to_string(),
            secret: "${OAUTH_SECRET}".to_string(),
            callback_url: "http://localhost:8080/_/oauth/callback".to_string(),
            authorize_url: "https://hpcgame.pku.edu.cn/oauth/authorize".to_string(),
            token_url: "https://hpcgame.pku.edu.cn/api/oauth/access_token".to_string(),
            profile_url: "https://hpcgame.pku.edu.cn/api/user/{uid}/profile".to_string(),
            default_group: "hpcgame:competitors".to_string(),
            ui_redirect: "../ui/#/auth/token/{token}".to_string(),
            state_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Opaque token issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Lifetime of an issued token
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
    /// Length of the random suffix
    pub length: usize,
    /// Maximum live tokens per owner
    pub max_per_user: usize,
    /// Only allow revoking tokens under the caller's own owner prefix
    pub enforce_revoke_ownership: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(14 * 24 * 3600),
            length: 36,
            max_per_user: 128,
            enforce_revoke_ownership: false,
        }
    }
}

/// User directory reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Upsert a user object after each provider login
    pub enabled: bool,
    /// Collection path of user objects on the upstream
    pub resource_path: String,
    /// `apiVersion` of created user objects
    pub api_version: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resource_path: "/apis/user.lcpu.dev/v1alpha1/users".to_string(),
            api_version: "user.lcpu.dev/v1alpha1".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check invariants that would otherwise surface mid-request.
    pub fn validate(&self) -> Result<()> {
        StorageBackend::parse(&self.storage.uri)?;

        Url::parse(&self.upstream.url)
            .map_err(|e| Error::Config(format!("Invalid upstream URL: {e}")))?;

        if self.tokens.length == 0 {
            return Err(Error::Config("tokens.length must be positive".to_string()));
        }
        if self.tokens.max_per_user == 0 {
            return Err(Error::Config(
                "tokens.max_per_user must be positive".to_string(),
            ));
        }
        if self.server.tls.cert_file.is_some() != self.server.tls.key_file.is_some() {
            return Err(Error::Config(
                "server.tls requires both cert_file and key_file".to_string(),
            ));
        }
        if !self.oauth.profile_url.contains("{uid}") {
            return Err(Error::Config(
                "oauth.profile_url must contain {uid}".to_string(),
            ));
        }
        if self.oauth.default_group.is_empty() {
            return Err(Error::Config(
                "oauth.default_group must not be empty".to_string(),
            ));
        }
        // Both drive `tokio::time::interval`, which panics on zero.
        if self.credentials.refresh_interval.is_zero() {
            return Err(Error::Config(
                "credentials.refresh_interval must be positive".to_string(),
            ));
        }
        if self.storage.sweep_interval.is_zero() {
            return Err(Error::Config(
                "storage.sweep_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secret-bearing values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.oauth.app_id = Self::expand_string(&re, &self.oauth.app_id);
        self.oauth.secret = Self::expand_string(&re, &self.oauth.secret);
        self.storage.uri = Self::expand_string(&re, &self.storage.uri);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.uri, "memory:");
        assert_eq!(config.tokens.length, 36);
        assert_eq!(config.tokens.max_per_user, 128);
        assert_eq!(config.tokens.expiration, Duration::from_secs(1_209_600));
        assert_eq!(config.credentials.refresh_interval, Duration::from_secs(900));
        assert_eq!(config.oauth.default_group, "hpcgame:competitors");
        assert!(!config.tokens.enforce_revoke_ownership);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_yaml_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "storage:\n  uri: \"redis://cache:6379/0?prefix=dev:\"\ntokens:\n  expiration: 2h\n  max_per_user: 4\n"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.tokens.expiration, Duration::from_secs(7200));
        assert_eq!(config.tokens.max_per_user, 4);
        assert!(config.storage.uri.starts_with("redis://"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/kube-auth-proxy.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_unknown_storage_scheme() {
        let mut config = Config::default();
        config.storage.uri = "etcd://localhost".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_half_configured_tls() {
        let mut config = Config::default();
        config.server.tls.cert_file = Some("cert.pem".to_string());
        assert!(config.validate().is_err());

        config.server.tls.key_file = Some("key.pem".to_string());
        assert!(config.validate().is_ok());
        assert!(config.server.tls.enabled());
    }

    #[test]
    fn validate_rejects_zero_quota() {
        let mut config = Config::default();
        config.tokens.max_per_user = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_refresh_interval() {
        let mut config = Config::default();
        config.credentials.refresh_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("refresh_interval")));
    }

    #[test]
    fn validate_rejects_zero_sweep_interval() {
        let mut config = Config::default();
        config.storage.sweep_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("sweep_interval")));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn expand_string_uses_default_when_unset() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let value = Config::expand_string(&re, "${KUBE_AUTH_PROXY_TEST_UNSET_VAR:-fallback}");
        assert_eq!(value, "fallback");
    }
}
