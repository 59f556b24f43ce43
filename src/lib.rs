//! Kubernetes API Authenticating Proxy
//!
//! Sits in front of the Kubernetes API server, resolves each caller to an
//! identity and forwards the request with the proxy's own service account,
//! impersonating that identity.
//!
//! # Features
//!
//! - **OAuth login**: browser redirect flow against an external provider
//! - **Provider tokens**: JWT-shaped bearer tokens resolved via the provider profile
//! - **Opaque tokens**: long-lived `sk:` tokens with per-user quota, memory or redis backed
//! - **Impersonation**: caller-supplied `Impersonate-*` headers are always stripped
//! - **Credential rotation**: service account files re-read periodically
//! - **Production Ready**: structured logs, audit events, graceful shutdown, TLS

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod oauth;
pub mod reconcile;
pub mod store;
pub mod tokens;

pub use error::{Error, Result};
pub use identity::Identity;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install logger: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to install logger: {e}")))?,
    }

    Ok(())
}
