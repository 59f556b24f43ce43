//! Token store: key/value persistence for opaque token records.
//!
//! The [`TokenStore`] trait abstracts over storage backends:
//!
//! - [`MemoryTokenStore`]: in-process `DashMap` with an expiry heap swept
//!   by one background task.
//! - [`RedisTokenStore`]: external cache; TTL delegated to native expiry,
//!   keys namespaced by a per-deployment prefix.
//!
//! The backend is selected once at startup from a storage URI
//! (`memory:`, `redis://…`, `rediss://…`) by [`open`].

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::StorageConfig;
use crate::{Error, Result};

pub use memory::MemoryTokenStore;
pub use redis::RedisTokenStore;

/// Trait abstracting the token storage backend.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// request handlers.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Store `value` under `key`, expiring after `ttl`. Overwrites any
    /// existing record and its expiry.
    async fn store(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Load the value under `key`.
    ///
    /// Returns [`Error::NotFound`] when the key is absent or expired, never a
    /// generic error, so callers can tell "unauthenticated" from "backend
    /// unavailable".
    async fn load(&self, key: &str) -> Result<String>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a live record exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All live keys beginning with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage backend selected by the storage URI scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process map (`memory:`)
    Memory,
    /// Redis (`redis://` or `rediss://`)
    Redis {
        /// Connection URL with the `prefix` parameter removed
        url: String,
        /// Storage-instance key prefix
        prefix: String,
    },
}

impl StorageBackend {
    /// Parse a storage URI. Unknown schemes are a configuration error.
    pub fn parse(uri: &str) -> Result<Self> {
        let Some((scheme, _)) = uri.split_once(':') else {
            return Err(Error::Config(format!("Invalid token storage URI: {uri}")));
        };

        match scheme {
            "memory" => Ok(Self::Memory),
            "redis" | "rediss" => {
                let mut parsed = Url::parse(uri)
                    .map_err(|e| Error::Config(format!("Invalid redis URI: {e}")))?;

                let mut prefix = String::new();
                let retained: Vec<(String, String)> = parsed
                    .query_pairs()
                    .filter_map(|(k, v)| {
                        if k == "prefix" {
                            prefix = v.into_owned();
                            None
                        } else {
                            Some((k.into_owned(), v.into_owned()))
                        }
                    })
                    .collect();

                if retained.is_empty() {
                    parsed.set_query(None);
                } else {
                    parsed.query_pairs_mut().clear().extend_pairs(retained);
                }

                Ok(Self::Redis {
                    url: parsed.to_string(),
                    prefix,
                })
            }
            other => Err(Error::Config(format!(
                "Unknown token storage type: {other}"
            ))),
        }
    }
}

/// Instantiate the configured backend.
///
/// The in-process backend starts its expiry sweeper, which exits when
/// `shutdown` fires.
pub async fn open(
    config: &StorageConfig,
    shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<Arc<dyn TokenStore>> {
    match StorageBackend::parse(&config.uri)? {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryTokenStore::new());
            memory::spawn_sweeper(Arc::clone(&store), config.sweep_interval, shutdown);
            tracing::info!("Using in-memory token storage");
            Ok(store)
        }
        StorageBackend::Redis { url, prefix } => {
            let store = RedisTokenStore::connect(&url, prefix).await?;
            Ok(Arc::new(store))
        }
    }
}
