//! Redis-backed token store.
//!
//! Every key is namespaced with a storage-instance prefix (the `prefix`
//! query parameter of the storage URI) so one Redis can host several
//! independent deployments. TTL is delegated to Redis' native expiry and
//! enumeration uses incremental `SCAN … MATCH <prefix>*` until the cursor
//! wraps back to zero.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::TokenStore;
use crate::{Error, Result};

/// Keys requested per `SCAN` round-trip.
const SCAN_COUNT: usize = 100;

/// Maps caller keys to and from the namespaced keys held in Redis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space for a storage-instance prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The key as stored in Redis.
    #[must_use]
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Strip the instance prefix from a key returned by `SCAN`.
    #[must_use]
    pub fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    /// Glob pattern matching every namespaced key starting with `prefix`.
    ///
    /// Glob metacharacters in the instance prefix or caller prefix are
    /// escaped so they match literally.
    #[must_use]
    pub fn scan_pattern(&self, prefix: &str) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + prefix.len() + 1);
        for c in self.prefix.chars().chain(prefix.chars()) {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

/// Token store backed by Redis.
pub struct RedisTokenStore {
    conn: ConnectionManager,
    keys: KeySpace,
}

impl RedisTokenStore {
    /// Connect to Redis at `url` (without the `prefix` parameter).
    pub async fn connect(url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("Invalid redis URI: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Unavailable(format!("Failed to connect to redis: {e}")))?;

        info!(prefix = %prefix, "Connected to redis token storage");
        Ok(Self {
            conn,
            keys: KeySpace::new(prefix),
        })
    }
}

#[async_trait::async_trait]
impl TokenStore for RedisTokenStore {
    async fn store(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.keys.namespaced(key)).arg(value);

        // A zero TTL means no expiry, as with a plain SET.
        if !ttl.is_zero() {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }

        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.keys.namespaced(key))
            .query_async(&mut conn)
            .await?;
        value.ok_or(Error::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("DEL")
            .arg(self.keys.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(self.keys.namespaced(key))
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = self.keys.scan_pattern(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            keys.extend(page.iter().map(|k| self.keys.strip(k).to_string()));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across pages.
        keys.sort_unstable();
        keys.dedup();

        debug!(pattern = %pattern, count = keys.len(), "Listed redis keys");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_and_strip_are_inverse() {
        let keys = KeySpace::new("prod:");
        let stored = keys.namespaced("sk:alice:abc");
        assert_eq!(stored, "prod:sk:alice:abc");
        assert_eq!(keys.strip(&stored), "sk:alice:abc");
    }

    #[test]
    fn empty_prefix_is_transparent() {
        let keys = KeySpace::default();
        assert_eq!(keys.namespaced("sk:bob:x"), "sk:bob:x");
        assert_eq!(keys.strip("sk:bob:x"), "sk:bob:x");
        assert_eq!(keys.scan_pattern("sk:bob:"), "sk:bob:*");
    }

    #[test]
    fn scan_pattern_includes_instance_prefix() {
        let keys = KeySpace::new("staging:");
        assert_eq!(keys.scan_pattern("sk:alice:"), "staging:sk:alice:*");
    }

    #[test]
    fn scan_pattern_escapes_glob_metacharacters() {
        let keys = KeySpace::new("a*");
        assert_eq!(keys.scan_pattern("sk:[x]?:"), r"a\*sk:\[x\]\?:*");
    }
}
