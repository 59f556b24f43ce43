//! In-process token store.
//!
//! Records live in a `DashMap` keyed by token. Each record carries its own
//! deadline, and a min-heap of `(deadline, key)` is swept by a single
//! background task. A heap entry only removes a key whose *current* record
//! has passed its deadline, so re-storing a key re-arms its expiry and the
//! superseded heap entry becomes inert.
//!
//! Reads treat a record past its deadline as absent, so expiry is exact even
//! between sweeps; the sweeper only reclaims memory.
//!
//! Deletes and re-stores leave inert heap entries behind. Once the heap
//! outgrows the live records by `COMPACT_RATIO` it is rebuilt from them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::TokenStore;
use crate::{Error, Result};

/// Deadline used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Heap entries per live record above which the heap is compacted.
const COMPACT_RATIO: usize = 4;

/// Heap size below which compaction is never attempted.
const COMPACT_MIN: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    deadline: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: DashMap<String, Entry>,
    expiries: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record whose deadline is at or before `now`.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let due: Vec<String> = {
            let mut heap = self.expiries.lock();
            let mut due = Vec::new();
            loop {
                let is_due =
                    matches!(heap.peek(), Some(Reverse((deadline, _))) if *deadline <= now);
                if !is_due {
                    break;
                }
                if let Some(Reverse((_, key))) = heap.pop() {
                    due.push(key);
                }
            }
            due
        };

        due.into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| !entry.is_live(now))
                    .is_some()
            })
            .count()
    }

    /// Number of records held, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop heap entries that no longer match a stored record's deadline.
    fn compact_expiries(&self) {
        let mut heap = self.expiries.lock();
        let live = self.entries.len();
        if heap.len() < COMPACT_MIN || heap.len() <= live.saturating_mul(COMPACT_RATIO) {
            return;
        }

        let before = heap.len();
        heap.retain(|Reverse((deadline, key))| {
            self.entries
                .get(key)
                .is_some_and(|entry| entry.deadline == *deadline)
        });
        debug!(before, after = heap.len(), live, "Compacted expiry heap");
    }

    #[cfg(test)]
    fn expiry_len(&self) -> usize {
        self.expiries.lock().len()
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            return Some(entry.value.clone());
        }
        drop(entry);
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);

        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline,
            },
        );
        self.expiries.lock().push(Reverse((deadline, key.to_string())));
        self.compact_expiries();
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<String> {
        self.live_value(key, Instant::now()).ok_or(Error::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.compact_expiries();
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_value(key, Instant::now()).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect())
    }
}

/// Spawn the background task that sweeps expired records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(
    store: Arc<MemoryTokenStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = store.sweep(Instant::now());
                    if swept > 0 {
                        debug!(count = swept, "Swept expired tokens");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Token sweeper shutting down");
                    break;
                }
            }
        }
    });
}
