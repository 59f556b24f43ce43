//! Behaviour every token store backend must share.
//!
//! Each case runs against the in-memory store. The Redis cases are ignored by
//! default; run them with `REDIS_URL=redis://localhost:6379 cargo test -- --ignored`.
//! Every Redis case uses a fresh instance prefix so runs never collide.

use std::sync::Arc;
use std::time::Duration;

use kube_auth_proxy::Error;
use kube_auth_proxy::store::{MemoryTokenStore, RedisTokenStore, TokenStore};
use pretty_assertions::assert_eq;

const HOUR: Duration = Duration::from_secs(3600);

fn memory() -> Arc<dyn TokenStore> {
    Arc::new(MemoryTokenStore::new())
}

/// A Redis store under a fresh instance prefix, or `None` without `REDIS_URL`.
async fn redis_with_prefix(prefix: &str) -> Option<Arc<dyn TokenStore>> {
    let url = std::env::var("REDIS_URL").ok()?;
    let store = RedisTokenStore::connect(&url, prefix.to_string())
        .await
        .unwrap();
    Some(Arc::new(store))
}

fn fresh_prefix() -> String {
    let id: u64 = rand::random();
    format!("contract-{id:016x}:")
}

async fn redis() -> Option<Arc<dyn TokenStore>> {
    redis_with_prefix(&fresh_prefix()).await
}

async fn sorted_list(store: &Arc<dyn TokenStore>, prefix: &str) -> Vec<String> {
    let mut keys = store.list(prefix).await.unwrap();
    keys.sort();
    keys
}

async fn missing_key_is_not_found(store: Arc<dyn TokenStore>) {
    assert!(matches!(store.load("sk:nobody:x").await, Err(Error::NotFound)));
    assert!(!store.exists("sk:nobody:x").await.unwrap());
    store.delete("sk:nobody:x").await.unwrap();
}

async fn store_overwrites_and_delete_removes(store: Arc<dyn TokenStore>) {
    store.store("sk:alice:1", "v1", HOUR).await.unwrap();
    store.store("sk:alice:1", "v2", HOUR).await.unwrap();
    assert_eq!(store.load("sk:alice:1").await.unwrap(), "v2");

    store.delete("sk:alice:1").await.unwrap();
    assert!(matches!(store.load("sk:alice:1").await, Err(Error::NotFound)));
}

async fn list_returns_caller_keys_by_prefix(store: Arc<dyn TokenStore>) {
    // GIVEN: keys for two owners, one with a glob character in its name
    store.store("sk:alice:a", "v", HOUR).await.unwrap();
    store.store("sk:alice:b", "v", HOUR).await.unwrap();
    store.store("sk:al*ce:c", "v", HOUR).await.unwrap();
    store.store("sk:bob:d", "v", HOUR).await.unwrap();

    // WHEN/THEN: listing yields the caller's own key form, scoped exactly
    assert_eq!(
        sorted_list(&store, "sk:alice:").await,
        vec!["sk:alice:a", "sk:alice:b"]
    );
    assert_eq!(sorted_list(&store, "sk:al*ce:").await, vec!["sk:al*ce:c"]);
    assert_eq!(sorted_list(&store, "sk:").await.len(), 4);
    assert!(store.list("sk:carol:").await.unwrap().is_empty());
}

async fn ttl_round_trip(store: Arc<dyn TokenStore>) {
    // GIVEN: a short-lived record next to a long-lived one
    store
        .store("sk:alice:short", "v", Duration::from_millis(300))
        .await
        .unwrap();
    store.store("sk:alice:long", "v", HOUR).await.unwrap();
    assert_eq!(store.load("sk:alice:short").await.unwrap(), "v");

    // WHEN: the short TTL passes
    tokio::time::sleep(Duration::from_millis(800)).await;

    // THEN: only the long-lived record remains on every read path
    assert!(matches!(
        store.load("sk:alice:short").await,
        Err(Error::NotFound)
    ));
    assert!(!store.exists("sk:alice:short").await.unwrap());
    assert_eq!(sorted_list(&store, "sk:alice:").await, vec!["sk:alice:long"]);
}

async fn list_is_exact_under_concurrent_writes(store: Arc<dyn TokenStore>) {
    // GIVEN: a fixed set of keys under one owner
    for i in 0..30 {
        store
            .store(&format!("sk:carol:{i:02}"), "v", HOUR)
            .await
            .unwrap();
    }

    // WHEN: other owners' keys are stored and deleted concurrently
    let mut writers = Vec::new();
    for w in 0..4 {
        let store = Arc::clone(&store);
        writers.push(tokio::spawn(async move {
            for i in 0..100 {
                let key = format!("sk:churn{w}:{i}");
                store.store(&key, "v", HOUR).await.unwrap();
                store.delete(&key).await.unwrap();
            }
        }));
    }

    // THEN: the fixed owner always sees exactly its own set, without duplicates
    let expected: Vec<String> = (0..30).map(|i| format!("sk:carol:{i:02}")).collect();
    for _ in 0..20 {
        assert_eq!(sorted_list(&store, "sk:carol:").await, expected);
    }
    for writer in writers {
        writer.await.unwrap();
    }
    assert!(store.list("sk:churn").await.unwrap().is_empty());
}

macro_rules! contract {
    ($($case:ident),* $(,)?) => {
        mod memory_backend {
            use super::*;
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $case() {
                    super::$case(memory()).await;
                }
            )*
        }

        mod redis_backend {
            use super::*;
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                #[ignore = "needs REDIS_URL"]
                async fn $case() {
                    let Some(store) = redis().await else {
                        eprintln!("REDIS_URL not set, skipping");
                        return;
                    };
                    super::$case(store).await;
                }
            )*
        }
    };
}

contract!(
    missing_key_is_not_found,
    store_overwrites_and_delete_removes,
    list_returns_caller_keys_by_prefix,
    ttl_round_trip,
    list_is_exact_under_concurrent_writes,
);

#[tokio::test]
#[ignore = "needs REDIS_URL"]
async fn redis_instances_do_not_see_each_others_keys() {
    // GIVEN: two deployments sharing one Redis under different instance prefixes
    let first_prefix = fresh_prefix();
    let Some(first) = redis_with_prefix(&first_prefix).await else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let Some(second) = redis().await else {
        return;
    };

    // WHEN: each stores a token for the same owner
    first.store("sk:alice:one", "first", HOUR).await.unwrap();
    second.store("sk:alice:two", "second", HOUR).await.unwrap();

    // THEN: each lists and loads only its own, with the instance prefix stripped
    assert_eq!(store_keys(&first).await, vec!["sk:alice:one"]);
    assert_eq!(store_keys(&second).await, vec!["sk:alice:two"]);
    assert!(matches!(
        first.load("sk:alice:two").await,
        Err(Error::NotFound)
    ));
    assert!(
        store_keys(&first)
            .await
            .iter()
            .all(|key| !key.starts_with(&first_prefix))
    );
}

async fn store_keys(store: &Arc<dyn TokenStore>) -> Vec<String> {
    sorted_list(store, "sk:alice:").await
}
