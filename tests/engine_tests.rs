//! Engine Tests
//!
//! Drives the cache through its public API on a manual clock and a
//! failure-injecting backing store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use serde_json::{json, Value};
use tiered_cache::{CacheConfig, CacheDefinition, CacheError, CircuitState, SubscriptionFilter};
use tokio::sync::Notify;
use tokio_test::assert_ok;

fn raw(key: &String) -> String {
    key.clone()
}

/// Definition whose values are their own tag lists.
fn tagged(harness: &Harness) -> CacheDefinition<String, Vec<String>> {
    harness
        .cache
        .define::<String, Vec<String>>("item")
        .key(raw)
        .tags(|_, tags| tags.clone())
        .build()
        .unwrap()
}

/// Fetching definition counting its calls; fetches past `gate_after` wait for `gate`.
fn counting(
    harness: &Harness,
    name: &str,
    calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
    gate_after: usize,
) -> tiered_cache::DefinitionBuilder<String, usize> {
    harness
        .cache
        .define::<String, usize>(name)
        .key(raw)
        .fetch(move |_| {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n > gate_after {
                    gate.notified().await;
                }
                Ok(n)
            }
        })
}

async fn wait_for_calls(calls: &AtomicUsize, n: usize) {
    for _ in 0..200 {
        if calls.load(Ordering::SeqCst) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} fetch calls, saw {}", n, calls.load(Ordering::SeqCst));
}

// == Expiry ==

#[tokio::test]
async fn test_ttl_scenario_without_fetch() {
    let h = Harness::new();
    let users = h
        .cache
        .define::<String, Value>("user")
        .key(raw)
        .ttl(Duration::from_secs(300))
        .build()
        .unwrap();

    assert_ok!(users.set("1".into(), json!({"name": "A"})).await);
    assert_eq!(users.get("1".into()).await.unwrap(), Some(json!({"name": "A"})));

    h.clock.advance(Duration::from_secs(299));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(json!({"name": "A"})));

    h.clock.advance(Duration::from_secs(2));
    assert_eq!(users.get("1".into()).await.unwrap(), None);
}

#[tokio::test]
async fn test_expiry_boundary_is_exclusive() {
    let h = Harness::new();
    let users = h
        .cache
        .define::<String, u32>("user")
        .key(raw)
        .ttl(Duration::from_secs(10))
        .build()
        .unwrap();

    users.set("1".into(), 1).await.unwrap();
    h.clock.advance(Duration::from_millis(9_999));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    h.clock.advance(Duration::from_millis(1));
    assert_eq!(users.get("1".into()).await.unwrap(), None);
}

#[tokio::test]
async fn test_sliding_window_extends_life() {
    let h = Harness::new();
    let sessions = h
        .cache
        .define::<String, u32>("session")
        .key(raw)
        .ttl(Duration::from_secs(10))
        .sliding_window(true)
        .build()
        .unwrap();

    sessions.set("s".into(), 1).await.unwrap();
    for _ in 0..3 {
        h.clock.advance(Duration::from_secs(8));
        assert_eq!(sessions.get("s".into()).await.unwrap(), Some(1));
    }

    h.clock.advance(Duration::from_secs(10));
    assert_eq!(sessions.get("s".into()).await.unwrap(), None);
}

// == Single Flight ==

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let users = counting(&h, "user", calls.clone(), gate.clone(), 0)
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let users = users.clone();
        handles.push(tokio::spawn(async move { users.get("1".into()).await }));
    }

    wait_for_calls(&calls, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(Some(1)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.cache.stats().sets, 1);
}

#[tokio::test]
async fn test_fetch_failure_reaches_all_waiters_and_caches_nothing() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let counter = calls.clone();
    let release = gate.clone();
    let users = h
        .cache
        .define::<String, u32>("user")
        .key(raw)
        .fetch(move |_| {
            let counter = counter.clone();
            let release = release.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Err(anyhow::anyhow!("source down"))
            }
        })
        .build()
        .unwrap();

    let first = tokio::spawn({
        let users = users.clone();
        async move { users.get("1".into()).await }
    });
    let second = tokio::spawn({
        let users = users.clone();
        async move { users.get("1".into()).await }
    });
    wait_for_calls(&calls, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.notify_one();

    let expected = Err(CacheError::FetchFailed("source down".into()));
    assert_eq!(first.await.unwrap(), expected);
    assert_eq!(second.await.unwrap(), expected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(users.peek(&"1".to_string()).is_none());
    assert_eq!(h.cache.breaker_state(), CircuitState::Closed);
    assert!(h.cache.stats().errors >= 1);
}

#[tokio::test]
async fn test_panicking_fetch_does_not_wedge_key() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let users = h
        .cache
        .define::<String, u32>("user")
        .key(raw)
        .fetch(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("source bug");
                }
                Ok(7)
            }
        })
        .build()
        .unwrap();

    let first = users.get("1".into()).await;
    assert!(matches!(first, Err(CacheError::FetchFailed(_))), "{:?}", first);
    assert_eq!(users.get("1".into()).await.unwrap(), Some(7));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_population_finishing_after_close_writes_nothing() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let users = counting(&h, "user", calls.clone(), gate.clone(), 0)
        .build()
        .unwrap();

    let pending = tokio::spawn({
        let users = users.clone();
        async move { users.get("1".into()).await }
    });
    wait_for_calls(&calls, 1).await;

    h.cache.close();
    gate.notify_one();

    assert_eq!(pending.await.unwrap(), Ok(Some(1)));
    assert!(!h.store.inner().contains("cache:user:1"));
    assert_eq!(h.cache.stats().local_entries, 0);
    assert_eq!(h.cache.stats().sets, 0);
}

// == Stale While Revalidate ==

#[tokio::test]
async fn test_stale_read_triggers_one_background_fetch() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let users = counting(&h, "user", calls.clone(), gate.clone(), 1)
        .ttl(Duration::from_secs(10))
        .stale_while_revalidate(Duration::from_secs(30))
        .build()
        .unwrap();

    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));

    h.clock.advance(Duration::from_secs(15));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));

    wait_for_calls(&calls, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(users.get("1".into()).await.unwrap(), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.cache.stats().stale_hits, 2);
}

#[tokio::test]
async fn test_past_stale_window_fetches_inline() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let users = counting(&h, "user", calls.clone(), Arc::new(Notify::new()), usize::MAX)
        .ttl(Duration::from_secs(10))
        .stale_while_revalidate(Duration::from_secs(5))
        .build()
        .unwrap();

    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    h.clock.advance(Duration::from_secs(16));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_failed_revalidation_keeps_serving_stale() {
    let h = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let users = h
        .cache
        .define::<String, u32>("user")
        .key(raw)
        .fetch(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(1)
                } else {
                    Err(anyhow::anyhow!("source down"))
                }
            }
        })
        .ttl(Duration::from_secs(10))
        .stale_while_revalidate(Duration::from_secs(30))
        .build()
        .unwrap();

    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    let errors_before = h.cache.stats().errors;

    h.clock.advance(Duration::from_secs(15));
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    wait_for_calls(&calls, 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.cache.stats().errors > errors_before);

    // Still the old entry, and the next stale read tries again
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    wait_for_calls(&calls, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stats = h.cache.stats();
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.stale_hits, 2);
}

// == Group Invalidation ==

#[tokio::test]
async fn test_tag_invalidation() {
    let h = Harness::new();
    let items = tagged(&h);
    items.set("a".into(), vec!["x".into()]).await.unwrap();
    items.set("b".into(), vec!["x".into(), "y".into()]).await.unwrap();
    items.set("c".into(), vec!["y".into()]).await.unwrap();

    let report = h.cache.invalidate_by_tag("x").await.unwrap();
    assert_eq!(report.count(), 2);

    assert_eq!(items.get("a".into()).await.unwrap(), None);
    assert_eq!(items.get("b".into()).await.unwrap(), None);
    assert_eq!(items.get("c".into()).await.unwrap(), Some(vec!["y".to_string()]));
}

#[tokio::test]
async fn test_pattern_invalidation() {
    let h = Harness::new();
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();
    let orders = h.cache.define::<String, u32>("order").key(raw).build().unwrap();
    users.set("1".into(), 1).await.unwrap();
    users.set("2".into(), 2).await.unwrap();
    users.set("1:posts".into(), 3).await.unwrap();
    orders.set("1".into(), 1).await.unwrap();

    let report = h.cache.invalidate_by_pattern("user:*").await.unwrap();
    let mut keys = report.keys.clone();
    keys.sort();
    assert_eq!(keys, vec!["cache:user:1", "cache:user:2"]);

    assert_eq!(orders.get("1".into()).await.unwrap(), Some(1));
    assert_eq!(users.get("1:posts".into()).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_pattern_reaches_keys_only_in_backing_store() {
    let h = Harness::new();
    let sibling = h.sibling();
    let users = sibling.define::<String, u32>("user").key(raw).build().unwrap();
    users.set("9".into(), 9).await.unwrap();

    let report = h.cache.invalidate_by_pattern("user:?").await.unwrap();
    assert_eq!(report.keys, vec!["cache:user:9"]);
    assert!(!h.store.inner().contains("cache:user:9"));
}

#[tokio::test]
async fn test_malformed_pattern_rejected() {
    let h = Harness::new();
    let result = h.cache.invalidate_by_pattern("user:{1,2}").await;
    assert!(matches!(result, Err(CacheError::InvalidPattern(_))));
}

#[tokio::test]
async fn test_cascading_invalidation_is_one_way() {
    let h = Harness::new();
    let docs = h
        .cache
        .define::<String, Vec<String>>("doc")
        .key(raw)
        .cascade(|_, dependents| dependents.clone())
        .build()
        .unwrap();
    let k2 = docs.key(&"k2".to_string());

    docs.set("k1".into(), vec![k2.clone()]).await.unwrap();
    docs.set("k2".into(), vec![]).await.unwrap();

    let report = docs.invalidate(&"k2".to_string()).await.unwrap();
    assert_eq!(report.keys, vec![k2.clone()]);
    assert!(docs.get("k1".into()).await.unwrap().is_some());

    docs.set("k2".into(), vec![]).await.unwrap();
    let report = docs.invalidate(&"k1".to_string()).await.unwrap();
    assert!(report.contains(&k2));
    assert_eq!(docs.get("k2".into()).await.unwrap(), None);
}

#[tokio::test]
async fn test_invalidation_is_idempotent() {
    let h = Harness::new();
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();

    let report = assert_ok!(h.cache.invalidate("cache:user:nope").await);
    assert!(report.is_empty());

    users.set("1".into(), 1).await.unwrap();
    assert!(users.delete(&"1".to_string()).await.unwrap());
    assert!(!users.delete(&"1".to_string()).await.unwrap());
    assert!(users.invalidate(&"1".to_string()).await.unwrap().is_empty());

    assert_eq!(h.cache.stats().invalidations, 1);
}

// == Circuit Breaker ==

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let config = CacheConfig {
        breaker_threshold: 3,
        breaker_timeout_ms: 1_000,
        half_open_requests: 2,
        ..CacheConfig::default()
    };
    let h = Harness::with_config(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let users = counting(&h, "user", calls.clone(), Arc::new(Notify::new()), usize::MAX)
        .build()
        .unwrap();

    h.store.fail(true);
    // Each read costs a failed GET and a failed write-through SET
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    assert_eq!(users.get("2".into()).await.unwrap(), Some(2));
    assert_eq!(h.cache.breaker_state(), CircuitState::Open);
    assert_eq!(h.store.calls(), 3);

    // Open: reads still succeed, the store is not contacted
    assert_eq!(users.get("3".into()).await.unwrap(), Some(3));
    assert_eq!(h.store.calls(), 3);

    h.clock.advance(Duration::from_millis(1_000));
    assert_eq!(h.cache.breaker_state(), CircuitState::HalfOpen);

    h.store.fail(false);
    users.get("4".into()).await.unwrap();
    assert_eq!(h.store.calls(), 5);
    assert_eq!(h.cache.breaker_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_failed_trial_reopens_breaker() {
    let config = CacheConfig {
        breaker_threshold: 1,
        breaker_timeout_ms: 500,
        half_open_requests: 1,
        ..CacheConfig::default()
    };
    let h = Harness::with_config(config);
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();

    h.store.fail(true);
    assert_eq!(users.get("1".into()).await.unwrap(), None);
    assert_eq!(h.cache.breaker_state(), CircuitState::Open);

    h.clock.advance(Duration::from_millis(500));
    assert_eq!(users.get("1".into()).await.unwrap(), None);
    assert_eq!(h.store.calls(), 2);
    assert_eq!(h.cache.breaker_state(), CircuitState::Open);
}

#[tokio::test]
async fn test_write_through_failure_is_swallowed() {
    let h = Harness::new();
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();

    h.store.fail(true);
    assert_ok!(users.set("1".into(), 1).await);
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    assert!(h.cache.stats().errors >= 1);
}

// == Tiers ==

#[tokio::test]
async fn test_invalidation_during_sliding_touch_is_not_undone() {
    let h = Harness::new();
    let sessions = h
        .cache
        .define::<String, u32>("session")
        .key(raw)
        .ttl(Duration::from_secs(10))
        .sliding_window(true)
        .build()
        .unwrap();
    sessions.set("1".into(), 1).await.unwrap();
    let key = sessions.key(&"1".to_string());

    h.clock.advance(Duration::from_secs(1));
    h.store.hold_writes();
    let reader = tokio::spawn({
        let sessions = sessions.clone();
        async move { sessions.get("1".into()).await }
    });
    for _ in 0..200 {
        if h.store.held() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.store.held(), 1, "touch write should be parked");

    let report = h.cache.invalidate(&key).await.unwrap();
    assert_eq!(report.keys, vec![key.clone()]);

    h.store.release_writes();
    assert_eq!(reader.await.unwrap(), Ok(Some(1)));

    assert!(!h.store.inner().contains(&key));
    let other = h.sibling();
    let remote_reader = other
        .define::<String, u32>("session")
        .key(raw)
        .build()
        .unwrap();
    assert_eq!(remote_reader.get("1".into()).await.unwrap(), None);
}

#[tokio::test]
async fn test_second_instance_reads_through_backing_store() {
    let h = Harness::new();
    let sibling = h.sibling();
    let writer = h.cache.define::<String, u32>("user").key(raw).build().unwrap();
    let reader = sibling.define::<String, u32>("user").key(raw).build().unwrap();

    writer.set("1".into(), 42).await.unwrap();
    assert_eq!(reader.peek(&"1".to_string()), None);
    assert_eq!(reader.get("1".into()).await.unwrap(), Some(42));
    assert_eq!(reader.peek(&"1".to_string()), Some(42));
    assert_eq!(sibling.stats().hits, 1);
}

#[tokio::test]
async fn test_corrupt_remote_entry_is_a_miss() {
    let h = Harness::new();
    h.store
        .inner()
        .insert_raw("cache:user:1", b"not an entry".to_vec(), 60);
    let calls = Arc::new(AtomicUsize::new(0));
    let users = counting(&h, "user", calls.clone(), Arc::new(Notify::new()), usize::MAX)
        .build()
        .unwrap();

    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.cache.stats().errors >= 1);
}

#[tokio::test]
async fn test_local_capacity_evicts_least_recent() {
    let config = CacheConfig {
        max_entries: 2,
        ..CacheConfig::default()
    };
    let h = Harness::with_config(config);
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();

    users.set("1".into(), 1).await.unwrap();
    users.set("2".into(), 2).await.unwrap();
    users.get("1".into()).await.unwrap();
    users.set("3".into(), 3).await.unwrap();

    assert_eq!(users.peek(&"2".to_string()), None);
    assert_eq!(users.peek(&"1".to_string()), Some(1));
    assert_eq!(h.cache.stats().evictions, 1);
    // Still served from the backing store
    assert_eq!(users.get("2".into()).await.unwrap(), Some(2));
}

// == Events ==

#[tokio::test]
async fn test_subscriber_gets_one_coalesced_notification() {
    let h = Harness::new();
    let items = tagged(&h);
    let mut subscription = h
        .cache
        .subscribe(
            SubscriptionFilter::default()
                .with_tags(["x"])
                .with_debounce(Duration::from_millis(50)),
        )
        .unwrap();

    items.set("a".into(), vec!["x".into()]).await.unwrap();
    items.set("b".into(), vec!["x".into()]).await.unwrap();
    items.set("c".into(), vec!["z".into()]).await.unwrap();
    h.cache.invalidate_by_tag("x").await.unwrap();
    h.cache.invalidate_by_tag("z").await.unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.events, 2);
    assert_eq!(
        notification.keys.into_iter().collect::<Vec<_>>(),
        vec!["item:a", "item:b"]
    );
    assert_eq!(notification.tags.into_iter().collect::<Vec<_>>(), vec!["x"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(subscription.try_recv().is_none());

    subscription.unsubscribe();
    assert_eq!(h.cache.subscriber_count(), 0);
}

#[tokio::test]
async fn test_failing_listener_does_not_break_the_cache() {
    let h = Harness::new();
    h.cache.events().subscribe(|_| panic!("observer bug"));
    h.cache
        .events()
        .subscribe(|_| Err(anyhow::anyhow!("observer error")));
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();

    users.set("1".into(), 1).await.unwrap();
    assert_eq!(users.get("1".into()).await.unwrap(), Some(1));
    assert_eq!(h.cache.stats().hits, 1);
}

#[tokio::test]
async fn test_close_ends_streams_and_rejects_calls() {
    let h = Harness::new();
    let users = h.cache.define::<String, u32>("user").key(raw).build().unwrap();
    let mut subscription = h.cache.subscribe(SubscriptionFilter::everything()).unwrap();

    h.cache.close();

    let ended = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
        .await
        .unwrap();
    assert!(ended.is_none());
    assert_eq!(users.get("1".into()).await, Err(CacheError::Closed));
    assert!(h.cache.is_closed());
}
