//! Shared conformance tests for [`Store`] implementations.
//!
//! These test functions can be called by any backend (in-memory, Redis, ...) to make sure every
//! implementation honours the ordering and atomicity the queue relies on.

/// Generate all store spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// // In-memory store
/// deferral::generate_store_spec_tests! {
///     backend = "memory",
///     setup = MemoryStore::new()
/// }
///
/// // Redis store, skipped unless explicitly requested
/// deferral::generate_store_spec_tests! {
///     backend = "redis",
///     #[ignore = "requires a running redis server"]
///     setup = RedisStore::connect(&redis_url()).await.unwrap()
/// }
/// ```
#[macro_export]
macro_rules! generate_store_spec_tests {
    (
        backend = $backend:literal,
        $(#[$attr:meta])*
        setup = $setup_expr:expr
    ) => {
        $crate::paste::paste! {
            #[tokio::test]
            $(#[$attr])*
            async fn [<range_orders_by_score_then_member_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_range_orders_by_score_then_member(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<range_respects_limit_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_range_respects_limit(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<range_bounds_are_inclusive_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_range_bounds_are_inclusive(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<add_overwrites_score_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_add_overwrites_score(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<remove_if_present_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_remove_if_present(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<compare_and_rescore_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_compare_and_rescore(store).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            $(#[$attr])*
            async fn [<compare_and_rescore_is_exclusive_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_compare_and_rescore_is_exclusive(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<remove_if_score_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_remove_if_score(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<records_lifecycle_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_records_lifecycle(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<keys_are_isolated_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_keys_are_isolated(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn [<missing_key_is_empty_ $backend>]() {
                let store = $setup_expr;
                $crate::store_spec::test_missing_key_is_empty(store).await;
            }
        }
    };
}

use crate::core::score_clock::MIN_SCORE;
use crate::core::store::{ScoredMember, Store};
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

/// A key nobody else uses, so tests can share a live backend.
pub fn unique_key(name: &str) -> String {
    format!("deferral-spec:{}:{}", name, Uuid::now_v7())
}

fn members(entries: &[ScoredMember]) -> Vec<&str> {
    entries.iter().map(|e| e.member.as_str()).collect()
}

/// Equal scores come back ordered by member; members above `max` are left out.
pub async fn test_range_orders_by_score_then_member<S: Store>(store: S) {
    let key = unique_key("order");
    store.add(&key, "B", 100).await.unwrap();
    store.add(&key, "D", 300).await.unwrap();
    store.add(&key, "A", 100).await.unwrap();
    store.add(&key, "C", 90).await.unwrap();

    let due = store.range_by_score(&key, MIN_SCORE, 200, 10).await.unwrap();

    assert_eq!(members(&due), vec!["C", "A", "B"]);
    assert_eq!(due[0], ScoredMember::new("C", 90));
    assert_eq!(due[1].score, 100);
}

pub async fn test_range_respects_limit<S: Store>(store: S) {
    let key = unique_key("limit");
    for (i, member) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        store.add(&key, member, i as i64).await.unwrap();
    }

    let page = store.range_by_score(&key, MIN_SCORE, 100, 2).await.unwrap();
    assert_eq!(members(&page), vec!["a", "b"]);

    let empty = store.range_by_score(&key, MIN_SCORE, 100, 0).await.unwrap();
    assert!(empty.is_empty());
}

pub async fn test_range_bounds_are_inclusive<S: Store>(store: S) {
    let key = unique_key("bounds");
    store.add(&key, "early", 99).await.unwrap();
    store.add(&key, "on-time", 100).await.unwrap();
    store.add(&key, "late", 101).await.unwrap();

    let exact = store.range_by_score(&key, 100, 100, 10).await.unwrap();
    assert_eq!(members(&exact), vec!["on-time"]);

    let negative = unique_key("negative");
    store.add(&negative, "past", -5).await.unwrap();
    let due = store.range_by_score(&negative, MIN_SCORE, 0, 10).await.unwrap();
    assert_eq!(members(&due), vec!["past"]);
}

pub async fn test_add_overwrites_score<S: Store>(store: S) {
    let key = unique_key("overwrite");
    store.add(&key, "a", 10).await.unwrap();
    store.add(&key, "a", 500).await.unwrap();

    assert_eq!(store.count(&key).await.unwrap(), 1);
    assert!(store
        .range_by_score(&key, MIN_SCORE, 100, 10)
        .await
        .unwrap()
        .is_empty());
    let later = store.range_by_score(&key, MIN_SCORE, 500, 10).await.unwrap();
    assert_eq!(later, vec![ScoredMember::new("a", 500)]);
}

pub async fn test_remove_if_present<S: Store>(store: S) {
    let key = unique_key("remove");
    store.add(&key, "a", 1).await.unwrap();

    assert!(store.remove_if_present(&key, "a").await.unwrap());
    assert!(!store.remove_if_present(&key, "a").await.unwrap());
    assert!(!store.remove_if_present(&key, "never-added").await.unwrap());
    assert_eq!(store.count(&key).await.unwrap(), 0);
}

pub async fn test_compare_and_rescore<S: Store>(store: S) {
    let key = unique_key("rescore");
    store.add(&key, "a", 100).await.unwrap();

    // Stale expectation leaves the member alone.
    assert!(!store.compare_and_rescore(&key, "a", 99, 5_000).await.unwrap());
    let due = store.range_by_score(&key, MIN_SCORE, 100, 10).await.unwrap();
    assert_eq!(due, vec![ScoredMember::new("a", 100)]);

    assert!(store.compare_and_rescore(&key, "a", 100, 5_000).await.unwrap());
    assert!(store
        .range_by_score(&key, MIN_SCORE, 4_999, 10)
        .await
        .unwrap()
        .is_empty());

    // The old score no longer matches.
    assert!(!store.compare_and_rescore(&key, "a", 100, 7_000).await.unwrap());
    assert!(!store
        .compare_and_rescore(&key, "missing", 100, 7_000)
        .await
        .unwrap());
    assert_eq!(store.count(&key).await.unwrap(), 1);
}

/// Many concurrent claimers, one winner.
pub async fn test_compare_and_rescore_is_exclusive<S: Store + 'static>(store: S) {
    let key = unique_key("exclusive");
    store.add(&key, "contended", 100).await.unwrap();

    let store = Arc::new(store);
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16 {
        let store = store.clone();
        let key = key.clone();
        tasks.spawn(async move {
            store
                .compare_and_rescore(&key, "contended", 100, 10_000 + i)
                .await
                .unwrap()
        });
    }

    let mut winners = 0;
    while let Some(won) = tasks.join_next().await {
        if won.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

pub async fn test_remove_if_score<S: Store>(store: S) {
    let key = unique_key("remove-if-score");
    store.add(&key, "a", 100).await.unwrap();

    assert!(!store.remove_if_score(&key, "a", 101).await.unwrap());
    assert_eq!(store.count(&key).await.unwrap(), 1);

    assert!(store.remove_if_score(&key, "a", 100).await.unwrap());
    assert_eq!(store.count(&key).await.unwrap(), 0);
    assert!(!store.remove_if_score(&key, "a", 100).await.unwrap());
}

pub async fn test_records_lifecycle<S: Store>(store: S) {
    let key = unique_key("records");

    assert_eq!(store.get_record(&key, "a").await.unwrap(), None);

    store
        .put_record(&key, "a", Bytes::from_static(b"first"))
        .await
        .unwrap();
    store
        .put_record(&key, "a", Bytes::from_static(b"second"))
        .await
        .unwrap();
    assert_eq!(
        store.get_record(&key, "a").await.unwrap(),
        Some(Bytes::from_static(b"second"))
    );

    // Records do not count as set members.
    assert_eq!(store.count(&key).await.unwrap(), 0);

    assert!(store.remove_record(&key, "a").await.unwrap());
    assert!(!store.remove_record(&key, "a").await.unwrap());
    assert_eq!(store.get_record(&key, "a").await.unwrap(), None);
}

pub async fn test_keys_are_isolated<S: Store>(store: S) {
    let first = unique_key("first");
    let second = unique_key("second");

    store.add(&first, "shared", 1).await.unwrap();
    store
        .put_record(&first, "shared", Bytes::from_static(b"one"))
        .await
        .unwrap();

    assert_eq!(store.count(&second).await.unwrap(), 0);
    assert_eq!(store.get_record(&second, "shared").await.unwrap(), None);
    assert!(!store.remove_if_present(&second, "shared").await.unwrap());
    assert_eq!(store.count(&first).await.unwrap(), 1);
}

pub async fn test_missing_key_is_empty<S: Store>(store: S) {
    let key = unique_key("missing");

    assert!(store
        .range_by_score(&key, MIN_SCORE, i64::MAX, 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.count(&key).await.unwrap(), 0);
    assert!(!store.remove_if_score(&key, "a", 0).await.unwrap());
    assert!(!store.compare_and_rescore(&key, "a", 0, 1).await.unwrap());
}
