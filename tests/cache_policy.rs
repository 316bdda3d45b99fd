//! Integration test: document cache eviction order and expiry.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use modelserver::{DocumentCache, LoadOrigin, SourceDocument};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A document whose source text is exactly `raw_bytes` long.
fn document(id: &str, raw_bytes: usize) -> Arc<SourceDocument> {
    let header = format!("data_{}\n", id);
    assert!(raw_bytes > header.len());
    let text = format!("{}#{}", header, "x".repeat(raw_bytes - header.len() - 1));
    Arc::new(SourceDocument::from_text(id, &text).unwrap())
}

const TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[test]
fn overflow_evicts_least_recently_used() {
    // Each document weighs 300; room for three.
    let cache = DocumentCache::new(900, TTL);
    cache.add(document("a", 100));
    cache.add(document("b", 100));
    cache.add(document("c", 100));

    // Touch "a" so "b" becomes the tail.
    assert!(cache.get("a").is_some());
    cache.add(document("d", 100));

    assert_eq!(cache.keys_in_lru_order(), vec!["d", "a", "c"]);
    assert!(!cache.contains("b"));
    assert_eq!(cache.total_bytes(), 900);
}

#[test]
fn large_insert_evicts_only_one_entry() {
    let cache = DocumentCache::new(900, TTL);
    cache.add(document("a", 100));
    cache.add(document("b", 100));
    cache.add(document("big", 250));

    // Only "a" goes; the cache stays over budget until the next insert.
    assert_eq!(cache.keys_in_lru_order(), vec!["big", "b"]);
    assert_eq!(cache.total_bytes(), 1050);
}

#[test]
fn readding_key_keeps_single_entry() {
    let cache = DocumentCache::new(10_000, TTL);
    cache.add(document("1abc", 100));
    cache.add(document("1ABC", 200));

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.total_bytes(), 600);
    let hit = cache.get(" 1abc ").unwrap();
    assert_eq!(hit.origin, LoadOrigin::Cached);
    assert_eq!(hit.document.raw_size, 200);
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn touch_restarts_ttl() {
    let cache = DocumentCache::new(10_000, Duration::from_secs(10));
    cache.add(document("a", 100));
    cache.add(document("b", 100));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(cache.get("a").is_some());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(cache.contains("a"));
    assert!(!cache.contains("b"));
    assert_eq!(cache.total_bytes(), 300);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn expire_all_cancels_timers() {
    let cache = DocumentCache::new(10_000, Duration::from_secs(1));
    cache.add(document("a", 100));
    cache.add(document("b", 100));

    assert_eq!(cache.expire_all(), 2);
    cache.add(document("a", 100));

    // The old timer for "a" must not remove the new entry early.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(cache.contains("a"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!cache.contains("a"));
}

// ---------------------------------------------------------------------------
// LRU order model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Add(u8),
    Get(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..6).prop_map(Op::Add), (0u8..6).prop_map(Op::Get)]
}

proptest! {
    #[test]
    fn prop_order_matches_recency(ops in prop::collection::vec(op(), 1..40)) {
        // Large budget: no evictions, only reordering.
        let cache = DocumentCache::new(usize::MAX, TTL);
        let mut expected: Vec<String> = Vec::new();

        for op in ops {
            match op {
                Op::Add(k) => {
                    let key = format!("k{}", k);
                    cache.add(document(&key, 50));
                    expected.retain(|e| e != &key);
                    expected.insert(0, key);
                }
                Op::Get(k) => {
                    let key = format!("k{}", k);
                    let hit = cache.get(&key).is_some();
                    prop_assert_eq!(hit, expected.contains(&key));
                    if hit {
                        expected.retain(|e| e != &key);
                        expected.insert(0, key);
                    }
                }
            }
        }

        prop_assert_eq!(cache.keys_in_lru_order(), expected.clone());
        prop_assert_eq!(cache.total_bytes(), expected.len() * 150);
    }
}
