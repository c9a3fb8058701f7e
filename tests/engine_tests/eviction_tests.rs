//! Tests for LRU eviction
//!
//! These tests verify:
//! - Exactly the least recently used entry goes when the segment is full
//! - `get` promotes, `peek`/`has`/enumeration do not
//! - Multi-block values evict as many entries as they need
//! - An entry being rewritten is never its own victim
//! - Block accounting after eviction

use shmcache::{BlockSize, Cache, CacheError, Config, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// A 4 KiB segment of 64 byte blocks, filled with one single-block entry
/// (`k0`, `k1`, ...) per block, inserted in order
fn setup_full_cache() -> (TempDir, Cache, u32) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .shm_dir(temp_dir.path())
        .name("evict")
        .total_size(4096)
        .block_size(BlockSize::B64)
        .build();
    let cache = Cache::open_with(&config).unwrap();

    let n = cache.stats().unwrap().block_count;
    for i in 0..n {
        cache.set(&format!("k{}", i), &Value::from(i)).unwrap();
    }
    let stats = cache.stats().unwrap();
    assert_eq!(stats.free_blocks, 0);
    assert_eq!(stats.entries, n);
    (temp_dir, cache, n)
}

fn absent(cache: &Cache, n: u32) -> Vec<String> {
    (0..n)
        .map(|i| format!("k{}", i))
        .filter(|key| !cache.has(key).unwrap())
        .collect()
}

// =============================================================================
// LRU Order Tests
// =============================================================================

#[test]
fn test_insert_into_full_segment_evicts_oldest() {
    let (_temp, cache, n) = setup_full_cache();

    cache.set("new", &Value::from(-1)).unwrap();

    assert_eq!(absent(&cache, n), vec!["k0"]);
    assert!(cache.has("new").unwrap());

    let stats = cache.check().unwrap();
    assert_eq!(stats.entries, n);
    assert_eq!(stats.used_blocks, n);
    assert_eq!(stats.free_blocks, stats.block_count - n);
    assert_eq!(stats.evictions, 1);
}

#[test]
fn test_get_promotes_entry() {
    let (_temp, cache, n) = setup_full_cache();

    cache.get("k0").unwrap();
    cache.set("new", &Value::Null).unwrap();

    assert_eq!(absent(&cache, n), vec!["k1"]);
}

#[test]
fn test_peek_and_enumeration_do_not_promote() {
    let (_temp, cache, n) = setup_full_cache();

    cache.peek("k0").unwrap();
    cache.has("k0").unwrap();
    cache.keys().unwrap().for_each(drop);
    for entry in cache.entries().unwrap() {
        entry.unwrap();
    }
    cache.dump(None).unwrap();
    cache.set("new", &Value::Null).unwrap();

    assert_eq!(absent(&cache, n), vec!["k0"]);
}

#[test]
fn test_overwrite_promotes_entry() {
    let (_temp, cache, n) = setup_full_cache();

    cache.set("k0", &Value::from(100)).unwrap();
    cache.set("new", &Value::Null).unwrap();

    assert_eq!(absent(&cache, n), vec!["k1"]);
}

#[test]
fn test_increase_promotes_entry() {
    let (_temp, cache, n) = setup_full_cache();

    cache.increase("k0", 1.0).unwrap();
    cache.set("new", &Value::Null).unwrap();

    assert_eq!(absent(&cache, n), vec!["k1"]);
    assert_eq!(cache.peek("k0").unwrap(), Some(Value::from(1)));
}

// =============================================================================
// Multi-Block Tests
// =============================================================================

#[test]
fn test_large_value_evicts_several_entries() {
    let (_temp, cache, n) = setup_full_cache();

    // 40 + 3 + 149 bytes: three blocks
    let value = Value::String("x".repeat(146));
    cache.set("big", &value).unwrap();

    assert_eq!(absent(&cache, n), vec!["k0", "k1", "k2"]);
    assert_eq!(cache.stats().unwrap().evictions, 3);
    cache.check().unwrap();
}

#[test]
fn test_growing_entry_is_not_its_own_victim() {
    let (_temp, cache, n) = setup_full_cache();

    // k0 is least recently used, yet it grows by evicting others
    let value = Value::String("x".repeat(140));
    cache.set("k0", &value).unwrap();

    assert_eq!(absent(&cache, n), vec!["k1", "k2"]);
    assert_eq!(cache.peek("k0").unwrap(), Some(value));
    assert_eq!(cache.keys().unwrap().next().as_deref(), Some("k0"));
    cache.check().unwrap();
}

#[test]
fn test_value_filling_whole_segment_evicts_everything_else() {
    let (_temp, cache, n) = setup_full_cache();

    // Record of exactly n blocks: 40 + 3 (key) + 1 (tag) + 2 (len) + len
    let len = n as usize * 64 - 40 - 3 - 3;
    cache.set("all", &Value::String("x".repeat(len))).unwrap();

    assert_eq!(absent(&cache, n).len(), n as usize);
    let stats = cache.check().unwrap();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.free_blocks, 0);

    // One byte more can never fit
    let err = cache
        .set("all", &Value::String("x".repeat(len + 1)))
        .unwrap_err();
    assert!(matches!(err, CacheError::OutOfSpace { .. }));
    assert!(cache.has("all").unwrap());
}

#[test]
fn test_shrinking_overwrite_frees_blocks() {
    let (_temp, cache, _n) = setup_full_cache();

    cache.set("big", &Value::String("x".repeat(146))).unwrap();
    let before = cache.stats().unwrap().free_blocks;
    cache.set("big", &Value::Null).unwrap();
    assert_eq!(cache.stats().unwrap().free_blocks, before + 2);
    cache.check().unwrap();
}
