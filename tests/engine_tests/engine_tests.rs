//! Tests for the Cache facade
//!
//! These tests verify:
//! - Basic get/set/delete/has operations
//! - Insertion order across delete and overwrite
//! - Counter semantics
//! - Enumeration snapshots and dump filtering
//! - Concurrent access from many threads
//! - Integrity checking and statistics

use std::sync::Arc;
use std::thread;

use shmcache::{BlockSize, Cache, CacheError, Config, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_cache() -> (TempDir, Cache) {
    setup_sized_cache(256 * 1024, BlockSize::B64)
}

fn setup_sized_cache(size: u64, block_size: BlockSize) -> (TempDir, Cache) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .shm_dir(temp_dir.path())
        .name("engine")
        .total_size(size)
        .block_size(block_size)
        .build();
    let cache = Cache::open_with(&config).unwrap();
    (temp_dir, cache)
}

fn keys_of(cache: &Cache) -> Vec<String> {
    cache.keys().unwrap().collect()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_set_get() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("hello", &Value::from("world")).unwrap();

    assert_eq!(cache.get("hello").unwrap(), Some(Value::from("world")));
}

#[test]
fn test_get_nonexistent_key() {
    let (_temp, cache) = setup_temp_cache();
    assert_eq!(cache.get("nope").unwrap(), None);
    assert_eq!(cache.peek("nope").unwrap(), None);
}

#[test]
fn test_delete_reports_presence() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("k", &Value::from(1)).unwrap();
    assert!(cache.has("k").unwrap());
    assert!(cache.delete("k").unwrap());
    assert!(!cache.has("k").unwrap());
    assert!(!cache.delete("k").unwrap());
}

#[test]
fn test_overwrite_replaces_value() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("k", &Value::from("short")).unwrap();
    cache.set("k", &Value::String("long".repeat(100))).unwrap();
    assert_eq!(cache.get("k").unwrap(), Some(Value::String("long".repeat(100))));

    cache.set("k", &Value::Null).unwrap();
    assert_eq!(cache.get("k").unwrap(), Some(Value::Null));
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
fn test_empty_key_is_a_key() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("", &Value::from(1)).unwrap();
    assert!(cache.has("").unwrap());
    assert_eq!(keys_of(&cache), vec![""]);
}

#[test]
fn test_key_too_long_rejected() {
    let (_temp, cache) = setup_temp_cache();

    // 64 byte blocks leave 24 bytes for the key next to the entry record
    cache.set(&"k".repeat(24), &Value::Null).unwrap();
    let err = cache.set(&"k".repeat(25), &Value::Null).unwrap_err();
    assert!(matches!(err, CacheError::InvalidArgument(_)));

    let (_temp, big) = setup_sized_cache(1 << 20, BlockSize::K1);
    big.set(&"k".repeat(256), &Value::Null).unwrap();
    assert!(big.set(&"k".repeat(257), &Value::Null).is_err());
}

#[test]
fn test_values_are_private_copies() {
    let (_temp, cache) = setup_temp_cache();

    let list = Value::list(vec![Value::from(1)]);
    cache.set("l", &list).unwrap();
    list.push(Value::from(2));

    let stored = cache.get("l").unwrap().unwrap();
    assert_eq!(stored.len(), Some(1));
    stored.push(Value::from(3));
    assert_eq!(cache.get("l").unwrap().unwrap().len(), Some(1));
}

#[test]
fn test_aliasing_survives_storage() {
    let (_temp, cache) = setup_temp_cache();

    let shared = Value::list(vec![Value::from("x")]);
    let value = Value::list(vec![shared.clone(), shared]);
    value.push(value.clone());
    cache.set("graph", &value).unwrap();

    let back = cache.get("graph").unwrap().unwrap();
    assert!(back.at(0).unwrap().same(&back.at(1).unwrap()));
    assert!(back.at(2).unwrap().same(&back));
}

// =============================================================================
// Insertion Order Tests
// =============================================================================

#[test]
fn test_reinsert_after_delete_moves_to_end() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("a", &Value::from(1)).unwrap();
    cache.set("b", &Value::from(2)).unwrap();
    cache.delete("a").unwrap();
    cache.set("a", &Value::from(3)).unwrap();

    assert_eq!(keys_of(&cache), vec!["b", "a"]);
}

#[test]
fn test_overwrite_preserves_position() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("a", &Value::from(1)).unwrap();
    cache.set("b", &Value::from(2)).unwrap();
    cache.set("a", &Value::from(3)).unwrap();

    assert_eq!(keys_of(&cache), vec!["a", "b"]);
    assert_eq!(cache.get("a").unwrap(), Some(Value::from(3)));
}

#[test]
fn test_growing_overwrite_preserves_position() {
    let (_temp, cache) = setup_temp_cache();

    cache.set("a", &Value::from(1)).unwrap();
    cache.set("b", &Value::from(2)).unwrap();
    cache.set("a", &Value::String("x".repeat(500))).unwrap();
    cache.set("a", &Value::from(4)).unwrap();

    assert_eq!(keys_of(&cache), vec!["a", "b"]);
    cache.check().unwrap();
}

#[test]
fn test_many_keys_keep_order() {
    let (_temp, cache) = setup_temp_cache();

    let expected: Vec<String> = (0..500).map(|i| format!("key{:03}", i)).collect();
    for (i, key) in expected.iter().enumerate() {
        cache.set(key, &Value::from(i as u32)).unwrap();
    }

    assert_eq!(keys_of(&cache), expected);
    assert_eq!(cache.len().unwrap(), 500);
    for (i, key) in expected.iter().enumerate() {
        assert_eq!(cache.peek(key).unwrap(), Some(Value::from(i as u32)));
    }
}

// =============================================================================
// Counter Tests
// =============================================================================

#[test]
fn test_increase_absent_key_starts_at_zero() {
    let (_temp, cache) = setup_temp_cache();
    assert_eq!(cache.increase("c", 1.0).unwrap(), 1.0);
    assert_eq!(cache.increase("c", 1.0).unwrap(), 2.0);
    assert_eq!(cache.get("c").unwrap(), Some(Value::Number(2.0)));
}

#[test]
fn test_increase_non_numeric_counts_as_zero() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("c", &Value::from("oops")).unwrap();
    assert_eq!(cache.increase("c", 3.0).unwrap(), 3.0);
}

#[test]
fn test_increase_negative_and_fractional() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("c", &Value::from(10)).unwrap();
    assert_eq!(cache.increase("c", -2.5).unwrap(), 7.5);
}

#[test]
fn test_increase_keeps_insertion_position() {
    let (_temp, cache) = setup_temp_cache();
    cache.increase("a", 1.0).unwrap();
    cache.set("b", &Value::Null).unwrap();
    cache.increase("a", 1.0).unwrap();
    assert_eq!(keys_of(&cache), vec!["a", "b"]);
}

// =============================================================================
// Enumeration Tests
// =============================================================================

#[test]
fn test_keys_is_a_snapshot() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("a", &Value::Null).unwrap();
    cache.set("b", &Value::Null).unwrap();

    let keys = cache.keys().unwrap();
    cache.set("c", &Value::Null).unwrap();
    cache.delete("a").unwrap();

    assert_eq!(keys.collect::<Vec<_>>(), vec!["a", "b"]);
}

#[test]
fn test_entries_skip_keys_deleted_mid_iteration() {
    let (_temp, cache) = setup_temp_cache();
    for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
        cache.set(key, &Value::from(i as u32)).unwrap();
    }

    let mut entries = cache.entries().unwrap();
    let (first, _) = entries.next().unwrap().unwrap();
    assert_eq!(first, "a");

    cache.delete("c").unwrap();
    cache.set("b", &Value::from("changed")).unwrap();

    let rest: Vec<(String, Value)> = entries.map(|entry| entry.unwrap()).collect();
    assert_eq!(
        rest,
        vec![
            ("b".to_string(), Value::from("changed")),
            ("d".to_string(), Value::from(3)),
        ]
    );
}

#[test]
fn test_entries_can_restart_from_clone() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("a", &Value::from(1)).unwrap();
    cache.set("b", &Value::from(2)).unwrap();

    let entries = cache.entries().unwrap();
    let first: Vec<_> = entries.clone().map(|e| e.unwrap().0).collect();
    let second: Vec<_> = entries.map(|e| e.unwrap().0).collect();
    assert_eq!(first, second);
}

#[test]
fn test_dump_filters_by_prefix() {
    let (_temp, cache) = setup_temp_cache();
    cache.set("user:1", &Value::from("ann")).unwrap();
    cache.set("session:1", &Value::from(true)).unwrap();
    cache.set("user:2", &Value::from("bob")).unwrap();

    let users = cache.dump(Some("user:")).unwrap();
    assert_eq!(
        users,
        Value::map([("user:1", Value::from("ann")), ("user:2", Value::from("bob"))])
    );

    let all = cache.dump(None).unwrap();
    assert_eq!(all.len(), Some(3));
    assert_eq!(cache.dump(Some("nothing")).unwrap().len(), Some(0));
}

#[test]
fn test_dump_values_do_not_alias_across_entries() {
    let (_temp, cache) = setup_temp_cache();
    let shared = Value::list(vec![Value::from(1)]);
    cache.set("p:a", &shared).unwrap();
    cache.set("p:b", &shared).unwrap();

    let dumped = cache.dump(Some("p:")).unwrap();
    let a = dumped.get("p:a").unwrap();
    let b = dumped.get("p:b").unwrap();
    assert_eq!(a, b);
    assert!(!a.same(&b));
}

#[test]
fn test_clear_empties_segment() {
    let (_temp, cache) = setup_temp_cache();
    for i in 0..50 {
        cache.set(&format!("k{}", i), &Value::from(i)).unwrap();
    }

    cache.clear().unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.free_blocks, stats.block_count);
    assert!(keys_of(&cache).is_empty());
    assert!(cache.is_empty().unwrap());
}

// =============================================================================
// Space Tests
// =============================================================================

#[test]
fn test_value_larger_than_segment_leaves_state_intact() {
    let (_temp, cache) = setup_sized_cache(4096, BlockSize::B64);
    cache.set("keep", &Value::from("me")).unwrap();

    let err = cache.set("huge", &Value::String("x".repeat(10_000))).unwrap_err();
    assert!(matches!(err, CacheError::OutOfSpace { .. }));
    assert!(!err.is_fatal());

    let err = cache.set("keep", &Value::String("x".repeat(10_000))).unwrap_err();
    assert!(matches!(err, CacheError::OutOfSpace { .. }));

    assert_eq!(cache.get("keep").unwrap(), Some(Value::from("me")));
    assert!(!cache.has("huge").unwrap());
    cache.check().unwrap();
}

#[test]
fn test_chain_sizing_matches_record_length() {
    let (_temp, cache) = setup_temp_cache();

    // 40 byte record + 1 byte key + 151 byte value = exactly 3 blocks
    let value = Value::String("x".repeat(148));
    assert_eq!(shmcache::codec::encode(&value).unwrap().len(), 151);

    let before = cache.stats().unwrap().free_blocks;
    cache.set("k", &value).unwrap();
    assert_eq!(before - cache.stats().unwrap().free_blocks, 3);

    // One more byte spills into a fourth block
    cache.set("k", &Value::String("x".repeat(149))).unwrap();
    assert_eq!(before - cache.stats().unwrap().free_blocks, 4);

    cache.delete("k").unwrap();
    assert_eq!(cache.stats().unwrap().free_blocks, before);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_increase_is_atomic() {
    let (_temp, cache) = setup_temp_cache();
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..200 {
                    cache.increase("hits", 1.0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.get("hits").unwrap(), Some(Value::Number(1600.0)));
}

#[test]
fn test_concurrent_mixed_operations_keep_segment_sound() {
    let (_temp, cache) = setup_sized_cache(32 * 1024, BlockSize::B64);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..300 {
                    let key = format!("k{}", (i * 7 + t) % 40);
                    match i % 4 {
                        0 => cache.set(&key, &Value::String("v".repeat(i % 200))).unwrap(),
                        1 => {
                            cache.delete(&key).unwrap();
                        }
                        2 => {
                            cache.increase(&key, 1.0).unwrap();
                        }
                        _ => {
                            for entry in cache.entries().unwrap() {
                                entry.unwrap();
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.check().unwrap();
    assert_eq!(stats.free_blocks + stats.used_blocks, stats.block_count);
}

// =============================================================================
// Diagnostics Tests
// =============================================================================

#[test]
fn test_stats_track_usage() {
    let (_temp, cache) = setup_temp_cache();
    let empty = cache.stats().unwrap();
    assert_eq!(empty.name, "engine");
    assert_eq!(empty.block_size, 64);
    assert_eq!(empty.used_blocks, 0);

    cache.set("a", &Value::from(1)).unwrap();
    cache.set("b", &Value::String("x".repeat(100))).unwrap();
    let stats = cache.check().unwrap();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.used_blocks, 1 + 3);
    assert_eq!(stats.evictions, 0);
}

#[test]
fn test_stats_serialize_to_json() {
    let (_temp, cache) = setup_temp_cache();
    let json = serde_json::to_value(cache.stats().unwrap()).unwrap();
    assert_eq!(json["name"], "engine");
    assert_eq!(json["entries"], 0);
}
