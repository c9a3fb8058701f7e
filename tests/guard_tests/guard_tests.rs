//! Tests for the concurrency guard and crash recovery
//!
//! These tests verify:
//! - A lock left behind by a dead process is reclaimed
//! - A lock held by a live process times out as a transient error
//! - A raised dirty flag makes the next holder reformat the segment
//! - Corruption poisons the handle
//! - Every path to one object shares one mapping and one lock identity
//! - Readers of other processes hold writers off but not other readers

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use shmcache::segment::layout::{header, NIL};
use shmcache::{BlockSize, Cache, CacheError, Config, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &Path, lock_timeout_ms: u64) -> Config {
    Config::builder()
        .shm_dir(dir)
        .name("guard")
        .total_size(64 * 1024)
        .block_size(BlockSize::B64)
        .lock_timeout_ms(lock_timeout_ms)
        .build()
}

fn setup_cache(lock_timeout_ms: u64) -> (TempDir, Cache) {
    let temp_dir = TempDir::new().unwrap();
    let cache = Cache::open_with(&config(temp_dir.path(), lock_timeout_ms)).unwrap();
    (temp_dir, cache)
}

/// Overwrite a u32 header field through the file, as another process would
fn poke_header(dir: &Path, field: usize, value: u32) {
    let file = OpenOptions::new()
        .write(true)
        .open(dir.join("guard"))
        .unwrap();
    file.write_at(&value.to_le_bytes(), field as u64).unwrap();
}

/// Fill reader slot `slot` the way another process's reader would
fn poke_reader(dir: &Path, slot: usize, owner: u64) {
    let file = OpenOptions::new()
        .write(true)
        .open(dir.join("guard"))
        .unwrap();
    file.write_at(&owner.to_le_bytes(), (header::READERS + slot * 8) as u64)
        .unwrap();
}

fn read_u64(dir: &Path, offset: usize) -> u64 {
    let file = OpenOptions::new()
        .read(true)
        .open(dir.join("guard"))
        .unwrap();
    let mut word = [0u8; 8];
    file.read_at(&mut word, offset as u64).unwrap();
    u64::from_le_bytes(word)
}

/// Pid of a process that has exited and been reaped
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// =============================================================================
// Lock Recovery Tests
// =============================================================================

#[test]
fn test_lock_of_dead_holder_is_reclaimed() {
    let (temp, cache) = setup_cache(1000);
    cache.set("k", &Value::from(1)).unwrap();

    poke_header(temp.path(), header::LOCK_OWNER, dead_pid());

    assert_eq!(cache.get("k").unwrap(), Some(Value::from(1)));
    let stats = cache.stats().unwrap();
    assert_eq!(stats.lock_steals, 1);
    assert_eq!(stats.recoveries, 0);
}

#[test]
fn test_lock_of_live_holder_times_out() {
    let (temp, cache) = setup_cache(100);
    let mut holder = Command::new("sleep").arg("30").spawn().unwrap();

    poke_header(temp.path(), header::LOCK_OWNER, holder.id());
    let err = cache.set("k", &Value::Null).unwrap_err();

    holder.kill().unwrap();
    holder.wait().unwrap();

    match &err {
        CacheError::LockTimeout { holder: pid, waited_ms } => {
            assert_eq!(*pid, holder.id());
            assert!(*waited_ms >= 50);
        }
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert!(err.is_transient());
    assert!(!cache.segment().is_poisoned());

    // Holder is gone now: the next call takes the lock over
    cache.set("k", &Value::Null).unwrap();
    assert_eq!(cache.stats().unwrap().lock_steals, 1);
}

#[test]
fn test_lock_naming_own_pid_is_reclaimed() {
    let (temp, cache) = setup_cache(1000);
    poke_header(temp.path(), header::LOCK_OWNER, std::process::id());

    cache.set("k", &Value::from(2)).unwrap();
    assert_eq!(cache.stats().unwrap().lock_steals, 1);
}

// =============================================================================
// Dirty Flag Tests
// =============================================================================

#[test]
fn test_dirty_flag_triggers_reformat() {
    let (temp, cache) = setup_cache(1000);
    for i in 0..10 {
        cache.set(&format!("k{}", i), &Value::from(i)).unwrap();
    }

    // A holder died mid-mutation: lock abandoned, flag left raised
    poke_header(temp.path(), header::DIRTY, 1);
    poke_header(temp.path(), header::LOCK_OWNER, dead_pid());

    assert!(cache.is_empty().unwrap());
    let stats = cache.check().unwrap();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.lock_steals, 1);
    assert_eq!(stats.free_blocks, stats.block_count);

    cache.set("after", &Value::from("ok")).unwrap();
    assert_eq!(cache.get("after").unwrap(), Some(Value::from("ok")));
}

#[test]
fn test_clean_operations_leave_flag_lowered() {
    let (temp, cache) = setup_cache(1000);
    cache.set("k", &Value::Null).unwrap();
    cache.delete("k").unwrap();

    let file = OpenOptions::new()
        .read(true)
        .open(temp.path().join("guard"))
        .unwrap();
    let mut word = [0u8; 4];
    file.read_at(&mut word, header::DIRTY as u64).unwrap();
    assert_eq!(u32::from_le_bytes(word), 0);
    assert_eq!(read_u64(temp.path(), header::LOCK_OWNER), 0);

    // Readers hand their slots back too
    cache.peek("k").unwrap();
    for slot in 0..4 {
        assert_eq!(read_u64(temp.path(), header::READERS + slot * 8), 0);
    }
}

// =============================================================================
// Poisoning Tests
// =============================================================================

#[test]
fn test_corrupt_free_list_poisons_handle() {
    let (temp, cache) = setup_cache(1000);
    cache.set("a", &Value::from(1)).unwrap();

    // Free list head pointing past the pool
    poke_header(temp.path(), header::FREE_HEAD, NIL - 1);

    let err = cache.set("b", &Value::from(2)).unwrap_err();
    assert!(err.is_fatal());
    assert!(cache.segment().is_poisoned());

    // Every later call fails, even ones that would not touch the free list
    assert!(matches!(cache.has("a"), Err(CacheError::Corruption(_))));
}

// =============================================================================
// Segment Identity Tests
// =============================================================================

#[test]
fn test_two_spellings_of_one_segment_share_a_mapping() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("s")).unwrap();

    let plain = Cache::open_with(&config(temp.path(), 1000)).unwrap();
    let dotted = Cache::open_with(&config(&temp.path().join("s").join(".."), 1000)).unwrap();
    assert!(Arc::ptr_eq(plain.segment(), dotted.segment()));

    let workers: Vec<_> = [plain.clone(), dotted.clone()]
        .into_iter()
        .map(|cache| {
            thread::spawn(move || {
                for _ in 0..2000 {
                    cache.increase("hits", 1.0).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(plain.get("hits").unwrap(), Some(Value::Number(4000.0)));
    assert_eq!(plain.stats().unwrap().lock_steals, 0);
}

#[test]
fn test_reopen_after_object_unlinked_elsewhere_is_fresh() {
    let (temp, cache) = setup_cache(1000);
    cache.set("old", &Value::from(1)).unwrap();

    // Another process released the segment
    std::fs::remove_file(temp.path().join("guard")).unwrap();

    let fresh = Cache::open_with(&config(temp.path(), 1000)).unwrap();
    assert!(!Arc::ptr_eq(cache.segment(), fresh.segment()));
    assert!(!fresh.has("old").unwrap());
    assert!(temp.path().join("guard").exists());

    fresh.set("new", &Value::from(2)).unwrap();
    let again = Cache::open_with(&config(temp.path(), 1000)).unwrap();
    assert_eq!(again.get("new").unwrap(), Some(Value::from(2)));

    // The unlinked mapping still works, and releasing it leaves the new
    // object alone
    assert!(cache.has("old").unwrap());
    assert!(!cache.release().unwrap());
    assert!(temp.path().join("guard").exists());
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_reader_of_live_process_holds_off_writers_only() {
    let (temp, cache) = setup_cache(100);
    cache.set("k", &Value::from(7)).unwrap();

    let mut reader = Command::new("sleep").arg("30").spawn().unwrap();
    poke_reader(temp.path(), 1, u64::from(reader.id()));

    // Readers overlap
    assert_eq!(cache.peek("k").unwrap(), Some(Value::from(7)));
    assert!(cache.has("k").unwrap());

    let err = cache.set("k", &Value::from(8)).unwrap_err();
    match &err {
        CacheError::LockTimeout { holder, .. } => assert_eq!(*holder, reader.id()),
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert!(!cache.segment().is_poisoned());

    reader.kill().unwrap();
    reader.wait().unwrap();

    // The dead reader's slot is cleared by the next writer
    cache.set("k", &Value::from(8)).unwrap();
    assert_eq!(read_u64(temp.path(), header::READERS + 8), 0);
    assert_eq!(cache.get("k").unwrap(), Some(Value::from(8)));
}

#[test]
fn test_slot_of_dead_reader_is_cleared() {
    let (temp, cache) = setup_cache(1000);
    poke_reader(temp.path(), 0, u64::from(dead_pid()));

    cache.set("k", &Value::Null).unwrap();
    assert_eq!(read_u64(temp.path(), header::READERS), 0);
    assert_eq!(cache.stats().unwrap().lock_steals, 0);
}

#[test]
fn test_readers_still_work_with_every_slot_taken() {
    let (temp, cache) = setup_cache(100);
    cache.set("k", &Value::from(3)).unwrap();

    let mut reader = Command::new("sleep").arg("30").spawn().unwrap();
    for slot in 0..4 {
        poke_reader(temp.path(), slot, u64::from(reader.id()));
    }

    // No free slot: the reader keeps the word for its read instead
    assert_eq!(cache.peek("k").unwrap(), Some(Value::from(3)));
    assert_eq!(read_u64(temp.path(), header::LOCK_OWNER), 0);

    reader.kill().unwrap();
    reader.wait().unwrap();
    cache.set("k", &Value::from(4)).unwrap();
    for slot in 0..4 {
        assert_eq!(read_u64(temp.path(), header::READERS + slot * 8), 0);
    }
}
