//! Engine Module
//!
//! The cache facade that coordinates all components.
//!
//! ## Responsibilities
//! - Encode values before taking the guard, decode them after releasing it
//! - Run every index/allocator step inside one guarded section
//! - Report segment statistics and verify segment integrity
//!
//! ## Concurrency Model
//!
//! Every call takes the segment guard exactly once, so all mutations
//! (set/delete/increase/clear, and the evictions they trigger) are
//! linearizable across processes. `get` also takes it as a writer because
//! it moves the entry in the recency order. `peek`, `has`, stats and
//! enumeration take it shared and overlap with each other, in this process
//! and in others.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alloc::{Allocator, Chain};
use crate::codec::{self, Value};
use crate::config::{BlockSize, Config};
use crate::error::{CacheError, Result};
use crate::index::Index;
use crate::iter::{Entries, Keys};
use crate::segment::layout::header;
use crate::segment::{self, Segment, View};

/// Handle to a shared cache segment
///
/// Cheap to clone; clones share one mapping. Opening the same name twice in
/// a process also yields handles to one mapping.
#[derive(Clone)]
pub struct Cache {
    segment: Arc<Segment>,
}

/// Point-in-time counters of a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub name: String,
    pub total_size: u64,
    pub block_size: u32,
    pub block_count: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub entries: u32,
    pub evictions: u64,
    pub lock_steals: u32,
    pub recoveries: u32,
}

impl Cache {
    /// Open or create segment `name` in the default shared memory directory
    ///
    /// `total_size` and `block_size` are validated on every call but only
    /// used when the segment does not exist yet.
    pub fn open(name: &str, total_size: u64, block_size: BlockSize) -> Result<Self> {
        let config = Config::builder()
            .name(name)
            .total_size(total_size)
            .block_size(block_size)
            .build();
        Self::open_with(&config)
    }

    pub fn open_with(config: &Config) -> Result<Self> {
        Ok(Self {
            segment: Segment::open(config)?,
        })
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Value for `key`, promoting it to most recently used
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let bytes = self.segment.with_write(|view| {
            let index = Index::new(view);
            match index.find(key)? {
                Some(head) => {
                    index.touch(head)?;
                    index.value_of(head).map(Some)
                }
                None => Ok(None),
            }
        })?;
        bytes.map(|bytes| self.decode_stored(key, &bytes)).transpose()
    }

    /// Value for `key`, leaving the recency order alone
    pub fn peek(&self, key: &str) -> Result<Option<Value>> {
        let bytes = self.segment.with_read(|view| {
            let index = Index::new(view);
            match index.find(key)? {
                Some(head) => index.value_of(head).map(Some),
                None => Ok(None),
            }
        })?;
        bytes.map(|bytes| self.decode_stored(key, &bytes)).transpose()
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        self.segment
            .with_read(|view| Ok(Index::new(view).find(key)?.is_some()))
    }

    pub fn len(&self) -> Result<u32> {
        self.segment.with_read(|view| Index::new(view).len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Store `value` under `key`
    ///
    /// Evicts least recently used entries as needed; fails with
    /// `OutOfSpace` only if the value cannot fit even in an empty segment,
    /// in which case nothing has changed.
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let bytes = codec::encode(value)?;
        self.segment
            .with_write(|view| Index::new(view).put(key, &bytes).map(|_| ()))
    }

    /// Remove `key`; `false` if it was absent
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.segment.with_write(|view| Index::new(view).remove(key))
    }

    /// Drop every entry
    pub fn clear(&self) -> Result<()> {
        self.segment.with_write(|view| Index::new(view).clear())
    }

    /// Atomically add `delta` to the number under `key` and return the sum
    ///
    /// An absent key, or one holding anything but a number, counts as 0.
    pub fn increase(&self, key: &str, delta: f64) -> Result<f64> {
        self.segment.with_write(|view| {
            let index = Index::new(view);
            let current = match index.find(key)? {
                Some(head) => codec::decode_number_or_zero(&index.value_of(head)?),
                None => 0.0,
            };
            let next = current + delta;
            index.put(key, &codec::encode(&Value::Number(next))?)?;
            Ok(next)
        })
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Snapshot of the keys in insertion order
    pub fn keys(&self) -> Result<Keys> {
        let keys = self.segment.with_read(|view| {
            let index = Index::new(view);
            index
                .heads()?
                .into_iter()
                .map(|head| index.key_of(head))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(Keys::new(keys))
    }

    /// `(key, value)` pairs in insertion order
    pub fn entries(&self) -> Result<Entries> {
        Ok(Entries::new(self.clone(), self.keys()?))
    }

    /// Every entry whose key starts with `prefix` (all if `None`), as a
    /// `Value::Map` in insertion order
    ///
    /// The raw values are copied in one guarded section and decoded after,
    /// so the result is a consistent snapshot.
    pub fn dump(&self, prefix: Option<&str>) -> Result<Value> {
        let raw = self.segment.with_read(|view| {
            let index = Index::new(view);
            let mut raw = Vec::new();
            for head in index.heads()? {
                let key = index.key_of(head)?;
                if prefix.map_or(true, |p| key.starts_with(p)) {
                    let bytes = index.value_of(head)?;
                    raw.push((key, bytes));
                }
            }
            Ok(raw)
        })?;

        let dumped = Value::empty_map();
        for (key, bytes) in raw {
            let value = self.decode_stored(&key, &bytes)?;
            dumped.insert(key, value);
        }
        Ok(dumped)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Unlink this handle's segment; later opens of the name start empty
    pub fn release(&self) -> Result<bool> {
        self.segment.unlink()
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn stats(&self) -> Result<SegmentStats> {
        self.segment.with_read(|view| self.read_stats(view))
    }

    /// Walk every structure in the segment and verify the accounting
    ///
    /// Checks that the free list and all entry chains partition the block
    /// pool, that both orderings and the hash table reach exactly the live
    /// entries, and that every chain has the length its record implies.
    pub fn check(&self) -> Result<SegmentStats> {
        self.segment.with_read(|view| {
            let index = Index::new(view);
            let alloc = Allocator::new(view);
            let block_count = view.layout.block_count as usize;
            let mut owner = vec![false; block_count];
            let mut claim = |block: u32, what: &dyn Fn() -> String| -> Result<()> {
                let slot = &mut owner[block as usize];
                if *slot {
                    return Err(CacheError::corruption(format!(
                        "block {} claimed twice (again by {})",
                        block,
                        what()
                    )));
                }
                *slot = true;
                Ok(())
            };

            for block in alloc.free_blocks()? {
                claim(block, &|| "the free list".to_string())?;
            }

            let insertion = index.heads()?;
            for &head in &insertion {
                let key = index.key_of(head)?;
                // also validates the recorded block count
                index.value_of(head)?;
                let blocks = Chain::new(view, head).blocks()?;
                if blocks.len() as u32 != index.blocks_of(head)? {
                    return Err(CacheError::corruption(format!(
                        "entry {:?} chain has {} blocks, record says {}",
                        key,
                        blocks.len(),
                        index.blocks_of(head)?
                    )));
                }
                for block in blocks {
                    claim(block, &|| format!("entry {:?}", key))?;
                }
                if index.find(&key)? != Some(head) {
                    return Err(CacheError::corruption(format!(
                        "entry {:?} not reachable through its hash bucket",
                        key
                    )));
                }
            }

            let claimed = owner.iter().filter(|&&owned| owned).count();
            if claimed != block_count {
                return Err(CacheError::corruption(format!(
                    "{} of {} blocks are neither free nor owned",
                    block_count - claimed,
                    block_count
                )));
            }

            let mut by_insertion = insertion.clone();
            let mut by_recency = index.heads_by_recency()?;
            let mut by_hash = index.hashed_heads()?;
            by_insertion.sort_unstable();
            by_recency.sort_unstable();
            by_hash.sort_unstable();
            if by_recency != by_insertion || by_hash != by_insertion {
                return Err(CacheError::corruption(
                    "insertion order, recency order and hash table disagree on the live entries",
                ));
            }
            if insertion.len() as u32 != index.len()? {
                return Err(CacheError::corruption(format!(
                    "{} entries linked but {} counted",
                    insertion.len(),
                    index.len()?
                )));
            }

            self.read_stats(view)
        })
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn read_stats(&self, view: View<'_>) -> Result<SegmentStats> {
        let free_blocks = Allocator::new(view).free_count()?;
        let block_count = view.layout.block_count;
        Ok(SegmentStats {
            name: self.segment.name().to_string(),
            total_size: view.layout.total_size,
            block_size: view.layout.block_size.bytes(),
            block_count,
            free_blocks,
            used_blocks: block_count.saturating_sub(free_blocks),
            entries: view.header(header::ENTRY_COUNT)?,
            evictions: view.region.u64_at(header::EVICTIONS)?,
            lock_steals: view.header(header::LOCK_STEALS)?,
            recoveries: view.header(header::RECOVERIES)?,
        })
    }

    /// Decode a value read from the segment; failure means the segment is
    /// damaged, not that the caller erred
    fn decode_stored(&self, key: &str, bytes: &[u8]) -> Result<Value> {
        codec::decode(bytes).map_err(|e| {
            let error = CacheError::corruption(format!("stored value for {:?}: {}", key, e));
            self.segment.poison_on(&error);
            error
        })
    }
}

/// Unlink segment `name` from the default shared memory directory
pub fn release(name: &str) -> Result<bool> {
    release_with(&Config::builder().name(name).build())
}

pub fn release_with(config: &Config) -> Result<bool> {
    segment::release(config)
}
