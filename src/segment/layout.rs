//! Segment layout
//!
//! Byte offsets of everything that lives in a segment. Every link stored in
//! the segment is a `u32` block index so the structures mean the same thing
//! in every process's mapping.

use crate::config::BlockSize;
use crate::error::{CacheError, Result};

/// "SHMCACH1"
pub const MAGIC: u64 = 0x3148_4341_434d_4853;

/// Bumped whenever the on-segment format changes
pub const FORMAT_VERSION: u32 = 2;

/// Terminates chains, the free list, hash chains and both orderings
pub const NIL: u32 = u32::MAX;

/// Fixed header at offset 0
pub const HEADER_SIZE: usize = 128;

/// Entry record header at the start of an entry's head block
pub const ENTRY_HEADER_SIZE: usize = 40;

/// Longest key accepted, in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Largest segment accepted (1 TiB)
pub const MAX_SEGMENT_SIZE: u64 = 1 << 40;

pub const MIN_BUCKETS: u32 = 8;
pub const MAX_BUCKETS: u32 = 1 << 20;

/// Concurrent shared holders the header has room for
pub const READER_SLOTS: usize = 4;

/// The block pool starts on a cache-line boundary
const POOL_ALIGN: u64 = 64;

/// Header field offsets
///
/// ```text
///  0 magic        8 version     12 init state  16 lock owner (u64)
/// 24 dirty       28 block size  32 total size (u64)
/// 40 blocks      44 buckets     48 free head   52 free count
/// 56 entries     60 order head  64 order tail  68 lru head
/// 72 lru tail    76 steals      80 evictions (u64)
/// 88 recoveries  96 reader slots (4 x u64)
/// ```
pub mod header {
    pub const MAGIC: usize = 0; // u64
    pub const VERSION: usize = 8; // u32
    pub const INIT_STATE: usize = 12; // atomic u32
    pub const LOCK_OWNER: usize = 16; // atomic u64 (owner id, 0 = free)
    pub const DIRTY: usize = 24; // atomic u32
    pub const BLOCK_SIZE: usize = 28; // written before the object is sized
    pub const TOTAL_SIZE: usize = 32; // u64
    pub const BLOCK_COUNT: usize = 40;
    pub const BUCKET_COUNT: usize = 44;
    pub const FREE_HEAD: usize = 48;
    pub const FREE_COUNT: usize = 52;
    pub const ENTRY_COUNT: usize = 56;
    pub const ORDER_HEAD: usize = 60;
    pub const ORDER_TAIL: usize = 64;
    pub const LRU_HEAD: usize = 68; // least recently used
    pub const LRU_TAIL: usize = 72; // most recently used
    pub const LOCK_STEALS: usize = 76;
    pub const EVICTIONS: usize = 80; // u64
    pub const RECOVERIES: usize = 88;
    pub const READERS: usize = 96; // atomic u64 each, 0 = free
}

/// Entry record field offsets, relative to the head block
pub mod entry {
    pub const HASH: usize = 0;
    pub const HASH_NEXT: usize = 4;
    pub const ORDER_PREV: usize = 8;
    pub const ORDER_NEXT: usize = 12;
    pub const LRU_PREV: usize = 16;
    pub const LRU_NEXT: usize = 20;
    pub const BLOCKS: usize = 24;
    pub const VALUE_LEN: usize = 28;
    pub const KEY_LEN: usize = 32;
}

/// Init state values
pub const STATE_FRESH: u32 = 0;
pub const STATE_READY: u32 = 2;

/// Computed geometry of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub total_size: u64,
    pub block_size: BlockSize,
    pub block_count: u32,
    pub bucket_count: u32,
    pub buckets_offset: usize,
    pub nexts_offset: usize,
    pub pool_offset: usize,
}

impl Layout {
    /// Compute the layout for a segment of `total_size` bytes
    ///
    /// Fails with `InvalidArgument` unless the size fits the header, the
    /// minimum bucket table and at least one block.
    pub fn compute(total_size: u64, block_size: BlockSize) -> Result<Self> {
        if total_size > MAX_SEGMENT_SIZE || total_size > isize::MAX as u64 {
            return Err(CacheError::invalid(format!(
                "total size {} exceeds the maximum of {} bytes",
                total_size, MAX_SEGMENT_SIZE
            )));
        }
        let min = Self::min_total_size(block_size);
        if total_size < min {
            return Err(CacheError::invalid(format!(
                "total size {} too small for {} blocks: need at least {} bytes",
                total_size, block_size, min
            )));
        }

        let bs = block_size.bytes() as u64;
        let usable = total_size - HEADER_SIZE as u64;

        // Buckets sized from a first estimate that ignores the bucket table
        let estimate = (usable / (bs + 4)).max(1);
        let bucket_count = (estimate.min(MAX_BUCKETS as u64) as u32)
            .next_power_of_two()
            .clamp(MIN_BUCKETS, MAX_BUCKETS);

        let buckets_offset = HEADER_SIZE as u64;
        let nexts_offset = buckets_offset + bucket_count as u64 * 4;

        let mut block_count = (total_size - nexts_offset) / (bs + 4);
        let mut pool_offset = align_up(nexts_offset + block_count * 4, POOL_ALIGN);
        while block_count > 0 && pool_offset + block_count * bs > total_size {
            block_count -= 1;
            pool_offset = align_up(nexts_offset + block_count * 4, POOL_ALIGN);
        }

        if block_count == 0 {
            return Err(CacheError::invalid(format!(
                "total size {} leaves no room for a {} block",
                total_size, block_size
            )));
        }
        if block_count >= NIL as u64 {
            return Err(CacheError::invalid(format!(
                "total size {} needs more than {} blocks of {}",
                total_size,
                NIL - 1,
                block_size
            )));
        }

        Ok(Self {
            total_size,
            block_size,
            block_count: block_count as u32,
            bucket_count,
            buckets_offset: buckets_offset as usize,
            nexts_offset: nexts_offset as usize,
            pool_offset: pool_offset as usize,
        })
    }

    /// Smallest accepted segment for a block size: the header, the minimum
    /// bucket table, one next-pointer and exactly one block
    pub fn min_total_size(block_size: BlockSize) -> u64 {
        align_up(HEADER_SIZE as u64 + MIN_BUCKETS as u64 * 4 + 4, POOL_ALIGN)
            + block_size.bytes() as u64
    }

    pub fn block_bytes(&self) -> usize {
        self.block_size.bytes() as usize
    }

    /// Byte offset of a block in the region
    pub fn block_offset(&self, block: u32) -> usize {
        self.pool_offset + block as usize * self.block_bytes()
    }

    /// Byte offset of a block's next-pointer
    pub fn next_offset(&self, block: u32) -> usize {
        self.nexts_offset + block as usize * 4
    }

    pub fn bucket_offset(&self, bucket: u32) -> usize {
        self.buckets_offset + bucket as usize * 4
    }

    /// Bytes of an entry record holding this key and value
    pub fn record_len(key_len: usize, value_len: usize) -> usize {
        ENTRY_HEADER_SIZE + key_len + value_len
    }

    /// Blocks an entry record needs: `ceil(record_len / block_size)`
    pub fn blocks_for(&self, key_len: usize, value_len: usize) -> u64 {
        let len = Self::record_len(key_len, value_len) as u64;
        len.div_ceil(self.block_bytes() as u64)
    }

    /// Longest key this layout accepts (the key lives in the head block)
    pub fn max_key_len(&self) -> usize {
        MAX_KEY_LEN.min(self.block_bytes() - ENTRY_HEADER_SIZE)
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
