//! Key index
//!
//! Chained hash table from key to entry head block. Buckets hold the first
//! head block of their chain; each entry record links to the next entry in
//! the same bucket.

use crate::alloc::{Allocator, Chain};
use crate::error::{CacheError, Result};
use crate::segment::layout::{entry, header, Layout, ENTRY_HEADER_SIZE, NIL};
use crate::segment::View;

use super::eviction::Evictor;
use super::order::{Order, OrderList};

/// Hash of a key as stored in its entry record
pub fn hash_key(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Index operations inside one locked segment view
#[derive(Clone, Copy)]
pub struct Index<'a> {
    pub(super) view: View<'a>,
    pub(super) alloc: Allocator<'a>,
    pub(super) insertion: OrderList<'a>,
    pub(super) recency: OrderList<'a>,
}

impl<'a> Index<'a> {
    pub fn new(view: View<'a>) -> Self {
        Self {
            view,
            alloc: Allocator::new(view),
            insertion: OrderList::new(view, Order::Insertion),
            recency: OrderList::new(view, Order::Recency),
        }
    }

    /// Number of live entries
    pub fn len(&self) -> Result<u32> {
        self.view.header(header::ENTRY_COUNT)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn validate_key(&self, key: &str) -> Result<()> {
        let max = self.view.layout.max_key_len();
        if key.len() > max {
            return Err(CacheError::invalid(format!(
                "key of {} bytes exceeds the {} byte limit for {} blocks",
                key.len(),
                max,
                self.view.layout.block_size
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Head block of the entry for `key`
    pub fn find(&self, key: &str) -> Result<Option<u32>> {
        let hash = hash_key(key);
        let mut node = self.bucket_head(hash)?;
        let mut steps = 0u32;

        while node != NIL {
            steps += 1;
            if steps > self.view.layout.block_count {
                return Err(CacheError::corruption(format!(
                    "hash chain for bucket {} does not terminate",
                    self.bucket_of(hash)
                )));
            }
            if self.view.entry_u32(node, entry::HASH)? == hash
                && self.view.entry_u32(node, entry::KEY_LEN)? as usize == key.len()
                && self.key_bytes(node)? == key.as_bytes()
            {
                return Ok(Some(node));
            }
            node = self.view.entry_link(node, entry::HASH_NEXT)?;
        }
        Ok(None)
    }

    pub fn key_of(&self, head: u32) -> Result<String> {
        String::from_utf8(self.key_bytes(head)?)
            .map_err(|_| CacheError::corruption(format!("entry {} key is not UTF-8", head)))
    }

    /// Serialized value bytes of the entry at `head`
    pub fn value_of(&self, head: u32) -> Result<Vec<u8>> {
        let key_len = self.key_len(head)?;
        let value_len = self.view.entry_u32(head, entry::VALUE_LEN)? as usize;
        let blocks = self.view.entry_u32(head, entry::BLOCKS)? as u64;
        if self.view.layout.blocks_for(key_len, value_len) != blocks {
            return Err(CacheError::corruption(format!(
                "entry {} records {} blocks for a {} byte record",
                head,
                blocks,
                Layout::record_len(key_len, value_len)
            )));
        }

        let mut value = vec![0u8; value_len];
        Chain::new(self.view, head).read_at(ENTRY_HEADER_SIZE + key_len, &mut value)?;
        Ok(value)
    }

    /// Blocks owned by the entry at `head`
    pub fn blocks_of(&self, head: u32) -> Result<u32> {
        self.view.entry_u32(head, entry::BLOCKS)
    }

    /// Entry heads in insertion order
    pub fn heads(&self) -> Result<Vec<u32>> {
        self.insertion.collect(self.view.layout.block_count)
    }

    /// Entry heads from least to most recently used
    pub fn heads_by_recency(&self) -> Result<Vec<u32>> {
        self.recency.collect(self.view.layout.block_count)
    }

    /// Entry heads reachable from the hash buckets, bucket by bucket
    pub fn hashed_heads(&self) -> Result<Vec<u32>> {
        let limit = self.len()? as usize;
        let mut heads = Vec::with_capacity(limit);
        for bucket in 0..self.view.layout.bucket_count {
            let offset = self.view.layout.bucket_offset(bucket);
            let mut node = self.view.check_link(self.view.region.u32_at(offset)?)?;
            while node != NIL {
                if heads.len() >= limit {
                    return Err(CacheError::corruption(format!(
                        "hash buckets reach more than the {} counted entries",
                        limit
                    )));
                }
                if self.bucket_of(self.view.entry_u32(node, entry::HASH)?) != bucket {
                    return Err(CacheError::corruption(format!(
                        "entry {} filed under the wrong bucket {}",
                        node, bucket
                    )));
                }
                heads.push(node);
                node = self.view.entry_link(node, entry::HASH_NEXT)?;
            }
        }
        Ok(heads)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Store `value` under `key`
    ///
    /// An existing entry keeps its head block (and so its insertion-order
    /// position); its chain is resized in place while it is shielded from
    /// eviction. A new entry is appended to both orderings.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<u32> {
        self.validate_key(key)?;
        if value.len() > u32::MAX as usize {
            return Err(CacheError::invalid(format!(
                "value of {} bytes exceeds the 4 GiB record limit",
                value.len()
            )));
        }
        let needed = self.view.layout.blocks_for(key.len(), value.len());
        let capacity = self.alloc.capacity();
        if needed > capacity as u64 {
            return Err(CacheError::OutOfSpace {
                needed: needed.min(u32::MAX as u64) as u32,
                capacity,
            });
        }
        let needed = needed as u32;

        let head = match self.find(key)? {
            Some(head) => {
                self.recency.move_to_back(head)?;
                self.resize(head, needed)?;
                head
            }
            None => self.insert(key, needed)?,
        };

        self.view.set_entry_u32(head, entry::VALUE_LEN, value.len() as u32)?;
        Chain::new(self.view, head).write_at(ENTRY_HEADER_SIZE + key.len(), value)?;
        Ok(head)
    }

    /// Remove the entry for `key`; `false` if there was none
    pub fn remove(&self, key: &str) -> Result<bool> {
        match self.find(key)? {
            Some(head) => {
                self.drop_entry(head)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Promote to most recently used
    pub fn touch(&self, head: u32) -> Result<()> {
        self.recency.move_to_back(head)
    }

    /// Unlink the entry from the table and both orderings and free its chain
    pub fn drop_entry(&self, head: u32) -> Result<u32> {
        self.unlink_bucket(head)?;
        self.insertion.unlink(head)?;
        self.recency.unlink(head)?;
        let freed = self.alloc.free_chain(head)?;

        let count = self.len()?;
        if count == 0 {
            return Err(CacheError::corruption("entry count underflow"));
        }
        self.view.set_header(header::ENTRY_COUNT, count - 1)?;
        Ok(freed)
    }

    /// Drop every entry at once
    pub fn clear(&self) -> Result<()> {
        self.view.reset_contents()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn insert(&self, key: &str, blocks: u32) -> Result<u32> {
        let mut evictor = Evictor::new(*self, None);
        let head = self.alloc.allocate(blocks, &mut evictor)?;
        let hash = hash_key(key);

        self.view.set_entry_u32(head, entry::HASH, hash)?;
        self.view.set_entry_u32(head, entry::BLOCKS, blocks)?;
        self.view.set_entry_u32(head, entry::KEY_LEN, key.len() as u32)?;
        Chain::new(self.view, head).write_at(ENTRY_HEADER_SIZE, key.as_bytes())?;

        // Bucket chains are LIFO
        let bucket = self.bucket_of(hash);
        let first = self.bucket_head(hash)?;
        self.view.set_entry_u32(head, entry::HASH_NEXT, first)?;
        self.view
            .region
            .set_u32(self.view.layout.bucket_offset(bucket), head)?;

        self.insertion.push_back(head)?;
        self.recency.push_back(head)?;
        self.view.set_header(header::ENTRY_COUNT, self.len()? + 1)?;
        Ok(head)
    }

    fn resize(&self, head: u32, needed: u32) -> Result<()> {
        let have = self.blocks_of(head)?;
        if needed > have {
            let tail = self.alloc.nth(head, have - 1)?;
            let mut evictor = Evictor::new(*self, Some(head));
            self.alloc.extend(tail, needed - have, &mut evictor)?;
        } else if needed < have {
            self.alloc.truncate(head, needed)?;
        }
        self.view.set_entry_u32(head, entry::BLOCKS, needed)
    }

    fn unlink_bucket(&self, head: u32) -> Result<()> {
        let hash = self.view.entry_u32(head, entry::HASH)?;
        let bucket_offset = self.view.layout.bucket_offset(self.bucket_of(hash));
        let after = self.view.entry_link(head, entry::HASH_NEXT)?;

        let mut node = self.bucket_head(hash)?;
        if node == head {
            return self.view.region.set_u32(bucket_offset, after);
        }
        let mut steps = 0u32;
        while node != NIL {
            steps += 1;
            if steps > self.view.layout.block_count {
                break;
            }
            let next = self.view.entry_link(node, entry::HASH_NEXT)?;
            if next == head {
                return self.view.set_entry_u32(node, entry::HASH_NEXT, after);
            }
            node = next;
        }
        Err(CacheError::corruption(format!(
            "entry {} missing from its hash bucket",
            head
        )))
    }

    fn bucket_of(&self, hash: u32) -> u32 {
        hash & (self.view.layout.bucket_count - 1)
    }

    fn bucket_head(&self, hash: u32) -> Result<u32> {
        let offset = self.view.layout.bucket_offset(self.bucket_of(hash));
        let head = self.view.region.u32_at(offset)?;
        self.view.check_link(head)
    }

    fn key_len(&self, head: u32) -> Result<usize> {
        let key_len = self.view.entry_u32(head, entry::KEY_LEN)? as usize;
        if key_len > self.view.layout.max_key_len() {
            return Err(CacheError::corruption(format!(
                "entry {} records a {} byte key",
                head, key_len
            )));
        }
        Ok(key_len)
    }

    fn key_bytes(&self, head: u32) -> Result<Vec<u8>> {
        let mut key = vec![0u8; self.key_len(head)?];
        Chain::new(self.view, head).read_at(ENTRY_HEADER_SIZE, &mut key)?;
        Ok(key)
    }
}
