//! Eviction controller
//!
//! Pure LRU, on demand only: the allocator asks for blocks, the least
//! recently used entry gives them up. Nothing is evicted on a timer or at a
//! fill threshold.

use crate::alloc::Reclaim;
use crate::error::Result;
use crate::segment::layout::{header, NIL};

use super::table::Index;

impl Index<'_> {
    /// Evict the least recently used entry other than `protect`
    ///
    /// Returns the number of blocks freed, or `None` if no entry is
    /// evictable.
    pub fn evict_one(&self, protect: Option<u32>) -> Result<Option<u32>> {
        let mut victim = self.recency.head()?;
        if victim != NIL && Some(victim) == protect {
            victim = self.recency.next(victim)?;
        }
        if victim == NIL {
            return Ok(None);
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            let key = self.key_of(victim)?;
            tracing::debug!(key = %key, block = victim, "evicting least recently used entry");
        }
        let freed = self.drop_entry(victim)?;
        self.view.bump_counter(header::EVICTIONS, 1)?;
        Ok(Some(freed))
    }
}

/// Feeds the allocator by evicting LRU entries
pub struct Evictor<'a> {
    index: Index<'a>,
    /// Entry being rewritten; never its own victim
    protect: Option<u32>,
}

impl<'a> Evictor<'a> {
    pub fn new(index: Index<'a>, protect: Option<u32>) -> Self {
        Self { index, protect }
    }
}

impl Reclaim for Evictor<'_> {
    fn reclaim_one(&mut self) -> Result<Option<u32>> {
        self.index.evict_one(self.protect)
    }
}
