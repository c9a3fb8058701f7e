//! Block allocator
//!
//! Free blocks form a singly linked list threaded through the `nexts`
//! array; a value's chain is threaded through the same array. A block is
//! always on exactly one of the two.

use crate::error::{CacheError, Result};
use crate::segment::layout::{header, NIL};
use crate::segment::View;

use super::Reclaim;

/// Allocates and frees block chains inside one locked segment view
#[derive(Clone, Copy)]
pub struct Allocator<'a> {
    view: View<'a>,
}

impl<'a> Allocator<'a> {
    pub fn new(view: View<'a>) -> Self {
        Self { view }
    }

    pub fn free_count(&self) -> Result<u32> {
        self.view.header(header::FREE_COUNT)
    }

    pub fn capacity(&self) -> u32 {
        self.view.layout.block_count
    }

    /// Allocate a chain of `n` blocks, evicting through `reclaim` as needed
    ///
    /// Returns the head block. Fails with `OutOfSpace` when the reclaimer
    /// runs dry first; blocks it already freed stay free.
    pub fn allocate(&self, n: u32, reclaim: &mut dyn Reclaim) -> Result<u32> {
        if n == 0 {
            return Err(CacheError::invalid("cannot allocate an empty chain"));
        }
        self.ensure_free(n, reclaim)?;

        let head = self.pop_free()?;
        let mut tail = head;
        for _ in 1..n {
            let block = self.pop_free()?;
            self.view.set_next(tail, block)?;
            tail = block;
        }
        self.view.set_next(tail, NIL)?;
        Ok(head)
    }

    /// Grow the chain ending at `tail` by `n` blocks
    pub fn extend(&self, tail: u32, n: u32, reclaim: &mut dyn Reclaim) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let extra = self.allocate(n, reclaim)?;
        self.view.set_next(tail, extra)
    }

    /// Return every block of the chain at `head` to the free list
    pub fn free_chain(&self, head: u32) -> Result<u32> {
        let mut freed = 0u32;
        let mut block = head;
        while block != NIL {
            if freed >= self.capacity() {
                return Err(CacheError::corruption(format!(
                    "chain at block {} does not terminate",
                    head
                )));
            }
            let next = self.view.next(block)?;
            self.push_free(block)?;
            freed += 1;
            block = next;
        }
        Ok(freed)
    }

    /// Keep the first `keep` blocks of the chain at `head`, free the rest
    pub fn truncate(&self, head: u32, keep: u32) -> Result<u32> {
        if keep == 0 {
            return self.free_chain(head);
        }
        let last = self.nth(head, keep - 1)?;
        let rest = self.view.next(last)?;
        self.view.set_next(last, NIL)?;
        self.free_chain(rest)
    }

    /// The block `index` steps along the chain at `head`
    pub fn nth(&self, head: u32, index: u32) -> Result<u32> {
        let mut block = self.view.check_block(head)?;
        for _ in 0..index {
            block = self.view.next(block)?;
            if block == NIL {
                return Err(CacheError::corruption(format!(
                    "chain at block {} shorter than {} blocks",
                    head,
                    index + 1
                )));
            }
        }
        Ok(block)
    }

    /// Walk the free list, checking it against the recorded free count
    pub fn free_blocks(&self) -> Result<Vec<u32>> {
        let count = self.free_count()?;
        let mut blocks = Vec::with_capacity(count as usize);
        let mut block = self.view.check_link(self.view.header(header::FREE_HEAD)?)?;
        while block != NIL {
            if blocks.len() as u32 >= count {
                return Err(CacheError::corruption(format!(
                    "free list longer than its count of {}",
                    count
                )));
            }
            blocks.push(block);
            block = self.view.next(block)?;
        }
        if blocks.len() as u32 != count {
            return Err(CacheError::corruption(format!(
                "free list has {} blocks but counts {}",
                blocks.len(),
                count
            )));
        }
        Ok(blocks)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_free(&self, n: u32, reclaim: &mut dyn Reclaim) -> Result<()> {
        if n > self.capacity() {
            return Err(CacheError::OutOfSpace {
                needed: n,
                capacity: self.capacity(),
            });
        }
        while self.free_count()? < n {
            match reclaim.reclaim_one()? {
                Some(_) => {}
                None => {
                    tracing::debug!(needed = n, free = self.free_count()?, "out of space after eviction");
                    return Err(CacheError::OutOfSpace {
                        needed: n,
                        capacity: self.capacity(),
                    });
                }
            }
        }
        Ok(())
    }

    fn pop_free(&self) -> Result<u32> {
        let head = self.view.check_link(self.view.header(header::FREE_HEAD)?)?;
        let count = self.free_count()?;
        if head == NIL || count == 0 {
            return Err(CacheError::corruption(format!(
                "free list empty while {} blocks are counted free",
                count
            )));
        }
        let next = self.view.next(head)?;
        self.view.set_header(header::FREE_HEAD, next)?;
        self.view.set_header(header::FREE_COUNT, count - 1)?;
        Ok(head)
    }

    fn push_free(&self, block: u32) -> Result<()> {
        let head = self.view.header(header::FREE_HEAD)?;
        let count = self.free_count()?;
        if count >= self.capacity() {
            return Err(CacheError::corruption(format!(
                "freeing block {} would exceed the pool of {}",
                block,
                self.capacity()
            )));
        }
        self.view.set_next(block, head)?;
        self.view.set_header(header::FREE_HEAD, block)?;
        self.view.set_header(header::FREE_COUNT, count + 1)
    }
}
