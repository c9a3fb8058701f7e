//! Block Allocator Module
//!
//! Fixed-size block pool management.
//!
//! ## Responsibilities
//! - Pop/push blocks on the free list
//! - Link blocks into chains for values larger than one block
//! - Grow and shrink chains in place
//! - Ask a `Reclaim` implementation (the eviction controller) for blocks
//!   when the free list runs short
//!
//! ## Invariant
//! `free blocks + Σ chain lengths == block_count`, and no block is on two
//! lists at once.

mod allocator;
mod chain;

pub use allocator::Allocator;
pub use chain::Chain;

use crate::error::Result;

/// Source of blocks when the free list is exhausted
pub trait Reclaim {
    /// Free one victim's blocks; `None` when nothing is left to give
    fn reclaim_one(&mut self) -> Result<Option<u32>>;
}

/// Reclaimer that never frees anything
pub struct NoReclaim;

impl Reclaim for NoReclaim {
    fn reclaim_one(&mut self) -> Result<Option<u32>> {
        Ok(None)
    }
}
