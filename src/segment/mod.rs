//! Segment Manager Module
//!
//! Creates, attaches to and releases named shared memory segments.
//!
//! ## Responsibilities
//! - Validate geometry and names, create the backing object exactly once
//! - Map the object and initialize the header under the segment lock
//! - Reuse an already-attached segment within the process, matched by the
//!   object's identity rather than its path
//! - Run reads shared and mutations exclusively under the guard, recovering
//!   from dead holders
//!
//! ## Segment Format
//! ```text
//! ┌──────────────┬───────────────────┬───────────────────┬─────┬──────────────────────┐
//! │ Header (128) │ Buckets (n × u32) │ Nexts (blocks×u32)│ pad │ Block pool           │
//! └──────────────┴───────────────────┴───────────────────┴─────┴──────────────────────┘
//! ```
//!
//! Every link is a `u32` block index; `NIL` (`u32::MAX`) ends a list.

pub mod layout;
mod manager;
mod region;

pub use layout::Layout;
pub use manager::{release, Segment};
pub use region::Region;

use crate::error::{CacheError, Result};
use layout::{header, NIL};

/// Region plus geometry, the context every structural operation runs in
#[derive(Clone, Copy)]
pub struct View<'a> {
    pub region: &'a Region,
    pub layout: &'a Layout,
}

impl<'a> View<'a> {
    pub fn new(region: &'a Region, layout: &'a Layout) -> Self {
        Self { region, layout }
    }

    // =========================================================================
    // Header Fields
    // =========================================================================

    pub fn header(&self, field: usize) -> Result<u32> {
        self.region.u32_at(field)
    }

    pub fn set_header(&self, field: usize, value: u32) -> Result<()> {
        self.region.set_u32(field, value)
    }

    /// Add one to a u32 header counter
    pub fn bump_header(&self, field: usize) -> Result<()> {
        let current = self.header(field)?;
        self.set_header(field, current.wrapping_add(1))
    }

    /// Add to a u64 header counter
    pub fn bump_counter(&self, field: usize, by: u64) -> Result<()> {
        let current = self.region.u64_at(field)?;
        self.region.set_u64(field, current.wrapping_add(by))
    }

    pub fn set_counter(&self, field: usize, value: u64) -> Result<()> {
        self.region.set_u64(field, value)
    }

    // =========================================================================
    // Block Links
    // =========================================================================

    /// Reject indices outside the pool
    pub fn check_block(&self, block: u32) -> Result<u32> {
        if block < self.layout.block_count {
            Ok(block)
        } else {
            Err(CacheError::corruption(format!(
                "block index {} outside pool of {}",
                block, self.layout.block_count
            )))
        }
    }

    /// Like `check_block`, but `NIL` passes through
    pub fn check_link(&self, link: u32) -> Result<u32> {
        if link == NIL {
            Ok(NIL)
        } else {
            self.check_block(link)
        }
    }

    pub fn next(&self, block: u32) -> Result<u32> {
        let block = self.check_block(block)?;
        let next = self.region.u32_at(self.layout.next_offset(block))?;
        self.check_link(next)
    }

    pub fn set_next(&self, block: u32, next: u32) -> Result<()> {
        let block = self.check_block(block)?;
        self.region.set_u32(self.layout.next_offset(block), next)
    }

    // =========================================================================
    // Entry Record Fields
    // =========================================================================

    /// Read a u32 field of the entry record in `head`
    pub fn entry_u32(&self, head: u32, field: usize) -> Result<u32> {
        let head = self.check_block(head)?;
        self.region.u32_at(self.layout.block_offset(head) + field)
    }

    pub fn set_entry_u32(&self, head: u32, field: usize, value: u32) -> Result<()> {
        let head = self.check_block(head)?;
        self.region.set_u32(self.layout.block_offset(head) + field, value)
    }

    /// Read a link field of an entry record, validated
    pub fn entry_link(&self, head: u32, field: usize) -> Result<u32> {
        let link = self.entry_u32(head, field)?;
        self.check_link(link)
    }

    // =========================================================================
    // Formatting
    // =========================================================================

    /// Drop every entry: empty buckets, empty orderings, all blocks free
    pub fn reset_contents(&self) -> Result<()> {
        let layout = self.layout;
        self.region.fill(
            layout.buckets_offset,
            layout.bucket_count as usize * 4,
            0xFF, // NIL in every bucket
        )?;

        for block in 0..layout.block_count {
            let next = if block + 1 < layout.block_count { block + 1 } else { NIL };
            self.region.set_u32(layout.next_offset(block), next)?;
        }

        self.set_header(header::FREE_HEAD, 0)?;
        self.set_header(header::FREE_COUNT, layout.block_count)?;
        self.set_header(header::ENTRY_COUNT, 0)?;
        self.set_header(header::ORDER_HEAD, NIL)?;
        self.set_header(header::ORDER_TAIL, NIL)?;
        self.set_header(header::LRU_HEAD, NIL)?;
        self.set_header(header::LRU_TAIL, NIL)?;
        Ok(())
    }
}
