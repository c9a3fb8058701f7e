//! Key Index Module
//!
//! Hash table plus orderings, all stored in the segment.
//!
//! ## Responsibilities
//! - O(1) key → entry lookup (chained hash buckets)
//! - Insertion order for enumeration (stable across overwrites)
//! - Recency order for eviction (updated on every value read and write)
//! - LRU eviction when the allocator runs short
//!
//! ## Entry Record (start of the head block)
//! ```text
//! ┌──────┬───────────┬───────────────┬─────────────┬────────┬─────────┬─────────┬──────┬─────┬───────┐
//! │ hash │ hash_next │ ins prev/next │ lru prev/next│ blocks │ val_len │ key_len │ rsvd │ key │ value │
//! └──────┴───────────┴───────────────┴─────────────┴────────┴─────────┴─────────┴──────┴─────┴───────┘
//! ```

mod eviction;
mod order;
mod table;

pub use eviction::Evictor;
pub use order::{Order, OrderList};
pub use table::{hash_key, Index};
