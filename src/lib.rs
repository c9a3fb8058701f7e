//! # shmcache
//!
//! A key-value cache shared by independent processes through one named
//! shared memory segment:
//! - Fixed-size block pool with chained values
//! - Tagged value codec that preserves aliasing and cycles
//! - Insertion-ordered enumeration, LRU eviction when full
//! - Cross-process reader/writer spin lock that survives killed holders
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache (engine)                          │
//! │   get / set / delete / keys / entries / dump / increase     │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ Value ⇄ bytes                    │ guarded section
//!            ▼                                  ▼
//!     ┌─────────────┐                 ┌───────────────────┐
//!     │    Codec    │                 │  Segment + Guard  │
//!     │ (backrefs)  │                 │ (pid lock, dirty) │
//!     └─────────────┘                 └─────────┬─────────┘
//!                                               │
//!                                ┌──────────────▼──────────────┐
//!                                │   Index (hash + 2 orders)   │
//!                                │   Evictor (LRU on demand)   │
//!                                └──────────────┬──────────────┘
//!                                               │
//!                                ┌──────────────▼──────────────┐
//!                                │  Allocator (free list,      │
//!                                │  block chains)              │
//!                                └─────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod segment;
pub mod guard;
pub mod alloc;
pub mod codec;
pub mod index;
pub mod engine;
pub mod iter;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CacheError, Result};
pub use config::{BlockSize, Config};
pub use codec::{List, Map, Value};
pub use engine::{release, release_with, Cache, SegmentStats};
pub use iter::{Entries, Keys};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of shmcache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
