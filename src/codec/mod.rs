//! Value Codec Module
//!
//! Serializes dynamically-typed values, including shared and cyclic
//! sub-values, to a compact tagged byte stream and back.
//!
//! ## Responsibilities
//! - Depth-first tagged encoding of scalars, lists and maps
//! - Aliasing and cycles preserved through back-references
//! - Counter reads that treat anything non-numeric as zero
//!
//! ## Wire Format
//! ```text
//! ┌─────────┬──────────────────────────────────────────────────────┐
//! │ Tag (1) │ Payload                                              │
//! └─────────┴──────────────────────────────────────────────────────┘
//!   NULL  FALSE  TRUE     (none)
//!   NUMBER                f64, little endian
//!   STRING                varint len + UTF-8 bytes
//!   LIST                  varint count + count values
//!   MAP                   varint count + count × (varint len + key + value)
//!   BACKREF               varint offset of the earlier composite's tag byte
//! ```
//!
//! A composite seen a second time (by identity, not content) is written as a
//! `BACKREF` to the offset where it was first emitted; this includes an
//! ancestor still being encoded, which is how cycles are written.

mod decoder;
mod encoder;
mod value;
pub mod varint;

pub use decoder::{decode, decode_number_or_zero};
pub use encoder::encode;
pub use value::{List, Map, Value};

// =============================================================================
// Tags
// =============================================================================

pub const TAG_NULL: u8 = 0;
pub const TAG_FALSE: u8 = 1;
pub const TAG_TRUE: u8 = 2;
pub const TAG_NUMBER: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_LIST: u8 = 5;
pub const TAG_MAP: u8 = 6;
pub const TAG_BACKREF: u8 = 7;

/// Deepest nesting accepted by both directions
pub const MAX_DEPTH: usize = 512;

/// Encoded size of a number
pub const NUMBER_LEN: usize = 9;
