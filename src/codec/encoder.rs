//! Encoder
//!
//! Depth-first walk with an identity table: each composite's address maps
//! to the offset of its tag byte, and any later visit to that address
//! writes a back-reference instead of the contents.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::error::{CacheError, Result};

use super::varint::put_varint;
use super::{
    Value, MAX_DEPTH, TAG_BACKREF, TAG_FALSE, TAG_LIST, TAG_MAP, TAG_NULL, TAG_NUMBER,
    TAG_STRING, TAG_TRUE,
};

/// Serialize `value`
///
/// Fails with `Codec` only when nesting exceeds `MAX_DEPTH`; cycles are
/// not nesting, they end in a back-reference.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut encoder = Encoder {
        buf: BytesMut::with_capacity(64),
        seen: HashMap::new(),
    };
    encoder.value(value, 0)?;
    Ok(encoder.buf.to_vec())
}

struct Encoder {
    buf: BytesMut,
    /// Composite address -> offset of its first emission
    seen: HashMap<*const (), usize>,
}

impl Encoder {
    fn value(&mut self, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(CacheError::Codec(format!(
                "value nests deeper than {} levels",
                MAX_DEPTH
            )));
        }

        if let Some(id) = value.identity() {
            if let Some(&offset) = self.seen.get(&id) {
                self.buf.put_u8(TAG_BACKREF);
                put_varint(&mut self.buf, offset as u64);
                return Ok(());
            }
            self.seen.insert(id, self.buf.len());
        }

        match value {
            Value::Null => self.buf.put_u8(TAG_NULL),
            Value::Bool(false) => self.buf.put_u8(TAG_FALSE),
            Value::Bool(true) => self.buf.put_u8(TAG_TRUE),
            Value::Number(n) => {
                self.buf.put_u8(TAG_NUMBER);
                self.buf.put_f64_le(*n);
            }
            Value::String(s) => {
                self.buf.put_u8(TAG_STRING);
                self.string(s);
            }
            Value::List(list) => {
                let items = list.borrow();
                self.buf.put_u8(TAG_LIST);
                put_varint(&mut self.buf, items.len() as u64);
                for item in items.iter() {
                    self.value(item, depth + 1)?;
                }
            }
            Value::Map(map) => {
                let entries = map.borrow();
                self.buf.put_u8(TAG_MAP);
                put_varint(&mut self.buf, entries.len() as u64);
                for (key, item) in entries.iter() {
                    self.string(key);
                    self.value(item, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn string(&mut self, s: &str) {
        put_varint(&mut self.buf, s.len() as u64);
        self.buf.put_slice(s.as_bytes());
    }
}
