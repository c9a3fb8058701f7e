//! Decoder
//!
//! Inverse walk of the encoder. Every composite is registered under the
//! offset of its tag byte before its children are read, so a
//! back-reference from inside it (a cycle) resolves to the same handle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{CacheError, Result};

use super::varint::read_varint;
use super::{
    Value, MAX_DEPTH, NUMBER_LEN, TAG_BACKREF, TAG_FALSE, TAG_LIST, TAG_MAP, TAG_NULL,
    TAG_NUMBER, TAG_STRING, TAG_TRUE,
};

/// Deserialize a complete value; trailing bytes are an error
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut decoder = Decoder {
        bytes,
        pos: 0,
        composites: HashMap::new(),
    };
    let value = decoder.value(0)?;
    if decoder.pos != bytes.len() {
        return Err(CacheError::Codec(format!(
            "{} trailing bytes after value",
            bytes.len() - decoder.pos
        )));
    }
    Ok(value)
}

/// Read a stored counter; anything but a single number counts as zero
pub fn decode_number_or_zero(bytes: &[u8]) -> f64 {
    match bytes {
        [TAG_NUMBER, rest @ ..] if bytes.len() == NUMBER_LEN => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(rest);
            f64::from_le_bytes(raw)
        }
        _ => 0.0,
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Offset of a composite's tag byte -> its handle
    composites: HashMap<usize, Value>,
}

impl Decoder<'_> {
    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(CacheError::Codec(format!(
                "value nests deeper than {} levels",
                MAX_DEPTH
            )));
        }

        let start = self.pos;
        let tag = self.take(1)?[0];
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_NUMBER => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.take(8)?);
                Ok(Value::Number(f64::from_le_bytes(raw)))
            }
            TAG_STRING => Ok(Value::String(self.string()?)),
            TAG_LIST => {
                let count = self.count()?;
                let list = Rc::new(RefCell::new(Vec::with_capacity(count)));
                self.composites.insert(start, Value::List(Rc::clone(&list)));
                for _ in 0..count {
                    let item = self.value(depth + 1)?;
                    list.borrow_mut().push(item);
                }
                Ok(Value::List(list))
            }
            TAG_MAP => {
                let count = self.count()?;
                let map = Rc::new(RefCell::new(Vec::with_capacity(count)));
                self.composites.insert(start, Value::Map(Rc::clone(&map)));
                for _ in 0..count {
                    let key = self.string()?;
                    let item = self.value(depth + 1)?;
                    map.borrow_mut().push((key, item));
                }
                Ok(Value::Map(map))
            }
            TAG_BACKREF => {
                let target = self.varint()?;
                usize::try_from(target)
                    .ok()
                    .filter(|&offset| offset < start)
                    .and_then(|offset| self.composites.get(&offset))
                    .cloned()
                    .ok_or_else(|| {
                        CacheError::Codec(format!(
                            "back-reference at {} to offset {} names no earlier composite",
                            start, target
                        ))
                    })
            }
            other => Err(CacheError::Codec(format!(
                "unknown tag {:#04x} at offset {}",
                other, start
            ))),
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                CacheError::Codec(format!(
                    "truncated input: {} bytes wanted at offset {}, {} available",
                    n,
                    self.pos,
                    self.bytes.len() - self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, used) = read_varint(&self.bytes[self.pos..]).ok_or_else(|| {
            CacheError::Codec(format!("malformed varint at offset {}", self.pos))
        })?;
        self.pos += used;
        Ok(value)
    }

    /// Element count, bounded by the bytes left (every element takes one)
    fn count(&mut self) -> Result<usize> {
        let count = self.varint()?;
        let remaining = (self.bytes.len() - self.pos) as u64;
        if count > remaining {
            return Err(CacheError::Codec(format!(
                "count {} exceeds the {} bytes left",
                count, remaining
            )));
        }
        Ok(count as usize)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .map_err(|_| CacheError::Codec(format!("string length {} too large", len)))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CacheError::Codec("string is not valid UTF-8".to_string()))
    }
}
