//! Enumeration
//!
//! Both iterators work from a snapshot of the insertion order taken when
//! they are created. Mutations after that point do not reorder them; an
//! entry deleted before it is reached is skipped.

use std::vec;

use crate::codec::Value;
use crate::engine::Cache;
use crate::error::Result;

/// Keys in insertion order, as of creation
#[derive(Debug, Clone)]
pub struct Keys {
    inner: vec::IntoIter<String>,
}

impl Keys {
    pub(crate) fn new(keys: Vec<String>) -> Self {
        Self {
            inner: keys.into_iter(),
        }
    }
}

impl Iterator for Keys {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Keys {}

/// `(key, value)` pairs in insertion order
///
/// Each value is read when its key is reached, without promoting the entry
/// in the recency order. Clone it before iterating to restart later.
#[derive(Clone)]
pub struct Entries {
    cache: Cache,
    keys: Keys,
}

impl Entries {
    pub(crate) fn new(cache: Cache, keys: Keys) -> Self {
        Self { cache, keys }
    }
}

impl Iterator for Entries {
    type Item = Result<(String, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.cache.peek(&key) {
                Ok(Some(value)) => return Some(Ok((key, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.keys.size_hint().1)
    }
}
