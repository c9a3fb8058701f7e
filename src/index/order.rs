//! Entry orderings
//!
//! Two intrusive doubly-linked lists over entry head blocks: insertion
//! order (enumeration) and recency order (eviction). Links live in the
//! entry records, ends live in the header.

use crate::error::{CacheError, Result};
use crate::segment::layout::{entry, header, NIL};
use crate::segment::View;

/// Which of the two orderings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Insertion order: head = oldest insert, tail = newest
    Insertion,
    /// Recency order: head = least recently used, tail = most recently used
    Recency,
}

impl Order {
    fn head_field(self) -> usize {
        match self {
            Order::Insertion => header::ORDER_HEAD,
            Order::Recency => header::LRU_HEAD,
        }
    }

    fn tail_field(self) -> usize {
        match self {
            Order::Insertion => header::ORDER_TAIL,
            Order::Recency => header::LRU_TAIL,
        }
    }

    fn prev_field(self) -> usize {
        match self {
            Order::Insertion => entry::ORDER_PREV,
            Order::Recency => entry::LRU_PREV,
        }
    }

    fn next_field(self) -> usize {
        match self {
            Order::Insertion => entry::ORDER_NEXT,
            Order::Recency => entry::LRU_NEXT,
        }
    }
}

/// One ordering inside a locked view
#[derive(Clone, Copy)]
pub struct OrderList<'a> {
    view: View<'a>,
    order: Order,
}

impl<'a> OrderList<'a> {
    pub fn new(view: View<'a>, order: Order) -> Self {
        Self { view, order }
    }

    pub fn head(&self) -> Result<u32> {
        self.view.check_link(self.view.header(self.order.head_field())?)
    }

    pub fn tail(&self) -> Result<u32> {
        self.view.check_link(self.view.header(self.order.tail_field())?)
    }

    pub fn next(&self, node: u32) -> Result<u32> {
        self.view.entry_link(node, self.order.next_field())
    }

    pub fn prev(&self, node: u32) -> Result<u32> {
        self.view.entry_link(node, self.order.prev_field())
    }

    /// Append `node` at the tail
    pub fn push_back(&self, node: u32) -> Result<()> {
        let tail = self.tail()?;
        self.view.set_entry_u32(node, self.order.prev_field(), tail)?;
        self.view.set_entry_u32(node, self.order.next_field(), NIL)?;
        if tail == NIL {
            self.view.set_header(self.order.head_field(), node)?;
        } else {
            self.view.set_entry_u32(tail, self.order.next_field(), node)?;
        }
        self.view.set_header(self.order.tail_field(), node)
    }

    /// Detach `node`, leaving its own links dangling
    pub fn unlink(&self, node: u32) -> Result<()> {
        let prev = self.prev(node)?;
        let next = self.next(node)?;

        if prev == NIL {
            self.expect_end(self.head()?, node, "head")?;
            self.view.set_header(self.order.head_field(), next)?;
        } else {
            self.view.set_entry_u32(prev, self.order.next_field(), next)?;
        }

        if next == NIL {
            self.expect_end(self.tail()?, node, "tail")?;
            self.view.set_header(self.order.tail_field(), prev)?;
        } else {
            self.view.set_entry_u32(next, self.order.prev_field(), prev)?;
        }
        Ok(())
    }

    /// Move `node` to the tail (no-op when already there)
    pub fn move_to_back(&self, node: u32) -> Result<()> {
        if self.tail()? == node {
            return Ok(());
        }
        self.unlink(node)?;
        self.push_back(node)
    }

    /// Nodes from head to tail, bounded by `limit` to catch cycles
    pub fn collect(&self, limit: u32) -> Result<Vec<u32>> {
        let mut nodes = Vec::new();
        let mut node = self.head()?;
        let mut prev = NIL;
        while node != NIL {
            if nodes.len() as u32 >= limit {
                return Err(CacheError::corruption(format!(
                    "{:?} order longer than {} entries",
                    self.order, limit
                )));
            }
            if self.prev(node)? != prev {
                return Err(CacheError::corruption(format!(
                    "{:?} order: entry {} has a broken back link",
                    self.order, node
                )));
            }
            nodes.push(node);
            prev = node;
            node = self.next(node)?;
        }
        if self.tail()? != prev {
            return Err(CacheError::corruption(format!(
                "{:?} order ends at {} but tail is {}",
                self.order,
                prev,
                self.tail()?
            )));
        }
        Ok(nodes)
    }

    fn expect_end(&self, actual: u32, node: u32, end: &str) -> Result<()> {
        if actual == node {
            Ok(())
        } else {
            Err(CacheError::corruption(format!(
                "{:?} order: entry {} has no neighbour but {} is {}",
                self.order, node, end, actual
            )))
        }
    }
}
