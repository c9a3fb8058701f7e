//! Chain I/O
//!
//! Treats a block chain as one contiguous byte stream.

use crate::error::{CacheError, Result};
use crate::segment::layout::NIL;
use crate::segment::View;

/// Byte-stream access to the chain starting at `head`
#[derive(Clone, Copy)]
pub struct Chain<'a> {
    view: View<'a>,
    head: u32,
}

impl<'a> Chain<'a> {
    pub fn new(view: View<'a>, head: u32) -> Self {
        Self { view, head }
    }

    /// Copy `src` into the stream at byte `offset`
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut done = 0;
        self.walk(offset, src.len(), |region_offset, range| {
            self.view
                .region
                .write(region_offset, &src[done..done + range])?;
            done += range;
            Ok(())
        })
    }

    /// Fill `dst` from the stream at byte `offset`
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        let len = dst.len();
        self.walk(offset, len, |region_offset, range| {
            self.view
                .region
                .read(region_offset, &mut dst[done..done + range])?;
            done += range;
            Ok(())
        })
    }

    /// Number of blocks in the chain
    pub fn len(&self) -> Result<u32> {
        let mut count = 0u32;
        let mut block = self.view.check_block(self.head)?;
        while block != NIL {
            count += 1;
            if count > self.view.layout.block_count {
                return Err(self.cycle());
            }
            block = self.view.next(block)?;
        }
        Ok(count)
    }

    /// Blocks of the chain in order
    pub fn blocks(&self) -> Result<Vec<u32>> {
        let mut blocks = Vec::new();
        let mut block = self.view.check_block(self.head)?;
        while block != NIL {
            if blocks.len() as u32 >= self.view.layout.block_count {
                return Err(self.cycle());
            }
            blocks.push(block);
            block = self.view.next(block)?;
        }
        Ok(blocks)
    }

    /// Visit the region ranges covering `[offset, offset + len)` of the stream
    fn walk(
        &self,
        offset: usize,
        len: usize,
        mut visit: impl FnMut(usize, usize) -> Result<()>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let block_bytes = self.view.layout.block_bytes();

        // Skip whole blocks before the first byte
        let mut block = self.view.check_block(self.head)?;
        let mut skip = offset / block_bytes;
        while skip > 0 {
            block = self.step(block)?;
            skip -= 1;
        }

        let mut within = offset % block_bytes;
        let mut remaining = len;
        loop {
            let range = remaining.min(block_bytes - within);
            visit(self.view.layout.block_offset(block) + within, range)?;
            remaining -= range;
            if remaining == 0 {
                return Ok(());
            }
            block = self.step(block)?;
            within = 0;
        }
    }

    fn step(&self, block: u32) -> Result<u32> {
        let next = self.view.next(block)?;
        if next == NIL {
            return Err(CacheError::corruption(format!(
                "chain at block {} ended before its recorded length",
                self.head
            )));
        }
        Ok(next)
    }

    fn cycle(&self) -> CacheError {
        CacheError::corruption(format!("chain at block {} does not terminate", self.head))
    }
}
