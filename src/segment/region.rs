//! Mapped region
//!
//! Bounds-checked access to the bytes of a mapped segment. Plain fields are
//! read and written with unaligned raw-pointer copies while the segment lock
//! is held; the few header words touched without the lock are exposed as
//! atomics.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::MmapMut;

use crate::error::{CacheError, Result};

/// A mapped segment
pub struct Region {
    /// Keeps the mapping alive; every pointer below points into it
    _mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is process-shared memory. Non-atomic fields are
// written only while the cross-process segment lock is held exclusively
// with every reader slot drained; shared holders only read them.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn new(mut mmap: MmapMut) -> Result<Self> {
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| CacheError::invalid("mapping returned a null base"))?;
        Ok(Self {
            _mmap: mmap,
            base,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, n: usize) -> Result<()> {
        match offset.checked_add(n) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CacheError::corruption(format!(
                "access of {} bytes at offset {} outside a {} byte segment",
                n, offset, self.len
            ))),
        }
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked above; unaligned read of plain bytes
        Ok(unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_unaligned() })
    }

    pub fn set_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        // SAFETY: bounds checked above
        unsafe { self.base.as_ptr().add(offset).cast::<u32>().write_unaligned(value) };
        Ok(())
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8)?;
        // SAFETY: bounds checked above
        Ok(unsafe { self.base.as_ptr().add(offset).cast::<u64>().read_unaligned() })
    }

    pub fn set_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.check(offset, 8)?;
        // SAFETY: bounds checked above
        unsafe { self.base.as_ptr().add(offset).cast::<u64>().write_unaligned(value) };
        Ok(())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: bounds checked; dst is private memory, never inside the mapping
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: bounds checked; src is private memory, never inside the mapping
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len())
        };
        Ok(())
    }

    /// Fill `n` bytes at `offset` with `byte`
    pub fn fill(&self, offset: usize, n: usize, byte: u8) -> Result<()> {
        self.check(offset, n)?;
        // SAFETY: bounds checked above
        unsafe { std::ptr::write_bytes(self.base.as_ptr().add(offset), byte, n) };
        Ok(())
    }

    /// A header word shared with other processes outside the lock
    ///
    /// Only used for fixed, 4-byte aligned header offsets.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check_aligned(offset, 4)?;
        // SAFETY: in bounds, 4-byte aligned (the mapping itself is page
        // aligned), and the reference cannot outlive `self` which owns the map
        Ok(unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU32>() })
    }

    /// `n` consecutive 8-byte aligned header words
    pub fn atomic_u64s(&self, offset: usize, n: usize) -> Result<&[AtomicU64]> {
        self.check(offset, n * 8)?;
        self.check_aligned(offset, 8)?;
        // SAFETY: in bounds, 8-byte aligned, lifetime tied to the mapping
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.as_ptr().add(offset).cast::<AtomicU64>(), n)
        })
    }

    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64> {
        Ok(&self.atomic_u64s(offset, 1)?[0])
    }

    fn check_aligned(&self, offset: usize, align: usize) -> Result<()> {
        self.check(offset, align)?;
        if offset % align != 0 {
            return Err(CacheError::corruption(format!(
                "atomic word at unaligned offset {}",
                offset
            )));
        }
        Ok(())
    }
}
