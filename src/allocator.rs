//! The process-wide guest memory allocator (spec.md sec. 3, sec. 4.2).
//!
//! A single bump cursor shared by the loader and the dynamic linker while
//! they populate the address space. Never reclaims; `reset` exists only so
//! tests can reuse one allocator across cases without re-allocating a new
//! backing buffer.

use crate::error::{VmError, VmResult};

const DEFAULT_PAGE_ALIGN: u32 = 4096;

/// Hands out non-overlapping, monotonically increasing offsets inside an
/// [`crate::address_space::AddressSpace`]'s backing buffer.
pub struct GuestMemoryAllocator {
    next_offset: u32,
    ceiling: u32,
}

impl GuestMemoryAllocator {
    /// Creates an allocator that refuses to hand out more than `ceiling`
    /// bytes in total.
    #[must_use]
    pub fn new(ceiling: u32) -> Self {
        Self {
            next_offset: 0,
            ceiling,
        }
    }

    /// Allocates `size` bytes aligned to `align`, returning the offset
    /// before the bump. `align` defaults to a page (spec.md sec. 4.2).
    pub fn allocate(&mut self, size: u32, align: u32) -> VmResult<u32> {
        let align = if align == 0 { DEFAULT_PAGE_ALIGN } else { align };
        let aligned_start = round_up(self.next_offset, align);
        let rounded_size = round_up(size, align);
        let end = u64::from(aligned_start) + u64::from(rounded_size);
        if end > u64::from(self.ceiling) {
            return Err(VmError::ResourceExhausted("guest memory allocator ceiling exceeded"));
        }
        self.next_offset = end as u32;
        Ok(aligned_start)
    }

    /// Allocates `size` bytes at the default page alignment.
    pub fn allocate_pages(&mut self, size: u32) -> VmResult<u32> {
        self.allocate(size, DEFAULT_PAGE_ALIGN)
    }

    /// The cursor's current position, for diagnostics.
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.next_offset
    }

    /// Resets the cursor to zero. Only used by tests.
    #[cfg(test)]
    pub fn reset(&mut self) {
        self.next_offset = 0;
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    let mask = align - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_monotonic_and_non_overlapping() {
        let mut alloc = GuestMemoryAllocator::new(1 << 20);
        let a = alloc.allocate(100, 16).unwrap();
        let b = alloc.allocate(50, 16).unwrap();
        assert!(a + round_up(100, 16) <= b);
    }

    #[test]
    fn ceiling_is_enforced() {
        let mut alloc = GuestMemoryAllocator::new(4096);
        assert!(alloc.allocate(4096, 4096).is_ok());
        assert!(alloc.allocate(1, 4096).is_err());
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut alloc = GuestMemoryAllocator::new(1 << 20);
        alloc.allocate(100, 16).unwrap();
        alloc.reset();
        assert_eq!(alloc.cursor(), 0);
    }
}
