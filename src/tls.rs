//! The per-thread TLS page (spec.md sec. 6, grounded on `TLSSetup.cpp`).
//!
//! FS-segment loads/stores the interpreter decodes are interpreted as
//! accesses relative to this page's base.

use crate::address_space::AddressSpace;
use crate::allocator::GuestMemoryAllocator;
use crate::config::TLS_SIZE;
use crate::error::VmResult;

pub const THREAD_ID_OFFSET: u32 = 0;
pub const SELF_OFFSET: u32 = 4;
pub const ERRNO_ADDRESS_OFFSET: u32 = 8;
pub const ERRNO_SLOT_OFFSET: u32 = 0x100;

/// Maps the TLS page at `base` and seeds its fixed fields.
pub fn install(
    space: &mut AddressSpace,
    allocator: &mut GuestMemoryAllocator,
    base: u32,
    thread_id: u32,
) -> VmResult<()> {
    space.map_tls_area(allocator, base, TLS_SIZE)?;
    space.write_u32(base + THREAD_ID_OFFSET, thread_id)?;
    space.write_u32(base + SELF_OFFSET, base)?;
    space.write_u32(base + ERRNO_ADDRESS_OFFSET, base + ERRNO_SLOT_OFFSET)?;
    space.write_u32(base + ERRNO_SLOT_OFFSET, 0)?;
    Ok(())
}

/// Writes a new errno value into the TLS page.
pub fn set_errno(space: &mut AddressSpace, base: u32, value: i32) -> VmResult<()> {
    space.write_u32(base + ERRNO_SLOT_OFFSET, value as u32)
}

/// Reads the current errno value from the TLS page.
pub fn errno(space: &AddressSpace, base: u32) -> VmResult<i32> {
    space.read_i32(base + ERRNO_SLOT_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_seeds_self_pointer_and_thread_id() {
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        install(&mut space, &mut allocator, 0xBFFF_F000, 42).unwrap();
        assert_eq!(space.read_u32(0xBFFF_F000 + THREAD_ID_OFFSET).unwrap(), 42);
        assert_eq!(space.read_u32(0xBFFF_F000 + SELF_OFFSET).unwrap(), 0xBFFF_F000);
        assert_eq!(
            space.read_u32(0xBFFF_F000 + ERRNO_ADDRESS_OFFSET).unwrap(),
            0xBFFF_F000 + ERRNO_SLOT_OFFSET
        );
    }

    #[test]
    fn errno_round_trips() {
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        install(&mut space, &mut allocator, 0xBFFF_F000, 1).unwrap();
        set_errno(&mut space, 0xBFFF_F000, -12).unwrap();
        assert_eq!(errno(&space, 0xBFFF_F000).unwrap(), -12);
    }
}
