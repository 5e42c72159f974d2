//! The commpage: a fixed, read-only page of kernel-provided data and a
//! vsyscall trampoline (spec.md sec. 6, grounded on `CommpageManager.cpp`).

use crate::address_space::AddressSpace;
use crate::allocator::GuestMemoryAllocator;
use crate::config::{
    COMMPAGE_MAGIC, COMMPAGE_SIZE, COMMPAGE_VERSION, COMMPAGE_VSYSCALL_STUB_OFFSET,
};
use crate::error::VmResult;

/// `int $0x63; ret`, the three bytes a guest's vsyscall entry point
/// executes to trap into the dispatcher and return.
pub const VSYSCALL_STUB: [u8; 3] = [0xCD, 0x63, 0xC3];

/// Maps and populates the commpage at `base`.
pub fn install(
    space: &mut AddressSpace,
    allocator: &mut GuestMemoryAllocator,
    base: u32,
) -> VmResult<()> {
    space.map_fixed(allocator, base, COMMPAGE_SIZE, true)?;
    space.write_u32(base, COMMPAGE_MAGIC)?;
    space.write_u32(base + 4, COMMPAGE_VERSION)?;
    let stub_addr = base + COMMPAGE_VSYSCALL_STUB_OFFSET;
    space.write(stub_addr, &VSYSCALL_STUB, VSYSCALL_STUB.len())?;
    space.protect(base, false)?;
    Ok(())
}

/// The guest address of the vsyscall entry point, for anything that needs
/// to point a function pointer at it.
#[must_use]
pub fn vsyscall_entry(base: u32) -> u32 {
    base + COMMPAGE_VSYSCALL_STUB_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commpage_carries_magic_version_and_vsyscall_stub() {
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        install(&mut space, &mut allocator, 0x1000).unwrap();
        assert_eq!(space.read_u32(0x1000).unwrap(), COMMPAGE_MAGIC);
        assert_eq!(space.read_u32(0x1004).unwrap(), COMMPAGE_VERSION);
        let mut stub = [0u8; 3];
        space.read(vsyscall_entry(0x1000), &mut stub, 3).unwrap();
        assert_eq!(stub, VSYSCALL_STUB);
    }
}
