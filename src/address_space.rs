//! The guest address-space abstraction (spec.md sec. 3, sec. 4.1).
//!
//! [`AddressSpace`] is the mapping authority: it translates a 32-bit guest
//! virtual address into an offset inside a host-resident backing buffer and
//! performs the actual byte-level copies. On a 64-bit host the translation
//! arithmetic is carried out at 64-bit width so that a guest address near
//! `u32::MAX` can never wrap during the bounds check (spec.md sec. 3).
//!
//! The source models this as a polymorphic (virtual-base-class) interface;
//! per spec.md sec. 9 this is replaced here with a single concrete
//! implementation plus an explicit capability enum rather than a trait
//! object hierarchy, following the "dynamic dispatch over polymorphism"
//! redesign note.

use crate::allocator::GuestMemoryAllocator;
use crate::error::{VmError, VmResult};

/// A 32-bit address in the guest's flat virtual address space.
pub type GuestAddress = u32;

/// One contiguous, non-overlapping mapping from guest space into the
/// backing buffer.
#[derive(Debug, Clone, Copy)]
struct Mapping {
    vaddr: GuestAddress,
    host_offset: u32,
    len: u32,
    writable: bool,
}

impl Mapping {
    fn guest_end(&self) -> u64 {
        u64::from(self.vaddr) + u64::from(self.len)
    }

    fn contains(&self, vaddr: GuestAddress) -> bool {
        let vaddr = u64::from(vaddr);
        let start = u64::from(self.vaddr);
        vaddr >= start && vaddr < self.guest_end()
    }
}

/// Capabilities an [`AddressSpace`] implementation can be asked for. The
/// direct, single-buffer implementation below supports all of them; the
/// enum exists so callers can be generic over "the set of things an
/// address space can do" without an inheritance chain (spec.md sec. 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
    RegisterMapping,
    Translate,
    TlsMap,
}

/// A single large contiguous host buffer backing every guest mapping.
///
/// This is the "direct" implementation spec.md sec. 4.1 calls sufficient for
/// the reference design: one `Vec<u8>` sized to the allocator's ceiling,
/// with a grow-only list of non-overlapping `[vaddr, vaddr+len)` ranges
/// describing which parts of it are live guest memory.
pub struct AddressSpace {
    backing: Vec<u8>,
    mappings: Vec<Mapping>,
}

impl AddressSpace {
    /// Creates an address space backed by a buffer of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            backing: vec![0u8; capacity as usize],
            mappings: Vec::new(),
        }
    }

    /// Declares every capability this implementation provides.
    #[must_use]
    pub fn capabilities() -> &'static [Capability] {
        &[
            Capability::Read,
            Capability::Write,
            Capability::RegisterMapping,
            Capability::Translate,
            Capability::TlsMap,
        ]
    }

    /// Registers a new mapping `[vaddr, vaddr+len)` backed by
    /// `[host_offset, host_offset+len)` inside the backing buffer.
    ///
    /// The mapping is writable by default; call [`AddressSpace::protect`]
    /// afterwards to mark a read-only segment (e.g. a `PT_LOAD` without
    /// `PF_W`).
    pub fn register_mapping(
        &mut self,
        vaddr: GuestAddress,
        host_offset: u32,
        len: u32,
    ) -> VmResult<()> {
        let host_end = u64::from(host_offset) + u64::from(len);
        if host_end > self.backing.len() as u64 {
            return Err(VmError::ResourceExhausted(
                "mapping exceeds backing buffer",
            ));
        }
        let new = Mapping {
            vaddr,
            host_offset,
            len,
            writable: true,
        };
        if self.mappings.iter().any(|m| ranges_overlap(m, &new)) {
            return Err(VmError::BadInput("overlapping guest mapping"));
        }
        self.mappings.push(new);
        Ok(())
    }

    /// Marks the most recently registered mapping covering `vaddr` as
    /// read-only or writable.
    pub fn protect(&mut self, vaddr: GuestAddress, writable: bool) -> VmResult<()> {
        let mapping = self
            .mappings
            .iter_mut()
            .find(|m| m.contains(vaddr))
            .ok_or(VmError::Unmapped(vaddr))?;
        mapping.writable = writable;
        Ok(())
    }

    /// Reserves a per-thread TLS region at `base`, of `size` bytes
    /// (spec.md sec. 4.1 `map_tls_area`). The backing bytes come out of
    /// `allocator`'s cursor, same as every other guest allocation, even
    /// though `base` itself is a fixed address outside the allocator's own
    /// placement scheme (spec.md sec. 4.2's "one global instance" ceiling
    /// has to see every allocation to enforce it).
    pub fn map_tls_area(
        &mut self,
        allocator: &mut GuestMemoryAllocator,
        base: GuestAddress,
        size: u32,
    ) -> VmResult<()> {
        let offset = allocator.allocate_pages(size)?;
        self.register_mapping(base, offset, size)
    }

    /// Reserves a region at a fixed guest address not placed by the
    /// allocator's own cursor logic (the stack, commpage, and TLS page all
    /// have addresses spec.md sec. 6 fixes independently), but whose backing
    /// bytes are still bumped out of `allocator` so the ceiling stays
    /// meaningful (spec.md sec. 4.3 step 6).
    pub fn map_fixed(
        &mut self,
        allocator: &mut GuestMemoryAllocator,
        vaddr: GuestAddress,
        size: u32,
        writable: bool,
    ) -> VmResult<()> {
        let offset = allocator.allocate_pages(size)?;
        self.register_mapping(vaddr, offset, size)?;
        if !writable {
            self.protect(vaddr, false)?;
        }
        Ok(())
    }

    /// Advisory translation from a guest address to a host buffer offset.
    #[must_use]
    pub fn translate(&self, vaddr: GuestAddress) -> Option<u32> {
        self.find(vaddr).map(|m| m.host_offset + (vaddr - m.vaddr))
    }

    /// Copies `len` bytes from guest memory into `dst`.
    ///
    /// Fails atomically on a straddling or unmapped access: `dst` is left
    /// untouched unless every byte in `[vaddr, vaddr+len)` is mapped and
    /// readable.
    pub fn read(&self, vaddr: GuestAddress, dst: &mut [u8], len: usize) -> VmResult<()> {
        let dst = &mut dst[..len];
        let host_range = self.resolve_contiguous(vaddr, len as u32)?;
        dst.copy_from_slice(&self.backing[host_range]);
        Ok(())
    }

    /// Copies up to `cap - 1` bytes starting at `vaddr` into `dst`, up to
    /// and including the first NUL. `dst` is always NUL-terminated on
    /// success, matching spec.md sec. 4.1.
    pub fn read_string(&self, vaddr: GuestAddress, dst: &mut [u8], cap: usize) -> VmResult<usize> {
        let cap = cap.min(dst.len());
        let mapping = self.find(vaddr).ok_or(VmError::Unmapped(vaddr))?;
        let mut i = 0usize;
        while i + 1 < cap {
            let cur = vaddr
                .checked_add(i as u32)
                .ok_or(VmError::BadInput("guest address overflow"))?;
            if !mapping.contains(cur) {
                return Err(VmError::Short(cur));
            }
            let host = (mapping.host_offset + (cur - mapping.vaddr)) as usize;
            let byte = self.backing[host];
            if byte == 0 {
                break;
            }
            dst[i] = byte;
            i += 1;
        }
        dst[i] = 0;
        Ok(i)
    }

    /// Writes `len` bytes from `src` into guest memory, atomically: either
    /// every byte lands or none do.
    pub fn write(&mut self, vaddr: GuestAddress, src: &[u8], len: usize) -> VmResult<()> {
        let src = &src[..len];
        let host_range = self.resolve_contiguous_writable(vaddr, len as u32)?;
        self.backing[host_range].copy_from_slice(src);
        Ok(())
    }

    /// Writes a typed, little-endian value at `vaddr`.
    pub fn write_u32(&mut self, vaddr: GuestAddress, value: u32) -> VmResult<()> {
        self.write(vaddr, &value.to_le_bytes(), 4)
    }

    /// Reads a typed, little-endian `u32` from `vaddr`.
    pub fn read_u32(&self, vaddr: GuestAddress) -> VmResult<u32> {
        let mut buf = [0u8; 4];
        self.read(vaddr, &mut buf, 4)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a typed, little-endian `i32` from `vaddr`.
    pub fn read_i32(&self, vaddr: GuestAddress) -> VmResult<i32> {
        self.read_u32(vaddr).map(|v| v as i32)
    }

    fn find(&self, vaddr: GuestAddress) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.contains(vaddr))
    }

    /// Resolves `[vaddr, vaddr+len)` to a single contiguous host range,
    /// failing if any byte in the range is unmapped.
    fn resolve_contiguous(
        &self,
        vaddr: GuestAddress,
        len: u32,
    ) -> VmResult<std::ops::Range<usize>> {
        if len == 0 {
            return Ok(0..0);
        }
        let mapping = self.find(vaddr).ok_or(VmError::Unmapped(vaddr))?;
        let end = u64::from(vaddr) + u64::from(len);
        if end > mapping.guest_end() {
            return Err(VmError::Short(vaddr));
        }
        let start = (mapping.host_offset + (vaddr - mapping.vaddr)) as usize;
        Ok(start..start + len as usize)
    }

    fn resolve_contiguous_writable(
        &self,
        vaddr: GuestAddress,
        len: u32,
    ) -> VmResult<std::ops::Range<usize>> {
        if len > 0 {
            let mapping = self.find(vaddr).ok_or(VmError::Unmapped(vaddr))?;
            if !mapping.writable {
                return Err(VmError::Permission(vaddr));
            }
        }
        self.resolve_contiguous(vaddr, len)
    }

}

fn ranges_overlap(a: &Mapping, b: &Mapping) -> bool {
    u64::from(a.vaddr) < b.guest_end() && u64::from(b.vaddr) < a.guest_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let mut space = AddressSpace::new(0x10000);
        space.register_mapping(0x1000, 0, 0x1000).unwrap();
        space.write(0x1000, &[1, 2, 3, 4], 4).unwrap();
        let mut buf = [0u8; 4];
        space.read(0x1000, &mut buf, 4).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn straddling_access_fails_without_partial_write() {
        let mut space = AddressSpace::new(0x10000);
        space.register_mapping(0x1000, 0, 0x10).unwrap();
        let mut buf = [0xAAu8; 8];
        let err = space.read(0x1008, &mut buf, 16);
        assert!(err.is_err());
        assert_eq!(buf, [0xAAu8; 8]);
    }

    #[test]
    fn unmapped_write_is_rejected() {
        let mut space = AddressSpace::new(0x10000);
        let err = space.write(0x5000, &[1], 1);
        assert!(matches!(err, Err(VmError::Unmapped(0x5000))));
    }

    #[test]
    fn read_string_nul_terminates() {
        let mut space = AddressSpace::new(0x10000);
        space.register_mapping(0x2000, 0, 0x100).unwrap();
        space.write(0x2000, b"hello\0garbage", 13).unwrap();
        let mut buf = [0xFFu8; 8];
        let len = space.read_string(0x2000, &mut buf, 8).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..6], b"hello\0");
    }

    #[test]
    fn read_only_mapping_rejects_write() {
        let mut space = AddressSpace::new(0x10000);
        space.register_mapping(0x3000, 0, 0x10).unwrap();
        space.protect(0x3000, false).unwrap();
        let err = space.write(0x3000, &[1], 1);
        assert!(matches!(err, Err(VmError::Permission(0x3000))));
    }

    #[test]
    fn overlapping_mappings_rejected() {
        let mut space = AddressSpace::new(0x10000);
        space.register_mapping(0x1000, 0, 0x100).unwrap();
        let err = space.register_mapping(0x1080, 0x100, 0x100);
        assert!(err.is_err());
    }
}
