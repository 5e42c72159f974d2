//! ELF32/i386 image loading (spec.md sec. 4.3, grounded on the teacher's
//! `load_elf` in `user/src/os/vm/elf.rs` for the overall
//! parse-headers / compute-span / register-mappings / copy-segments shape,
//! adapted from AArch64 page-table mapping to this crate's flat
//! [`AddressSpace`]).

use crate::address_space::AddressSpace;
use crate::allocator::GuestMemoryAllocator;
use crate::config::{STACK_SIZE, STACK_TOP};
use crate::elf::header::{parse_program_headers, ElfHeader, ObjectType, ProgramHeader};
use crate::error::{VmError, VmResult};

/// Everything the dynamic linker and the interpreter need to know about a
/// single loaded image (the main executable or one shared library).
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub base: u32,
    pub entry: u32,
    pub dynamic_vaddr: Option<u32>,
    pub span: u32,
}

/// Loads `file`'s `PT_LOAD` segments into `space`, choosing a base address
/// per spec.md sec. 4.3: `ET_EXEC` always loads at its absolute vaddrs
/// (`requested_base` is ignored and must be `0`); `ET_DYN` loads relocated
/// to `requested_base`.
pub fn load_image(
    space: &mut AddressSpace,
    allocator: &mut GuestMemoryAllocator,
    file: &[u8],
    requested_base: u32,
) -> VmResult<LoadedImage> {
    let header = ElfHeader::parse(file)?;
    let phdrs = parse_program_headers(file, &header)?;

    let base = match header.object_type {
        ObjectType::Exec => 0,
        ObjectType::Dyn => requested_base,
    };

    let loads: Vec<&ProgramHeader> = phdrs.iter().filter(|p| p.is_load()).collect();
    if loads.is_empty() {
        return Err(VmError::BadInput("ELF has no PT_LOAD segments"));
    }

    let min_vaddr = loads.iter().map(|p| p.vaddr).min().unwrap();
    let max_vaddr = loads
        .iter()
        .map(|p| u64::from(p.vaddr) + u64::from(p.memsz))
        .max()
        .unwrap();
    let span = (max_vaddr - u64::from(min_vaddr)) as u32;

    let host_region = allocator.allocate_pages(span)?;

    for phdr in &loads {
        let guest_addr = base
            .checked_add(phdr.vaddr)
            .ok_or(VmError::BadInput("segment vaddr overflows guest address space"))?;
        let host_offset = host_region + (phdr.vaddr - min_vaddr);
        space.register_mapping(guest_addr, host_offset, phdr.memsz)?;

        let file_end = phdr
            .offset
            .checked_add(phdr.filesz)
            .ok_or(VmError::BadInput("segment file range overflows"))? as usize;
        let file_bytes = file
            .get(phdr.offset as usize..file_end)
            .ok_or(VmError::BadInput("segment file range out of bounds"))?;
        space.write(guest_addr, file_bytes, file_bytes.len())?;
        // the memsz - filesz BSS tail stays zero: the backing buffer is
        // zero-initialized and nothing else touches it before this point.

        if !phdr.writable() {
            space.protect(guest_addr, false)?;
        }
    }

    let dynamic_vaddr = phdrs
        .iter()
        .find(|p| p.is_dynamic())
        .map(|p| base + p.vaddr);

    Ok(LoadedImage {
        base,
        entry: base + header.entry,
        dynamic_vaddr,
        span,
    })
}

/// Builds the initial guest stack: argv/envp strings, then the `argv[]`
/// and `envp[]` pointer arrays, then `argc`, growing down from
/// [`STACK_TOP`] (spec.md sec. 4.3).
pub fn build_initial_stack(
    space: &mut AddressSpace,
    allocator: &mut GuestMemoryAllocator,
    argv: &[String],
    envp: &[String],
) -> VmResult<u32> {
    space.map_fixed(allocator, STACK_TOP - STACK_SIZE, STACK_SIZE, true)?;

    let mut cursor = STACK_TOP;
    let mut write_string = |space: &mut AddressSpace, s: &str| -> VmResult<u32> {
        let bytes_len = s.len() + 1;
        cursor -= bytes_len as u32;
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        space.write(cursor, &bytes, bytes.len())?;
        Ok(cursor)
    };

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv {
        argv_ptrs.push(write_string(space, s)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp {
        envp_ptrs.push(write_string(space, s)?);
    }

    // align down to a 4-byte boundary before the pointer arrays
    cursor &= !0x3;

    let mut write_u32 = |space: &mut AddressSpace, value: u32| -> VmResult<()> {
        cursor -= 4;
        space.write_u32(cursor, value)
    };

    write_u32(space, 0)?; // envp terminator
    for ptr in envp_ptrs.iter().rev() {
        write_u32(space, *ptr)?;
    }
    write_u32(space, 0)?; // argv terminator
    for ptr in argv_ptrs.iter().rev() {
        write_u32(space, *ptr)?;
    }
    write_u32(space, argv.len() as u32)?; // argc

    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_exec(entry: u32, vaddr: u32, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x34];
        bytes[0..4].copy_from_slice(&crate::elf::header::ELF_MAGIC);
        bytes[4] = 1;
        bytes[5] = 1;
        bytes[0x10..0x12].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        bytes[0x12..0x14].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        bytes[0x18..0x1C].copy_from_slice(&entry.to_le_bytes());
        bytes[0x1C..0x20].copy_from_slice(&0x34u32.to_le_bytes());
        bytes[0x2A..0x2C].copy_from_slice(&32u16.to_le_bytes());
        bytes[0x2C..0x2E].copy_from_slice(&1u16.to_le_bytes());

        let ph_off = bytes.len();
        let mut phdr = vec![0u8; 32];
        phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        phdr[4..8].copy_from_slice(&(ph_off as u32 + 32).to_le_bytes()); // p_offset
        phdr[8..12].copy_from_slice(&vaddr.to_le_bytes());
        phdr[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        phdr[20..24].copy_from_slice(&(payload.len() as u32 + 16).to_le_bytes()); // memsz with bss tail
        phdr[24..28].copy_from_slice(&5u32.to_le_bytes()); // PF_R|PF_X
        bytes.extend_from_slice(&phdr);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn loads_segment_and_zeroes_bss_tail() {
        let file = minimal_exec(0x1000, 0x1000, &[0xCC, 0xCC, 0xCC, 0xCC]);
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        let image = load_image(&mut space, &mut allocator, &file, 0).unwrap();
        assert_eq!(image.base, 0);
        assert_eq!(image.entry, 0x1000);

        let mut buf = [0u8; 4];
        space.read(0x1000, &mut buf, 4).unwrap();
        assert_eq!(buf, [0xCC; 4]);

        let mut tail = [0xAAu8; 4];
        space.read(0x1000 + 4, &mut tail, 4).unwrap();
        assert_eq!(tail, [0u8; 4]);
    }

    #[test]
    fn dyn_object_relocates_to_requested_base() {
        let file = minimal_exec(0x0, 0x0, &[0x90]);
        // flip e_type to ET_DYN after the fact
        let mut file = file;
        file[0x10] = 3;
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        let image = load_image(&mut space, &mut allocator, &file, 0x4000_0000).unwrap();
        assert_eq!(image.base, 0x4000_0000);
        assert_eq!(image.entry, 0x4000_0000);
    }

    #[test]
    fn initial_stack_has_argc_at_top_and_terminated_arrays() {
        let mut space = AddressSpace::new(1 << 20);
        let mut allocator = GuestMemoryAllocator::new(1 << 20);
        let sp = build_initial_stack(
            &mut space,
            &mut allocator,
            &["prog".to_string()],
            &["HOME=/boot/home".to_string()],
        )
        .unwrap();
        let argc = space.read_u32(sp).unwrap();
        assert_eq!(argc, 1);
        let argv0_ptr = space.read_u32(sp + 4).unwrap();
        assert!(argv0_ptr > 0);
        let argv_terminator = space.read_u32(sp + 8).unwrap();
        assert_eq!(argv_terminator, 0);
    }
}
