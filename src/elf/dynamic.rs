//! `PT_DYNAMIC` parsing (spec.md sec. 4.4, sec. 6).
//!
//! Entries are 8 bytes (`d_tag: i32`, `d_val`/`d_ptr: u32`) and terminate at
//! `DT_NULL`. Values for tags that describe sizes or counts are stored as
//! `u32`; tags that describe guest addresses are also `u32`, since both are
//! the same width on this target.

use crate::address_space::AddressSpace;
use crate::error::{VmError, VmResult};

pub const DT_NULL: i32 = 0;
pub const DT_NEEDED: i32 = 1;
pub const DT_PLTRELSZ: i32 = 2;
pub const DT_HASH: i32 = 4;
pub const DT_STRTAB: i32 = 5;
pub const DT_SYMTAB: i32 = 6;
pub const DT_RELA: i32 = 7;
pub const DT_RELASZ: i32 = 8;
pub const DT_RELAENT: i32 = 9;
pub const DT_STRSZ: i32 = 10;
pub const DT_SYMENT: i32 = 11;
pub const DT_REL: i32 = 17;
pub const DT_RELSZ: i32 = 18;
pub const DT_RELENT: i32 = 19;
pub const DT_PLTREL: i32 = 20;
pub const DT_JMPREL: i32 = 23;
pub const DT_PLTGOT: i32 = 3;
pub const DT_INIT: i32 = 12;
pub const DT_FINI: i32 = 13;
pub const DT_INIT_ARRAY: i32 = 25;
pub const DT_FINI_ARRAY: i32 = 26;
pub const DT_INIT_ARRAYSZ: i32 = 27;
pub const DT_FINI_ARRAYSZ: i32 = 28;
pub const DT_FLAGS: i32 = 30;

/// `DT_FLAGS` bit watched by spec.md sec. 4.4: eager (non-lazy) PLT binding.
pub const DF_BIND_NOW: u32 = 0x0000_0008;

const ENTRY_SIZE: u32 = 8;

/// The fields of `PT_DYNAMIC` the linker needs, gathered from the raw
/// tag/value pairs in one pass.
#[derive(Debug, Clone, Default)]
pub struct DynamicInfo {
    pub needed: Vec<u32>, // DT_STRTAB-relative string offsets
    pub hash: Option<u32>,
    pub strtab: Option<u32>,
    pub strsz: u32,
    pub symtab: Option<u32>,
    pub syment: u32,
    pub rel: Option<u32>,
    pub relsz: u32,
    pub relent: u32,
    pub rela: Option<u32>,
    pub relasz: u32,
    pub relaent: u32,
    pub jmprel: Option<u32>,
    pub pltrelsz: u32,
    pub pltrel_is_rela: bool,
    pub pltgot: Option<u32>,
    pub init: Option<u32>,
    pub fini: Option<u32>,
    pub init_array: Option<u32>,
    pub init_arraysz: u32,
    pub fini_array: Option<u32>,
    pub fini_arraysz: u32,
    pub flags: u32,
    pub bind_now: bool,
}

/// Walks the `PT_DYNAMIC` entries starting at guest address `vaddr`,
/// stopping at `DT_NULL`.
pub fn parse_dynamic(space: &AddressSpace, vaddr: u32) -> VmResult<DynamicInfo> {
    let mut info = DynamicInfo::default();
    let mut cursor = vaddr;
    loop {
        let tag = space.read_i32(cursor)?;
        let value = space.read_u32(cursor + 4)?;
        if tag == DT_NULL {
            break;
        }
        match tag {
            DT_NEEDED => info.needed.push(value),
            DT_HASH => info.hash = Some(value),
            DT_STRTAB => info.strtab = Some(value),
            DT_STRSZ => info.strsz = value,
            DT_SYMTAB => info.symtab = Some(value),
            DT_SYMENT => info.syment = value,
            DT_REL => info.rel = Some(value),
            DT_RELSZ => info.relsz = value,
            DT_RELENT => info.relent = value,
            DT_RELA => info.rela = Some(value),
            DT_RELASZ => info.relasz = value,
            DT_RELAENT => info.relaent = value,
            DT_JMPREL => info.jmprel = Some(value),
            DT_PLTRELSZ => info.pltrelsz = value,
            DT_PLTREL => info.pltrel_is_rela = value == DT_RELA as u32,
            DT_PLTGOT => info.pltgot = Some(value),
            DT_INIT => info.init = Some(value),
            DT_FINI => info.fini = Some(value),
            DT_INIT_ARRAY => info.init_array = Some(value),
            DT_INIT_ARRAYSZ => info.init_arraysz = value,
            DT_FINI_ARRAY => info.fini_array = Some(value),
            DT_FINI_ARRAYSZ => info.fini_arraysz = value,
            DT_FLAGS => {
                info.flags = value;
                info.bind_now = value & DF_BIND_NOW != 0;
            }
            _ => {}
        }
        cursor = cursor
            .checked_add(ENTRY_SIZE)
            .ok_or(VmError::BadInput("PT_DYNAMIC overflowed guest address space"))?;
    }
    Ok(info)
}

/// Reads the NUL-terminated string at `strtab + offset`.
pub fn read_dynstr(space: &AddressSpace, strtab: u32, offset: u32) -> VmResult<String> {
    let mut buf = [0u8; 256];
    let vaddr = strtab
        .checked_add(offset)
        .ok_or(VmError::BadInput("dynstr offset overflow"))?;
    let buf_len = buf.len();
    let len = space.read_string(vaddr, &mut buf, buf_len)?;
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_entry(space: &mut AddressSpace, at: u32, tag: i32, value: u32) -> u32 {
        space.write_u32(at, tag as u32).unwrap();
        space.write_u32(at + 4, value).unwrap();
        at + 8
    }

    #[test]
    fn parses_needed_and_symtab_entries() {
        let mut space = AddressSpace::new(0x1000);
        space.register_mapping(0, 0, 0x1000).unwrap();
        let mut cursor = 0u32;
        cursor = put_entry(&mut space, cursor, DT_STRTAB, 0x100);
        cursor = put_entry(&mut space, cursor, DT_NEEDED, 5);
        cursor = put_entry(&mut space, cursor, DT_SYMTAB, 0x200);
        put_entry(&mut space, cursor, DT_NULL, 0);

        let info = parse_dynamic(&space, 0).unwrap();
        assert_eq!(info.strtab, Some(0x100));
        assert_eq!(info.needed, vec![5]);
        assert_eq!(info.symtab, Some(0x200));
    }
}
