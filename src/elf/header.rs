//! ELF32 header and program-header parsing (spec.md sec. 6).
//!
//! These structures are decoded straight out of the raw file bytes at the
//! fixed offsets the System V ABI i386 supplement specifies, the way the
//! teacher's `#[repr(C)]` ELF structs plus `num_derive::FromPrimitive`
//! enums decode AArch64 ELF64 headers in `user/src/os/vm/elf.rs` -- adapted
//! here to the 32-bit field layout and offsets spec.md sec. 6 calls out
//! explicitly.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::{VmError, VmResult};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELF_CLASS_32: u8 = 1;
pub const ELF_DATA_LSB: u8 = 1;
pub const EM_386: u16 = 3;

/// `e_type` values this loader accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ObjectType {
    Exec = 2,
    Dyn = 3,
}

/// The fields of the ELF32 header this loader needs, at their fixed
/// offsets (spec.md sec. 6).
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub object_type: ObjectType,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHeader {
    /// Validates identity (magic, class, endianness, machine) and decodes
    /// the fixed-offset fields spec.md sec. 6 lists.
    pub fn parse(file: &[u8]) -> VmResult<Self> {
        if file.len() < 0x34 {
            return Err(VmError::BadInput("ELF file shorter than e32 header"));
        }
        if file[0..4] != ELF_MAGIC {
            return Err(VmError::BadInput("bad ELF magic"));
        }
        if file[4] != ELF_CLASS_32 {
            return Err(VmError::BadInput("not a 32-bit ELF"));
        }
        if file[5] != ELF_DATA_LSB {
            return Err(VmError::BadInput("not little-endian"));
        }
        let machine = read_u16(file, 0x12);
        if machine != EM_386 {
            return Err(VmError::BadInput("not an i386 ELF"));
        }
        let raw_type = read_u16(file, 0x10);
        let object_type = ObjectType::from_u16(raw_type)
            .ok_or(VmError::BadInput("unsupported e_type (not ET_EXEC/ET_DYN)"))?;

        Ok(Self {
            object_type,
            entry: read_u32(file, 0x18),
            phoff: read_u32(file, 0x1C),
            shoff: read_u32(file, 0x20),
            shentsize: read_u16(file, 0x2E),
            shnum: read_u16(file, 0x30),
            shstrndx: read_u16(file, 0x32),
            phentsize: read_u16(file, 0x2A),
            phnum: read_u16(file, 0x2C),
        })
    }
}

/// `p_type` values this loader recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ProgramHeaderType {
    Null = 0,
    Load = 1,
    Dynamic = 2,
    Interp = 3,
    Note = 4,
}

pub const PF_EXEC: u32 = 1;
pub const PF_WRITE: u32 = 2;
pub const PF_READ: u32 = 4;

/// One 32-byte ELF32 program header (spec.md sec. 6 field offsets).
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub raw_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgramHeader {
    pub const SIZE: usize = 32;

    fn parse(bytes: &[u8]) -> Self {
        Self {
            raw_type: read_u32(bytes, 0),
            flags: read_u32(bytes, 24),
            offset: read_u32(bytes, 4),
            vaddr: read_u32(bytes, 8),
            filesz: read_u32(bytes, 16),
            memsz: read_u32(bytes, 20),
            align: read_u32(bytes, 28),
        }
    }

    #[must_use]
    pub fn program_header_type(&self) -> Option<ProgramHeaderType> {
        ProgramHeaderType::from_u32(self.raw_type)
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        self.raw_type == ProgramHeaderType::Load as u32
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.raw_type == ProgramHeaderType::Dynamic as u32
    }

    #[must_use]
    pub fn is_interp(&self) -> bool {
        self.raw_type == ProgramHeaderType::Interp as u32
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.flags & PF_WRITE != 0
    }
}

/// Parses every program header out of `file`, per `header`'s `phoff`/
/// `phnum`/`phentsize`.
pub fn parse_program_headers(file: &[u8], header: &ElfHeader) -> VmResult<Vec<ProgramHeader>> {
    if usize::from(header.phentsize) < ProgramHeader::SIZE {
        return Err(VmError::BadInput("phentsize smaller than ELF32 phdr"));
    }
    let mut headers = Vec::with_capacity(header.phnum as usize);
    for i in 0..header.phnum as usize {
        let start = header.phoff as usize + i * header.phentsize as usize;
        let end = start
            .checked_add(ProgramHeader::SIZE)
            .ok_or(VmError::BadInput("program header table overflow"))?;
        let bytes = file
            .get(start..end)
            .ok_or(VmError::BadInput("program header out of file bounds"))?;
        headers.push(ProgramHeader::parse(bytes));
    }
    Ok(headers)
}

pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(object_type: u16, phnum: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x34];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = ELF_CLASS_32;
        bytes[5] = ELF_DATA_LSB;
        bytes[0x10..0x12].copy_from_slice(&object_type.to_le_bytes());
        bytes[0x12..0x14].copy_from_slice(&EM_386.to_le_bytes());
        bytes[0x18..0x1C].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[0x1C..0x20].copy_from_slice(&0x34u32.to_le_bytes());
        bytes[0x2A..0x2C].copy_from_slice(&(ProgramHeader::SIZE as u16).to_le_bytes());
        bytes[0x2C..0x2E].copy_from_slice(&phnum.to_le_bytes());
        bytes
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = minimal_header(2, 0);
        bytes[0] = 0;
        assert!(ElfHeader::parse(&bytes).is_err());
    }

    #[test]
    fn accepts_et_exec_and_et_dyn() {
        assert!(ElfHeader::parse(&minimal_header(2, 0)).is_ok());
        assert!(ElfHeader::parse(&minimal_header(3, 0)).is_ok());
        assert!(ElfHeader::parse(&minimal_header(1, 0)).is_err());
    }

    #[test]
    fn parses_program_headers_at_declared_offset() {
        let mut bytes = minimal_header(2, 1);
        bytes.extend(std::iter::repeat(0u8).take(ProgramHeader::SIZE));
        let ph_off = bytes.len() - ProgramHeader::SIZE;
        bytes[ph_off..ph_off + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        bytes[ph_off + 8..ph_off + 12].copy_from_slice(&0x1000u32.to_le_bytes());
        let header = ElfHeader::parse(&bytes).unwrap();
        let phdrs = parse_program_headers(&bytes, &header).unwrap();
        assert_eq!(phdrs.len(), 1);
        assert!(phdrs[0].is_load());
        assert_eq!(phdrs[0].vaddr, 0x1000);
    }
}
