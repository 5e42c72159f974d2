//! `R_386_*` relocation entries (spec.md sec. 4.4).

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// The relocation types this linker applies. Anything else is left
/// unresolved and reported through the stub mechanism rather than failing
/// the whole load (spec.md sec. 4.4 edge cases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RelType {
    None = 0,
    Direct32 = 1,
    Pc32 = 2,
    Copy = 5,
    GlobDat = 6,
    JmpSlot = 7,
    Relative = 8,
}

/// One `Elf32_Rel` entry: `r_offset` plus a packed symbol index / type.
#[derive(Debug, Clone, Copy)]
pub struct RelEntry {
    pub offset: u32,
    pub info: u32,
}

/// One `Elf32_Rela` entry: `RelEntry` plus an explicit addend.
#[derive(Debug, Clone, Copy)]
pub struct RelaEntry {
    pub offset: u32,
    pub info: u32,
    pub addend: i32,
}

pub trait Relocation {
    fn offset(&self) -> u32;
    fn info(&self) -> u32;

    /// The addend to apply, per spec.md sec. 4.4's "Addend source: *P (REL)
    /// or r_addend (RELA)" table. `existing_word` is the value already
    /// sitting at the relocation target; `RelEntry` (no explicit addend
    /// field) uses it verbatim, `RelaEntry` ignores it in favor of its own
    /// stored field.
    fn addend(&self, existing_word: i32) -> i32;

    fn sym_index(&self) -> u32 {
        self.info() >> 8
    }

    fn rel_type(&self) -> Option<RelType> {
        RelType::from_u8((self.info() & 0xFF) as u8)
    }
}

impl Relocation for RelEntry {
    fn offset(&self) -> u32 {
        self.offset
    }
    fn info(&self) -> u32 {
        self.info
    }
    fn addend(&self, existing_word: i32) -> i32 {
        existing_word
    }
}

impl Relocation for RelaEntry {
    fn offset(&self) -> u32 {
        self.offset
    }
    fn info(&self) -> u32 {
        self.info
    }
    fn addend(&self, _existing_word: i32) -> i32 {
        self.addend
    }
}

impl RelEntry {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            offset: crate::elf::header::read_u32(bytes, 0),
            info: crate::elf::header::read_u32(bytes, 4),
        }
    }
}

impl RelaEntry {
    pub const SIZE: usize = 12;

    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            offset: crate::elf::header::read_u32(bytes, 0),
            info: crate::elf::header::read_u32(bytes, 4),
            addend: crate::elf::header::read_u32(bytes, 8) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_entry_splits_symbol_and_type() {
        let entry = RelEntry {
            offset: 0x1000,
            info: (42 << 8) | RelType::GlobDat as u32,
        };
        assert_eq!(entry.sym_index(), 42);
        assert_eq!(entry.rel_type(), Some(RelType::GlobDat));
    }

    #[test]
    fn unknown_type_decodes_to_none() {
        let entry = RelEntry {
            offset: 0,
            info: 99,
        };
        assert_eq!(entry.rel_type(), None);
    }
}
