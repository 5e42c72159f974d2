//! ELF32/i386 primitives: header, dynamic section, relocations, symbols
//! (spec.md sec. 6).

pub mod dynamic;
pub mod header;
pub mod reloc;
pub mod symbol;

pub use header::{ElfHeader, ObjectType, ProgramHeader, ProgramHeaderType};
