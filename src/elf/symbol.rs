//! Symbol table entries and cross-library symbol resolution
//! (spec.md sec. 4.4, grounded on `SymbolResolver.cpp`'s shadowing rule and
//! `StubFunctions.cpp`'s placeholder-on-unresolved behavior).

use std::collections::HashMap;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::address_space::AddressSpace;
use crate::config::{STUB_ENTRY_SIZE, STUB_REGION_BASE};
use crate::elf::dynamic::read_dynstr;
use crate::error::{VmError, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Binding {
    Local = 0,
    Global = 1,
    Weak = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SymType {
    NoType = 0,
    Object = 1,
    Func = 2,
    Section = 3,
    File = 4,
}

pub const SHN_UNDEF: u16 = 0;

/// One `Elf32_Sym` entry, as needed for resolution (spec.md sec. 4.4).
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u32,
    pub size: u32,
    pub binding: Binding,
    pub sym_type: SymType,
    pub shndx: u16,
}

impl Symbol {
    pub const ENTRY_SIZE: usize = 16;

    /// Parses one 16-byte `Elf32_Sym` record; `name` must already be
    /// resolved through the string table.
    #[must_use]
    pub fn parse(bytes: &[u8], name: String) -> Self {
        let value = crate::elf::header::read_u32(bytes, 4);
        let size = crate::elf::header::read_u32(bytes, 8);
        let info = bytes[12];
        let shndx = crate::elf::header::read_u16(bytes, 14);
        Self {
            name,
            value,
            size,
            binding: Binding::from_u8(info >> 4).unwrap_or(Binding::Local),
            sym_type: SymType::from_u8(info & 0xF).unwrap_or(SymType::NoType),
            shndx,
        }
    }

    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.shndx != SHN_UNDEF
    }
}

/// A resolved symbol's absolute guest address, together with the binding
/// that won it (used to decide whether a later, weaker definition may
/// shadow it).
#[derive(Debug, Clone, Copy)]
struct ResolvedEntry {
    address: u32,
    size: u32,
    binding: Binding,
    is_stub: bool,
}

/// Global symbol table across every loaded library, implementing the
/// first-strong-wins / weak-never-overrides-strong precedence rule
/// `SymbolResolver.cpp` applies (spec.md sec. 4.4).
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: HashMap<String, ResolvedEntry>,
    next_stub: u32,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_stub: STUB_REGION_BASE,
        }
    }

    /// Inserts a defined symbol at `address`. A `Global` definition always
    /// wins; a `Weak` definition only fills in a slot that is empty or
    /// already held by a stub.
    pub fn insert(&mut self, name: &str, address: u32, size: u32, binding: Binding) {
        if name.is_empty() {
            return;
        }
        match self.entries.get(name) {
            Some(existing) if existing.binding == Binding::Global && !existing.is_stub => {
                // strong definition already present: never shadowed.
            }
            Some(existing) if binding == Binding::Weak && !existing.is_stub => {
                // a weak definition never displaces any existing non-stub definition.
            }
            _ => {
                self.entries.insert(
                    name.to_string(),
                    ResolvedEntry {
                        address,
                        size,
                        binding,
                        is_stub: false,
                    },
                );
            }
        }
    }

    /// Looks up a previously resolved address.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.entries.get(name).map(|e| e.address)
    }

    /// Looks up a previously resolved symbol's declared size, used for
    /// `R_386_COPY` relocations.
    #[must_use]
    pub fn size_of(&self, name: &str) -> Option<u32> {
        self.entries.get(name).map(|e| e.size)
    }

    /// Synthesizes a stub entry for an unresolved reference, so that the
    /// relocation still has *some* address to bind to rather than aborting
    /// the whole load (spec.md sec. 4.4's "unresolved symbol" edge case,
    /// grounded on `StubFunctions.cpp`).
    pub fn resolve_or_stub(&mut self, name: &str) -> VmResult<u32> {
        if let Some(addr) = self.lookup(name) {
            return Ok(addr);
        }
        let address = self.next_stub;
        self.next_stub = self
            .next_stub
            .checked_add(STUB_ENTRY_SIZE)
            .ok_or(VmError::ResourceExhausted("stub region exhausted"))?;
        self.entries.insert(
            name.to_string(),
            ResolvedEntry {
                address,
                size: 0,
                binding: Binding::Global,
                is_stub: true,
            },
        );
        Ok(address)
    }

    #[must_use]
    pub fn is_stub(&self, address: u32) -> bool {
        self.entries.values().any(|e| e.is_stub && e.address == address)
    }
}

/// The SysV ELF hash table's second word (`nchain`) equals the number of
/// symbol table entries, the standard way to size a `.dynsym` scan when no
/// section headers survive stripping (spec.md sec. 4.4).
pub fn dynsym_count(space: &AddressSpace, hash_vaddr: u32) -> VmResult<u32> {
    space.read_u32(hash_vaddr + 4)
}

/// Parses every entry of `.dynsym`, resolving each name through `.dynstr`.
pub fn parse_dynsymtab(
    space: &AddressSpace,
    symtab: u32,
    strtab: u32,
    count: u32,
) -> VmResult<Vec<Symbol>> {
    let mut symbols = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry_addr = symtab + i * Symbol::ENTRY_SIZE as u32;
        let mut bytes = [0u8; Symbol::ENTRY_SIZE];
        space.read(entry_addr, &mut bytes, Symbol::ENTRY_SIZE)?;
        let name_offset = crate::elf::header::read_u32(&bytes, 0);
        let name = read_dynstr(space, strtab, name_offset)?;
        symbols.push(Symbol::parse(&bytes, name));
    }
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_definition_is_never_shadowed_by_later_weak() {
        let mut table = SymbolTable::new();
        table.insert("foo", 0x1000, 0, Binding::Global);
        table.insert("foo", 0x2000, 0, Binding::Weak);
        assert_eq!(table.lookup("foo"), Some(0x1000));
    }

    #[test]
    fn weak_definition_fills_empty_slot() {
        let mut table = SymbolTable::new();
        table.insert("bar", 0x3000, 0, Binding::Weak);
        assert_eq!(table.lookup("bar"), Some(0x3000));
    }

    #[test]
    fn later_strong_definition_overrides_earlier_weak() {
        let mut table = SymbolTable::new();
        table.insert("baz", 0x1000, 0, Binding::Weak);
        table.insert("baz", 0x2000, 0, Binding::Global);
        assert_eq!(table.lookup("baz"), Some(0x2000));
    }

    #[test]
    fn unresolved_symbol_gets_a_stub_in_the_stub_region() {
        let mut table = SymbolTable::new();
        let addr = table.resolve_or_stub("missing").unwrap();
        assert!(addr >= STUB_REGION_BASE);
        assert!(table.is_stub(addr));
        // second lookup returns the same stub, not a fresh one
        assert_eq!(table.resolve_or_stub("missing").unwrap(), addr);
    }
}
