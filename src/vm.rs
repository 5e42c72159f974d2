//! The VM façade (spec.md sec. 9's "cyclic references" redesign note): a
//! single owner for the address space, allocator, symbol table, and guest
//! context, handing out short-lived borrows to the loader, linker, and
//! interpreter instead of those components holding references to each
//! other.

use std::path::Path;

use crate::address_space::AddressSpace;
use crate::allocator::GuestMemoryAllocator;
use crate::commpage;
use crate::config::{VmConfig, COMMPAGE_BASE, ET_DYN_BASE, TLS_BASE};
use crate::context::GuestContext;
use crate::dynamic_linker;
use crate::elf::symbol::SymbolTable;
use crate::error::VmResult;
use crate::interpreter::{HaltReason, Interpreter};
use crate::loader;
use crate::tls;

/// The Haiku i386 main thread's conventional team/thread id for a
/// single-guest-context run; nothing downstream distinguishes a real id
/// from this placeholder.
const MAIN_THREAD_ID: u32 = 1;

/// A single guest process: its address space, its one thread's context,
/// and everything the loader/linker populated.
pub struct Vm {
    space: AddressSpace,
    allocator: GuestMemoryAllocator,
    symbols: SymbolTable,
    ctx: GuestContext,
    config: VmConfig,
}

impl Vm {
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self {
            space: AddressSpace::new(config.allocator_ceiling),
            allocator: GuestMemoryAllocator::new(config.allocator_ceiling),
            symbols: SymbolTable::new(),
            ctx: GuestContext::new(),
            config,
        }
    }

    /// Loads `path` as the main image, resolves its `DT_NEEDED` libraries,
    /// installs the commpage and TLS page, and builds the initial stack,
    /// leaving the guest context ready to run from its entry point.
    pub fn load(&mut self, path: &Path) -> VmResult<()> {
        let bytes = std::fs::read(path)?;
        let main_image = loader::load_image(&mut self.space, &mut self.allocator, &bytes, ET_DYN_BASE)?;

        self.symbols = dynamic_linker::link(
            &mut self.space,
            &mut self.allocator,
            &self.config.sysroot_search_path,
            &main_image,
        )?;

        commpage::install(&mut self.space, &mut self.allocator, COMMPAGE_BASE)?;
        tls::install(&mut self.space, &mut self.allocator, TLS_BASE, MAIN_THREAD_ID)?;

        let sp = loader::build_initial_stack(
            &mut self.space,
            &mut self.allocator,
            &self.config.argv,
            &self.config.envp,
        )?;
        self.ctx.registers.esp = sp;
        self.ctx.registers.edx = COMMPAGE_BASE;
        self.ctx.image_base = main_image.base;
        self.ctx.set_eip(main_image.entry);
        Ok(())
    }

    /// Runs the interpreter to completion, returning why it stopped.
    pub fn run(&mut self) -> VmResult<HaltReason> {
        let mut interpreter = Interpreter::new(&mut self.ctx, &mut self.space, &self.symbols, &self.config);
        interpreter.run()
    }

    #[must_use]
    pub fn exit_status(&self) -> u32 {
        self.ctx.registers.eax
    }

    /// Read-only access to the guest register file, for callers that need
    /// to inspect state after a run (tests, debuggers).
    #[must_use]
    pub fn registers(&self) -> &crate::registers::Registers {
        &self.ctx.registers
    }

    /// Read-only access to the guest FPU state.
    #[must_use]
    pub fn fpu(&self) -> &crate::fpu::Fpu {
        &self.ctx.fpu
    }

    /// Reads a 32-bit word out of guest memory.
    pub fn read_u32(&self, vaddr: u32) -> VmResult<u32> {
        self.space.read_u32(vaddr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_exec_exit() -> Vec<u8> {
        // mov eax, 1 ; mov ebx, 7 ; int 0x63  (sys_exit(7))
        let payload: &[u8] = &[0xB8, 1, 0, 0, 0, 0xBB, 7, 0, 0, 0, 0xCD, 0x63];
        let mut bytes = vec![0u8; 0x34];
        bytes[0..4].copy_from_slice(&crate::elf::header::ELF_MAGIC);
        bytes[4] = 1;
        bytes[5] = 1;
        bytes[0x10..0x12].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        bytes[0x12..0x14].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        bytes[0x18..0x1C].copy_from_slice(&0x1000u32.to_le_bytes());
        bytes[0x1C..0x20].copy_from_slice(&0x34u32.to_le_bytes());
        bytes[0x2A..0x2C].copy_from_slice(&32u16.to_le_bytes());
        bytes[0x2C..0x2E].copy_from_slice(&1u16.to_le_bytes());

        let ph_off = bytes.len();
        let mut phdr = vec![0u8; 32];
        phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        phdr[4..8].copy_from_slice(&(ph_off as u32 + 32).to_le_bytes());
        phdr[8..12].copy_from_slice(&0x1000u32.to_le_bytes());
        phdr[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        phdr[20..24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        phdr[24..28].copy_from_slice(&5u32.to_le_bytes()); // PF_R|PF_X
        bytes.extend_from_slice(&phdr);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn a_minimal_binary_runs_to_a_graceful_exit() {
        let dir = std::env::temp_dir().join("haiku32_vm_minimal_exit_test");
        std::fs::write(&dir, minimal_exec_exit()).unwrap();

        let mut vm = Vm::new(VmConfig::default());
        vm.load(&dir).unwrap();
        let reason = vm.run().unwrap();
        assert_eq!(reason, HaltReason::GracefulExit);
        assert_eq!(vm.exit_status(), 7);

        std::fs::remove_file(&dir).ok();
    }
}
