//! The fetch-decode-execute loop (spec.md sec. 4.5): prefix parsing, the
//! fast/full two-tier dispatch, and the PLT-stub interception contract
//! `decode.rs` and `fpu_escape.rs` call back into.

pub mod decode;
pub mod fast;
pub mod flags;
pub mod fpu_escape;

use crate::address_space::AddressSpace;
use crate::config::VmConfig;
use crate::context::GuestContext;
use crate::elf::symbol::SymbolTable;
use crate::error::{VmError, VmResult};
use crate::registers::EFlags;

/// Prefix bytes consumed ahead of an opcode (spec.md sec. 4.5 step 3), plus
/// the two run-wide settings a handler needs but that aren't prefixes
/// themselves: whether unknown opcodes are fatal, and the TLS base an
/// FS-relative access resolves against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repnz: bool,
    pub segment_fs: bool,
    pub segment_gs: bool,
    pub strict_mode: bool,
    pub tls_base: u32,
}

/// What a decoded instruction did to the fetch-decode-execute loop.
#[derive(Debug, Clone, Copy)]
pub enum StepOutcome {
    /// Advance EIP by `consumed` bytes (prefixes + opcode + operands).
    Continue { consumed: usize },
    /// The handler already set EIP itself (a taken jump, call, or ret).
    JumpTaken,
}

/// Evaluates one of the sixteen `Jcc` condition codes against `flags`,
/// matching the low nibble of the one- and two-byte `Jcc` opcode pairs
/// (`70..7F`, `0F 80..8F`).
#[must_use]
pub fn condition_holds(condition: u8, flags: &EFlags) -> bool {
    match condition & 0xF {
        0x0 => flags.of(),
        0x1 => !flags.of(),
        0x2 => flags.cf(),
        0x3 => !flags.cf(),
        0x4 => flags.zf(),
        0x5 => !flags.zf(),
        0x6 => flags.cf() || flags.zf(),
        0x7 => !flags.cf() && !flags.zf(),
        0x8 => flags.sf(),
        0x9 => !flags.sf(),
        0xA => flags.pf(),
        0xB => !flags.pf(),
        0xC => flags.sf() != flags.of(),
        0xD => flags.sf() == flags.of(),
        0xE => flags.zf() || (flags.sf() != flags.of()),
        _ => !flags.zf() && (flags.sf() == flags.of()),
    }
}

/// Emulates a `ret`-with-`EAX=0` against a call/jump that targeted a
/// dynamic-linker stub (spec.md sec. 4.5.2's "indirect calls through PLT
/// stubs"): pops the return address into EIP and zeroes EAX, as if the
/// unresolved function had been called and trivially returned.
pub fn resume_from_stub(ctx: &mut GuestContext, space: &AddressSpace) -> VmResult<StepOutcome> {
    let return_addr = decode::pop(ctx, space)?;
    log::warn!("call through unresolved stub intercepted; returning EAX=0 to {return_addr:#010x}");
    ctx.registers.eax = 0;
    ctx.set_eip(return_addr);
    Ok(StepOutcome::JumpTaken)
}

/// Why the interpreter loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    GracefulExit,
    MemoryFault,
    InstructionLimit,
    Fault,
}

/// Drives the single-threaded fetch-decode-execute loop (spec.md sec. 4.5)
/// over a [`GuestContext`]/[`AddressSpace`] pair.
pub struct Interpreter<'a> {
    ctx: &'a mut GuestContext,
    space: &'a mut AddressSpace,
    symbols: &'a SymbolTable,
    strict_mode: bool,
    tls_base: u32,
    instruction_limit: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        ctx: &'a mut GuestContext,
        space: &'a mut AddressSpace,
        symbols: &'a SymbolTable,
        config: &VmConfig,
    ) -> Self {
        Self {
            ctx,
            space,
            symbols,
            strict_mode: config.strict_mode,
            tls_base: crate::config::TLS_BASE,
            instruction_limit: config.instruction_limit,
        }
    }

    /// Runs until a halt condition is reached, returning why.
    pub fn run(&mut self) -> VmResult<HaltReason> {
        let mut executed: u64 = 0;
        loop {
            if self.ctx.should_exit || self.ctx.eip() == 0 {
                return Ok(HaltReason::GracefulExit);
            }
            if executed >= self.instruction_limit {
                return Ok(HaltReason::InstructionLimit);
            }
            match self.step() {
                Ok(()) => {}
                Err(VmError::GuestExit(_)) => return Ok(HaltReason::GracefulExit),
                Err(VmError::Unmapped(_) | VmError::Short(_) | VmError::Permission(_)) => {
                    return Ok(HaltReason::MemoryFault)
                }
                Err(_) => return Ok(HaltReason::Fault),
            }
            executed += 1;
        }
    }

    fn step(&mut self) -> VmResult<()> {
        let eip = self.ctx.eip();
        let mut code = [0u8; 15];
        let available = self.read_window(eip, &mut code)?;
        let code = &code[..available];

        let mut offset = 0usize;
        let mut prefixes = Prefixes {
            strict_mode: self.strict_mode,
            tls_base: self.tls_base,
            ..Prefixes::default()
        };
        for _ in 0..3 {
            match code.get(offset) {
                Some(0xF0) => prefixes.lock = true,
                Some(0xF3) => prefixes.rep = true,
                Some(0xF2) => prefixes.repnz = true,
                Some(0x26 | 0x2E | 0x36 | 0x3E) => {}
                Some(0x64) => prefixes.segment_fs = true,
                Some(0x65) => prefixes.segment_gs = true,
                _ => break,
            }
            offset += 1;
        }
        let rest = &code[offset..];
        let has_prefix = offset > 0;

        let outcome = if !has_prefix {
            match fast::try_fast(rest, self.ctx, self.space)? {
                Some(outcome) => outcome,
                None => decode::decode_full(rest, &prefixes, self.ctx, self.space, self.symbols)?,
            }
        } else {
            decode::decode_full(rest, &prefixes, self.ctx, self.space, self.symbols)?
        };

        match outcome {
            StepOutcome::Continue { consumed } => {
                self.ctx.set_eip(eip + (offset + consumed) as u32);
            }
            StepOutcome::JumpTaken => {}
        }
        Ok(())
    }

    /// Reads as many of the next 15 bytes as are actually mapped,
    /// tolerating a short final page the way an instruction fetch that
    /// only needs its first few bytes would.
    fn read_window(&self, eip: u32, out: &mut [u8; 15]) -> VmResult<usize> {
        for len in (1..=15).rev() {
            if self.space.read(eip, out, len).is_ok() {
                return Ok(len);
            }
        }
        Err(VmError::Unmapped(eip))
    }
}
