//! Thin CLI surface over [`haiku32_vm::Vm`] (spec.md sec. 1, sec. 6: the
//! command-line surface itself is out of scope for the crate; this binary
//! is the minimal thing that populates a `VmConfig` and drives one run).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use haiku32_vm::{HaltReason, VmConfig};

/// Run a Haiku i386 userland ELF binary under the hosted interpreter.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the ELF32/i386 executable to run.
    binary: PathBuf,

    /// Arguments passed to the guest as argv[1..].
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,

    /// Additional directory to search for DT_NEEDED libraries, tried
    /// before the default sysroot.
    #[arg(long = "sysroot")]
    sysroot: Option<String>,

    /// Instruction-count liveness bound before the interpreter aborts a
    /// runaway guest.
    #[arg(long)]
    instruction_limit: Option<u64>,

    /// Treat an unrecognized opcode as a hard fault instead of a
    /// best-effort skip.
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = VmConfig::default();
    if let Some(sysroot) = args.sysroot {
        config.sysroot_search_path.insert(0, sysroot);
    }
    if let Some(limit) = args.instruction_limit {
        config.instruction_limit = limit;
    }
    config.strict_mode = args.strict;
    config.argv = std::iter::once(args.binary.display().to_string())
        .chain(args.guest_args)
        .collect();
    config.envp = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();

    let mut vm = haiku32_vm::Vm::new(config);
    if let Err(err) = vm.load(&args.binary) {
        log::error!("failed to load {}: {err}", args.binary.display());
        return ExitCode::FAILURE;
    }

    match vm.run() {
        Ok(HaltReason::GracefulExit) => ExitCode::SUCCESS,
        Ok(reason) => {
            log::error!("guest halted abnormally: {reason:?}");
            dump_registers(&vm);
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("interpreter error: {err}");
            dump_registers(&vm);
            ExitCode::FAILURE
        }
    }
}

/// Writes the guest's register file, EFLAGS, and faulting EIP to the debug
/// sink on any fatal halt (spec.md sec. 7).
fn dump_registers(vm: &haiku32_vm::Vm) {
    let regs = vm.registers();
    log::error!(
        "eip={:#010x} eflags={:?} eax={:#010x} ecx={:#010x} edx={:#010x} ebx={:#010x} esp={:#010x} ebp={:#010x} esi={:#010x} edi={:#010x}",
        regs.eip,
        regs.flags(),
        regs.eax,
        regs.ecx,
        regs.edx,
        regs.ebx,
        regs.esp,
        regs.ebp,
        regs.esi,
        regs.edi,
    );
}
