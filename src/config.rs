//! Tunable constants and the VM's configuration surface.
//!
//! The command-line surface that fills in a [`VmConfig`] is out of scope
//! for this crate (spec.md sec. 1, sec. 6); this module is the interface boundary
//! a CLI is expected to populate.

/// Base address chosen for an `ET_DYN` main image.
pub const ET_DYN_BASE: u32 = 0x4000_0000;

/// Extra headroom left between the main image and the first library base.
pub const LIBRARY_GAP: u32 = 0x0010_0000;

/// Top of the initial guest stack.
pub const STACK_TOP: u32 = 0xC000_0000;

/// Minimum size of the initial guest stack, including guard margin.
pub const STACK_SIZE: u32 = 4 * 1024 * 1024;

/// Base of the reserved stub-symbol region (see sec. 4.4).
pub const STUB_REGION_BASE: u32 = 0xBFFC_0000;

/// Size in bytes reserved per stub symbol.
pub const STUB_ENTRY_SIZE: u32 = 16;

/// Guest address of the commpage, published to the guest in EDX at entry.
pub const COMMPAGE_BASE: u32 = 0xBFFE_0000;

/// Guest address of the TLS page (sec. 6).
pub const TLS_BASE: u32 = 0xBFFF_F000;

/// Size of the TLS page.
pub const TLS_SIZE: u32 = 4096;

/// Size of a commpage.
pub const COMMPAGE_SIZE: u32 = 4096;

/// Offset within the commpage of the `int $0x63; ret` vsyscall stub.
pub const COMMPAGE_VSYSCALL_STUB_OFFSET: u32 = 0x100;

/// Magic value written at commpage offset 0.
pub const COMMPAGE_MAGIC: u32 = 0x4861_696B; // "Haik"

/// Version written at commpage offset 4.
pub const COMMPAGE_VERSION: u32 = 1;

/// Default ceiling for the guest memory allocator (256 MiB).
pub const DEFAULT_ALLOCATOR_CEILING: u32 = 256 * 1024 * 1024;

/// Default cap on `read_string` copies.
pub const DEFAULT_STRING_CAP: usize = 4096;

/// Default instruction-count liveness bound.
pub const DEFAULT_INSTRUCTION_LIMIT: u64 = 200_000_000;

/// Default library search path, as described in spec.md sec. 4.4.
pub const DEFAULT_SYSROOT: &str = "./sysroot/haiku32/lib";

/// Runtime configuration for a single VM run.
///
/// Populated by the (out-of-scope) CLI surface; every field has a sane
/// default so tests can construct a [`VmConfig::default`] directly.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Search path(s) tried, in order, to resolve a `DT_NEEDED` name.
    pub sysroot_search_path: Vec<String>,
    /// Ceiling on the guest memory allocator, in bytes.
    pub allocator_ceiling: u32,
    /// Instruction-count bound before the interpreter halts with a
    /// liveness-escape fault.
    pub instruction_limit: u64,
    /// When set, an unsupported opcode is a hard fault rather than a
    /// best-effort skip (spec.md sec. 9, "Unknown opcodes").
    pub strict_mode: bool,
    /// Guest-visible argv.
    pub argv: Vec<String>,
    /// Guest-visible envp.
    pub envp: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            sysroot_search_path: vec![DEFAULT_SYSROOT.to_string()],
            allocator_ceiling: DEFAULT_ALLOCATOR_CEILING,
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
            strict_mode: false,
            argv: Vec::new(),
            envp: Vec::new(),
        }
    }
}
