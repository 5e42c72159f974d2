//! The closed error taxonomy shared by every component.

use thiserror::Error;

use crate::address_space::GuestAddress;

/// Errors produced anywhere in the VM, per the taxonomy in the design doc.
#[derive(Debug, Error)]
pub enum VmError {
    /// Malformed ELF, bad parameter, or an out-of-range integer.
    #[error("bad input: {0}")]
    BadInput(&'static str),

    /// Guest access to an address with no mapping, or a mapping lacking
    /// the requested permission.
    #[error("unmapped guest access at {0:#010x}")]
    Unmapped(GuestAddress),

    /// An access straddled the boundary between mapped and unmapped bytes.
    #[error("access at {0:#010x} straddles an unmapped boundary")]
    Short(GuestAddress),

    /// Guest access violated a mapping's read/write permission.
    #[error("permission denied for access at {0:#010x}")]
    Permission(GuestAddress),

    /// An opcode or relocation type this VM chooses not to implement.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A host-side failure surfaced from the syscall dispatcher.
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The allocator ceiling, or a table such as the fd table, is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Not an error: the guest asked to exit. Observed by the interpreter
    /// loop to shut down cleanly.
    #[error("guest exit with status {0}")]
    GuestExit(i32),
}

pub type VmResult<T> = Result<T, VmError>;
