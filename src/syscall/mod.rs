//! The `INT 0x63`/`INT 0x80` syscall dispatcher (spec.md sec. 4.7).

pub mod fd;
mod table;

use crate::address_space::AddressSpace;
use crate::context::GuestContext;
use crate::error::VmResult;

const HAIKU_VECTOR: u8 = 0x63;
const LINUX_STYLE_VECTOR: u8 = 0x80;

/// Handles one `INT imm8`. Vectors other than the two the guest ABI
/// defines are a no-op, matching the interpreter's best-effort posture
/// toward instructions it doesn't need to fully model.
pub fn dispatch(ctx: &mut GuestContext, space: &mut AddressSpace, vector: u8) -> VmResult<()> {
    if vector != HAIKU_VECTOR && vector != LINUX_STYLE_VECTOR {
        log::debug!("ignoring INT {vector:#04x}, not a recognized syscall vector");
        return Ok(());
    }
    let number = ctx.registers.eax;
    let args = [
        ctx.registers.ebx,
        ctx.registers.ecx,
        ctx.registers.edx,
        ctx.registers.esi,
        ctx.registers.edi,
        ctx.registers.ebp,
    ];
    let result = table::invoke(ctx, space, number, args)?;
    ctx.registers.eax = result as u32;
    Ok(())
}
