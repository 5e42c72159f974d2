//! The x87 escape opcodes `D8`..`DF` (spec.md sec. 4.5.2, sec. 4.6).
//!
//! The interpreter consumes the opcode and ModR/M (and any SIB/displacement
//! the memory form needs) and hands the decoded operand to the [`Fpu`].
//! Only the arithmetic forms a Haiku userland compiler actually emits are
//! covered; anything else is a conservative length-estimate skip, the same
//! policy unknown integer opcodes get.

use crate::address_space::AddressSpace;
use crate::context::GuestContext;
use crate::error::VmResult;
use crate::interpreter::decode::{decode_modrm, RmOperand};
use crate::interpreter::StepOutcome;

pub fn dispatch(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let modrm_byte = *rest.first().unwrap_or(&0);
    let is_register_form = modrm_byte >> 6 == 0b11;

    if opcode == 0xD9 && is_register_form {
        return dispatch_d9_register(modrm_byte, ctx);
    }
    if opcode == 0xDB && modrm_byte == 0xE3 {
        ctx.fpu.finit();
        return Ok(StepOutcome::Continue { consumed: 2 });
    }

    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let instr_len = 1 + modrm_len;

    match (opcode, reg & 0b111) {
        (0xD9, 0) => {
            let bits = load_m32(rm, ctx, space)?;
            ctx.fpu.push(f32::from_bits(bits) as f64).ok();
        }
        (0xD9, 2) => {
            let value = ctx.fpu.peek(0).unwrap_or(0.0) as f32;
            store_m32(rm, ctx, space, value.to_bits())?;
        }
        (0xD9, 3) => {
            let value = ctx.fpu.pop().unwrap_or(0.0) as f32;
            store_m32(rm, ctx, space, value.to_bits())?;
        }
        (0xD9, 5) => {
            if let RmOperand::Memory(addr) = rm {
                let cw = space.read_u32(addr)? as u16;
                ctx.fpu.set_control_word(cw);
            }
        }
        (0xD9, 7) => {
            if let RmOperand::Memory(addr) = rm {
                space.write_u32(addr, u32::from(ctx.fpu.control_word()))?;
            }
        }
        (0xDD, 0) => {
            let bits = load_m64(rm, ctx, space)?;
            ctx.fpu.push(f64::from_bits(bits)).ok();
        }
        (0xDD, 2) => {
            let value = ctx.fpu.peek(0).unwrap_or(0.0);
            store_m64(rm, ctx, space, value.to_bits())?;
        }
        (0xDD, 3) => {
            let value = ctx.fpu.pop().unwrap_or(0.0);
            store_m64(rm, ctx, space, value.to_bits())?;
        }
        (0xD8, 0) => arith_m32(rm, ctx, space, |a, b| a + b)?,
        (0xD8, 1) => arith_m32(rm, ctx, space, |a, b| a * b)?,
        (0xD8, 4) => arith_m32(rm, ctx, space, |a, b| a - b)?,
        (0xD8, 6) => arith_m32(rm, ctx, space, |a, b| a / b)?,
        (0xD8, 3) => {
            let operand = load_m32(rm, ctx, space).map(|bits| f32::from_bits(bits) as f64)?;
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.compare(top, operand);
        }
        _ => {
            log::debug!("skipping unimplemented x87 escape {opcode:#04x}/{reg}");
        }
    }
    Ok(StepOutcome::Continue { consumed: instr_len })
}

fn dispatch_d9_register(modrm_byte: u8, ctx: &mut GuestContext) -> VmResult<StepOutcome> {
    match modrm_byte {
        0xE8 => {
            ctx.fpu.push(1.0).ok();
        }
        0xEE => {
            ctx.fpu.push(0.0).ok();
        }
        0xE0 => {
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.abs());
        }
        0xE1 => {
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, -top);
        }
        0xFA => {
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.sqrt());
        }
        0xFE => {
            // FSIN
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.sin());
        }
        0xFF => {
            // FCOS
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.cos());
        }
        0xF2 => {
            // FPTAN
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.tan());
        }
        0xF3 => {
            // FPATAN: ST(1) <- atan2(ST(1), ST(0)), pop ST(0)
            let x = ctx.fpu.pop().unwrap_or(0.0);
            let y = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, y.atan2(x));
        }
        0xF8 => {
            // FPREM: ST(0) <- ST(0) truncated-remainder ST(1)
            let divisor = ctx.fpu.peek(1).unwrap_or(1.0);
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top % divisor);
        }
        0xFC => {
            // FRNDINT, rounded per the current host default rather than
            // the guest's control-word rounding mode.
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.round());
        }
        0xF1 => {
            // FYL2X: ST(1) <- ST(1) * log2(ST(0)), pop ST(0)
            let x = ctx.fpu.pop().unwrap_or(0.0);
            let y = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, y * x.log2());
        }
        0xF0 => {
            // F2XM1: ST(0) <- 2^ST(0) - 1
            let top = ctx.fpu.peek(0).unwrap_or(0.0);
            ctx.fpu.store(0, top.exp2() - 1.0);
        }
        _ => {
            log::debug!("skipping unimplemented x87 register-form opcode D9 {modrm_byte:#04x}");
        }
    }
    Ok(StepOutcome::Continue { consumed: 2 })
}

fn load_m32(rm: RmOperand, ctx: &GuestContext, space: &AddressSpace) -> VmResult<u32> {
    match rm {
        RmOperand::Memory(addr) => space.read_u32(addr),
        RmOperand::Register(_) => Ok(rm.load(ctx, space)?),
    }
}

fn store_m32(
    rm: RmOperand,
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    bits: u32,
) -> VmResult<()> {
    match rm {
        RmOperand::Memory(addr) => space.write_u32(addr, bits),
        RmOperand::Register(_) => rm.store(ctx, space, bits),
    }
}

fn load_m64(rm: RmOperand, _ctx: &GuestContext, space: &AddressSpace) -> VmResult<u64> {
    match rm {
        RmOperand::Memory(addr) => {
            let low = space.read_u32(addr)?;
            let high = space.read_u32(addr + 4)?;
            Ok((u64::from(high) << 32) | u64::from(low))
        }
        RmOperand::Register(_) => Ok(0),
    }
}

fn store_m64(
    rm: RmOperand,
    _ctx: &mut GuestContext,
    space: &mut AddressSpace,
    bits: u64,
) -> VmResult<()> {
    if let RmOperand::Memory(addr) = rm {
        space.write_u32(addr, bits as u32)?;
        space.write_u32(addr + 4, (bits >> 32) as u32)?;
    }
    Ok(())
}

fn arith_m32(
    rm: RmOperand,
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    op: impl Fn(f64, f64) -> f64,
) -> VmResult<()> {
    let operand = f32::from_bits(load_m32(rm, ctx, space)?) as f64;
    let top = ctx.fpu.peek(0).unwrap_or(0.0);
    ctx.fpu.store(0, op(top, operand));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_top(value: f64) -> GuestContext {
        let mut ctx = GuestContext::new();
        ctx.fpu.push(value).unwrap();
        ctx
    }

    #[test]
    fn fsin_replaces_top_in_place() {
        let mut ctx = ctx_with_top(0.0);
        dispatch_d9_register(0xFE, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 0.0_f64.sin());
    }

    #[test]
    fn fcos_replaces_top_in_place() {
        let mut ctx = ctx_with_top(0.0);
        dispatch_d9_register(0xFF, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 0.0_f64.cos());
    }

    #[test]
    fn f2xm1_computes_two_to_the_power_minus_one() {
        let mut ctx = ctx_with_top(1.0);
        dispatch_d9_register(0xF0, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 1.0);
    }

    #[test]
    fn fyl2x_multiplies_log2_of_top_into_the_next_slot_and_pops() {
        let mut ctx = GuestContext::new();
        ctx.fpu.push(3.0).unwrap(); // ST1, becomes the result slot
        ctx.fpu.push(2.0).unwrap(); // ST0 = 2.0, log2(2.0) == 1.0
        dispatch_d9_register(0xF1, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 3.0);
    }

    #[test]
    fn fpatan_computes_atan2_of_st1_over_st0_and_pops() {
        let mut ctx = GuestContext::new();
        ctx.fpu.push(0.0).unwrap(); // ST1 = y
        ctx.fpu.push(1.0).unwrap(); // ST0 = x
        dispatch_d9_register(0xF3, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 0.0_f64.atan2(1.0));
    }

    #[test]
    fn fprem_leaves_the_truncated_remainder_on_top() {
        let mut ctx = GuestContext::new();
        ctx.fpu.push(3.0).unwrap(); // ST1 (divisor)
        ctx.fpu.push(5.0).unwrap(); // ST0 (dividend)
        dispatch_d9_register(0xF8, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 5.0 % 3.0);
    }

    #[test]
    fn frndint_rounds_to_nearest_integer() {
        let mut ctx = ctx_with_top(2.4);
        dispatch_d9_register(0xFC, &mut ctx).unwrap();
        assert_eq!(ctx.fpu.peek(0).unwrap(), 2.0);
    }
}
