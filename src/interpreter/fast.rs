//! The fast-path dispatch table (spec.md sec. 4.5.1): register-only forms
//! of the hottest opcodes, tried before the full decoder. Any opcode or
//! operand form this table doesn't recognize returns `Ok(None)`, sending
//! the instruction to [`super::decode::decode_full`] instead -- this path
//! exists purely for throughput, never for coverage.

use crate::address_space::AddressSpace;
use crate::context::GuestContext;
use crate::error::VmResult;
use crate::interpreter::decode::{
    apply_alu, apply_shift, is_alu_opcode, pop, push, shift_op_from_reg, AluOp,
};
use crate::interpreter::flags::{self, Width};
use crate::interpreter::{condition_holds, StepOutcome};
use crate::registers::Gpr;

/// Attempts the fast path for an unprefixed instruction. `Ok(None)` means
/// "not handled here, try the full decoder" -- not an error.
pub fn try_fast(
    code: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<Option<StepOutcome>> {
    let Some(&opcode) = code.first() else {
        return Ok(None);
    };
    let rest = &code[1..];

    let outcome = match opcode {
        0x90 => Some(StepOutcome::Continue { consumed: 1 }),
        0x40..=0x47 => {
            let reg = Gpr::from_index(opcode - 0x40);
            let mut flags = ctx.registers.flags();
            let result = flags::add(&mut flags, u64::from(ctx.registers.get(reg)), 1, 0, Width::W32) as u32;
            ctx.registers.set_flags(flags);
            ctx.registers.set(reg, result);
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0x48..=0x4F => {
            let reg = Gpr::from_index(opcode - 0x48);
            let mut flags = ctx.registers.flags();
            let result = flags::sub(&mut flags, u64::from(ctx.registers.get(reg)), 1, 0, Width::W32) as u32;
            ctx.registers.set_flags(flags);
            ctx.registers.set(reg, result);
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0x50..=0x57 => {
            let reg = Gpr::from_index(opcode - 0x50);
            let value = ctx.registers.get(reg);
            push(ctx, space, value)?;
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0x58..=0x5F => {
            let reg = Gpr::from_index(opcode - 0x58);
            let value = pop(ctx, space)?;
            ctx.registers.set(reg, value);
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0x68 => {
            let imm = read_u32(rest, 0)?;
            push(ctx, space, imm)?;
            Some(StepOutcome::Continue { consumed: 5 })
        }
        0x70..=0x7F => {
            let disp = rest.first().copied().unwrap_or(0) as i8;
            let instr_len = 2i64;
            let taken = condition_holds(opcode - 0x70, &ctx.registers.flags());
            let eip = if taken {
                (ctx.eip() as i64 + instr_len + i64::from(disp)) as u32
            } else {
                ctx.eip() + instr_len as u32
            };
            ctx.set_eip(eip);
            Some(StepOutcome::JumpTaken)
        }
        0x87 => {
            // XCHG r32,r32 register form only; anything else falls back.
            match rest.first() {
                Some(&modrm) if modrm >> 6 == 0b11 => {
                    let dst = Gpr::from_index((modrm >> 3) & 0b111);
                    let src = Gpr::from_index(modrm & 0b111);
                    let a = ctx.registers.get(dst);
                    let b = ctx.registers.get(src);
                    ctx.registers.set(dst, b);
                    ctx.registers.set(src, a);
                    Some(StepOutcome::Continue { consumed: 2 })
                }
                _ => None,
            }
        }
        0x88..=0x8B => match rest.first() {
            Some(&modrm) if modrm >> 6 == 0b11 => {
                let reg = Gpr::from_index((modrm >> 3) & 0b111);
                let rm = Gpr::from_index(modrm & 0b111);
                match opcode {
                    0x89 => ctx.registers.set(rm, ctx.registers.get(reg)),
                    0x8B => {
                        let v = ctx.registers.get(rm);
                        ctx.registers.set(reg, v);
                    }
                    0x88 => {
                        let v = ctx.registers.get(reg) & 0xFF;
                        let cur = ctx.registers.get(rm);
                        ctx.registers.set(rm, (cur & 0xFFFF_FF00) | v);
                    }
                    _ => {
                        let v = ctx.registers.get(rm) & 0xFF;
                        let cur = ctx.registers.get(reg);
                        ctx.registers.set(reg, (cur & 0xFFFF_FF00) | v);
                    }
                }
                Some(StepOutcome::Continue { consumed: 2 })
            }
            _ => None,
        },
        0xB8..=0xBF => {
            let imm = read_u32(rest, 0)?;
            ctx.registers.set(Gpr::from_index(opcode - 0xB8), imm);
            Some(StepOutcome::Continue { consumed: 5 })
        }
        0x98 => {
            // CWDE: sign-extend AX into EAX.
            ctx.registers.eax = (ctx.registers.eax as i16) as i32 as u32;
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0x99 => {
            // CDQ: sign-extend EAX into EDX:EAX.
            ctx.registers.edx = if (ctx.registers.eax as i32) < 0 { 0xFFFF_FFFF } else { 0 };
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0xC3 => {
            let return_addr = pop(ctx, space)?;
            if return_addr == 0 {
                ctx.should_exit = true;
            }
            ctx.set_eip(return_addr);
            Some(StepOutcome::JumpTaken)
        }
        0xC9 => {
            // LEAVE: mov esp,ebp; pop ebp
            ctx.registers.esp = ctx.registers.ebp;
            let value = pop(ctx, space)?;
            ctx.registers.ebp = value;
            Some(StepOutcome::Continue { consumed: 1 })
        }
        0xCD => {
            let vector = *rest.first().unwrap_or(&0);
            crate::syscall::dispatch(ctx, space, vector)?;
            Some(StepOutcome::Continue { consumed: 2 })
        }
        0xE8 => {
            let disp = read_i32(rest, 0)?;
            let return_addr = ctx.eip() + 5;
            push(ctx, space, return_addr)?;
            ctx.set_eip((return_addr as i64 + i64::from(disp)) as u32);
            Some(StepOutcome::JumpTaken)
        }
        0xE9 => {
            let disp = read_i32(rest, 0)?;
            let eip = (ctx.eip() as i64 + 5 + i64::from(disp)) as u32;
            ctx.set_eip(eip);
            Some(StepOutcome::JumpTaken)
        }
        0xEB => {
            let disp = rest.first().copied().unwrap_or(0) as i8;
            let eip = (ctx.eip() as i64 + 2 + i64::from(disp)) as u32;
            ctx.set_eip(eip);
            Some(StepOutcome::JumpTaken)
        }
        0x00..=0x3D if is_alu_opcode(opcode) => match rest.first() {
            Some(&modrm) if modrm >> 6 == 0b11 => {
                let op = AluOp::from_reg_field(opcode >> 3);
                let reg = Gpr::from_index((modrm >> 3) & 0b111);
                let rm = Gpr::from_index(modrm & 0b111);
                let mut flags = ctx.registers.flags();
                if opcode % 8 == 1 {
                    let dst = ctx.registers.get(rm);
                    let src = ctx.registers.get(reg);
                    let result = apply_alu(op, &mut flags, dst, src);
                    ctx.registers.set_flags(flags);
                    if !matches!(op, AluOp::Cmp) {
                        ctx.registers.set(rm, result);
                    }
                } else {
                    let dst = ctx.registers.get(reg);
                    let src = ctx.registers.get(rm);
                    let result = apply_alu(op, &mut flags, dst, src);
                    ctx.registers.set_flags(flags);
                    if !matches!(op, AluOp::Cmp) {
                        ctx.registers.set(reg, result);
                    }
                }
                Some(StepOutcome::Continue { consumed: 2 })
            }
            _ => None,
        },
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
            // ALU EAX, imm32
            let op = AluOp::from_reg_field(opcode >> 3);
            let imm = read_u32(rest, 0)?;
            let mut flags = ctx.registers.flags();
            let result = apply_alu(op, &mut flags, ctx.registers.eax, imm);
            ctx.registers.set_flags(flags);
            if !matches!(op, AluOp::Cmp) {
                ctx.registers.eax = result;
            }
            Some(StepOutcome::Continue { consumed: 5 })
        }
        0xC1 | 0xD3 => match rest.first() {
            Some(&modrm) if modrm >> 6 == 0b11 => {
                let reg_field = (modrm >> 3) & 0b111;
                let rm = Gpr::from_index(modrm & 0b111);
                let Some(op) = shift_op_from_reg(reg_field) else {
                    return Ok(None);
                };
                let (count, extra) = if opcode == 0xC1 {
                    (*rest.get(1).unwrap_or(&0) as u32, 1)
                } else {
                    (ctx.registers.ecx & 0xFF, 0)
                };
                let mut flags = ctx.registers.flags();
                let value = ctx.registers.get(rm);
                let result = apply_shift(op, &mut flags, value, count);
                ctx.registers.set_flags(flags);
                ctx.registers.set(rm, result);
                Some(StepOutcome::Continue { consumed: 2 + extra })
            }
            _ => None,
        },
        _ => None,
    };
    Ok(outcome)
}

fn read_u32(code: &[u8], offset: usize) -> VmResult<u32> {
    read_i32(code, offset).map(|v| v as u32)
}

fn read_i32(code: &[u8], offset: usize) -> VmResult<i32> {
    let bytes = code
        .get(offset..offset + 4)
        .ok_or(crate::error::VmError::BadInput("truncated 32-bit immediate"))?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
