//! ModR/M + SIB decoding and the full fallback decoder
//! (spec.md sec. 4.5.2).

use crate::address_space::AddressSpace;
use crate::context::GuestContext;
use crate::elf::symbol::SymbolTable;
use crate::error::{VmError, VmResult};
use crate::interpreter::flags::{self, Width};
use crate::interpreter::{Prefixes, StepOutcome};
use crate::registers::{EFlags, Gpr};

/// A decoded ModR/M operand: either a register or a resolved guest
/// effective address.
#[derive(Debug, Clone, Copy)]
pub enum RmOperand {
    Register(Gpr),
    Memory(u32),
}

impl RmOperand {
    #[must_use]
    pub fn is_memory(self) -> bool {
        matches!(self, RmOperand::Memory(_))
    }

    pub fn load(self, ctx: &GuestContext, space: &AddressSpace) -> VmResult<u32> {
        match self {
            RmOperand::Register(reg) => Ok(ctx.registers.get(reg)),
            RmOperand::Memory(addr) => space.read_u32(addr),
        }
    }

    pub fn store(self, ctx: &mut GuestContext, space: &mut AddressSpace, value: u32) -> VmResult<()> {
        match self {
            RmOperand::Register(reg) => {
                ctx.registers.set(reg, value);
                Ok(())
            }
            RmOperand::Memory(addr) => space.write_u32(addr, value),
        }
    }
}

/// Decodes a ModR/M byte (and SIB/displacement if present) starting at
/// `code[0]`. Returns `(reg_field, rm_operand, bytes_consumed)`.
///
/// Effective-address arithmetic only reads register values already in
/// `ctx`; it never touches guest memory.
pub fn decode_modrm(code: &[u8], ctx: &GuestContext) -> VmResult<(u8, RmOperand, usize)> {
    let modrm = *code.first().ok_or(VmError::BadInput("truncated ModR/M"))?;
    let mode = modrm >> 6;
    let reg = (modrm >> 3) & 0b111;
    let rm = modrm & 0b111;
    let mut consumed = 1usize;

    if mode == 0b11 {
        return Ok((reg, RmOperand::Register(Gpr::from_index(rm)), consumed));
    }

    let mut base: i64 = 0;
    if rm == 0b100 {
        let sib = *code.get(consumed).ok_or(VmError::BadInput("truncated SIB"))?;
        consumed += 1;
        let scale = 1u32 << (sib >> 6);
        let index = (sib >> 3) & 0b111;
        let base_field = sib & 0b111;

        if index != 0b100 {
            base += i64::from(ctx.registers.get(Gpr::from_index(index))) * i64::from(scale);
        }
        if base_field == 0b101 && mode == 0 {
            let disp = read_i32(code, consumed)?;
            consumed += 4;
            base += i64::from(disp);
        } else {
            base += i64::from(ctx.registers.get(Gpr::from_index(base_field)));
        }
    } else if rm == 0b101 && mode == 0 {
        let disp = read_i32(code, consumed)?;
        consumed += 4;
        base = i64::from(disp);
        return Ok((reg, RmOperand::Memory(base as u32), consumed));
    } else {
        base = i64::from(ctx.registers.get(Gpr::from_index(rm)));
    }

    match mode {
        0b00 => {}
        0b01 => {
            let disp = *code.get(consumed).ok_or(VmError::BadInput("truncated disp8"))? as i8;
            consumed += 1;
            base += i64::from(disp);
        }
        0b10 => {
            let disp = read_i32(code, consumed)?;
            consumed += 4;
            base += i64::from(disp);
        }
        _ => unreachable!(),
    }

    Ok((reg, RmOperand::Memory(base as u32), consumed))
}

fn read_i32(code: &[u8], offset: usize) -> VmResult<i32> {
    let bytes = code
        .get(offset..offset + 4)
        .ok_or(VmError::BadInput("truncated 32-bit immediate/displacement"))?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u32_imm(code: &[u8], offset: usize) -> VmResult<u32> {
    read_i32(code, offset).map(|v| v as u32)
}

/// Fallback path: ModR/M-bearing instructions, GROUP 80/81/83/C1/D3/FF/F6/F7,
/// string ops, LAHF/SAHF/CLD/STD, FS-relative loads, and the x87 escape.
pub fn decode_full(
    code: &[u8],
    prefixes: &Prefixes,
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    symbols: &SymbolTable,
) -> VmResult<StepOutcome> {
    let opcode = *code.first().ok_or(VmError::BadInput("empty instruction"))?;
    let rest = &code[1..];

    match opcode {
        0x80 | 0x81 | 0x83 => group_immediate(opcode, rest, ctx, space),
        0xC1 | 0xD1 | 0xD3 => group_shift(opcode, rest, ctx, space),
        0xFF => group_ff(rest, ctx, space, symbols),
        0xF6 | 0xF7 => group_f6_f7(opcode, rest, ctx, space),
        0xA4 => Ok(string_op(ctx, space, StringOp::Movsb, prefixes.rep)?),
        0xA5 => Ok(string_op(ctx, space, StringOp::Movsd, prefixes.rep)?),
        0xAA => Ok(string_op(ctx, space, StringOp::Stosb, prefixes.rep)?),
        0xAB => Ok(string_op(ctx, space, StringOp::Stosd, prefixes.rep)?),
        0xAC => Ok(string_op(ctx, space, StringOp::Lodsb, prefixes.rep)?),
        0x9F => {
            // LAHF
            let flags: u32 = ctx.registers.flags().into();
            ctx.registers.eax = (ctx.registers.eax & 0xFFFF_00FF) | ((flags & 0xFF) << 8);
            Ok(StepOutcome::Continue { consumed: 1 })
        }
        0x9E => {
            // SAHF
            let ah = (ctx.registers.eax >> 8) & 0xFF;
            let current: u32 = ctx.registers.flags().into();
            ctx.registers.set_flags(EFlags::from((current & !0xFF) | ah));
            Ok(StepOutcome::Continue { consumed: 1 })
        }
        0xFC => {
            let mut f = ctx.registers.flags();
            f.set_df(false);
            ctx.registers.set_flags(f);
            Ok(StepOutcome::Continue { consumed: 1 })
        }
        0xFD => {
            let mut f = ctx.registers.flags();
            f.set_df(true);
            ctx.registers.set_flags(f);
            Ok(StepOutcome::Continue { consumed: 1 })
        }
        0xA1 if prefixes.segment_fs => {
            // MOV EAX, fs:moffs32 -- TLS-relative load.
            let moffs = read_u32_imm(rest, 0)?;
            let addr = prefixes.tls_base.wrapping_add(moffs);
            ctx.registers.eax = space.read_u32(addr)?;
            Ok(StepOutcome::Continue { consumed: 1 + 4 })
        }
        0x0F => decode_two_byte(rest, ctx, space),
        0xD8..=0xDF => crate::interpreter::fpu_escape::dispatch(opcode, rest, ctx, space),
        0x88 | 0x89 | 0x8A | 0x8B => mov_rm_r(opcode, rest, ctx, space),
        0x8D => lea(rest, ctx, space),
        0xC6 | 0xC7 => mov_rm_imm(opcode, rest, ctx, space),
        0x00..=0x3D if is_alu_opcode(opcode) => alu_rm_r(opcode, rest, ctx, space),
        _ => unknown_opcode(code, prefixes),
    }
}

fn decode_two_byte(
    code: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let opcode2 = *code.first().ok_or(VmError::BadInput("truncated 0F opcode"))?;
    let rest = &code[1..];
    if (0x80..=0x8F).contains(&opcode2) {
        // Jcc rel32
        let disp = read_i32(rest, 0)?;
        let instr_len = 2 + 4;
        let taken = super::condition_holds(opcode2 & 0xF, &ctx.registers.flags());
        let eip = if taken {
            (ctx.eip() as i64 + instr_len as i64 + i64::from(disp)) as u32
        } else {
            ctx.eip() + instr_len as u32
        };
        ctx.set_eip(eip);
        return Ok(StepOutcome::JumpTaken);
    }
    if opcode2 == 0xB6 || opcode2 == 0xB7 || opcode2 == 0xBE || opcode2 == 0xBF {
        let (reg, rm, consumed) = decode_modrm(rest, ctx)?;
        let raw = rm.load(ctx, space)?;
        let widened = match opcode2 {
            0xB6 => raw & 0xFF,
            0xB7 => raw & 0xFFFF,
            0xBE => (raw as i8) as i32 as u32,
            _ => (raw as i16) as i32 as u32,
        };
        ctx.registers.set(Gpr::from_index(reg), widened);
        return Ok(StepOutcome::Continue { consumed: 1 + consumed });
    }
    unknown_opcode(code, &Prefixes::default())
}

#[derive(Debug, Clone, Copy)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_reg_field(reg: u8) -> Self {
        match reg & 0b111 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }
}

/// Applies `op` to `(dst, src)`, returning the result to store (or the
/// unchanged `dst` for CMP, which only sets flags).
pub fn apply_alu(op: AluOp, flags: &mut EFlags, dst: u32, src: u32) -> u32 {
    let a = u64::from(dst);
    let b = u64::from(src);
    match op {
        AluOp::Add => flags::add(flags, a, b, 0, Width::W32) as u32,
        AluOp::Adc => flags::add(flags, a, b, u64::from(flags.cf()), Width::W32) as u32,
        AluOp::Sub => flags::sub(flags, a, b, 0, Width::W32) as u32,
        AluOp::Sbb => flags::sub(flags, a, b, u64::from(flags.cf()), Width::W32) as u32,
        AluOp::And => flags::logical(flags, a & b, Width::W32) as u32,
        AluOp::Or => flags::logical(flags, a | b, Width::W32) as u32,
        AluOp::Xor => flags::logical(flags, a ^ b, Width::W32) as u32,
        AluOp::Cmp => {
            flags::sub(flags, a, b, 0, Width::W32);
            dst
        }
    }
}

fn group_immediate(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let op = AluOp::from_reg_field(reg);
    let (imm, imm_len) = match opcode {
        0x80 => (*rest.get(modrm_len).ok_or(VmError::BadInput("truncated imm8"))? as i8 as i32 as u32, 1),
        0x83 => (*rest.get(modrm_len).ok_or(VmError::BadInput("truncated imm8"))? as i8 as i32 as u32, 1),
        _ => (read_u32_imm(rest, modrm_len)?, 4),
    };
    let dst = rm.load(ctx, space)?;
    let mut flags = ctx.registers.flags();
    let result = apply_alu(op, &mut flags, dst, imm);
    ctx.registers.set_flags(flags);
    if !matches!(op, AluOp::Cmp) {
        rm.store(ctx, space, result)?;
    }
    Ok(StepOutcome::Continue {
        consumed: 1 + modrm_len + imm_len,
    })
}

#[derive(Debug, Clone, Copy)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

pub fn shift_op_from_reg(reg: u8) -> Option<ShiftOp> {
    match reg & 0b111 {
        0 => Some(ShiftOp::Rol),
        1 => Some(ShiftOp::Ror),
        4 => Some(ShiftOp::Shl),
        5 => Some(ShiftOp::Shr),
        7 => Some(ShiftOp::Sar),
        _ => None,
    }
}

pub fn apply_shift(op: ShiftOp, flags: &mut EFlags, value: u32, count: u32) -> u32 {
    let count = count & 0x1F;
    if count == 0 {
        return value;
    }
    let (result, last_bit) = match op {
        ShiftOp::Shl => (
            value.wrapping_shl(count),
            (value.wrapping_shr(32 - count)) & 1 != 0,
        ),
        ShiftOp::Shr => (
            value.wrapping_shr(count),
            (value.wrapping_shr(count - 1)) & 1 != 0,
        ),
        ShiftOp::Sar => (
            ((value as i32).wrapping_shr(count)) as u32,
            ((value as i32).wrapping_shr(count - 1)) & 1 != 0,
        ),
        ShiftOp::Rol => (value.rotate_left(count), value.rotate_left(count) & 1 != 0),
        ShiftOp::Ror => (
            value.rotate_right(count),
            (value.rotate_right(count) >> 31) & 1 != 0,
        ),
    };
    flags.set_cf(last_bit);
    flags.set_zf(result == 0);
    flags.set_sf(result & 0x8000_0000 != 0);
    result
}

fn group_shift(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let Some(op) = shift_op_from_reg(reg) else {
        return unknown_opcode(rest, &Prefixes::default());
    };
    let (count, extra) = match opcode {
        0xC1 => (*rest.get(modrm_len).ok_or(VmError::BadInput("truncated shift imm8"))? as u32, 1),
        0xD1 => (1u32, 0),
        _ => (ctx.registers.ecx & 0xFF, 0),
    };
    let value = rm.load(ctx, space)?;
    let mut flags = ctx.registers.flags();
    let result = apply_shift(op, &mut flags, value, count);
    ctx.registers.set_flags(flags);
    rm.store(ctx, space, result)?;
    Ok(StepOutcome::Continue {
        consumed: 1 + modrm_len + extra,
    })
}

fn group_ff(
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    symbols: &SymbolTable,
) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let instr_len = 1 + modrm_len;
    match reg & 0b111 {
        0 => {
            // INC
            let value = rm.load(ctx, space)?;
            let mut flags = ctx.registers.flags();
            let result = flags::add(&mut flags, u64::from(value), 1, 0, Width::W32) as u32;
            ctx.registers.set_flags(flags);
            rm.store(ctx, space, result)?;
            Ok(StepOutcome::Continue { consumed: instr_len })
        }
        1 => {
            // DEC
            let value = rm.load(ctx, space)?;
            let mut flags = ctx.registers.flags();
            let result = flags::sub(&mut flags, u64::from(value), 1, 0, Width::W32) as u32;
            ctx.registers.set_flags(flags);
            rm.store(ctx, space, result)?;
            Ok(StepOutcome::Continue { consumed: instr_len })
        }
        2 => {
            // CALL r/m32
            let target = rm.load(ctx, space)?;
            let return_addr = ctx.eip() + instr_len as u32;
            push(ctx, space, return_addr)?;
            if symbols.is_stub(target) {
                return crate::interpreter::resume_from_stub(ctx, space);
            }
            ctx.set_eip(target);
            Ok(StepOutcome::JumpTaken)
        }
        4 => {
            // JMP r/m32
            let target = rm.load(ctx, space)?;
            if symbols.is_stub(target) {
                return crate::interpreter::resume_from_stub(ctx, space);
            }
            ctx.set_eip(target);
            Ok(StepOutcome::JumpTaken)
        }
        6 => {
            // PUSH r/m32
            let value = rm.load(ctx, space)?;
            push(ctx, space, value)?;
            Ok(StepOutcome::Continue { consumed: instr_len })
        }
        _ => unknown_opcode(rest, &Prefixes::default()),
    }
}

fn group_f6_f7(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let is_byte = opcode == 0xF6;
    match reg & 0b111 {
        0 | 1 => {
            // TEST r/m, imm
            let imm_len = if is_byte { 1 } else { 4 };
            let imm = if is_byte {
                *rest.get(modrm_len).ok_or(VmError::BadInput("truncated imm8"))? as u32
            } else {
                read_u32_imm(rest, modrm_len)?
            };
            let value = rm.load(ctx, space)?;
            let mut flags = ctx.registers.flags();
            flags::logical(&mut flags, u64::from(value) & u64::from(imm), Width::W32);
            ctx.registers.set_flags(flags);
            Ok(StepOutcome::Continue {
                consumed: 1 + modrm_len + imm_len,
            })
        }
        2 => {
            // NOT
            let value = rm.load(ctx, space)?;
            rm.store(ctx, space, !value)?;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        3 => {
            // NEG
            let value = rm.load(ctx, space)?;
            let mut flags = ctx.registers.flags();
            let result = flags::sub(&mut flags, 0, u64::from(value), 0, Width::W32) as u32;
            flags.set_cf(value != 0);
            ctx.registers.set_flags(flags);
            rm.store(ctx, space, result)?;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        4 => {
            // MUL (unsigned EAX * r/m32 -> EDX:EAX)
            let value = rm.load(ctx, space)?;
            let product = u64::from(ctx.registers.eax) * u64::from(value);
            ctx.registers.eax = product as u32;
            ctx.registers.edx = (product >> 32) as u32;
            let mut flags = ctx.registers.flags();
            let overflow = ctx.registers.edx != 0;
            flags.set_cf(overflow);
            flags.set_of(overflow);
            ctx.registers.set_flags(flags);
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        5 => {
            // IMUL (signed)
            let value = rm.load(ctx, space)? as i32;
            let product = i64::from(ctx.registers.eax as i32) * i64::from(value);
            ctx.registers.eax = product as u32;
            ctx.registers.edx = (product >> 32) as u32;
            let mut flags = ctx.registers.flags();
            let overflow = product != i64::from(product as i32);
            flags.set_cf(overflow);
            flags.set_of(overflow);
            ctx.registers.set_flags(flags);
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        6 => {
            // DIV (unsigned)
            let divisor = rm.load(ctx, space)?;
            if divisor == 0 {
                return Err(VmError::Unsupported("integer division by zero"));
            }
            let dividend = (u64::from(ctx.registers.edx) << 32) | u64::from(ctx.registers.eax);
            ctx.registers.eax = (dividend / u64::from(divisor)) as u32;
            ctx.registers.edx = (dividend % u64::from(divisor)) as u32;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        7 => {
            // IDIV (signed)
            let divisor = rm.load(ctx, space)? as i32;
            if divisor == 0 {
                return Err(VmError::Unsupported("integer division by zero"));
            }
            let full = ((u64::from(ctx.registers.edx) << 32) | u64::from(ctx.registers.eax)) as i64;
            ctx.registers.eax = (full / i64::from(divisor)) as u32;
            ctx.registers.edx = (full % i64::from(divisor)) as u32;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        _ => unreachable!(),
    }
}

#[derive(Debug, Clone, Copy)]
enum StringOp {
    Movsb,
    Movsd,
    Stosb,
    Stosd,
    Lodsb,
}

fn string_op(
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    op: StringOp,
    rep: bool,
) -> VmResult<StepOutcome> {
    let step: i32 = if ctx.registers.flags().df() { -1 } else { 1 };
    let mut iterations: u32 = if rep { ctx.registers.ecx } else { 1 };
    if rep && iterations == 0 {
        return Ok(StepOutcome::Continue { consumed: 1 });
    }
    loop {
        match op {
            StringOp::Movsb => {
                let byte = {
                    let mut buf = [0u8; 1];
                    space.read(ctx.registers.esi, &mut buf, 1)?;
                    buf[0]
                };
                space.write(ctx.registers.edi, &[byte], 1)?;
                ctx.registers.esi = (ctx.registers.esi as i64 + i64::from(step)) as u32;
                ctx.registers.edi = (ctx.registers.edi as i64 + i64::from(step)) as u32;
            }
            StringOp::Movsd => {
                let value = space.read_u32(ctx.registers.esi)?;
                space.write_u32(ctx.registers.edi, value)?;
                ctx.registers.esi = (ctx.registers.esi as i64 + i64::from(step * 4)) as u32;
                ctx.registers.edi = (ctx.registers.edi as i64 + i64::from(step * 4)) as u32;
            }
            StringOp::Stosb => {
                space.write(ctx.registers.edi, &[ctx.registers.eax as u8], 1)?;
                ctx.registers.edi = (ctx.registers.edi as i64 + i64::from(step)) as u32;
            }
            StringOp::Stosd => {
                space.write_u32(ctx.registers.edi, ctx.registers.eax)?;
                ctx.registers.edi = (ctx.registers.edi as i64 + i64::from(step * 4)) as u32;
            }
            StringOp::Lodsb => {
                let mut buf = [0u8; 1];
                space.read(ctx.registers.esi, &mut buf, 1)?;
                ctx.registers.eax = (ctx.registers.eax & 0xFFFF_FF00) | u32::from(buf[0]);
                ctx.registers.esi = (ctx.registers.esi as i64 + i64::from(step)) as u32;
            }
        }
        if rep {
            ctx.registers.ecx -= 1;
            iterations -= 1;
            if iterations == 0 {
                break;
            }
        } else {
            break;
        }
    }
    Ok(StepOutcome::Continue { consumed: 1 })
}

/// Pushes `value`, decrementing ESP first.
pub fn push(ctx: &mut GuestContext, space: &mut AddressSpace, value: u32) -> VmResult<()> {
    ctx.registers.esp = ctx.registers.esp.wrapping_sub(4);
    space.write_u32(ctx.registers.esp, value)
}

/// Pops the top-of-stack word, incrementing ESP after.
pub fn pop(ctx: &mut GuestContext, space: &AddressSpace) -> VmResult<u32> {
    let value = space.read_u32(ctx.registers.esp)?;
    ctx.registers.esp = ctx.registers.esp.wrapping_add(4);
    Ok(value)
}

/// `MOV` between a register/memory operand and a general register, in
/// both the 8-bit (`88`/`8A`) and 32-bit (`89`/`8B`) forms. The 8-bit
/// forms only touch the register's low byte, matching the AL/CL/... view
/// real encodings address.
fn mov_rm_r(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let reg = Gpr::from_index(reg);
    match opcode {
        0x89 => rm.store(ctx, space, ctx.registers.get(reg))?,
        0x8B => {
            let value = rm.load(ctx, space)?;
            ctx.registers.set(reg, value);
        }
        0x88 => {
            let value = (ctx.registers.get(reg) & 0xFF) as u8;
            store_byte(rm, ctx, space, value)?;
        }
        0x8A => {
            let value = load_byte(rm, ctx, space)?;
            let current = ctx.registers.get(reg);
            ctx.registers.set(reg, (current & 0xFFFF_FF00) | u32::from(value));
        }
        _ => unreachable!(),
    }
    Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
}

fn load_byte(rm: RmOperand, ctx: &GuestContext, space: &AddressSpace) -> VmResult<u8> {
    match rm {
        RmOperand::Register(reg) => Ok((ctx.registers.get(reg) & 0xFF) as u8),
        RmOperand::Memory(addr) => {
            let mut buf = [0u8; 1];
            space.read(addr, &mut buf, 1)?;
            Ok(buf[0])
        }
    }
}

fn store_byte(
    rm: RmOperand,
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
    value: u8,
) -> VmResult<()> {
    match rm {
        RmOperand::Register(reg) => {
            let current = ctx.registers.get(reg);
            ctx.registers.set(reg, (current & 0xFFFF_FF00) | u32::from(value));
            Ok(())
        }
        RmOperand::Memory(addr) => space.write(addr, &[value], 1),
    }
}

/// `LEA r32, m` -- loads the effective address itself rather than the
/// value stored there. A register-form ModR/M has no effective address,
/// so it falls back to the unknown-opcode recovery path.
fn lea(rest: &[u8], ctx: &mut GuestContext, space: &mut AddressSpace) -> VmResult<StepOutcome> {
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    match rm {
        RmOperand::Memory(addr) => {
            ctx.registers.set(Gpr::from_index(reg), addr);
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
        }
        RmOperand::Register(_) => {
            let _ = space;
            unknown_opcode(rest, &Prefixes::default())
        }
    }
}

/// `MOV r/m8, imm8` (`C6`) and `MOV r/m32, imm32` (`C7`). The reg field
/// of the ModR/M byte is a fixed `/0` extension, not an operand.
fn mov_rm_imm(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let (_reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    match opcode {
        0xC7 => {
            let imm = read_u32_imm(rest, modrm_len)?;
            rm.store(ctx, space, imm)?;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len + 4 })
        }
        0xC6 => {
            let imm = *rest
                .get(modrm_len)
                .ok_or(VmError::BadInput("truncated imm8"))?;
            store_byte(rm, ctx, space, imm)?;
            Ok(StepOutcome::Continue { consumed: 1 + modrm_len + 1 })
        }
        _ => unreachable!(),
    }
}

/// True for the four ModR/M-bearing `r/m <-> r32` forms of the eight ALU
/// groups (`+1`/`+3` of each group's base opcode). The `+0`/`+2` byte
/// forms and the `+4`/`+5` AL/eAX-immediate forms are out of scope here;
/// the fast executor's register-only immediate forms cover the latter.
pub fn is_alu_opcode(opcode: u8) -> bool {
    opcode < 0x40 && matches!(opcode % 8, 1 | 3)
}

/// `ALU r/m32, r32` and `ALU r32, r/m32`, direction chosen by the
/// opcode's low bits.
fn alu_rm_r(
    opcode: u8,
    rest: &[u8],
    ctx: &mut GuestContext,
    space: &mut AddressSpace,
) -> VmResult<StepOutcome> {
    let op = AluOp::from_reg_field(opcode >> 3);
    let (reg, rm, modrm_len) = decode_modrm(rest, ctx)?;
    let reg = Gpr::from_index(reg);
    let mut flags = ctx.registers.flags();
    if opcode % 8 == 1 {
        let dst = rm.load(ctx, space)?;
        let src = ctx.registers.get(reg);
        let result = apply_alu(op, &mut flags, dst, src);
        ctx.registers.set_flags(flags);
        if !matches!(op, AluOp::Cmp) {
            rm.store(ctx, space, result)?;
        }
    } else {
        let dst = ctx.registers.get(reg);
        let src = rm.load(ctx, space)?;
        let result = apply_alu(op, &mut flags, dst, src);
        ctx.registers.set_flags(flags);
        if !matches!(op, AluOp::Cmp) {
            ctx.registers.set(reg, result);
        }
    }
    Ok(StepOutcome::Continue { consumed: 1 + modrm_len })
}

/// Best-effort recovery for an opcode this decoder does not implement
/// (spec.md sec. 4.5.2's two-tier unknown-opcode policy).
pub fn unknown_opcode(code: &[u8], prefixes: &Prefixes) -> VmResult<StepOutcome> {
    if prefixes.strict_mode {
        return Err(VmError::Unsupported("unknown opcode in strict mode"));
    }
    let opcode = code.first().copied().unwrap_or(0);
    log::warn!("skipping unsupported opcode {opcode:#04x} with a best-effort length estimate");
    // conservative estimate: opcode + a presumed ModR/M byte, matching the
    // majority of the encodings this decoder does understand.
    Ok(StepOutcome::Continue {
        consumed: code.len().min(2).max(1),
    })
}
