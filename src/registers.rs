//! The integer register file (spec.md sec. 3).

use bitfield_struct::bitfield;

/// The x86-32 EFLAGS register, as a typed view over the raw 32-bit value
/// (same idiom the teacher uses for hardware bitfields: a
/// `#[bitfield_struct::bitfield]` struct instead of hand-written
/// shift/mask pairs).
#[bitfield(u32)]
pub struct EFlags {
    pub cf: bool,
    #[bits(1)]
    __reserved1: u8,
    pub pf: bool,
    #[bits(1)]
    __reserved3: u8,
    pub af: bool,
    #[bits(1)]
    __reserved5: u8,
    pub zf: bool,
    pub sf: bool,
    pub tf: bool,
    pub intf: bool,
    pub df: bool,
    pub of: bool,
    #[bits(20)]
    __reserved18: u32,
}

/// The eight general-purpose registers plus EIP and EFLAGS.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
}

/// Index of a GPR, matching the x86 ModR/M register-field encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    #[must_use]
    pub fn from_index(index: u8) -> Self {
        match index & 0b111 {
            0 => Gpr::Eax,
            1 => Gpr::Ecx,
            2 => Gpr::Edx,
            3 => Gpr::Ebx,
            4 => Gpr::Esp,
            5 => Gpr::Ebp,
            6 => Gpr::Esi,
            _ => Gpr::Edi,
        }
    }
}

impl Registers {
    #[must_use]
    pub fn get(&self, reg: Gpr) -> u32 {
        match reg {
            Gpr::Eax => self.eax,
            Gpr::Ecx => self.ecx,
            Gpr::Edx => self.edx,
            Gpr::Ebx => self.ebx,
            Gpr::Esp => self.esp,
            Gpr::Ebp => self.ebp,
            Gpr::Esi => self.esi,
            Gpr::Edi => self.edi,
        }
    }

    pub fn set(&mut self, reg: Gpr, value: u32) {
        match reg {
            Gpr::Eax => self.eax = value,
            Gpr::Ecx => self.ecx = value,
            Gpr::Edx => self.edx = value,
            Gpr::Ebx => self.ebx = value,
            Gpr::Esp => self.esp = value,
            Gpr::Ebp => self.ebp = value,
            Gpr::Esi => self.esi = value,
            Gpr::Edi => self.edi = value,
        }
    }

    #[must_use]
    pub fn flags(&self) -> EFlags {
        EFlags::from(self.eflags)
    }

    pub fn set_flags(&mut self, flags: EFlags) {
        self.eflags = flags.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_round_trips_through_index() {
        for i in 0..8u8 {
            let reg = Gpr::from_index(i);
            assert_eq!(reg as u8, i);
        }
    }

    #[test]
    fn eflags_bits_are_independent() {
        let mut flags = EFlags::new().with_zf(true).with_cf(true);
        assert!(flags.zf());
        assert!(flags.cf());
        assert!(!flags.sf());
        flags.set_zf(false);
        assert!(!flags.zf());
        assert!(flags.cf());
    }
}
