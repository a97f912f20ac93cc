//! The register state handed over by whoever caught the fault.

use bitflags::bitflags;

use crate::primitive::Primitive;

/// Processor mode of the faulting thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// 64-bit long mode
    Long,
    /// 32-bit protected / compatibility mode
    Protected,
}

impl Mode {
    #[inline]
    pub const fn bitness(self) -> u32 {
        match self {
            Mode::Long => 64,
            Mode::Protected => 32,
        }
    }

    #[inline]
    pub const fn is_long(self) -> bool {
        matches!(self, Mode::Long)
    }

    /// truncate an address to what the mode can express
    #[inline]
    pub const fn wrap(self, addr: u64) -> u64 {
        match self {
            Mode::Long => addr,
            Mode::Protected => addr as u32 as u64,
        }
    }
}

/// General purpose registers, in the order the hardware encodes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    /// general purpose register
    RAX,
    /// general purpose register
    RCX,
    /// general purpose register
    RDX,
    /// general purpose register
    RBX,
    /// general purpose register
    /// stack pointer
    RSP,
    /// general purpose register
    /// frame pointer
    RBP,
    /// general purpose register
    RSI,
    /// general purpose register
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Register {
    const ALL: [Register; 16] = [
        Register::RAX,
        Register::RCX,
        Register::RDX,
        Register::RBX,
        Register::RSP,
        Register::RBP,
        Register::RSI,
        Register::RDI,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// register for a 4 bit encoding, the high bit is ignored past 15
    #[inline]
    pub const fn from_index(index: u8) -> Self {
        Self::ALL[(index & 0xf) as usize]
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// The arithmetic part of RFLAGS.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Flags: u64 {
        /// carry
        const CF = 1 << 0;
        /// parity of the low result byte
        const PF = 1 << 2;
        /// auxiliary carry
        const AF = 1 << 4;
        /// zero
        const ZF = 1 << 6;
        /// sign
        const SF = 1 << 7;
        /// overflow
        const OF = 1 << 11;
    }
}

/// A set of flags to overwrite and the values to overwrite them with.
///
/// Bits outside of `mask` keep whatever the snapshot already had.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
    pub mask: Flags,
    pub value: Flags,
}

impl FlagUpdate {
    #[inline]
    pub const fn new(mask: Flags) -> Self {
        Self {
            mask,
            value: Flags::empty(),
        }
    }

    #[inline]
    pub fn with(mut self, flag: Flags, set: bool) -> Self {
        debug_assert!(self.mask.contains(flag));
        self.value.set(flag, set);
        self
    }

    #[inline]
    pub fn apply(self, rflags: u64) -> u64 {
        (rflags & !self.mask.bits()) | (self.value & self.mask).bits()
    }
}

/// Register state of the faulting thread for the duration of one emulation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegSnapshot {
    pub gprs: [u64; 16],
    /// the full RFLAGS register, only the arithmetic flags are ever touched
    pub rflags: u64,
    /// the address of the faulting instruction
    pub rip: u64,
    pub xmm: [u128; 16],
}

impl RegSnapshot {
    pub fn new(rip: u64) -> Self {
        Self {
            rip,
            // bit 1 of RFLAGS always reads as one
            rflags: 1 << 1,
            ..Default::default()
        }
    }

    /// read the low `BYTES` bytes of a general purpose register
    #[inline]
    pub fn get_reg<T: Primitive<BYTES>, const BYTES: usize>(&self, register: Register) -> T {
        T::from_u128(self.gprs[register.index()] as u128)
    }

    /// write a general purpose register
    ///
    /// the value is zero extended to 64 bits, which gives 32 bit writes
    /// their long mode semantics of clearing the upper half
    #[inline]
    pub fn set_reg<T: Primitive<BYTES>, const BYTES: usize>(&mut self, val: T, register: Register) {
        self.gprs[register.index()] = val.to_u128() as u64;
    }

    #[inline]
    pub fn get_xmm(&self, index: u8) -> u128 {
        self.xmm[(index & 0xf) as usize]
    }

    #[inline]
    pub fn set_xmm(&mut self, index: u8, val: u128) {
        self.xmm[(index & 0xf) as usize] = val;
    }

    #[inline]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.rflags)
    }

    #[inline]
    pub fn update_flags(&mut self, update: FlagUpdate) {
        self.rflags = update.apply(self.rflags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_writes_zero_extend() {
        let mut regs = RegSnapshot::new(0);
        regs.gprs[Register::RBX.index()] = u64::MAX;
        regs.set_reg::<u32, 4>(0x1234, Register::RBX);
        assert_eq!(regs.gprs[Register::RBX.index()], 0x1234);
        assert_eq!(regs.get_reg::<u32, 4>(Register::RBX), 0x1234);
    }

    #[test]
    fn narrow_reads_truncate() {
        let mut regs = RegSnapshot::new(0);
        regs.set_reg::<u64, 8>(0xdead_beef_0000_0001, Register::R9);
        assert_eq!(regs.get_reg::<u32, 4>(Register::R9), 1);
        assert_eq!(Register::from_index(9), Register::R9);
    }

    #[test]
    fn flag_updates_leave_other_bits() {
        let mut regs = RegSnapshot::new(0);
        regs.rflags |= Flags::PF.bits() | Flags::CF.bits() | (1 << 9);
        regs.update_flags(
            FlagUpdate::new(Flags::CF | Flags::ZF)
                .with(Flags::CF, false)
                .with(Flags::ZF, true),
        );
        assert_eq!(regs.flags(), Flags::PF | Flags::ZF);
        assert_eq!(regs.rflags & (1 << 9), 1 << 9);
        assert_eq!(regs.rflags & (1 << 1), 1 << 1);
    }
}
