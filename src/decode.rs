//! Decoding of the instruction forms we emulate.
//!
//! Only two shapes of instruction are understood: a VEX prefix (two or three
//! bytes) followed by opcode and ModRM, and the legacy SSE4.2 form
//! `66 [REX] 0F 3A op ModRM`. Everything else is rejected early so the
//! original fault gets delivered.

use crate::error::DecodeError;
use crate::mmu::Virtaddr;
use crate::primitive::Bitness;
use crate::regs::{Mode, RegSnapshot, Register};

type Result<T> = std::result::Result<T, DecodeError>;

/// The longest instruction the architecture allows.
pub const MAX_INSN_LEN: usize = 15;

const VEX3: u8 = 0xc4;
const VEX2: u8 = 0xc5;
const ESCAPE: u8 = 0x0f;
const ESCAPE_38: u8 = 0x38;
const ESCAPE_3A: u8 = 0x3a;

/// A cursor over the bytes at the faulting instruction pointer.
#[derive(Clone, Copy, Debug)]
pub struct InsnBytes<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> InsnBytes<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        let bytes = &bytes[..bytes.len().min(MAX_INSN_LEN)];
        Self { bytes, pos: 0 }
    }

    #[inline]
    pub fn peek(&self) -> Result<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::ExhaustedInput)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    pub fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        for b in buf.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(buf)
    }

    /// number of bytes consumed so far
    #[inline]
    pub fn processed(&self) -> usize {
        self.pos
    }
}

/// Leading opcode map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpcodeMap {
    Map0F,
    Map0F38,
    Map0F3A,
}

/// SIMD prefix, carried in VEX.pp or as a legacy prefix byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimdPrefix {
    None,
    Prefix66,
    PrefixF3,
    PrefixF2,
}

impl SimdPrefix {
    #[inline]
    fn from_pp(pp: u8) -> Self {
        match pp & 0x3 {
            0 => SimdPrefix::None,
            1 => SimdPrefix::Prefix66,
            2 => SimdPrefix::PrefixF3,
            _ => SimdPrefix::PrefixF2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// legacy prefixes and 0F escapes
    Legacy,
    /// C5 xx
    Vex2,
    /// C4 xx xx
    Vex3,
}

impl Encoding {
    #[inline]
    pub fn is_vex(self) -> bool {
        !matches!(self, Encoding::Legacy)
    }
}

/// Everything the prefix bytes tell us about the instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefixContext {
    pub encoding: Encoding,
    pub map: OpcodeMap,
    pub simd: SimdPrefix,
    /// 64 with VEX.W / REX.W in long mode, 32 otherwise
    pub operand_size: Bitness,
    /// VEX.W or REX.W as seen by the instruction (always clear outside long mode)
    pub w: bool,
    /// VEX.L
    pub l: bool,
    /// VEX.vvvv, already un-inverted, zero for legacy encodings
    pub vvvv: u8,
    /// extends ModRM.reg
    pub high_reg: bool,
    /// extends SIB.index
    pub high_index: bool,
    /// extends ModRM.rm and SIB.base
    pub high_base: bool,
    /// prefix and escape bytes, everything before the opcode
    pub len: usize,
}

/// Decode everything in front of the opcode byte.
pub fn decode_prefix(insn: &mut InsnBytes, mode: Mode) -> Result<PrefixContext> {
    match insn.peek()? {
        VEX3 | VEX2 => decode_vex(insn, mode),
        _ => decode_legacy(insn, mode),
    }
}

fn decode_vex(insn: &mut InsnBytes, mode: Mode) -> Result<PrefixContext> {
    let kind = insn.read_u8()?;
    let byte1 = insn.peek()?;
    // outside of long mode C4 and C5 are LES and LDS unless the following
    // byte would be a register form ModRM
    if !mode.is_long() && byte1 & 0xc0 != 0xc0 {
        return Err(DecodeError::NotHandled);
    }
    insn.read_u8()?;

    // R, X, B and vvvv are stored inverted
    let (r, x, b, map, byte2) = if kind == VEX3 {
        let map = match byte1 & 0x1f {
            1 => OpcodeMap::Map0F,
            2 => OpcodeMap::Map0F38,
            3 => OpcodeMap::Map0F3A,
            m => return Err(DecodeError::InvalidMap(m)),
        };
        let byte2 = insn.read_u8()?;
        (
            byte1 & 0x80 == 0,
            byte1 & 0x40 == 0,
            byte1 & 0x20 == 0,
            map,
            byte2,
        )
    } else {
        // two byte form implies 0F, X and B clear and W0; the low seven
        // bits of its payload line up with the third byte of the long form
        (byte1 & 0x80 == 0, false, false, OpcodeMap::Map0F, byte1 & 0x7f)
    };

    let long = mode.is_long();
    let w = long && byte2 & 0x80 != 0;
    let mut vvvv = !(byte2 >> 3) & 0xf;
    if !long {
        vvvv &= 0x7;
    }

    Ok(PrefixContext {
        encoding: if kind == VEX3 {
            Encoding::Vex3
        } else {
            Encoding::Vex2
        },
        map,
        simd: SimdPrefix::from_pp(byte2),
        operand_size: if w {
            Bitness::SixtyFour
        } else {
            Bitness::ThirtyTwo
        },
        w,
        l: byte2 & 0x04 != 0,
        vvvv,
        high_reg: long && r,
        high_index: long && x,
        high_base: long && b,
        len: insn.processed(),
    })
}

fn decode_legacy(insn: &mut InsnBytes, mode: Mode) -> Result<PrefixContext> {
    let mut simd = SimdPrefix::None;
    loop {
        match insn.peek()? {
            0x66 => {
                // F2 and F3 take precedence as the mandatory prefix
                if simd == SimdPrefix::None {
                    simd = SimdPrefix::Prefix66;
                }
            }
            0xf3 => simd = SimdPrefix::PrefixF3,
            0xf2 => simd = SimdPrefix::PrefixF2,
            _ => break,
        }
        insn.read_u8()?;
    }

    let mut rex = 0u8;
    if mode.is_long() && insn.peek()? & 0xf0 == 0x40 {
        rex = insn.read_u8()?;
    }

    if insn.read_u8()? != ESCAPE {
        return Err(DecodeError::NotHandled);
    }
    let map = match insn.read_u8()? {
        ESCAPE_38 => OpcodeMap::Map0F38,
        ESCAPE_3A => OpcodeMap::Map0F3A,
        _ => return Err(DecodeError::NotHandled),
    };

    let w = rex & 0x8 != 0;
    Ok(PrefixContext {
        encoding: Encoding::Legacy,
        map,
        simd,
        operand_size: if w {
            Bitness::SixtyFour
        } else {
            Bitness::ThirtyTwo
        },
        w,
        l: false,
        vvvv: 0,
        high_reg: rex & 0x4 != 0,
        high_index: rex & 0x2 != 0,
        high_base: rex & 0x1 != 0,
        len: insn.processed(),
    })
}

const MOD_INDIRECT: u8 = 0;
const MOD_INDIRECT_DISP8: u8 = 1;
const MOD_INDIRECT_DISP32: u8 = 2;
const RM_SIB: u8 = 4;
const RM_DISP32: u8 = 5;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mod {
    Indirect,
    IndirectDisp8,
    IndirectDisp32,
    Direct,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct ModRM(pub u8);

impl ModRM {
    #[inline]
    pub fn get_mod(&self) -> Mod {
        match self.0 >> 6 {
            MOD_INDIRECT => Mod::Indirect,
            MOD_INDIRECT_DISP8 => Mod::IndirectDisp8,
            MOD_INDIRECT_DISP32 => Mod::IndirectDisp32,
            _ => Mod::Direct,
        }
    }

    /// the raw three bit reg field, which doubles as an opcode extension
    #[inline]
    pub fn get_reg(&self) -> u8 {
        (self.0 >> 3) & 0x7
    }

    #[inline]
    pub fn get_rm(&self) -> u8 {
        self.0 & 0x7
    }
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
struct Sib(u8);

impl Sib {
    #[inline]
    fn get_scale(&self) -> u8 {
        1 << (self.0 >> 6)
    }

    #[inline]
    fn get_index(&self) -> u8 {
        (self.0 >> 3) & 0x7
    }

    #[inline]
    fn get_base(&self) -> u8 {
        self.0 & 0x7
    }
}

/// A memory operand, still waiting for register values to become an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub disp: i32,
    /// relative to the address of the next instruction
    pub rip_relative: bool,
}

impl MemOperand {
    /// resolve the address an instruction uses
    ///
    /// `next_ip` is the address right behind the instruction
    pub fn effective_address(&self, regs: &RegSnapshot, mode: Mode, next_ip: u64) -> Virtaddr {
        let mut addr = self.disp as i64 as u64;
        if self.rip_relative {
            addr = addr.wrapping_add(next_ip);
        }
        if let Some(base) = self.base {
            addr = addr.wrapping_add(regs.get_reg::<u64, 8>(base));
        }
        if let Some(index) = self.index {
            addr = addr.wrapping_add(regs.get_reg::<u64, 8>(index).wrapping_mul(self.scale as u64));
        }
        Virtaddr(mode.wrap(addr))
    }
}

/// What ModRM.rm selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmOperand {
    /// register number, already extended to four bits
    Reg(u8),
    Mem(MemOperand),
}

/// Decode ModRM and whatever SIB and displacement bytes it calls for.
pub fn decode_modrm(
    insn: &mut InsnBytes,
    prefix: &PrefixContext,
    mode: Mode,
) -> Result<(ModRM, RmOperand)> {
    let modrm = ModRM(insn.read_u8()?);
    let rm = modrm.get_rm() | ((prefix.high_base as u8) << 3);

    let r#mod = modrm.get_mod();
    if r#mod == Mod::Direct {
        return Ok((modrm, RmOperand::Reg(rm)));
    }

    let mut mem = MemOperand {
        base: None,
        index: None,
        scale: 1,
        disp: 0,
        rip_relative: false,
    };

    // SDM Vol2 Table 2-5: Special Cases of REX Encodings
    // the extension bit is a don't care for both of these
    let mut disp32 = false;
    match modrm.get_rm() {
        RM_SIB => {
            let sib = Sib(insn.read_u8()?);
            let index = sib.get_index() | ((prefix.high_index as u8) << 3);
            // index 100 without the extension bit means no index
            if index != RM_SIB {
                mem.index = Some(Register::from_index(index));
                mem.scale = sib.get_scale();
            }
            if r#mod == Mod::Indirect && sib.get_base() == RM_DISP32 {
                disp32 = true;
            } else {
                mem.base = Some(Register::from_index(
                    sib.get_base() | ((prefix.high_base as u8) << 3),
                ));
            }
        }
        RM_DISP32 if r#mod == Mod::Indirect => {
            // SDM Vol2 Table 2-7: RIP-Relative Addressing
            // in compatibility mode this is a plain disp32
            disp32 = true;
            mem.rip_relative = mode.is_long();
        }
        _ => mem.base = Some(Register::from_index(rm)),
    }

    mem.disp = match r#mod {
        Mod::IndirectDisp8 => insn.read_u8()? as i8 as i32,
        Mod::IndirectDisp32 => i32::from_le_bytes(insn.take()?),
        _ if disp32 => i32::from_le_bytes(insn.take()?),
        _ => 0,
    };

    Ok((modrm, RmOperand::Mem(mem)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(bytes: &[u8], mode: Mode) -> Result<PrefixContext> {
        decode_prefix(&mut InsnBytes::new(bytes), mode)
    }

    #[test]
    fn vex3_fields() {
        // andn rcx, rbx, rax
        let ctx = prefix(&[0xc4, 0xe2, 0xe0, 0xf2, 0xc8], Mode::Long).unwrap();
        assert_eq!(ctx.encoding, Encoding::Vex3);
        assert_eq!(ctx.map, OpcodeMap::Map0F38);
        assert_eq!(ctx.simd, SimdPrefix::None);
        assert_eq!(ctx.operand_size, Bitness::SixtyFour);
        assert_eq!(ctx.vvvv, Register::RBX as u8);
        assert!(!ctx.l);
        assert!(!ctx.high_reg && !ctx.high_index && !ctx.high_base);
        assert_eq!(ctx.len, 3);
    }

    #[test]
    fn vex3_high_bits_and_vvvv() {
        // andn r9, r15, r10: R=1 X=0 B=1, vvvv=15
        let ctx = prefix(&[0xc4, 0x42, 0x80, 0xf2, 0xca], Mode::Long).unwrap();
        assert!(ctx.high_reg);
        assert!(!ctx.high_index);
        assert!(ctx.high_base);
        assert_eq!(ctx.vvvv, 15);
    }

    #[test]
    fn vex2_is_map_0f() {
        let ctx = prefix(&[0xc5, 0xf9, 0x6f, 0xc1], Mode::Long).unwrap();
        assert_eq!(ctx.encoding, Encoding::Vex2);
        assert_eq!(ctx.map, OpcodeMap::Map0F);
        assert_eq!(ctx.simd, SimdPrefix::Prefix66);
        assert_eq!(ctx.len, 2);
    }

    #[test]
    fn protected_mode_ignores_extensions() {
        // inverted R/X/B clear means LES in 32 bit mode
        let ctx = prefix(&[0xc4, 0x02, 0xe0, 0xf2, 0xc8], Mode::Long).unwrap();
        assert!(ctx.high_reg);
        let err = prefix(&[0xc4, 0x02, 0xe0, 0xf2, 0xc8], Mode::Protected).unwrap_err();
        assert_eq!(err, DecodeError::NotHandled);

        let ctx = prefix(&[0xc4, 0xe2, 0xe0, 0xf2, 0xc8], Mode::Protected).unwrap();
        assert_eq!(ctx.operand_size, Bitness::ThirtyTwo);
        assert!(!ctx.w);
        assert_eq!(ctx.vvvv, 3);
    }

    #[test]
    fn invalid_vex_map() {
        assert_eq!(
            prefix(&[0xc4, 0xe7, 0x78, 0xf2, 0xc8], Mode::Long),
            Err(DecodeError::InvalidMap(7))
        );
    }

    #[test]
    fn legacy_sse42() {
        // pcmpistri xmm1, xmm2, 0x0c
        let ctx = prefix(&[0x66, 0x0f, 0x3a, 0x63, 0xca, 0x0c], Mode::Long).unwrap();
        assert_eq!(ctx.encoding, Encoding::Legacy);
        assert_eq!(ctx.map, OpcodeMap::Map0F3A);
        assert_eq!(ctx.simd, SimdPrefix::Prefix66);
        assert_eq!(ctx.len, 3);

        // with REX.WRB
        let ctx = prefix(&[0x66, 0x4d, 0x0f, 0x3a, 0x61, 0xca, 0x0c], Mode::Long).unwrap();
        assert!(ctx.w && ctx.high_reg && ctx.high_base && !ctx.high_index);
        assert_eq!(ctx.len, 4);
    }

    #[test]
    fn legacy_other_opcodes_are_not_ours() {
        assert_eq!(
            prefix(&[0x48, 0x89, 0xc8], Mode::Long),
            Err(DecodeError::NotHandled)
        );
        assert_eq!(
            prefix(&[0x0f, 0x0b], Mode::Long),
            Err(DecodeError::NotHandled)
        );
        assert_eq!(prefix(&[0x66, 0x0f], Mode::Long), Err(DecodeError::ExhaustedInput));
    }

    fn modrm(bytes: &[u8], mode: Mode) -> (RmOperand, usize) {
        let mut insn = InsnBytes::new(bytes);
        let ctx = decode_prefix(&mut insn, mode).unwrap();
        insn.read_u8().unwrap();
        let (_, rm) = decode_modrm(&mut insn, &ctx, mode).unwrap();
        (rm, insn.processed())
    }

    #[test]
    fn register_direct() {
        let (rm, len) = modrm(&[0xc4, 0xc2, 0xe0, 0xf2, 0xc8], Mode::Long);
        assert_eq!(rm, RmOperand::Reg(8));
        assert_eq!(len, 5);
    }

    #[test]
    fn base_plus_disp8() {
        // andn rcx, rbx, [rsi-8]
        let (rm, len) = modrm(&[0xc4, 0xe2, 0xe0, 0xf2, 0x4e, 0xf8], Mode::Long);
        assert_eq!(
            rm,
            RmOperand::Mem(MemOperand {
                base: Some(Register::RSI),
                index: None,
                scale: 1,
                disp: -8,
                rip_relative: false,
            })
        );
        assert_eq!(len, 6);
    }

    #[test]
    fn sib_with_extended_index() {
        // andn rcx, rbx, [rax+r12*4+0x100]: X=1
        let (rm, len) = modrm(
            &[0xc4, 0xa2, 0xe0, 0xf2, 0x8c, 0xa0, 0x00, 0x01, 0x00, 0x00],
            Mode::Long,
        );
        assert_eq!(
            rm,
            RmOperand::Mem(MemOperand {
                base: Some(Register::RAX),
                index: Some(Register::R12),
                scale: 4,
                disp: 0x100,
                rip_relative: false,
            })
        );
        assert_eq!(len, 10);
    }

    #[test]
    fn sib_without_base_or_index() {
        // andn rcx, rbx, [0x1000]
        let (rm, len) = modrm(
            &[0xc4, 0xe2, 0xe0, 0xf2, 0x0c, 0x25, 0x00, 0x10, 0x00, 0x00],
            Mode::Long,
        );
        assert_eq!(
            rm,
            RmOperand::Mem(MemOperand {
                base: None,
                index: None,
                scale: 1,
                disp: 0x1000,
                rip_relative: false,
            })
        );
        assert_eq!(len, 10);
    }

    #[test]
    fn rip_relative_only_in_long_mode() {
        let bytes = [0xc4, 0xe2, 0x60, 0xf2, 0x0d, 0x10, 0x00, 0x00, 0x00];
        let (rm, len) = modrm(&bytes, Mode::Long);
        let RmOperand::Mem(mem) = rm else {
            panic!("expected a memory operand")
        };
        assert!(mem.rip_relative);
        assert_eq!(len, 9);

        let regs = RegSnapshot::new(0x4000);
        assert_eq!(
            mem.effective_address(&regs, Mode::Long, 0x4000 + len as u64),
            Virtaddr(0x4019)
        );

        let (rm, _) = modrm(&bytes, Mode::Protected);
        let RmOperand::Mem(mem) = rm else {
            panic!("expected a memory operand")
        };
        assert!(!mem.rip_relative);
        assert_eq!(mem.effective_address(&regs, Mode::Protected, 0x4009), Virtaddr(0x10));
    }

    #[test]
    fn protected_mode_addresses_wrap() {
        let mut regs = RegSnapshot::new(0);
        regs.set_reg::<u64, 8>(0xffff_fff0, Register::RSI);
        let mem = MemOperand {
            base: Some(Register::RSI),
            index: None,
            scale: 1,
            disp: 0x20,
            rip_relative: false,
        };
        assert_eq!(mem.effective_address(&regs, Mode::Protected, 0), Virtaddr(0x10));
        assert_eq!(mem.effective_address(&regs, Mode::Long, 0), Virtaddr(0x1_0000_0010));
    }

    #[test]
    fn truncated_input() {
        let mut insn = InsnBytes::new(&[0xc4, 0xe2, 0xe0, 0xf2, 0x8c, 0xa0, 0x00]);
        let ctx = decode_prefix(&mut insn, Mode::Long).unwrap();
        insn.read_u8().unwrap();
        assert_eq!(
            decode_modrm(&mut insn, &ctx, Mode::Long),
            Err(DecodeError::ExhaustedInput)
        );
    }
}
