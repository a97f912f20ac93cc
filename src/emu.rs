//! Dispatch and execution of one trapped instruction.
//!
//! [`Emulator::decode`] turns bytes into a [`DecodedInsn`] by way of the
//! prefix and ModRM decoders and a single static opcode table.
//! [`Emulator::execute`] reads the operands, runs the BMI or PCMPSTR
//! semantics, and collects every result in a [`Writeback`] that is only
//! committed to the snapshot once nothing can fail anymore.

use crate::bmi;
use crate::config::{Config, Extensions};
use crate::decode::{self, InsnBytes, MemOperand, ModRM, OpcodeMap, PrefixContext, RmOperand, SimdPrefix};
use crate::error::{DecodeError, EmulateError, Result};
use crate::mmu::{Memory, Virtaddr};
use crate::pcmpstr::{self, Control, Lengths};
use crate::primitive::{Bitness, Primitive, Word};
use crate::regs::{FlagUpdate, Mode, RegSnapshot, Register};

/// General purpose instructions from BMI1 and BMI2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BmiOp {
    Andn,
    Blsr,
    Blsmsk,
    Blsi,
    Bzhi,
    Pext,
    Pdep,
    Mulx,
    Bextr,
    Shlx,
    Sarx,
    Shrx,
    Rorx,
}

/// The four packed string compares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcmpOp {
    Pcmpestrm,
    Pcmpestri,
    Pcmpistrm,
    Pcmpistri,
}

impl PcmpOp {
    /// lengths come from rAX and rDX instead of terminating zeros
    #[inline]
    fn explicit_lengths(self) -> bool {
        matches!(self, PcmpOp::Pcmpestrm | PcmpOp::Pcmpestri)
    }

    /// result is an index in ECX rather than a mask in XMM0
    #[inline]
    fn index_output(self) -> bool {
        matches!(self, PcmpOp::Pcmpestri | PcmpOp::Pcmpistri)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Bmi(BmiOp),
    Pcmpstr(PcmpOp),
}

/// Which encodings an opcode exists in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Form {
    VexOnly,
    VexOrLegacy,
}

#[derive(Clone, Copy, Debug)]
struct OpEntry {
    map: OpcodeMap,
    simd: SimdPrefix,
    opcode: u8,
    /// ModRM.reg, for opcodes that use it as an extension
    reg: Option<u8>,
    op: Op,
    imm8: bool,
    /// VEX.vvvv has to be 1111
    no_vvvv: bool,
    form: Form,
    extension: Extensions,
}

impl OpEntry {
    const fn vex(map: OpcodeMap, simd: SimdPrefix, opcode: u8, op: Op, extension: Extensions) -> Self {
        Self {
            map,
            simd,
            opcode,
            reg: None,
            op,
            imm8: false,
            no_vvvv: false,
            form: Form::VexOnly,
            extension,
        }
    }

    const fn group(mut self, reg: u8) -> Self {
        self.reg = Some(reg);
        self
    }

    const fn imm8(mut self) -> Self {
        self.imm8 = true;
        self
    }

    const fn no_vvvv(mut self) -> Self {
        self.no_vvvv = true;
        self
    }

    const fn legacy_too(mut self) -> Self {
        self.form = Form::VexOrLegacy;
        self
    }

    #[inline]
    fn matches(&self, prefix: &PrefixContext, opcode: u8, modrm: ModRM) -> bool {
        self.map == prefix.map
            && self.simd == prefix.simd
            && self.opcode == opcode
            && self.reg.map_or(true, |reg| reg == modrm.get_reg())
    }
}

const fn bmi_entry(simd: SimdPrefix, opcode: u8, op: BmiOp, extension: Extensions) -> OpEntry {
    OpEntry::vex(OpcodeMap::Map0F38, simd, opcode, Op::Bmi(op), extension)
}

const fn pcmpstr_entry(opcode: u8, op: PcmpOp) -> OpEntry {
    OpEntry::vex(
        OpcodeMap::Map0F3A,
        SimdPrefix::Prefix66,
        opcode,
        Op::Pcmpstr(op),
        Extensions::SSE42,
    )
    .imm8()
    .no_vvvv()
    .legacy_too()
}

/// Every instruction we emulate.
///
/// SDM Vol2 Table A-3 / A-4 (0F38 and 0F3A opcode maps)
static OPCODES: [OpEntry; 17] = [
    bmi_entry(SimdPrefix::None, 0xf2, BmiOp::Andn, Extensions::BMI1),
    bmi_entry(SimdPrefix::None, 0xf3, BmiOp::Blsr, Extensions::BMI1).group(1),
    bmi_entry(SimdPrefix::None, 0xf3, BmiOp::Blsmsk, Extensions::BMI1).group(2),
    bmi_entry(SimdPrefix::None, 0xf3, BmiOp::Blsi, Extensions::BMI1).group(3),
    bmi_entry(SimdPrefix::None, 0xf5, BmiOp::Bzhi, Extensions::BMI2),
    bmi_entry(SimdPrefix::PrefixF3, 0xf5, BmiOp::Pext, Extensions::BMI2),
    bmi_entry(SimdPrefix::PrefixF2, 0xf5, BmiOp::Pdep, Extensions::BMI2),
    bmi_entry(SimdPrefix::PrefixF2, 0xf6, BmiOp::Mulx, Extensions::BMI2),
    bmi_entry(SimdPrefix::None, 0xf7, BmiOp::Bextr, Extensions::BMI1),
    bmi_entry(SimdPrefix::Prefix66, 0xf7, BmiOp::Shlx, Extensions::BMI2),
    bmi_entry(SimdPrefix::PrefixF3, 0xf7, BmiOp::Sarx, Extensions::BMI2),
    bmi_entry(SimdPrefix::PrefixF2, 0xf7, BmiOp::Shrx, Extensions::BMI2),
    OpEntry::vex(
        OpcodeMap::Map0F3A,
        SimdPrefix::PrefixF2,
        0xf0,
        Op::Bmi(BmiOp::Rorx),
        Extensions::BMI2,
    )
    .imm8()
    .no_vvvv(),
    pcmpstr_entry(0x60, PcmpOp::Pcmpestrm),
    pcmpstr_entry(0x61, PcmpOp::Pcmpestri),
    pcmpstr_entry(0x62, PcmpOp::Pcmpistrm),
    pcmpstr_entry(0x63, PcmpOp::Pcmpistri),
];

/// An instruction we know how to emulate, with everything needed to run it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedInsn {
    pub op: Op,
    pub prefix: PrefixContext,
    pub modrm: ModRM,
    pub rm: RmOperand,
    /// zero for opcodes without an immediate
    pub imm8: u8,
    pub len: usize,
}

impl DecodedInsn {
    /// ModRM.reg extended by R
    #[inline]
    fn reg(&self) -> u8 {
        self.modrm.get_reg() | ((self.prefix.high_reg as u8) << 3)
    }

    #[inline]
    fn vvvv(&self) -> Register {
        Register::from_index(self.prefix.vvvv)
    }
}

/// Results of an instruction, held back until the whole instruction succeeded.
#[derive(Debug, Default)]
struct Writeback {
    /// applied in order, so a later write to the same register wins
    gprs: [Option<(Register, u64)>; 2],
    xmm0: Option<u128>,
    flags: Option<FlagUpdate>,
}

impl Writeback {
    #[inline]
    fn set_reg<T: Primitive<BYTES>, const BYTES: usize>(&mut self, val: T, register: Register) {
        let slot = self.gprs.iter_mut().find(|slot| slot.is_none());
        debug_assert!(slot.is_some(), "more register results than slots");
        if let Some(slot) = slot {
            // zero extended like every 32 bit write in long mode
            *slot = Some((register, val.to_u128() as u64));
        }
    }

    fn commit(self, regs: &mut RegSnapshot) {
        for (register, val) in self.gprs.into_iter().flatten() {
            regs.set_reg::<u64, 8>(val, register);
        }
        if let Some(xmm0) = self.xmm0 {
            regs.set_xmm(0, xmm0);
        }
        if let Some(flags) = self.flags {
            regs.update_flags(flags);
        }
    }
}

/// Operand reads for one instruction.
struct Operands<'a, M: Memory> {
    insn: &'a DecodedInsn,
    regs: &'a RegSnapshot,
    mem: &'a mut M,
    mode: Mode,
}

impl<'a, M: Memory> Operands<'a, M> {
    /// resolve the address a memory operand uses
    #[inline]
    fn calc_addr(&self, mem: &MemOperand) -> Virtaddr {
        let next_ip = self
            .mode
            .wrap(self.regs.rip().wrapping_add(self.insn.len as u64));
        mem.effective_address(self.regs, self.mode, next_ip)
    }

    fn read<T: Primitive<BYTES>, const BYTES: usize>(&mut self, mem: &MemOperand) -> Result<T> {
        let addr = self.calc_addr(mem);
        self.mem
            .read_primitive::<T, BYTES>(addr)
            .map_err(|source| EmulateError::AccessFault {
                addr: source.address(),
                source,
            })
    }

    /// the ModRM.rm operand as a general purpose register or memory
    #[inline]
    fn get_val<T: Primitive<BYTES>, const BYTES: usize>(&mut self) -> Result<T> {
        match self.insn.rm {
            RmOperand::Reg(index) => Ok(self.regs.get_reg::<T, BYTES>(Register::from_index(index))),
            RmOperand::Mem(mem) => self.read::<T, BYTES>(&mem),
        }
    }

    /// the ModRM.rm operand as an XMM register or m128
    #[inline]
    fn get_xmm_val(&mut self) -> Result<u128> {
        match self.insn.rm {
            RmOperand::Reg(index) => Ok(self.regs.get_xmm(index)),
            RmOperand::Mem(mem) => self.read::<u128, 16>(&mem),
        }
    }

    #[inline]
    fn get_reg<T: Primitive<BYTES>, const BYTES: usize>(&self, register: Register) -> T {
        self.regs.get_reg::<T, BYTES>(register)
    }
}

/// Instantiate a width generic body for the operand size of an instruction.
macro_rules! match_bitness_ts {
    ($bitness:expr, $id:ident) => {
        match $bitness {
            Bitness::ThirtyTwo => $id!(u32, 4),
            Bitness::SixtyFour => $id!(u64, 8),
        }
    };
}

fn exec_bmi<T: Word<N>, M: Memory, const N: usize>(
    op: BmiOp,
    ops: &mut Operands<M>,
    wb: &mut Writeback,
) -> Result<()> {
    let insn = ops.insn;
    let dest = Register::from_index(insn.reg());
    let vvvv = insn.vvvv();
    let src: T = ops.get_val::<T, N>()?;
    let v: T = ops.get_reg::<T, N>(vvvv);

    match op {
        BmiOp::Andn => {
            let (val, flags) = bmi::andn::<T, N>(v, src);
            wb.set_reg::<T, N>(val, dest);
            wb.flags = Some(flags);
        }
        BmiOp::Blsr => {
            let (val, flags) = bmi::blsr::<T, N>(src);
            wb.set_reg::<T, N>(val, vvvv);
            wb.flags = Some(flags);
        }
        BmiOp::Blsmsk => {
            let (val, flags) = bmi::blsmsk::<T, N>(src);
            wb.set_reg::<T, N>(val, vvvv);
            wb.flags = Some(flags);
        }
        BmiOp::Blsi => {
            let (val, flags) = bmi::blsi::<T, N>(src);
            wb.set_reg::<T, N>(val, vvvv);
            wb.flags = Some(flags);
        }
        BmiOp::Bzhi => {
            let (val, flags) = bmi::bzhi::<T, N>(src, v);
            wb.set_reg::<T, N>(val, dest);
            wb.flags = Some(flags);
        }
        BmiOp::Bextr => {
            let (val, flags) = bmi::bextr::<T, N>(src, v);
            wb.set_reg::<T, N>(val, dest);
            wb.flags = Some(flags);
        }
        // the r/m operand is the mask
        BmiOp::Pext => wb.set_reg::<T, N>(bmi::pext::<T, N>(v, src), dest),
        BmiOp::Pdep => wb.set_reg::<T, N>(bmi::pdep::<T, N>(v, src), dest),
        BmiOp::Mulx => {
            let (low, high) = bmi::mulx::<T, N>(src, ops.get_reg::<T, N>(Register::RDX));
            // high goes in last so it wins when both name the same register
            wb.set_reg::<T, N>(low, vvvv);
            wb.set_reg::<T, N>(high, dest);
        }
        BmiOp::Shlx => wb.set_reg::<T, N>(bmi::shlx::<T, N>(src, v), dest),
        BmiOp::Sarx => wb.set_reg::<T, N>(bmi::sarx::<T, N>(src, v), dest),
        BmiOp::Shrx => wb.set_reg::<T, N>(bmi::shrx::<T, N>(src, v), dest),
        BmiOp::Rorx => wb.set_reg::<T, N>(bmi::rorx::<T, N>(src, insn.imm8), dest),
    }
    Ok(())
}

fn exec_pcmpstr<M: Memory>(
    op: PcmpOp,
    ops: &mut Operands<M>,
    wb: &mut Writeback,
) -> Result<()> {
    let insn = ops.insn;
    let ctl = Control(insn.imm8);
    let a = ops.regs.get_xmm(insn.reg());
    let b = ops.get_xmm_val()?;

    let lengths = if op.explicit_lengths() {
        // W selects the full 64 bit registers
        let (la, lb) = match insn.prefix.operand_size {
            Bitness::SixtyFour => (
                ops.get_reg::<u64, 8>(Register::RAX) as i64,
                ops.get_reg::<u64, 8>(Register::RDX) as i64,
            ),
            Bitness::ThirtyTwo => (
                ops.get_reg::<u32, 4>(Register::RAX) as i32 as i64,
                ops.get_reg::<u32, 4>(Register::RDX) as i32 as i64,
            ),
        };
        Lengths::Explicit { a: la, b: lb }
    } else {
        Lengths::Implicit
    };

    let res = pcmpstr::compare(ctl, a, b, lengths);
    if op.index_output() {
        wb.set_reg::<u32, 4>(res.index(ctl), Register::RCX);
    } else {
        wb.xmm0 = Some(res.mask(ctl));
    }
    wb.flags = Some(res.flags());
    Ok(())
}

/// Emulates the instructions enabled in its [`Config`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Emulator {
    config: Config,
}

impl Emulator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn lookup(
        &self,
        prefix: &PrefixContext,
        opcode: u8,
        modrm: ModRM,
    ) -> std::result::Result<&'static OpEntry, DecodeError> {
        let entry = OPCODES
            .iter()
            .filter(|entry| prefix.encoding.is_vex() || entry.form == Form::VexOrLegacy)
            .find(|entry| entry.matches(prefix, opcode, modrm))
            .ok_or(DecodeError::UnknownOpcode {
                map: prefix.map,
                simd: prefix.simd,
                opcode,
            })?;

        if prefix.encoding.is_vex() && (prefix.l || (entry.no_vvvv && prefix.vvvv != 0)) {
            return Err(DecodeError::ReservedVex);
        }
        if !self.config.enabled(entry.extension) {
            return Err(DecodeError::Disabled(entry.extension));
        }
        Ok(entry)
    }

    /// Decode the instruction at the start of `bytes`.
    ///
    /// Fails for anything that is not one of the enabled instructions,
    /// including streams that end before the instruction does.
    pub fn decode(&self, bytes: &[u8], mode: Mode) -> std::result::Result<DecodedInsn, DecodeError> {
        let mut insn = InsnBytes::new(bytes);
        let prefix = decode::decode_prefix(&mut insn, mode)?;
        let opcode = insn.read_u8()?;
        let (modrm, rm) = decode::decode_modrm(&mut insn, &prefix, mode)?;
        let entry = self.lookup(&prefix, opcode, modrm)?;
        let imm8 = if entry.imm8 { insn.read_u8()? } else { 0 };

        Ok(DecodedInsn {
            op: entry.op,
            prefix,
            modrm,
            rm,
            imm8,
            len: insn.processed(),
        })
    }

    /// Run a decoded instruction against `regs`.
    ///
    /// Either every result is committed or, on error, none is. RIP is left
    /// alone.
    pub fn execute<M: Memory>(
        &self,
        insn: &DecodedInsn,
        regs: &mut RegSnapshot,
        mode: Mode,
        mem: &mut M,
    ) -> Result<()> {
        let mut wb = Writeback::default();
        {
            let mut ops = Operands {
                insn,
                regs,
                mem,
                mode,
            };
            match insn.op {
                Op::Bmi(op) => {
                    macro_rules! sized_bmi {
                        ($typ:ty,$size:literal) => {
                            exec_bmi::<$typ, M, $size>(op, &mut ops, &mut wb)?
                        };
                    }
                    match_bitness_ts!(insn.prefix.operand_size, sized_bmi)
                }
                Op::Pcmpstr(op) => exec_pcmpstr(op, &mut ops, &mut wb)?,
            }
        }
        wb.commit(regs);
        Ok(())
    }

    /// Emulate the instruction at the start of `bytes`.
    ///
    /// Returns its length, or 0 if it is not something we emulate, in which
    /// case `regs` is untouched. The caller advances RIP.
    pub fn emulate<M: Memory>(
        &self,
        regs: &mut RegSnapshot,
        bytes: &[u8],
        mode: Mode,
        mem: &mut M,
    ) -> Result<usize> {
        let Ok(insn) = self.decode(bytes, mode) else {
            return Ok(0);
        };
        self.execute(&insn, regs, mode, mem)?;
        Ok(insn.len)
    }
}
