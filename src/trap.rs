//! Glue between an invalid opcode fault and the emulator.
//!
//! The host's #UD handler calls [`handle_trap`] with the faulting thread's
//! registers and a [`Memory`] for its address space, and acts on the
//! [`TrapOutcome`]: resume, deliver the original fault, or raise a
//! segmentation fault for a bad memory operand.

use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};
use tracing::{debug, trace};

use crate::config::Config;
use crate::decode::MAX_INSN_LEN;
use crate::emu::Emulator;
use crate::mmu::{Memory, Virtaddr};
use crate::regs::{Mode, RegSnapshot};

/// #UD
pub const INVALID_OPCODE: u8 = 6;

/// What the CPU told us about the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapFrame {
    pub vector: u8,
    /// raised while running user code
    pub user_mode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// emulated, RIP already points past the instruction
    Handled { len: usize },
    /// not ours, hand the fault to the original handler
    Deliver,
    /// a memory operand was not accessible, nothing was changed
    Fault { addr: Virtaddr },
}

/// Read the instruction bytes at `rip`, stopping at the first byte that
/// cannot be fetched.
fn fetch_insn<M: Memory>(mem: &mut M, mode: Mode, rip: u64) -> ([u8; MAX_INSN_LEN], usize) {
    let mut buf = [0u8; MAX_INSN_LEN];
    let mut len = 0;
    for (i, byte) in buf.iter_mut().enumerate() {
        // byte by byte, so a fetch never crosses the 4G wrap in 32 bit mode
        let addr = Virtaddr(mode.wrap(rip.wrapping_add(i as u64)));
        if mem.fetch(addr, core::slice::from_mut(byte)).is_err() {
            break;
        }
        len += 1;
    }
    (buf, len)
}

fn disassemble(bytes: &[u8], mode: Mode, rip: u64) -> String {
    let insn = Decoder::with_ip(mode.bitness(), bytes, rip, DecoderOptions::NONE).decode();
    let mut out = String::new();
    NasmFormatter::new().format(&insn, &mut out);
    out
}

/// Try to emulate the instruction behind an invalid opcode fault.
pub fn handle_trap<M: Memory>(
    regs: &mut RegSnapshot,
    mode: Mode,
    frame: &TrapFrame,
    mem: &mut M,
    config: &Config,
) -> TrapOutcome {
    if frame.vector != INVALID_OPCODE || !frame.user_mode {
        trace!(
            vector = frame.vector,
            user_mode = frame.user_mode,
            "not a user mode invalid opcode fault"
        );
        return TrapOutcome::Deliver;
    }

    let rip = regs.rip();
    let (buf, fetched) = fetch_insn(mem, mode, rip);
    let bytes = &buf[..fetched];

    let emu = Emulator::new(*config);
    let insn = match emu.decode(bytes, mode) {
        Ok(insn) => insn,
        Err(err) => {
            trace!(rip = format_args!("{rip:#x}"), ?bytes, %err, "not emulated");
            return TrapOutcome::Deliver;
        }
    };

    debug!(
        rip = format_args!("{rip:#x}"),
        insn = %disassemble(&bytes[..insn.len], mode, rip),
        "emulating"
    );

    match emu.execute(&insn, regs, mode, mem) {
        Ok(()) => {
            regs.rip = mode.wrap(rip.wrapping_add(insn.len as u64));
            TrapOutcome::Handled { len: insn.len }
        }
        Err(err) => {
            debug!(rip = format_args!("{rip:#x}"), %err, "memory operand fault");
            TrapOutcome::Fault {
                addr: err.fault_address(),
            }
        }
    }
}
