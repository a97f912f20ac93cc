//! Emulation of BMI1, BMI2 and SSE4.2 string compares for CPUs that lack them.
//!
//! A host that catches an invalid opcode fault in user code hands the
//! faulting registers to [`trap::handle_trap`], or straight to [`emulate`]
//! when it fetches the instruction bytes itself. Recognized instructions
//! are executed against the [`RegSnapshot`]; everything else is left for the
//! original fault handler.

pub mod bmi;
pub mod config;
pub mod decode;
pub mod emu;
pub mod error;
pub mod mmu;
pub mod pcmpstr;
pub mod primitive;
pub mod regs;
pub mod trap;

pub use config::{Config, Extensions};
pub use emu::Emulator;
pub use error::{EmulateError, Result};
pub use mmu::{AccessError, Memory, Virtaddr, MMU};
pub use regs::{Flags, Mode, RegSnapshot, Register};
pub use trap::{handle_trap, TrapFrame, TrapOutcome};

/// Emulate the instruction at the start of `bytes` with every extension
/// enabled.
///
/// Returns the instruction length, or 0 when the bytes are not an
/// instruction we emulate. RIP is not advanced.
pub fn emulate<M: Memory>(
    regs: &mut RegSnapshot,
    bytes: &[u8],
    mode: Mode,
    mem: &mut M,
) -> Result<usize> {
    Emulator::default().emulate(regs, bytes, mode, mem)
}
