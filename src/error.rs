use thiserror::Error;

use crate::config::Extensions;
use crate::decode::{OpcodeMap, SimdPrefix};
use crate::mmu::{AccessError, Virtaddr};

/// Why an instruction could not be emulated after it was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmulateError {
    /// a memory operand could not be read or written, nothing was committed
    #[error("memory operand at {addr:#x} is not accessible")]
    AccessFault {
        addr: Virtaddr,
        #[source]
        source: AccessError,
    },
}

impl EmulateError {
    pub fn fault_address(&self) -> Virtaddr {
        match self {
            EmulateError::AccessFault { addr, .. } => *addr,
        }
    }
}

/// Reasons the decoder gives up on a byte stream.
///
/// None of these reach the caller of `emulate`, they all mean "not ours"
/// and turn into a length of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("ran out of instruction bytes")]
    ExhaustedInput,
    #[error("no VEX or SSE4.2 escape")]
    NotHandled,
    #[error("invalid VEX opcode map {0:#x}")]
    InvalidMap(u8),
    #[error("no handler for opcode {opcode:#04x} in map {map:?} with prefix {simd:?}")]
    UnknownOpcode {
        map: OpcodeMap,
        simd: SimdPrefix,
        opcode: u8,
    },
    #[error("{0:?} is not enabled")]
    Disabled(Extensions),
    #[error("reserved VEX.L or VEX.vvvv encoding")]
    ReservedVex,
}

pub type Result<T> = std::result::Result<T, EmulateError>;
