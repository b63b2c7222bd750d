//! Wordcode bytecode system.
//!
//! - [`Opcode`] / [`CmpOp`] - instruction set
//! - [`decode`] - raw stream decoding and encoding helpers
//! - [`CodeUnit`] - compiled block representation
//! - [`CodeBuilder`] - label-based assembler

mod builder;
mod code_unit;
pub mod decode;
mod opcode;

pub use builder::{CodeBuilder, Label};
pub use code_unit::{
    disassemble, CodeBytes, CodeFlags, CodeId, CodeUnit, ExceptionEntry, LineEntry,
};
pub use opcode::{CmpOp, Opcode, INSTRUCTION_UNIT, MAX_EXTENDED_ARGS};
