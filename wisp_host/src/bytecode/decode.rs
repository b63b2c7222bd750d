//! Wordcode decoding and encoding helpers.
//!
//! Shared by the assembler, the disassembler, the interpreter, and any
//! external bytecode rewriter.

use super::opcode::{Opcode, INSTRUCTION_UNIT, MAX_EXTENDED_ARGS};
use smallvec::SmallVec;

/// One decoded instruction, prefixes folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstr {
    /// Offset of the first byte, including any `ExtendedArg` prefixes.
    pub offset: u32,
    /// Total length in bytes (prefixes included).
    pub len: u8,
    /// Opcode byte of the final (non-prefix) instruction.
    pub op: u8,
    /// Fully widened operand.
    pub arg: u32,
}

impl RawInstr {
    /// Offset of the first byte past this instruction.
    #[inline]
    pub fn end(&self) -> u32 {
        self.offset + self.len as u32
    }

    /// Decoded opcode, if the byte is valid.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }
}

/// Iterate the instructions of a raw wordcode stream.
///
/// `ExtendedArg` prefixes are folded into the following instruction.
/// A trailing prefix without an instruction is silently dropped, and a
/// trailing odd byte is ignored; validation is the caller's concern.
pub fn unpack(code: &[u8]) -> impl Iterator<Item = RawInstr> + '_ {
    let mut off = 0usize;
    let mut start = 0usize;
    let mut ext: u32 = 0;

    std::iter::from_fn(move || {
        while off + INSTRUCTION_UNIT <= code.len() {
            let op = code[off];
            let byte_arg = code[off + 1] as u32;
            off += INSTRUCTION_UNIT;

            if op == Opcode::ExtendedArg as u8 {
                ext = (ext | byte_arg) << 8;
                continue;
            }

            let instr = RawInstr {
                offset: start as u32,
                len: (off - start) as u8,
                op,
                arg: ext | byte_arg,
            };
            ext = 0;
            start = off;
            return Some(instr);
        }
        None
    })
}

/// Number of `ExtendedArg` prefixes an operand requires.
#[inline]
pub fn arg_ext_needed(arg: u32) -> u8 {
    if arg == 0 {
        return 0;
    }
    ((31 - arg.leading_zeros()) / 8) as u8
}

/// Total encoded length of `(opcode, arg)` with at least `min_ext` prefixes.
#[inline]
pub fn encoded_len(arg: u32, min_ext: u8) -> u32 {
    (INSTRUCTION_UNIT as u32) * (1 + arg_ext_needed(arg).max(min_ext) as u32)
}

/// Encode one instruction, emitting at least `min_ext` prefixes.
///
/// Forcing prefixes lets callers produce fixed-length encodings that
/// are independent of operand magnitude.
pub fn encode(op: Opcode, arg: u32, min_ext: u8) -> SmallVec<[u8; 8]> {
    let ext = arg_ext_needed(arg).max(min_ext);
    debug_assert!(ext <= MAX_EXTENDED_ARGS);

    let mut out = SmallVec::new();
    for i in 0..ext {
        out.push(Opcode::ExtendedArg as u8);
        out.push((arg >> ((ext - i) * 8)) as u8);
    }
    out.push(op as u8);
    out.push(arg as u8);
    out
}

/// Upper bound on the operand stack depth needed to run `code`.
///
/// Linear scan: assumes each instruction executes at most once per
/// stack level, which holds for code emitted by the builder (loop
/// bodies are stack-neutral).
pub fn calc_max_stack(code: &[u8]) -> u16 {
    let mut depth: i32 = 0;
    let mut max_depth: i32 = 0;

    for instr in unpack(code) {
        if let Some(op) = instr.opcode() {
            depth += op.stack_effect(instr.arg);
            max_depth = max_depth.max(depth);
        }
    }
    max_depth.max(0) as u16
}
