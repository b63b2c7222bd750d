//! Wordcode instruction definitions.
//!
//! Every instruction occupies 2 bytes: `[opcode, arg]`. Operands wider
//! than 8 bits are expressed by prefixing the instruction with one to
//! three `ExtendedArg` instructions, each shifting the accumulated
//! argument left by 8 bits. Jump operands are byte offsets: absolute
//! jumps target an instruction's first byte (including its prefixes),
//! relative jumps are measured from the end of the jump instruction.

use std::fmt;

/// Number of bytes in one instruction unit (opcode + arg).
pub const INSTRUCTION_UNIT: usize = 2;

/// Maximum number of `ExtendedArg` prefixes for one instruction.
pub const MAX_EXTENDED_ARGS: u8 = 3;

/// Wordcode opcodes.
///
/// Opcodes are organized by category:
/// - 0x00-0x0F: Stack and control
/// - 0x10-0x1F: Jumps
/// - 0x20-0x2F: Load/Store
/// - 0x30-0x3F: Arithmetic
/// - 0x40-0x4F: Comparison
/// - 0x50-0x5F: Containers and iteration
/// - 0x60-0x6F: Calls
/// - 0x70-0x7F: Exceptions and generators
/// - 0x90: Operand prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// No operation. The operand is preserved but ignored.
    Nop = 0x00,
    /// Pop the top of stack.
    Pop = 0x01,
    /// Duplicate the top of stack.
    Dup = 0x02,
    /// Return the top of stack to the caller.
    Return = 0x03,

    /// Unconditional jump to an absolute byte offset.
    Jump = 0x10,
    /// Unconditional jump forward by `arg` bytes (from instruction end).
    JumpForward = 0x11,
    /// Pop; jump to absolute offset if the value is falsy.
    JumpIfFalse = 0x12,
    /// Pop; jump to absolute offset if the value is truthy.
    JumpIfTrue = 0x13,
    /// If top is falsy jump (keeping it), otherwise pop.
    JumpIfFalseOrPop = 0x14,
    /// If top is truthy jump (keeping it), otherwise pop.
    JumpIfTrueOrPop = 0x15,
    /// Advance the iterator at top of stack: push the next value, or
    /// pop the iterator and jump forward by `arg` bytes on exhaustion.
    ForIter = 0x16,

    /// Push `consts[arg]`.
    LoadConst = 0x20,
    /// Push `locals[arg]`.
    LoadLocal = 0x21,
    /// Pop into `locals[arg]`.
    StoreLocal = 0x22,
    /// Push the global named `names[arg]`.
    LoadGlobal = 0x23,
    /// Pop into the global named `names[arg]`.
    StoreGlobal = 0x24,

    /// Pop rhs, lhs; push `lhs + rhs`.
    BinaryAdd = 0x30,
    /// Pop rhs, lhs; push `lhs - rhs`.
    BinarySub = 0x31,
    /// Pop rhs, lhs; push `lhs * rhs`.
    BinaryMul = 0x32,
    /// Pop rhs, lhs; push `lhs / rhs` (true division).
    BinaryDiv = 0x33,
    /// Pop rhs, lhs; push `lhs // rhs`.
    BinaryFloorDiv = 0x34,
    /// Pop rhs, lhs; push `lhs % rhs`.
    BinaryMod = 0x35,
    /// Negate the top of stack.
    UnaryNeg = 0x38,
    /// Logical negation of the top of stack.
    UnaryNot = 0x39,

    /// Pop rhs, lhs; push the comparison selected by `arg` (a `CmpOp`).
    Compare = 0x40,

    /// Pop `arg` values; push a tuple of them.
    BuildTuple = 0x50,
    /// Replace the top of stack with an iterator over it.
    GetIter = 0x51,

    /// Call: pop `arg` arguments then the callee; push the result.
    Call = 0x60,
    /// Push a function built from the code object at `consts[arg]`.
    MakeFunction = 0x61,

    /// Pop a value and raise it as an exception.
    Raise = 0x70,
    /// Suspend the generator, yielding the top of stack; on resume the
    /// yielded slot is replaced by the sent value.
    Yield = 0x71,

    /// Operand prefix: shift the pending argument left by 8 bits.
    ExtendedArg = 0x90,
}

impl Opcode {
    /// Convert from a raw byte, returning `None` if invalid.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::Pop),
            0x02 => Some(Opcode::Dup),
            0x03 => Some(Opcode::Return),

            0x10 => Some(Opcode::Jump),
            0x11 => Some(Opcode::JumpForward),
            0x12 => Some(Opcode::JumpIfFalse),
            0x13 => Some(Opcode::JumpIfTrue),
            0x14 => Some(Opcode::JumpIfFalseOrPop),
            0x15 => Some(Opcode::JumpIfTrueOrPop),
            0x16 => Some(Opcode::ForIter),

            0x20 => Some(Opcode::LoadConst),
            0x21 => Some(Opcode::LoadLocal),
            0x22 => Some(Opcode::StoreLocal),
            0x23 => Some(Opcode::LoadGlobal),
            0x24 => Some(Opcode::StoreGlobal),

            0x30 => Some(Opcode::BinaryAdd),
            0x31 => Some(Opcode::BinarySub),
            0x32 => Some(Opcode::BinaryMul),
            0x33 => Some(Opcode::BinaryDiv),
            0x34 => Some(Opcode::BinaryFloorDiv),
            0x35 => Some(Opcode::BinaryMod),
            0x38 => Some(Opcode::UnaryNeg),
            0x39 => Some(Opcode::UnaryNot),

            0x40 => Some(Opcode::Compare),

            0x50 => Some(Opcode::BuildTuple),
            0x51 => Some(Opcode::GetIter),

            0x60 => Some(Opcode::Call),
            0x61 => Some(Opcode::MakeFunction),

            0x70 => Some(Opcode::Raise),
            0x71 => Some(Opcode::Yield),

            0x90 => Some(Opcode::ExtendedArg),

            _ => None,
        }
    }

    /// Whether this opcode transfers control via its operand.
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::JumpForward
                | Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
        )
    }

    /// Whether this jump's operand is relative to the instruction end.
    #[inline]
    pub fn is_relative_jump(self) -> bool {
        matches!(self, Opcode::JumpForward | Opcode::ForIter)
    }

    /// Whether this jump is conditional (has a fall-through successor).
    #[inline]
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpIfFalse
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
        )
    }

    /// Net stack effect of executing this instruction.
    ///
    /// For instructions whose effect depends on the taken path, this is
    /// the larger (safer) of the two outcomes, suitable for computing a
    /// stack-size upper bound by linear scan.
    pub fn stack_effect(self, arg: u32) -> i32 {
        match self {
            Opcode::Nop | Opcode::ExtendedArg | Opcode::Jump | Opcode::JumpForward => 0,
            Opcode::Pop => -1,
            Opcode::Dup => 1,
            Opcode::Return => -1,
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => -1,
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => 0,
            Opcode::ForIter => 1,
            Opcode::LoadConst | Opcode::LoadLocal | Opcode::LoadGlobal => 1,
            Opcode::StoreLocal | Opcode::StoreGlobal => -1,
            Opcode::BinaryAdd
            | Opcode::BinarySub
            | Opcode::BinaryMul
            | Opcode::BinaryDiv
            | Opcode::BinaryFloorDiv
            | Opcode::BinaryMod
            | Opcode::Compare => -1,
            Opcode::UnaryNeg | Opcode::UnaryNot | Opcode::GetIter => 0,
            Opcode::BuildTuple => 1 - arg as i32,
            Opcode::Call => -(arg as i32),
            Opcode::MakeFunction => 1,
            Opcode::Raise => -1,
            Opcode::Yield => 0,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Comparison operators encoded as the `Compare` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmpOp {
    /// `<`
    Lt = 0,
    /// `<=`
    Le = 1,
    /// `==`
    Eq = 2,
    /// `!=`
    Ne = 3,
    /// `>`
    Gt = 4,
    /// `>=`
    Ge = 5,
}

impl CmpOp {
    /// Convert from a raw operand.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CmpOp::Lt),
            1 => Some(CmpOp::Le),
            2 => Some(CmpOp::Eq),
            3 => Some(CmpOp::Ne),
            4 => Some(CmpOp::Gt),
            5 => Some(CmpOp::Ge),
            _ => None,
        }
    }

    /// Source-level symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}
