//! Code unit representation for compiled blocks.
//!
//! A `CodeUnit` contains the wordcode and metadata needed to execute
//! one compiled block (a module body or a function body). Units are
//! immutable once created and shared across threads, with a single
//! exception: individual code bytes may be patched atomically, which
//! is the mechanism coverage tooling uses to disable an injected probe
//! in place.

use super::decode::{self, RawInstr};
use crate::value::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

// =============================================================================
// Code byte store
// =============================================================================

/// Wordcode bytes with single-byte atomic patching.
///
/// Reads and writes use relaxed ordering: a patch is published to other
/// threads no later than the host's next code-object replacement, and
/// the patching thread observes its own write immediately.
pub struct CodeBytes(Box<[AtomicU8]>);

impl CodeBytes {
    /// Read one byte.
    #[inline]
    pub fn byte(&self, offset: u32) -> u8 {
        self.0[offset as usize].load(Ordering::Relaxed)
    }

    /// Overwrite one byte in place.
    #[inline]
    pub fn patch_byte(&self, offset: u32, value: u8) {
        self.0[offset as usize].store(value, Ordering::Relaxed);
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    /// Whether the stream is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy the current bytes out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

impl From<Vec<u8>> for CodeBytes {
    fn from(bytes: Vec<u8>) -> Self {
        CodeBytes(bytes.into_iter().map(AtomicU8::new).collect())
    }
}

impl std::fmt::Debug for CodeBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CodeBytes({} bytes)", self.0.len())
    }
}

// =============================================================================
// Tables
// =============================================================================

/// Line table entry mapping a byte-offset range to a source line.
///
/// Line 0 marks synthetic code with no source line of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Starting byte offset (inclusive).
    pub start: u32,
    /// Ending byte offset (exclusive).
    pub end: u32,
    /// Source line number, or 0.
    pub line: u32,
}

/// Exception-region table entry.
///
/// If an error is raised while executing in `[start, end)`, the
/// operand stack is truncated to `depth` and control transfers to
/// `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// Region start offset (inclusive).
    pub start: u32,
    /// Region end offset (exclusive).
    pub end: u32,
    /// Handler offset.
    pub handler: u32,
    /// Operand stack depth to restore before entering the handler.
    pub depth: u32,
}

impl ExceptionEntry {
    /// Whether `offset` falls inside this region.
    #[inline]
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Code unit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// No flags.
    pub const NONE: CodeFlags = CodeFlags(0);
    /// The unit is a generator body.
    pub const GENERATOR: CodeFlags = CodeFlags(1 << 0);
    /// The unit is module-level code.
    pub const MODULE: CodeFlags = CodeFlags(1 << 1);
    /// The unit is nested inside another unit.
    pub const NESTED: CodeFlags = CodeFlags(1 << 2);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Combine flags.
    #[inline]
    pub const fn union(self, other: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | other.0)
    }

    /// Get raw value.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for CodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Reference-based identity of a code unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(usize);

impl CodeId {
    /// Identity of a shared code unit.
    #[inline]
    pub fn of(code: &Arc<CodeUnit>) -> Self {
        CodeId(Arc::as_ptr(code) as usize)
    }
}

// =============================================================================
// Code unit
// =============================================================================

/// A compiled code unit: one module body or function body.
#[derive(Debug)]
pub struct CodeUnit {
    /// Block name (`<module>` for module-level code).
    pub name: Arc<str>,
    /// Qualified name including enclosing blocks.
    pub qualname: Arc<str>,
    /// Filename where this unit was defined.
    pub filename: Arc<str>,
    /// First source line.
    pub first_line: u32,

    /// Raw wordcode.
    pub code: CodeBytes,
    /// Constant pool (indexed by `LoadConst` and `MakeFunction`).
    pub consts: Box<[Value]>,
    /// Global name strings (indexed by `LoadGlobal`/`StoreGlobal`).
    pub names: Box<[Arc<str>]>,
    /// Local variable names; parameters come first.
    pub locals: Box<[Arc<str>]>,
    /// Free variable names (captured from enclosing scope).
    pub freevars: Box<[Arc<str>]>,
    /// Cell variable names (captured by nested units).
    pub cellvars: Box<[Arc<str>]>,

    /// Number of parameters.
    pub arg_count: u16,
    /// Operand stack size requirement.
    pub stack_size: u16,
    /// Code flags.
    pub flags: CodeFlags,

    /// Line table, ordered by offset.
    pub line_table: Box<[LineEntry]>,
    /// Exception-region table, ordered by start offset.
    pub exception_table: Box<[ExceptionEntry]>,
}

impl CodeUnit {
    /// This unit's reference identity.
    #[inline]
    pub fn id(self: &Arc<Self>) -> CodeId {
        CodeId::of(self)
    }

    /// Check if this unit is a generator body.
    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Get the source line for a byte offset, if any maps there.
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        self.line_table
            .iter()
            .find(|e| e.start <= offset && offset < e.end)
            .map(|e| e.line)
            .filter(|&l| l != 0)
    }

    /// The source line starting exactly at `offset`, if any.
    #[inline]
    pub fn line_start_at(&self, offset: u32) -> Option<u32> {
        self.line_table
            .iter()
            .find(|e| e.start == offset && e.start < e.end)
            .map(|e| e.line)
            .filter(|&l| l != 0)
    }

    /// Iterate `(offset, line)` pairs for the first instruction of each
    /// line-table entry with a real source line.
    pub fn line_starts(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.line_table
            .iter()
            .filter(|e| e.line != 0 && e.start < e.end)
            .map(|e| (e.start, e.line))
    }

    /// The distinct source lines this unit's code maps to.
    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        let mut seen = rustc_hash::FxHashSet::default();
        self.line_starts()
            .filter_map(move |(_, line)| seen.insert(line).then_some(line))
    }

    /// Decode the current bytes.
    pub fn instructions(&self) -> Vec<RawInstr> {
        decode::unpack(&self.code.snapshot()).collect()
    }

    /// Find the innermost exception region covering `offset`.
    pub fn find_handler(&self, offset: u32) -> Option<&ExceptionEntry> {
        // Entries are ordered by start; the last covering entry is the
        // innermost region.
        self.exception_table.iter().rev().find(|e| e.covers(offset))
    }
}

/// Disassemble a code unit to a string.
pub fn disassemble(code: &CodeUnit) -> String {
    use std::fmt::Write;

    let mut output = String::new();

    writeln!(output, "Code unit: {}", code.qualname).unwrap();
    writeln!(output, "  File: {}", code.filename).unwrap();
    writeln!(output, "  Args: {}", code.arg_count).unwrap();
    writeln!(output, "  Stack: {}", code.stack_size).unwrap();
    writeln!(output, "  Flags: {:08x}", code.flags.bits()).unwrap();

    if !code.consts.is_empty() {
        writeln!(output, "\nConstants:").unwrap();
        for (i, c) in code.consts.iter().enumerate() {
            writeln!(output, "  {:4}: {:?}", i, c).unwrap();
        }
    }

    if !code.names.is_empty() {
        writeln!(output, "\nNames:").unwrap();
        for (i, n) in code.names.iter().enumerate() {
            writeln!(output, "  {:4}: {}", i, n).unwrap();
        }
    }

    writeln!(output, "\nDisassembly:").unwrap();
    for instr in code.instructions() {
        let line = code.line_for_offset(instr.offset);
        let line_str = line.map_or("    ".to_string(), |l| format!("{:4}", l));
        let op_str = match instr.opcode() {
            Some(op) => format!("{}", op),
            None => format!("INVALID({:02x})", instr.op),
        };
        writeln!(
            output,
            "{} {:6}: {} {}",
            line_str, instr.offset, op_str, instr.arg
        )
        .unwrap();
    }

    if !code.exception_table.is_empty() {
        writeln!(output, "\nExceptionTable:").unwrap();
        for e in code.exception_table.iter() {
            writeln!(
                output,
                "  {}-{} -> {} [depth {}]",
                e.start, e.end, e.handler, e.depth
            )
            .unwrap();
        }
    }

    output
}
