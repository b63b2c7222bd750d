//! Wordcode assembler.
//!
//! `CodeBuilder` provides a label-based API for constructing code
//! units: constant deduplication, name and local interning, automatic
//! line-table construction, exception-region registration, and a
//! relaxation pass that sizes `ExtendedArg` prefixes when the final
//! byte offsets are known.

use super::code_unit::{CodeFlags, CodeUnit, ExceptionEntry, LineEntry};
use super::decode::{self, encoded_len};
use super::opcode::Opcode;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A label for jump targets and exception-region boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A not-yet-encoded instruction.
#[derive(Debug, Clone, Copy)]
struct PendingInstr {
    op: Opcode,
    arg: InstrArg,
    line: u32,
}

/// Operand of a pending instruction.
#[derive(Debug, Clone, Copy)]
enum InstrArg {
    /// Literal operand.
    Imm(u32),
    /// Jump target, resolved at finish time.
    Target(Label),
}

/// An exception region awaiting label resolution.
#[derive(Debug, Clone, Copy)]
struct PendingRegion {
    start: Label,
    end: Label,
    handler: Label,
    depth: u32,
}

/// Key type for constant deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    None,
    Bool(bool),
    Int(i64),
    /// Float bits for exact comparison.
    Float(u64),
    Str(Arc<str>),
}

impl ConstKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::None => Some(ConstKey::None),
            Value::Bool(b) => Some(ConstKey::Bool(*b)),
            Value::Int(i) => Some(ConstKey::Int(*i)),
            Value::Float(f) => Some(ConstKey::Float(f.to_bits())),
            Value::Str(s) => Some(ConstKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// Builder for constructing code units.
pub struct CodeBuilder {
    /// Block name.
    name: Arc<str>,
    /// Qualified name.
    qualname: Arc<str>,
    /// Filename.
    filename: Arc<str>,
    /// First line number.
    first_line: u32,
    /// Current line number for subsequent instructions.
    current_line: u32,

    /// Emitted instructions.
    instrs: Vec<PendingInstr>,

    /// Constant pool.
    consts: Vec<Value>,
    /// Constant deduplication map.
    const_map: FxHashMap<ConstKey, u32>,

    /// Global name strings.
    names: Vec<Arc<str>>,
    name_map: FxHashMap<Arc<str>, u32>,

    /// Local variable names.
    locals: Vec<Arc<str>>,
    local_map: FxHashMap<Arc<str>, u32>,

    /// Number of parameters.
    arg_count: u16,
    /// Code flags.
    flags: CodeFlags,

    /// Label counter.
    next_label: u32,
    /// Label to instruction index map.
    labels: FxHashMap<Label, usize>,
    /// Exception regions awaiting resolution.
    regions: Vec<PendingRegion>,
}

impl CodeBuilder {
    /// Create a new builder.
    pub fn new(name: impl Into<Arc<str>>, filename: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            filename: filename.into(),
            first_line: 1,
            current_line: 0,
            instrs: Vec::new(),
            consts: Vec::new(),
            const_map: FxHashMap::default(),
            names: Vec::new(),
            name_map: FxHashMap::default(),
            locals: Vec::new(),
            local_map: FxHashMap::default(),
            arg_count: 0,
            flags: CodeFlags::NONE,
            next_label: 0,
            labels: FxHashMap::default(),
            regions: Vec::new(),
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Set the qualified name.
    pub fn set_qualname(&mut self, qualname: impl Into<Arc<str>>) {
        self.qualname = qualname.into();
    }

    /// Set the first line number.
    pub fn set_first_line(&mut self, line: u32) {
        self.first_line = line;
    }

    /// Set the source line for subsequent instructions (0 = synthetic).
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Set the number of parameters.
    pub fn set_arg_count(&mut self, count: u16) {
        self.arg_count = count;
    }

    /// Add code flags.
    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags |= flags;
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Add a constant and return its index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        if let Some(key) = ConstKey::from_value(&value) {
            if let Some(&idx) = self.const_map.get(&key) {
                return idx;
            }
            let idx = self.consts.len() as u32;
            self.consts.push(value);
            self.const_map.insert(key, idx);
            idx
        } else {
            let idx = self.consts.len() as u32;
            self.consts.push(value);
            idx
        }
    }

    /// Intern a global name and return its index.
    pub fn add_name(&mut self, name: impl Into<Arc<str>>) -> u32 {
        let name = name.into();
        if let Some(&idx) = self.name_map.get(&name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.name_map.insert(name.clone(), idx);
        self.names.push(name);
        idx
    }

    /// Define a local variable and return its slot.
    pub fn define_local(&mut self, name: impl Into<Arc<str>>) -> u32 {
        let name = name.into();
        if let Some(&slot) = self.local_map.get(&name) {
            return slot;
        }
        let slot = self.locals.len() as u32;
        self.local_map.insert(name.clone(), slot);
        self.locals.push(name);
        slot
    }

    /// Look up a local variable by name.
    pub fn lookup_local(&self, name: &str) -> Option<u32> {
        self.local_map.get(name).copied()
    }

    // =========================================================================
    // Labels and regions
    // =========================================================================

    /// Create a new label.
    pub fn create_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Mark the current position as the target of `label`.
    pub fn bind_label(&mut self, label: Label) {
        self.labels.insert(label, self.instrs.len());
    }

    /// Register an exception region over `[start, end)` with `handler`.
    pub fn add_exception_region(&mut self, start: Label, end: Label, handler: Label, depth: u32) {
        self.regions.push(PendingRegion {
            start,
            end,
            handler,
            depth,
        });
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit an instruction with a literal operand.
    pub fn emit(&mut self, op: Opcode, arg: u32) {
        self.instrs.push(PendingInstr {
            op,
            arg: InstrArg::Imm(arg),
            line: self.current_line,
        });
    }

    /// Emit a jump to a label.
    pub fn emit_jump(&mut self, op: Opcode, target: Label) {
        debug_assert!(op.is_jump());
        self.instrs.push(PendingInstr {
            op,
            arg: InstrArg::Target(target),
            line: self.current_line,
        });
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Assemble the unit.
    ///
    /// Operand widths depend on final offsets, which depend on operand
    /// widths; widths only grow, so iterating to a fixpoint terminates.
    pub fn finish(self) -> CodeUnit {
        let n = self.instrs.len();

        // Instruction index each label resolves to (n = end of code).
        let resolve = |label: Label| -> usize {
            *self
                .labels
                .get(&label)
                .expect("unbound label in code builder")
        };

        let mut widths: Vec<u32> = self
            .instrs
            .iter()
            .map(|i| match i.arg {
                InstrArg::Imm(arg) => encoded_len(arg, 0),
                InstrArg::Target(_) => encoded_len(0, 0),
            })
            .collect();

        let mut offsets: Vec<u32> = vec![0; n + 1];
        let mut args: Vec<u32> = vec![0; n];

        loop {
            let mut off = 0;
            for i in 0..n {
                offsets[i] = off;
                off += widths[i];
            }
            offsets[n] = off;

            let mut grew = false;
            for (i, instr) in self.instrs.iter().enumerate() {
                let arg = match instr.arg {
                    InstrArg::Imm(arg) => arg,
                    InstrArg::Target(label) => {
                        let target_off = offsets[resolve(label)];
                        if instr.op.is_relative_jump() {
                            let end = offsets[i] + widths[i];
                            debug_assert!(target_off >= end, "backward relative jump");
                            target_off - end
                        } else {
                            target_off
                        }
                    }
                };
                args[i] = arg;

                let needed = encoded_len(arg, 0);
                if needed > widths[i] {
                    widths[i] = needed;
                    grew = true;
                }
            }

            if !grew {
                break;
            }
        }

        // Emit bytes.
        let mut bytes = Vec::with_capacity(offsets[n] as usize);
        for (i, instr) in self.instrs.iter().enumerate() {
            let ext = ((widths[i] / 2) - 1) as u8;
            bytes.extend(decode::encode(instr.op, args[i], ext));
        }

        // Line table: one entry per run of instructions on a line.
        let mut line_table = Vec::new();
        let mut run_start = 0u32;
        let mut run_line = None;
        for (i, instr) in self.instrs.iter().enumerate() {
            match run_line {
                None => run_line = Some(instr.line),
                Some(line) if line != instr.line => {
                    line_table.push(LineEntry {
                        start: run_start,
                        end: offsets[i],
                        line,
                    });
                    run_start = offsets[i];
                    run_line = Some(instr.line);
                }
                _ => {}
            }
        }
        if let Some(line) = run_line {
            line_table.push(LineEntry {
                start: run_start,
                end: offsets[n],
                line,
            });
        }

        // Exception table, ordered by start offset.
        let mut exception_table: Vec<ExceptionEntry> = self
            .regions
            .iter()
            .map(|r| ExceptionEntry {
                start: offsets[resolve(r.start)],
                end: offsets[resolve(r.end)],
                handler: offsets[resolve(r.handler)],
                depth: r.depth,
            })
            .collect();
        exception_table.sort_by_key(|e| (e.start, e.end));

        let stack_size = decode::calc_max_stack(&bytes);

        CodeUnit {
            name: self.name,
            qualname: self.qualname,
            filename: self.filename,
            first_line: self.first_line,
            code: bytes.into(),
            consts: self.consts.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            locals: self.locals.into_boxed_slice(),
            freevars: Box::new([]),
            cellvars: Box::new([]),
            arg_count: self.arg_count,
            stack_size,
            flags: self.flags,
            line_table: line_table.into_boxed_slice(),
            exception_table: exception_table.into_boxed_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode::unpack;

    #[test]
    fn test_simple_unit() {
        let mut b = CodeBuilder::new("f", "test.wsp");
        b.set_line(1);
        let c = b.add_const(Value::Int(42));
        b.emit(Opcode::LoadConst, c);
        b.emit(Opcode::Return, 0);
        let unit = b.finish();

        assert_eq!(&*unit.name, "f");
        let instrs = unit.instructions();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode(), Some(Opcode::LoadConst));
        assert_eq!(unit.stack_size, 1);
    }

    #[test]
    fn test_constant_deduplication() {
        let mut b = CodeBuilder::new("f", "test.wsp");
        let a = b.add_const(Value::Int(1));
        let c = b.add_const(Value::Int(1));
        let d = b.add_const(Value::Int(2));
        assert_eq!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_labels_resolve() {
        let mut b = CodeBuilder::new("loop", "test.wsp");
        b.set_line(1);
        let top = b.create_label();
        let end = b.create_label();
        let t = b.add_const(Value::Bool(true));

        b.bind_label(top);
        b.emit(Opcode::LoadConst, t);
        b.emit_jump(Opcode::JumpIfFalse, end);
        b.emit_jump(Opcode::Jump, top);
        b.bind_label(end);
        b.emit(Opcode::LoadConst, 0);
        b.emit(Opcode::Return, 0);

        let unit = b.finish();
        let instrs: Vec<_> = unpack(&unit.code.snapshot()).collect();
        // JumpIfFalse targets the LoadConst after the loop.
        assert_eq!(instrs[1].arg, instrs[3].offset);
        // Jump targets the top.
        assert_eq!(instrs[2].arg, 0);
    }

    #[test]
    fn test_wide_const_index_relaxation() {
        let mut b = CodeBuilder::new("wide", "test.wsp");
        b.set_line(1);
        // Force a constant index that needs a prefix.
        for i in 0..300 {
            b.add_const(Value::Int(i));
        }
        let end = b.create_label();
        b.emit_jump(Opcode::Jump, end);
        b.emit(Opcode::LoadConst, 299);
        b.bind_label(end);
        b.emit(Opcode::Return, 0);

        let unit = b.finish();
        let instrs: Vec<_> = unpack(&unit.code.snapshot()).collect();
        assert_eq!(instrs[1].arg, 299);
        assert_eq!(instrs[1].len, 4); // one prefix
        // Jump lands exactly on the Return boundary.
        assert_eq!(instrs[0].arg, instrs[2].offset);
    }

    #[test]
    fn test_line_table_runs() {
        let mut b = CodeBuilder::new("f", "test.wsp");
        b.set_line(1);
        b.emit(Opcode::Nop, 0);
        b.set_line(2);
        b.emit(Opcode::Nop, 0);
        b.emit(Opcode::Nop, 0);
        b.set_line(0);
        b.emit(Opcode::Nop, 0);
        let unit = b.finish();

        assert_eq!(unit.line_table.len(), 3);
        assert_eq!(unit.line_table[0].line, 1);
        assert_eq!(unit.line_table[1].line, 2);
        assert_eq!(unit.line_table[1].start, 2);
        assert_eq!(unit.line_table[1].end, 6);
        assert_eq!(unit.line_table[2].line, 0);
    }

    #[test]
    fn test_exception_region() {
        let mut b = CodeBuilder::new("t", "test.wsp");
        b.set_line(1);
        let start = b.create_label();
        let end = b.create_label();
        let handler = b.create_label();

        b.bind_label(start);
        b.emit(Opcode::Nop, 0);
        b.bind_label(end);
        b.emit(Opcode::Return, 0);
        b.bind_label(handler);
        b.emit(Opcode::Return, 0);
        b.add_exception_region(start, end, handler, 0);

        let unit = b.finish();
        assert_eq!(unit.exception_table.len(), 1);
        let e = unit.exception_table[0];
        assert_eq!(e.start, 0);
        assert_eq!(e.end, 2);
        assert_eq!(e.handler, 4);
    }

    #[test]
    fn test_local_interning() {
        let mut b = CodeBuilder::new("f", "test.wsp");
        let x = b.define_local("x");
        let y = b.define_local("y");
        assert_eq!(b.define_local("x"), x);
        assert_eq!(b.lookup_local("y"), Some(y));
        assert_eq!(b.lookup_local("z"), None);
    }
}
