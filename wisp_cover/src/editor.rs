//! Bytecode editor.
//!
//! Rewrites a code unit to call a probe before chosen locations while
//! preserving the unit's semantics: jump targets, the line table, the
//! exception-region table, and the stack-size requirement are all
//! repaired.
//!
//! The editor decodes the instruction stream into a list whose jump
//! operands are replaced by element indices, plans insertions against
//! those indices, and re-emits bytes only at the end. Working on the
//! decoded list (rather than raw offsets) makes it impossible to
//! insert between an `ExtendedArg` prefix and its instruction.
//!
//! Probe inserts have a fixed length regardless of constant-pool index
//! magnitude: the two `LoadConst` instructions always carry three
//! `ExtendedArg` prefixes. The leading `Nop` holds the remaining
//! insert length as its operand, so disabling a probe is a single-byte
//! opcode rewrite (`Nop` -> `JumpForward`) that changes no sizes.

use crate::error::{EngineError, EngineResult};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use wisp_host::bytecode::{decode, CodeUnit, ExceptionEntry, LineEntry, Opcode};
use wisp_host::Value;

/// Fixed byte length of one probe insert:
/// `Nop` + 2x prefixed `LoadConst` + `Call 1` + `Pop`.
pub const PROBE_INSERT_LEN: u32 = 22;

/// Additional operand stack needed while a probe call runs.
const PROBE_STACK_COST: u16 = 2;

/// One decoded, editable instruction.
#[derive(Debug, Clone, Copy)]
struct EditInstr {
    op: Opcode,
    /// Literal operand; recomputed from `target` for jumps.
    arg: u32,
    /// For jumps, the index of the target element (original indices
    /// during decode, final indices after planning).
    target: Option<usize>,
    /// Source line label (0 = synthetic).
    line: u32,
    /// Forced minimum number of `ExtendedArg` prefixes.
    min_ext: u8,
}

/// A `LoadConst` + `StoreGlobal` pair assigning a constant to a known
/// sentinel name.
#[derive(Debug, Clone, Copy)]
pub struct MarkerSite {
    /// Index of the `LoadConst`.
    pub load_index: usize,
    /// Index of the `StoreGlobal`.
    pub store_index: usize,
    /// Constant-pool index the marker loads.
    pub const_index: u32,
}

/// A planned probe insertion.
#[derive(Debug, Clone, Copy)]
struct PlannedInsert {
    signal_idx: u32,
    capsule_idx: u32,
    /// Number of original instructions the insert replaces (0 for a
    /// pure insertion before the anchor instruction).
    replaced: usize,
    /// Line label for the inserted instructions.
    line: u32,
    /// Plan id, indexing the offsets returned by `finish`.
    id: usize,
}

/// Bytecode editor for one code unit.
#[derive(Debug)]
pub struct Editor {
    source: Arc<CodeUnit>,
    instrs: Vec<EditInstr>,
    /// Decoded byte offset of each original instruction, plus the
    /// end-of-code offset. Original encodings may carry padding
    /// prefixes, so these are recorded, never recomputed.
    orig_offsets: Vec<u32>,
    consts: Vec<Value>,
    consts_changed: bool,
    /// Planned inserts keyed by anchor instruction index.
    inserts: FxHashMap<usize, PlannedInsert>,
    next_plan_id: usize,
}

impl Editor {
    /// Decode a code unit and resolve jump targets.
    ///
    /// Fails with a `BytecodeError` if the stream contains an invalid
    /// opcode or a jump that does not land on an instruction boundary.
    pub fn new(code: &Arc<CodeUnit>) -> EngineResult<Self> {
        let bytes = code.code.snapshot();
        let unit = || code.qualname.to_string();

        let mut instrs = Vec::new();
        let mut offset_to_index = FxHashMap::default();
        let mut raw = Vec::new();

        for instr in decode::unpack(&bytes) {
            let op = instr.opcode().ok_or_else(|| {
                EngineError::bytecode(
                    format!("invalid opcode {:#04x} at offset {}", instr.op, instr.offset),
                    unit(),
                )
            })?;
            offset_to_index.insert(instr.offset, instrs.len());
            raw.push(instr);
            instrs.push(EditInstr {
                op,
                arg: instr.arg,
                target: None,
                line: raw_line_at(code, instr.offset),
                min_ext: 0,
            });
        }

        let code_len = bytes.len() as u32;

        // Resolve jump operands to element indices.
        for (i, instr) in raw.iter().enumerate() {
            let op = instrs[i].op;
            if !op.is_jump() {
                continue;
            }
            let target_offset = if op.is_relative_jump() {
                instr.end() + instr.arg
            } else {
                instr.arg
            };
            let target_index = if target_offset == code_len {
                instrs.len()
            } else {
                *offset_to_index.get(&target_offset).ok_or_else(|| {
                    EngineError::bytecode(
                        format!(
                            "jump at offset {} targets mid-instruction offset {}",
                            instr.offset, target_offset
                        ),
                        unit(),
                    )
                })?
            };
            instrs[i].target = Some(target_index);
        }

        let mut orig_offsets: Vec<u32> = raw.iter().map(|r| r.offset).collect();
        orig_offsets.push(code_len);

        Ok(Self {
            source: code.clone(),
            instrs,
            orig_offsets,
            consts: code.consts.to_vec(),
            consts_changed: false,
            inserts: FxHashMap::default(),
            next_plan_id: 0,
        })
    }

    // =========================================================================
    // Constant pool
    // =========================================================================

    /// Replace a constant.
    pub fn set_const(&mut self, index: u32, value: Value) {
        self.consts[index as usize] = value;
        self.consts_changed = true;
    }

    /// Append a constant, returning its index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        self.consts.push(value);
        self.consts_changed = true;
        (self.consts.len() - 1) as u32
    }

    /// Read a constant.
    pub fn const_at(&self, index: u32) -> Option<&Value> {
        self.consts.get(index as usize)
    }

    // =========================================================================
    // Site discovery
    // =========================================================================

    /// Instruction indices starting each source line, with the line.
    ///
    /// `line_set` restricts discovery to the given lines; `None` means
    /// every line reachable from the line table. One entry per
    /// line-table run, in code order; a line that code jumps back to
    /// re-enters its probe on every pass.
    pub fn line_start_sites(&self, line_set: Option<&FxHashSet<u32>>) -> Vec<(usize, u32)> {
        let mut sites = Vec::new();
        for entry in self.source.line_table.iter() {
            if entry.line == 0 || entry.start >= entry.end {
                continue;
            }
            if line_set.is_some_and(|set| !set.contains(&entry.line)) {
                continue;
            }
            if let Ok(index) = self.orig_offsets.binary_search(&entry.start) {
                if index < self.instrs.len() {
                    sites.push((index, entry.line));
                }
            }
        }
        sites
    }

    /// Find `LoadConst` instructions immediately followed by a
    /// `StoreGlobal` of `name`.
    pub fn find_marker_assignments(&self, name: &str) -> Vec<MarkerSite> {
        let mut sites = Vec::new();
        for i in 0..self.instrs.len().saturating_sub(1) {
            let load = &self.instrs[i];
            let store = &self.instrs[i + 1];
            if load.op == Opcode::LoadConst
                && store.op == Opcode::StoreGlobal
                && self
                    .source
                    .names
                    .get(store.arg as usize)
                    .is_some_and(|n| &**n == name)
            {
                sites.push(MarkerSite {
                    load_index: i,
                    store_index: i + 1,
                    const_index: load.arg,
                });
            }
        }
        sites
    }

    // =========================================================================
    // Planning
    // =========================================================================

    /// Insert a probe call before the instruction at `index`.
    ///
    /// Returns a plan id; `finish` reports the insert's byte offset at
    /// that position of its offsets vector.
    pub fn insert_probe_call(&mut self, index: usize, signal_idx: u32, capsule_idx: u32) -> usize {
        let line = self.instrs[index].line;
        self.plan(index, signal_idx, capsule_idx, 0, line)
    }

    /// Replace a marker assignment with a probe call.
    pub fn replace_marker_with_probe(
        &mut self,
        site: &MarkerSite,
        signal_idx: u32,
        capsule_idx: u32,
    ) -> usize {
        let line = self.instrs[site.load_index].line;
        self.plan(
            site.load_index,
            signal_idx,
            capsule_idx,
            site.store_index - site.load_index + 1,
            line,
        )
    }

    fn plan(
        &mut self,
        index: usize,
        signal_idx: u32,
        capsule_idx: u32,
        replaced: usize,
        line: u32,
    ) -> usize {
        let id = self.next_plan_id;
        self.next_plan_id += 1;
        let prev = self.inserts.insert(
            index,
            PlannedInsert {
                signal_idx,
                capsule_idx,
                replaced,
                line,
                id,
            },
        );
        debug_assert!(prev.is_none(), "two inserts planned at one instruction");
        id
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Apply the plan and build the rewritten unit.
    ///
    /// Returns the new unit and the byte offset of each insert, indexed
    /// by plan id.
    pub fn finish(self) -> EngineResult<(Arc<CodeUnit>, Vec<u32>)> {
        let Editor {
            source,
            instrs,
            orig_offsets,
            consts,
            consts_changed,
            inserts,
            next_plan_id: _,
        } = self;
        let src = &source;
        let n = instrs.len();

        if inserts.is_empty() && !consts_changed {
            return Ok((source.clone(), Vec::new()));
        }

        // Build the final instruction list. For every original index,
        // record the first element emitted at that position (jumps and
        // handlers land there, re-entering any probe) and the element
        // of the original instruction itself (exception-region starts
        // skip past inserts).
        let mut out: Vec<EditInstr> = Vec::with_capacity(n + inserts.len() * 5);
        let mut insert_heads: Vec<(usize, usize)> = Vec::new(); // (plan id, head element)
        let mut block_start = vec![0usize; n + 1];
        let mut own_index = vec![0usize; n + 1];

        let mut i = 0usize;
        while i < n {
            block_start[i] = out.len();
            let mut skipped = 0usize;
            if let Some(plan) = inserts.get(&i) {
                insert_heads.push((plan.id, out.len()));
                push_probe_sequence(&mut out, plan);
                skipped = plan.replaced;
            }
            own_index[i] = out.len();
            if skipped > 0 {
                // Replaced instructions vanish; anything that pointed
                // at them resolves to the probe head.
                for k in i..(i + skipped).min(n) {
                    block_start[k] = block_start[i];
                    own_index[k] = block_start[i];
                }
                i += skipped;
            } else {
                out.push(instrs[i]);
                i += 1;
            }
        }
        block_start[n] = out.len();
        own_index[n] = out.len();

        // Remap jump targets from original indices to final indices.
        for instr in out.iter_mut() {
            if let Some(orig_target) = instr.target {
                instr.target = Some(block_start[orig_target]);
            }
        }

        // Relaxation: operand widths depend on offsets and vice versa;
        // widths only grow, so this converges (typically <= 3 passes).
        let m = out.len();
        let mut widths: Vec<u32> = out
            .iter()
            .map(|instr| decode::encoded_len(instr.arg, instr.min_ext))
            .collect();
        let mut offsets: Vec<u32> = vec![0; m + 1];
        let mut args: Vec<u32> = vec![0; m];

        loop {
            let mut off = 0;
            for j in 0..m {
                offsets[j] = off;
                off += widths[j];
            }
            offsets[m] = off;

            let mut grew = false;
            for (j, instr) in out.iter().enumerate() {
                let arg = match instr.target {
                    None => instr.arg,
                    Some(t) => {
                        let target_off = offsets[t];
                        if instr.op.is_relative_jump() {
                            let end = offsets[j] + widths[j];
                            if target_off < end {
                                return Err(EngineError::bytecode(
                                    "backward relative jump after rewrite",
                                    src.qualname.to_string(),
                                ));
                            }
                            target_off - end
                        } else {
                            target_off
                        }
                    }
                };
                args[j] = arg;
                let needed = decode::encoded_len(arg, instr.min_ext);
                if needed > widths[j] {
                    widths[j] = needed;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        // Emit bytes.
        let mut bytes = Vec::with_capacity(offsets[m] as usize);
        for (j, instr) in out.iter().enumerate() {
            let ext = ((widths[j] / 2) - 1) as u8;
            bytes.extend(decode::encode(instr.op, args[j], ext));
        }

        // Line table regenerated from per-element labels: every
        // inserted byte carries the line of the instruction it guards.
        let line_table = rebuild_line_table(&out, &offsets);

        // Exception regions remapped through the index maps.
        let exception_table =
            remap_exception_table(src, &orig_offsets, &block_start, &own_index, &offsets)?;

        let stack_size = if inserts.is_empty() {
            src.stack_size
        } else {
            src.stack_size + PROBE_STACK_COST
        };

        let new_unit = Arc::new(CodeUnit {
            name: src.name.clone(),
            qualname: src.qualname.clone(),
            filename: src.filename.clone(),
            first_line: src.first_line,
            code: bytes.into(),
            consts: consts.into_boxed_slice(),
            names: src.names.clone(),
            locals: src.locals.clone(),
            freevars: src.freevars.clone(),
            cellvars: src.cellvars.clone(),
            arg_count: src.arg_count,
            stack_size,
            flags: src.flags,
            line_table: line_table.into_boxed_slice(),
            exception_table: exception_table.into_boxed_slice(),
        });

        let mut insert_offsets = vec![0u32; insert_heads.len()];
        for (id, head) in insert_heads {
            insert_offsets[id] = offsets[head];
        }
        Ok((new_unit, insert_offsets))
    }

    /// Disable probes in place: rewrite each insert's leading `Nop`
    /// into a `JumpForward` spanning the insert.
    ///
    /// `offsets` are insert head offsets; `new_consts` optionally
    /// replaces the pool (deinstrumented inner units). Sizes are
    /// preserved and nothing is deleted. Returns `None` when the unit
    /// is unchanged, making repeated deinstrumentation a no-op.
    pub fn deinstrument(
        code: &Arc<CodeUnit>,
        offsets: &[u32],
        new_consts: Option<Vec<Value>>,
    ) -> Option<Arc<CodeUnit>> {
        let mut bytes = code.code.snapshot();
        let mut changed = false;

        for &offset in offsets {
            let slot = offset as usize;
            if bytes.get(slot) == Some(&(Opcode::Nop as u8)) {
                bytes[slot] = Opcode::JumpForward as u8;
                changed = true;
            }
        }

        if !changed && new_consts.is_none() {
            return None;
        }

        let consts = match new_consts {
            Some(consts) => consts.into_boxed_slice(),
            None => code.consts.to_vec().into_boxed_slice(),
        };

        Some(Arc::new(CodeUnit {
            name: code.name.clone(),
            qualname: code.qualname.clone(),
            filename: code.filename.clone(),
            first_line: code.first_line,
            code: bytes.into(),
            consts,
            names: code.names.clone(),
            locals: code.locals.clone(),
            freevars: code.freevars.clone(),
            cellvars: code.cellvars.clone(),
            arg_count: code.arg_count,
            stack_size: code.stack_size,
            flags: code.flags,
            line_table: code.line_table.to_vec().into_boxed_slice(),
            exception_table: code.exception_table.to_vec().into_boxed_slice(),
        }))
    }
}

/// Emit the fixed-shape probe sequence.
fn push_probe_sequence(out: &mut Vec<EditInstr>, plan: &PlannedInsert) {
    let line = plan.line;
    // The Nop operand is the distance a JumpForward patch must cover.
    out.push(EditInstr {
        op: Opcode::Nop,
        arg: PROBE_INSERT_LEN - 2,
        target: None,
        line,
        min_ext: 0,
    });
    out.push(EditInstr {
        op: Opcode::LoadConst,
        arg: plan.signal_idx,
        target: None,
        line,
        min_ext: 3,
    });
    out.push(EditInstr {
        op: Opcode::LoadConst,
        arg: plan.capsule_idx,
        target: None,
        line,
        min_ext: 3,
    });
    out.push(EditInstr {
        op: Opcode::Call,
        arg: 1,
        target: None,
        line,
        min_ext: 0,
    });
    out.push(EditInstr {
        op: Opcode::Pop,
        arg: 0,
        target: None,
        line,
        min_ext: 0,
    });
}

/// The line-table entry label covering `offset`, 0 included.
fn raw_line_at(code: &CodeUnit, offset: u32) -> u32 {
    code.line_table
        .iter()
        .find(|e| e.start <= offset && offset < e.end)
        .map(|e| e.line)
        .unwrap_or(0)
}

fn rebuild_line_table(out: &[EditInstr], offsets: &[u32]) -> Vec<LineEntry> {
    let mut table = Vec::new();
    let mut run_start = 0u32;
    let mut run_line = None;
    for (j, instr) in out.iter().enumerate() {
        match run_line {
            None => run_line = Some(instr.line),
            Some(line) if line != instr.line => {
                table.push(LineEntry {
                    start: run_start,
                    end: offsets[j],
                    line,
                });
                run_start = offsets[j];
                run_line = Some(instr.line);
            }
            _ => {}
        }
    }
    if let Some(line) = run_line {
        table.push(LineEntry {
            start: run_start,
            end: offsets[out.len()],
            line,
        });
    }
    table
}

fn remap_exception_table(
    src: &CodeUnit,
    orig_offsets: &[u32],
    block_start: &[usize],
    own_index: &[usize],
    offsets: &[u32],
) -> EngineResult<Vec<ExceptionEntry>> {
    if src.exception_table.is_empty() {
        return Ok(Vec::new());
    }

    let index_of = |offset: u32, what: &str| -> EngineResult<usize> {
        orig_offsets.binary_search(&offset).map_err(|_| {
            EngineError::bytecode(
                format!("exception-region {} at non-instruction offset {}", what, offset),
                src.qualname.to_string(),
            )
        })
    };

    let mut table = Vec::with_capacity(src.exception_table.len());
    for entry in src.exception_table.iter() {
        // Starts skip probes inserted at the boundary (the probe runs
        // outside the region); ends likewise exclude them; handler
        // targets include them, like any jump target.
        let start = offsets[own_index[index_of(entry.start, "start")?]];
        let end = offsets[block_start[index_of(entry.end, "end")?]];
        let handler = offsets[block_start[index_of(entry.handler, "handler")?]];
        table.push(ExceptionEntry {
            start,
            end,
            handler,
            depth: entry.depth,
        });
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;
    use wisp_host::bytecode::CodeBuilder;

    /// Maximum extra operand stack one probe insert needs, computed
    /// from the sequence itself.
    fn probe_stack_cost() -> u16 {
        let mut insert: SmallVec<[u8; 24]> = SmallVec::new();
        insert.extend(decode::encode(Opcode::Nop, PROBE_INSERT_LEN - 2, 0));
        insert.extend(decode::encode(Opcode::LoadConst, 0, 3));
        insert.extend(decode::encode(Opcode::LoadConst, 0, 3));
        insert.extend(decode::encode(Opcode::Call, 1, 0));
        insert.extend(decode::encode(Opcode::Pop, 0, 0));
        assert_eq!(insert.len() as u32, PROBE_INSERT_LEN);
        decode::calc_max_stack(&insert)
    }

    fn simple_unit() -> Arc<CodeUnit> {
        // 1: x = 1
        // 2: x = 2
        let mut b = CodeBuilder::new("m", "t.wsp");
        b.set_line(1);
        let one = b.add_const(Value::Int(1));
        let x = b.add_name("x");
        b.emit(Opcode::LoadConst, one);
        b.emit(Opcode::StoreGlobal, x);
        b.set_line(2);
        let two = b.add_const(Value::Int(2));
        b.emit(Opcode::LoadConst, two);
        b.emit(Opcode::StoreGlobal, x);
        let none = b.add_const(Value::None);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        Arc::new(b.finish())
    }

    fn loop_unit() -> Arc<CodeUnit> {
        // 1: while x: (JumpIfFalse end)
        // 2:     pass
        //    jump back
        let mut b = CodeBuilder::new("m", "t.wsp");
        let top = b.create_label();
        let end = b.create_label();
        b.set_line(1);
        let x = b.add_name("x");
        b.bind_label(top);
        b.emit(Opcode::LoadGlobal, x);
        b.emit_jump(Opcode::JumpIfFalse, end);
        b.set_line(2);
        b.emit(Opcode::Nop, 0);
        b.emit_jump(Opcode::Jump, top);
        b.bind_label(end);
        b.set_line(3);
        let none = b.add_const(Value::None);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        Arc::new(b.finish())
    }

    fn dummy_capsule() -> Value {
        Value::Capsule(Arc::new(0u8))
    }

    #[test]
    fn test_probe_insert_len_constant() {
        assert_eq!(probe_stack_cost(), PROBE_STACK_COST);
    }

    #[test]
    fn test_instrument_fixed_insert_length() {
        let unit = simple_unit();
        let mut ed = Editor::new(&unit).unwrap();
        let signal = ed.add_const(dummy_capsule());
        let sites = ed.line_start_sites(None);
        assert_eq!(sites.len(), 2);
        for (index, _line) in sites {
            let capsule = ed.add_const(dummy_capsule());
            ed.insert_probe_call(index, signal, capsule);
        }
        let (new_unit, offsets) = ed.finish().unwrap();

        assert_eq!(offsets.len(), 2);
        // Inserts are exactly PROBE_INSERT_LEN apart from their bases.
        let grown = new_unit.code.len() - unit.code.len();
        assert_eq!(grown, 2 * PROBE_INSERT_LEN);
        // Each insert head is a Nop carrying the skip distance.
        for &off in &offsets {
            assert_eq!(new_unit.code.byte(off), Opcode::Nop as u8);
            assert_eq!(new_unit.code.byte(off + 1), (PROBE_INSERT_LEN - 2) as u8);
        }
        assert_eq!(new_unit.stack_size, unit.stack_size + PROBE_STACK_COST);
    }

    #[test]
    fn test_instrumented_lines_preserved() {
        let unit = simple_unit();
        let mut ed = Editor::new(&unit).unwrap();
        let signal = ed.add_const(dummy_capsule());
        for (index, _line) in ed.line_start_sites(None) {
            let capsule = ed.add_const(dummy_capsule());
            ed.insert_probe_call(index, signal, capsule);
        }
        let (new_unit, offsets) = ed.finish().unwrap();

        // Probe bytes inherit the guarded line.
        assert_eq!(new_unit.line_for_offset(offsets[0]), Some(1));
        assert_eq!(new_unit.line_for_offset(offsets[1]), Some(2));
        // Original lines survive.
        let lines: Vec<u32> = new_unit.lines().collect();
        assert_eq!(lines, vec![1, 2]);
    }

    #[test]
    fn test_jump_targets_reenter_probe() {
        let unit = loop_unit();
        let mut ed = Editor::new(&unit).unwrap();
        let signal = ed.add_const(dummy_capsule());
        for (index, _line) in ed.line_start_sites(None) {
            let capsule = ed.add_const(dummy_capsule());
            ed.insert_probe_call(index, signal, capsule);
        }
        let (new_unit, offsets) = ed.finish().unwrap();

        // The back-jump must target the line-1 probe head, so each
        // iteration re-fires the probe.
        let instrs = new_unit.instructions();
        let back_jump = instrs
            .iter()
            .find(|i| i.opcode() == Some(Opcode::Jump))
            .unwrap();
        assert_eq!(back_jump.arg, offsets[0]);

        // Every jump decodes to an instruction boundary.
        let starts: std::collections::HashSet<u32> =
            instrs.iter().map(|i| i.offset).collect();
        for i in &instrs {
            if let Some(op) = i.opcode() {
                if op.is_jump() {
                    let target = if op.is_relative_jump() {
                        i.end() + i.arg
                    } else {
                        i.arg
                    };
                    assert!(
                        target == new_unit.code.len() || starts.contains(&target),
                        "jump target {} not on a boundary",
                        target
                    );
                }
            }
        }
    }

    #[test]
    fn test_marker_replacement() {
        // Marker: LoadConst (3,4); StoreGlobal sentinel -- on line 0.
        let mut b = CodeBuilder::new("m", "t.wsp");
        b.set_line(1);
        b.emit(Opcode::Nop, 0);
        b.set_line(0);
        let pair = b.add_const(Value::tuple(vec![Value::Int(3), Value::Int(4)]));
        let sentinel = b.add_name("_branch_sentinel");
        b.emit(Opcode::LoadConst, pair);
        b.emit(Opcode::StoreGlobal, sentinel);
        b.set_line(2);
        let none = b.add_const(Value::None);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        let unit = Arc::new(b.finish());

        let mut ed = Editor::new(&unit).unwrap();
        let markers = ed.find_marker_assignments("_branch_sentinel");
        assert_eq!(markers.len(), 1);
        assert_eq!(
            ed.const_at(markers[0].const_index),
            Some(&Value::tuple(vec![Value::Int(3), Value::Int(4)]))
        );

        let signal = ed.add_const(dummy_capsule());
        ed.set_const(markers[0].const_index, dummy_capsule());
        ed.replace_marker_with_probe(&markers[0], signal, markers[0].const_index);
        let (new_unit, offsets) = ed.finish().unwrap();

        // The marker's 4 bytes became a 22-byte probe.
        assert_eq!(
            new_unit.code.len(),
            unit.code.len() - 4 + PROBE_INSERT_LEN
        );
        // No StoreGlobal of the sentinel remains.
        let markers_after = Editor::new(&new_unit)
            .unwrap()
            .find_marker_assignments("_branch_sentinel");
        assert!(markers_after.is_empty());
        // Probe bytes carry the marker's synthetic line.
        assert_eq!(new_unit.line_for_offset(offsets[0]), None);
    }

    #[test]
    fn test_exception_table_remap() {
        let mut b = CodeBuilder::new("m", "t.wsp");
        let start = b.create_label();
        let end = b.create_label();
        let handler = b.create_label();
        b.set_line(1);
        b.bind_label(start);
        b.emit(Opcode::Nop, 0);
        b.set_line(2);
        b.emit(Opcode::Nop, 0);
        b.bind_label(end);
        b.set_line(3);
        let none = b.add_const(Value::None);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        b.bind_label(handler);
        b.set_line(4);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        b.add_exception_region(start, end, handler, 0);
        let unit = Arc::new(b.finish());

        let mut ed = Editor::new(&unit).unwrap();
        let signal = ed.add_const(dummy_capsule());
        for (index, _line) in ed.line_start_sites(None) {
            let capsule = ed.add_const(dummy_capsule());
            ed.insert_probe_call(index, signal, capsule);
        }
        let (new_unit, offsets) = ed.finish().unwrap();

        let e = new_unit.exception_table[0];
        // Region start skips the probe inserted at the old start.
        assert_eq!(e.start, offsets[0] + PROBE_INSERT_LEN);
        // Handler target is the probe head of line 4.
        assert_eq!(e.handler, offsets[3]);
        // Region end excludes the probe inserted at the line-3 boundary.
        assert_eq!(e.end, offsets[2]);
        assert!(e.start < e.end);
    }

    #[test]
    fn test_deinstrument_patches_and_is_idempotent() {
        let unit = simple_unit();
        let mut ed = Editor::new(&unit).unwrap();
        let signal = ed.add_const(dummy_capsule());
        for (index, _line) in ed.line_start_sites(None) {
            let capsule = ed.add_const(dummy_capsule());
            ed.insert_probe_call(index, signal, capsule);
        }
        let (instrumented, offsets) = ed.finish().unwrap();

        let removed = Editor::deinstrument(&instrumented, &offsets, None).unwrap();
        assert_eq!(removed.code.len(), instrumented.code.len());
        for &off in &offsets {
            assert_eq!(removed.code.byte(off), Opcode::JumpForward as u8);
            assert_eq!(removed.code.byte(off + 1), (PROBE_INSERT_LEN - 2) as u8);
        }

        // A second pass changes nothing.
        assert!(Editor::deinstrument(&removed, &offsets, None).is_none());
    }

    #[test]
    fn test_finish_without_changes_returns_source() {
        let unit = simple_unit();
        let ed = Editor::new(&unit).unwrap();
        let (same, offsets) = ed.finish().unwrap();
        assert!(Arc::ptr_eq(&same, &unit));
        assert!(offsets.is_empty());
    }

    #[test]
    fn test_invalid_opcode_is_bytecode_error() {
        let unit = simple_unit();
        unit.code.patch_byte(0, 0xEE);
        let err = Editor::new(&unit).unwrap_err();
        assert!(matches!(err, EngineError::Bytecode { .. }));
    }
}
