//! Monitoring backend.
//!
//! On hosts that expose the structured monitoring API, coverage is
//! collected by callback instead of bytecode rewriting: each LINE or
//! branch event records its key and returns the disable sentinel, so
//! the host stops reporting that location. That buys the same
//! pay-once amortization as deinstrumentation, with the host footing
//! the bill.
//!
//! The pre-instrumenter is not used here; branch edges are reported
//! natively by the interpreter and enumerated statically by scanning
//! conditional jumps.

use crate::error::{EngineError, EngineResult};
use crate::key::CoverageKey;
use crate::probe::ProbeSink;
use rustc_hash::FxHashSet;
use std::sync::{Arc, Weak};
use wisp_host::bytecode::decode;
use wisp_host::{CodeUnit, HookAction, Runtime};

/// Monitoring tool identifier.
pub const TOOL_NAME: &str = "wispcover";

/// Register LINE (and, in branch mode, branch) callbacks that feed the
/// collector through the probe sink capability.
pub fn install_callbacks(
    runtime: &Runtime,
    sink: Weak<dyn ProbeSink>,
    branch: bool,
) -> EngineResult<()> {
    let mon = runtime.monitoring();
    if !mon.use_tool(TOOL_NAME) && mon.tool().as_deref() != Some(TOOL_NAME) {
        return Err(EngineError::config(
            "monitoring tool slot already held by another tool",
        ));
    }

    let line_sink = sink.clone();
    mon.register_line_hook(Arc::new(move |code, line| {
        if let Some(s) = line_sink.upgrade() {
            s.record_key(&code.filename, CoverageKey::Line(line));
        }
        HookAction::Disable
    }));

    if branch {
        let taken_sink = sink.clone();
        mon.register_branch_taken_hook(Arc::new(move |code, src, dst| {
            record_branch(&taken_sink, code, src, dst)
        }));
        let not_taken_sink = sink;
        mon.register_branch_not_taken_hook(Arc::new(move |code, src, dst| {
            record_branch(&not_taken_sink, code, src, dst)
        }));
    }
    Ok(())
}

fn record_branch(
    sink: &Weak<dyn ProbeSink>,
    code: &Arc<CodeUnit>,
    src: u32,
    dst: u32,
) -> HookAction {
    if src != 0 {
        if let Some(s) = sink.upgrade() {
            s.record_key(&code.filename, CoverageKey::Branch(src, dst));
        }
    }
    HookAction::Disable
}

/// Enumerate the branch edges a code unit can take, as
/// `(source_line, destination_line)` pairs; destination 0 marks an
/// edge leaving the unit. Each conditional jump contributes its taken
/// and fall-through edges.
pub fn possible_branches(code: &Arc<CodeUnit>) -> Vec<(u32, u32)> {
    let bytes = code.code.snapshot();
    let mut edges = FxHashSet::default();

    for instr in decode::unpack(&bytes) {
        let Some(op) = instr.opcode() else { continue };
        if !op.is_conditional_jump() {
            continue;
        }
        let src = code.line_for_offset(instr.offset).unwrap_or(0);
        if src == 0 {
            continue;
        }
        let target = if op.is_relative_jump() {
            instr.end() + instr.arg
        } else {
            instr.arg
        };
        edges.insert((src, code.line_for_offset(target).unwrap_or(0)));
        edges.insert((src, code.line_for_offset(instr.end()).unwrap_or(0)));
    }

    let mut out: Vec<_> = edges.into_iter().collect();
    out.sort_unstable();
    out
}
