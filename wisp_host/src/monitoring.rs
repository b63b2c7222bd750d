//! Structured monitoring API.
//!
//! Tools register callbacks for execution events; the interpreter
//! fires them as guest code runs. A callback's return value can
//! disable further notifications for that particular location, which
//! lets observers pay for an event only once.
//!
//! One tool may be registered at a time. Events are delivered only for
//! code units explicitly enabled via [`Monitoring::set_local_events`].

use crate::bytecode::{CodeId, CodeUnit};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// What a callback tells the host to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Keep delivering this event at this location.
    Continue,
    /// Stop delivering this event at this location.
    Disable,
}

/// Callback for LINE events: `(code, line)`.
pub type LineHook = Arc<dyn Fn(&Arc<CodeUnit>, u32) -> HookAction + Send + Sync>;

/// Callback for branch events: `(code, source_line, destination_line)`.
pub type BranchHook = Arc<dyn Fn(&Arc<CodeUnit>, u32, u32) -> HookAction + Send + Sync>;

/// Event registry and delivery state.
pub struct Monitoring {
    /// Registered tool name, if any.
    tool: Mutex<Option<Arc<str>>>,
    /// LINE callback.
    line_hook: Mutex<Option<LineHook>>,
    /// BRANCH_TAKEN callback.
    branch_taken_hook: Mutex<Option<BranchHook>>,
    /// BRANCH_NOT_TAKEN callback.
    branch_not_taken_hook: Mutex<Option<BranchHook>>,
    /// Code units events are enabled for.
    enabled: DashMap<CodeId, ()>,
    /// Locations disabled by a `Disable` return.
    disabled_lines: DashMap<(CodeId, u32), ()>,
    disabled_branches: DashMap<(CodeId, u32, u32), ()>,
}

impl Monitoring {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tool: Mutex::new(None),
            line_hook: Mutex::new(None),
            branch_taken_hook: Mutex::new(None),
            branch_not_taken_hook: Mutex::new(None),
            enabled: DashMap::new(),
            disabled_lines: DashMap::new(),
            disabled_branches: DashMap::new(),
        }
    }

    // =========================================================================
    // Tool registration
    // =========================================================================

    /// Claim the monitoring slot for `name`.
    ///
    /// Returns false if another tool already holds it.
    pub fn use_tool(&self, name: impl Into<Arc<str>>) -> bool {
        let mut tool = self.tool.lock();
        match &*tool {
            Some(_) => false,
            None => {
                *tool = Some(name.into());
                true
            }
        }
    }

    /// The registered tool name, if any.
    pub fn tool(&self) -> Option<Arc<str>> {
        self.tool.lock().clone()
    }

    /// Release the monitoring slot and all callbacks and state.
    pub fn free_tool(&self) {
        *self.tool.lock() = None;
        *self.line_hook.lock() = None;
        *self.branch_taken_hook.lock() = None;
        *self.branch_not_taken_hook.lock() = None;
        self.enabled.clear();
        self.disabled_lines.clear();
        self.disabled_branches.clear();
    }

    /// Register the LINE callback.
    pub fn register_line_hook(&self, hook: LineHook) {
        *self.line_hook.lock() = Some(hook);
    }

    /// Register the BRANCH_TAKEN callback.
    pub fn register_branch_taken_hook(&self, hook: BranchHook) {
        *self.branch_taken_hook.lock() = Some(hook);
    }

    /// Register the BRANCH_NOT_TAKEN callback.
    pub fn register_branch_not_taken_hook(&self, hook: BranchHook) {
        *self.branch_not_taken_hook.lock() = Some(hook);
    }

    /// Enable event delivery for a code unit.
    pub fn set_local_events(&self, code: CodeId) {
        self.enabled.insert(code, ());
    }

    /// Whether events are enabled for a code unit.
    #[inline]
    pub fn events_enabled(&self, code: CodeId) -> bool {
        self.enabled.contains_key(&code)
    }

    // =========================================================================
    // Delivery (called by the interpreter)
    // =========================================================================

    /// Whether any delivery work could be needed for `code`.
    #[inline]
    pub fn is_active_for(&self, code: CodeId) -> bool {
        self.tool.lock().is_some() && self.enabled.contains_key(&code)
    }

    /// Fire a LINE event.
    pub fn fire_line(&self, code: &Arc<CodeUnit>, line: u32) {
        let id = CodeId::of(code);
        if self.disabled_lines.contains_key(&(id, line)) {
            return;
        }
        let hook = self.line_hook.lock().clone();
        if let Some(hook) = hook {
            if hook(code, line) == HookAction::Disable {
                self.disabled_lines.insert((id, line), ());
            }
        }
    }

    /// Fire a BRANCH_TAKEN or BRANCH_NOT_TAKEN event.
    pub fn fire_branch(&self, code: &Arc<CodeUnit>, src_line: u32, dst_line: u32, taken: bool) {
        let id = CodeId::of(code);
        if self.disabled_branches.contains_key(&(id, src_line, dst_line)) {
            return;
        }
        let hook = if taken {
            self.branch_taken_hook.lock().clone()
        } else {
            self.branch_not_taken_hook.lock().clone()
        };
        if let Some(hook) = hook {
            if hook(code, src_line, dst_line) == HookAction::Disable {
                self.disabled_branches.insert((id, src_line, dst_line), ());
            }
        }
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Monitoring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitoring")
            .field("tool", &self.tool())
            .field("enabled_codes", &self.enabled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeFlags;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dummy_code() -> Arc<CodeUnit> {
        Arc::new(CodeUnit {
            name: "m".into(),
            qualname: "m".into(),
            filename: "m.wsp".into(),
            first_line: 1,
            code: vec![].into(),
            consts: Box::new([]),
            names: Box::new([]),
            locals: Box::new([]),
            freevars: Box::new([]),
            cellvars: Box::new([]),
            arg_count: 0,
            stack_size: 0,
            flags: CodeFlags::NONE,
            line_table: Box::new([]),
            exception_table: Box::new([]),
        })
    }

    #[test]
    fn test_tool_slot_exclusive() {
        let mon = Monitoring::new();
        assert!(mon.use_tool("one"));
        assert!(!mon.use_tool("two"));
        assert_eq!(mon.tool().as_deref(), Some("one"));
        mon.free_tool();
        assert!(mon.use_tool("two"));
    }

    #[test]
    fn test_disable_suppresses_further_events() {
        let mon = Monitoring::new();
        mon.use_tool("t");
        let code = dummy_code();
        mon.set_local_events(code.id());

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        mon.register_line_hook(Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            HookAction::Disable
        }));

        mon.fire_line(&code, 3);
        mon.fire_line(&code, 3);
        mon.fire_line(&code, 4);
        assert_eq!(count.load(Ordering::SeqCst), 2); // 3 disabled after first
    }

    #[test]
    fn test_branch_events_keyed_by_edge() {
        let mon = Monitoring::new();
        mon.use_tool("t");
        let code = dummy_code();
        mon.set_local_events(code.id());

        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        mon.register_branch_taken_hook(Arc::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
            HookAction::Disable
        }));

        mon.fire_branch(&code, 3, 4, true);
        mon.fire_branch(&code, 3, 4, true);
        mon.fire_branch(&code, 3, 6, true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_events_enabled_gate() {
        let mon = Monitoring::new();
        mon.use_tool("t");
        let code = dummy_code();
        assert!(!mon.is_active_for(code.id()));
        mon.set_local_events(code.id());
        assert!(mon.is_active_for(code.id()));
    }
}
