//! Runtime object model and interpreter state.
//!
//! Modules, classes, functions, generators, and the `Runtime` that
//! ties them together. Function code pointers are swappable (behind a
//! mutex) so embedders can replace compiled units at run time; a
//! generator's saved frame is taken out of the object while the
//! generator executes, so a frame stored in a generator is dormant by
//! construction.

mod frame;
mod interp;

pub use frame::Frame;
pub use interp::Interp;

use crate::bytecode::{CodeId, CodeUnit};
use crate::error::{HostError, HostResult};
use crate::monitoring::Monitoring;
use crate::value::{NativeFn, Value};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::thread::ThreadId;

/// Maximum guest call depth before a `RecursionError`.
pub const MAX_RECURSION_DEPTH: usize = 500;

// =============================================================================
// Module
// =============================================================================

/// A loaded module: a named global namespace.
pub struct ModuleObject {
    /// Module name.
    pub name: Arc<str>,
    /// Global bindings.
    globals: Mutex<FxHashMap<Arc<str>, Value>>,
}

impl ModuleObject {
    /// Create an empty module.
    pub fn new(name: impl Into<Arc<str>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            globals: Mutex::new(FxHashMap::default()),
        })
    }

    /// Look up a global.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.lock().get(name).cloned()
    }

    /// Bind a global.
    pub fn set_global(&self, name: impl Into<Arc<str>>, value: Value) {
        self.globals.lock().insert(name.into(), value);
    }

    /// Run `f` with mutable access to the global bindings.
    pub fn with_globals_mut<R>(&self, f: impl FnOnce(&mut FxHashMap<Arc<str>, Value>) -> R) -> R {
        f(&mut self.globals.lock())
    }

    /// Snapshot the current global values.
    pub fn global_values(&self) -> Vec<Value> {
        self.globals.lock().values().cloned().collect()
    }
}

impl std::fmt::Debug for ModuleObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<module '{}'>", self.name)
    }
}

// =============================================================================
// Class
// =============================================================================

/// A class: a named attribute dictionary. Methods live in `attrs`.
pub struct ClassObject {
    /// Class name.
    pub name: Arc<str>,
    /// Attribute bindings.
    attrs: Mutex<FxHashMap<Arc<str>, Value>>,
}

impl ClassObject {
    /// Create an empty class.
    pub fn new(name: impl Into<Arc<str>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            attrs: Mutex::new(FxHashMap::default()),
        })
    }

    /// Look up an attribute.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.lock().get(name).cloned()
    }

    /// Bind an attribute.
    pub fn set_attr(&self, name: impl Into<Arc<str>>, value: Value) {
        self.attrs.lock().insert(name.into(), value);
    }

    /// Run `f` with mutable access to the attribute bindings.
    pub fn with_attrs_mut<R>(&self, f: impl FnOnce(&mut FxHashMap<Arc<str>, Value>) -> R) -> R {
        f(&mut self.attrs.lock())
    }
}

impl std::fmt::Debug for ClassObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<class '{}'>", self.name)
    }
}

// =============================================================================
// Function
// =============================================================================

/// A guest function: swappable code pointer, defaults, defining module.
pub struct FunctionObject {
    /// Function name.
    pub name: Arc<str>,
    /// Compiled code. Behind a lock so it can be replaced at run time;
    /// frames hold their own reference, so replacement never affects
    /// an activation already underway.
    code: Mutex<Arc<CodeUnit>>,
    /// Default values for trailing parameters.
    pub defaults: Vec<Value>,
    /// Module whose globals this function closes over.
    pub module: Arc<ModuleObject>,
}

impl FunctionObject {
    /// Create a function.
    pub fn new(
        code: Arc<CodeUnit>,
        module: Arc<ModuleObject>,
        defaults: Vec<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: code.name.clone(),
            code: Mutex::new(code),
            defaults,
            module,
        })
    }

    /// The current code unit.
    pub fn code(&self) -> Arc<CodeUnit> {
        self.code.lock().clone()
    }

    /// Swap the code unit in place.
    pub fn replace_code(&self, code: Arc<CodeUnit>) {
        *self.code.lock() = code;
    }
}

impl std::fmt::Debug for FunctionObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Execution state of a generator.
pub(crate) struct GenState {
    /// Saved frame while suspended; `None` while running or finished.
    pub(crate) frame: Option<Frame>,
    /// Whether the first resume has happened.
    pub(crate) started: bool,
    /// Whether the generator has returned.
    pub(crate) finished: bool,
}

/// A generator instance: a dormant frame awaiting resumption.
pub struct GeneratorObject {
    name: Arc<str>,
    pub(crate) state: Mutex<GenState>,
}

impl GeneratorObject {
    /// Create a suspended-at-start generator from a prepared frame.
    pub(crate) fn from_frame(name: Arc<str>, frame: Frame) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(GenState {
                frame: Some(frame),
                started: false,
                finished: false,
            }),
        })
    }

    /// The generator's name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Whether the generator has completed.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// The code of the dormant frame, if the generator is suspended.
    pub fn dormant_code(&self) -> Option<Arc<CodeUnit>> {
        self.state.lock().frame.as_ref().map(|f| f.code.clone())
    }

    /// Swap the dormant frame's code via `swap`, which maps the current
    /// unit to its replacement (or `None` to leave it).
    ///
    /// Does nothing if the generator is running or finished: a running
    /// generator's frame is checked out of the object, so this can
    /// never touch an executing frame.
    pub fn replace_dormant_code(
        &self,
        swap: &dyn Fn(&Arc<CodeUnit>) -> Option<Arc<CodeUnit>>,
    ) -> bool {
        let mut state = self.state.lock();
        if let Some(frame) = state.frame.as_mut() {
            if let Some(new_code) = swap(&frame.code) {
                frame.code = new_code;
                return true;
            }
        }
        false
    }

    /// Snapshot the dormant frame's locals and operand stack.
    ///
    /// Empty if the generator is running or finished.
    pub fn dormant_values(&self) -> Vec<Value> {
        let state = self.state.lock();
        match state.frame.as_ref() {
            Some(frame) => frame
                .locals
                .iter()
                .chain(frame.stack.iter())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for GeneratorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<generator {}>", self.name)
    }
}

// =============================================================================
// Tuple iterator
// =============================================================================

/// Iterator over a tuple's items.
pub struct TupleIter {
    items: Arc<[Value]>,
    pos: Mutex<usize>,
}

impl TupleIter {
    /// Create an iterator at the first item.
    pub fn new(items: Arc<[Value]>) -> Arc<Self> {
        Arc::new(Self {
            items,
            pos: Mutex::new(0),
        })
    }

    /// Advance, returning the next item if any.
    pub fn next_item(&self) -> Option<Value> {
        let mut pos = self.pos.lock();
        let item = self.items.get(*pos).cloned();
        if item.is_some() {
            *pos += 1;
        }
        item
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Shared interpreter state: monitoring registry, loaded modules,
/// builtin bindings, and the per-thread stacks of executing code.
pub struct Runtime {
    monitoring: Monitoring,
    monitoring_available: bool,
    modules: Mutex<Vec<Arc<ModuleObject>>>,
    builtins: FxHashMap<Arc<str>, Value>,
    call_stacks: DashMap<ThreadId, Vec<CodeId>>,
}

impl Runtime {
    /// Create a runtime with the monitoring API available.
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// Create a runtime without the monitoring API, modeling an older
    /// host version.
    pub fn without_monitoring() -> Arc<Self> {
        Self::build(false)
    }

    fn build(monitoring_available: bool) -> Arc<Self> {
        Arc::new(Self {
            monitoring: Monitoring::new(),
            monitoring_available,
            modules: Mutex::new(Vec::new()),
            builtins: default_builtins(),
            call_stacks: DashMap::new(),
        })
    }

    /// Whether the host exposes the structured monitoring API.
    #[inline]
    pub fn monitoring_supported(&self) -> bool {
        self.monitoring_available
    }

    /// The monitoring registry.
    ///
    /// Present even when unsupported, but the interpreter never fires
    /// events on a runtime built without monitoring.
    #[inline]
    pub fn monitoring(&self) -> &Monitoring {
        &self.monitoring
    }

    /// Create and register a module.
    pub fn new_module(&self, name: impl Into<Arc<str>>) -> Arc<ModuleObject> {
        let module = ModuleObject::new(name);
        self.modules.lock().push(module.clone());
        module
    }

    /// Snapshot the loaded modules.
    pub fn modules(&self) -> Vec<Arc<ModuleObject>> {
        self.modules.lock().clone()
    }

    /// Look up a builtin binding.
    pub fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.get(name).cloned()
    }

    /// Code units currently executing on any thread.
    pub fn executing_code_ids(&self) -> FxHashSet<CodeId> {
        let mut out = FxHashSet::default();
        for entry in self.call_stacks.iter() {
            out.extend(entry.value().iter().copied());
        }
        out
    }

    pub(crate) fn push_executing(&self, id: CodeId) {
        self.call_stacks
            .entry(std::thread::current().id())
            .or_default()
            .push(id);
    }

    pub(crate) fn pop_executing(&self) {
        if let Some(mut stack) = self.call_stacks.get_mut(&std::thread::current().id()) {
            stack.pop();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("monitoring_available", &self.monitoring_available)
            .field("modules", &self.modules.lock().len())
            .finish()
    }
}

/// The builtin namespace shared by all modules.
fn default_builtins() -> FxHashMap<Arc<str>, Value> {
    let mut builtins = FxHashMap::default();

    builtins.insert(
        Arc::from("range"),
        Value::Native(Arc::new(NativeFn::new("range", |args| {
            let (start, stop) = match args {
                [stop] => (0, expect_int(stop)?),
                [start, stop] => (expect_int(start)?, expect_int(stop)?),
                _ => {
                    return Err(HostError::type_error(format!(
                        "range expected 1 or 2 arguments, got {}",
                        args.len()
                    )))
                }
            };
            Ok(Value::Tuple((start..stop).map(Value::Int).collect()))
        }))),
    );

    builtins.insert(
        Arc::from("len"),
        Value::Native(Arc::new(NativeFn::new("len", |args| match args {
            [Value::Tuple(t)] => Ok(Value::Int(t.len() as i64)),
            [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
            [other] => Err(HostError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
            _ => Err(HostError::type_error("len expected 1 argument")),
        }))),
    );

    builtins
}

fn expect_int(value: &Value) -> HostResult<i64> {
    value.as_int().ok_or_else(|| {
        HostError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}
