//! Code-object replacement.
//!
//! After a deinstrument round rebuilds code units, every live
//! reference to a superseded unit must be redirected to its
//! replacement: module globals, class attribute dictionaries, function
//! objects (their code pointer and their default values), and the
//! saved frames of suspended generators.
//!
//! The walk is breadth-first from the registered modules, with a
//! visited set keyed by object identity to break cycles. Frames of
//! running code are structurally unreachable here (the interpreter
//! owns them), and a generator whose frame is checked out is skipped
//! the same way; as a belt the walk also refuses to touch a dormant
//! frame whose unit is still executing on some thread.

use crate::error::{EngineError, EngineResult};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;
use wisp_host::bytecode::CodeId;
use wisp_host::{CodeUnit, ModuleObject, Value};

/// Walk bound: a graph larger than this indicates a cycle-tracking
/// failure, and the round is abandoned rather than left spinning.
const MAX_VISITS: usize = 1_000_000;

/// Outcome counters of one replacement round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceOutcome {
    /// References redirected to a replacement unit.
    pub replaced: usize,
    /// Dormant generator frames left alone because their unit was
    /// executing somewhere.
    pub skipped_live: usize,
}

/// Swap superseded code units in every reference reachable from
/// `roots`.
///
/// Per-root failures are logged and leave that root untouched; the
/// old unit keeps collecting through its still-instrumented probes.
pub fn replace_code_objects(
    roots: &[Arc<ModuleObject>],
    map: &FxHashMap<CodeId, Arc<CodeUnit>>,
    executing: &FxHashSet<CodeId>,
) -> ReplaceOutcome {
    let mut walker = Walker {
        map,
        executing,
        visited: FxHashSet::default(),
        queue: VecDeque::new(),
        outcome: ReplaceOutcome::default(),
    };

    for module in roots {
        if let Err(e) = walker.walk_module(module) {
            warn!(module = %module.name, error = %e, "code replacement failed for root");
        }
    }
    walker.outcome
}

struct Walker<'a> {
    map: &'a FxHashMap<CodeId, Arc<CodeUnit>>,
    executing: &'a FxHashSet<CodeId>,
    visited: FxHashSet<usize>,
    queue: VecDeque<Value>,
    outcome: ReplaceOutcome,
}

impl Walker<'_> {
    fn walk_module(&mut self, module: &Arc<ModuleObject>) -> EngineResult<()> {
        if !self.mark(Arc::as_ptr(module) as usize) {
            return Ok(());
        }
        module.with_globals_mut(|globals| {
            for value in globals.values_mut() {
                self.swap_code_value(value);
                self.queue.push_back(value.clone());
            }
        });
        self.drain()
    }

    fn drain(&mut self) -> EngineResult<()> {
        while let Some(value) = self.queue.pop_front() {
            if self.visited.len() > MAX_VISITS {
                return Err(EngineError::replacer("object graph walk exceeded bound"));
            }
            self.visit(&value)?;
        }
        Ok(())
    }

    fn visit(&mut self, value: &Value) -> EngineResult<()> {
        match value {
            Value::Function(func) => {
                if !self.mark(Arc::as_ptr(func) as usize) {
                    return Ok(());
                }
                let code = func.code();
                if let Some(new_code) = self.map.get(&CodeId::of(&code)) {
                    func.replace_code(new_code.clone());
                    self.outcome.replaced += 1;
                }
                for default in &func.defaults {
                    self.queue.push_back(default.clone());
                }
            }

            Value::Class(class) => {
                if !self.mark(Arc::as_ptr(class) as usize) {
                    return Ok(());
                }
                class.with_attrs_mut(|attrs| {
                    for attr in attrs.values_mut() {
                        self.swap_code_value(attr);
                        self.queue.push_back(attr.clone());
                    }
                });
            }

            Value::Generator(gen) => {
                if !self.mark(Arc::as_ptr(gen) as usize) {
                    return Ok(());
                }
                // Swap the dormant frame's code; refuse if that unit is
                // on some thread's stack right now.
                let swapped = gen.replace_dormant_code(&|code| {
                    let id = CodeId::of(code);
                    if self.executing.contains(&id) {
                        return None;
                    }
                    self.map.get(&id).cloned()
                });
                if swapped {
                    self.outcome.replaced += 1;
                } else if gen
                    .dormant_code()
                    .is_some_and(|c| self.executing.contains(&CodeId::of(&c)))
                {
                    self.outcome.skipped_live += 1;
                }
                for value in gen.dormant_values() {
                    self.queue.push_back(value);
                }
            }

            Value::Module(module) => {
                let module = module.clone();
                self.walk_module(&module)?;
            }

            Value::Tuple(items) => {
                if !self.mark(items.as_ptr() as usize) {
                    return Ok(());
                }
                for item in items.iter() {
                    self.queue.push_back(item.clone());
                }
            }

            // Scalars, strings, natives, capsules, iterators, and bare
            // code values hold no replaceable references. Inner code
            // units referenced from constant pools are rebuilt by the
            // deinstrument recursion itself.
            _ => {}
        }
        Ok(())
    }

    /// Swap a directly stored code value in a mutable slot.
    fn swap_code_value(&mut self, value: &mut Value) {
        if let Value::Code(code) = value {
            if let Some(new_code) = self.map.get(&CodeId::of(code)) {
                *value = Value::Code(new_code.clone());
                self.outcome.replaced += 1;
            }
        }
    }

    /// Returns true the first time an identity is seen.
    fn mark(&mut self, identity: usize) -> bool {
        self.visited.insert(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_host::bytecode::{CodeBuilder, Opcode};
    use wisp_host::{ClassObject, FunctionObject};

    fn tiny_unit(name: &str) -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new(name, "t.wsp");
        b.set_line(1);
        let none = b.add_const(Value::None);
        b.emit(Opcode::LoadConst, none);
        b.emit(Opcode::Return, 0);
        Arc::new(b.finish())
    }

    #[test]
    fn test_function_code_swapped() {
        let old = tiny_unit("f");
        let new = tiny_unit("f");
        let module = ModuleObject::new("m");
        let func = FunctionObject::new(old.clone(), module.clone(), vec![]);
        module.set_global("f", Value::Function(func.clone()));

        let mut map = FxHashMap::default();
        map.insert(CodeId::of(&old), new.clone());

        let outcome = replace_code_objects(&[module], &map, &FxHashSet::default());
        assert_eq!(outcome.replaced, 1);
        assert!(Arc::ptr_eq(&func.code(), &new));
    }

    #[test]
    fn test_class_methods_and_defaults_swapped() {
        let old = tiny_unit("method");
        let new = tiny_unit("method");
        let module = ModuleObject::new("m");

        let class = ClassObject::new("C");
        let method = FunctionObject::new(old.clone(), module.clone(), vec![]);
        class.set_attr("method", Value::Function(method.clone()));

        // A function whose default value is another function.
        let inner = FunctionObject::new(old.clone(), module.clone(), vec![]);
        let outer = FunctionObject::new(
            tiny_unit("outer"),
            module.clone(),
            vec![Value::Function(inner.clone())],
        );

        module.set_global("C", Value::Class(class));
        module.set_global("outer", Value::Function(outer));

        let mut map = FxHashMap::default();
        map.insert(CodeId::of(&old), new.clone());

        let outcome = replace_code_objects(&[module], &map, &FxHashSet::default());
        assert_eq!(outcome.replaced, 2);
        assert!(Arc::ptr_eq(&method.code(), &new));
        assert!(Arc::ptr_eq(&inner.code(), &new));
    }

    #[test]
    fn test_code_value_in_globals_swapped() {
        let old = tiny_unit("g");
        let new = tiny_unit("g");
        let module = ModuleObject::new("m");
        module.set_global("blob", Value::Code(old.clone()));

        let mut map = FxHashMap::default();
        map.insert(CodeId::of(&old), new.clone());

        replace_code_objects(&[module.clone()], &map, &FxHashSet::default());
        match module.get_global("blob").unwrap() {
            Value::Code(c) => assert!(Arc::ptr_eq(&c, &new)),
            _ => panic!("expected code value"),
        }
    }

    #[test]
    fn test_executing_unit_not_swapped_in_generator() {
        use wisp_host::ast::{self, ExprKind, Module as AstModule, Stmt, StmtKind};
        use wisp_host::compiler::compile_module;
        use wisp_host::{Interp, Runtime};

        // def g(): yield 1
        let body = vec![Stmt::new(
            StmtKind::Expr(wisp_host::ast::Expr::new(
                ExprKind::Yield(Some(Box::new(ast::int(1, 2)))),
                2,
            )),
            2,
        )];
        let ast = AstModule::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "g".into(),
                params: vec![],
                body,
            },
            1,
        )]);
        let code = compile_module(&ast, "t.wsp").unwrap();
        let rt = Runtime::new();
        let module = rt.new_module("m");
        let interp = Interp::new(&rt);
        interp.run_module(&code, &module).unwrap();

        let gen = match interp
            .call(&module.get_global("g").unwrap(), vec![])
            .unwrap()
        {
            Value::Generator(gen) => gen,
            _ => panic!(),
        };
        module.set_global("live_gen", Value::Generator(gen.clone()));

        let gen_code = gen.dormant_code().unwrap();
        let replacement = tiny_unit("g");
        let mut map = FxHashMap::default();
        map.insert(CodeId::of(&gen_code), replacement);

        // Pretend the generator's unit is running on another thread.
        let mut executing = FxHashSet::default();
        executing.insert(CodeId::of(&gen_code));

        let outcome = replace_code_objects(&[module], &map, &executing);
        // The function object's code pointer swaps (no frame involved)
        // but the dormant frame of the live unit is left alone.
        assert_eq!(outcome.replaced, 1);
        assert_eq!(outcome.skipped_live, 1);
        assert!(Arc::ptr_eq(&gen.dormant_code().unwrap(), &gen_code));
    }

    #[test]
    fn test_cycles_terminate() {
        let module = ModuleObject::new("m");
        // A module that contains itself.
        module.set_global("myself", Value::Module(module.clone()));
        let outcome =
            replace_code_objects(&[module], &FxHashMap::default(), &FxHashSet::default());
        assert_eq!(outcome.replaced, 0);
    }
}
