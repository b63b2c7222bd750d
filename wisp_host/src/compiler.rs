//! AST-to-wordcode compilation.
//!
//! The compiler performs light scope analysis (names assigned in a
//! function body become locals unless declared `global`; module scope
//! is all-global), then lowers statements through a `CodeBuilder` per
//! compiled unit. Nested functions compile to inner code units stored
//! in the enclosing unit's constant pool.

use crate::ast::{
    BinOp, BoolOpKind, CompareOp, Constant, Expr, ExprKind, Module, Stmt, StmtKind, UnaryOp,
};
use crate::bytecode::{CmpOp, CodeBuilder, CodeFlags, CodeUnit, Label, Opcode};
use crate::error::{CompileError, CompileResult};
use crate::value::Value;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Compile a module to its top-level code unit.
pub fn compile_module(module: &Module, filename: &str) -> CompileResult<Arc<CodeUnit>> {
    let mut fc = FunctionCompiler::new("<module>", "<module>", filename, false);
    fc.builder.add_flags(CodeFlags::MODULE);
    fc.scan_globals(&module.body);
    fc.compile_body(&module.body)?;
    fc.emit_implicit_return();
    Ok(Arc::new(fc.builder.finish()))
}

/// Tracks one enclosing loop during compilation.
struct LoopCtx {
    /// Target of `continue`.
    start: Label,
    /// Target of `break` (past the else clause).
    end: Label,
    /// Whether the loop keeps an iterator on the operand stack.
    has_iter: bool,
}

/// Per-unit compilation state.
struct FunctionCompiler {
    builder: CodeBuilder,
    qualname: Arc<str>,
    filename: Arc<str>,
    /// Whether names default to locals (function scope).
    function_scope: bool,
    /// Names declared `global` in this scope.
    declared_global: FxHashSet<Arc<str>>,
    /// Enclosing loops, innermost last.
    loops: Vec<LoopCtx>,
    /// Number of enclosing `for` loops (iterators live on the stack).
    iter_depth: u32,
    /// Whether a `yield` was seen in this unit.
    saw_yield: bool,
}

impl FunctionCompiler {
    fn new(name: &str, qualname: &str, filename: &str, function_scope: bool) -> Self {
        let mut builder = CodeBuilder::new(name, filename);
        builder.set_qualname(qualname);
        Self {
            builder,
            qualname: qualname.into(),
            filename: filename.into(),
            function_scope,
            declared_global: FxHashSet::default(),
            loops: Vec::new(),
            iter_depth: 0,
            saw_yield: false,
        }
    }

    /// Record `global` declarations; they apply to the whole scope.
    fn scan_globals(&mut self, body: &[Stmt]) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Global(names) => {
                    self.declared_global.extend(names.iter().cloned());
                }
                StmtKind::If { body, orelse, .. }
                | StmtKind::While { body, orelse, .. }
                | StmtKind::For { body, orelse, .. } => {
                    self.scan_globals(body);
                    self.scan_globals(orelse);
                }
                StmtKind::Try { body, handlers } => {
                    self.scan_globals(body);
                    for h in handlers {
                        self.scan_globals(&h.body);
                    }
                }
                _ => {}
            }
        }
    }

    /// Pre-declare locals so slot numbering is stable: parameters first,
    /// then assigned names in statement order. Does not descend into
    /// nested function bodies.
    fn collect_locals(&mut self, body: &[Stmt]) {
        fn walk(fc: &mut FunctionCompiler, stmts: &[Stmt]) {
            for stmt in stmts {
                match &stmt.kind {
                    StmtKind::Assign { name, .. } | StmtKind::AugAssign { name, .. } => {
                        if !fc.declared_global.contains(name) {
                            fc.builder.define_local(name.clone());
                        }
                    }
                    StmtKind::For {
                        target, body, orelse, ..
                    } => {
                        if !fc.declared_global.contains(target) {
                            fc.builder.define_local(target.clone());
                        }
                        walk(fc, body);
                        walk(fc, orelse);
                    }
                    StmtKind::FunctionDef { name, .. } => {
                        if !fc.declared_global.contains(name) {
                            fc.builder.define_local(name.clone());
                        }
                    }
                    StmtKind::If { body, orelse, .. } | StmtKind::While { body, orelse, .. } => {
                        walk(fc, body);
                        walk(fc, orelse);
                    }
                    StmtKind::Try { body, handlers } => {
                        walk(fc, body);
                        for h in handlers {
                            walk(fc, &h.body);
                        }
                    }
                    _ => {}
                }
            }
        }
        walk(self, body);
    }

    fn compile_body(&mut self, body: &[Stmt]) -> CompileResult<()> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_implicit_return(&mut self) {
        let none = self.builder.add_const(Value::None);
        self.builder.emit(Opcode::LoadConst, none);
        self.builder.emit(Opcode::Return, 0);
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        self.builder.set_line(stmt.line);

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.builder.emit(Opcode::Pop, 0);
            }

            StmtKind::Assign { name, value } => {
                self.compile_expr(value)?;
                self.emit_store(name);
            }

            StmtKind::AugAssign { name, op, value } => {
                self.emit_load(name);
                self.compile_expr(value)?;
                self.builder.emit(binop_opcode(*op), 0);
                self.emit_store(name);
            }

            StmtKind::Global(_) => {} // handled by scan_globals

            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => {
                        let none = self.builder.add_const(Value::None);
                        self.builder.emit(Opcode::LoadConst, none);
                    }
                }
                self.builder.emit(Opcode::Return, 0);
            }

            StmtKind::Pass => {}

            StmtKind::Break => {
                let (end, has_iter) = match self.loops.last() {
                    Some(ctx) => (ctx.end, ctx.has_iter),
                    None => return Err(CompileError::new("'break' outside loop", stmt.line)),
                };
                if has_iter {
                    self.builder.emit(Opcode::Pop, 0);
                }
                self.builder.emit_jump(Opcode::Jump, end);
            }

            StmtKind::Continue => {
                let start = match self.loops.last() {
                    Some(ctx) => ctx.start,
                    None => return Err(CompileError::new("'continue' outside loop", stmt.line)),
                };
                self.builder.emit_jump(Opcode::Jump, start);
            }

            StmtKind::Raise(expr) => {
                self.compile_expr(expr)?;
                self.builder.emit(Opcode::Raise, 0);
            }

            StmtKind::If { test, body, orelse } => {
                let else_label = self.builder.create_label();
                let end = self.builder.create_label();

                self.compile_expr(test)?;
                self.builder.emit_jump(Opcode::JumpIfFalse, else_label);
                self.compile_body(body)?;
                self.builder.emit_jump(Opcode::Jump, end);
                self.builder.bind_label(else_label);
                self.compile_body(orelse)?;
                self.builder.bind_label(end);
            }

            StmtKind::While { test, body, orelse } => {
                let start = self.builder.create_label();
                let else_label = self.builder.create_label();
                let end = self.builder.create_label();

                self.builder.bind_label(start);
                self.builder.set_line(stmt.line);
                self.compile_expr(test)?;
                self.builder.emit_jump(Opcode::JumpIfFalse, else_label);

                self.loops.push(LoopCtx {
                    start,
                    end,
                    has_iter: false,
                });
                self.compile_body(body)?;
                self.loops.pop();

                self.builder.emit_jump(Opcode::Jump, start);
                self.builder.bind_label(else_label);
                self.compile_body(orelse)?;
                self.builder.bind_label(end);
            }

            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let start = self.builder.create_label();
                let else_label = self.builder.create_label();
                let end = self.builder.create_label();

                self.compile_expr(iter)?;
                self.builder.emit(Opcode::GetIter, 0);

                self.builder.bind_label(start);
                self.builder.set_line(stmt.line);
                self.builder.emit_jump(Opcode::ForIter, else_label);
                self.emit_store(target);

                self.loops.push(LoopCtx {
                    start,
                    end,
                    has_iter: true,
                });
                self.iter_depth += 1;
                self.compile_body(body)?;
                self.iter_depth -= 1;
                self.loops.pop();

                self.builder.emit_jump(Opcode::Jump, start);
                self.builder.bind_label(else_label);
                self.compile_body(orelse)?;
                self.builder.bind_label(end);
            }

            StmtKind::Try { body, handlers } => {
                let handler = match handlers.len() {
                    0 => return Err(CompileError::new("'try' without 'except'", stmt.line)),
                    1 => &handlers[0],
                    _ => {
                        return Err(CompileError::new(
                            "multiple 'except' clauses are not supported",
                            stmt.line,
                        ))
                    }
                };

                let start = self.builder.create_label();
                let end = self.builder.create_label();
                let handler_label = self.builder.create_label();
                let done = self.builder.create_label();

                self.builder.bind_label(start);
                self.compile_body(body)?;
                self.builder.bind_label(end);
                self.builder.emit_jump(Opcode::Jump, done);

                self.builder.bind_label(handler_label);
                self.builder.set_line(handler.line);
                self.compile_body(&handler.body)?;
                self.builder.bind_label(done);

                self.builder
                    .add_exception_region(start, end, handler_label, self.iter_depth);
            }

            StmtKind::FunctionDef { name, params, body } => {
                let qualname = if self.function_scope {
                    format!("{}.<locals>.{}", self.qualname, name)
                } else {
                    name.to_string()
                };
                let inner = compile_function(name, &qualname, &self.filename, params, body, stmt.line)?;
                let idx = self.builder.add_const(Value::Code(inner));
                self.builder.emit(Opcode::MakeFunction, idx);
                self.emit_store(name);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Constant(c) => {
                let idx = self.builder.add_const(constant_value(c));
                self.builder.emit(Opcode::LoadConst, idx);
            }

            ExprKind::Name(name) => self.emit_load(name),

            ExprKind::BinOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.builder.emit(binop_opcode(*op), 0);
            }

            ExprKind::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::UnaryNeg,
                    UnaryOp::Not => Opcode::UnaryNot,
                };
                self.builder.emit(opcode, 0);
            }

            ExprKind::Compare { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.builder.emit(Opcode::Compare, compare_arg(*op) as u32);
            }

            ExprKind::BoolOp { op, values } => {
                if values.len() < 2 {
                    return Err(CompileError::new(
                        "boolean operation needs at least two operands",
                        expr.line,
                    ));
                }
                let end = self.builder.create_label();
                let short_circuit = match op {
                    BoolOpKind::And => Opcode::JumpIfFalseOrPop,
                    BoolOpKind::Or => Opcode::JumpIfTrueOrPop,
                };
                for value in &values[..values.len() - 1] {
                    self.compile_expr(value)?;
                    self.builder.emit_jump(short_circuit, end);
                }
                self.compile_expr(values.last().unwrap())?;
                self.builder.bind_label(end);
            }

            ExprKind::Call { func, args } => {
                self.compile_expr(func)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.builder.emit(Opcode::Call, args.len() as u32);
            }

            ExprKind::Tuple(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.builder.emit(Opcode::BuildTuple, items.len() as u32);
            }

            ExprKind::Yield(value) => {
                if !self.function_scope {
                    return Err(CompileError::new("'yield' outside function", expr.line));
                }
                match value {
                    Some(v) => self.compile_expr(v)?,
                    None => {
                        let none = self.builder.add_const(Value::None);
                        self.builder.emit(Opcode::LoadConst, none);
                    }
                }
                self.builder.emit(Opcode::Yield, 0);
                self.saw_yield = true;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Name access
    // =========================================================================

    fn emit_store(&mut self, name: &Arc<str>) {
        if self.function_scope && !self.declared_global.contains(name) {
            if let Some(slot) = self.builder.lookup_local(name) {
                self.builder.emit(Opcode::StoreLocal, slot);
                return;
            }
        }
        let idx = self.builder.add_name(name.clone());
        self.builder.emit(Opcode::StoreGlobal, idx);
    }

    fn emit_load(&mut self, name: &Arc<str>) {
        if self.function_scope && !self.declared_global.contains(name) {
            if let Some(slot) = self.builder.lookup_local(name) {
                self.builder.emit(Opcode::LoadLocal, slot);
                return;
            }
        }
        let idx = self.builder.add_name(name.clone());
        self.builder.emit(Opcode::LoadGlobal, idx);
    }

}

/// Compile a function body to an inner code unit.
fn compile_function(
    name: &str,
    qualname: &str,
    filename: &str,
    params: &[Arc<str>],
    body: &[Stmt],
    line: u32,
) -> CompileResult<Arc<CodeUnit>> {
    let mut fc = FunctionCompiler::new(name, qualname, filename, true);
    fc.builder.set_first_line(line);
    fc.builder.set_arg_count(params.len() as u16);
    fc.builder.add_flags(CodeFlags::NESTED);

    for param in params {
        fc.builder.define_local(param.clone());
    }
    fc.scan_globals(body);
    fc.collect_locals(body);
    fc.compile_body(body)?;
    fc.emit_implicit_return();

    if fc.saw_yield {
        fc.builder.add_flags(CodeFlags::GENERATOR);
    }
    Ok(Arc::new(fc.builder.finish()))
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySub,
        BinOp::Mul => Opcode::BinaryMul,
        BinOp::Div => Opcode::BinaryDiv,
        BinOp::FloorDiv => Opcode::BinaryFloorDiv,
        BinOp::Mod => Opcode::BinaryMod,
    }
}

fn compare_arg(op: CompareOp) -> u8 {
    let cmp = match op {
        CompareOp::Lt => CmpOp::Lt,
        CompareOp::Le => CmpOp::Le,
        CompareOp::Eq => CmpOp::Eq,
        CompareOp::Ne => CmpOp::Ne,
        CompareOp::Gt => CmpOp::Gt,
        CompareOp::Ge => CmpOp::Ge,
    };
    cmp as u8
}

fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::None => Value::None,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::Int(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::Str(s) => Value::Str(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, ExceptHandler};

    fn expr_stmt(e: Expr, line: u32) -> Stmt {
        Stmt::new(StmtKind::Expr(e), line)
    }

    #[test]
    fn test_compile_assignment() {
        let module = Module::new(vec![ast::assign("x", ast::int(1, 1), 1)]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let ops: Vec<_> = code
            .instructions()
            .iter()
            .filter_map(|i| i.opcode())
            .collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadConst,
                Opcode::StoreGlobal,
                Opcode::LoadConst,
                Opcode::Return
            ]
        );
    }

    #[test]
    fn test_function_locals() {
        // def f(a): b = a; return b
        let body = vec![
            ast::assign("b", ast::name("a", 2), 2),
            Stmt::new(StmtKind::Return(Some(ast::name("b", 3))), 3),
        ];
        let module = Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "f".into(),
                params: vec!["a".into()],
                body,
            },
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let inner = code.consts.iter().find_map(|c| c.as_code()).unwrap();
        assert_eq!(inner.arg_count, 1);
        assert_eq!(&*inner.locals[0], "a");
        assert_eq!(&*inner.locals[1], "b");
        let ops: Vec<_> = inner
            .instructions()
            .iter()
            .filter_map(|i| i.opcode())
            .collect();
        assert!(ops.contains(&Opcode::StoreLocal));
        assert!(!ops.contains(&Opcode::StoreGlobal));
    }

    #[test]
    fn test_global_declaration_forces_global_store() {
        let body = vec![
            Stmt::new(StmtKind::Global(vec!["g".into()]), 2),
            ast::assign("g", ast::int(5, 3), 3),
        ];
        let module = Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "f".into(),
                params: vec![],
                body,
            },
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let inner = code.consts.iter().find_map(|c| c.as_code()).unwrap();
        let ops: Vec<_> = inner
            .instructions()
            .iter()
            .filter_map(|i| i.opcode())
            .collect();
        assert!(ops.contains(&Opcode::StoreGlobal));
        assert!(!ops.contains(&Opcode::StoreLocal));
    }

    #[test]
    fn test_while_line_table() {
        // 1: x = 0
        // 2: while x < 3:
        // 3:     x = x + 1
        let module = Module::new(vec![
            ast::assign("x", ast::int(0, 1), 1),
            Stmt::new(
                StmtKind::While {
                    test: ast::compare(ast::name("x", 2), CompareOp::Lt, ast::int(3, 2), 2),
                    body: vec![ast::assign(
                        "x",
                        ast::binop(ast::name("x", 3), BinOp::Add, ast::int(1, 3), 3),
                        3,
                    )],
                    orelse: vec![],
                },
                2,
            ),
        ]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let lines: Vec<u32> = code.lines().collect();
        assert!(lines.contains(&1));
        assert!(lines.contains(&2));
        assert!(lines.contains(&3));
    }

    #[test]
    fn test_break_outside_loop_errors() {
        let module = Module::new(vec![Stmt::new(StmtKind::Break, 1)]);
        let err = compile_module(&module, "t.wsp").unwrap_err();
        assert!(err.to_string().contains("break"));
    }

    #[test]
    fn test_try_except_region() {
        let module = Module::new(vec![Stmt::new(
            StmtKind::Try {
                body: vec![expr_stmt(ast::int(1, 2), 2)],
                handlers: vec![ExceptHandler {
                    body: vec![expr_stmt(ast::int(2, 4), 4)],
                    line: 3,
                }],
            },
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        assert_eq!(code.exception_table.len(), 1);
        let e = code.exception_table[0];
        assert!(e.start < e.end);
        assert!(e.handler >= e.end);
    }

    #[test]
    fn test_generator_flag() {
        let body = vec![expr_stmt(
            Expr::new(ExprKind::Yield(Some(Box::new(ast::int(1, 2)))), 2),
            2,
        )];
        let module = Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "g".into(),
                params: vec![],
                body,
            },
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let inner = code.consts.iter().find_map(|c| c.as_code()).unwrap();
        assert!(inner.is_generator());
    }

    #[test]
    fn test_bool_op_short_circuit_shape() {
        let e = Expr::new(
            ExprKind::BoolOp {
                op: BoolOpKind::And,
                values: vec![ast::name("a", 1), ast::name("b", 1)],
            },
            1,
        );
        let module = Module::new(vec![expr_stmt(e, 1)]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let ops: Vec<_> = code
            .instructions()
            .iter()
            .filter_map(|i| i.opcode())
            .collect();
        assert!(ops.contains(&Opcode::JumpIfFalseOrPop));
    }
}
