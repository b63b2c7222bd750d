//! The wordcode interpreter.
//!
//! A straightforward stack machine over [`Frame`]s. Calls recurse into
//! `run_frame`; generators suspend by returning `Flow::Yield`, with
//! the frame handed back to the generator object. Raised errors
//! consult the code unit's exception table before unwinding.
//!
//! Every executing frame's code identity is pushed on the runtime's
//! per-thread stack so observers can tell which units are live.

use super::frame::Frame;
use super::{FunctionObject, GeneratorObject, ModuleObject, Runtime, TupleIter, MAX_RECURSION_DEPTH};
use crate::bytecode::{CmpOp, CodeId, CodeUnit, Opcode};
use crate::error::{HostError, HostResult};
use crate::value::Value;
use std::cell::Cell;
use std::sync::Arc;

/// How a frame left the dispatch loop.
enum Flow {
    /// Normal return with a value.
    Return(Value),
    /// Generator suspension with a yielded value.
    Yield(Value),
}

/// Interpreter bound to a runtime.
pub struct Interp<'rt> {
    rt: &'rt Runtime,
    depth: Cell<usize>,
}

impl<'rt> Interp<'rt> {
    /// Create an interpreter.
    pub fn new(rt: &'rt Runtime) -> Self {
        Self {
            rt,
            depth: Cell::new(0),
        }
    }

    /// Execute a module body in the given module's namespace.
    pub fn run_module(&self, code: &Arc<CodeUnit>, module: &Arc<ModuleObject>) -> HostResult<Value> {
        let mut frame = Frame::new(code.clone(), module.clone(), vec![])?;
        match self.run_frame(&mut frame)? {
            Flow::Return(v) => Ok(v),
            Flow::Yield(_) => Err(HostError::internal("module body yielded")),
        }
    }

    /// Call a callable value with positional arguments.
    pub fn call(&self, callee: &Value, args: Vec<Value>) -> HostResult<Value> {
        match callee {
            Value::Native(f) => f.call(&args),
            Value::Function(func) => self.call_function(func, args),
            other => Err(HostError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Resume a generator, sending `sent` as the value of the pending
    /// yield. Returns the next yielded value, or `None` on completion.
    pub fn resume(&self, gen: &Arc<GeneratorObject>, sent: Value) -> HostResult<Option<Value>> {
        // Check the frame out of the generator: while it runs, the
        // object holds no frame and observers see it as non-dormant.
        let (mut frame, started) = {
            let mut state = gen.state.lock();
            if state.finished {
                return Ok(None);
            }
            match state.frame.take() {
                Some(frame) => (frame, state.started),
                None => return Err(HostError::raised("generator already executing")),
            }
        };

        if started {
            frame.stack.push(sent);
        }

        self.enter()?;
        let result = self.run_frame(&mut frame);
        self.leave();

        let mut state = gen.state.lock();
        state.started = true;
        match result {
            Ok(Flow::Yield(value)) => {
                state.frame = Some(frame);
                Ok(Some(value))
            }
            Ok(Flow::Return(_)) => {
                state.finished = true;
                Ok(None)
            }
            Err(e) => {
                state.finished = true;
                Err(e)
            }
        }
    }

    fn call_function(&self, func: &Arc<FunctionObject>, args: Vec<Value>) -> HostResult<Value> {
        let code = func.code();
        let bound = bind_args(func, &code, args)?;

        if code.is_generator() {
            let frame = Frame::new(code, func.module.clone(), bound)?;
            return Ok(Value::Generator(GeneratorObject::from_frame(
                func.name.clone(),
                frame,
            )));
        }

        self.enter()?;
        let mut frame = match Frame::new(code, func.module.clone(), bound) {
            Ok(frame) => frame,
            Err(e) => {
                self.leave();
                return Err(e);
            }
        };
        let result = self.run_frame(&mut frame);
        self.leave();

        match result? {
            Flow::Return(v) => Ok(v),
            Flow::Yield(_) => Err(HostError::internal("yield outside generator frame")),
        }
    }

    #[inline]
    fn enter(&self) -> HostResult<()> {
        let depth = self.depth.get();
        if depth >= MAX_RECURSION_DEPTH {
            return Err(HostError::Recursion);
        }
        self.depth.set(depth + 1);
        Ok(())
    }

    #[inline]
    fn leave(&self) {
        self.depth.set(self.depth.get() - 1);
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn run_frame(&self, frame: &mut Frame) -> HostResult<Flow> {
        let code = frame.code.clone();
        let code_len = code.code.len();
        let monitoring = self.rt.monitoring_supported()
            && self.rt.monitoring().is_active_for(CodeId::of(&code));

        self.rt.push_executing(CodeId::of(&code));
        let result = self.dispatch(frame, &code, code_len, monitoring);
        self.rt.pop_executing();
        result
    }

    fn dispatch(
        &self,
        frame: &mut Frame,
        code: &Arc<CodeUnit>,
        code_len: u32,
        monitoring: bool,
    ) -> HostResult<Flow> {
        loop {
            let start_ip = frame.ip;
            if start_ip >= code_len {
                return Ok(Flow::Return(Value::None));
            }

            if monitoring {
                if let Some(line) = code.line_start_at(start_ip) {
                    self.rt.monitoring().fire_line(code, line);
                }
            }

            // Fetch, folding ExtendedArg prefixes.
            let mut ip = start_ip;
            let mut ext: u32 = 0;
            let (op, arg) = loop {
                if ip + 2 > code_len {
                    return Err(HostError::internal("truncated instruction stream"));
                }
                let op_byte = code.code.byte(ip);
                let arg_byte = code.code.byte(ip + 1) as u32;
                ip += 2;
                if op_byte == Opcode::ExtendedArg as u8 {
                    ext = (ext | arg_byte) << 8;
                    continue;
                }
                match Opcode::from_u8(op_byte) {
                    Some(op) => break (op, ext | arg_byte),
                    None => {
                        return Err(HostError::internal(format!(
                            "invalid opcode {:#04x} at offset {}",
                            op_byte,
                            ip - 2
                        )))
                    }
                }
            };
            frame.ip = ip;

            match self.exec_op(frame, code, op, arg, start_ip, ip, monitoring) {
                Ok(None) => {}
                Ok(Some(flow)) => return Ok(flow),
                Err(e) if e.is_catchable() => match code.find_handler(start_ip) {
                    Some(entry) => {
                        frame.stack.truncate(entry.depth as usize);
                        frame.ip = entry.handler;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_op(
        &self,
        frame: &mut Frame,
        code: &Arc<CodeUnit>,
        op: Opcode,
        arg: u32,
        start_ip: u32,
        next_ip: u32,
        monitoring: bool,
    ) -> HostResult<Option<Flow>> {
        match op {
            Opcode::Nop | Opcode::ExtendedArg => {}

            Opcode::Pop => {
                self.pop(frame)?;
            }

            Opcode::Dup => {
                let top = self.peek(frame)?.clone();
                frame.stack.push(top);
            }

            Opcode::Return => {
                let value = self.pop(frame)?;
                return Ok(Some(Flow::Return(value)));
            }

            Opcode::Jump => frame.ip = arg,

            Opcode::JumpForward => frame.ip = next_ip + arg,

            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                let value = self.pop(frame)?;
                let truthy = value.is_truthy();
                let jump_on = op == Opcode::JumpIfTrue;
                let taken = truthy == jump_on;
                if monitoring {
                    self.fire_branch(code, start_ip, arg, next_ip, taken);
                }
                if taken {
                    frame.ip = arg;
                }
            }

            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let truthy = self.peek(frame)?.is_truthy();
                let jump_on = op == Opcode::JumpIfTrueOrPop;
                let taken = truthy == jump_on;
                if monitoring {
                    self.fire_branch(code, start_ip, arg, next_ip, taken);
                }
                if taken {
                    frame.ip = arg;
                } else {
                    frame.stack.pop();
                }
            }

            Opcode::ForIter => {
                let next = match self.peek(frame)? {
                    Value::Iter(it) => it.next_item(),
                    Value::Generator(gen) => {
                        let gen = gen.clone();
                        self.resume(&gen, Value::None)?
                    }
                    other => {
                        return Err(HostError::type_error(format!(
                            "'{}' object is not an iterator",
                            other.type_name()
                        )))
                    }
                };
                let exhausted = next.is_none();
                if monitoring {
                    let target = next_ip + arg;
                    self.fire_branch(code, start_ip, target, next_ip, exhausted);
                }
                match next {
                    Some(value) => frame.stack.push(value),
                    None => {
                        frame.stack.pop();
                        frame.ip = next_ip + arg;
                    }
                }
            }

            Opcode::LoadConst => {
                let value = code
                    .consts
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| HostError::internal("constant index out of range"))?;
                frame.stack.push(value);
            }

            Opcode::LoadLocal => {
                let value = frame
                    .locals
                    .get(arg as usize)
                    .cloned()
                    .ok_or_else(|| HostError::internal("local slot out of range"))?;
                frame.stack.push(value);
            }

            Opcode::StoreLocal => {
                let value = self.pop(frame)?;
                let slot = frame
                    .locals
                    .get_mut(arg as usize)
                    .ok_or_else(|| HostError::internal("local slot out of range"))?;
                *slot = value;
            }

            Opcode::LoadGlobal => {
                let name = self.global_name(code, arg)?;
                let value = frame
                    .module
                    .get_global(name)
                    .or_else(|| self.rt.builtin(name))
                    .ok_or_else(|| HostError::name(name))?;
                frame.stack.push(value);
            }

            Opcode::StoreGlobal => {
                let value = self.pop(frame)?;
                let name = self.global_name(code, arg)?;
                frame.module.set_global(name, value);
            }

            Opcode::BinaryAdd
            | Opcode::BinarySub
            | Opcode::BinaryMul
            | Opcode::BinaryDiv
            | Opcode::BinaryFloorDiv
            | Opcode::BinaryMod => {
                let rhs = self.pop(frame)?;
                let lhs = self.pop(frame)?;
                frame.stack.push(binary_op(op, &lhs, &rhs)?);
            }

            Opcode::UnaryNeg => {
                let value = self.pop(frame)?;
                let negated = match value {
                    Value::Int(i) => Value::Int(
                        i.checked_neg()
                            .ok_or_else(|| HostError::type_error("integer overflow"))?,
                    ),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(HostError::type_error(format!(
                            "bad operand type for unary -: '{}'",
                            other.type_name()
                        )))
                    }
                };
                frame.stack.push(negated);
            }

            Opcode::UnaryNot => {
                let value = self.pop(frame)?;
                frame.stack.push(Value::Bool(!value.is_truthy()));
            }

            Opcode::Compare => {
                let cmp = CmpOp::from_u32(arg)
                    .ok_or_else(|| HostError::internal("invalid comparison operand"))?;
                let rhs = self.pop(frame)?;
                let lhs = self.pop(frame)?;
                frame.stack.push(lhs.compare(cmp, &rhs)?);
            }

            Opcode::BuildTuple => {
                let n = arg as usize;
                if frame.stack.len() < n {
                    return Err(HostError::internal("stack underflow in BuildTuple"));
                }
                let items = frame.stack.split_off(frame.stack.len() - n);
                frame.stack.push(Value::tuple(items));
            }

            Opcode::GetIter => {
                let value = self.pop(frame)?;
                let iter = match value {
                    Value::Tuple(items) => Value::Iter(TupleIter::new(items)),
                    v @ (Value::Generator(_) | Value::Iter(_)) => v,
                    other => {
                        return Err(HostError::type_error(format!(
                            "'{}' object is not iterable",
                            other.type_name()
                        )))
                    }
                };
                frame.stack.push(iter);
            }

            Opcode::Call => {
                let n = arg as usize;
                if frame.stack.len() < n + 1 {
                    return Err(HostError::internal("stack underflow in Call"));
                }
                let args = frame.stack.split_off(frame.stack.len() - n);
                let callee = self.pop(frame)?;
                let result = self.call(&callee, args)?;
                frame.stack.push(result);
            }

            Opcode::MakeFunction => {
                let inner = code
                    .consts
                    .get(arg as usize)
                    .and_then(|c| c.as_code())
                    .cloned()
                    .ok_or_else(|| HostError::internal("MakeFunction on non-code constant"))?;
                let func = FunctionObject::new(inner, frame.module.clone(), vec![]);
                frame.stack.push(Value::Function(func));
            }

            Opcode::Raise => {
                let value = self.pop(frame)?;
                let message = match &value {
                    Value::Str(s) => s.to_string(),
                    other => format!("{:?}", other),
                };
                return Err(HostError::raised(message));
            }

            Opcode::Yield => {
                let value = self.pop(frame)?;
                return Ok(Some(Flow::Yield(value)));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[inline]
    fn pop(&self, frame: &mut Frame) -> HostResult<Value> {
        frame
            .stack
            .pop()
            .ok_or_else(|| HostError::internal("operand stack underflow"))
    }

    #[inline]
    fn peek<'f>(&self, frame: &'f Frame) -> HostResult<&'f Value> {
        frame
            .stack
            .last()
            .ok_or_else(|| HostError::internal("operand stack underflow"))
    }

    #[inline]
    fn global_name<'c>(&self, code: &'c CodeUnit, arg: u32) -> HostResult<&'c str> {
        code.names
            .get(arg as usize)
            .map(|n| &**n)
            .ok_or_else(|| HostError::internal("name index out of range"))
    }

    fn fire_branch(
        &self,
        code: &Arc<CodeUnit>,
        src_offset: u32,
        taken_target: u32,
        fallthrough: u32,
        taken: bool,
    ) {
        let src = code.line_for_offset(src_offset).unwrap_or(0);
        let dst_offset = if taken { taken_target } else { fallthrough };
        let dst = code.line_for_offset(dst_offset).unwrap_or(0);
        self.rt.monitoring().fire_branch(code, src, dst, taken);
    }
}

/// Bind positional arguments plus trailing defaults.
fn bind_args(
    func: &FunctionObject,
    code: &CodeUnit,
    mut args: Vec<Value>,
) -> HostResult<Vec<Value>> {
    let arg_count = code.arg_count as usize;
    if args.len() > arg_count {
        return Err(HostError::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            func.name,
            arg_count,
            args.len()
        )));
    }

    let required = arg_count.saturating_sub(func.defaults.len());
    if args.len() < required {
        return Err(HostError::type_error(format!(
            "{}() missing {} required positional arguments",
            func.name,
            required - args.len()
        )));
    }

    while args.len() < arg_count {
        let default_idx = args.len() - required;
        args.push(func.defaults[default_idx].clone());
    }
    Ok(args)
}

/// Binary arithmetic over guest values.
fn binary_op(op: Opcode, lhs: &Value, rhs: &Value) -> HostResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        return match op {
            Opcode::BinaryAdd => checked(a.checked_add(b)),
            Opcode::BinarySub => checked(a.checked_sub(b)),
            Opcode::BinaryMul => checked(a.checked_mul(b)),
            Opcode::BinaryDiv => {
                if b == 0 {
                    Err(HostError::zero_division("division by zero"))
                } else {
                    Ok(Value::Float(a as f64 / b as f64))
                }
            }
            Opcode::BinaryFloorDiv => {
                if b == 0 {
                    Err(HostError::zero_division("integer division or modulo by zero"))
                } else {
                    Ok(Value::Int(a.div_euclid(b)))
                }
            }
            Opcode::BinaryMod => {
                if b == 0 {
                    Err(HostError::zero_division("integer division or modulo by zero"))
                } else {
                    Ok(Value::Int(a.rem_euclid(b)))
                }
            }
            _ => Err(HostError::internal("not a binary opcode")),
        };
    }

    if op == Opcode::BinaryAdd {
        if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            return Ok(Value::str(s));
        }
    }

    match (lhs.as_float(), rhs.as_float()) {
        (Some(a), Some(b)) => match op {
            Opcode::BinaryAdd => Ok(Value::Float(a + b)),
            Opcode::BinarySub => Ok(Value::Float(a - b)),
            Opcode::BinaryMul => Ok(Value::Float(a * b)),
            Opcode::BinaryDiv => {
                if b == 0.0 {
                    Err(HostError::zero_division("float division by zero"))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            Opcode::BinaryFloorDiv => {
                if b == 0.0 {
                    Err(HostError::zero_division("float floor division by zero"))
                } else {
                    Ok(Value::Float((a / b).floor()))
                }
            }
            Opcode::BinaryMod => {
                if b == 0.0 {
                    Err(HostError::zero_division("float modulo"))
                } else {
                    Ok(Value::Float(a.rem_euclid(b)))
                }
            }
            _ => Err(HostError::internal("not a binary opcode")),
        },
        _ => Err(HostError::type_error(format!(
            "unsupported operand type(s): '{}' and '{}'",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

#[inline]
fn checked(value: Option<i64>) -> HostResult<Value> {
    value
        .map(Value::Int)
        .ok_or_else(|| HostError::type_error("integer overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, BinOp, CompareOp, Constant, ExceptHandler, Expr, ExprKind, Module, Stmt, StmtKind};
    use crate::compiler::compile_module;

    fn run_source(module: &Module) -> (Arc<Runtime>, Arc<ModuleObject>) {
        let code = compile_module(module, "t.wsp").unwrap();
        let rt = Runtime::new();
        let m = rt.new_module("main");
        let interp = Interp::new(&rt);
        interp.run_module(&code, &m).unwrap();
        (rt, m)
    }

    fn call_global(rt: &Runtime, m: &Arc<ModuleObject>, name: &str, args: Vec<Value>) -> HostResult<Value> {
        let f = m.get_global(name).unwrap();
        Interp::new(rt).call(&f, args)
    }

    /// def f(n):
    ///     x = 0
    ///     while n > 0:
    ///         x = x + n
    ///         n = n - 1
    ///     return x
    fn sum_countdown() -> Module {
        let body = vec![
            ast::assign("x", ast::int(0, 2), 2),
            Stmt::new(
                StmtKind::While {
                    test: ast::compare(ast::name("n", 3), CompareOp::Gt, ast::int(0, 3), 3),
                    body: vec![
                        ast::assign(
                            "x",
                            ast::binop(ast::name("x", 4), BinOp::Add, ast::name("n", 4), 4),
                            4,
                        ),
                        ast::assign(
                            "n",
                            ast::binop(ast::name("n", 5), BinOp::Sub, ast::int(1, 5), 5),
                            5,
                        ),
                    ],
                    orelse: vec![],
                },
                3,
            ),
            Stmt::new(StmtKind::Return(Some(ast::name("x", 6))), 6),
        ];
        Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "f".into(),
                params: vec!["n".into()],
                body,
            },
            1,
        )])
    }

    #[test]
    fn test_while_loop_sum() {
        let (rt, m) = run_source(&sum_countdown());
        let out = call_global(&rt, &m, "f", vec![Value::Int(3)]).unwrap();
        assert_eq!(out, Value::Int(6));
        let out = call_global(&rt, &m, "f", vec![Value::Int(0)]).unwrap();
        assert_eq!(out, Value::Int(0));
    }

    #[test]
    fn test_for_loop_over_range() {
        // total = 0
        // for i in range(5):
        //     total = total + i
        let module = Module::new(vec![
            ast::assign("total", ast::int(0, 1), 1),
            Stmt::new(
                StmtKind::For {
                    target: "i".into(),
                    iter: Expr::new(
                        ExprKind::Call {
                            func: Box::new(ast::name("range", 2)),
                            args: vec![ast::int(5, 2)],
                        },
                        2,
                    ),
                    body: vec![ast::assign(
                        "total",
                        ast::binop(ast::name("total", 3), BinOp::Add, ast::name("i", 3), 3),
                        3,
                    )],
                    orelse: vec![],
                },
                2,
            ),
        ]);
        let (_rt, m) = run_source(&module);
        assert_eq!(m.get_global("total"), Some(Value::Int(10)));
    }

    #[test]
    fn test_try_except_catches() {
        // try:
        //     raise "boom"
        //     x = 1
        // except:
        //     x = 2
        let module = Module::new(vec![Stmt::new(
            StmtKind::Try {
                body: vec![
                    Stmt::new(
                        StmtKind::Raise(Expr::new(
                            ExprKind::Constant(Constant::Str("boom".into())),
                            2,
                        )),
                        2,
                    ),
                    ast::assign("x", ast::int(1, 3), 3),
                ],
                handlers: vec![ExceptHandler {
                    body: vec![ast::assign("x", ast::int(2, 5), 5)],
                    line: 4,
                }],
            },
            1,
        )]);
        let (_rt, m) = run_source(&module);
        assert_eq!(m.get_global("x"), Some(Value::Int(2)));
    }

    #[test]
    fn test_uncaught_raise_propagates() {
        let module = Module::new(vec![Stmt::new(
            StmtKind::Raise(Expr::new(
                ExprKind::Constant(Constant::Str("unhandled".into())),
                1,
            )),
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let rt = Runtime::new();
        let m = rt.new_module("main");
        let err = Interp::new(&rt).run_module(&code, &m).unwrap_err();
        assert!(err.to_string().contains("unhandled"));
    }

    #[test]
    fn test_generator_yields_and_finishes() {
        // def g():
        //     yield 1
        //     yield 2
        let body = vec![
            Stmt::new(
                StmtKind::Expr(Expr::new(
                    ExprKind::Yield(Some(Box::new(ast::int(1, 2)))),
                    2,
                )),
                2,
            ),
            Stmt::new(
                StmtKind::Expr(Expr::new(
                    ExprKind::Yield(Some(Box::new(ast::int(2, 3)))),
                    3,
                )),
                3,
            ),
        ];
        let module = Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "g".into(),
                params: vec![],
                body,
            },
            1,
        )]);
        let (rt, m) = run_source(&module);
        let gen = match call_global(&rt, &m, "g", vec![]).unwrap() {
            Value::Generator(gen) => gen,
            other => panic!("expected generator, got {:?}", other),
        };

        let interp = Interp::new(&rt);
        assert!(gen.dormant_code().is_some());
        assert_eq!(interp.resume(&gen, Value::None).unwrap(), Some(Value::Int(1)));
        assert_eq!(interp.resume(&gen, Value::None).unwrap(), Some(Value::Int(2)));
        assert_eq!(interp.resume(&gen, Value::None).unwrap(), None);
        assert!(gen.is_finished());
    }

    #[test]
    fn test_for_over_generator() {
        // def g():
        //     yield 10
        //     yield 20
        // total = 0
        // for v in g():
        //     total = total + v
        let gen_body = vec![
            Stmt::new(
                StmtKind::Expr(Expr::new(
                    ExprKind::Yield(Some(Box::new(ast::int(10, 2)))),
                    2,
                )),
                2,
            ),
            Stmt::new(
                StmtKind::Expr(Expr::new(
                    ExprKind::Yield(Some(Box::new(ast::int(20, 3)))),
                    3,
                )),
                3,
            ),
        ];
        let module = Module::new(vec![
            Stmt::new(
                StmtKind::FunctionDef {
                    name: "g".into(),
                    params: vec![],
                    body: gen_body,
                },
                1,
            ),
            ast::assign("total", ast::int(0, 4), 4),
            Stmt::new(
                StmtKind::For {
                    target: "v".into(),
                    iter: Expr::new(
                        ExprKind::Call {
                            func: Box::new(ast::name("g", 5)),
                            args: vec![],
                        },
                        5,
                    ),
                    body: vec![ast::assign(
                        "total",
                        ast::binop(ast::name("total", 6), BinOp::Add, ast::name("v", 6), 6),
                        6,
                    )],
                    orelse: vec![],
                },
                5,
            ),
        ]);
        let (_rt, m) = run_source(&module);
        assert_eq!(m.get_global("total"), Some(Value::Int(30)));
    }

    #[test]
    fn test_name_error() {
        let module = Module::new(vec![Stmt::new(
            StmtKind::Expr(ast::name("missing", 1)),
            1,
        )]);
        let code = compile_module(&module, "t.wsp").unwrap();
        let rt = Runtime::new();
        let m = rt.new_module("main");
        let err = Interp::new(&rt).run_module(&code, &m).unwrap_err();
        assert_eq!(err.exception_type(), "NameError");
    }

    #[test]
    fn test_zero_division_caught_by_handler() {
        // try:
        //     x = 1 // 0
        // except:
        //     x = 99
        let module = Module::new(vec![Stmt::new(
            StmtKind::Try {
                body: vec![ast::assign(
                    "x",
                    ast::binop(ast::int(1, 2), BinOp::FloorDiv, ast::int(0, 2), 2),
                    2,
                )],
                handlers: vec![ExceptHandler {
                    body: vec![ast::assign("x", ast::int(99, 4), 4)],
                    line: 3,
                }],
            },
            1,
        )]);
        let (_rt, m) = run_source(&module);
        assert_eq!(m.get_global("x"), Some(Value::Int(99)));
    }

    #[test]
    fn test_defaults_bound() {
        let rt = Runtime::new();
        let m = rt.new_module("main");
        // Build f(a, b=5) by hand: return a + b
        let body = vec![Stmt::new(
            StmtKind::Return(Some(ast::binop(
                ast::name("a", 2),
                BinOp::Add,
                ast::name("b", 2),
                2,
            ))),
            2,
        )];
        let module_ast = Module::new(vec![Stmt::new(
            StmtKind::FunctionDef {
                name: "f".into(),
                params: vec!["a".into(), "b".into()],
                body,
            },
            1,
        )]);
        let code = compile_module(&module_ast, "t.wsp").unwrap();
        let interp = Interp::new(&rt);
        interp.run_module(&code, &m).unwrap();

        let inner = match m.get_global("f").unwrap() {
            Value::Function(f) => f,
            _ => panic!(),
        };
        let with_default =
            FunctionObject::new(inner.code(), m.clone(), vec![Value::Int(5)]);
        let out = interp
            .call(&Value::Function(with_default), vec![Value::Int(2)])
            .unwrap();
        assert_eq!(out, Value::Int(7));
    }

    #[test]
    fn test_executing_stack_empty_after_run() {
        let (rt, m) = run_source(&sum_countdown());
        call_global(&rt, &m, "f", vec![Value::Int(2)]).unwrap();
        assert!(rt.executing_code_ids().is_empty());
    }
}
