//! Call frames.
//!
//! A frame is the execution context for one activation: the code unit,
//! the instruction pointer, the operand stack, and the local slots.
//! Frames are plain data so a generator can carry its suspended frame
//! across resumptions.

use super::ModuleObject;
use crate::bytecode::CodeUnit;
use crate::error::{HostError, HostResult};
use crate::value::Value;
use std::sync::Arc;

/// One activation of a code unit.
pub struct Frame {
    /// Code being executed.
    pub code: Arc<CodeUnit>,
    /// Module whose globals are in scope.
    pub module: Arc<ModuleObject>,
    /// Byte offset of the next instruction.
    pub ip: u32,
    /// Operand stack.
    pub stack: Vec<Value>,
    /// Local variable slots; parameters come first.
    pub locals: Vec<Value>,
}

impl Frame {
    /// Create a frame with arguments bound to the leading local slots.
    ///
    /// The caller is responsible for arity checking and for filling in
    /// defaults; `args` must have exactly `code.arg_count` entries.
    pub fn new(code: Arc<CodeUnit>, module: Arc<ModuleObject>, args: Vec<Value>) -> HostResult<Self> {
        if args.len() != code.arg_count as usize {
            return Err(HostError::internal(format!(
                "frame for {} built with {} args, expected {}",
                code.name,
                args.len(),
                code.arg_count
            )));
        }

        let mut locals = vec![Value::None; code.locals.len()];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = arg;
        }

        Ok(Self {
            stack: Vec::with_capacity(code.stack_size as usize),
            code,
            module,
            ip: 0,
            locals,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.qualname)
            .field("ip", &self.ip)
            .field("stack", &self.stack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, Opcode};

    #[test]
    fn test_frame_binds_args() {
        let mut b = CodeBuilder::new("f", "t.wsp");
        b.set_line(1);
        b.set_arg_count(2);
        b.define_local("a");
        b.define_local("b");
        b.define_local("c");
        b.emit(Opcode::LoadLocal, 0);
        b.emit(Opcode::Return, 0);
        let code = Arc::new(b.finish());

        let module = ModuleObject::new("m");
        let frame = Frame::new(code, module, vec![Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(frame.locals.len(), 3);
        assert_eq!(frame.locals[0], Value::Int(1));
        assert_eq!(frame.locals[1], Value::Int(2));
        assert_eq!(frame.locals[2], Value::None);
    }

    #[test]
    fn test_frame_arity_mismatch_is_internal() {
        let mut b = CodeBuilder::new("f", "t.wsp");
        b.set_arg_count(1);
        b.define_local("a");
        b.emit(Opcode::Return, 0);
        let code = Arc::new(b.finish());

        let module = ModuleObject::new("m");
        let err = Frame::new(code, module, vec![]).unwrap_err();
        assert_eq!(err.exception_type(), "SystemError");
    }
}
