//! Guest value representation.
//!
//! `Value` is a clone-cheap enum: scalars are inline, everything else
//! is behind an `Arc`. Reference kinds (functions, capsules, natives)
//! compare by identity; scalars and containers compare structurally,
//! matching the guest language's equality semantics.

use crate::bytecode::CodeUnit;
use crate::error::{HostError, HostResult};
use crate::runtime::{ClassObject, FunctionObject, GeneratorObject, ModuleObject, TupleIter};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A native (engine- or builtin-provided) callable.
pub struct NativeFn {
    /// Display name.
    pub name: Arc<str>,
    func: Box<dyn Fn(&[Value]) -> HostResult<Value> + Send + Sync>,
}

impl NativeFn {
    /// Create a new native callable.
    pub fn new(
        name: impl Into<Arc<str>>,
        func: impl Fn(&[Value]) -> HostResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    /// Invoke the callable.
    #[inline]
    pub fn call(&self, args: &[Value]) -> HostResult<Value> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native function {}>", self.name)
    }
}

/// A guest value.
#[derive(Clone)]
pub enum Value {
    /// The `None` singleton.
    None,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Immutable string.
    Str(Arc<str>),
    /// Immutable tuple.
    Tuple(Arc<[Value]>),
    /// Compiled code block (appears in constant pools).
    Code(Arc<CodeUnit>),
    /// Guest function.
    Function(Arc<FunctionObject>),
    /// Native callable.
    Native(Arc<NativeFn>),
    /// Opaque payload threaded through constant pools by embedders.
    Capsule(Arc<dyn Any + Send + Sync>),
    /// Generator instance.
    Generator(Arc<GeneratorObject>),
    /// Tuple iterator.
    Iter(Arc<TupleIter>),
    /// Class object.
    Class(Arc<ClassObject>),
    /// Module object.
    Module(Arc<ModuleObject>),
}

impl Value {
    /// Build a string value.
    #[inline]
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    /// Build a tuple value.
    #[inline]
    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(items.into())
    }

    /// Check for `None`.
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Extract an integer.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract a float (integers widen).
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Extract a string.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a code unit.
    #[inline]
    pub fn as_code(&self) -> Option<&Arc<CodeUnit>> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }

    /// Guest truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            _ => true,
        }
    }

    /// Guest-visible type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Native(_) => "builtin_function",
            Value::Capsule(_) => "capsule",
            Value::Generator(_) => "generator",
            Value::Iter(_) => "tuple_iterator",
            Value::Class(_) => "type",
            Value::Module(_) => "module",
        }
    }

    /// Whether a `for` loop or `iter()` accepts this value.
    #[inline]
    pub fn is_iterable(&self) -> bool {
        matches!(
            self,
            Value::Tuple(_) | Value::Generator(_) | Value::Iter(_)
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Capsule(a), Value::Capsule(b)) => Arc::ptr_eq(a, b),
            (Value::Generator(a), Value::Generator(b)) => Arc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Code(c) => write!(f, "<code {}>", c.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Native(n) => write!(f, "{:?}", n),
            Value::Capsule(_) => write!(f, "<capsule>"),
            Value::Generator(g) => write!(f, "<generator {}>", g.name()),
            Value::Iter(_) => write!(f, "<tuple_iterator>"),
            Value::Class(c) => write!(f, "<class '{}'>", c.name),
            Value::Module(m) => write!(f, "<module '{}'>", m.name),
        }
    }
}

/// Arithmetic and comparison on guest values.
impl Value {
    /// Binary comparison used by `Compare`.
    pub fn compare(&self, op: crate::bytecode::CmpOp, other: &Value) -> HostResult<Value> {
        use crate::bytecode::CmpOp;

        let ord = match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            _ => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        };

        // Eq/Ne fall back to structural equality for non-ordered types.
        let result = match op {
            CmpOp::Eq => self == other,
            CmpOp::Ne => self != other,
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let ord = ord.ok_or_else(|| {
                    HostError::type_error(format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        op.symbol(),
                        self.type_name(),
                        other.type_name()
                    ))
                })?;
                match op {
                    CmpOp::Lt => ord == std::cmp::Ordering::Less,
                    CmpOp::Le => ord != std::cmp::Ordering::Greater,
                    CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                    CmpOp::Ge => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }
}
