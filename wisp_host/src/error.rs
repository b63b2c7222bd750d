//! Error types and result definitions for the Wisp VM.
//!
//! Two error families cover the host's phases:
//! - `CompileError` for bytecode generation failures
//! - `HostError` for guest-program execution failures

use std::fmt;
use thiserror::Error;

/// The unified result type for guest execution.
pub type HostResult<T> = Result<T, HostError>;

/// Runtime error raised while executing guest code.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    /// Name not found in scope.
    #[error("NameError: name '{name}' is not defined")]
    Name {
        /// The undefined name.
        name: String,
    },

    /// Dynamic type mismatch.
    #[error("TypeError: {message}")]
    Type {
        /// Error description.
        message: String,
    },

    /// Division or modulo by zero.
    #[error("ZeroDivisionError: {message}")]
    ZeroDivision {
        /// Error description.
        message: String,
    },

    /// Index out of bounds.
    #[error("IndexError: {message}")]
    Index {
        /// Error description.
        message: String,
    },

    /// Iterator exhaustion signal (not an error in normal flow).
    #[error("StopIteration")]
    StopIteration,

    /// Exception raised by guest code via `raise`.
    #[error("Exception: {message}")]
    Raised {
        /// The raised payload, rendered.
        message: String,
    },

    /// Recursion limit exceeded.
    #[error("RecursionError: maximum recursion depth exceeded")]
    Recursion,

    /// Internal VM error (should never occur in correct code).
    #[error("InternalError: {message}")]
    Internal {
        /// Error description.
        message: String,
    },
}

impl HostError {
    /// Create a name error.
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name { name: name.into() }
    }

    /// Create a type error.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }

    /// Create a zero-division error.
    #[must_use]
    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::ZeroDivision {
            message: message.into(),
        }
    }

    /// Create an index error.
    #[must_use]
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
        }
    }

    /// Create a guest-raised exception.
    #[must_use]
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the guest-visible exception type name.
    #[must_use]
    pub fn exception_type(&self) -> &'static str {
        match self {
            Self::Name { .. } => "NameError",
            Self::Type { .. } => "TypeError",
            Self::ZeroDivision { .. } => "ZeroDivisionError",
            Self::Index { .. } => "IndexError",
            Self::StopIteration => "StopIteration",
            Self::Raised { .. } => "Exception",
            Self::Recursion => "RecursionError",
            Self::Internal { .. } => "SystemError",
        }
    }

    /// Whether this error can be caught by a guest `except:` handler.
    ///
    /// Internal errors and recursion overflows unwind past handlers.
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Self::Internal { .. } | Self::Recursion)
    }
}

/// Error produced while lowering an AST to wordcode.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Error description.
    pub message: String,
    /// Source line (1-indexed, 0 if unknown).
    pub line: u32,
}

impl CompileError {
    /// Create a compile error at a line.
    #[must_use]
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompileError: {} (line {})", self.message, self.line)
    }
}

impl std::error::Error for CompileError {}

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_error() {
        let err = HostError::name("x");
        assert_eq!(err.exception_type(), "NameError");
        assert_eq!(err.to_string(), "NameError: name 'x' is not defined");
        assert!(err.is_catchable());
    }

    #[test]
    fn test_type_error() {
        let err = HostError::type_error("unsupported operand");
        assert_eq!(err.exception_type(), "TypeError");
        assert!(err.to_string().contains("unsupported operand"));
    }

    #[test]
    fn test_zero_division() {
        let err = HostError::zero_division("division by zero");
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
    }

    #[test]
    fn test_stop_iteration() {
        let err = HostError::StopIteration;
        assert_eq!(err.exception_type(), "StopIteration");
    }

    #[test]
    fn test_internal_not_catchable() {
        assert!(!HostError::internal("corrupt frame").is_catchable());
        assert!(!HostError::Recursion.is_catchable());
        assert!(HostError::raised("boom").is_catchable());
    }

    #[test]
    fn test_compile_error_display() {
        let err = CompileError::new("break outside loop", 7);
        assert!(err.to_string().contains("break outside loop"));
        assert!(err.to_string().contains("line 7"));
    }
}
