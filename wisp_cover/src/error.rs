//! Engine error types.
//!
//! Four error families with distinct propagation policies:
//! - `Config` is fatal at driver construction.
//! - `Bytecode` is per-unit: logged, and the unit passes through
//!   uninstrumented.
//! - `ProbeRuntime` surfaces as a host-level error at the probe call
//!   site.
//! - `Replacer` is per-root: logged, and the old code stays in place.

use thiserror::Error;

/// The engine result type.
pub type EngineResult<T> = Result<T, EngineError>;

/// Coverage engine errors.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Invalid or conflicting configuration. Fatal at initialization.
    #[error("ConfigError: {message}")]
    Config {
        /// Error description.
        message: String,
    },

    /// Malformed bytecode or irreparable metadata in one code unit.
    #[error("BytecodeError: {message} (in {unit})")]
    Bytecode {
        /// Error description.
        message: String,
        /// Qualified name of the offending unit.
        unit: String,
    },

    /// Internal failure inside a probe's signal path.
    #[error("ProbeRuntimeError: {message}")]
    ProbeRuntime {
        /// Error description.
        message: String,
    },

    /// Failure while rewriting a live reference.
    #[error("ReplacerError: {message}")]
    Replacer {
        /// Error description.
        message: String,
    },
}

impl EngineError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a per-unit bytecode error.
    #[must_use]
    pub fn bytecode(message: impl Into<String>, unit: impl Into<String>) -> Self {
        Self::Bytecode {
            message: message.into(),
            unit: unit.into(),
        }
    }

    /// Create a probe runtime error.
    #[must_use]
    pub fn probe(message: impl Into<String>) -> Self {
        Self::ProbeRuntime {
            message: message.into(),
        }
    }

    /// Create a replacer error.
    #[must_use]
    pub fn replacer(message: impl Into<String>) -> Self {
        Self::Replacer {
            message: message.into(),
        }
    }
}
