//! Error construction helpers
//!
//! Provides convenient methods for creating specific VmError variants,
//! making error handling more ergonomic throughout the codebase.

use crate::vm::engine::VmError;
use crate::runtime::unit::Offset;

impl VmError {
    /// Create a stack underflow error for a specific operation
    pub fn stack_underflow(operation: &'static str) -> Self {
        VmError::StackUnderflow { operation }
    }

    /// Create a recoverable fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        VmError::Fatal(message.into())
    }

    /// Create an undefined function error
    pub fn undefined_function(name: impl Into<String>) -> Self {
        VmError::UndefinedFunction { name: name.into() }
    }

    /// Create an undefined method error; `context` is the calling class
    pub fn undefined_method(
        class: impl Into<String>,
        method: impl Into<String>,
        context: Option<impl Into<String>>,
    ) -> Self {
        VmError::UndefinedMethod {
            class: class.into(),
            method: method.into(),
            context: context.map(Into::into),
        }
    }

    /// Create a decoding error at a bytecode offset
    pub fn invalid_bytecode(offset: Offset, reason: impl Into<String>) -> Self {
        VmError::InvalidBytecode {
            offset,
            reason: reason.into(),
        }
    }

    /// Create a unit loading error
    pub fn load(message: impl Into<String>) -> Self {
        VmError::Load(message.into())
    }

    /// Whether the fault protocol turns this error into a catchable
    /// `FatalErrorException`
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VmError::StackOverflow
                | VmError::UndefinedFunction { .. }
                | VmError::UndefinedMethod { .. }
                | VmError::Fatal(_)
        )
    }
}
