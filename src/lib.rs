//! Execution core of a PHP bytecode virtual machine
//!
//! - [`core`]: tagged values, arrays, objects and references
//! - [`runtime`]: units, functions, classes and the engine/request contexts
//! - [`compiler`]: the text assembler producing units
//! - [`vm`]: evaluation stack, activation records, variable environments,
//!   member access and the interpreter loop

pub mod compiler;
pub mod core;
pub mod runtime;
pub mod vm;

pub use crate::compiler::assembler::assemble;
pub use crate::core::value::TypedValue;
pub use crate::runtime::context::{EngineBuilder, EngineContext};
pub use crate::vm::engine::{VM, VmError};
pub use crate::vm::executor::{ExecutionConfig, ExecutionResult};
