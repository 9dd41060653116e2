//! Opcode execution modules
//!
//! Instruction handlers grouped by category. Calls, returns and exception
//! handling live with the machinery they drive (`vm::call`, `vm::unwind`),
//! member instructions in `vm::member_ops`.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - iop* handlers

pub mod arithmetic;
pub mod array_ops;
pub mod comparison;
pub mod continuation;
pub mod control_flow;
pub mod declarations;
pub mod iter;
pub mod special;
pub mod variables;
