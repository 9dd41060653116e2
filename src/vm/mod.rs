pub mod assign_op;
pub mod call;
pub mod callable;
pub mod dispatch;
pub mod destruct;
pub mod engine;
mod error_construction;
pub mod executor;
pub mod frame;
pub mod inc_dec;
mod member;
mod member_ops;
pub mod opcode;
mod opcodes;
pub mod stack;
mod stack_helpers;
pub mod surprise;
pub mod unwind;
pub mod var_env;
mod visibility;
