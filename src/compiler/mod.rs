pub mod assembler;
pub mod emitter;
