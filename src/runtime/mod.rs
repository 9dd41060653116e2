pub mod builtins;
pub mod class;
pub mod context;
pub mod unit;
