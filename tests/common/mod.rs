//! Common test utilities for the integration tests
//!
//! Most tests go through the executor (`run_asm*`). Tests that need to
//! drive the interpreter directly (bounded runs, hooks, reentry from Rust)
//! use `TestVm`, which wires capturing writers into a plain `VM`.

use hhvm_core::compiler::assembler::assemble;
use hhvm_core::core::value::TypedValue;
use hhvm_core::runtime::context::EngineBuilder;
use hhvm_core::runtime::unit::Unit;
use hhvm_core::vm::engine::{CapturingErrorHandler, CapturingOutputWriter, ErrorLevel, VM};
use hhvm_core::vm::executor::{ExecutionConfig, ExecutionResult, execute_asm_with_config};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Route `tracing` output through the test harness (`RUST_LOG=debug cargo test`)
#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Assemble and run with the default configuration
#[allow(dead_code)]
pub fn run_asm(src: &str) -> ExecutionResult {
    run_asm_with_config(src, ExecutionConfig::default())
}

#[allow(dead_code)]
pub fn run_asm_with_config(src: &str, config: ExecutionConfig) -> ExecutionResult {
    init_logging();
    execute_asm_with_config(src, config).expect("assembly failed to load")
}

/// Run and return the pseudo-main's value; the request must succeed
#[allow(dead_code)]
pub fn run_value(src: &str) -> TypedValue {
    let result = run_asm(src);
    if let Some(err) = &result.error {
        panic!("request failed: {} (stderr: {:?})", err, result.stderr);
    }
    result.value
}

/// Run and return everything the request printed
#[allow(dead_code)]
pub fn run_output(src: &str) -> String {
    let result = run_asm(src);
    if let Some(err) = &result.error {
        panic!("request failed: {} (output so far: {:?})", err, result.stdout);
    }
    result.stdout
}

/// Diagnostics of a request as `(level, message)` pairs
#[allow(dead_code)]
pub type Diagnostics = Rc<RefCell<Vec<(ErrorLevel, String)>>>;

/// A VM over one assembled unit with captured output and diagnostics
#[allow(dead_code)]
pub struct TestVm {
    pub vm: VM,
    pub main: Arc<Unit>,
    pub output: Rc<RefCell<Vec<u8>>>,
    pub diagnostics: Diagnostics,
}

#[allow(dead_code)]
impl TestVm {
    pub fn new(src: &str) -> Self {
        init_logging();
        let unit = assemble(src, "test.hhas").expect("assembly failed");
        let engine = Arc::new(
            EngineBuilder::new()
                .with_prelude()
                .with_unit(unit)
                .build()
                .expect("Failed to build engine"),
        );
        let main = engine.main_unit().cloned().expect("no main unit");

        let output = Rc::new(RefCell::new(Vec::new()));
        let diagnostics: Diagnostics = Rc::new(RefCell::new(Vec::new()));
        let out = output.clone();
        let diag = diagnostics.clone();
        let vm = VM::new(engine)
            .with_output_writer(Box::new(CapturingOutputWriter::new(move |bytes: &[u8]| {
                out.borrow_mut().extend_from_slice(bytes)
            })))
            .with_error_handler(Box::new(CapturingErrorHandler::new(
                move |level, msg: &str| diag.borrow_mut().push((level, msg.to_string())),
            )));
        Self {
            vm,
            main,
            output,
            diagnostics,
        }
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.borrow()).into_owned()
    }

    pub fn messages(&self) -> Vec<String> {
        self.diagnostics.borrow().iter().map(|(_, m)| m.clone()).collect()
    }
}
