//! Centralized Code Execution API
//!
//! Assembles a unit, links it behind the prelude and runs it as one
//! request with configurable options. The CLI and the integration tests
//! both go through here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hhvm_core::vm::executor::{execute_asm, ExecutionConfig};
//!
//! let result = execute_asm(".main { Int 42; RetC }").unwrap();
//! assert_eq!(result.value, TypedValue::Int(42));
//!
//! let config = ExecutionConfig { timeout_ms: 1000, ..ExecutionConfig::default() };
//! let result = execute_asm_with_config(src, config).unwrap();
//! ```
//!
//! Load and link failures are returned as `Err`. Everything that happens
//! once the request runs (uncaught exceptions, fatals, `exit`, timeouts)
//! is part of the `ExecutionResult`.

use crate::compiler::assembler::assemble;
use crate::core::value::TypedValue;
use crate::runtime::context::EngineBuilder;
use crate::runtime::unit::Unit;
use crate::vm::dispatch::DispatchMode;
use crate::vm::engine::{CapturingErrorHandler, CapturingOutputWriter, RuntimeOptions, VM, VmError};
use crate::vm::stack::DEFAULT_STACK_ELMS;
use crate::vm::unwind::BacktraceFrame;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit status of a request that died on an uncaught fault
pub const FAULT_EXIT_CODE: i64 = 255;

/// Configuration for code execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Evaluation stack size in cells (power of two)
    pub stack_elms: usize,
    /// Maximum execution time in milliseconds (0 = unlimited)
    pub timeout_ms: u64,
    pub dispatch: DispatchMode,
    /// `error_reporting` mask (E_ALL by default)
    pub error_reporting: u32,
    /// Capture output and diagnostics into the result
    pub capture_output: bool,
    /// Report E_STRICT diagnostics
    pub strict_warnings: bool,
    /// Record the frame chain of uncaught faults
    pub backtrace: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stack_elms: DEFAULT_STACK_ELMS,
            timeout_ms: 0,
            dispatch: DispatchMode::Direct,
            error_reporting: 32767, // E_ALL
            capture_output: true,
            strict_warnings: false,
            backtrace: false,
        }
    }
}

impl ExecutionConfig {
    pub fn from_json(text: &str) -> Result<Self, VmError> {
        serde_json::from_str(text).map_err(|e| VmError::load(format!("Invalid configuration: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self, VmError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmError::load(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            stack_elms: self.stack_elms,
            strict_warnings: self.strict_warnings,
            dispatch: self.dispatch,
            timeout: (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)),
            backtrace: self.backtrace,
        }
    }
}

/// Outcome of one request
#[derive(Debug)]
pub struct ExecutionResult {
    /// Return value of the pseudo-main; null when the request did not finish
    pub value: TypedValue,
    /// Captured output
    pub stdout: String,
    /// Captured diagnostics, one `Level: message` line each
    pub stderr: String,
    /// Execution time in microseconds
    pub duration_us: u64,
    /// `exit()` status, `FAULT_EXIT_CODE` after an uncaught fault, else 0
    pub exit_code: i64,
    /// Uncaught fault that ended the request
    pub error: Option<VmError>,
    /// Frames live when `error` was raised (with `backtrace` enabled)
    pub backtrace: Vec<BacktraceFrame>,
    /// `file:line hits` report in `Coverage` mode
    pub coverage: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Execute assembly with the default configuration
///
/// ```rust,ignore
/// let result = execute_asm(".main { Int 2; Int 2; Add; RetC }").unwrap();
/// assert_eq!(result.value, TypedValue::Int(4));
/// ```
pub fn execute_asm(source: &str) -> Result<ExecutionResult, VmError> {
    execute_asm_with_config(source, ExecutionConfig::default())
}

pub fn execute_asm_with_config(source: &str, config: ExecutionConfig) -> Result<ExecutionResult, VmError> {
    let unit = assemble(source, "main.hhas")?;
    execute_unit(unit, config)
}

/// Assemble and run a `.hhas` file
pub fn execute_file(path: &Path, config: ExecutionConfig) -> Result<ExecutionResult, VmError> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| VmError::load(format!("Cannot read {}: {}", path.display(), e)))?;
    let unit = assemble(&source, &path.display().to_string())?;
    execute_unit(unit, config)
}

/// Link `unit` behind the prelude and run its pseudo-main
pub fn execute_unit(unit: Unit, config: ExecutionConfig) -> Result<ExecutionResult, VmError> {
    let start = Instant::now();
    let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build()?);
    let main = engine
        .main_unit()
        .cloned()
        .ok_or_else(|| VmError::load("No unit to run"))?;

    let mut vm = VM::with_options(engine, config.runtime_options())?;
    vm.context.error_reporting = config.error_reporting;

    let captured_stdout = Rc::new(RefCell::new(Vec::<u8>::new()));
    let captured_stderr = Rc::new(RefCell::new(String::new()));
    if config.capture_output {
        let stdout_clone = captured_stdout.clone();
        vm.set_output_writer(Box::new(CapturingOutputWriter::new(move |bytes: &[u8]| {
            stdout_clone.borrow_mut().extend_from_slice(bytes);
        })));
        let stderr_clone = captured_stderr.clone();
        vm.set_error_handler(Box::new(CapturingErrorHandler::new(move |level, message: &str| {
            let mut stderr = stderr_clone.borrow_mut();
            stderr.push_str(level.label());
            stderr.push_str(": ");
            stderr.push_str(message);
            stderr.push('\n');
        })));
    }

    let outcome = vm.start(&main).and_then(|()| vm.run());
    let outcome = match outcome {
        Ok(_) | Err(VmError::Exit(_)) => match vm.end_request() {
            Ok(()) => outcome,
            Err(err) => Err(err),
        },
        Err(err) => {
            vm.abandon_request();
            Err(err)
        }
    };
    vm.cancel_timeout();
    vm.flush_output()?;

    let (value, exit_code, error) = match outcome {
        Ok(value) => (value, 0, None),
        Err(VmError::Exit(code)) => (TypedValue::Null, code, None),
        Err(err) => {
            warn!(error = %err, "request ended with an uncaught fault");
            (TypedValue::Null, FAULT_EXIT_CODE, Some(err))
        }
    };
    let backtrace = if error.is_some() {
        vm.fault_backtrace().to_vec()
    } else {
        Vec::new()
    };
    let coverage = (config.dispatch == DispatchMode::Coverage).then(|| vm.coverage().report());
    let duration_us = start.elapsed().as_micros() as u64;
    debug!(duration_us, exit_code, "request finished");

    let stdout = String::from_utf8_lossy(&captured_stdout.borrow()).into_owned();
    let stderr = captured_stderr.borrow().clone();
    Ok(ExecutionResult {
        value,
        stdout,
        stderr,
        duration_us,
        exit_code,
        error,
        backtrace,
        coverage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_execution() {
        let result = execute_asm(".main { Int 42; RetC }").unwrap();
        assert_eq!(result.value, TypedValue::Int(42));
        assert!(result.is_success());
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn test_output_and_diagnostics_capture() {
        let result = execute_asm(
            r#".main {
              String "hi"; Print; PopC
              CGetL $nope; PopC
              Null; RetC
            }"#,
        )
        .unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.stderr, "Notice: Undefined variable: nope\n");
    }

    #[test]
    fn test_error_reporting_mask() {
        let config = ExecutionConfig {
            error_reporting: 0,
            ..ExecutionConfig::default()
        };
        let result = execute_asm_with_config(".main { CGetL $nope; RetC }", config).unwrap();
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_assembly_errors_are_load_errors() {
        let err = execute_asm(".main { Bogus }").unwrap_err();
        assert!(matches!(err, VmError::Load(_)));
    }

    #[test]
    fn test_exit_sets_the_code() {
        let result = execute_asm(".main { String \"bye\"; Exit }").unwrap();
        assert_eq!(result.stdout, "bye");
        assert_eq!(result.exit_code, 0);
        let result = execute_asm(".main { Int 3; Exit }").unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.is_success());
    }

    #[test]
    fn test_timeout_infinite_loop() {
        let config = ExecutionConfig {
            timeout_ms: 50,
            ..ExecutionConfig::default()
        };
        let result = execute_asm_with_config(".main {\nL0:\n  Jmp L0\n}", config).unwrap();
        let err = result.error.expect("timeout");
        assert!(matches!(err, VmError::Timeout));
        assert_eq!(err.to_string(), "Maximum execution time exceeded");
    }

    #[test]
    fn test_uncaught_fault_backtrace() {
        let config = ExecutionConfig {
            backtrace: true,
            ..ExecutionConfig::default()
        };
        let result = execute_asm_with_config(
            r#"
            .function inner() {
              String "deep"
              Fatal
            }
            .function outer() {
              FPushFuncD 0 "inner"; FCall 0; PopR
              Null; RetC
            }
            .main {
              FPushFuncD 0 "outer"; FCall 0; PopR
              Null; RetC
            }
            "#,
            config,
        )
        .unwrap();
        assert_eq!(result.error.as_ref().unwrap().to_string(), "deep");
        assert_eq!(result.exit_code, FAULT_EXIT_CODE);
        let names: Vec<&str> = result.backtrace.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer", ""]);
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = ExecutionConfig::from_json(r#"{"timeout_ms": 250, "dispatch": "Coverage"}"#).unwrap();
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.dispatch, DispatchMode::Coverage);
        assert_eq!(config.stack_elms, DEFAULT_STACK_ELMS);
        assert!(config.capture_output);
        assert!(ExecutionConfig::from_json("{\"stack_elms\": \"big\"}").is_err());
    }

    #[test]
    fn test_coverage_report() {
        let config = ExecutionConfig {
            dispatch: DispatchMode::Coverage,
            ..ExecutionConfig::default()
        };
        let result = execute_asm_with_config(".main {\n  Int 1\n  RetC\n}", config).unwrap();
        let report = result.coverage.unwrap();
        assert!(report.contains("main.hhas:2 1"));
        assert!(report.contains("main.hhas:3 1"));
    }
}
