mod common;

use common::{TestVm, run_asm_with_config};
use hhvm_core::core::value::TypedValue;
use hhvm_core::vm::dispatch::{DebuggerHook, DispatchMode, InstructionEvent, RunStatus};
use hhvm_core::vm::engine::VmError;
use hhvm_core::vm::executor::ExecutionConfig;
use hhvm_core::vm::opcode::Op;
use std::cell::RefCell;
use std::rc::Rc;

const COUNT_TO_TEN: &str = r#"
.main {
  Int 0; SetL $i; PopC
Head:
  CGetL $i; Int 10; Lt; JmpZ Done
  IncDecL $i PreInc; PopC
  Jmp Head
Done:
  CGetL $i
  RetC
}
"#;

#[test]
fn test_timeout_stops_recursive_loop() {
    let config = ExecutionConfig {
        timeout_ms: 30,
        ..ExecutionConfig::default()
    };
    let result = run_asm_with_config(
        r#"
.function spin() {
Top:
  Jmp Top
}
.main {
  String "started"; Print; PopC
  FPushFuncD 0 "spin"; FCall 0; PopR
  Null; RetC
}
"#,
        config,
    );
    assert_eq!(result.stdout, "started");
    assert!(matches!(result.error, Some(VmError::Timeout)));
}

/// The watchdog fault is not catchable by user handlers
#[test]
fn test_timeout_skips_catch_handlers() {
    let config = ExecutionConfig {
        timeout_ms: 30,
        ..ExecutionConfig::default()
    };
    let result = run_asm_with_config(
        r#"
.main {
  .try {
  Top:
    Jmp Top
  } .catch (Exception H)
H:
  Catch; PopC
  String "caught"; RetC
}
"#,
        config,
    );
    assert!(matches!(result.error, Some(VmError::Timeout)));
}

#[test]
fn test_infinite_recursion_overflows_the_stack() {
    let config = ExecutionConfig {
        stack_elms: 1024,
        ..ExecutionConfig::default()
    };
    let result = run_asm_with_config(
        r#"
.function down($n) {
  FPushFuncD 1 "down"; CGetL $n; FPassC 0; FCall 1; UnboxR
  RetC
}
.main {
  FPushFuncD 1 "down"; Int 0; FPassC 0; FCall 1; UnboxR
  RetC
}
"#,
        config,
    );
    assert_eq!(result.error.expect("overflow").to_string(), "Stack overflow");
}

#[test]
fn test_run_n_resumes_where_it_paused() {
    let mut t = TestVm::new(COUNT_TO_TEN);
    let main = t.main.clone();
    t.vm.start(&main).unwrap();
    let mut slices = 0;
    let value = loop {
        match t.vm.run_n(7).unwrap() {
            RunStatus::Paused => slices += 1,
            RunStatus::Finished(value) => break value,
        }
    };
    assert_eq!(value, TypedValue::Int(10));
    assert!(slices > 5);
    // the request is gone; a second run has nothing to resume
    assert!(t.vm.run().is_err());
}

#[test]
fn test_run_basic_block_steps_through_branches() {
    let mut t = TestVm::new(COUNT_TO_TEN);
    let main = t.main.clone();
    t.vm.start(&main).unwrap();
    let mut blocks = 0;
    let value = loop {
        match t.vm.run_basic_block().unwrap() {
            RunStatus::Paused => blocks += 1,
            RunStatus::Finished(value) => break value,
        }
    };
    assert_eq!(value, TypedValue::Int(10));
    // each iteration ends one block at JmpZ and one at Jmp
    assert!(blocks >= 20, "{blocks}");
}

#[test]
fn test_start_rejects_a_second_request() {
    let mut t = TestVm::new(COUNT_TO_TEN);
    let main = t.main.clone();
    t.vm.start(&main).unwrap();
    let err = t.vm.start(&main).unwrap_err();
    assert_eq!(err.to_string(), "A request is already running");
    assert_eq!(t.vm.run().unwrap(), TypedValue::Int(10));
}

#[test]
fn test_coverage_through_the_executor() {
    let config = ExecutionConfig {
        dispatch: DispatchMode::Coverage,
        ..ExecutionConfig::default()
    };
    let result = run_asm_with_config(
        ".function f() {\n  Int 1\n  RetC\n}\n.main {\n  FPushFuncD 0 \"f\"\n  FCall 0\n  PopR\n  FPushFuncD 0 \"f\"\n  FCall 0\n  UnboxR\n  RetC\n}\n",
        config,
    );
    let report = result.coverage.expect("coverage report");
    assert!(report.contains("main.hhas:2 2"), "{report}");
    assert!(report.contains("main.hhas:6 1"), "{report}");
    assert!(!report.contains("main.hhas:1 "), "{report}");
}

/// Stops the request the first time it sees `op`
struct Breakpoint {
    op: Op,
    seen: Rc<RefCell<u32>>,
}

impl DebuggerHook for Breakpoint {
    fn before_instruction(&mut self, event: &InstructionEvent<'_>) -> Result<(), VmError> {
        *self.seen.borrow_mut() += 1;
        if event.op == self.op {
            return Err(VmError::fatal(format!("break at offset {}", event.offset)));
        }
        Ok(())
    }
}

#[test]
fn test_debugger_hook_error_is_a_catchable_fatal() {
    let mut t = TestVm::new(
        r#"
.main {
  .try {
    Int 1; Int 2; Add; PopC
    String "unreachable"; RetC
  } .catch (FatalErrorException H)
H:
  Catch
  FPushObjMethodD 0 "getMessage"; FCall 0; UnboxR
  RetC
}
"#,
    );
    let seen = Rc::new(RefCell::new(0));
    t.vm.set_dispatch_mode(DispatchMode::Debugger);
    t.vm.set_debugger_hook(Box::new(Breakpoint {
        op: Op::Add,
        seen: seen.clone(),
    }));
    let main = t.main.clone();
    let result = t.vm.invoke_unit(&main);
    // the hook fires again inside the handler, which has no Add
    let message = result.unwrap().to_string_bytes();
    assert!(message.starts_with(b"break at offset "), "{:?}", message);
    assert!(*seen.borrow() > 3);
}

#[test]
fn test_external_observer_sees_nested_frames() {
    let mut t = TestVm::new(
        r#"
.function inner() { Null; RetC }
.main {
  FPushFuncD 0 "inner"; FCall 0; PopR
  Null; RetC
}
"#,
    );
    let funcs = Rc::new(RefCell::new(Vec::new()));
    let sink = funcs.clone();
    t.vm.set_dispatch_mode(DispatchMode::External);
    t.vm.set_instruction_observer(Box::new(move |e: &InstructionEvent<'_>| {
        sink.borrow_mut().push((e.func.name.to_string(), e.op))
    }));
    let main = t.main.clone();
    t.vm.invoke_unit(&main).unwrap();
    let funcs = funcs.borrow();
    assert!(funcs.contains(&("inner".to_string(), Op::Null)));
    assert_eq!(funcs.last().map(|(_, op)| *op), Some(Op::RetC));
}
