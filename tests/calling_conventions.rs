mod common;

use common::{TestVm, run_asm, run_value};
use hhvm_core::core::value::TypedValue;
use hhvm_core::vm::engine::ErrorLevel;
use hhvm_core::vm::frame::ThisOrClass;

/// Arguments past the declared parameters are only reachable through
/// func_get_args()/func_get_arg()
#[test]
fn test_surplus_arguments() {
    let code = r#"
.function sum($first) {
  FPushFuncD 0 "func_get_args"; FCall 0; UnboxR; SetL $all; PopC
  Int 0; SetL $total; PopC
  CGetL $all; IterInit 0 End
Body:
  IterValueC 0; SetOpL $total PlusEqual; PopC
  IterNext 0 Body
End:
  CGetL $total
  RetC
}
.main {
  FPushFuncD 4 "sum"
  Int 1; FPassC 0
  Int 2; FPassC 1
  Int 3; FPassC 2
  Int 4; FPassC 3
  FCall 4; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(10));
}

#[test]
fn test_missing_arguments_warn_and_read_as_null() {
    let code = r#"
.function pair($a, $b) {
  IsTypeL $b Null
  RetC
}
.main {
  FPushFuncD 1 "pair"; Int 1; FPassC 0; FCall 1; UnboxR
  RetC
}
"#;
    let result = run_asm(code);
    assert_eq!(result.value, TypedValue::Bool(true));
    assert_eq!(result.stderr, "Warning: Missing argument 2 to pair()\n");
}

#[test]
fn test_default_values_run_from_first_missing_parameter() {
    let code = r#"
.function greet($name = DV0, $punct = DV1) {
INIT:
  CGetL $name; CGetL $punct; Concat
  RetC
DV0:
  String "world"; SetL $name; PopC
DV1:
  String "!"; SetL $punct; PopC
  Jmp INIT
}
.main {
  FPushFuncD 0 "greet"; FCall 0; UnboxR
  String " "; Concat
  FPushFuncD 1 "greet"; String "you"; FPassC 0; FCall 1; UnboxR
  Concat
  String " "; Concat
  FPushFuncD 2 "greet"; String "me"; FPassC 0; String "?"; FPassC 1; FCall 2; UnboxR
  Concat
  RetC
}
"#;
    let result = run_asm(code);
    assert_eq!(result.value.to_string_bytes(), b"world! you! me?");
    assert!(result.stderr.is_empty(), "{}", result.stderr);
}

#[test]
fn test_dynamic_function_name() {
    let code = r#"
.function twice($x) { CGetL $x; Int 2; Mul; RetC }
.main {
  String "TWICE"; FPushFunc 1; Int 21; FPassC 0; FCall 1; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(42));
}

#[test]
fn test_undefined_function_is_a_fatal() {
    let result = run_asm(".main {\n  FPushFuncD 0 \"nope\"\n  FCall 0\n  RetC\n}");
    let err = result.error.expect("fatal");
    assert_eq!(err.to_string(), "Call to undefined function nope()");
}

/// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushObjMethodD (magic __call)
#[test]
fn test_magic_call_gets_original_arguments() {
    let code = r#"
.class Proxy {
  .method [public] __call($name, $args) {
    CGetL $name; String "("; Concat
    FPushFuncD 1 "count"; CGetL $args; FPassC 0; FCall 1; UnboxR
    Concat; String ")"; Concat
    RetC
  }
}
.main {
  FPushCtorD 0 "Proxy"; FCall 0; PopR
  FPushObjMethodD 3 "anything"
  Int 1; FPassC 0
  Int 2; FPassC 1
  Int 3; FPassC 2
  FCall 3; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"anything(3)");
}

#[test]
fn test_call_user_func_callable_forms() {
    let code = r#"
.function add($a, $b) { CGetL $a; CGetL $b; Add; RetC }
.class Math {
  .property [public] base = 100;
  .method [public] plus($n) { CGetM <H PT:"base">; CGetL $n; Add; RetC }
  .method [public static] neg($n) { Int 0; CGetL $n; Sub; RetC }
}
.main {
  FPushFuncD 3 "call_user_func"
  String "add"; FPassC 0; Int 1; FPassC 1; Int 2; FPassC 2
  FCall 3; UnboxR; SetL $r1; PopC

  FPushCtorD 0 "Math"; FCall 0; PopR
  SetL $m; PopC
  FPushFuncD 2 "call_user_func"
  NewArray; CGetL $m; AddNewElemC; String "plus"; AddNewElemC; FPassC 0
  Int 5; FPassC 1
  FCall 2; UnboxR; SetL $r2; PopC

  FPushFuncD 2 "call_user_func_array"
  String "Math::neg"; FPassC 0
  Array [7]; FPassC 1
  FCall 2; UnboxR; SetL $r3; PopC

  CGetL $r1; String ","; Concat; CGetL $r2; Concat; String ","; Concat; CGetL $r3; Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"3,105,-7");
}

/// Natives call back into bytecode, which calls natives again
#[test]
fn test_reentrant_call_user_func() {
    let code = r#"
.function depth($n) {
  CGetL $n; JmpNZ More
  String "."; RetC
More:
  FPushFuncD 2 "call_user_func"
  String "depth"; FPassC 0
  CGetL $n; Int 1; Sub; FPassC 1
  FCall 2; UnboxR
  CGetL $n; Concat
  RetC
}
.main {
  FPushFuncD 1 "depth"; Int 5; FPassC 0; FCall 1; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b".12345");
}

#[test]
fn test_exception_crosses_native_frames() {
    let code = r#"
.function thrower() {
  FPushCtorD 1 "Exception"; String "from callback"; FPassC 0; FCall 1; PopR
  Throw
}
.main {
  .try {
    FPushFuncD 1 "call_user_func"; String "thrower"; FPassC 0; FCall 1; PopR
    String "not reached"; RetC
  } .catch (Exception H)
H:
  Catch
  FPushObjMethodD 0 "getMessage"; FCall 0; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"from callback");
}

/// A constructor that throws leaves its object marked so no destructor
/// runs for it
#[test]
fn test_faulting_constructor_marks_no_destruct() {
    let code = r#"
.class Fragile {
  .method [public] __construct() {
    String "half"; This; SetG; PopC
    FPushCtorD 1 "Exception"; String "ctor failed"; FPassC 0; FCall 1; PopR
    Throw
  }
}
.main {
  .try {
    FPushCtorD 0 "Fragile"; FCall 0; PopR
    PopC
  } .catch (Exception H)
H:
  Catch; PopC
  String "half"; CGetG
  RetC
}
"#;
    match run_value(code) {
        TypedValue::Object(obj) => {
            assert_eq!(obj.class_name(), "Fragile");
            assert!(obj.no_destruct.get());
        }
        other => panic!("expected the half-built object, got {:?}", other),
    }
}

#[test]
fn test_invoke_func_from_rust() {
    let mut t = TestVm::new(
        r#"
.function scale($x, $by = DV1) {
INIT:
  CGetL $x; CGetL $by; Mul
  RetC
DV1:
  Int 10; SetL $by; PopC
  Jmp INIT
}
.main { Null; RetC }
"#,
    );
    let func = t.vm.engine().lookup_func("scale").cloned().expect("scale");
    let full = t
        .vm
        .invoke_func(&func, &[TypedValue::Int(2), TypedValue::Int(3)], ThisOrClass::Empty, None, None)
        .unwrap();
    assert_eq!(full, TypedValue::Int(6));
    let defaulted = t
        .vm
        .invoke_func(&func, &[TypedValue::Int(4)], ThisOrClass::Empty, None, None)
        .unwrap();
    assert_eq!(defaulted, TypedValue::Int(40));
    assert_eq!(t.vm.frame_depth(), 0);
}

#[test]
fn test_call_user_func_from_rust_with_bad_callable() {
    let mut t = TestVm::new(".main { Null; RetC }");
    let result = t.vm.call_user_func(&TypedValue::string("missing_fn"), &[]).unwrap();
    assert_eq!(result, TypedValue::Null);
    let diagnostics = t.diagnostics.borrow();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].0, ErrorLevel::Warning);
    assert_eq!(
        diagnostics[0].1,
        "call_user_func() expects parameter 1 to be a valid callback"
    );
}

/// Surplus arguments stay reachable when the callee runs in an inherited
/// scope
#[test]
fn test_surplus_arguments_with_inherited_scope() {
    let mut t = TestVm::new(
        r#"
.function tally($first) {
  FPushFuncD 0 "func_get_args"; FCall 0; UnboxR; SetL $all; PopC
  FPushFuncD 1 "count"; CGetL $all; FPassC 0; FCall 1; UnboxR
  RetC
}
.main { Null; RetC }
"#,
    );
    let func = t.vm.engine().lookup_func("tally").cloned().expect("tally");
    let env = t.vm.global_env();
    let args = [TypedValue::Int(1), TypedValue::Int(2), TypedValue::Int(3)];
    let counted = t
        .vm
        .invoke_func(&func, &args, ThisOrClass::Empty, Some(env), None)
        .unwrap();
    assert_eq!(counted, TypedValue::Int(3));
    assert!(t.messages().is_empty(), "{:?}", t.messages());
}
