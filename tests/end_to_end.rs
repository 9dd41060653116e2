mod common;

use common::{run_asm, run_output, run_value};
use hhvm_core::core::value::TypedValue;
use hhvm_core::vm::engine::VmError;
use hhvm_core::vm::executor::FAULT_EXIT_CODE;

/// Recursive calls through FPushFuncD/FCall
/// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFCall, iopRetC
#[test]
fn test_recursive_fibonacci() {
    let code = r#"
.function fib($n) {
  CGetL $n; Int 2; Lt; JmpZ Recurse
  CGetL $n; RetC
Recurse:
  FPushFuncD 1 "fib"; CGetL $n; Int 1; Sub; FPassC 0; FCall 1; UnboxR
  FPushFuncD 1 "fib"; CGetL $n; Int 2; Sub; FPassC 0; FCall 1; UnboxR
  Add
  RetC
}
.main {
  FPushFuncD 1 "fib"; Int 15; FPassC 0; FCall 1; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(610));
}

#[test]
fn test_loop_prints_each_iteration() {
    let code = r#"
.main {
  Int 1; SetL $i; PopC
Head:
  CGetL $i; Int 5; Gt; JmpNZ Done
  CGetL $i; Print; PopC
  String ","; Print; PopC
  IncDecL $i PreInc; PopC
  Jmp Head
Done:
  Null; RetC
}
"#;
    assert_eq!(run_output(code), "1,2,3,4,5,");
}

#[test]
fn test_foreach_with_keys_and_print_r() {
    let code = r#"
.main {
  Array ["x" => 1, "y" => [2, 3]]; SetL $a; PopC
  CGetL $a; IterInit 0 End
Body:
  IterKey 0; Print; PopC
  String " "; Print; PopC
  IterNext 0 Body
End:
  String "\n"; Print; PopC
  FPushFuncD 1 "print_r"; CGetL $a; FPassC 0; FCall 1; PopR
  Null; RetC
}
"#;
    let expected = "x y \nArray\n(\n    [x] => 1\n    [y] => Array\n        (\n            [0] => 2\n            [1] => 3\n        )\n\n)\n";
    assert_eq!(run_output(code), expected);
}

/// Globals written by a function are visible to the pseudo-main
#[test]
fn test_globals_shared_between_function_and_main() {
    let code = r#"
.function bump() {
  String "total"; IncDecG PreInc; PopC
  Null; RetC
}
.main {
  Int 40; SetL $total; PopC
  FPushFuncD 0 "bump"; FCall 0; PopR
  FPushFuncD 0 "bump"; FCall 0; PopR
  CGetL $total
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(42));
}

#[test]
fn test_static_property_counter() {
    let code = r#"
.class Registry {
  .static [public] count = 0;
  .method [public static] add() {
    String "count"; String "Registry"; AGetC; IncDecS PreInc
    RetC
  }
}
.main {
  FPushClsMethodD 0 "add" "Registry"; FCall 0; PopR
  FPushClsMethodD 0 "add" "Registry"; FCall 0; PopR
  FPushClsMethodD 0 "add" "Registry"; FCall 0; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(3));
}

/// Objects, constructors and inheritance together
#[test]
fn test_constructor_and_inherited_method() {
    let code = r#"
.class Shape {
  .property [protected] name = "";
  .method [public] __construct($name) {
    CGetL $name; SetM <H PT:"name">; PopC
    Null; RetC
  }
  .method [public] describe() {
    String "I am "; CGetM <H PT:"name">; Concat
    RetC
  }
}
.class Square extends Shape { }
.main {
  FPushCtorD 1 "Square"; String "square"; FPassC 0; FCall 1; PopR
  SetL $s; PopC
  CGetL $s; InstanceOfD "Shape"; JmpZ No
  CGetL $s; FPushObjMethodD 0 "describe"; FCall 0; UnboxR
  RetC
No:
  String "not a shape"; RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"I am square");
}

#[test]
fn test_uncaught_exception_ends_request() {
    let code = r#"
.main {
  String "before "; Print; PopC
  FPushCtorD 1 "Exception"; String "kaboom"; FPassC 0; FCall 1; PopR
  Throw
}
"#;
    let result = run_asm(code);
    assert_eq!(result.stdout, "before ");
    assert_eq!(result.exit_code, FAULT_EXIT_CODE);
    match result.error {
        Some(VmError::Exception(obj)) => {
            assert_eq!(obj.class_name(), "Exception");
            assert_eq!(obj.get_prop(b"message").unwrap().to_string_bytes(), b"kaboom");
        }
        other => panic!("expected an exception, got {:?}", other),
    }
}

#[test]
fn test_notices_do_not_stop_the_request() {
    let code = r#"
.main {
  CGetL $missing; PopC
  NewArray; SetL $a; PopC
  CGetM <L:$a EI:3>; PopC
  String "done"; RetC
}
"#;
    let result = run_asm(code);
    assert!(result.is_success());
    assert_eq!(result.value.to_string_bytes(), b"done");
    assert_eq!(
        result.stderr,
        "Notice: Undefined variable: missing\nNotice: Undefined index: 3\n"
    );
}
