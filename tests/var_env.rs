mod common;

use common::{run_asm, run_value};
use hhvm_core::core::value::TypedValue;

/// Variables created by name live next to the compiled locals
#[test]
fn test_dynamic_variables_in_function() {
    let code = r#"
.function f() {
  String "dyn"; Int 7; SetN; PopC
  Int 1; SetL $local; PopC
  String "local"; CGetN
  String "dyn"; CGetN
  Add
  RetC
}
.main {
  FPushFuncD 0 "f"; FCall 0; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(8));
}

/// Reference: HHVM `runtime/ext/ext_array.cpp` - f_extract, f_compact
#[test]
fn test_extract_then_compact() {
    let code = r#"
.function f() {
  FPushFuncD 1 "extract"; Array ["x" => 2, "y" => 3]; FPassC 0; FCall 1; PopR
  CGetL $x; CGetL $y; Mul; SetL $z; PopC
  FPushFuncD 2 "compact"; String "z"; FPassC 0; String "x"; FPassC 1; FCall 2; UnboxR
  RetC
}
.main {
  FPushFuncD 0 "f"; FCall 0; UnboxR; SetL $out; PopC
  CGetM <L:$out ET:"z">; String ","; Concat
  CGetM <L:$out ET:"x">; Concat
  RetC
}
"#;
    let result = run_asm(code);
    assert_eq!(result.value.to_string_bytes(), b"6,2");
    assert!(result.stderr.is_empty(), "{}", result.stderr);
}

#[test]
fn test_get_defined_vars_sees_params_and_dynamic_names() {
    let code = r#"
.function f($a) {
  String "b"; Int 2; SetN; PopC
  FPushFuncD 0 "get_defined_vars"; FCall 0; UnboxR; SetL $vars; PopC
  FPushFuncD 1 "count"; CGetL $vars; FPassC 0; FCall 1; UnboxR
  RetC
}
.main {
  FPushFuncD 1 "f"; Int 1; FPassC 0; FCall 1; UnboxR
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(2));
}

#[test]
fn test_pseudo_main_locals_are_globals() {
    let code = r#"
.function read() {
  String "shared"; CGetG
  RetC
}
.function write() {
  String "fresh"; String "made in write"; SetG; PopC
  Null; RetC
}
.main {
  String "from main"; SetL $shared; PopC
  FPushFuncD 0 "write"; FCall 0; PopR
  FPushFuncD 0 "read"; FCall 0; UnboxR
  String " / "; Concat
  CGetL $fresh; Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"from main / made in write");
}

#[test]
fn test_global_reference_binding() {
    let code = r#"
.function link() {
  String "g"; VGetG; BindL $alias; PopV
  Int 99; SetL $alias; PopC
  Null; RetC
}
.main {
  Int 1; SetL $g; PopC
  FPushFuncD 0 "link"; FCall 0; PopR
  CGetL $g
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(99));
}

#[test]
fn test_func_get_args_outside_a_function() {
    let result = run_asm(
        r#"
.main {
  FPushFuncD 0 "func_get_args"; FCall 0; UnboxR
  RetC
}
"#,
    );
    assert_eq!(result.value, TypedValue::Bool(false));
    assert_eq!(
        result.stderr,
        "Warning: func_get_args():  Called from the global scope - no function context\n"
    );
}

#[test]
fn test_unset_named_variable() {
    let code = r#"
.main {
  Int 1; SetL $v; PopC
  String "v"; UnsetN
  IssetL $v
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Bool(false));
}
