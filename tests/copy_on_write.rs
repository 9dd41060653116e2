mod common;

use common::run_value;
use hhvm_core::core::value::TypedValue;

/// Arrays have value semantics: a write separates the shared copy
#[test]
fn test_array_copy_is_separated_on_write() {
    let code = r#"
.main {
  Array [[1, 2], [3]]; SetL $a; PopC
  CGetL $a; SetL $b; PopC
  Int 9; SetM <L:$b EI:0 EI:0>; PopC
  CGetM <L:$a EI:0 EI:0>; CGetM <L:$b EI:0 EI:0>; Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"19");
}

#[test]
fn test_by_value_parameter_does_not_touch_caller() {
    let code = r#"
.function grow($arr) {
  Int 5; SetM <L:$arr W>; PopC
  FPushFuncD 1 "count"; CGetL $arr; FPassC 0; FCall 1; UnboxR
  RetC
}
.main {
  Array [1, 2]; SetL $a; PopC
  FPushFuncD 1 "grow"; CGetL $a; FPassC 0; FCall 1; UnboxR
  CastString; String "/"; Concat
  FPushFuncD 1 "count"; CGetL $a; FPassC 0; FCall 1; UnboxR
  Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"3/2");
}

/// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPassL
#[test]
fn test_by_reference_parameter_writes_through() {
    let code = r#"
.function add_one(&$x) {
  IncDecL $x PreInc; PopC
  Null; RetC
}
.main {
  Int 1; SetL $v; PopC
  FPushFuncD 1 "add_one"; FPassL 0 $v; FCall 1; PopR
  FPushFuncD 1 "add_one"; FPassL 0 $v; FCall 1; PopR
  CGetL $v
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(3));
}

#[test]
fn test_reference_parameter_into_array_element() {
    let code = r#"
.function append(&$list, $v) {
  CGetL $v; SetM <L:$list W>; PopC
  Null; RetC
}
.main {
  FPushFuncD 2 "append"; FPassM 0 <L:$data ET:"items">; String "x"; FPassC 1; FCall 2; PopR
  FPushFuncD 2 "append"; FPassM 0 <L:$data ET:"items">; String "y"; FPassC 1; FCall 2; PopR
  CGetM <L:$data ET:"items" EI:0>; CGetM <L:$data ET:"items" EI:1>; Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"xy");
}

#[test]
fn test_element_reference_binding() {
    let code = r#"
.main {
  Int 1; SetM <L:$a ET:"x">; PopC
  VGetM <L:$a ET:"x">; BindL $r; PopV
  Int 5; SetL $r; PopC
  CGetM <L:$a ET:"x">
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(5));
}

/// Objects are handles: copies of the handle see the same properties
#[test]
fn test_objects_are_shared_handles() {
    let code = r#"
.class Counter { .property [public] n = 0; }
.main {
  FPushCtorD 0 "Counter"; FCall 0; PopR
  SetL $a; PopC
  CGetL $a; SetL $b; PopC
  IncDecM PreInc <L:$b PT:"n">; PopC
  IncDecM PreInc <L:$a PT:"n">; PopC
  CGetM <L:$a PT:"n">
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(2));
}

#[test]
fn test_array_held_in_property_separates_from_local() {
    let code = r#"
.class Holder { .property [public] items = [1]; }
.main {
  FPushCtorD 0 "Holder"; FCall 0; PopR
  SetL $h; PopC
  CGetM <L:$h PT:"items">; SetL $copy; PopC
  Int 2; SetM <L:$copy W>; PopC
  FPushFuncD 1 "count"; CGetM <L:$h PT:"items">; FPassC 0; FCall 1; UnboxR
  FPushFuncD 1 "count"; CGetL $copy; FPassC 0; FCall 1; UnboxR
  Add
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(3));
}

/// An element bound to its own array: the write goes through one box
#[test]
fn test_write_through_self_referencing_element() {
    let code = r#"
.main {
  NewArray; SetL $a; PopC
  VGetL $a; BindM <L:$a EI:0>; PopV
  Int 1; SetM <L:$a EI:0 ET:"x">; PopC
  CGetM <L:$a ET:"x">
  FPushFuncD 1 "count"; CGetL $a; FPassC 0; FCall 1; UnboxR
  Add
  RetC
}
"#;
    assert_eq!(run_value(code), TypedValue::Int(3));
}

#[test]
fn test_string_offset_write_on_single_owner() {
    let code = r#"
.main {
  String "ab"; String "c"; Concat; SetL $a; PopC
  String "X"; SetM <L:$a EI:0>; PopC
  CGetL $a
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"Xbc");
}

#[test]
fn test_string_offset_write_leaves_other_owner_alone() {
    let code = r#"
.main {
  String "ab"; String "c"; Concat; SetL $a; PopC
  CGetL $a; SetL $b; PopC
  String "Z"; SetM <L:$a EI:1>; PopC
  CGetL $a; String "|"; Concat; CGetL $b; Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"aZc|abc");
}

/// Writing past the end pads with spaces
#[test]
fn test_string_offset_write_pads() {
    let code = r#"
.main {
  String "x"; SetL $s; PopC
  String "y"; SetM <L:$s EI:5>; PopC
  CGetL $s
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"x    y");
}

#[test]
fn test_autovivified_path_is_reused() {
    let code = r#"
.main {
  Int 1; SetM <L:$a ET:"p" ET:"q">; PopC
  CGetM <L:$a ET:"p" ET:"q">
  Int 2; SetM <L:$a ET:"p" ET:"q">; PopC
  CGetM <L:$a ET:"p" ET:"q">; Concat
  String "/"; Concat
  FPushFuncD 1 "count"; CGetM <L:$a ET:"p">; FPassC 0; FCall 1; UnboxR
  Concat
  RetC
}
"#;
    assert_eq!(run_value(code).to_string_bytes(), b"12/1");
}
