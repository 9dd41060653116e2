//! Checks for the shared integration-test helpers

mod common;

use common::{TestVm, run_output, run_value};
use hhvm_core::core::value::TypedValue;

#[test]
fn test_run_value() {
    assert_eq!(run_value(".main { Int 42; RetC }"), TypedValue::Int(42));
}

#[test]
fn test_run_output() {
    assert_eq!(run_output(".main { String \"ok\"; Print; RetC }"), "ok");
}

#[test]
fn test_test_vm_invoke_unit() {
    let mut t = TestVm::new(".main { CGetL $x; RetC }");
    let main = t.main.clone();
    assert_eq!(t.vm.invoke_unit(&main).unwrap(), TypedValue::Null);
    assert_eq!(t.messages(), vec!["Undefined variable: x".to_string()]);
}
