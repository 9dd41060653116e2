use hhvm_core::core::value::TypedValue;
use hhvm_core::vm::dispatch::DispatchMode;
use hhvm_core::vm::executor::{ExecutionConfig, execute_file};
use std::process::Command;
use tempfile::tempdir;

const HELLO: &str = r#"
.function greet($who) {
  String "hello "; CGetL $who; Concat
  RetC
}
.main {
  FPushFuncD 1 "greet"; String "world"; FPassC 0; FCall 1; UnboxR
  Print; PopC
  Int 42
  RetC
}
"#;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hhvm-core"))
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "timeout_ms": 1500, "dispatch": "Debugger", "error_reporting": 2, "backtrace": true }"#,
    )
    .expect("write config");

    let config = ExecutionConfig::from_file(&path).expect("config");
    assert_eq!(config.timeout_ms, 1500);
    assert_eq!(config.dispatch, DispatchMode::Debugger);
    assert_eq!(config.error_reporting, 2);
    assert!(config.backtrace);
    assert!(config.capture_output);

    let options = config.runtime_options();
    assert_eq!(options.timeout.map(|d| d.as_millis()), Some(1500));
    assert!(options.backtrace);
}

#[test]
fn test_missing_config_file_is_a_load_error() {
    let dir = tempdir().expect("temp dir");
    let err = ExecutionConfig::from_file(&dir.path().join("absent.json")).unwrap_err();
    assert!(err.to_string().starts_with("Cannot read"), "{err}");
}

#[test]
fn test_execute_file() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("hello.hhas");
    std::fs::write(&path, HELLO).expect("write unit");

    let result = execute_file(&path, ExecutionConfig::default()).expect("load");
    assert_eq!(result.value, TypedValue::Int(42));
    assert_eq!(result.stdout, "hello world");
    assert_eq!(result.exit_code, 0);
}

#[test]
fn test_assembly_error_names_the_file() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("broken.hhas");
    std::fs::write(&path, ".main {\n  Int 1\n  NotAnOp\n}\n").expect("write unit");

    let err = execute_file(&path, ExecutionConfig::default()).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("broken.hhas:3"), "{message}");
    assert!(message.contains("NotAnOp"), "{message}");
}

#[test]
fn test_cli_run_prints_output_and_result() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("hello.hhas");
    std::fs::write(&path, HELLO).expect("write unit");

    let output = binary()
        .arg("run")
        .arg(&path)
        .arg("--print-result")
        .output()
        .expect("run binary");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello worldint(42)\n");
}

#[test]
fn test_cli_exit_status_and_fatal_report() {
    let dir = tempdir().expect("temp dir");
    let exit_path = dir.path().join("exit.hhas");
    std::fs::write(&exit_path, ".main {\n  Int 7\n  Exit\n}\n").expect("write unit");
    let status = binary().arg("run").arg(&exit_path).status().expect("run binary");
    assert_eq!(status.code(), Some(7));

    let fatal_path = dir.path().join("fatal.hhas");
    std::fs::write(&fatal_path, ".main {\n  String \"gave up\"\n  Fatal\n}\n").expect("write unit");
    let output = binary()
        .arg("run")
        .arg(&fatal_path)
        .arg("--backtrace")
        .output()
        .expect("run binary");
    assert_eq!(output.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal error: gave up"), "{stderr}");
    assert!(stderr.contains("#0 {main}"), "{stderr}");
}

#[test]
fn test_cli_coverage_and_config() {
    let dir = tempdir().expect("temp dir");
    let unit = dir.path().join("loop.hhas");
    std::fs::write(&unit, ".main {\n  Int 1\n  RetC\n}\n").expect("write unit");
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{ "dispatch": "Coverage" }"#).expect("write config");

    let output = binary()
        .arg("run")
        .arg(&unit)
        .arg("--config")
        .arg(&config)
        .output()
        .expect("run binary");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("loop.hhas:2 1"), "{stderr}");
    assert!(stderr.contains("loop.hhas:3 1"), "{stderr}");
}

#[test]
fn test_cli_disasm_lists_functions() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("hello.hhas");
    std::fs::write(&path, HELLO).expect("write unit");

    let output = binary().arg("disasm").arg(&path).output().expect("run binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("{main}():"), "{stdout}");
    assert!(stdout.contains("greet($who):"), "{stdout}");
    assert!(stdout.contains("FPushFuncD"), "{stdout}");
}
