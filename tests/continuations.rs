mod common;

use common::{run_asm, run_output};

const SQUARES: &str = r#"
.function squares($n) {
  CreateCont 0 "squares_body"
  RetC
}
.function squares_body($cont) {
  UnpackCont
  Switch <Start Resume> 0 bounded
Start:
  Int 0; SetL $i; PopC
Loop:
  CGetL $i; CGetL $n; Lt; JmpZ Finish
  CGetL $i; CGetL $i; Mul; PackCont 1; Null; RetC
Resume:
  ContRaised; ContReceive; PopC
  IncDecL $i PreInc; PopC
  Jmp Loop
Finish:
  ContDone; Null; RetC
}
"#;

const ECHO: &str = r#"
.function echo() {
  CreateCont 0 "echo_body"
  RetC
}
.function echo_body($cont) {
  UnpackCont
  Switch <L0 L1> 0 bounded
L0:
  String "ready"; PackCont 1; Null; RetC
L1:
  .try {
    ContRaised
  } .catch (Exception H)
  String "got:"; ContReceive; Concat
  PackCont 1; Null; RetC
H:
  Catch; SetL $e; PopC
  String "caught:"
  CGetL $e; FPushObjMethodD 0 "getMessage"; FCall 0; UnboxR
  Concat
  PackCont 1; Null; RetC
}
"#;

#[test]
fn test_foreach_over_a_generator() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 1 "squares"; Int 4; FPassC 0; FCall 1; UnboxR
  IterInit 0 End
Body:
  IterKey 0; Print; PopC
  String "="; Print; PopC
  IterValueC 0; Print; PopC
  String " "; Print; PopC
  IterNext 0 Body
End:
  Null; RetC
}}"#,
        SQUARES
    );
    assert_eq!(run_output(&code), "0=0 1=1 2=4 3=9 ");
}

#[test]
fn test_empty_generator_skips_the_loop() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 1 "squares"; Int 0; FPassC 0; FCall 1; UnboxR
  IterInit 0 End
Body:
  String "body"; Print; PopC
  IterNext 0 Body
End:
  String "done"; Print; PopC
  Null; RetC
}}"#,
        SQUARES
    );
    assert_eq!(run_output(&code), "done");
}

#[test]
fn test_send_and_raise_resume_the_body() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 0 "echo"; FCall 0; UnboxR; SetL $g; PopC
  FPushCtorD 1 "Exception"; String "boom"; FPassC 0; FCall 1; PopR; SetL $x; PopC
  CGetL $g; FPushObjMethodD 0 "next"; FCall 0; PopR
  CGetL $g; FPushObjMethodD 0 "current"; FCall 0; UnboxR; Print; PopC
  String "|"; Print; PopC
  CGetL $g; FPushObjMethodD 1 "send"; String "hi"; FPassC 0; FCall 1; UnboxR; Print; PopC
  String "|"; Print; PopC
  CGetL $g; FPushObjMethodD 1 "raise"; CGetL $x; FPassC 0; FCall 1; UnboxR; Print; PopC
  String "|"; Print; PopC
  CGetL $g; FPushObjMethodD 0 "key"; FCall 0; UnboxR; Print; PopC
  Null; RetC
}}"#,
        ECHO
    );
    assert_eq!(run_output(&code), "ready|got:hi|caught:boom|2");
}

#[test]
fn test_send_before_next_throws() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 0 "echo"; FCall 0; UnboxR; SetL $g; PopC
  .try {{
    CGetL $g; FPushObjMethodD 1 "send"; String "early"; FPassC 0; FCall 1; PopR
    String "not reached"; RetC
  }} .catch (Exception H)
H:
  Catch
  FPushObjMethodD 0 "getMessage"; FCall 0; UnboxR
  RetC
}}"#,
        ECHO
    );
    let result = run_asm(&code);
    assert!(result.is_success());
    assert_eq!(result.value.to_string_bytes(), b"Need to call next() first");
}

#[test]
fn test_exception_in_body_finishes_the_generator() {
    let code = r#"
.function fragile() {
  CreateCont 0 "fragile_body"
  RetC
}
.function fragile_body($cont) {
  UnpackCont
  Switch <L0 L1> 0 bounded
L0:
  Int 1; PackCont 1; Null; RetC
L1:
  ContRaised; ContReceive; PopC
  FPushCtorD 1 "Exception"; String "body failed"; FPassC 0; FCall 1; PopR
  Throw
}
.main {
  FPushFuncD 0 "fragile"; FCall 0; UnboxR; SetL $g; PopC
  CGetL $g; FPushObjMethodD 0 "next"; FCall 0; PopR
  .try {
    CGetL $g; FPushObjMethodD 0 "next"; FCall 0; PopR
    String "not reached"; Print; PopC
    Null; RetC
  } .catch (Exception H)
H:
  Catch
  FPushObjMethodD 0 "getMessage"; FCall 0; UnboxR; Print; PopC
  String "|"; Print; PopC
  CGetL $g; FPushObjMethodD 0 "valid"; FCall 0; UnboxR; CastInt; Print; PopC
  Null; RetC
}
"#;
    assert_eq!(run_output(code), "body failed|0");
}

#[test]
fn test_generators_cannot_be_cloned() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 1 "squares"; Int 2; FPassC 0; FCall 1; UnboxR
  Clone
  RetC
}}"#,
        SQUARES
    );
    let result = run_asm(&code);
    assert_eq!(
        result.error.unwrap().to_string(),
        "Trying to clone an uncloneable object of class Continuation"
    );
}

const TYPED: &str = r#"
.class Shape { }
.class Square extends Shape { }
.function area(Shape $s) {
  VerifyParamType 0
  Int 1; RetC
}
.function total(?array $xs) {
  VerifyParamType 0
  Int 2; RetC
}
"#;

#[test]
fn test_verify_param_type_accepts_matching_arguments() {
    let code = format!(
        r#"{}
.main {{
  FPushCtorD 0 "Square"; FCall 0; PopR; SetL $sq; PopC
  FPushFuncD 1 "area"; CGetL $sq; FPassC 0; FCall 1; UnboxR; Print; PopC
  FPushFuncD 1 "total"; NewArray; FPassC 0; FCall 1; UnboxR; Print; PopC
  FPushFuncD 1 "total"; Null; FPassC 0; FCall 1; UnboxR; Print; PopC
  Null; RetC
}}"#,
        TYPED
    );
    assert_eq!(run_output(&code), "122");
}

#[test]
fn test_verify_param_type_rejects_other_values() {
    let code = format!(
        r#"{}
.main {{
  FPushFuncD 1 "area"; Int 3; FPassC 0; FCall 1; UnboxR
  RetC
}}"#,
        TYPED
    );
    let result = run_asm(&code);
    assert_eq!(
        result.error.unwrap().to_string(),
        "Argument 1 passed to area() must be an instance of Shape, integer given"
    );

    let code = format!(
        r#"{}
.main {{
  FPushFuncD 1 "total"; String "xs"; FPassC 0; FCall 1; UnboxR
  RetC
}}"#,
        TYPED
    );
    let result = run_asm(&code);
    assert_eq!(
        result.error.unwrap().to_string(),
        "Argument 1 passed to total() must be of the type array, string given"
    );

    let code = format!(
        r#"{}
.main {{
  FPushFuncD 0 "area"; FCall 0; UnboxR
  RetC
}}"#,
        TYPED
    );
    let result = run_asm(&code);
    assert!(result.stderr.contains("Missing argument 1 to area()"));
    assert_eq!(
        result.error.unwrap().to_string(),
        "Argument 1 passed to area() must be an instance of Shape, none given"
    );
}
