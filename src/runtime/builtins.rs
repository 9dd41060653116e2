//! Builtin functions and prelude classes
//!
//! Natives are ordinary `Func`s whose body is a single `NativeImpl`
//! instruction, so they get a real frame: `func_get_args()` and friends
//! read the frame of their caller, backtraces show them, and faults unwind
//! through them like through any other call.
//!
//! The prelude classes (`stdClass`, `ArrayAccess`, `Iterator`, `Countable`,
//! `Exception`, `FatalErrorException`) are plain assembly linked ahead of
//! the script.
//!
//! Reference: HHVM `runtime/ext/std/ext_std_function.cpp`,
//! `runtime/ext/std/ext_std_variable.cpp`
//! Reference: $PHP_SRC_PATH/Zend/zend_builtin_functions.c

use crate::compiler::assembler::assemble;
use crate::core::value::{ArrayData, ArrayKey, TypedValue};
use crate::runtime::unit::{Func, FuncAttrs, NativeHandler, Param, Unit, UnitData, Visibility};
use crate::vm::engine::{VM, VmError};
use crate::vm::opcode::Op;
use lazy_static::lazy_static;
use std::rc::Rc;
use std::sync::Arc;

/// Name, parameter names and handler of every builtin
pub static NATIVE_FUNCTIONS: &[(&str, &[&str], NativeHandler)] = &[
    ("call_user_func", &["function"], php_call_user_func),
    ("call_user_func_array", &["function", "args"], php_call_user_func_array),
    ("func_get_args", &[], php_func_get_args),
    ("func_num_args", &[], php_func_num_args),
    ("func_get_arg", &["arg_num"], php_func_get_arg),
    ("get_defined_vars", &[], php_get_defined_vars),
    ("extract", &["array"], php_extract),
    ("compact", &["varname"], php_compact),
    ("strlen", &["string"], php_strlen),
    ("count", &["var"], php_count),
    ("is_array", &["var"], php_is_array),
    ("print_r", &["expression", "return"], php_print_r),
    ("set_error_handler", &["error_handler"], php_set_error_handler),
];

const PRELUDE: &str = r#"
.class stdClass { }

.class [interface] ArrayAccess {
  .method [abstract] offsetExists($offset) { Null; RetC }
  .method [abstract] offsetGet($offset) { Null; RetC }
  .method [abstract] offsetSet($offset, $value) { Null; RetC }
  .method [abstract] offsetUnset($offset) { Null; RetC }
}

.class [interface] Iterator {
  .method [abstract] current() { Null; RetC }
  .method [abstract] key() { Null; RetC }
  .method [abstract] next() { Null; RetC }
  .method [abstract] rewind() { Null; RetC }
  .method [abstract] valid() { Null; RetC }
}

.class [interface] Countable {
  .method [abstract] count() { Null; RetC }
}

.class Exception {
  .property [public] message = "";
  .property [public] code = 0;
  .method __construct($message = DV0, $code = DV1) {
  INIT:
    CGetL $message; SetM <H PT:"message">; PopC
    CGetL $code; SetM <H PT:"code">; PopC
    Null; RetC
  DV0:
    String ""; SetL $message; PopC
  DV1:
    Int 0; SetL $code; PopC
    Jmp INIT
  }
  .method getMessage() { CGetM <H PT:"message">; RetC }
  .method getCode() { CGetM <H PT:"code">; RetC }
}

.class FatalErrorException extends Exception { }

.class Continuation implements Iterator {
  .method next() {
    ContNext
    .try {
      ContEnter; PopR
    } .catch (Exception H)
    ContStopped
    Null; RetC
  H:
    Catch; ContHandle
  }
  .method send($value) {
    ContSend
    .try {
      ContEnter; PopR
    } .catch (Exception H)
    ContStopped
    ContCurrent; RetC
  H:
    Catch; ContHandle
  }
  .method raise($exception) {
    ContRaise
    .try {
      ContEnter; PopR
    } .catch (Exception H)
    ContStopped
    ContCurrent; RetC
  H:
    Catch; ContHandle
  }
  .method current() { ContCurrent; RetC }
  .method key() { ContKey; RetC }
  .method valid() { ContValid; RetC }
  .method rewind() {
    ContStarted; JmpNZ DONE
    This; FPushObjMethodD 0 "next"; FCall 0; PopR
  DONE:
    Null; RetC
  }
}
"#;

lazy_static! {
    static ref NATIVE_UNIT: Arc<UnitData> = Arc::new(UnitData {
        filepath: Arc::from("[native]"),
        ..UnitData::default()
    });
    static ref DEFAULT_CTOR: Arc<Func> = Arc::new(Func {
        name: Arc::from("86ctor"),
        cls: None,
        attrs: FuncAttrs::default(),
        params: Vec::new(),
        local_names: Vec::new(),
        num_iterators: 0,
        max_stack_cells: 1,
        code: vec![Op::Null as u8, Op::RetC as u8],
        lines: Vec::new(),
        eh_table: Vec::new(),
        is_pseudo_main: false,
        native: None,
        unit: NATIVE_UNIT.clone(),
    });
}

/// Wrap a handler in a function whose body is `NativeImpl`
pub fn native_func(name: &str, params: &[&str], handler: NativeHandler) -> Arc<Func> {
    Arc::new(Func {
        name: Arc::from(name),
        cls: None,
        attrs: FuncAttrs::default(),
        params: params
            .iter()
            .map(|p| Param {
                name: Arc::from(*p),
                by_ref: false,
                dv_entry: None,
                type_constraint: None,
            })
            .collect(),
        local_names: params.iter().map(|p| Arc::from(*p)).collect(),
        num_iterators: 0,
        max_stack_cells: 1,
        code: vec![Op::NativeImpl as u8],
        lines: Vec::new(),
        eh_table: Vec::new(),
        is_pseudo_main: false,
        native: Some(handler),
        unit: NATIVE_UNIT.clone(),
    })
}

/// Constructor run by `new` for classes that declare none
pub(crate) fn default_ctor() -> Arc<Func> {
    DEFAULT_CTOR.clone()
}

pub fn prelude_unit() -> Result<Unit, VmError> {
    assemble(PRELUDE, "[prelude]")
}

/// Frame of the bytecode function that called the running native
fn calling_function(vm: &mut VM, builtin: &str) -> Result<Option<usize>, VmError> {
    match vm.user_frame() {
        Some(fp) if !vm.frames[fp].func.is_pseudo_main => Ok(Some(fp)),
        _ => {
            vm.raise_warning(format!(
                "{}():  Called from the global scope - no function context",
                builtin
            ))?;
            Ok(None)
        }
    }
}

/// Arguments a frame was called with, surplus ones included; a generator
/// body reports the arguments of the call that created it
pub(crate) fn frame_args(vm: &VM, fp: usize) -> Vec<TypedValue> {
    if let Some(args) = vm.continuation_args(fp) {
        return args;
    }
    let ar = &vm.frames[fp];
    let declared = ar.num_args().min(ar.func.num_params());
    let mut args: Vec<TypedValue> = (0..declared)
        .map(|id| vm.stack.at(ar.local_index(id)).to_cell())
        .collect();
    if let Some(env) = ar.var_env().and_then(|id| vm.env(id)) {
        args.extend((0..env.num_extra_args()).filter_map(|i| env.get_extra_arg(i).map(TypedValue::to_cell)));
    }
    args
}

fn expect_args(vm: &mut VM, name: &str, args: &[TypedValue], min: usize) -> Result<bool, VmError> {
    if args.len() >= min {
        return Ok(true);
    }
    vm.raise_warning(format!(
        "{}() expects at least {} parameter{}, {} given",
        name,
        min,
        if min == 1 { "" } else { "s" },
        args.len()
    ))?;
    Ok(false)
}

/// call_user_func() - Call the callback given by the first parameter
pub fn php_call_user_func(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "call_user_func", args, 1)? {
        return Ok(TypedValue::Null);
    }
    vm.call_user_func(&args[0], &args[1..])
}

/// call_user_func_array() - Call a callback with an array of parameters
pub fn php_call_user_func_array(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "call_user_func_array", args, 2)? {
        return Ok(TypedValue::Null);
    }
    let Some(params) = args[1].as_array() else {
        vm.raise_warning(format!(
            "call_user_func_array() expects parameter 2 to be array, {} given",
            args[1].type_name()
        ))?;
        return Ok(TypedValue::Null);
    };
    let params: Vec<TypedValue> = params.map.values().cloned().collect();
    vm.call_user_func(&args[0], &params)
}

/// func_get_args() - Returns an array comprising a function's argument list
pub fn php_func_get_args(vm: &mut VM, _args: &[TypedValue]) -> Result<TypedValue, VmError> {
    let Some(fp) = calling_function(vm, "func_get_args")? else {
        return Ok(TypedValue::Bool(false));
    };
    let mut arr = ArrayData::new();
    for arg in frame_args(vm, fp) {
        arr.append(arg);
    }
    Ok(TypedValue::Array(Rc::new(arr)))
}

/// func_num_args() - Returns the number of arguments passed to the function
pub fn php_func_num_args(vm: &mut VM, _args: &[TypedValue]) -> Result<TypedValue, VmError> {
    let Some(fp) = calling_function(vm, "func_num_args")? else {
        return Ok(TypedValue::Int(-1));
    };
    let count = match vm.continuation_args(fp) {
        Some(args) => args.len(),
        None => vm.frames[fp].num_args(),
    };
    Ok(TypedValue::Int(count as i64))
}

/// func_get_arg() - Return an item from the argument list
pub fn php_func_get_arg(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "func_get_arg", args, 1)? {
        return Ok(TypedValue::Bool(false));
    }
    let Some(fp) = calling_function(vm, "func_get_arg")? else {
        return Ok(TypedValue::Bool(false));
    };
    let n = args[0].to_int();
    if n < 0 {
        vm.raise_warning("func_get_arg():  The argument number should be >= 0")?;
        return Ok(TypedValue::Bool(false));
    }
    match frame_args(vm, fp).into_iter().nth(n as usize) {
        Some(arg) => Ok(arg),
        None => {
            vm.raise_warning(format!(
                "func_get_arg():  Argument {} not passed to function",
                n
            ))?;
            Ok(TypedValue::Bool(false))
        }
    }
}

/// get_defined_vars() - Variables of the calling scope
pub fn php_get_defined_vars(vm: &mut VM, _args: &[TypedValue]) -> Result<TypedValue, VmError> {
    let Some(fp) = vm.user_frame() else {
        return Ok(TypedValue::empty_array());
    };
    Ok(TypedValue::Array(Rc::new(vm.defined_vars(fp))))
}

/// extract() - Import variables into the calling scope from an array
pub fn php_extract(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "extract", args, 1)? {
        return Ok(TypedValue::Null);
    }
    let Some(arr) = args[0].as_array().cloned() else {
        vm.raise_warning("extract() expects parameter 1 to be array")?;
        return Ok(TypedValue::Null);
    };
    let Some(fp) = vm.user_frame() else {
        return Ok(TypedValue::Int(0));
    };
    let mut imported = 0;
    for (key, value) in arr.map.iter() {
        let ArrayKey::Str(name) = key else {
            continue;
        };
        if name.is_empty() || name.as_slice() == b"this" {
            continue;
        }
        if let Some(loc) = vm.lookup_var(fp, name, true) {
            if let Some(slot) = vm.var_mut(&loc) {
                slot.assign(value.to_cell());
                imported += 1;
            }
        }
    }
    Ok(TypedValue::Int(imported))
}

fn compact_into(vm: &mut VM, fp: usize, name: &TypedValue, out: &mut ArrayData) {
    match name.to_cell() {
        TypedValue::Array(names) => {
            for nested in names.map.values() {
                compact_into(vm, fp, nested, out);
            }
        }
        v if v.is_string() => {
            let name = v.to_string_bytes();
            let Some(loc) = vm.lookup_var(fp, &name, false) else {
                return;
            };
            if let Some(value) = vm.var_ref(&loc).filter(|v| !v.is_uninit()) {
                out.set(ArrayKey::from_bytes(&name), value.to_cell());
            }
        }
        _ => {}
    }
}

/// compact() - Create an array of the named variables of the calling scope
pub fn php_compact(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    let mut out = ArrayData::new();
    if let Some(fp) = vm.user_frame() {
        for name in args {
            compact_into(vm, fp, name, &mut out);
        }
    }
    Ok(TypedValue::Array(Rc::new(out)))
}

/// strlen() - Get string length
pub fn php_strlen(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "strlen", args, 1)? {
        return Ok(TypedValue::Null);
    }
    match &args[0] {
        TypedValue::Array(_) | TypedValue::Object(_) => {
            vm.raise_warning(format!(
                "strlen() expects parameter 1 to be string, {} given",
                args[0].type_name()
            ))?;
            Ok(TypedValue::Null)
        }
        v => Ok(TypedValue::Int(v.to_string_bytes().len() as i64)),
    }
}

/// count() - Count the elements of an array or a `Countable` object
pub fn php_count(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "count", args, 1)? {
        return Ok(TypedValue::Null);
    }
    match &args[0] {
        TypedValue::Array(arr) => Ok(TypedValue::Int(arr.len() as i64)),
        TypedValue::Object(obj) if obj.instance_of("Countable") => {
            let obj = obj.clone();
            let n = vm.invoke_method(&obj, "count", &[])?;
            Ok(TypedValue::Int(n.to_int()))
        }
        v if v.is_null() => Ok(TypedValue::Int(0)),
        _ => Ok(TypedValue::Int(1)),
    }
}

/// is_array() - Finds whether a variable is an array
pub fn php_is_array(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "is_array", args, 1)? {
        return Ok(TypedValue::Null);
    }
    Ok(TypedValue::Bool(matches!(args[0], TypedValue::Array(_))))
}

/// print_r() - Human-readable dump; returned instead of echoed when the
/// second argument is true
pub fn php_print_r(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "print_r", args, 1)? {
        return Ok(TypedValue::Null);
    }
    let mut out = Vec::new();
    print_r_value(&args[0], 0, &mut Vec::new(), &mut out);
    if args.get(1).is_some_and(TypedValue::to_bool) {
        return Ok(TypedValue::string(out));
    }
    vm.echo(&out)?;
    Ok(TypedValue::Bool(true))
}

fn print_r_entries<'a>(
    entries: impl Iterator<Item = (Vec<u8>, &'a TypedValue)>,
    pad: usize,
    seen: &mut Vec<u32>,
    out: &mut Vec<u8>,
) {
    out.extend(std::iter::repeat_n(b' ', pad));
    out.extend_from_slice(b"(\n");
    for (key, value) in entries {
        out.extend(std::iter::repeat_n(b' ', pad + 4));
        out.push(b'[');
        out.extend_from_slice(&key);
        out.extend_from_slice(b"] => ");
        print_r_value(value, pad + 8, seen, out);
        out.push(b'\n');
    }
    out.extend(std::iter::repeat_n(b' ', pad));
    out.extend_from_slice(b")\n");
}

fn print_r_value(value: &TypedValue, pad: usize, seen: &mut Vec<u32>, out: &mut Vec<u8>) {
    match value.to_cell() {
        TypedValue::Array(arr) => {
            out.extend_from_slice(b"Array\n");
            let entries = arr.map.iter().map(|(k, v)| (k.to_display().into_bytes(), v));
            print_r_entries(entries, pad, seen, out);
        }
        TypedValue::Object(obj) => {
            out.extend_from_slice(obj.class_name().as_bytes());
            out.extend_from_slice(b" Object\n");
            if seen.contains(&obj.id) {
                out.extend_from_slice(b" *RECURSION*");
                return;
            }
            seen.push(obj.id);
            let props = obj.props.borrow();
            let entries = props.iter().map(|(name, v)| {
                let mut label = name.to_vec();
                if let Some(decl) = obj.class.props.get(String::from_utf8_lossy(name).as_ref()) {
                    match decl.visibility {
                        Visibility::Public => {}
                        Visibility::Protected => label.extend_from_slice(b":protected"),
                        Visibility::Private => {
                            label.push(b':');
                            label.extend_from_slice(decl.cls.as_bytes());
                            label.extend_from_slice(b":private");
                        }
                    }
                }
                (label, v)
            });
            print_r_entries(entries, pad, seen, out);
            seen.pop();
        }
        v => out.extend_from_slice(&v.to_string_bytes()),
    }
}

/// set_error_handler() - Install a user error handler, returning the old one
pub fn php_set_error_handler(vm: &mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError> {
    if !expect_args(vm, "set_error_handler", args, 1)? {
        return Ok(TypedValue::Null);
    }
    let handler = if args[0].is_null() { None } else { Some(args[0].clone()) };
    let previous = std::mem::replace(&mut vm.context.user_error_handler, handler);
    Ok(previous.unwrap_or(TypedValue::Null))
}
