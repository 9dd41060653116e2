//! Control flow operations
//!
//! Conditional branches, jump tables and the two instructions that end the
//! request from bytecode (`Exit`, `Fatal`). Unconditional jumps are handled
//! by [`VM::jump`](crate::vm::engine::VM) directly.
//!
//! ## Implementation Notes
//!
//! Branch offsets are relative to the start of the branching instruction.
//! Backward branches poll the surprise flags (see `jump`).
//!
//! Conditional jumps use PHP's truthiness rules:
//! - Falsy: false, 0, 0.0, "", "0", null, empty arrays
//! - Truthy: everything else
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopJmpZ, iopJmpNZ, iopSwitch, iopExit, iopFatal
//! - Zend: `$PHP_SRC_PATH/Zend/zend_vm_def.h` - ZEND_JMPZ, ZEND_EXIT

use crate::core::value::{Numeric, TypedValue, is_numeric_string};
use crate::vm::engine::{VM, VmError};
use crate::vm::opcode::SwitchTable;

impl VM {
    /// Pop a cell and branch when it is falsy
    #[inline]
    pub(crate) fn exec_jmp_z(&mut self, offset: i32) -> Result<(), VmError> {
        if !self.pop_c()?.to_bool() {
            self.jump(offset)?;
        }
        Ok(())
    }

    /// Pop a cell and branch when it is truthy
    #[inline]
    pub(crate) fn exec_jmp_nz(&mut self, offset: i32) -> Result<(), VmError> {
        if self.pop_c()?.to_bool() {
            self.jump(offset)?;
        }
        Ok(())
    }

    /// Jump table dispatch
    ///
    /// An unbounded table requires an integer index in range. A bounded
    /// table subtracts `base`, sends anything out of range (or any value
    /// that is not integer-like) to its last target, the default.
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSwitch
    pub(crate) fn exec_switch(&mut self, table: &SwitchTable) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let count = table.targets.len();
        if count == 0 {
            return Err(VmError::invalid_bytecode(self.op_start, "empty switch table"));
        }
        let index = if table.bounded {
            let default = count - 1;
            let label = match &value {
                TypedValue::Int(i) => Some(*i),
                TypedValue::Uninit | TypedValue::Null => Some(0),
                TypedValue::Bool(b) => Some(*b as i64),
                TypedValue::Double(d) if d.fract() == 0.0 => Some(*d as i64),
                v if v.is_string() => match is_numeric_string(v.str_bytes().unwrap_or_default()) {
                    Some(Numeric::Int(i)) => Some(i),
                    Some(Numeric::Double(d)) if d.fract() == 0.0 => Some(d as i64),
                    _ => None,
                },
                _ => None,
            };
            label
                .and_then(|l| l.checked_sub(table.base))
                .filter(|&i| i >= 0 && (i as usize) < default)
                .map_or(default, |i| i as usize)
        } else {
            match value {
                TypedValue::Int(i) if i >= 0 && (i as usize) < count => i as usize,
                other => {
                    return Err(VmError::invalid_bytecode(
                        self.op_start,
                        format!("switch index {} out of range", String::from_utf8_lossy(&other.to_string_bytes())),
                    ));
                }
            }
        };
        self.jump(table.targets[index])
    }

    /// `exit($status)`: a string is printed first, an integer becomes the
    /// exit code
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopExit
    pub(crate) fn exec_exit(&mut self) -> Result<(), VmError> {
        let status = self.pop_c()?;
        let code = match &status {
            TypedValue::Int(i) => *i,
            v if v.is_string() => {
                self.echo(v.str_bytes().unwrap_or_default())?;
                0
            }
            _ => 0,
        };
        Err(VmError::Exit(code))
    }

    /// Raise a fatal error whose message is on the stack
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFatal
    pub(crate) fn exec_fatal(&mut self) -> Result<(), VmError> {
        let message = self.pop_c()?;
        Err(VmError::fatal(String::from_utf8_lossy(&message.to_string_bytes()).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::assembler::assemble;
    use crate::core::value::TypedValue;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::{VM, VmError};
    use std::sync::Arc;

    fn run(src: &str) -> Result<TypedValue, VmError> {
        let unit = assemble(src, "flow.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let mut vm = VM::new(engine.clone());
        let main = engine.main_unit().cloned().unwrap();
        vm.invoke_unit(&main)
    }

    #[test]
    fn bounded_switch_falls_back_to_default() {
        let prog = |label: &str| {
            format!(
                r#"
                .main {{
                  {}
                  Switch <A B D> 10 bounded
                A: String "a"; RetC
                B: String "b"; RetC
                D: String "default"; RetC
                }}
                "#,
                label
            )
        };
        assert_eq!(run(&prog("Int 11")).unwrap().to_string_bytes(), b"b");
        assert_eq!(run(&prog(r#"String "10""#)).unwrap().to_string_bytes(), b"a");
        assert_eq!(run(&prog("Int 12")).unwrap().to_string_bytes(), b"default");
        assert_eq!(run(&prog(r#"String "x""#)).unwrap().to_string_bytes(), b"default");
    }

    #[test]
    fn jmp_z_takes_falsy_branch() {
        let result = run(
            r#"
            .main {
              String "0"
              JmpZ L
              Int 1; RetC
            L:
              Int 2; RetC
            }
            "#,
        );
        assert_eq!(result.unwrap(), TypedValue::Int(2));
    }

    #[test]
    fn exit_carries_the_status() {
        assert!(matches!(run(".main {\n Int 3\n Exit\n}"), Err(VmError::Exit(3))));
        let err = run(".main {\n String \"no\"\n Fatal\n}").unwrap_err();
        assert_eq!(err.to_string(), "no");
    }
}
