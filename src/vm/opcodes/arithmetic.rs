//! Arithmetic, bitwise and cast operations
//!
//! The operator semantics live in [`assign_op`](crate::vm::assign_op) so that
//! `SetOp*` and the plain instructions share one implementation; the
//! handlers here only move cells on and off the stack.
//!
//! ## PHP Semantics
//!
//! - Numeric strings are converted to integers/floats
//! - Booleans: true=1, false=0
//! - null converts to 0
//! - Integer overflow of `+`, `-`, `*` produces a double
//!
//! ## Casts
//!
//! `(array)` wraps a scalar in a one-element array and exposes an object's
//! properties; `(object)` builds a `stdClass` from an array's entries or
//! stores a scalar under `scalar`.
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopAdd .. iopShr, iopCastArray
//! - Zend: `$PHP_SRC_PATH/Zend/zend_operators.c` - arithmetic functions

use crate::core::value::{ArrayData, ArrayKey, PropName, TypedValue};
use crate::vm::assign_op::BinaryOp;
use crate::vm::engine::{VM, VmError};
use std::rc::Rc;

impl VM {
    /// Execute any two-operand arithmetic, bitwise or concat operator
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAdd, iopConcat, iopShl
    #[inline]
    pub(crate) fn exec_binary(&mut self, op: BinaryOp) -> Result<(), VmError> {
        let (left, right) = self.pop_binary_cells()?;
        let result = self.binary_op(op, &left, &right)?;
        self.push(result);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopBitNot
    #[inline]
    pub(crate) fn exec_bit_not(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let result = self.bit_not(&value)?;
        self.push(result);
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_cast_bool(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Bool(value.to_bool()));
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_cast_int(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Int(value.to_int()));
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_cast_double(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Double(value.to_double()));
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_cast_string(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(value.to_string_value());
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCastArray
    pub(crate) fn exec_cast_array(&mut self) -> Result<(), VmError> {
        let result = match self.pop_c()? {
            TypedValue::Uninit | TypedValue::Null => TypedValue::empty_array(),
            arr @ TypedValue::Array(_) => arr,
            TypedValue::Object(obj) => {
                let props = obj.props.borrow();
                let mut arr = ArrayData::with_capacity(props.len());
                for (name, value) in props.iter() {
                    arr.set(ArrayKey::from_bytes(name), value.clone());
                }
                TypedValue::Array(Rc::new(arr))
            }
            scalar => {
                let mut arr = ArrayData::with_capacity(1);
                arr.append(scalar);
                TypedValue::Array(Rc::new(arr))
            }
        };
        self.push(result);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCastObject
    pub(crate) fn exec_cast_object(&mut self) -> Result<(), VmError> {
        let result = match self.pop_c()? {
            obj @ TypedValue::Object(_) => obj,
            other => {
                let obj = self.new_std_class()?;
                match other {
                    TypedValue::Uninit | TypedValue::Null => {}
                    TypedValue::Array(arr) => {
                        let mut props = obj.props.borrow_mut();
                        for (key, value) in arr.map.iter() {
                            let name: PropName = match key {
                                ArrayKey::Int(i) => Rc::from(i.to_string().as_bytes()),
                                ArrayKey::Str(s) => Rc::from(s.as_slice()),
                            };
                            props.insert(name, value.clone());
                        }
                    }
                    scalar => obj.set_prop(b"scalar", scalar),
                }
                TypedValue::Object(obj)
            }
        };
        self.push(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::assembler::assemble;
    use crate::core::value::TypedValue;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::VM;
    use std::sync::Arc;

    fn eval(body: &str) -> TypedValue {
        let src = format!(".main {{\n{}\n}}", body);
        let unit = assemble(&src, "arith.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let mut vm = VM::new(engine.clone());
        let main = engine.main_unit().cloned().unwrap();
        vm.invoke_unit(&main).unwrap()
    }

    #[test]
    fn add_juggles_numeric_strings() {
        assert_eq!(eval(r#"String "3"; Int 4; Add; RetC"#), TypedValue::Int(7));
        assert_eq!(eval(r#"String "1.5"; Int 1; Add; RetC"#), TypedValue::Double(2.5));
    }

    #[test]
    fn concat_and_shift() {
        assert_eq!(eval(r#"Int 1; String "a"; Concat; RetC"#).to_string_bytes(), b"1a");
        assert_eq!(eval("Int 1; Int 4; Shl; RetC"), TypedValue::Int(16));
        assert_eq!(eval("Int 5; BitNot; RetC"), TypedValue::Int(-6));
    }

    #[test]
    fn casts() {
        assert_eq!(eval(r#"String "12abc"; CastInt; RetC"#), TypedValue::Int(12));
        assert_eq!(eval(r#"Int 0; CastBool; RetC"#), TypedValue::Bool(false));
        let arr = eval("Int 7; CastArray; RetC");
        assert_eq!(arr.as_array().map(|a| a.len()), Some(1));
        let obj = eval("Int 7; CastObject; RetC");
        assert_eq!(obj.as_object().unwrap().get_prop(b"scalar"), Some(TypedValue::Int(7)));
    }
}
