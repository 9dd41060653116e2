//! Member instruction handlers
//!
//! Every `*M` instruction follows the same shape: resolve the member vector
//! (see [`member`](crate::vm::member)), apply the final operation, pop the
//! vector's stack cells and push the result. Instructions that take a
//! right-hand side pop it before resolving, so the vector cells are always
//! the topmost ones while the base and keys are read.
//!
//! | Instruction | Intermediate access | Final member              |
//! |-------------|---------------------|---------------------------|
//! | CGetM       | read, warn          | read, warn                |
//! | VGetM       | define              | define, then box          |
//! | IssetM      | read                | isset                     |
//! | EmptyM      | read                | empty                     |
//! | SetM        | define              | SetElem/SetNewElem/SetProp|
//! | SetOpM      | define              | SetOp*                    |
//! | IncDecM     | define              | IncDec*                   |
//! | BindM       | define              | bind                      |
//! | UnsetM      | unset               | UnsetElem/UnsetProp       |
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetM .. iopUnsetM, iopFPassM

use crate::core::value::{RefData, TypedValue};
use crate::vm::assign_op::BinaryOp;
use crate::vm::engine::{VM, VmError};
use crate::vm::member::{Access, MemberState, Resolved};
use crate::vm::opcode::{IncDecOp, MemberCode, MemberVector, SetOpOp};

impl VM {
    fn finish_member(&mut self, mv: &MemberVector, result: TypedValue) {
        self.stack.ndiscard(mv.num_stack as usize);
        self.push(result);
    }

    fn define_access(&self, more_warnings: bool) -> Access {
        Access::Define {
            warn: more_warnings && self.options.strict_warnings,
        }
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetM
    #[inline]
    pub(crate) fn exec_cget_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        let mut ms = MemberState::default();
        let resolved = self.resolve_vector(&mut ms, mv, Access::Read { warn: true }, false)?;
        let mut value = self.place_value(&ms, &resolved.place).into_cell();
        if value.is_uninit() {
            value = TypedValue::Null;
        }
        self.finish_member(mv, value);
        Ok(())
    }

    /// Box the addressed member, creating it when missing
    fn vget_member(&mut self, mv: &MemberVector) -> Result<TypedValue, VmError> {
        let mut ms = MemberState::default();
        let resolved = self.resolve_vector(&mut ms, mv, self.define_access(false), false)?;
        if resolved.aborted {
            return Ok(TypedValue::Ref(RefData::new(TypedValue::Null)));
        }
        Ok(TypedValue::Ref(self.box_place(&mut ms, &resolved.place)))
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVGetM
    #[inline]
    pub(crate) fn exec_vget_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        let var = self.vget_member(mv)?;
        self.finish_member(mv, var);
        Ok(())
    }

    /// By-reference parameters bind the member, by-value ones read it
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPassM
    #[inline]
    pub(crate) fn exec_fpass_m(&mut self, param: usize, mv: &MemberVector) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            let var = self.vget_member(mv)?;
            self.finish_member(mv, var);
            Ok(())
        } else {
            self.exec_cget_m(mv)
        }
    }

    fn isset_empty_m(&mut self, mv: &MemberVector, use_empty: bool) -> Result<(), VmError> {
        let mut ms = MemberState::default();
        let Resolved { place, last, .. } =
            self.resolve_vector(&mut ms, mv, Access::Read { warn: false }, true)?;
        let result = match last {
            Some((code, key)) if code.is_prop() => {
                let ctx = self.context_class();
                let key = key.unwrap_or_default();
                self.isset_empty_prop(&mut ms, &place, &key, ctx.as_ref(), use_empty)?
            }
            Some((MemberCode::W, _)) => return Err(VmError::fatal("Cannot use [] for reading")),
            Some((_, key)) => {
                let key = key.unwrap_or_default();
                self.isset_empty_elem(&mut ms, &place, &key, use_empty)?
            }
            None => use_empty,
        };
        self.finish_member(mv, TypedValue::Bool(result));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIssetM
    #[inline]
    pub(crate) fn exec_isset_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        self.isset_empty_m(mv, false)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopEmptyM
    #[inline]
    pub(crate) fn exec_empty_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        self.isset_empty_m(mv, true)
    }

    /// The assigned value replaces the vector cells; an aborted path
    /// yields the right-hand side unchanged
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetM
    #[inline]
    pub(crate) fn exec_set_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let mut ms = MemberState::default();
        let Resolved {
            place,
            last,
            aborted,
        } = self.resolve_vector(&mut ms, mv, self.define_access(false), true)?;
        let result = match last {
            _ if aborted => value,
            Some((MemberCode::W, _)) => self.set_new_elem(&mut ms, &place, value)?,
            Some((code, key)) if code.is_prop() => {
                let ctx = self.context_class();
                let key = key.unwrap_or_default();
                self.set_prop(&mut ms, &place, &key, ctx.as_ref(), value)?
            }
            Some((_, key)) => {
                let key = key.unwrap_or_default();
                self.set_elem(&mut ms, &place, &key, value)?
            }
            None => value,
        };
        self.finish_member(mv, result);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetOpM
    #[inline]
    pub(crate) fn exec_set_op_m(&mut self, op: SetOpOp, mv: &MemberVector) -> Result<(), VmError> {
        let rhs = self.pop_c()?;
        let op = BinaryOp::from(op);
        let mut ms = MemberState::default();
        let Resolved {
            place,
            last,
            aborted,
        } = self.resolve_vector(&mut ms, mv, self.define_access(true), true)?;
        let result = match last {
            _ if aborted => rhs,
            Some((MemberCode::W, _)) => self.set_op_new_elem(&mut ms, op, &place, &rhs)?,
            Some((code, key)) if code.is_prop() => {
                let ctx = self.context_class();
                let key = key.unwrap_or_default();
                self.set_op_prop(&mut ms, op, &place, &key, ctx.as_ref(), &rhs)?
            }
            Some((_, key)) => {
                let key = key.unwrap_or_default();
                self.set_op_elem(&mut ms, op, &place, &key, &rhs)?
            }
            None => rhs,
        };
        self.finish_member(mv, result.into_cell());
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIncDecM
    #[inline]
    pub(crate) fn exec_inc_dec_m(&mut self, op: IncDecOp, mv: &MemberVector) -> Result<(), VmError> {
        let mut ms = MemberState::default();
        let Resolved {
            place,
            last,
            aborted,
        } = self.resolve_vector(&mut ms, mv, self.define_access(true), true)?;
        let result = match last {
            _ if aborted => TypedValue::Null,
            Some((MemberCode::W, _)) => self.inc_dec_new_elem(&mut ms, op, &place)?,
            Some((code, key)) if code.is_prop() => {
                let ctx = self.context_class();
                let key = key.unwrap_or_default();
                self.inc_dec_prop(&mut ms, op, &place, &key, ctx.as_ref())?
            }
            Some((_, key)) => {
                let key = key.unwrap_or_default();
                self.inc_dec_elem(&mut ms, op, &place, &key)?
            }
            None => TypedValue::Null,
        };
        self.finish_member(mv, result.into_cell());
        Ok(())
    }

    /// Bind the member to the var on top of the stack
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopBindM
    #[inline]
    pub(crate) fn exec_bind_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        let var = self.pop_v()?;
        let mut ms = MemberState::default();
        let resolved = self.resolve_vector(&mut ms, mv, self.define_access(false), false)?;
        if !resolved.aborted {
            let bound = TypedValue::Ref(var.clone());
            self.with_slot(&mut ms, &resolved.place, |slot| slot.assign(bound));
        }
        self.finish_member(mv, TypedValue::Ref(var));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopUnsetM
    #[inline]
    pub(crate) fn exec_unset_m(&mut self, mv: &MemberVector) -> Result<(), VmError> {
        let mut ms = MemberState::default();
        let Resolved {
            place,
            last,
            aborted,
        } = self.resolve_vector(&mut ms, mv, Access::Unset, true)?;
        if !aborted {
            match last {
                Some((MemberCode::W, _)) => {
                    return Err(VmError::fatal("Cannot use [] for unsetting"));
                }
                Some((code, key)) if code.is_prop() => {
                    let ctx = self.context_class();
                    let key = key.unwrap_or_default();
                    self.unset_prop(&mut ms, &place, &key, ctx.as_ref())?;
                }
                Some((_, key)) => {
                    let key = key.unwrap_or_default();
                    self.unset_elem(&mut ms, &place, &key)?;
                }
                None => {}
            }
        }
        self.stack.ndiscard(mv.num_stack as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::assembler::assemble;
    use crate::core::value::TypedValue;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::{CapturingErrorHandler, VM};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn run(src: &str) -> (TypedValue, Vec<String>) {
        let unit = assemble(src, "member.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        let mut vm = VM::new(engine.clone()).with_error_handler(Box::new(CapturingErrorHandler::new(
            move |_, msg: &str| sink.borrow_mut().push(msg.to_string()),
        )));
        let main = engine.main_unit().unwrap().clone();
        let value = vm.invoke_unit(&main).unwrap();
        let errors = errors.borrow().clone();
        (value, errors)
    }

    #[test]
    fn set_m_autovivifies_nested_arrays() {
        let (value, errors) = run(
            r#".main {
                Int 5; SetM <L:$a ET:"x" ET:"y"> ; PopC
                CGetM <L:$a ET:"x" ET:"y">
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Int(5));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn cget_m_warns_on_missing_index() {
        let (value, errors) = run(
            r#".main {
                NewArray; SetL $a; PopC
                CGetM <L:$a ET:"nope">
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Null);
        assert_eq!(errors, vec!["Undefined index: nope".to_string()]);
    }

    #[test]
    fn isset_m_is_silent() {
        let (value, errors) = run(
            r#".main {
                IssetM <L:$a ET:"k" PT:"p">
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Bool(false));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn set_op_m_on_scalar_base_yields_rhs() {
        let (value, errors) = run(
            r#".main {
                Int 3; SetL $a; PopC
                Int 4; SetOpM PlusEqual <L:$a ET:"k" ET:"j">
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Int(4));
        assert_eq!(errors, vec!["Cannot use a scalar value as an array".to_string()]);
    }

    #[test]
    fn inc_dec_m_creates_the_element() {
        let (value, _) = run(
            r#".main {
                IncDecM PostInc <L:$a EI:0> ; PopC
                IncDecM PreInc <L:$a EI:0>
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Int(2));
    }

    #[test]
    fn unset_m_removes_only_the_leaf() {
        let (value, _) = run(
            r#".main {
                Int 1; SetM <L:$a ET:"x" ET:"y"> ; PopC
                Int 2; SetM <L:$a ET:"x" ET:"z"> ; PopC
                UnsetM <L:$a ET:"x" ET:"y">
                CGetM <L:$a ET:"x">
                RetC
            }"#,
        );
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn bind_m_aliases_element_and_local() {
        let (value, _) = run(
            r#".main {
                VGetL $b; BindM <L:$a EI:0> ; PopV
                Int 9; SetL $b; PopC
                CGetM <L:$a EI:0>
                RetC
            }"#,
        );
        assert_eq!(value, TypedValue::Int(9));
    }
}
