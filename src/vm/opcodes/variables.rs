//! Variable access operations
//!
//! The non-member get/set family in its four addressing forms:
//!
//! | Suffix | Variable                                      | Stack inputs        |
//! |--------|-----------------------------------------------|---------------------|
//! | `L`    | named local, by slot                          | -                   |
//! | `N`    | name looked up in the frame's scope           | name                |
//! | `G`    | name looked up in the global scope            | name                |
//! | `S`    | static property                               | name, class (top)   |
//!
//! Right-hand sides (`Set*`, `SetOp*`, `Bind*`) sit above the name.
//!
//! ## Undefined variables
//!
//! Reads of a missing or uninit variable raise `Undefined variable: x` and
//! produce null. `SetOpL`/`IncDecL` warn the same way before treating the
//! local as null; the named forms define the variable silently. `Isset*`,
//! `Empty*` and `Unset*` never warn.
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopCGetL .. iopUnsetG, lookup_var,
//!   lookupd_gbl, lookup_sprop
//! - Zend: `$PHP_SRC_PATH/Zend/zend_execute.c` - zend_fetch_var

use crate::core::value::{RefData, TypedValue};
use crate::runtime::class::Class;
use crate::vm::engine::{VM, VmError};
use crate::vm::inc_dec::inc_dec_cell;
use crate::vm::opcode::{IncDecOp, IsTypeOp, SetOpOp};
use crate::vm::var_env::VarLoc;
use std::rc::Rc;
use std::sync::Arc;

/// Storage a variable instruction operates on
#[derive(Debug, Clone)]
enum Lval {
    Var(VarLoc),
    StaticProp(Arc<Class>, String),
}

/// Scope searched by the `N` and `G` forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameScope {
    Frame,
    Global,
}

fn is_type(value: &TypedValue, op: IsTypeOp) -> bool {
    match op {
        IsTypeOp::Null => value.is_null(),
        IsTypeOp::Bool => matches!(value, TypedValue::Bool(_)),
        IsTypeOp::Int => matches!(value, TypedValue::Int(_)),
        IsTypeOp::Double => matches!(value, TypedValue::Double(_)),
        IsTypeOp::Str => value.is_string(),
        IsTypeOp::Arr => matches!(value, TypedValue::Array(_)),
        IsTypeOp::Obj => matches!(value, TypedValue::Object(_)),
    }
}

impl VM {
    fn lval_mut(&mut self, lval: &Lval) -> Option<&mut TypedValue> {
        match lval {
            Lval::Var(loc) => self.var_mut(loc),
            Lval::StaticProp(cls, prop) => self.context.static_prop_mut(cls, prop),
        }
    }

    /// Current cell of a variable; uninit when it does not exist
    fn lval_cell(&mut self, lval: Option<&Lval>) -> TypedValue {
        lval.and_then(|lv| self.lval_mut(lv).map(|slot| slot.to_cell()))
            .unwrap_or_default()
    }

    fn local_lval(&self, id: usize) -> Result<(Lval, Vec<u8>), VmError> {
        let ar = self.frame()?;
        let name = ar
            .func
            .local_names
            .get(id)
            .map(|n| n.as_bytes().to_vec())
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, format!("local {} out of range", id)))?;
        Ok((Lval::Var(VarLoc::Slot(ar.local_index(id))), name))
    }

    /// Pop a variable name and resolve it
    fn pop_named(&mut self, scope: NameScope, define: bool) -> Result<(Option<Lval>, Vec<u8>), VmError> {
        let name = self.pop_c()?.to_string_bytes();
        let loc = match scope {
            NameScope::Frame => {
                let fp = self.fp()?;
                self.lookup_var(fp, &name, define)
            }
            NameScope::Global => self.lookup_global(&name, define),
        };
        Ok((loc.map(Lval::Var), name))
    }

    /// Pop a class and a property name, resolving a visible static property
    fn pop_static(&mut self) -> Result<(Lval, Vec<u8>), VmError> {
        let cls = match self.pop_c()? {
            TypedValue::Class(cls) => cls,
            _ => return Err(VmError::invalid_bytecode(self.op_start, "static property access without a class")),
        };
        let name = self.pop_c()?.to_string_bytes();
        let ctx = self.context_class();
        let (_, prop) = self.lookup_static_prop(&cls, &name, ctx.as_deref())?;
        Ok((Lval::StaticProp(cls, prop), name))
    }

    fn undefined_variable(&mut self, name: &[u8]) -> Result<(), VmError> {
        self.raise_notice(format!("Undefined variable: {}", String::from_utf8_lossy(name)))
    }

    /// Read for `CGet*`: warns and yields null when undefined
    fn read_var(&mut self, lval: Option<&Lval>, name: &[u8]) -> Result<TypedValue, VmError> {
        let value = self.lval_cell(lval);
        if value.is_uninit() {
            self.undefined_variable(name)?;
            return Ok(TypedValue::Null);
        }
        Ok(value)
    }

    /// Box a variable in place
    fn box_var(&mut self, lval: &Lval) -> Rc<RefData> {
        match self.lval_mut(lval) {
            Some(slot) => slot.box_in_place(),
            None => RefData::new(TypedValue::Null),
        }
    }

    fn store_var(&mut self, lval: &Lval, value: TypedValue) {
        if let Some(slot) = self.lval_mut(lval) {
            slot.set_cell(value);
        }
    }

    fn set_op_var(&mut self, lval: &Lval, op: SetOpOp, rhs: TypedValue) -> Result<TypedValue, VmError> {
        let current = self.lval_cell(Some(lval));
        let result = self.binary_op(op.into(), &current, &rhs)?;
        self.store_var(lval, result.clone());
        Ok(result)
    }

    fn inc_dec_var(&mut self, lval: &Lval, op: IncDecOp) -> TypedValue {
        match self.lval_mut(lval) {
            Some(slot) => {
                if slot.is_uninit() {
                    slot.assign(TypedValue::Null);
                }
                inc_dec_cell(op, slot)
            }
            None => TypedValue::Null,
        }
    }

    fn bind_var(&mut self, lval: &Lval, cell: Rc<RefData>) {
        if let Some(slot) = self.lval_mut(lval) {
            slot.assign(TypedValue::Ref(cell));
        }
    }

    // ---------------------------------------------------------------
    // Gets
    // ---------------------------------------------------------------

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetL
    #[inline]
    pub(crate) fn exec_cget_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        let value = self.read_var(Some(&lval), &name)?;
        self.push(value);
        Ok(())
    }

    /// Push a local below the top cell
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetL2
    pub(crate) fn exec_cget_l2(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        let value = self.read_var(Some(&lval), &name)?;
        self.stack.insert_below(1, value);
        Ok(())
    }

    /// Push a local below the top two cells
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetL3
    pub(crate) fn exec_cget_l3(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        let value = self.read_var(Some(&lval), &name)?;
        self.stack.insert_below(2, value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetN
    pub(crate) fn exec_cget_n(&mut self) -> Result<(), VmError> {
        let (lval, name) = self.pop_named(NameScope::Frame, false)?;
        let value = self.read_var(lval.as_ref(), &name)?;
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetG
    pub(crate) fn exec_cget_g(&mut self) -> Result<(), VmError> {
        let (lval, name) = self.pop_named(NameScope::Global, false)?;
        let value = self.read_var(lval.as_ref(), &name)?;
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCGetS
    pub(crate) fn exec_cget_s(&mut self) -> Result<(), VmError> {
        let (lval, name) = self.pop_static()?;
        let value = self.read_var(Some(&lval), &name)?;
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVGetL
    #[inline]
    pub(crate) fn exec_vget_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, _) = self.local_lval(local)?;
        let cell = self.box_var(&lval);
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVGetN
    pub(crate) fn exec_vget_n(&mut self) -> Result<(), VmError> {
        let (lval, _) = self.pop_named(NameScope::Frame, true)?;
        let cell = match lval {
            Some(lv) => self.box_var(&lv),
            None => RefData::new(TypedValue::Null),
        };
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVGetG
    pub(crate) fn exec_vget_g(&mut self) -> Result<(), VmError> {
        let (lval, _) = self.pop_named(NameScope::Global, true)?;
        let cell = match lval {
            Some(lv) => self.box_var(&lv),
            None => RefData::new(TypedValue::Null),
        };
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVGetS
    pub(crate) fn exec_vget_s(&mut self) -> Result<(), VmError> {
        let (lval, _) = self.pop_static()?;
        let cell = self.box_var(&lval);
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    fn class_from_cell(&self, value: &TypedValue) -> Result<Arc<Class>, VmError> {
        match value {
            TypedValue::Object(obj) => Ok(obj.class.clone()),
            TypedValue::Class(cls) => Ok(cls.clone()),
            v if v.is_string() => self.lookup_class(&String::from_utf8_lossy(v.str_bytes().unwrap_or_default())),
            _ => Err(VmError::fatal("Cls: Expected string or object")),
        }
    }

    /// Class reference from a name or an object
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAGetC
    pub(crate) fn exec_aget_c(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let cls = self.class_from_cell(&value)?;
        self.push(TypedValue::Class(cls));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAGetL
    pub(crate) fn exec_aget_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        let value = self.read_var(Some(&lval), &name)?;
        let cls = self.class_from_cell(&value)?;
        self.push(TypedValue::Class(cls));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Isset / empty / type tests
    // ---------------------------------------------------------------

    #[inline]
    pub(crate) fn exec_isset_c(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Bool(!value.is_null()));
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_isset_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, _) = self.local_lval(local)?;
        let value = self.lval_cell(Some(&lval));
        self.push(TypedValue::Bool(!value.is_null()));
        Ok(())
    }

    fn isset_empty_named(&mut self, scope: NameScope, use_empty: bool) -> Result<(), VmError> {
        let (lval, _) = self.pop_named(scope, false)?;
        let value = self.lval_cell(lval.as_ref());
        let result = if use_empty { !value.to_bool() } else { !value.is_null() };
        self.push(TypedValue::Bool(result));
        Ok(())
    }

    /// Static property isset/empty; an inaccessible property is not set
    fn isset_empty_static(&mut self, use_empty: bool) -> Result<(), VmError> {
        let cls = match self.pop_c()? {
            TypedValue::Class(cls) => cls,
            _ => return Err(VmError::invalid_bytecode(self.op_start, "static property access without a class")),
        };
        let name = self.pop_c()?.to_string_bytes();
        let ctx = self.context_class();
        let value = match self.lookup_static_prop(&cls, &name, ctx.as_deref()) {
            Ok((_, prop)) => self.lval_cell(Some(&Lval::StaticProp(cls, prop))),
            Err(_) => TypedValue::Uninit,
        };
        let result = if use_empty { !value.to_bool() } else { !value.is_null() };
        self.push(TypedValue::Bool(result));
        Ok(())
    }

    pub(crate) fn exec_isset_n(&mut self) -> Result<(), VmError> {
        self.isset_empty_named(NameScope::Frame, false)
    }

    pub(crate) fn exec_isset_g(&mut self) -> Result<(), VmError> {
        self.isset_empty_named(NameScope::Global, false)
    }

    pub(crate) fn exec_isset_s(&mut self) -> Result<(), VmError> {
        self.isset_empty_static(false)
    }

    #[inline]
    pub(crate) fn exec_empty_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, _) = self.local_lval(local)?;
        let value = self.lval_cell(Some(&lval));
        self.push(TypedValue::Bool(!value.to_bool()));
        Ok(())
    }

    pub(crate) fn exec_empty_n(&mut self) -> Result<(), VmError> {
        self.isset_empty_named(NameScope::Frame, true)
    }

    pub(crate) fn exec_empty_g(&mut self) -> Result<(), VmError> {
        self.isset_empty_named(NameScope::Global, true)
    }

    pub(crate) fn exec_empty_s(&mut self) -> Result<(), VmError> {
        self.isset_empty_static(true)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIsTypeL
    pub(crate) fn exec_is_type_l(&mut self, local: usize, op: IsTypeOp) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        let value = self.read_var(Some(&lval), &name)?;
        self.push(TypedValue::Bool(is_type(&value, op)));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIsTypeC
    pub(crate) fn exec_is_type_c(&mut self, op: IsTypeOp) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Bool(is_type(&value, op)));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Mutators
    // ---------------------------------------------------------------

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetL
    #[inline]
    pub(crate) fn exec_set_l(&mut self, local: usize) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let (lval, _) = self.local_lval(local)?;
        self.store_var(&lval, value.clone());
        self.push(value);
        Ok(())
    }

    fn set_named(&mut self, scope: NameScope) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let (lval, _) = self.pop_named(scope, true)?;
        if let Some(lval) = lval {
            self.store_var(&lval, value.clone());
        }
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetN
    pub(crate) fn exec_set_n(&mut self) -> Result<(), VmError> {
        self.set_named(NameScope::Frame)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetG
    pub(crate) fn exec_set_g(&mut self) -> Result<(), VmError> {
        self.set_named(NameScope::Global)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetS
    pub(crate) fn exec_set_s(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let (lval, _) = self.pop_static()?;
        self.store_var(&lval, value.clone());
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSetOpL
    pub(crate) fn exec_set_op_l(&mut self, local: usize, op: SetOpOp) -> Result<(), VmError> {
        let rhs = self.pop_c()?;
        let (lval, name) = self.local_lval(local)?;
        if self.lval_cell(Some(&lval)).is_uninit() {
            self.undefined_variable(&name)?;
        }
        let result = self.set_op_var(&lval, op, rhs)?;
        self.push(result);
        Ok(())
    }

    fn set_op_named(&mut self, scope: NameScope, op: SetOpOp) -> Result<(), VmError> {
        let rhs = self.pop_c()?;
        let (lval, _) = self.pop_named(scope, true)?;
        let result = match lval {
            Some(lval) => self.set_op_var(&lval, op, rhs)?,
            None => self.binary_op(op.into(), &TypedValue::Null, &rhs)?,
        };
        self.push(result);
        Ok(())
    }

    pub(crate) fn exec_set_op_n(&mut self, op: SetOpOp) -> Result<(), VmError> {
        self.set_op_named(NameScope::Frame, op)
    }

    pub(crate) fn exec_set_op_g(&mut self, op: SetOpOp) -> Result<(), VmError> {
        self.set_op_named(NameScope::Global, op)
    }

    pub(crate) fn exec_set_op_s(&mut self, op: SetOpOp) -> Result<(), VmError> {
        let rhs = self.pop_c()?;
        let (lval, _) = self.pop_static()?;
        let result = self.set_op_var(&lval, op, rhs)?;
        self.push(result);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIncDecL
    pub(crate) fn exec_inc_dec_l(&mut self, local: usize, op: IncDecOp) -> Result<(), VmError> {
        let (lval, name) = self.local_lval(local)?;
        if self.lval_cell(Some(&lval)).is_uninit() {
            self.undefined_variable(&name)?;
        }
        let result = self.inc_dec_var(&lval, op);
        self.push(result);
        Ok(())
    }

    fn inc_dec_named(&mut self, scope: NameScope, op: IncDecOp) -> Result<(), VmError> {
        let (lval, _) = self.pop_named(scope, true)?;
        let result = match lval {
            Some(lval) => self.inc_dec_var(&lval, op),
            None => TypedValue::Null,
        };
        self.push(result);
        Ok(())
    }

    pub(crate) fn exec_inc_dec_n(&mut self, op: IncDecOp) -> Result<(), VmError> {
        self.inc_dec_named(NameScope::Frame, op)
    }

    pub(crate) fn exec_inc_dec_g(&mut self, op: IncDecOp) -> Result<(), VmError> {
        self.inc_dec_named(NameScope::Global, op)
    }

    pub(crate) fn exec_inc_dec_s(&mut self, op: IncDecOp) -> Result<(), VmError> {
        let (lval, _) = self.pop_static()?;
        let result = self.inc_dec_var(&lval, op);
        self.push(result);
        Ok(())
    }

    /// Make a local an alias of the var on top
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopBindL
    pub(crate) fn exec_bind_l(&mut self, local: usize) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        let (lval, _) = self.local_lval(local)?;
        self.bind_var(&lval, cell.clone());
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    fn bind_named(&mut self, scope: NameScope) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        let (lval, _) = self.pop_named(scope, true)?;
        if let Some(lval) = lval {
            self.bind_var(&lval, cell.clone());
        }
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    pub(crate) fn exec_bind_n(&mut self) -> Result<(), VmError> {
        self.bind_named(NameScope::Frame)
    }

    pub(crate) fn exec_bind_g(&mut self) -> Result<(), VmError> {
        self.bind_named(NameScope::Global)
    }

    pub(crate) fn exec_bind_s(&mut self) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        let (lval, _) = self.pop_static()?;
        self.bind_var(&lval, cell.clone());
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopUnsetL
    #[inline]
    pub(crate) fn exec_unset_l(&mut self, local: usize) -> Result<(), VmError> {
        let (lval, _) = self.local_lval(local)?;
        if let Lval::Var(loc) = lval {
            self.unset_var(&loc);
        }
        Ok(())
    }

    fn unset_named(&mut self, scope: NameScope) -> Result<(), VmError> {
        if let (Some(Lval::Var(loc)), _) = self.pop_named(scope, false)? {
            self.unset_var(&loc);
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopUnsetN
    pub(crate) fn exec_unset_n(&mut self) -> Result<(), VmError> {
        self.unset_named(NameScope::Frame)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopUnsetG
    pub(crate) fn exec_unset_g(&mut self) -> Result<(), VmError> {
        self.unset_named(NameScope::Global)
    }
}
