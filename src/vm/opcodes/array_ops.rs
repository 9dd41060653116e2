//! Array literal construction
//!
//! ## PHP Semantics
//!
//! PHP arrays are ordered hash maps supporting both integer and string keys:
//! - Automatic integer key assignment for append operations
//! - Numeric string keys ("0", "123") are stored as integers
//! - Copy-on-write for value assignments
//!
//! ## Operations
//!
//! - **Array**: materialize a unit's static array literal
//! - **NewArray**: push an empty array
//! - **AddElemC / AddElemV**: `[$k => $v]`, `[$k => &$v]`
//! - **AddNewElemC / AddNewElemV**: `[$v]`, `[&$v]`
//!
//! The array under construction sits below the key and value cells. It is
//! normally uniquely owned, so `Rc::make_mut` mutates in place.
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopArray, iopNewArray, iopAddElemC
//! - Zend: `$PHP_SRC_PATH/Zend/zend_hash.c` - Hash table implementation

use crate::core::value::{ArrayData, TypedValue};
use crate::runtime::unit::Func;
use crate::vm::engine::{VM, VmError};
use std::rc::Rc;
use std::sync::Arc;

const NEXT_ELEMENT_OCCUPIED: &str =
    "Cannot add element to the array as the next element is already occupied";

impl VM {
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopArray
    pub(crate) fn exec_array(&mut self, func: &Arc<Func>, id: u32) -> Result<(), VmError> {
        let literal = func
            .unit
            .arrays
            .get(id as usize)
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, format!("array literal {} out of range", id)))?;
        let value = literal.to_value();
        self.push(value);
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_new_array(&mut self) -> Result<(), VmError> {
        self.push(TypedValue::Array(Rc::new(ArrayData::new())));
        Ok(())
    }

    /// The array being built, `depth` cells below the top
    fn array_under_construction(&mut self, depth: usize) -> Result<&mut ArrayData, VmError> {
        let offset = self.op_start;
        match self.stack.ind_mut(depth) {
            Some(TypedValue::Array(arr)) => Ok(Rc::make_mut(arr)),
            Some(_) => Err(VmError::invalid_bytecode(offset, "AddElem on a non-array")),
            None => Err(VmError::stack_underflow("AddElem")),
        }
    }

    fn add_elem(&mut self, value: TypedValue) -> Result<(), VmError> {
        let key = self.pop_c()?;
        let Some(key) = key.to_array_key() else {
            self.raise_warning("Illegal offset type")?;
            return Ok(());
        };
        self.array_under_construction(0)?.set(key, value);
        Ok(())
    }

    fn add_new_elem(&mut self, value: TypedValue) -> Result<(), VmError> {
        if self.array_under_construction(0)?.append(value).is_none() {
            self.raise_warning(NEXT_ELEMENT_OCCUPIED)?;
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAddElemC
    #[inline]
    pub(crate) fn exec_add_elem_c(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.add_elem(value)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAddElemV
    #[inline]
    pub(crate) fn exec_add_elem_v(&mut self) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        self.add_elem(TypedValue::Ref(cell))
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAddNewElemC
    #[inline]
    pub(crate) fn exec_add_new_elem_c(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.add_new_elem(value)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopAddNewElemV
    #[inline]
    pub(crate) fn exec_add_new_elem_v(&mut self) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        self.add_new_elem(TypedValue::Ref(cell))
    }
}
