//! Stack operation helpers to reduce boilerplate
//!
//! Most handlers pop their inputs, compute, and push one result. These
//! helpers standardize the popping with the specific `StackUnderflow`
//! error, checked against the running frame's eval area so a malformed
//! instruction can never eat into the frame's locals.
//!
//! Methods are marked `#[inline]`; only `pop_n_cells` allocates.

use crate::core::value::{RefData, TypedValue};
use crate::vm::engine::{VM, VmError};
use std::rc::Rc;

impl VM {
    /// Whether the running frame has no eval cells left
    #[inline]
    fn eval_area_empty(&self) -> bool {
        match self.fp {
            Some(fp) => self.stack.top() >= self.frames[fp].eval_floor(),
            None => self.stack.is_empty(),
        }
    }

    /// Pop whatever is on top, var or cell
    #[inline(always)]
    pub(crate) fn pop_tv(&mut self, operation: &'static str) -> Result<TypedValue, VmError> {
        if self.eval_area_empty() {
            return Err(VmError::StackUnderflow { operation });
        }
        self.stack.pop().ok_or(VmError::StackUnderflow { operation })
    }

    /// Pop a cell; a var on top is read through
    #[inline(always)]
    pub(crate) fn pop_c(&mut self) -> Result<TypedValue, VmError> {
        Ok(self.pop_tv("popC")?.into_cell())
    }

    /// Pop a var; a cell on top is boxed first
    #[inline]
    pub(crate) fn pop_v(&mut self) -> Result<Rc<RefData>, VmError> {
        let mut tv = self.pop_tv("popV")?;
        Ok(tv.box_in_place())
    }

    /// Pop two cells for binary operations (returns in (left, right) order)
    #[inline]
    pub(crate) fn pop_binary_cells(&mut self) -> Result<(TypedValue, TypedValue), VmError> {
        let right = self.pop_c()?;
        let left = self.pop_c()?;
        Ok((left, right))
    }

    /// Pop N cells and return them in push order
    #[inline]
    pub(crate) fn pop_n_cells(&mut self, count: usize) -> Result<Vec<TypedValue>, VmError> {
        let mut cells = Vec::with_capacity(count);
        for _ in 0..count {
            cells.push(self.pop_c()?);
        }
        cells.reverse();
        Ok(cells)
    }

    /// Copy of the cell `depth` positions below the top
    #[inline]
    pub(crate) fn peek_c(&self, depth: usize) -> Result<TypedValue, VmError> {
        self.stack
            .ind(depth)
            .map(TypedValue::to_cell)
            .ok_or(VmError::StackUnderflow { operation: "peek" })
    }

    #[inline(always)]
    pub(crate) fn push(&mut self, value: TypedValue) {
        self.stack.push(value);
    }
}
