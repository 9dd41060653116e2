//! Evaluation stack
//!
//! A fixed-capacity buffer of cells growing toward index 0. The cell at
//! `elms.len() - 1` is never used, so an empty stack has `top == base`.
//! Activation records and frame locals live in the same buffer as
//! expression temporaries: a frame's AR cell sits at `ActRec::base`, its
//! locals directly below it and its eval area below the locals.
//!
//! The lowest `SURPRISE_CELLS` cells are the guard region. Callers check
//! `would_overflow` before entering a function, so the guard is never
//! written in a well-formed program.
//!
//! Reference: HHVM `runtime/vm/bytecode.h` (class Stack)

use crate::core::value::{RefData, TypedValue};
use crate::vm::engine::VmError;
use std::fmt::Write as _;

pub const MIN_STACK_ELMS: usize = 1 << 9;
pub const DEFAULT_STACK_ELMS: usize = 1 << 16;
/// Cells reserved at the low end of the buffer
pub const SURPRISE_CELLS: usize = 64;

pub struct Stack {
    elms: Box<[TypedValue]>,
    top: usize,
    base: usize,
}

impl Stack {
    /// `num_elms` must be a power of two no smaller than `MIN_STACK_ELMS`
    pub fn new(num_elms: usize) -> Result<Self, VmError> {
        if num_elms < MIN_STACK_ELMS || !num_elms.is_power_of_two() {
            return Err(VmError::fatal(format!(
                "Invalid stack size {}: must be a power of two of at least {}",
                num_elms, MIN_STACK_ELMS
            )));
        }
        let elms = vec![TypedValue::Uninit; num_elms].into_boxed_slice();
        let base = num_elms - 1;
        Ok(Self {
            elms,
            top: base,
            base,
        })
    }

    pub fn capacity(&self) -> usize {
        self.elms.len()
    }

    /// Index one past the oldest live cell
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Index of the most recently pushed cell
    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.base - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.top == self.base
    }

    /// Whether pushing `num_cells` more would reach the guard region
    #[inline]
    pub fn would_overflow(&self, num_cells: usize) -> bool {
        self.top < num_cells + SURPRISE_CELLS
    }

    /// Push an owned value; no count changes
    #[inline]
    pub fn push(&mut self, value: TypedValue) {
        debug_assert!(self.top > 0, "evaluation stack exhausted");
        self.top -= 1;
        self.elms[self.top] = value;
    }

    /// Reserve one cell, initialized to uninit, returning its index
    #[inline]
    pub fn alloc(&mut self) -> usize {
        self.push(TypedValue::Uninit);
        self.top
    }

    /// Move the top cell out
    #[inline]
    pub fn pop(&mut self) -> Option<TypedValue> {
        if self.top >= self.base {
            return None;
        }
        let value = std::mem::take(&mut self.elms[self.top]);
        self.top += 1;
        Some(value)
    }

    /// Release the top cell
    #[inline]
    pub fn discard(&mut self) {
        if self.top < self.base {
            self.elms[self.top].assign(TypedValue::Uninit);
            self.top += 1;
        }
    }

    /// Drop `n` cells; anything still owned in them is released
    pub fn ndiscard(&mut self, n: usize) {
        for _ in 0..n {
            self.discard();
        }
    }

    /// Shrink the stack so that `new_top` is the top index
    pub fn set_top(&mut self, new_top: usize) {
        debug_assert!(new_top <= self.base);
        while self.top < new_top {
            self.discard();
        }
    }

    #[inline]
    pub fn top_tv(&self) -> Option<&TypedValue> {
        self.ind(0)
    }

    #[inline]
    pub fn top_mut(&mut self) -> Option<&mut TypedValue> {
        self.ind_mut(0)
    }

    /// Cell `depth` positions below the top
    #[inline]
    pub fn ind(&self, depth: usize) -> Option<&TypedValue> {
        let idx = self.top + depth;
        if idx < self.base { Some(&self.elms[idx]) } else { None }
    }

    #[inline]
    pub fn ind_mut(&mut self, depth: usize) -> Option<&mut TypedValue> {
        let idx = self.top + depth;
        if idx < self.base { Some(&mut self.elms[idx]) } else { None }
    }

    #[inline]
    pub fn index_of(&self, depth: usize) -> usize {
        self.top + depth
    }

    /// Absolute access; `idx` must lie in `[top, base)`
    #[inline]
    pub fn at(&self, idx: usize) -> &TypedValue {
        &self.elms[idx]
    }

    #[inline]
    pub fn at_mut(&mut self, idx: usize) -> &mut TypedValue {
        &mut self.elms[idx]
    }

    /// Push a copy of the top cell
    pub fn dup(&mut self) -> Result<(), VmError> {
        let value = self.top_tv().cloned().ok_or(VmError::stack_underflow("dup"))?;
        self.push(value);
        Ok(())
    }

    /// Insert `value` below the top `depth` cells
    pub fn insert_below(&mut self, depth: usize, value: TypedValue) {
        self.push(value);
        for i in 0..depth {
            self.elms.swap(self.top + i, self.top + i + 1);
        }
    }

    /// Turn the top cell into a var in place
    pub fn box_top(&mut self) -> Result<(), VmError> {
        let top = self.top_mut().ok_or(VmError::stack_underflow("box"))?;
        let cell = std::mem::take(top);
        *top = TypedValue::Ref(RefData::new(cell.into_cell()));
        Ok(())
    }

    /// Replace a var on top by a copy of its referent
    pub fn unbox_top(&mut self) -> Result<(), VmError> {
        let top = self.top_mut().ok_or(VmError::stack_underflow("unbox"))?;
        if top.is_ref() {
            let cell = top.to_cell();
            top.assign(cell);
        }
        Ok(())
    }

    /// Multi-line dump of the live cells, oldest first
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for idx in (self.top..self.base).rev() {
            let _ = writeln!(out, "  [{:>6}] {:?}", idx, self.elms[idx]);
        }
        out
    }
}

impl Default for Stack {
    fn default() -> Self {
        let elms = vec![TypedValue::Uninit; DEFAULT_STACK_ELMS].into_boxed_slice();
        let base = DEFAULT_STACK_ELMS - 1;
        Self {
            elms,
            top: base,
            base,
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("capacity", &self.elms.len())
            .field("count", &self.count())
            .finish()
    }
}
