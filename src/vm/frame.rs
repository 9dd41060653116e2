//! Activation records
//!
//! An `ActRec` describes one invocation. Records live in `VM::frames`, a
//! LIFO arena that holds both pre-live records (pushed by `FPush*`, waiting
//! for their `FCall`) and live frames. Each record also owns one cell on the
//! evaluation stack at `base`; arguments and locals sit directly below it
//! (local `i` at `base - 1 - i`) and the cell itself receives the return
//! value when the frame is torn down.
//!
//! Reference: HHVM `runtime/vm/bytecode.h` (struct ActRec)

use crate::core::value::{ArrayData, ObjectData, PropName, RefData, TypedValue};
use crate::runtime::class::Class;
use crate::runtime::unit::{Func, Offset};
use crate::vm::var_env::VarEnvId;
use std::rc::Rc;
use std::sync::Arc;

const CTOR_FLAG: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Pushed by a call-setup instruction, not entered yet
    PreLive,
    Live,
    /// Locals released, return value in the AR cell
    PostLive,
}

#[derive(Debug, Clone, Default)]
pub enum ThisOrClass {
    #[default]
    Empty,
    This(Rc<ObjectData>),
    /// Late-bound class of a static call
    Class(Arc<Class>),
}

#[derive(Debug, Clone, Default)]
pub enum EnvOrName {
    #[default]
    Empty,
    VarEnv(VarEnvId),
    /// Name the caller asked for when `__call` was selected
    InvName(Rc<[u8]>),
}

#[derive(Debug, Default)]
pub enum Iter {
    #[default]
    Undefined,
    /// Snapshot of the array taken at `IterInit`
    Array { arr: Rc<ArrayData>, pos: usize },
    /// Live array reached through a var, iterated by reference
    MutableArray { cell: Rc<RefData>, pos: usize },
    /// User object implementing `Iterator`
    Object { obj: Rc<ObjectData> },
    /// Visible properties of a plain object
    Props {
        obj: Rc<ObjectData>,
        names: Vec<PropName>,
        pos: usize,
    },
}

#[derive(Debug)]
pub struct ActRec {
    pub func: Arc<Func>,
    /// Stack index of the AR cell
    pub base: usize,
    num_args: u32,
    pub this_or_class: ThisOrClass,
    pub env_or_name: EnvOrName,
    pub state: FrameState,
    /// Caller frame; for `first_ar` the frame that was running when the
    /// nested dispatch started
    pub saved_fp: Option<usize>,
    /// Offset of the calling instruction in the caller
    pub soff: Offset,
    /// Where the caller resumes
    pub return_pc: Offset,
    pub iters: Vec<Iter>,
}

impl ActRec {
    pub fn new(func: Arc<Func>, base: usize, num_args: u32) -> Self {
        Self {
            func,
            base,
            num_args: num_args & !CTOR_FLAG,
            this_or_class: ThisOrClass::Empty,
            env_or_name: EnvOrName::Empty,
            state: FrameState::PreLive,
            saved_fp: None,
            soff: 0,
            return_pc: 0,
            iters: Vec::new(),
        }
    }

    #[inline]
    pub fn num_args(&self) -> usize {
        (self.num_args & !CTOR_FLAG) as usize
    }

    pub fn set_num_args(&mut self, n: usize) {
        self.num_args = (self.num_args & CTOR_FLAG) | (n as u32 & !CTOR_FLAG);
    }

    pub fn is_from_fpush_ctor(&self) -> bool {
        self.num_args & CTOR_FLAG != 0
    }

    pub fn set_from_fpush_ctor(&mut self) {
        self.num_args |= CTOR_FLAG;
    }

    /// Stack index of local `id`
    #[inline]
    pub fn local_index(&self, id: usize) -> usize {
        self.base - 1 - id
    }

    /// One past the lowest local; the eval area starts just below
    #[inline]
    pub fn eval_floor(&self) -> usize {
        self.base - self.func.num_locals()
    }

    pub fn this(&self) -> Option<&Rc<ObjectData>> {
        match &self.this_or_class {
            ThisOrClass::This(obj) => Some(obj),
            _ => None,
        }
    }

    /// Late-bound class: the class of `$this`, or the class of a static call
    pub fn late_bound_class(&self) -> Option<Arc<Class>> {
        match &self.this_or_class {
            ThisOrClass::This(obj) => Some(obj.class.clone()),
            ThisOrClass::Class(cls) => Some(cls.clone()),
            ThisOrClass::Empty => None,
        }
    }

    pub fn var_env(&self) -> Option<VarEnvId> {
        match self.env_or_name {
            EnvOrName::VarEnv(id) => Some(id),
            _ => None,
        }
    }

    pub fn inv_name(&self) -> Option<&Rc<[u8]>> {
        match &self.env_or_name {
            EnvOrName::InvName(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == FrameState::Live
    }
}

/// Generator state kept inside a `Continuation` object between entries
/// of its body function
#[derive(Debug)]
pub struct ContinuationData {
    pub body: Arc<Func>,
    pub this_or_class: ThisOrClass,
    /// Arguments of the creating call when `CreateCont` asked for them
    pub args: Option<Vec<TypedValue>>,
    /// Body locals after the continuation parameter, while suspended
    pub locals: Vec<TypedValue>,
    pub iters: Vec<Iter>,
    /// Where `UnpackCont` resumes; 0 is the start of the body
    pub label: i64,
    /// Key of the current value; -1 until the first entry
    pub index: i64,
    pub value: TypedValue,
    /// Value passed by `send()`/`raise()`
    pub received: TypedValue,
    pub should_throw: bool,
    pub running: bool,
    pub done: bool,
}

impl ContinuationData {
    pub fn new(body: Arc<Func>, this_or_class: ThisOrClass, args: Option<Vec<TypedValue>>) -> Self {
        let locals = vec![TypedValue::Uninit; body.num_locals().saturating_sub(1)];
        Self {
            body,
            this_or_class,
            args,
            locals,
            iters: Vec::new(),
            label: 0,
            index: -1,
            value: TypedValue::Null,
            received: TypedValue::Null,
            should_throw: false,
            running: false,
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::unit::{FuncAttrs, UnitData};

    fn func(locals: &[&str]) -> Arc<Func> {
        Arc::new(Func {
            name: Arc::from("f"),
            cls: None,
            attrs: FuncAttrs::default(),
            params: Vec::new(),
            local_names: locals.iter().map(|n| Arc::from(*n)).collect(),
            num_iterators: 0,
            max_stack_cells: 1,
            code: Vec::new(),
            lines: Vec::new(),
            eh_table: Vec::new(),
            is_pseudo_main: false,
            native: None,
            unit: Arc::new(UnitData::default()),
        })
    }

    #[test]
    fn ctor_flag_does_not_disturb_arg_count() {
        let mut ar = ActRec::new(func(&[]), 100, 3);
        ar.set_from_fpush_ctor();
        assert_eq!(ar.num_args(), 3);
        assert!(ar.is_from_fpush_ctor());
        ar.set_num_args(5);
        assert_eq!(ar.num_args(), 5);
        assert!(ar.is_from_fpush_ctor());
    }

    #[test]
    fn locals_sit_below_the_ar_cell() {
        let ar = ActRec::new(func(&["a", "b", "c"]), 100, 1);
        assert_eq!(ar.local_index(0), 99);
        assert_eq!(ar.local_index(2), 97);
        assert_eq!(ar.eval_floor(), 97);
        assert_eq!(ar.state, FrameState::PreLive);
    }
}
