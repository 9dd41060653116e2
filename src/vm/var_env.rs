//! Variable environments
//!
//! A `VarEnv` is the name-keyed view of a scope. While attached to a frame,
//! each of that frame's named locals is bound to its stack slot, so a
//! lookup through the table and a direct slot access always see the same
//! cell. Variables with no slot (`extract()`, `$$name`, globals set from
//! functions) are owned by the table itself.
//!
//! ## Nesting
//!
//! One environment can be attached to several frames at once (a pseudo-main
//! running inside another pseudo-main's scope). `attach` records where each
//! name lived before so that `detach` can move the values back out, and the
//! depth counter destroys the environment when the last frame leaves,
//! unless it is the global one.
//!
//! ## Extra arguments
//!
//! Arguments beyond the declared parameters are kept here in reverse order:
//! index 0 holds the last extra argument.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` (VarEnv)

use crate::core::value::{ArrayData, ArrayKey, TypedValue};
use crate::vm::engine::VM;
use crate::vm::frame::{ActRec, EnvOrName};
use crate::vm::stack::Stack;
use indexmap::IndexMap;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarEnvId(pub(crate) usize);

/// Storage behind a name
#[derive(Debug)]
pub enum Binding {
    /// A named local of the attached frame
    Slot(usize),
    Owned(TypedValue),
}

/// Where a name lived before an attach
#[derive(Debug, Clone, PartialEq)]
enum PrevLoc {
    Absent,
    Slot(usize),
    Table,
}

/// Canonical location of a variable
#[derive(Debug, Clone, PartialEq)]
pub enum VarLoc {
    Slot(usize),
    Env(VarEnvId, Rc<[u8]>),
}

/// What one `attach` displaced
#[derive(Debug)]
struct Attachment {
    frame: usize,
    saved: Vec<(Rc<[u8]>, PrevLoc)>,
    /// Surplus arguments of the frame attached before
    outer_extra_args: Vec<TypedValue>,
}

#[derive(Debug, Default)]
pub struct VarEnv {
    vars: IndexMap<Rc<[u8]>, Binding>,
    extra_args: Vec<TypedValue>,
    depth: u32,
    restore: Vec<Attachment>,
    /// Frame most recently attached
    cfp: Option<usize>,
    is_global: bool,
}

impl VarEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_global() -> Self {
        Self {
            is_global: true,
            ..Self::default()
        }
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn attached_frame(&self) -> Option<usize> {
        self.cfp
    }

    pub fn binding(&self, name: &[u8]) -> Option<&Binding> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &[u8]) -> bool {
        self.vars.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Rc<[u8]>> {
        self.vars.keys()
    }

    /// Copy of the variable, `None` when unbound
    pub fn get(&self, stack: &Stack, name: &[u8]) -> Option<TypedValue> {
        match self.vars.get(name)? {
            Binding::Slot(s) => Some(stack.at(*s).clone()),
            Binding::Owned(v) => Some(v.clone()),
        }
    }

    /// Bind `name` to a table-owned value, writing through a slot if bound
    pub fn set(&mut self, stack: &mut Stack, name: &[u8], value: TypedValue) {
        match self.vars.get_mut(name) {
            Some(Binding::Slot(s)) => stack.at_mut(*s).set_cell(value),
            Some(Binding::Owned(v)) => v.set_cell(value),
            None => {
                self.vars.insert(Rc::from(name), Binding::Owned(value));
            }
        }
    }

    /// Rebind `name` to a var without writing through the old one
    pub fn bind(&mut self, stack: &mut Stack, name: &[u8], value: TypedValue) {
        match self.vars.get_mut(name) {
            Some(Binding::Slot(s)) => stack.at_mut(*s).assign(value),
            Some(Binding::Owned(v)) => v.assign(value),
            None => {
                self.vars.insert(Rc::from(name), Binding::Owned(value));
            }
        }
    }

    /// Insert null under `name` if unbound
    pub fn define(&mut self, name: &[u8]) {
        if !self.vars.contains_key(name) {
            self.vars.insert(Rc::from(name), Binding::Owned(TypedValue::Null));
        }
    }

    /// Slots stay bound to their frame; table entries go away
    pub fn unset(&mut self, stack: &mut Stack, name: &[u8]) {
        match self.vars.get(name) {
            Some(Binding::Slot(s)) => stack.at_mut(*s).assign(TypedValue::Uninit),
            Some(Binding::Owned(_)) => {
                self.vars.shift_remove(name);
            }
            None => {}
        }
    }

    /// Move each named local of `ar` into the table's view
    pub fn attach(&mut self, stack: &mut Stack, frame: usize, ar: &ActRec) {
        let mut saved = Vec::with_capacity(ar.func.num_locals());
        for (id, name) in ar.func.local_names.iter().enumerate() {
            let slot = ar.local_index(id);
            let key: Rc<[u8]> = Rc::from(name.as_bytes());
            let prev = match self.vars.get_mut(&key) {
                Some(Binding::Owned(v)) => {
                    stack.at_mut(slot).assign(std::mem::take(v));
                    PrevLoc::Table
                }
                Some(Binding::Slot(s0)) => {
                    let s0 = *s0;
                    let value = std::mem::take(stack.at_mut(s0));
                    stack.at_mut(slot).assign(value);
                    PrevLoc::Slot(s0)
                }
                None => PrevLoc::Absent,
            };
            self.vars.insert(key.clone(), Binding::Slot(slot));
            saved.push((key, prev));
        }
        self.restore.push(Attachment {
            frame,
            saved,
            outer_extra_args: std::mem::take(&mut self.extra_args),
        });
        self.depth += 1;
        self.cfp = Some(frame);
    }

    /// Undo the attach of `frame`, moving slot values back out.
    /// Returns true when the environment should be destroyed.
    pub fn detach(&mut self, stack: &mut Stack, frame: usize) -> bool {
        if let Some(Attachment {
            frame: attached,
            saved,
            outer_extra_args,
        }) = self.restore.pop()
        {
            debug_assert_eq!(attached, frame, "detaching a frame that is not the innermost");
            self.extra_args = outer_extra_args;
            for (name, prev) in saved {
                let Some(Binding::Slot(slot)) = self.vars.get(&name) else {
                    continue;
                };
                let value = std::mem::take(stack.at_mut(*slot));
                match prev {
                    PrevLoc::Slot(s0) => {
                        stack.at_mut(s0).assign(value);
                        self.vars.insert(name, Binding::Slot(s0));
                    }
                    PrevLoc::Table | PrevLoc::Absent => {
                        if value.is_uninit() {
                            self.vars.shift_remove(&name);
                        } else {
                            self.vars.insert(name, Binding::Owned(value));
                        }
                    }
                }
            }
        }
        self.depth = self.depth.saturating_sub(1);
        self.cfp = self.restore.last().map(|a| a.frame);
        self.depth == 0 && !self.is_global
    }

    /// Store surplus arguments given in stack order (first extra first)
    pub fn set_extra_args(&mut self, args: Vec<TypedValue>) {
        self.extra_args = args;
        self.extra_args.reverse();
    }

    pub fn num_extra_args(&self) -> usize {
        self.extra_args.len()
    }

    /// Extra argument `i`, counting from the first surplus argument
    pub fn get_extra_arg(&self, i: usize) -> Option<&TypedValue> {
        let n = self.extra_args.len();
        if i < n { self.extra_args.get(n - i - 1) } else { None }
    }

    /// Defined variables as an array; uninit entries are skipped, vars kept
    pub fn defined_variables(&self, stack: &Stack) -> ArrayData {
        let mut arr = ArrayData::with_capacity(self.vars.len());
        for (name, binding) in &self.vars {
            let value = match binding {
                Binding::Slot(s) => stack.at(*s),
                Binding::Owned(v) => v,
            };
            if value.is_uninit() {
                continue;
            }
            arr.set(ArrayKey::from_bytes(name), value.clone());
        }
        arr
    }
}

impl VM {
    pub(crate) fn env(&self, id: VarEnvId) -> Option<&VarEnv> {
        self.var_envs.get(id.0).and_then(|e| e.as_ref())
    }

    pub(crate) fn env_mut(&mut self, id: VarEnvId) -> Option<&mut VarEnv> {
        self.var_envs.get_mut(id.0).and_then(|e| e.as_mut())
    }

    pub(crate) fn alloc_env(&mut self, env: VarEnv) -> VarEnvId {
        if let Some(idx) = self.free_envs.pop() {
            self.var_envs[idx] = Some(env);
            return VarEnvId(idx);
        }
        self.var_envs.push(Some(env));
        VarEnvId(self.var_envs.len() - 1)
    }

    /// The request's global scope, created on first use
    pub fn global_env(&mut self) -> VarEnvId {
        if let Some(id) = self.global_env {
            return id;
        }
        let id = self.alloc_env(VarEnv::new_global());
        self.global_env = Some(id);
        id
    }

    pub(crate) fn attach_env(&mut self, id: VarEnvId, frame: usize) {
        let Some(env) = self.var_envs.get_mut(id.0).and_then(|e| e.as_mut()) else {
            return;
        };
        env.attach(&mut self.stack, frame, &self.frames[frame]);
        self.frames[frame].env_or_name = EnvOrName::VarEnv(id);
        trace!(env = id.0, frame, depth = env.depth(), "var env attached");
    }

    /// Detach the frame's environment, destroying it at depth zero
    pub(crate) fn detach_env(&mut self, frame: usize) {
        let Some(id) = self.frames[frame].var_env() else {
            return;
        };
        let destroy = match self.var_envs.get_mut(id.0).and_then(|e| e.as_mut()) {
            Some(env) => env.detach(&mut self.stack, frame),
            None => false,
        };
        self.frames[frame].env_or_name = EnvOrName::Empty;
        if destroy {
            self.var_envs[id.0] = None;
            self.free_envs.push(id.0);
        }
        trace!(env = id.0, frame, destroyed = destroy, "var env detached");
    }

    /// Environment of a running frame, created and attached lazily
    pub(crate) fn frame_env(&mut self, frame: usize) -> VarEnvId {
        if let Some(id) = self.frames[frame].var_env() {
            return id;
        }
        let id = self.alloc_env(VarEnv::new());
        self.attach_env(id, frame);
        id
    }

    /// Resolve `name` in a frame's scope, creating it as null when `define`
    pub(crate) fn lookup_var(&mut self, frame: usize, name: &[u8], define: bool) -> Option<VarLoc> {
        if let Some(id) = self.frames[frame].var_env() {
            let env = self.env_mut(id)?;
            if !env.contains(name) {
                if !define {
                    return None;
                }
                env.define(name);
            }
            return Some(VarLoc::Env(id, Rc::from(name)));
        }
        let ar = &self.frames[frame];
        if let Some(slot) = ar.func.lookup_var_id(name) {
            return Some(VarLoc::Slot(ar.local_index(slot)));
        }
        if !define {
            return None;
        }
        let id = self.frame_env(frame);
        self.env_mut(id)?.define(name);
        Some(VarLoc::Env(id, Rc::from(name)))
    }

    pub(crate) fn lookup_global(&mut self, name: &[u8], define: bool) -> Option<VarLoc> {
        let id = self.global_env();
        let env = self.env_mut(id)?;
        if !env.contains(name) {
            if !define {
                return None;
            }
            env.define(name);
        }
        Some(VarLoc::Env(id, Rc::from(name)))
    }

    /// Storage of a resolved variable
    pub(crate) fn var_mut(&mut self, loc: &VarLoc) -> Option<&mut TypedValue> {
        match loc {
            VarLoc::Slot(s) => Some(self.stack.at_mut(*s)),
            VarLoc::Env(id, name) => {
                let env = self.var_envs.get_mut(id.0)?.as_mut()?;
                match env.vars.get_mut(name.as_ref())? {
                    Binding::Slot(s) => Some(self.stack.at_mut(*s)),
                    Binding::Owned(v) => Some(v),
                }
            }
        }
    }

    pub(crate) fn var_ref(&self, loc: &VarLoc) -> Option<&TypedValue> {
        match loc {
            VarLoc::Slot(s) => Some(self.stack.at(*s)),
            VarLoc::Env(id, name) => match self.env(*id)?.binding(name)? {
                Binding::Slot(s) => Some(self.stack.at(*s)),
                Binding::Owned(v) => Some(v),
            },
        }
    }

    pub(crate) fn unset_var(&mut self, loc: &VarLoc) {
        match loc {
            VarLoc::Slot(s) => self.stack.at_mut(*s).assign(TypedValue::Uninit),
            VarLoc::Env(id, name) => {
                if let Some(env) = self.var_envs.get_mut(id.0).and_then(|e| e.as_mut()) {
                    env.unset(&mut self.stack, name);
                }
            }
        }
    }

    /// `get_defined_vars()` for a frame
    pub(crate) fn defined_vars(&self, frame: usize) -> ArrayData {
        let ar = &self.frames[frame];
        if let Some(env) = ar.var_env().and_then(|id| self.env(id)) {
            return env.defined_variables(&self.stack);
        }
        let mut arr = ArrayData::with_capacity(ar.func.num_locals());
        for (id, name) in ar.func.local_names.iter().enumerate() {
            let value = self.stack.at(ar.local_index(id));
            if !value.is_uninit() {
                arr.set(ArrayKey::from_bytes(name.as_bytes()), value.clone());
            }
        }
        arr
    }

    /// Number of surplus arguments passed to a frame
    pub(crate) fn num_extra_args(&self, frame: usize) -> usize {
        self.frames[frame]
            .var_env()
            .and_then(|id| self.env(id))
            .map_or(0, |env| env.num_extra_args())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::unit::{Func, FuncAttrs, UnitData};
    use crate::vm::stack::MIN_STACK_ELMS;
    use std::sync::Arc;

    fn frame_on(stack: &mut Stack, locals: &[&str]) -> ActRec {
        let func = Arc::new(Func {
            name: Arc::from(""),
            cls: None,
            attrs: FuncAttrs::default(),
            params: Vec::new(),
            local_names: locals.iter().map(|n| Arc::from(*n)).collect(),
            num_iterators: 0,
            max_stack_cells: 1,
            code: Vec::new(),
            lines: Vec::new(),
            eh_table: Vec::new(),
            is_pseudo_main: true,
            native: None,
            unit: Arc::new(UnitData::default()),
        });
        let base = stack.alloc();
        for _ in locals {
            stack.push(TypedValue::Uninit);
        }
        ActRec::new(func, base, 0)
    }

    #[test]
    fn attach_moves_table_values_into_slots_and_back() {
        let mut stack = Stack::new(MIN_STACK_ELMS).unwrap();
        let mut env = VarEnv::new_global();
        env.set(&mut stack, b"x", TypedValue::Int(1));
        env.set(&mut stack, b"other", TypedValue::Int(7));

        let ar = frame_on(&mut stack, &["x", "y"]);
        env.attach(&mut stack, 0, &ar);
        assert_eq!(stack.at(ar.local_index(0)), &TypedValue::Int(1));
        assert!(matches!(env.binding(b"x"), Some(Binding::Slot(_))));

        // writes through the slot are visible through the table
        stack.at_mut(ar.local_index(0)).assign(TypedValue::Int(5));
        stack.at_mut(ar.local_index(1)).assign(TypedValue::Int(6));
        assert_eq!(env.get(&stack, b"x"), Some(TypedValue::Int(5)));

        assert!(!env.detach(&mut stack, 0));
        assert_eq!(env.get(&stack, b"x"), Some(TypedValue::Int(5)));
        assert_eq!(env.get(&stack, b"y"), Some(TypedValue::Int(6)));
        assert_eq!(env.get(&stack, b"other"), Some(TypedValue::Int(7)));
        assert!(stack.at(ar.local_index(0)).is_uninit());
    }

    #[test]
    fn nested_attach_restores_outer_slots() {
        let mut stack = Stack::new(MIN_STACK_ELMS).unwrap();
        let mut env = VarEnv::new();
        let outer = frame_on(&mut stack, &["a"]);
        env.attach(&mut stack, 0, &outer);
        stack.at_mut(outer.local_index(0)).assign(TypedValue::Int(1));

        let inner = frame_on(&mut stack, &["a", "b"]);
        env.attach(&mut stack, 1, &inner);
        assert_eq!(env.depth(), 2);
        assert_eq!(stack.at(inner.local_index(0)), &TypedValue::Int(1));
        stack.at_mut(inner.local_index(0)).assign(TypedValue::Int(2));

        assert!(!env.detach(&mut stack, 1));
        assert_eq!(stack.at(outer.local_index(0)), &TypedValue::Int(2));
        assert_eq!(env.attached_frame(), Some(0));
        // "b" was never set, so it leaves no entry behind
        assert!(!env.contains(b"b"));
        assert!(env.detach(&mut stack, 0));
    }

    #[test]
    fn extra_args_are_stored_in_reverse() {
        let mut env = VarEnv::new();
        env.set_extra_args(vec![TypedValue::Int(3), TypedValue::Int(4), TypedValue::Int(5)]);
        assert_eq!(env.num_extra_args(), 3);
        assert_eq!(env.extra_args[0], TypedValue::Int(5));
        assert_eq!(env.get_extra_arg(0), Some(&TypedValue::Int(3)));
        assert_eq!(env.get_extra_arg(2), Some(&TypedValue::Int(5)));
        assert_eq!(env.get_extra_arg(3), None);
    }

    #[test]
    fn defined_variables_skip_uninit_and_keep_refs() {
        let mut stack = Stack::new(MIN_STACK_ELMS).unwrap();
        let mut env = VarEnv::new();
        let ar = frame_on(&mut stack, &["a", "b"]);
        env.attach(&mut stack, 0, &ar);
        let mut cell = TypedValue::Int(1);
        let r = cell.box_in_place();
        stack.at_mut(ar.local_index(0)).assign(cell);
        env.set(&mut stack, b"dyn", TypedValue::string("d"));
        let vars = env.defined_variables(&stack);
        assert_eq!(vars.len(), 2);
        assert!(matches!(vars.get(&ArrayKey::from_bytes(b"a")), Some(TypedValue::Ref(x)) if Rc::ptr_eq(x, &r)));
    }

    #[test]
    fn nested_attach_keeps_each_frames_extra_args() {
        let mut stack = Stack::new(MIN_STACK_ELMS).unwrap();
        let mut env = VarEnv::new_global();
        let outer = frame_on(&mut stack, &["a"]);
        env.attach(&mut stack, 0, &outer);
        env.set_extra_args(vec![TypedValue::Int(1)]);

        let inner = frame_on(&mut stack, &["a"]);
        env.attach(&mut stack, 1, &inner);
        assert_eq!(env.num_extra_args(), 0);
        env.set_extra_args(vec![TypedValue::Int(8), TypedValue::Int(9)]);
        assert_eq!(env.get_extra_arg(1), Some(&TypedValue::Int(9)));

        env.detach(&mut stack, 1);
        assert_eq!(env.num_extra_args(), 1);
        assert_eq!(env.get_extra_arg(0), Some(&TypedValue::Int(1)));
    }
}
