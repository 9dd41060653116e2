//! Continuations
//!
//! A generator is compiled to two functions. The generator itself runs
//! `CreateCont`, which returns a `Continuation` object seeded with the
//! locals the body shares with it. The body takes that object as its only
//! parameter and is entered again on every `next()`/`send()`/`raise()`:
//!
//! ```text
//! .function gen_body($cont) {
//!   UnpackCont
//!   Switch <L0 L1> 0 bounded
//! L0:
//!   Int 1; PackCont 1; Null; RetC     # yield 1
//! L1:
//!   ContRaised; ContReceive; PopC
//!   ContDone; Null; RetC
//! }
//! ```
//!
//! `UnpackCont` moves the saved locals back into the frame and pushes the
//! label to resume at; `PackCont` moves them out again together with the
//! yielded value. Between entries the frame does not exist.
//!
//! The `Cont*` instructions that run inside the `Continuation` methods of
//! the prelude find the state through `$this`: `ContNext`, `ContSend` and
//! `ContRaise` prepare an entry, `ContEnter` performs it and `ContStopped`
//! or `ContHandle` close it.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - iopCreateCont, iopUnpackCont,
//! iopPackCont, iopContReceive, iopContRaised, iopContDone, iopContNext,
//! iopContSend, iopContRaise, iopContValid, iopContCurrent, iopContStopped,
//! iopContHandle

use crate::core::value::{ObjectData, TypedValue};
use crate::runtime::builtins;
use crate::vm::engine::{VM, VmError};
use crate::vm::frame::ContinuationData;
use std::cell::{RefCell, RefMut};
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

const CONTINUATION_CLASS: &str = "Continuation";

fn state(obj: &ObjectData) -> Option<&RefCell<ContinuationData>> {
    obj.internal::<RefCell<ContinuationData>>()
}

fn state_mut(obj: &ObjectData) -> Result<RefMut<'_, ContinuationData>, VmError> {
    state(obj)
        .and_then(|s| s.try_borrow_mut().ok())
        .ok_or_else(|| VmError::fatal(format!("{} has no generator attached", obj.class.name)))
}

/// Guard shared by `current()`, `key()`, `send()` and `raise()`
fn next_check(vm: &VM, cont: &ContinuationData) -> Result<(), VmError> {
    if cont.index < 0 {
        return Err(vm.runtime_exception("Need to call next() first"));
    }
    Ok(())
}

/// Guard on every entry into the body
fn pre_next(vm: &VM, cont: &mut ContinuationData) -> Result<(), VmError> {
    if cont.done {
        return Err(vm.runtime_exception("Continuation is already finished"));
    }
    if cont.running {
        return Err(vm.runtime_exception("Continuation is already running"));
    }
    cont.running = true;
    cont.index += 1;
    Ok(())
}

impl VM {
    /// The continuation a body frame received as local 0
    fn frame_continuation(&self) -> Result<Rc<ObjectData>, VmError> {
        let ar = self.frame()?;
        match self.stack.at(ar.local_index(0)).to_cell() {
            TypedValue::Object(obj) if state(&obj).is_some() => Ok(obj),
            _ => Err(VmError::invalid_bytecode(
                self.op_start,
                "continuation instruction outside a generator body",
            )),
        }
    }

    fn this_continuation(&self) -> Result<Rc<ObjectData>, VmError> {
        match self.frame()?.this() {
            Some(obj) if state(obj).is_some() => Ok(obj.clone()),
            Some(obj) => Err(VmError::fatal(format!("{} has no generator attached", obj.class.name))),
            None => Err(VmError::fatal("Using $this when not in object context")),
        }
    }

    /// Arguments recorded for a generator body frame, if it is one
    pub(crate) fn continuation_args(&self, fp: usize) -> Option<Vec<TypedValue>> {
        let ar = &self.frames[fp];
        if ar.func.num_locals() == 0 {
            return None;
        }
        let TypedValue::Object(obj) = self.stack.at(ar.local_index(0)).to_cell() else {
            return None;
        };
        let cont = state(&obj)?.try_borrow().ok()?;
        if !Arc::ptr_eq(&cont.body, &ar.func) {
            return None;
        }
        cont.args.clone()
    }

    /// Build a continuation for the body `name` from the running frame
    pub(crate) fn exec_create_cont(&mut self, get_args: bool, name: &[u8]) -> Result<(), VmError> {
        let fp = self.fp()?;
        let orig = self.frames[fp].func.clone();
        let name = String::from_utf8_lossy(name).into_owned();
        let body = match &orig.cls {
            Some(cls) => self
                .context
                .lookup_class(cls)
                .and_then(|c| c.lookup_method(&name))
                .cloned(),
            None => self.context.lookup_func(&name).cloned(),
        }
        .ok_or_else(|| VmError::fatal(format!("Generator body {}() not found", name)))?;
        let cls = self.lookup_class(CONTINUATION_CLASS)?;

        let this_or_class = self.frames[fp].this_or_class.clone();
        let args = get_args.then(|| builtins::frame_args(self, fp));
        let mut data = ContinuationData::new(body.clone(), this_or_class, args);
        for (slot, local) in body.local_names.iter().enumerate().skip(1) {
            let value = if local.as_ref() == "this" && orig.lookup_var_id(local.as_bytes()).is_none() {
                self.frames[fp].this().cloned().map(TypedValue::Object)
            } else {
                self.lookup_var(fp, local.as_bytes(), false)
                    .and_then(|loc| self.var_ref(&loc).cloned())
            };
            if let Some(value) = value {
                data.locals[slot - 1] = value;
            }
        }

        let obj = ObjectData::with_internal(cls, Rc::new(RefCell::new(data)));
        trace!(body = %body.full_name(), obj = obj.id, "continuation created");
        self.push(TypedValue::Object(obj));
        Ok(())
    }

    /// Restore the saved locals; pushes the resume label
    pub(crate) fn exec_unpack_cont(&mut self) -> Result<(), VmError> {
        let obj = self.frame_continuation()?;
        let fp = self.fp()?;
        let (locals, iters, label) = {
            let mut cont = state_mut(&obj)?;
            let locals = std::mem::take(&mut cont.locals);
            let iters = std::mem::take(&mut cont.iters);
            (locals, iters, cont.label)
        };
        for (i, value) in locals.into_iter().enumerate() {
            let slot = self.frames[fp].local_index(i + 1);
            self.stack.at_mut(slot).assign(value);
        }
        if !iters.is_empty() {
            self.frames[fp].iters = iters;
        }
        self.push(TypedValue::Int(label));
        Ok(())
    }

    /// Suspend: save the locals and the yielded value, resume at `label`
    pub(crate) fn exec_pack_cont(&mut self, label: i64) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let obj = self.frame_continuation()?;
        let fp = self.fp()?;
        let count = self.frames[fp].func.num_locals().saturating_sub(1);
        let locals: Vec<TypedValue> = (1..=count)
            .map(|id| {
                let slot = self.frames[fp].local_index(id);
                std::mem::take(self.stack.at_mut(slot))
            })
            .collect();
        let iters = std::mem::take(&mut self.frames[fp].iters);
        let mut cont = state_mut(&obj)?;
        cont.locals = locals;
        cont.iters = iters;
        cont.label = label;
        cont.value = value;
        trace!(label, index = cont.index, "continuation suspended");
        Ok(())
    }

    pub(crate) fn exec_cont_receive(&mut self) -> Result<(), VmError> {
        let obj = self.frame_continuation()?;
        let received = std::mem::take(&mut state_mut(&obj)?.received);
        self.push(received);
        Ok(())
    }

    /// Throw what `raise()` passed in, once
    pub(crate) fn exec_cont_raised(&mut self) -> Result<(), VmError> {
        let obj = self.frame_continuation()?;
        let raised = {
            let mut cont = state_mut(&obj)?;
            if !cont.should_throw {
                return Ok(());
            }
            cont.should_throw = false;
            std::mem::take(&mut cont.received)
        };
        self.push(raised);
        self.exec_throw()
    }

    pub(crate) fn exec_cont_done(&mut self) -> Result<(), VmError> {
        let obj = self.frame_continuation()?;
        let mut cont = state_mut(&obj)?;
        cont.done = true;
        cont.value = TypedValue::Null;
        Ok(())
    }

    pub(crate) fn exec_cont_next(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let mut cont = state_mut(&obj)?;
        cont.received = TypedValue::Null;
        pre_next(self, &mut cont)
    }

    /// Prepare an entry that receives local 0 of the calling method
    fn cont_send(&mut self, raise: bool) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let fp = self.fp()?;
        let sent = self.stack.at(self.frames[fp].local_index(0)).to_cell();
        let mut cont = state_mut(&obj)?;
        next_check(self, &cont)?;
        cont.received = sent;
        cont.should_throw = raise;
        pre_next(self, &mut cont)
    }

    pub(crate) fn exec_cont_send(&mut self) -> Result<(), VmError> {
        self.cont_send(false)
    }

    pub(crate) fn exec_cont_raise(&mut self) -> Result<(), VmError> {
        self.cont_send(true)
    }

    /// Call the body with the continuation as its argument; the result
    /// lands where `FCall` would leave it
    pub(crate) fn exec_cont_enter(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let (body, this_or_class) = {
            let cont = state_mut(&obj)?;
            (cont.body.clone(), cont.this_or_class.clone())
        };
        let frame = self.push_ar(body, 1, this_or_class, None)?;
        self.push(TypedValue::Object(obj));
        let ar = &mut self.frames[frame];
        ar.saved_fp = self.fp;
        ar.soff = self.op_start;
        ar.return_pc = self.pc;
        self.enter_frame(frame, None)
    }

    pub(crate) fn exec_cont_valid(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let done = state_mut(&obj)?.done;
        self.push(TypedValue::Bool(!done));
        Ok(())
    }

    pub(crate) fn exec_cont_current(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let value = {
            let cont = state_mut(&obj)?;
            next_check(self, &cont)?;
            cont.value.clone()
        };
        self.push(value);
        Ok(())
    }

    pub(crate) fn exec_cont_key(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let index = {
            let cont = state_mut(&obj)?;
            next_check(self, &cont)?;
            cont.index
        };
        self.push(TypedValue::Int(index));
        Ok(())
    }

    pub(crate) fn exec_cont_started(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        let started = state_mut(&obj)?.index >= 0;
        self.push(TypedValue::Bool(started));
        Ok(())
    }

    pub(crate) fn exec_cont_stopped(&mut self) -> Result<(), VmError> {
        let obj = self.this_continuation()?;
        state_mut(&obj)?.running = false;
        Ok(())
    }

    /// The body threw: finish the continuation and rethrow
    pub(crate) fn exec_cont_handle(&mut self) -> Result<(), VmError> {
        let exn = self.pop_c()?;
        let obj = self.this_continuation()?;
        {
            let mut cont = state_mut(&obj)?;
            cont.running = false;
            cont.done = true;
            cont.value = TypedValue::Null;
        }
        self.push(exn);
        self.exec_throw()
    }
}

/// Continuation objects cannot be copied
pub(crate) fn is_uncloneable(obj: &ObjectData) -> bool {
    state(obj).is_some()
}
