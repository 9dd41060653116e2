//! User destructors
//!
//! Releasing the last reference to an object whose class declares
//! `__destruct` queues its class and properties (see `ObjectData`'s `Drop`).
//! The queue is drained between instructions: the instruction that dropped
//! the object finishes first, then each destructor runs in a nested
//! dispatch with a revived `$this`. Objects still alive when the request
//! ends are released with the global scope and the static storage, and
//! their destructors run before the request reports its result.
//!
//! An object whose constructor faulted is marked `no_destruct` and skipped.
//!
//! Reference: HHVM `runtime/base/object-data.cpp` - ObjectData::release
//! Reference: $PHP_SRC_PATH/Zend/zend_objects_API.c - zend_objects_store_call_destructors

use crate::core::value::{
    discard_pending_destructs, has_pending_destructs, requeue_pending_destructs, take_pending_destructs,
};
use crate::vm::engine::{VM, VmError};
use crate::vm::frame::ThisOrClass;
use tracing::{debug, trace};

impl VM {
    /// Run every queued destructor, including those queued while draining
    pub(crate) fn run_pending_destructors(&mut self) -> Result<(), VmError> {
        while has_pending_destructs() {
            let mut batch = take_pending_destructs().into_iter();
            while let Some(pending) = batch.next() {
                let Some(dtor) = pending.class.get_dtor().cloned() else {
                    continue;
                };
                let obj = pending.revive();
                trace!(class = %obj.class.name, id = obj.id, "destructor");
                if let Err(err) = self.invoke_func(&dtor, &[], ThisOrClass::This(obj), None, None) {
                    requeue_pending_destructs(batch.collect());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Release request-lifetime storage and run the destructors it frees
    ///
    /// Globals go first, then static properties and static locals.
    pub fn end_request(&mut self) -> Result<(), VmError> {
        self.release_globals();
        self.run_pending_destructors()?;
        self.release_statics();
        self.run_pending_destructors()?;
        debug!("request storage released");
        Ok(())
    }

    /// Release request-lifetime storage without running destructors
    pub fn abandon_request(&mut self) {
        self.release_globals();
        self.release_statics();
        discard_pending_destructs();
    }

    fn release_globals(&mut self) {
        let Some(id) = self.global_env.take() else {
            return;
        };
        if let Some(env) = self.var_envs.get_mut(id.0).and_then(Option::take) {
            self.free_envs.push(id.0);
            drop(env);
        }
    }

    fn release_statics(&mut self) {
        let props = std::mem::take(&mut self.context.static_props);
        let locals = std::mem::take(&mut self.context.static_locals);
        drop((props, locals));
    }
}
