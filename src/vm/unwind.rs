//! Fault propagation
//!
//! Every error that escapes an instruction handler enters here through
//! [`VM::handle_fault`]. The error becomes a `Fault` on the request's fault
//! stack and the handler tables are searched outward from the faulting
//! instruction:
//!
//! - a `catch` region whose class matches a user exception resumes the
//!   frame at the handler, which starts with `Catch`;
//! - a fault region (cleanup funclet) always runs and ends in `Unwind`,
//!   which resumes the search at the region's parent;
//! - a frame with no handler left is torn down and the search continues at
//!   the caller's call site.
//!
//! Recoverable fatals travel as `FatalErrorException` objects so bytecode
//! can catch them. `Exit`, `Timeout` and decoding errors travel as native
//! faults: only cleanup funclets see them.
//!
//! When the frame torn down is `first_ar`, the fault leaves the innermost
//! dispatch loop as `Err` and the native caller decides what happens next.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - hhvmThrow, handleUnwind,
//! iopCatch, iopUnwind, iopThrow
//! Reference: $PHP_SRC_PATH/Zend/zend_vm_def.h - ZEND_HANDLE_EXCEPTION

use crate::core::value::{ObjectData, TypedValue};
use crate::runtime::unit::EhKind;
use crate::vm::engine::{VM, VmError};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, debug_span, trace};

#[derive(Debug)]
pub enum FaultKind {
    /// Exception object thrown by bytecode, or a converted fatal
    User(Rc<ObjectData>),
    /// Error that only cleanup funclets may observe
    Native(VmError),
}

#[derive(Debug)]
pub struct Fault {
    pub kind: FaultKind,
    /// Handler region to continue the search at after `Unwind`
    pub resume_eh: Option<usize>,
}

/// One entry of [`VM::backtrace`]
#[derive(Debug, Clone, PartialEq)]
pub struct BacktraceFrame {
    pub function: String,
    pub file: Arc<str>,
    pub line: u32,
}

impl std::fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let function = if self.function.is_empty() { "{main}" } else { &self.function };
        write!(f, "{}() called at [{}:{}]", function, self.file, self.line)
    }
}

impl VM {
    /// `FatalErrorException` carrying a recoverable error's message
    fn fatal_error_object(&self, err: &VmError) -> Option<Rc<ObjectData>> {
        let cls = self.context.lookup_class("FatalErrorException")?;
        let obj = ObjectData::new(cls.clone());
        obj.set_prop(b"message", TypedValue::string(err.to_string()));
        obj.set_prop(b"code", TypedValue::Int(0));
        Some(obj)
    }

    /// `Exception` thrown by the runtime itself
    pub(crate) fn runtime_exception(&self, message: impl Into<String>) -> VmError {
        let message = message.into();
        match self.context.lookup_class("Exception") {
            Some(cls) => {
                let obj = ObjectData::new(cls.clone());
                obj.set_prop(b"message", TypedValue::string(message));
                VmError::Exception(obj)
            }
            None => VmError::fatal(message),
        }
    }

    /// Enter the fault protocol with an error raised by the current instruction
    pub(crate) fn handle_fault(&mut self, err: VmError) -> Result<(), VmError> {
        let Some(fp) = self.fp else {
            return Err(err);
        };
        if self.options.backtrace {
            self.fault_backtrace = self.backtrace();
        }
        let kind = match err {
            VmError::Exception(obj) => FaultKind::User(obj),
            err if err.is_recoverable() => match self.fatal_error_object(&err) {
                Some(obj) => FaultKind::User(obj),
                None => FaultKind::Native(err),
            },
            err => FaultKind::Native(err),
        };
        let span = debug_span!("unwind", func = %self.frames[fp].func.full_name(), offset = self.op_start);
        let _guard = span.enter();
        debug!(fault = ?kind, "fault raised");
        self.faults.push(Fault {
            kind,
            resume_eh: None,
        });
        let eh = self.frames[fp].func.find_eh(self.op_start);
        self.unwind(eh)
    }

    /// Search handler regions starting at `eh`, tearing frames down as
    /// they run out
    fn unwind(&mut self, mut eh: Option<usize>) -> Result<(), VmError> {
        loop {
            let fp = self.fp()?;
            let func = self.frames[fp].func.clone();
            while let Some(idx) = eh {
                let Some(entry) = func.eh_table.get(idx) else {
                    break;
                };
                match &entry.kind {
                    EhKind::Catch { handlers } => {
                        let target = match self.faults.last() {
                            Some(Fault {
                                kind: FaultKind::User(obj),
                                ..
                            }) => handlers
                                .iter()
                                .find(|(cls, _)| obj.instance_of(cls))
                                .map(|(_, h)| *h),
                            _ => None,
                        };
                        if let Some(handler) = target {
                            trace!(handler, "entering catch handler");
                            self.enter_handler(fp, handler);
                            return Ok(());
                        }
                    }
                    EhKind::Fault { handler } => {
                        if let Some(fault) = self.faults.last_mut() {
                            fault.resume_eh = entry.parent;
                        }
                        trace!(handler = *handler, "entering fault funclet");
                        self.enter_handler(fp, *handler);
                        return Ok(());
                    }
                }
                eh = entry.parent;
            }

            let caller = self.frames[fp].saved_fp;
            let call_site = self.frames[fp].soff;
            let return_pc = self.frames[fp].return_pc;
            self.teardown_frame(fp);
            if self.first_ar == Some(fp) || caller.is_none() {
                self.fp = caller;
                self.halted = true;
                return Err(self.take_fault_error());
            }
            self.fp = caller;
            self.op_start = call_site;
            self.pc = return_pc;
            eh = match caller {
                Some(c) => self.frames[c].func.find_eh(call_site),
                None => None,
            };
        }
    }

    fn enter_handler(&mut self, fp: usize, handler: usize) {
        self.frames.truncate(fp + 1);
        let floor = self.frames[fp].eval_floor();
        self.stack.set_top(floor);
        self.pc = handler;
        self.op_start = handler;
    }

    /// Release a faulting frame's locals and its AR cell
    fn teardown_frame(&mut self, fp: usize) {
        let ar = &self.frames[fp];
        if ar.is_from_fpush_ctor() {
            if let Some(obj) = ar.this() {
                obj.no_destruct.set(true);
            }
        }
        trace!(func = %ar.func.full_name(), frame = fp, "frame torn down");
        self.frames.truncate(fp + 1);
        self.detach_env(fp);
        let base = self.frames[fp].base;
        self.stack.set_top(base + 1);
        self.frames.truncate(fp);
    }

    /// The error a fault leaving the dispatch loop turns back into
    fn take_fault_error(&mut self) -> VmError {
        match self.faults.pop() {
            Some(Fault {
                kind: FaultKind::User(obj),
                ..
            }) => {
                if obj.instance_of("FatalErrorException") {
                    let message = obj
                        .get_prop(b"message")
                        .map(|m| String::from_utf8_lossy(&m.to_string_bytes()).into_owned())
                        .unwrap_or_default();
                    VmError::Fatal(message)
                } else {
                    VmError::Exception(obj)
                }
            }
            Some(Fault {
                kind: FaultKind::Native(err),
                ..
            }) => err,
            None => VmError::fatal("Fault stack underflow"),
        }
    }

    /// Pop the caught fault and push its exception
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCatch
    pub(crate) fn exec_catch(&mut self) -> Result<(), VmError> {
        match self.faults.pop() {
            Some(Fault {
                kind: FaultKind::User(obj),
                ..
            }) => {
                self.push(TypedValue::Object(obj));
                Ok(())
            }
            Some(fault) => {
                self.faults.push(fault);
                Err(VmError::invalid_bytecode(self.op_start, "Catch without a user exception"))
            }
            None => Err(VmError::invalid_bytecode(self.op_start, "Catch without a fault")),
        }
    }

    /// End of a fault funclet: keep propagating the innermost fault
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopUnwind
    pub(crate) fn exec_unwind(&mut self) -> Result<(), VmError> {
        let Some(fault) = self.faults.last() else {
            return Err(VmError::invalid_bytecode(self.op_start, "Unwind without a fault"));
        };
        let resume = fault.resume_eh;
        self.unwind(resume)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopThrow
    pub(crate) fn exec_throw(&mut self) -> Result<(), VmError> {
        match self.pop_c()? {
            TypedValue::Object(obj) if obj.instance_of("Exception") => Err(VmError::Exception(obj)),
            _ => Err(VmError::fatal(
                "Exceptions must be valid objects derived from the Exception base class",
            )),
        }
    }

    /// Live frames from innermost to outermost, nested dispatches included
    pub fn backtrace(&self) -> Vec<BacktraceFrame> {
        let mut out = Vec::new();
        let mut frame = self.fp;
        let mut offset = self.op_start;
        while let Some(fp) = frame {
            let Some(ar) = self.frames.get(fp) else {
                break;
            };
            out.push(BacktraceFrame {
                function: ar.func.full_name(),
                file: ar.func.unit.filepath.clone(),
                line: ar.func.line_for(offset),
            });
            offset = ar.soff;
            frame = ar.saved_fp;
        }
        out
    }
}
