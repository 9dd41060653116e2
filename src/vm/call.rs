//! Calls: setup, entry, return and reentry
//!
//! A call is three phases spread over several instructions:
//!
//! 1. `FPush*` resolves the callee, allocates its AR cell on the stack and
//!    pushes a pre-live `ActRec` onto the frame arena.
//! 2. `FPass*` pushes each argument, boxed or not depending on whether the
//!    callee takes that parameter by reference.
//! 3. `FCall` links the record to the caller and enters it.
//!
//! ## Entry
//!
//! Entering moves surplus arguments into the frame's `VarEnv`, reserves
//! the remaining locals and starts at the default-value initializer of the
//! first parameter the caller left out. A `__call` stand-in receives its
//! arguments packed as `(name, array)`.
//!
//! ## Return
//!
//! Returning releases the locals, writes the result into the AR cell and
//! resumes the caller. When the returning frame is `first_ar` the innermost
//! dispatch loop stops instead.
//!
//! ## Reentry
//!
//! [`VM::invoke_func`] runs a function to completion from native code: it
//! saves the registers, starts a nested dispatch loop and restores them on
//! every exit path, including errors.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPush*, iopFPass*,
//! iopFCall, prepareFuncEntry, shuffleMagicArgs, ret, invokeFunc
//! Reference: $PHP_SRC_PATH/Zend/zend_vm_def.h - ZEND_INIT_FCALL_BY_NAME, ZEND_DO_FCALL

use crate::core::value::{ArrayData, TypedValue};
use crate::runtime::builtins;
use crate::runtime::class::Class;
use crate::runtime::unit::{Func, Unit};
use crate::vm::callable::Callee;
use crate::vm::engine::{VM, VmError, VmState};
use crate::vm::frame::{ActRec, EnvOrName, FrameState, Iter, ThisOrClass};
use crate::vm::var_env::VarEnvId;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug_span, trace};

/// Nested dispatch loops allowed at once
pub const MAX_NESTED_DISPATCH: usize = 256;

impl VM {
    /// Allocate the AR cell and a pre-live record above the current frame
    pub(crate) fn push_ar(
        &mut self,
        func: Arc<Func>,
        num_args: u32,
        this_or_class: ThisOrClass,
        inv_name: Option<Rc<[u8]>>,
    ) -> Result<usize, VmError> {
        if self.stack.would_overflow(num_args as usize + 1) {
            return Err(VmError::StackOverflow);
        }
        let base = self.stack.alloc();
        let mut ar = ActRec::new(func, base, num_args);
        ar.this_or_class = this_or_class;
        if let Some(name) = inv_name {
            ar.env_or_name = EnvOrName::InvName(name);
        }
        trace!(func = %ar.func.full_name(), num_args, base, "ar pushed");
        self.frames.push(ar);
        Ok(self.frames.len() - 1)
    }

    fn push_callee(&mut self, callee: Callee, num_args: u32) -> Result<usize, VmError> {
        if callee.func.attrs.is_abstract {
            return Err(VmError::fatal(format!(
                "Call to abstract method {}()",
                callee.func.full_name()
            )));
        }
        self.push_ar(callee.func, num_args, callee.this_or_class, callee.inv_name)
    }

    /// The record the next `FPass*`/`FCall` applies to
    pub(crate) fn pending_ar(&self) -> Result<usize, VmError> {
        let idx = self.frames.len().checked_sub(1);
        match idx {
            Some(i) if self.frames[i].state == FrameState::PreLive && self.fp.is_none_or(|fp| i > fp) => Ok(i),
            _ => Err(VmError::invalid_bytecode(self.op_start, "no pending call")),
        }
    }

    /// Whether parameter `param` of the pending callee is by reference
    pub(crate) fn pending_param_by_ref(&self, param: usize) -> Result<bool, VmError> {
        let ar = &self.frames[self.pending_ar()?];
        if ar.inv_name().is_some() {
            return Ok(false);
        }
        Ok(ar.func.by_ref(param))
    }

    /// Caller of a frame, across nested dispatch boundaries
    pub(crate) fn caller_of(&self, frame: usize) -> Option<usize> {
        self.frames.get(frame).and_then(|ar| ar.saved_fp)
    }

    pub(crate) fn caller_frame(&self) -> Option<usize> {
        self.fp.and_then(|fp| self.caller_of(fp))
    }

    /// Nearest frame with its own scope, skipping native functions
    pub(crate) fn user_frame(&self) -> Option<usize> {
        let mut fp = self.fp?;
        while self.frames[fp].func.is_builtin() && !self.frames[fp].func.is_method() {
            fp = self.caller_of(fp)?;
        }
        Some(fp)
    }

    // ---------------------------------------------------------------
    // FPush*
    // ---------------------------------------------------------------

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushFuncD
    #[inline]
    pub(crate) fn exec_fpush_func_d(&mut self, num_args: u32, name: &[u8]) -> Result<(), VmError> {
        let name = String::from_utf8_lossy(name);
        let func = self
            .context
            .lookup_func(&name)
            .cloned()
            .ok_or_else(|| VmError::undefined_function(name.as_ref()))?;
        self.push_ar(func, num_args, ThisOrClass::Empty, None)?;
        Ok(())
    }

    /// Callee named by a string, or an object with `__invoke`
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushFunc
    pub(crate) fn exec_fpush_func(&mut self, num_args: u32) -> Result<(), VmError> {
        let target = self.pop_c()?;
        match &target {
            TypedValue::Object(obj) => {
                let Some(func) = obj.class.lookup_method("__invoke").cloned() else {
                    return Err(VmError::fatal("Function name must be a string"));
                };
                self.push_ar(func, num_args, ThisOrClass::This(obj.clone()), None)?;
            }
            v if v.is_string() => {
                let name = String::from_utf8_lossy(v.str_bytes().unwrap_or_default()).into_owned();
                self.exec_fpush_func_d(num_args, name.as_bytes())?;
            }
            _ => return Err(VmError::fatal("Function name must be a string")),
        }
        Ok(())
    }

    fn push_obj_method(&mut self, num_args: u32, base: TypedValue, name: &str) -> Result<(), VmError> {
        let TypedValue::Object(obj) = base else {
            return Err(VmError::fatal(format!(
                "Call to a member function {}() on a non-object",
                name
            )));
        };
        let ctx = self.context_class();
        let found = self.lookup_obj_method(&obj.class, name, ctx.as_ref(), true)?;
        let callee = Callee::from_lookup(found, Some(obj.clone()), obj.class.clone(), name)
            .ok_or_else(|| {
                VmError::undefined_method(obj.class.name.as_ref(), name, ctx.map(|c| c.name.to_string()))
            })?;
        self.push_callee(callee, num_args)?;
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushObjMethodD
    #[inline]
    pub(crate) fn exec_fpush_obj_method_d(&mut self, num_args: u32, name: &[u8]) -> Result<(), VmError> {
        let base = self.pop_c()?;
        self.push_obj_method(num_args, base, &String::from_utf8_lossy(name))
    }

    /// Stack: object, then the method name on top
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushObjMethod
    pub(crate) fn exec_fpush_obj_method(&mut self, num_args: u32) -> Result<(), VmError> {
        let name = self.pop_c()?;
        let base = self.pop_c()?;
        if !name.is_string() {
            return Err(VmError::fatal("Method name must be a string"));
        }
        let name = String::from_utf8_lossy(name.str_bytes().unwrap_or_default()).into_owned();
        self.push_obj_method(num_args, base, &name)
    }

    /// `forward` keeps the caller's late-bound class for `FoundNoThis`
    fn push_cls_method(
        &mut self,
        num_args: u32,
        cls: Arc<Class>,
        name: &str,
        forward: bool,
    ) -> Result<(), VmError> {
        let ctx = self.context_class();
        let this = self.this();
        let found = self.lookup_cls_method(&cls, name, this.as_ref(), ctx.as_ref(), true)?;
        let this = this.filter(|o| o.class.classof(&cls));
        let bound_cls = if forward {
            self.user_frame()
                .and_then(|fp| self.frames[fp].late_bound_class())
                .unwrap_or_else(|| cls.clone())
        } else {
            cls.clone()
        };
        let callee = Callee::from_lookup(found, this, bound_cls, name).ok_or_else(|| {
            VmError::undefined_method(cls.name.as_ref(), name, ctx.map(|c| c.name.to_string()))
        })?;
        self.push_callee(callee, num_args)?;
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushClsMethodD
    #[inline]
    pub(crate) fn exec_fpush_cls_method_d(
        &mut self,
        num_args: u32,
        method: &[u8],
        class: &[u8],
    ) -> Result<(), VmError> {
        let cls = self.lookup_class(&String::from_utf8_lossy(class))?;
        self.push_cls_method(num_args, cls, &String::from_utf8_lossy(method), false)
    }

    fn pop_cls_and_method(&mut self) -> Result<(Arc<Class>, String), VmError> {
        let cls = match self.pop_tv("FPushClsMethod")? {
            TypedValue::Class(cls) => cls,
            _ => return Err(VmError::invalid_bytecode(self.op_start, "expected a class on the stack")),
        };
        let name = self.pop_c()?;
        if !name.is_string() {
            return Err(VmError::fatal("FPushClsMethod: method name must be a string"));
        }
        let name = String::from_utf8_lossy(name.str_bytes().unwrap_or_default()).into_owned();
        Ok((cls, name))
    }

    /// Stack: method name, then the class on top
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushClsMethod
    pub(crate) fn exec_fpush_cls_method(&mut self, num_args: u32) -> Result<(), VmError> {
        let (cls, name) = self.pop_cls_and_method()?;
        self.push_cls_method(num_args, cls, &name, false)
    }

    /// Like `FPushClsMethod`, forwarding the late-bound class
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushClsMethodF
    pub(crate) fn exec_fpush_cls_method_f(&mut self, num_args: u32) -> Result<(), VmError> {
        let (cls, name) = self.pop_cls_and_method()?;
        self.push_cls_method(num_args, cls, &name, true)
    }

    /// Push the new instance, then the constructor's record above it
    fn push_ctor(&mut self, num_args: u32, cls: Arc<Class>) -> Result<(), VmError> {
        let ctx = self.context_class();
        let ctor = match self.lookup_ctor_method(&cls, ctx.as_ref())? {
            Some(f) => f,
            None => builtins::default_ctor(),
        };
        let obj = self.instantiate(&cls)?;
        trace!(class = %cls.name, obj = obj.id, "instance created");
        self.push(TypedValue::Object(obj.clone()));
        let ar = self.push_ar(ctor, num_args, ThisOrClass::This(obj), None)?;
        self.frames[ar].set_from_fpush_ctor();
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushCtorD
    #[inline]
    pub(crate) fn exec_fpush_ctor_d(&mut self, num_args: u32, class: &[u8]) -> Result<(), VmError> {
        let cls = self.lookup_class(&String::from_utf8_lossy(class))?;
        self.push_ctor(num_args, cls)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPushCtor
    pub(crate) fn exec_fpush_ctor(&mut self, num_args: u32) -> Result<(), VmError> {
        let cls = match self.pop_tv("FPushCtor")? {
            TypedValue::Class(cls) => cls,
            _ => return Err(VmError::invalid_bytecode(self.op_start, "expected a class on the stack")),
        };
        self.push_ctor(num_args, cls)
    }

    // ---------------------------------------------------------------
    // FPass*
    // ---------------------------------------------------------------

    /// The cell is already in place
    #[inline]
    pub(crate) fn exec_fpass_c(&mut self, _param: usize) -> Result<(), VmError> {
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPassCW
    #[inline]
    pub(crate) fn exec_fpass_cw(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.raise_strict_warning("Only variables should be passed by reference")?;
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFPassCE
    #[inline]
    pub(crate) fn exec_fpass_ce(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            return Err(VmError::fatal(format!(
                "Cannot pass parameter {} by reference",
                param + 1
            )));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn exec_fpass_v(&mut self, param: usize) -> Result<(), VmError> {
        if !self.pending_param_by_ref(param)? {
            self.stack.unbox_top()?;
        }
        Ok(())
    }

    /// Return value: boxed for a by-ref parameter, unboxed otherwise
    #[inline]
    pub(crate) fn exec_fpass_r(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.stack.box_top()
        } else {
            self.stack.unbox_top()
        }
    }

    #[inline]
    pub(crate) fn exec_fpass_l(&mut self, param: usize, local: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.exec_vget_l(local)
        } else {
            self.exec_cget_l(local)
        }
    }

    #[inline]
    pub(crate) fn exec_fpass_n(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.exec_vget_n()
        } else {
            self.exec_cget_n()
        }
    }

    #[inline]
    pub(crate) fn exec_fpass_g(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.exec_vget_g()
        } else {
            self.exec_cget_g()
        }
    }

    #[inline]
    pub(crate) fn exec_fpass_s(&mut self, param: usize) -> Result<(), VmError> {
        if self.pending_param_by_ref(param)? {
            self.exec_vget_s()
        } else {
            self.exec_cget_s()
        }
    }

    // ---------------------------------------------------------------
    // FCall, entry and return
    // ---------------------------------------------------------------

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopFCall
    pub(crate) fn exec_fcall(&mut self, num_args: u32) -> Result<(), VmError> {
        let callee = self.pending_ar()?;
        if self.frames[callee].num_args() != num_args as usize {
            return Err(VmError::invalid_bytecode(
                self.op_start,
                format!(
                    "FCall {} does not match the {} arguments pushed",
                    num_args,
                    self.frames[callee].num_args()
                ),
            ));
        }
        let ar = &mut self.frames[callee];
        ar.saved_fp = self.fp;
        ar.soff = self.op_start;
        ar.return_pc = self.pc;
        self.enter_frame(callee, None)
    }

    /// Replace the arguments of a `__call` frame with `(name, [args])`
    fn shuffle_magic_args(&mut self, frame: usize, name: Rc<[u8]>) {
        let n = self.frames[frame].num_args();
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(self.stack.pop().unwrap_or_default().into_cell());
        }
        let mut arr = ArrayData::with_capacity(n);
        for arg in args.into_iter().rev() {
            arr.append(arg);
        }
        self.stack.push(TypedValue::string(name.to_vec()));
        self.stack.push(TypedValue::Array(Rc::new(arr)));
        let ar = &mut self.frames[frame];
        ar.set_num_args(2);
        ar.env_or_name = EnvOrName::Empty;
    }

    /// Make a pre-live record the running frame
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - prepareFuncEntry
    pub(crate) fn enter_frame(&mut self, frame: usize, inherited_env: Option<VarEnvId>) -> Result<(), VmError> {
        let func = self.frames[frame].func.clone();
        if self.stack.would_overflow(func.max_stack_cells + func.num_locals()) {
            return Err(VmError::StackOverflow);
        }
        if let Some(name) = self.frames[frame].inv_name().cloned() {
            self.shuffle_magic_args(frame, name);
        }

        let nargs = self.frames[frame].num_args();
        let nparams = func.num_params();
        let mut extra = Vec::new();
        if nargs > nparams {
            for _ in nparams..nargs {
                extra.push(self.stack.pop().unwrap_or_default());
            }
            extra.reverse();
        }
        for _ in nargs.min(nparams)..func.num_locals() {
            self.stack.push(TypedValue::Uninit);
        }

        let ar = &mut self.frames[frame];
        ar.iters = std::iter::repeat_with(Iter::default)
            .take(func.num_iterators)
            .collect();
        ar.state = FrameState::Live;
        self.fp = Some(frame);
        self.pc = 0;
        self.op_start = 0;
        trace!(func = %func.full_name(), nargs, frame, "frame entered");

        let env = match inherited_env {
            Some(env) => {
                self.attach_env(env, frame);
                Some(env)
            }
            None if !extra.is_empty() => Some(self.frame_env(frame)),
            None => None,
        };
        if let Some(env) = env.filter(|_| !extra.is_empty()).and_then(|id| self.env_mut(id)) {
            env.set_extra_args(extra);
        }

        if nargs < nparams && !func.is_builtin() {
            for (i, param) in func.params.iter().enumerate().skip(nargs) {
                if param.dv_entry.is_none() {
                    self.raise_warning(format!("Missing argument {} to {}()", i + 1, func.name))?;
                }
            }
        }
        let first_dv = func
            .params
            .get(nargs..)
            .into_iter()
            .flatten()
            .find_map(|p| p.dv_entry);
        if let Some(dv) = first_dv {
            self.pc = dv;
            self.op_start = dv;
        }
        self.check_surprise()
    }

    /// Check parameter `param` against its declared type
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopVerifyParamType
    pub(crate) fn exec_verify_param_type(&mut self, param: usize) -> Result<(), VmError> {
        let fp = self.fp()?;
        let func = self.frames[fp].func.clone();
        let Some(tc) = func.params.get(param).and_then(|p| p.type_constraint.as_ref()) else {
            return Err(VmError::invalid_bytecode(
                self.op_start,
                format!("parameter {} of {} has no type constraint", param + 1, func.full_name()),
            ));
        };
        let value = self.stack.at(self.frames[fp].local_index(param)).to_cell();
        if tc.nullable && value.is_null() {
            return Ok(());
        }
        let expected = if tc.is_array() {
            if matches!(value, TypedValue::Array(_)) {
                return Ok(());
            }
            "of the type array".to_string()
        } else {
            let name = self.resolve_constraint_class(fp, &tc.name)?;
            if let TypedValue::Object(obj) = &value {
                if obj.instance_of(&name) {
                    return Ok(());
                }
            }
            format!("an instance of {}", name)
        };
        let given = match &value {
            TypedValue::Uninit => "none".to_string(),
            TypedValue::Object(obj) => format!("instance of {}", obj.class.name),
            v => v.type_name().to_string(),
        };
        Err(VmError::fatal(format!(
            "Argument {} passed to {}() must be {}, {} given",
            param + 1,
            func.full_name(),
            expected,
            given
        )))
    }

    /// `self` and `parent` name classes relative to the frame's class
    fn resolve_constraint_class(&self, fp: usize, name: &str) -> Result<String, VmError> {
        let relative = |cls: Option<Arc<Class>>| {
            cls.map(|c| c.name.to_string())
                .ok_or_else(|| VmError::fatal(format!("Cannot access {}:: when no class scope is active", name)))
        };
        if name.eq_ignore_ascii_case("self") {
            relative(self.frame_context_class(fp))
        } else if name.eq_ignore_ascii_case("parent") {
            relative(self.frame_context_class(fp).and_then(|c| c.parent.clone()))
        } else {
            Ok(name.to_string())
        }
    }

    /// Tear down the running frame and hand `value` to its caller
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - ret
    pub(crate) fn ret(&mut self, value: TypedValue) -> Result<(), VmError> {
        let fp = self.fp()?;
        self.detach_env(fp);
        let base = self.frames[fp].base;
        self.stack.set_top(base);
        self.stack.at_mut(base).assign(value);
        self.frames.truncate(fp + 1);
        let Some(mut ar) = self.frames.pop() else {
            return Err(VmError::fatal("No active frame"));
        };
        ar.state = FrameState::PostLive;
        trace!(func = %ar.func.full_name(), frame = fp, "frame returned");
        self.fp = ar.saved_fp;
        if self.first_ar == Some(fp) {
            self.halted = true;
        } else {
            self.pc = ar.return_pc;
            self.op_start = ar.soff;
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopRetC
    #[inline]
    pub(crate) fn exec_ret_c(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.ret(value)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopRetV
    #[inline]
    pub(crate) fn exec_ret_v(&mut self) -> Result<(), VmError> {
        let var = self.pop_v()?;
        self.ret(TypedValue::Ref(var))
    }

    /// Run the native behind the current frame and return its result
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopNativeImpl
    pub(crate) fn exec_native_impl(&mut self) -> Result<(), VmError> {
        let fp = self.fp()?;
        let ar = &self.frames[fp];
        let func = ar.func.clone();
        let Some(handler) = func.native else {
            return Err(VmError::invalid_bytecode(self.op_start, "NativeImpl outside a native function"));
        };
        let passed = ar.num_args().min(func.num_params());
        let mut args: Vec<TypedValue> = (0..passed)
            .map(|id| self.stack.at(ar.local_index(id)).to_cell())
            .collect();
        if let Some(env) = ar.var_env().and_then(|id| self.env(id)) {
            args.extend(
                (0..env.num_extra_args()).filter_map(|i| env.get_extra_arg(i).map(TypedValue::to_cell)),
            );
        }
        let value = handler(self, &args)?;
        self.ret(value)
    }

    /// Drop every record above `keep`, detaching live frames' environments
    pub(crate) fn discard_frames(&mut self, keep: usize) {
        while self.frames.len() > keep {
            let idx = self.frames.len() - 1;
            if self.frames[idx].is_live() {
                self.detach_env(idx);
            }
            self.frames.pop();
        }
    }

    // ---------------------------------------------------------------
    // Reentry
    // ---------------------------------------------------------------

    /// Run `func` to completion in a nested dispatch loop
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - invokeFunc
    pub fn invoke_func(
        &mut self,
        func: &Arc<Func>,
        args: &[TypedValue],
        this_or_class: ThisOrClass,
        inherited_env: Option<VarEnvId>,
        inv_name: Option<Rc<[u8]>>,
    ) -> Result<TypedValue, VmError> {
        let needed = args.len() + 1 + func.max_stack_cells + func.num_locals();
        if self.nested.len() >= MAX_NESTED_DISPATCH || self.stack.would_overflow(needed) {
            return Err(VmError::StackOverflow);
        }
        let span = debug_span!("invoke_func", func = %func.full_name(), nargs = args.len());
        let _guard = span.enter();

        let saved = VmState {
            pc: self.pc,
            op_start: self.op_start,
            fp: self.fp,
            first_ar: self.first_ar,
            sp: self.stack.top(),
        };
        let keep_frames = self.frames.len();
        let keep_faults = self.faults.len();
        self.nested.push(saved);

        let result = self.invoke_nested(func, args, this_or_class, inherited_env, inv_name);

        self.nested.pop();
        self.discard_frames(keep_frames);
        self.faults.truncate(keep_faults);
        self.stack.set_top(saved.sp);
        self.pc = saved.pc;
        self.op_start = saved.op_start;
        self.fp = saved.fp;
        self.first_ar = saved.first_ar;
        self.halted = false;
        result
    }

    fn invoke_nested(
        &mut self,
        func: &Arc<Func>,
        args: &[TypedValue],
        this_or_class: ThisOrClass,
        inherited_env: Option<VarEnvId>,
        inv_name: Option<Rc<[u8]>>,
    ) -> Result<TypedValue, VmError> {
        let frame = self.push_ar(func.clone(), args.len() as u32, this_or_class, inv_name)?;
        for (i, arg) in args.iter().enumerate() {
            let value = if func.by_ref(i) { arg.clone() } else { arg.to_cell() };
            self.stack.push(value);
        }
        let ar = &mut self.frames[frame];
        ar.saved_fp = self.fp;
        ar.soff = self.op_start;
        ar.return_pc = self.pc;
        self.first_ar = Some(frame);
        self.halted = false;

        if let Err(err) = self.enter_frame(frame, inherited_env) {
            if self.fp != Some(frame) {
                return Err(err);
            }
            self.handle_fault(err)?;
        }
        self.dispatch_until_return()?;
        let value = self
            .stack
            .pop()
            .ok_or(VmError::StackUnderflow { operation: "invoke" })?;
        Ok(value.into_cell())
    }

    /// Run a unit's pseudo-main in the global scope
    pub fn invoke_unit(&mut self, unit: &Arc<Unit>) -> Result<TypedValue, VmError> {
        let env = self.global_env();
        let span = debug_span!("invoke_unit", file = unit.filepath());
        let _guard = span.enter();
        self.invoke_func(&unit.main, &[], ThisOrClass::Empty, Some(env), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::assembler::assemble;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::{CapturingErrorHandler, ErrorLevel};
    use std::cell::RefCell;

    fn run(src: &str) -> (Result<TypedValue, VmError>, Vec<(ErrorLevel, String)>) {
        let unit = assemble(src, "call.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut vm = VM::new(engine.clone()).with_error_handler(Box::new(CapturingErrorHandler::new(
            move |level, msg: &str| sink.borrow_mut().push((level, msg.to_string())),
        )));
        let main = engine.main_unit().cloned().unwrap();
        let result = vm.invoke_unit(&main);
        assert!(vm.frames.is_empty());
        let seen = seen.borrow().clone();
        (result, seen)
    }

    #[test]
    fn default_value_entry_and_missing_argument() {
        let (result, errors) = run(
            r#"
            .function f($a, $b = DV1) {
              CGetL $a; CGetL $b; Concat; RetC
            DV1:
              String "d"; SetL $b; PopC; Jmp L0
            L0:
              CGetL $a; CGetL $b; Concat; RetC
            }
            .main {
              FPushFuncD 1 "f"; String "x"; FPassC 0; FCall 1; UnboxR
              FPushFuncD 0 "f"; FCall 0; UnboxR
              Concat
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"xdd");
        assert!(errors.iter().any(|(l, m)| *l == ErrorLevel::Warning && m == "Missing argument 1 to f()"));
    }

    #[test]
    fn extra_arguments_reach_the_var_env() {
        let (result, _) = run(
            r#"
            .function f($a) {
              FPushFuncD 0 "func_num_args"; FCall 0; UnboxR
              RetC
            }
            .main {
              FPushFuncD 3 "f"
              Int 1; FPassC 0
              Int 2; FPassC 1
              Int 3; FPassC 2
              FCall 3; UnboxR
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap(), TypedValue::Int(3));
    }

    #[test]
    fn magic_call_receives_name_and_args() {
        let (result, _) = run(
            r#"
            .class C {
              .method __call($name, $args) {
                CGetL $name; CGetM <L:$args EI:1>; Concat; RetC
              }
            }
            .main {
              FPushCtorD 0 "C"; FCall 0; PopR
              SetL $o; PopC
              CGetL $o
              FPushObjMethodD 2 "hello"
              Int 1; FPassC 0
              String "!"; FPassC 1
              FCall 2; UnboxR
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"hello!");
    }

    #[test]
    fn fpass_ce_is_fatal_for_reference_parameters() {
        let (result, _) = run(
            r#"
            .function f(&$a) { Null; RetC }
            .main {
              FPushFuncD 1 "f"; Int 1; FPassCE 0; FCall 1; UnboxR
              RetC
            }
            "#,
        );
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Cannot pass parameter 1 by reference");
    }

    #[test]
    fn method_on_non_object_is_fatal() {
        let (result, _) = run(
            r#"
            .main {
              Int 1; FPushObjMethodD 0 "m"; FCall 0; UnboxR
              RetC
            }
            "#,
        );
        assert_eq!(
            result.unwrap_err().to_string(),
            "Call to a member function m() on a non-object"
        );
    }
}
