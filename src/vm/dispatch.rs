//! Interpreter dispatch loop
//!
//! One `step` decodes the instruction at `pc`, runs the instrumentation
//! hooks selected for the request, advances `pc` past the instruction and
//! calls its handler. Handlers that transfer control overwrite `pc`.
//!
//! ## Hook strategies
//!
//! The same handler set runs under every [`DispatchMode`]; only the work
//! done before each instruction differs:
//!
//! - `Direct`: nothing
//! - `Coverage`: record `file:line` whenever the executing line changes
//! - `Debugger`: call the installed [`DebuggerHook`]
//! - `External`: call the installed [`InstructionObserver`]
//!
//! ## Run modes
//!
//! `run` loops until the outermost frame returns, `run_n` stops after a
//! number of instructions and `run_basic_block` stops after the next
//! instruction that may transfer control. The last two leave the request
//! paused so it can be resumed with any of the three.
//!
//! Errors from handlers are routed into the fault protocol
//! ([`unwind`](crate::vm::unwind)); only faults nobody handles leave the loop.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - dispatchImpl, dispatch,
//! dispatchBB, dispatchN
//! Reference: HHVM `runtime/vm/bytecode.cpp` - phpDebuggerHook, recordCodeCoverage

use crate::core::value::{StringData, TypedValue, discard_pending_destructs, has_pending_destructs};
use crate::runtime::unit::{Func, Offset, Unit};
use crate::vm::assign_op::BinaryOp;
use crate::vm::engine::{VM, VmError};
use crate::vm::frame::ThisOrClass;
use crate::vm::opcode::{IncDecOp, Instr, IsTypeOp, Op, SetOpOp, decode};
use crate::vm::opcodes::declarations::ClassKind;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchMode {
    #[default]
    Direct,
    Coverage,
    Debugger,
    External,
}

/// What a hook sees before an instruction runs
#[derive(Debug, Clone, Copy)]
pub struct InstructionEvent<'a> {
    pub func: &'a Func,
    pub offset: Offset,
    pub op: Op,
    pub line: u32,
    /// Cells on the evaluation stack
    pub stack_depth: usize,
}

/// Called before every instruction in `Debugger` mode. An error aborts the
/// instruction and enters the fault protocol.
pub trait DebuggerHook {
    fn before_instruction(&mut self, event: &InstructionEvent<'_>) -> Result<(), VmError>;
}

/// Passive per-instruction callback for embedders (`External` mode)
pub trait InstructionObserver {
    fn observe(&mut self, event: &InstructionEvent<'_>);
}

impl<F> InstructionObserver for F
where
    F: FnMut(&InstructionEvent<'_>),
{
    fn observe(&mut self, event: &InstructionEvent<'_>) {
        self(event)
    }
}

/// Executed lines of a request, with hit counts
#[derive(Debug, Default)]
pub struct CodeCoverage {
    hits: IndexMap<(Arc<str>, u32), u64>,
    last: Option<(usize, u32)>,
}

impl CodeCoverage {
    fn record(&mut self, func: &Func, line: u32) {
        let key = (func as *const Func as usize, line);
        if self.last == Some(key) {
            return;
        }
        self.last = Some(key);
        *self.hits.entry((func.unit.filepath.clone(), line)).or_insert(0) += 1;
    }

    /// Times each `(file, line)` was entered, in first-seen order
    pub fn lines(&self) -> impl Iterator<Item = (&str, u32, u64)> {
        self.hits.iter().map(|((file, line), n)| (file.as_ref(), *line, *n))
    }

    pub fn hit_count(&self, file: &str, line: u32) -> u64 {
        self.hits
            .iter()
            .find(|((f, l), _)| f.as_ref() == file && *l == line)
            .map_or(0, |(_, n)| *n)
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// `file:line hits` lines sorted by file and line
    pub fn report(&self) -> String {
        let mut rows: Vec<_> = self.lines().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
        let mut out = String::new();
        for (file, line, n) in rows {
            out.push_str(&format!("{}:{} {}\n", file, line, n));
        }
        out
    }
}

/// Per-request hook state
pub struct Instrumentation {
    mode: DispatchMode,
    coverage: CodeCoverage,
    debugger: Option<Box<dyn DebuggerHook>>,
    observer: Option<Box<dyn InstructionObserver>>,
}

impl Instrumentation {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            coverage: CodeCoverage::default(),
            debugger: None,
            observer: None,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    fn before(&mut self, event: &InstructionEvent<'_>) -> Result<(), VmError> {
        match self.mode {
            DispatchMode::Direct => Ok(()),
            DispatchMode::Coverage => {
                self.coverage.record(event.func, event.line);
                Ok(())
            }
            DispatchMode::Debugger => match self.debugger.as_mut() {
                Some(hook) => hook.before_instruction(event),
                None => Ok(()),
            },
            DispatchMode::External => {
                if let Some(observer) = self.observer.as_mut() {
                    observer.observe(event);
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Budget {
    Unlimited,
    Instructions(u64),
    BasicBlock,
}

/// Outcome of a bounded run
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Budget used up; the request can be resumed
    Paused,
    Finished(TypedValue),
}

fn litstr(func: &Func, instr: &Instr, i: usize) -> Result<Arc<StringData>, VmError> {
    func.unit.litstr(instr.iva(i)).cloned()
}

fn sub_op<T>(op: Option<T>, offset: Offset) -> Result<T, VmError> {
    op.ok_or_else(|| VmError::invalid_bytecode(offset, "bad sub-op immediate"))
}

impl VM {
    pub fn set_dispatch_mode(&mut self, mode: DispatchMode) {
        self.instrumentation.mode = mode;
        self.options.dispatch = mode;
    }

    pub fn set_debugger_hook(&mut self, hook: Box<dyn DebuggerHook>) {
        self.instrumentation.debugger = Some(hook);
    }

    pub fn set_instruction_observer(&mut self, observer: Box<dyn InstructionObserver>) {
        self.instrumentation.observer = Some(observer);
    }

    pub fn coverage(&self) -> &CodeCoverage {
        &self.instrumentation.coverage
    }

    /// Execute one instruction of the running frame
    pub(crate) fn step(&mut self) -> Result<Op, VmError> {
        let fp = self.fp()?;
        let func = self.frames[fp].func.clone();
        self.op_start = self.pc;
        let instr = decode(&func.code, self.pc)?;
        if self.instrumentation.mode != DispatchMode::Direct {
            let event = InstructionEvent {
                func: &func,
                offset: self.op_start,
                op: instr.op,
                line: func.line_for(self.op_start),
                stack_depth: self.stack.count(),
            };
            self.instrumentation.before(&event)?;
        }
        trace!(
            func = %func.full_name(),
            offset = self.op_start,
            op = instr.op.name(),
            depth = self.stack.count(),
            "step"
        );
        self.pc += instr.len;
        self.execute(&func, &instr)?;
        // destructors of objects the instruction released
        if !self.halted && has_pending_destructs() {
            self.run_pending_destructors()?;
        }
        Ok(instr.op)
    }

    /// Returns true once `first_ar` has returned
    fn run_budget(&mut self, budget: Budget) -> Result<bool, VmError> {
        let mut executed: u64 = 0;
        loop {
            if self.halted {
                return Ok(true);
            }
            if let Budget::Instructions(n) = budget {
                if executed >= n {
                    return Ok(false);
                }
            }
            executed += 1;
            match self.step() {
                Ok(op) => {
                    if budget == Budget::BasicBlock && op.is_control_flow() {
                        return Ok(self.halted);
                    }
                }
                Err(err) => {
                    if self.halted {
                        return Err(err);
                    }
                    self.handle_fault(err)?;
                    if budget == Budget::BasicBlock {
                        return Ok(self.halted);
                    }
                }
            }
        }
    }

    /// Nested dispatch used by reentrant calls
    pub(crate) fn dispatch_until_return(&mut self) -> Result<(), VmError> {
        self.run_budget(Budget::Unlimited).map(|_| ())
    }

    /// Make `unit`'s pseudo-main the running frame without executing it
    pub fn start(&mut self, unit: &Arc<Unit>) -> Result<(), VmError> {
        if self.fp.is_some() || !self.frames.is_empty() {
            return Err(VmError::fatal("A request is already running"));
        }
        discard_pending_destructs();
        let env = self.global_env();
        let frame = self.push_ar(unit.main.clone(), 0, ThisOrClass::Empty, None)?;
        self.first_ar = Some(frame);
        self.halted = false;
        debug!(file = unit.filepath(), "request started");
        if let Err(err) = self.enter_frame(frame, Some(env)) {
            let handled = if self.fp == Some(frame) {
                self.handle_fault(err)
            } else {
                Err(err)
            };
            if let Err(err) = handled {
                self.reset_request();
                return Err(err);
            }
        }
        Ok(())
    }

    fn resume(&mut self, budget: Budget) -> Result<RunStatus, VmError> {
        if self.first_ar.is_none() {
            return Err(VmError::fatal("No request to run"));
        }
        match self.run_budget(budget) {
            Ok(false) => Ok(RunStatus::Paused),
            Ok(true) => {
                let value = self.stack.pop().unwrap_or_default().into_cell();
                self.reset_request();
                Ok(RunStatus::Finished(value))
            }
            Err(err) => {
                self.reset_request();
                Err(err)
            }
        }
    }

    fn reset_request(&mut self) {
        self.discard_frames(0);
        self.faults.clear();
        let base = self.stack.base();
        self.stack.set_top(base);
        self.fp = None;
        self.first_ar = None;
        self.halted = false;
        self.pc = 0;
        self.op_start = 0;
    }

    /// Run a started request to completion
    pub fn run(&mut self) -> Result<TypedValue, VmError> {
        match self.resume(Budget::Unlimited)? {
            RunStatus::Finished(value) => Ok(value),
            RunStatus::Paused => Err(VmError::fatal("request paused unexpectedly")),
        }
    }

    /// Execute at most `n` instructions
    pub fn run_n(&mut self, n: u64) -> Result<RunStatus, VmError> {
        self.resume(Budget::Instructions(n))
    }

    /// Execute through the next instruction that may transfer control
    pub fn run_basic_block(&mut self) -> Result<RunStatus, VmError> {
        self.resume(Budget::BasicBlock)
    }

    /// Relative branch; backward branches are poll points
    #[inline]
    pub(crate) fn jump(&mut self, offset: i32) -> Result<(), VmError> {
        self.pc = (self.op_start as i64 + offset as i64) as Offset;
        if offset <= 0 {
            self.check_surprise()?;
        }
        Ok(())
    }

    fn execute(&mut self, func: &Arc<Func>, instr: &Instr) -> Result<(), VmError> {
        let at = self.op_start;
        match instr.op {
            Op::Nop => Ok(()),
            Op::PopC => self.exec_pop_c(),
            Op::PopV => self.exec_pop_v(),
            Op::PopR => self.exec_pop_r(),
            Op::Dup => self.stack.dup(),
            Op::Box => self.stack.box_top(),
            Op::Unbox => self.stack.unbox_top(),
            Op::BoxR => self.stack.box_top(),
            Op::UnboxR => self.stack.unbox_top(),

            Op::Null => {
                self.push(TypedValue::Null);
                Ok(())
            }
            Op::True => {
                self.push(TypedValue::Bool(true));
                Ok(())
            }
            Op::False => {
                self.push(TypedValue::Bool(false));
                Ok(())
            }
            Op::Int => {
                self.push(TypedValue::Int(instr.i64(0)));
                Ok(())
            }
            Op::Double => {
                self.push(TypedValue::Double(instr.double(0)));
                Ok(())
            }
            Op::String => {
                let s = litstr(func, instr, 0)?;
                self.push(TypedValue::StaticString(s));
                Ok(())
            }
            Op::Array => self.exec_array(func, instr.iva(0)),
            Op::NewArray => self.exec_new_array(),
            Op::AddElemC => self.exec_add_elem_c(),
            Op::AddElemV => self.exec_add_elem_v(),
            Op::AddNewElemC => self.exec_add_new_elem_c(),
            Op::AddNewElemV => self.exec_add_new_elem_v(),
            Op::Cns => self.exec_cns(&litstr(func, instr, 0)?),

            Op::Concat => self.exec_binary(BinaryOp::Concat),
            Op::Add => self.exec_binary(BinaryOp::Add),
            Op::Sub => self.exec_binary(BinaryOp::Sub),
            Op::Mul => self.exec_binary(BinaryOp::Mul),
            Op::Div => self.exec_binary(BinaryOp::Div),
            Op::Mod => self.exec_binary(BinaryOp::Mod),
            Op::BitAnd => self.exec_binary(BinaryOp::BitAnd),
            Op::BitOr => self.exec_binary(BinaryOp::BitOr),
            Op::BitXor => self.exec_binary(BinaryOp::BitXor),
            Op::Shl => self.exec_binary(BinaryOp::Shl),
            Op::Shr => self.exec_binary(BinaryOp::Shr),
            Op::BitNot => self.exec_bit_not(),
            Op::Xor => self.exec_xor(),
            Op::Not => self.exec_not(),
            Op::Same => self.exec_same(false),
            Op::NSame => self.exec_same(true),
            Op::Eq => self.exec_eq(false),
            Op::Neq => self.exec_eq(true),
            Op::Lt => self.exec_lt(),
            Op::Lte => self.exec_lte(),
            Op::Gt => self.exec_gt(),
            Op::Gte => self.exec_gte(),
            Op::CastBool => self.exec_cast_bool(),
            Op::CastInt => self.exec_cast_int(),
            Op::CastDouble => self.exec_cast_double(),
            Op::CastString => self.exec_cast_string(),
            Op::CastArray => self.exec_cast_array(),
            Op::CastObject => self.exec_cast_object(),
            Op::InstanceOf => self.exec_instance_of(),
            Op::InstanceOfD => self.exec_instance_of_d(&litstr(func, instr, 0)?),
            Op::Print => self.exec_print(),
            Op::Clone => self.exec_clone(),
            Op::Exit => self.exec_exit(),
            Op::Fatal => self.exec_fatal(),

            Op::Jmp => self.jump(instr.ba(0)),
            Op::JmpZ => self.exec_jmp_z(instr.ba(0)),
            Op::JmpNZ => self.exec_jmp_nz(instr.ba(0)),
            Op::Switch => {
                let table = instr
                    .switch_table()
                    .ok_or_else(|| VmError::invalid_bytecode(at, "Switch without a table"))?;
                self.exec_switch(table)
            }
            Op::RetC => self.exec_ret_c(),
            Op::RetV => self.exec_ret_v(),
            Op::Unwind => self.exec_unwind(),
            Op::Throw => self.exec_throw(),
            Op::Catch => self.exec_catch(),

            Op::CGetL => self.exec_cget_l(instr.local(0)),
            Op::CGetL2 => self.exec_cget_l2(instr.local(0)),
            Op::CGetL3 => self.exec_cget_l3(instr.local(0)),
            Op::CGetN => self.exec_cget_n(),
            Op::CGetG => self.exec_cget_g(),
            Op::CGetS => self.exec_cget_s(),
            Op::VGetL => self.exec_vget_l(instr.local(0)),
            Op::VGetN => self.exec_vget_n(),
            Op::VGetG => self.exec_vget_g(),
            Op::VGetS => self.exec_vget_s(),
            Op::AGetC => self.exec_aget_c(),
            Op::AGetL => self.exec_aget_l(instr.local(0)),
            Op::IssetC => self.exec_isset_c(),
            Op::IssetL => self.exec_isset_l(instr.local(0)),
            Op::IssetN => self.exec_isset_n(),
            Op::IssetG => self.exec_isset_g(),
            Op::IssetS => self.exec_isset_s(),
            Op::EmptyL => self.exec_empty_l(instr.local(0)),
            Op::EmptyN => self.exec_empty_n(),
            Op::EmptyG => self.exec_empty_g(),
            Op::EmptyS => self.exec_empty_s(),
            Op::IsTypeL => {
                let op = sub_op(IsTypeOp::from_u8(instr.oa(1)), at)?;
                self.exec_is_type_l(instr.local(0), op)
            }
            Op::IsTypeC => self.exec_is_type_c(sub_op(IsTypeOp::from_u8(instr.oa(0)), at)?),
            Op::SetL => self.exec_set_l(instr.local(0)),
            Op::SetN => self.exec_set_n(),
            Op::SetG => self.exec_set_g(),
            Op::SetS => self.exec_set_s(),
            Op::SetOpL => {
                let op = sub_op(SetOpOp::from_u8(instr.oa(1)), at)?;
                self.exec_set_op_l(instr.local(0), op)
            }
            Op::SetOpN => self.exec_set_op_n(sub_op(SetOpOp::from_u8(instr.oa(0)), at)?),
            Op::SetOpG => self.exec_set_op_g(sub_op(SetOpOp::from_u8(instr.oa(0)), at)?),
            Op::SetOpS => self.exec_set_op_s(sub_op(SetOpOp::from_u8(instr.oa(0)), at)?),
            Op::IncDecL => {
                let op = sub_op(IncDecOp::from_u8(instr.oa(1)), at)?;
                self.exec_inc_dec_l(instr.local(0), op)
            }
            Op::IncDecN => self.exec_inc_dec_n(sub_op(IncDecOp::from_u8(instr.oa(0)), at)?),
            Op::IncDecG => self.exec_inc_dec_g(sub_op(IncDecOp::from_u8(instr.oa(0)), at)?),
            Op::IncDecS => self.exec_inc_dec_s(sub_op(IncDecOp::from_u8(instr.oa(0)), at)?),
            Op::BindL => self.exec_bind_l(instr.local(0)),
            Op::BindN => self.exec_bind_n(),
            Op::BindG => self.exec_bind_g(),
            Op::BindS => self.exec_bind_s(),
            Op::UnsetL => self.exec_unset_l(instr.local(0)),
            Op::UnsetN => self.exec_unset_n(),
            Op::UnsetG => self.exec_unset_g(),

            Op::CGetM
            | Op::VGetM
            | Op::IssetM
            | Op::EmptyM
            | Op::SetM
            | Op::SetOpM
            | Op::IncDecM
            | Op::BindM
            | Op::UnsetM
            | Op::FPassM => self.execute_member(instr),

            Op::FPushFunc => self.exec_fpush_func(instr.iva(0)),
            Op::FPushFuncD => self.exec_fpush_func_d(instr.iva(0), &litstr(func, instr, 1)?),
            Op::FPushObjMethod => self.exec_fpush_obj_method(instr.iva(0)),
            Op::FPushObjMethodD => self.exec_fpush_obj_method_d(instr.iva(0), &litstr(func, instr, 1)?),
            Op::FPushClsMethod => self.exec_fpush_cls_method(instr.iva(0)),
            Op::FPushClsMethodD => self.exec_fpush_cls_method_d(
                instr.iva(0),
                &litstr(func, instr, 1)?,
                &litstr(func, instr, 2)?,
            ),
            Op::FPushClsMethodF => self.exec_fpush_cls_method_f(instr.iva(0)),
            Op::FPushCtor => self.exec_fpush_ctor(instr.iva(0)),
            Op::FPushCtorD => self.exec_fpush_ctor_d(instr.iva(0), &litstr(func, instr, 1)?),
            Op::FPassC => self.exec_fpass_c(instr.local(0)),
            Op::FPassCW => self.exec_fpass_cw(instr.local(0)),
            Op::FPassCE => self.exec_fpass_ce(instr.local(0)),
            Op::FPassV => self.exec_fpass_v(instr.local(0)),
            Op::FPassR => self.exec_fpass_r(instr.local(0)),
            Op::FPassL => self.exec_fpass_l(instr.local(0), instr.local(1)),
            Op::FPassN => self.exec_fpass_n(instr.local(0)),
            Op::FPassG => self.exec_fpass_g(instr.local(0)),
            Op::FPassS => self.exec_fpass_s(instr.local(0)),
            Op::FCall => self.exec_fcall(instr.iva(0)),

            Op::IterInit => self.exec_iter_init(instr.local(0), instr.ba(1)),
            Op::IterInitM => self.exec_iter_init_m(instr.local(0), instr.ba(1)),
            Op::IterValueC => self.exec_iter_value_c(instr.local(0)),
            Op::IterValueV => self.exec_iter_value_v(instr.local(0)),
            Op::IterKey => self.exec_iter_key(instr.local(0)),
            Op::IterNext => self.exec_iter_next(instr.local(0), instr.ba(1)),
            Op::IterFree => self.exec_iter_free(instr.local(0)),

            Op::This => self.exec_this(),
            Op::InitThisLoc => self.exec_init_this_loc(instr.local(0)),
            Op::StaticLoc => self.exec_static_loc(instr.local(0), &litstr(func, instr, 1)?),
            Op::StaticLocInit => self.exec_static_loc_init(instr.local(0), &litstr(func, instr, 1)?),
            Op::LateBoundCls => self.exec_late_bound_cls(),
            Op::Self_ => self.exec_self(),
            Op::Parent => self.exec_parent(),
            Op::NativeImpl => self.exec_native_impl(),

            Op::DefFunc => self.exec_def_func(instr.iva(0) as usize),
            Op::DefCls => self.exec_def_cls(instr.iva(0) as usize),
            Op::DefCns => self.exec_def_cns(&litstr(func, instr, 0)?),
            Op::ClsCns => self.exec_cls_cns(&litstr(func, instr, 0)?),
            Op::ClsCnsD => self.exec_cls_cns_d(&litstr(func, instr, 0)?, &litstr(func, instr, 1)?),
            Op::ClassExists => self.exec_class_exists(ClassKind::Class),
            Op::InterfaceExists => self.exec_class_exists(ClassKind::Interface),
            Op::TraitExists => self.exec_class_exists(ClassKind::Trait),
            Op::VerifyParamType => self.exec_verify_param_type(instr.iva(0) as usize),

            Op::CreateCont => self.exec_create_cont(instr.iva(0) != 0, &litstr(func, instr, 1)?),
            Op::UnpackCont => self.exec_unpack_cont(),
            Op::PackCont => self.exec_pack_cont(instr.iva(0) as i64),
            Op::ContReceive => self.exec_cont_receive(),
            Op::ContRaised => self.exec_cont_raised(),
            Op::ContDone => self.exec_cont_done(),
            Op::ContNext => self.exec_cont_next(),
            Op::ContSend => self.exec_cont_send(),
            Op::ContRaise => self.exec_cont_raise(),
            Op::ContEnter => self.exec_cont_enter(),
            Op::ContValid => self.exec_cont_valid(),
            Op::ContCurrent => self.exec_cont_current(),
            Op::ContKey => self.exec_cont_key(),
            Op::ContStarted => self.exec_cont_started(),
            Op::ContStopped => self.exec_cont_stopped(),
            Op::ContHandle => self.exec_cont_handle(),
        }
    }

    fn execute_member(&mut self, instr: &Instr) -> Result<(), VmError> {
        let at = self.op_start;
        let mv = instr
            .member_vector()
            .ok_or_else(|| VmError::invalid_bytecode(at, "missing member vector"))?;
        match instr.op {
            Op::CGetM => self.exec_cget_m(mv),
            Op::VGetM => self.exec_vget_m(mv),
            Op::IssetM => self.exec_isset_m(mv),
            Op::EmptyM => self.exec_empty_m(mv),
            Op::SetM => self.exec_set_m(mv),
            Op::SetOpM => self.exec_set_op_m(sub_op(SetOpOp::from_u8(instr.oa(0)), at)?, mv),
            Op::IncDecM => self.exec_inc_dec_m(sub_op(IncDecOp::from_u8(instr.oa(0)), at)?, mv),
            Op::BindM => self.exec_bind_m(mv),
            Op::UnsetM => self.exec_unset_m(mv),
            Op::FPassM => self.exec_fpass_m(instr.local(0), mv),
            _ => Err(VmError::invalid_bytecode(at, "not a member instruction")),
        }
    }
}
