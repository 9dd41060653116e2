//! VM engine core
//!
//! `VM` owns everything a request executes with: the evaluation stack, the
//! activation-record chain, variable environments, the fault stack and the
//! dispatch state saved around reentrant calls. Immutable metadata (units,
//! functions, classes) comes from the shared `EngineContext`; mutable
//! request state (statics, constants, error settings) from `RequestContext`.
//!
//! ## Registers
//!
//! - `fp`: index of the running frame in `frames`, `None` when idle
//! - `pc`: offset of the next instruction in the running function
//! - `op_start`: offset of the instruction being executed
//! - `first_ar`: frame whose return ends the innermost dispatch
//!
//! ## Delegated Responsibilities
//!
//! - **Dispatch loop and hooks**: [`dispatch`](crate::vm::dispatch)
//! - **Calls, entry and return**: [`call`](crate::vm::call)
//! - **Fault propagation**: [`unwind`](crate::vm::unwind)
//! - **Variable environments**: [`var_env`](crate::vm::var_env)
//! - **Member access**: [`member`](crate::vm::member), [`member_ops`](crate::vm::member_ops)
//! - **Method visibility**: [`visibility`](crate::vm::visibility)
//! - **Per-family handlers**: [`opcodes`](crate::vm::opcodes)
//!
//! ## Error Handling
//!
//! Handlers return `Result<(), VmError>`. Notices and warnings are not
//! errors: they go through [`VM::report_error`], filtered by the request's
//! `error_reporting` mask, and execution continues with a substitute value.
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.h` (VMExecutionContext)
//! - Zend: `$PHP_SRC_PATH/Zend/zend_errors.h` - error level bits

use crate::core::value::{ObjectData, TypedValue};
use crate::runtime::class::Class;
use crate::runtime::context::{EngineContext, RequestContext};
use crate::runtime::unit::{Func, Offset};
use crate::vm::dispatch::{DispatchMode, Instrumentation};
use crate::vm::frame::ActRec;
use crate::vm::stack::{DEFAULT_STACK_ELMS, Stack};
use crate::vm::surprise::{SurpriseFlags, Watchdog};
use crate::vm::unwind::{BacktraceFrame, Fault};
use crate::vm::var_env::{VarEnv, VarEnvId};
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub enum VmError {
    /// Stack underflow during operation
    StackUnderflow { operation: &'static str },
    /// Callee would not fit on the evaluation stack
    StackOverflow,
    UndefinedFunction { name: String },
    UndefinedMethod {
        class: String,
        method: String,
        context: Option<String>,
    },
    /// Recoverable fatal error
    Fatal(String),
    /// User exception object in flight
    Exception(Rc<ObjectData>),
    Exit(i64),
    Timeout,
    InvalidBytecode { offset: Offset, reason: String },
    /// Unit loading or linking failure
    Load(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow { operation } => {
                write!(f, "Stack underflow during {}", operation)
            }
            VmError::StackOverflow => write!(f, "Stack overflow"),
            VmError::UndefinedFunction { name } => {
                write!(f, "Call to undefined function {}()", name)
            }
            VmError::UndefinedMethod {
                class,
                method,
                context,
            } => match context {
                Some(ctx) => write!(
                    f,
                    "Call to undefined method {}::{}() from context {}",
                    class, method, ctx
                ),
                None => write!(
                    f,
                    "Call to undefined method {}::{}() from anonymous context",
                    class, method
                ),
            },
            VmError::Fatal(msg) => write!(f, "{}", msg),
            VmError::Exception(obj) => {
                let message = obj
                    .get_prop(b"message")
                    .map(|m| String::from_utf8_lossy(&m.to_string_bytes()).into_owned())
                    .unwrap_or_default();
                write!(
                    f,
                    "Uncaught exception '{}' with message '{}'",
                    obj.class_name(),
                    message
                )
            }
            VmError::Exit(code) => write!(f, "exit({})", code),
            VmError::Timeout => write!(f, "Maximum execution time exceeded"),
            VmError::InvalidBytecode { offset, reason } => {
                write!(f, "Invalid bytecode at offset {}: {}", offset, reason)
            }
            VmError::Load(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for VmError {}

/// PHP error levels matching Zend constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    Notice,      // E_NOTICE
    Warning,     // E_WARNING
    Error,       // E_ERROR
    UserNotice,  // E_USER_NOTICE
    UserWarning, // E_USER_WARNING
    UserError,   // E_USER_ERROR
    Strict,      // E_STRICT
    Deprecated,  // E_DEPRECATED
}

impl ErrorLevel {
    /// Convert error level to the corresponding bitmask value
    pub fn to_bitmask(self) -> u32 {
        match self {
            ErrorLevel::Error => 1,         // E_ERROR
            ErrorLevel::Warning => 2,       // E_WARNING
            ErrorLevel::Notice => 8,        // E_NOTICE
            ErrorLevel::UserError => 256,   // E_USER_ERROR
            ErrorLevel::UserWarning => 512, // E_USER_WARNING
            ErrorLevel::UserNotice => 1024, // E_USER_NOTICE
            ErrorLevel::Strict => 2048,     // E_STRICT
            ErrorLevel::Deprecated => 8192, // E_DEPRECATED
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorLevel::Notice => "Notice",
            ErrorLevel::Warning => "Warning",
            ErrorLevel::Error => "Fatal error",
            ErrorLevel::UserNotice => "User notice",
            ErrorLevel::UserWarning => "User warning",
            ErrorLevel::UserError => "User error",
            ErrorLevel::Strict => "Strict Standards",
            ErrorLevel::Deprecated => "Deprecated",
        }
    }
}

pub trait ErrorHandler {
    /// Report an error/warning/notice at runtime
    fn report(&mut self, level: ErrorLevel, message: &str);
}

/// Default error handler that writes to stderr
pub struct StderrErrorHandler {
    stderr: io::Stderr,
}

impl Default for StderrErrorHandler {
    fn default() -> Self {
        Self {
            stderr: io::stderr(),
        }
    }
}

impl ErrorHandler for StderrErrorHandler {
    fn report(&mut self, level: ErrorLevel, message: &str) {
        let _ = writeln!(self.stderr, "{}: {}", level.label(), message);
        let _ = self.stderr.flush();
    }
}

/// Capturing error handler for testing and output capture
pub struct CapturingErrorHandler<F: FnMut(ErrorLevel, &str)> {
    callback: F,
}

impl<F: FnMut(ErrorLevel, &str)> CapturingErrorHandler<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F: FnMut(ErrorLevel, &str)> ErrorHandler for CapturingErrorHandler<F> {
    fn report(&mut self, level: ErrorLevel, message: &str) {
        (self.callback)(level, message);
    }
}

pub trait OutputWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), VmError>;
    fn flush(&mut self) -> Result<(), VmError> {
        Ok(())
    }
}

pub struct StdoutWriter {
    stdout: io::Stdout,
}

impl Default for StdoutWriter {
    fn default() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }
}

impl OutputWriter for StdoutWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.stdout
            .write_all(bytes)
            .map_err(|e| VmError::Fatal(format!("Failed to write output: {}", e)))
    }

    fn flush(&mut self) -> Result<(), VmError> {
        self.stdout
            .flush()
            .map_err(|e| VmError::Fatal(format!("Failed to flush output: {}", e)))
    }
}

/// Capturing output writer for testing
pub struct CapturingOutputWriter<F: FnMut(&[u8])> {
    callback: F,
}

impl<F: FnMut(&[u8])> CapturingOutputWriter<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F: FnMut(&[u8])> OutputWriter for CapturingOutputWriter<F> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        (self.callback)(bytes);
        Ok(())
    }
}

/// Per-VM knobs, usually derived from `ExecutionConfig`
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub stack_elms: usize,
    /// Extra notices PHP only emits in strict mode
    pub strict_warnings: bool,
    pub dispatch: DispatchMode,
    pub timeout: Option<Duration>,
    /// Capture the frame chain whenever a fault is raised
    pub backtrace: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            stack_elms: DEFAULT_STACK_ELMS,
            strict_warnings: false,
            dispatch: DispatchMode::Direct,
            timeout: None,
            backtrace: false,
        }
    }
}

/// Registers saved around a nested dispatch
#[derive(Debug, Clone, Copy)]
pub struct VmState {
    pub pc: Offset,
    pub op_start: Offset,
    pub fp: Option<usize>,
    pub first_ar: Option<usize>,
    pub sp: usize,
}

pub struct VM {
    pub context: RequestContext,
    pub(crate) stack: Stack,
    pub(crate) frames: Vec<ActRec>,
    pub(crate) fp: Option<usize>,
    pub(crate) pc: Offset,
    pub(crate) op_start: Offset,
    pub(crate) first_ar: Option<usize>,
    pub(crate) nested: Vec<VmState>,
    pub(crate) var_envs: Vec<Option<VarEnv>>,
    pub(crate) free_envs: Vec<usize>,
    pub(crate) global_env: Option<VarEnvId>,
    pub(crate) faults: Vec<Fault>,
    pub(crate) surprise: SurpriseFlags,
    pub(crate) options: RuntimeOptions,
    pub(crate) instrumentation: Instrumentation,
    pub(crate) output_writer: Box<dyn OutputWriter>,
    pub(crate) error_handler: Box<dyn ErrorHandler>,
    /// Set when `first_ar` returns; ends the innermost dispatch
    pub(crate) halted: bool,
    /// Frames live when the most recent fault was raised
    pub(crate) fault_backtrace: Vec<BacktraceFrame>,
    watchdog: Option<Watchdog>,
}

impl VM {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        Self::build(engine, Stack::default(), RuntimeOptions::default())
    }

    pub fn with_options(engine: Arc<EngineContext>, options: RuntimeOptions) -> Result<Self, VmError> {
        let stack = Stack::new(options.stack_elms)?;
        Ok(Self::build(engine, stack, options))
    }

    fn build(engine: Arc<EngineContext>, stack: Stack, options: RuntimeOptions) -> Self {
        let surprise = SurpriseFlags::new();
        let watchdog = options
            .timeout
            .map(|limit| Watchdog::spawn(surprise.handle(), limit));
        let instrumentation = Instrumentation::new(options.dispatch);
        debug!(
            stack_elms = stack.capacity(),
            dispatch = ?options.dispatch,
            "vm created"
        );
        Self {
            context: RequestContext::new(engine),
            stack,
            frames: Vec::new(),
            fp: None,
            pc: 0,
            op_start: 0,
            first_ar: None,
            nested: Vec::new(),
            var_envs: Vec::new(),
            free_envs: Vec::new(),
            global_env: None,
            faults: Vec::new(),
            surprise,
            options,
            instrumentation,
            output_writer: Box::new(StdoutWriter::default()),
            error_handler: Box::new(StderrErrorHandler::default()),
            halted: false,
            fault_backtrace: Vec::new(),
            watchdog,
        }
    }

    pub fn with_output_writer(mut self, writer: Box<dyn OutputWriter>) -> Self {
        self.output_writer = writer;
        self
    }

    pub fn set_output_writer(&mut self, writer: Box<dyn OutputWriter>) {
        self.output_writer = writer;
    }

    pub fn with_error_handler(mut self, handler: Box<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = handler;
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.context.engine
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Number of activation records, pre-live ones included
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Backtrace of the last fault raised, when `RuntimeOptions::backtrace` is set
    pub fn fault_backtrace(&self) -> &[BacktraceFrame] {
        &self.fault_backtrace
    }

    /// Stop the watchdog, if any, without waiting for it to fire
    pub fn cancel_timeout(&mut self) {
        self.watchdog = None;
    }

    /// Report through the user handler (if any) and the installed
    /// `ErrorHandler`, honoring `error_reporting`
    pub(crate) fn report_error(&mut self, level: ErrorLevel, message: &str) -> Result<(), VmError> {
        let mask = level.to_bitmask();
        if self.context.error_reporting & mask == 0 {
            return Ok(());
        }
        if let Some(handler) = self.context.user_error_handler.take() {
            let args = [TypedValue::Int(mask as i64), TypedValue::string(message)];
            let result = self.call_user_func(&handler, &args);
            self.context.user_error_handler = Some(handler);
            if !matches!(result?, TypedValue::Bool(false)) {
                return Ok(());
            }
        }
        debug!(level = ?level, message, "error reported");
        self.error_handler.report(level, message);
        Ok(())
    }

    pub(crate) fn raise_notice(&mut self, message: impl AsRef<str>) -> Result<(), VmError> {
        self.report_error(ErrorLevel::Notice, message.as_ref())
    }

    pub(crate) fn raise_warning(&mut self, message: impl AsRef<str>) -> Result<(), VmError> {
        self.report_error(ErrorLevel::Warning, message.as_ref())
    }

    /// Notice emitted only when strict warnings are enabled
    pub(crate) fn raise_strict_notice(&mut self, message: impl AsRef<str>) -> Result<(), VmError> {
        if self.options.strict_warnings {
            self.report_error(ErrorLevel::Notice, message.as_ref())
        } else {
            Ok(())
        }
    }

    /// E_STRICT report, only when strict warnings are enabled
    pub(crate) fn raise_strict_warning(&mut self, message: impl AsRef<str>) -> Result<(), VmError> {
        if self.options.strict_warnings {
            self.report_error(ErrorLevel::Strict, message.as_ref())
        } else {
            Ok(())
        }
    }

    pub(crate) fn echo(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.output_writer.write(bytes)
    }

    pub fn flush_output(&mut self) -> Result<(), VmError> {
        self.output_writer.flush()
    }

    /// Index of the running frame
    #[inline]
    pub(crate) fn fp(&self) -> Result<usize, VmError> {
        self.fp.ok_or_else(|| VmError::fatal("No active frame"))
    }

    #[inline]
    pub(crate) fn frame(&self) -> Result<&ActRec, VmError> {
        let fp = self.fp()?;
        Ok(&self.frames[fp])
    }

    pub fn current_func(&self) -> Option<Arc<Func>> {
        self.fp.map(|fp| self.frames[fp].func.clone())
    }

    /// Class whose private members the frame can see
    pub(crate) fn frame_context_class(&self, frame: usize) -> Option<Arc<Class>> {
        let cls = self.frames[frame].func.cls.as_ref()?;
        self.context.lookup_class(cls).cloned()
    }

    /// Context of the nearest bytecode frame; natives run in their caller's
    pub(crate) fn context_class(&self) -> Option<Arc<Class>> {
        self.user_frame().and_then(|fp| self.frame_context_class(fp))
    }

    pub(crate) fn this(&self) -> Option<Rc<ObjectData>> {
        self.user_frame().and_then(|fp| self.frames[fp].this().cloned())
    }

    pub(crate) fn lookup_class(&self, name: &str) -> Result<Arc<Class>, VmError> {
        self.context
            .lookup_class(name)
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("Class '{}' not found", name)))
    }

    /// Class named by a string cell, or the class of an object
    pub(crate) fn class_of_value(&self, value: &TypedValue) -> Result<Arc<Class>, VmError> {
        match value {
            TypedValue::Class(cls) => Ok(cls.clone()),
            TypedValue::Object(obj) => Ok(obj.class.clone()),
            TypedValue::Ref(r) => self.class_of_value(&r.get()),
            v if v.is_string() => {
                let name = String::from_utf8_lossy(v.str_bytes().unwrap_or_default()).into_owned();
                self.lookup_class(&name)
            }
            _ => Err(VmError::fatal("Cls: Expected string or object")),
        }
    }

    /// Instantiate a class with its declared defaults
    pub(crate) fn instantiate(&self, cls: &Arc<Class>) -> Result<Rc<ObjectData>, VmError> {
        if cls.attrs.is_interface {
            return Err(VmError::fatal(format!("Cannot instantiate interface {}", cls.name)));
        }
        if cls.attrs.is_trait {
            return Err(VmError::fatal(format!("Cannot instantiate trait {}", cls.name)));
        }
        if cls.attrs.is_abstract {
            return Err(VmError::fatal(format!(
                "Cannot instantiate abstract class {}",
                cls.name
            )));
        }
        Ok(ObjectData::new(cls.clone()))
    }

    pub(crate) fn new_std_class(&self) -> Result<Rc<ObjectData>, VmError> {
        let cls = self.lookup_class("stdClass")?;
        Ok(ObjectData::new(cls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::EngineBuilder;
    use std::cell::RefCell;

    fn vm() -> VM {
        let engine = EngineBuilder::new().with_prelude().build().unwrap();
        VM::new(Arc::new(engine))
    }

    #[test]
    fn error_reporting_mask_filters_levels() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut vm = vm().with_error_handler(Box::new(CapturingErrorHandler::new(
            move |level, msg: &str| sink.borrow_mut().push((level, msg.to_string())),
        )));
        vm.raise_notice("first").unwrap();
        vm.context.error_reporting = ErrorLevel::Warning.to_bitmask();
        vm.raise_notice("hidden").unwrap();
        vm.raise_warning("shown").unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (ErrorLevel::Notice, "first".to_string()));
        assert_eq!(seen[1], (ErrorLevel::Warning, "shown".to_string()));
    }

    #[test]
    fn undefined_method_display_names_context() {
        let err = VmError::undefined_method("C", "m", Some("D"));
        assert_eq!(err.to_string(), "Call to undefined method C::m() from context D");
        let err = VmError::undefined_method("C", "m", None::<String>);
        assert_eq!(err.to_string(), "Call to undefined method C::m() from anonymous context");
    }

    #[test]
    fn invalid_stack_size_is_rejected() {
        let engine = Arc::new(EngineBuilder::new().with_prelude().build().unwrap());
        let options = RuntimeOptions {
            stack_elms: 1000,
            ..RuntimeOptions::default()
        };
        assert!(VM::with_options(engine, options).is_err());
    }

    #[test]
    fn abstract_classes_cannot_be_instantiated() {
        let vm = vm();
        let cls = vm.lookup_class("ArrayAccess").unwrap();
        let err = vm.instantiate(&cls).err().unwrap();
        assert_eq!(err.to_string(), "Cannot instantiate interface ArrayAccess");
    }
}
