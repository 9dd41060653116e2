//! Special operations
//!
//! Stack housekeeping, output, object cloning, constants and the
//! instructions that read the frame's class context.
//!
//! ## Operations
//!
//! - **PopC / PopV / PopR**: discard the top cell
//! - **Print**: echo and push `1`
//! - **Clone**: shallow copy, then `__clone` on the copy
//! - **Cns**: request constant, falling back to its own name
//! - **This / InitThisLoc**: `$this`
//! - **StaticLoc / StaticLocInit**: bind a local to its function-static cell
//! - **LateBoundCls / Self / Parent**: push a class reference
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopPopC, iopPrint, iopClone, iopCns,
//!   iopThis, iopStaticLoc, iopLateBoundCls
//! - Zend: `$PHP_SRC_PATH/Zend/zend_vm_def.h` - ZEND_ECHO, ZEND_CLONE

use crate::core::value::{RefData, TypedValue};
use crate::vm::engine::{VM, VmError};
use crate::vm::opcodes::continuation::is_uncloneable;
use std::rc::Rc;
use tracing::trace;

impl VM {
    #[inline]
    pub(crate) fn exec_pop_c(&mut self) -> Result<(), VmError> {
        self.pop_tv("PopC").map(drop)
    }

    #[inline]
    pub(crate) fn exec_pop_v(&mut self) -> Result<(), VmError> {
        self.pop_v().map(drop)
    }

    #[inline]
    pub(crate) fn exec_pop_r(&mut self) -> Result<(), VmError> {
        self.pop_tv("PopR").map(drop)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopPrint
    pub(crate) fn exec_print(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.echo(&value.to_string_bytes())?;
        self.push(TypedValue::Int(1));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopClone
    pub(crate) fn exec_clone(&mut self) -> Result<(), VmError> {
        let TypedValue::Object(obj) = self.pop_c()? else {
            return Err(VmError::fatal("clone called on non-object"));
        };
        if is_uncloneable(&obj) {
            return Err(VmError::fatal(format!(
                "Trying to clone an uncloneable object of class {}",
                obj.class.name
            )));
        }
        let copy = obj.clone_object();
        if copy.class.lookup_method("__clone").is_some() {
            self.invoke_method(&copy, "__clone", &[])?;
        }
        self.push(TypedValue::Object(copy));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopCns
    pub(crate) fn exec_cns(&mut self, name: &[u8]) -> Result<(), VmError> {
        let key = String::from_utf8_lossy(name).into_owned();
        if let Some(value) = self.context.constants.get(&key) {
            let value = value.clone();
            self.push(value);
            return Ok(());
        }
        self.raise_notice(format!("Use of undefined constant {} - assumed '{}'", key, key))?;
        self.push(TypedValue::string(name));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopThis
    pub(crate) fn exec_this(&mut self) -> Result<(), VmError> {
        let obj = self
            .frame()?
            .this()
            .cloned()
            .ok_or_else(|| VmError::fatal("Using $this when not in object context"))?;
        self.push(TypedValue::Object(obj));
        Ok(())
    }

    /// Store `$this` in a local when the frame has one
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopInitThisLoc
    pub(crate) fn exec_init_this_loc(&mut self, local: usize) -> Result<(), VmError> {
        let ar = self.frame()?;
        let slot = ar.local_index(local);
        if let Some(obj) = ar.this().cloned() {
            self.stack.at_mut(slot).assign(TypedValue::Object(obj));
        }
        Ok(())
    }

    /// Cell backing `static $name` of the running function, if created
    fn static_local(&mut self, name: &[u8], init: impl FnOnce() -> TypedValue) -> Result<(Rc<RefData>, bool), VmError> {
        let func = self.frame()?.func.full_name();
        let key = (func, String::from_utf8_lossy(name).into_owned());
        if let Some(cell) = self.context.static_locals.get(&key) {
            return Ok((cell.clone(), true));
        }
        trace!(func = %key.0, var = %key.1, "static local created");
        let cell = RefData::new(init());
        self.context.static_locals.insert(key, cell.clone());
        Ok((cell, false))
    }

    fn bind_local(&mut self, local: usize, cell: Rc<RefData>) -> Result<(), VmError> {
        let slot = self.frame()?.local_index(local);
        self.stack.at_mut(slot).assign(TypedValue::Ref(cell));
        Ok(())
    }

    /// Bind a local to its static cell; pushes whether it already existed
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopStaticLoc
    pub(crate) fn exec_static_loc(&mut self, local: usize, name: &[u8]) -> Result<(), VmError> {
        let (cell, existed) = self.static_local(name, || TypedValue::Null)?;
        self.bind_local(local, cell)?;
        self.push(TypedValue::Bool(existed));
        Ok(())
    }

    /// Like `StaticLoc`, creating the cell from the popped initializer
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopStaticLocInit
    pub(crate) fn exec_static_loc_init(&mut self, local: usize, name: &[u8]) -> Result<(), VmError> {
        let initial = self.pop_c()?;
        let (cell, _) = self.static_local(name, || initial)?;
        self.bind_local(local, cell)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopLateBoundCls
    pub(crate) fn exec_late_bound_cls(&mut self) -> Result<(), VmError> {
        let cls = self
            .user_frame()
            .and_then(|fp| self.frames[fp].late_bound_class())
            .ok_or_else(|| VmError::fatal("Cannot access static:: when no class scope is active"))?;
        self.push(TypedValue::Class(cls));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSelf
    pub(crate) fn exec_self(&mut self) -> Result<(), VmError> {
        let cls = self
            .context_class()
            .ok_or_else(|| VmError::fatal("Cannot access self:: when no class scope is active"))?;
        self.push(TypedValue::Class(cls));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopParent
    pub(crate) fn exec_parent(&mut self) -> Result<(), VmError> {
        let cls = self
            .context_class()
            .ok_or_else(|| VmError::fatal("Cannot access parent:: when no class scope is active"))?;
        let parent = cls.parent.clone().ok_or_else(|| {
            VmError::fatal("Cannot access parent:: when current class scope has no parent")
        })?;
        self.push(TypedValue::Class(parent));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::assembler::assemble;
    use crate::core::value::TypedValue;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::{CapturingOutputWriter, VM, VmError};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn run(src: &str) -> (Result<TypedValue, VmError>, String) {
        let unit = assemble(src, "special.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let mut vm = VM::new(engine.clone()).with_output_writer(Box::new(CapturingOutputWriter::new(
            move |bytes: &[u8]| sink.borrow_mut().extend_from_slice(bytes),
        )));
        let main = engine.main_unit().cloned().unwrap();
        let result = vm.invoke_unit(&main);
        let text = String::from_utf8_lossy(&out.borrow()).into_owned();
        (result, text)
    }

    #[test]
    fn static_locals_survive_calls() {
        let (result, out) = run(
            r#"
            .function counter() {
              Int 0; StaticLocInit $n "n"
              IncDecL $n PreInc
              RetC
            }
            .main {
              FPushFuncD 0 "counter"; FCall 0; Print; PopC
              FPushFuncD 0 "counter"; FCall 0; Print; PopC
              FPushFuncD 0 "counter"; FCall 0
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap(), TypedValue::Int(3));
        assert_eq!(out, "12");
    }

    #[test]
    fn clone_runs_the_clone_hook_on_the_copy() {
        let (result, _) = run(
            r#"
            .class P {
              .property [public] tag = "orig";
              .method __clone() { This; String "copy"; SetM <C PT:"tag">; PopC; Null; RetC }
            }
            .main {
              FPushCtorD 0 "P"; FCall 0; PopR
              SetL $a; PopC
              CGetL $a; Clone; SetL $b; PopC
              CGetM <L:$a PT:"tag">; String "/"; Concat
              CGetM <L:$b PT:"tag">; Concat
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"orig/copy");
    }

    #[test]
    fn class_context_instructions() {
        let (result, _) = run(
            r#"
            .class A { .method [static] who() { LateBoundCls; RetC } }
            .class B extends A { .method [static] up() { Parent; RetC } }
            .main {
              FPushClsMethodD 0 "who" "B"; FCall 0; SetL $c; PopC
              FPushClsMethodD 0 "up" "B"; FCall 0; SetL $p; PopC
              CGetL $c; CastString; String ","; Concat; CGetL $p; CastString; Concat
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"B,A");
        let (err, _) = run(".main {\n Self\n RetC\n}");
        assert_eq!(
            err.unwrap_err().to_string(),
            "Cannot access self:: when no class scope is active"
        );
    }

    #[test]
    fn undefined_constant_is_its_name() {
        let (result, _) = run(".main {\n Cns \"FOO\"\n RetC\n}");
        assert_eq!(result.unwrap().to_string_bytes(), b"FOO");
        let (result, _) = run(".main {\n Cns \"PHP_EOL\"\n RetC\n}");
        assert_eq!(result.unwrap().to_string_bytes(), b"\n");
    }
}
