//! Declaration and constant operations
//!
//! ## Operations
//!
//! - **DefFunc / DefCls**: declare a `[conditional]` function or class of
//!   the running unit when execution reaches it
//! - **DefCns**: define a request constant; pushes whether it took
//! - **ClsCns / ClsCnsD**: read a class constant
//! - **ClassExists / InterfaceExists / TraitExists**: look a name up
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopDefFunc, iopDefCls, iopDefCns,
//!   iopClsCns, iopClsCnsD, classExistsImpl
//! - Zend: `$PHP_SRC_PATH/Zend/zend_builtin_functions.c` - define, class_exists

use crate::core::value::TypedValue;
use crate::runtime::class::Class;
use crate::runtime::unit::{Func, Unit};
use crate::vm::engine::{VM, VmError};
use std::sync::Arc;
use tracing::trace;

/// Which kind of class a `*Exists` instruction accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    Trait,
}

impl ClassKind {
    fn matches(self, cls: &Class) -> bool {
        match self {
            ClassKind::Class => cls.is_normal(),
            ClassKind::Interface => cls.attrs.is_interface,
            ClassKind::Trait => cls.attrs.is_trait,
        }
    }
}

impl VM {
    /// Unit the running function was loaded from
    fn current_unit(&self) -> Result<Arc<Unit>, VmError> {
        let func: Arc<Func> = self.frame()?.func.clone();
        self.context
            .engine
            .unit_of(&func.unit)
            .cloned()
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, "function has no unit"))
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopDefFunc
    pub(crate) fn exec_def_func(&mut self, id: usize) -> Result<(), VmError> {
        let unit = self.current_unit()?;
        let func = unit
            .funcs
            .get(id)
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, format!("no function {}", id)))?;
        if !func.attrs.is_conditional {
            return Ok(());
        }
        self.context.define_func(func)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopDefCls
    pub(crate) fn exec_def_cls(&mut self, id: usize) -> Result<(), VmError> {
        let unit = self.current_unit()?;
        let pre = unit
            .classes
            .get(id)
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, format!("no class {}", id)))?;
        if !pre.attrs.is_conditional {
            return Ok(());
        }
        let cls = self.context.define_class(&unit, id)?;
        trace!(class = %cls.name, "DefCls");
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopDefCns
    pub(crate) fn exec_def_cns(&mut self, name: &[u8]) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let key = String::from_utf8_lossy(name).into_owned();
        let defined = match value {
            TypedValue::Array(_) | TypedValue::Object(_) => {
                self.raise_warning("Constants may only evaluate to scalar values")?;
                false
            }
            _ if self.context.constants.contains_key(&key) => {
                self.raise_notice(format!("Constant {} already defined", key))?;
                false
            }
            value => {
                self.context.constants.insert(key, value);
                true
            }
        };
        self.push(TypedValue::Bool(defined));
        Ok(())
    }

    fn class_constant(&self, cls: &Class, name: &[u8]) -> Result<TypedValue, VmError> {
        let name = String::from_utf8_lossy(name);
        cls.constants
            .get(name.as_ref())
            .map(|value| value.to_value())
            .ok_or_else(|| VmError::fatal(format!("Couldn't find constant {}::{}", cls.name, name)))
    }

    /// Replace the class on top of the stack with its constant `name`
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopClsCns
    pub(crate) fn exec_cls_cns(&mut self, name: &[u8]) -> Result<(), VmError> {
        let cls = match self.pop_tv("ClsCns")? {
            TypedValue::Class(cls) => cls,
            _ => return Err(VmError::invalid_bytecode(self.op_start, "expected a class on the stack")),
        };
        let value = self.class_constant(&cls, name)?;
        self.push(value);
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopClsCnsD
    pub(crate) fn exec_cls_cns_d(&mut self, name: &[u8], class: &[u8]) -> Result<(), VmError> {
        let cls = self.lookup_class(&String::from_utf8_lossy(class))?;
        let value = self.class_constant(&cls, name)?;
        self.push(value);
        Ok(())
    }

    /// Stack: name, then the autoload flag on top
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - classExistsImpl
    pub(crate) fn exec_class_exists(&mut self, kind: ClassKind) -> Result<(), VmError> {
        // there is no autoloader to consult
        let _autoload = self.pop_c()?.to_bool();
        let name = self.pop_c()?.to_string_bytes();
        let exists = self
            .context
            .lookup_class(&String::from_utf8_lossy(&name))
            .is_some_and(|cls| kind.matches(cls));
        self.push(TypedValue::Bool(exists));
        Ok(())
    }
}
