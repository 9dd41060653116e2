//! Foreach iteration
//!
//! Iterators live in the frame (`ActRec::iters`) and are addressed by the
//! `IA` immediate. Four kinds exist:
//!
//! - **Array**: `IterInit` on an array iterates a snapshot; the loop body
//!   may modify the original without affecting the iteration.
//! - **MutableArray**: `IterInitM` iterates the live array behind a var,
//!   separating it first so `IterValueV` can hand out element refs.
//! - **Object**: an `Iterator` object, driven through
//!   `rewind`/`valid`/`current`/`key`/`next`.
//! - **Props**: any other object iterates its properties visible from the
//!   running context.
//!
//! `IterInit*` jumps to its target when there is nothing to iterate, and
//! `IterNext` jumps back to the loop body while elements remain. An
//! exhausted iterator is freed on the spot.
//!
//! Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterInit, iopIterInitM,
//! iopIterNext, iopIterFree
//! Reference: $PHP_SRC_PATH/Zend/zend_vm_def.h - ZEND_FE_RESET, ZEND_FE_FETCH

use crate::core::value::{ArrayData, ObjectData, PropName, RefData, TypedValue};
use crate::runtime::class::Class;
use crate::vm::engine::{VM, VmError};
use crate::vm::frame::Iter;
use crate::vm::visibility::is_visible_from;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

const INVALID_FOREACH: &str = "Invalid argument supplied for foreach()";

impl VM {
    fn iter_mut(&mut self, id: usize) -> Result<&mut Iter, VmError> {
        let fp = self.fp()?;
        let offset = self.op_start;
        self.frames[fp]
            .iters
            .get_mut(id)
            .ok_or_else(|| VmError::invalid_bytecode(offset, format!("iterator {} out of range", id)))
    }

    fn iter_ref(&self, id: usize) -> Result<&Iter, VmError> {
        let fp = self.fp()?;
        self.frames[fp]
            .iters
            .get(id)
            .ok_or_else(|| VmError::invalid_bytecode(self.op_start, format!("iterator {} out of range", id)))
    }

    /// Property names of `obj` the context may see, in declaration order
    fn visible_props(&self, obj: &ObjectData, ctx: Option<&Class>) -> Vec<PropName> {
        obj.props
            .borrow()
            .keys()
            .filter(|name| {
                let key = String::from_utf8_lossy(name);
                match obj.class.props.get(key.as_ref()) {
                    Some(entry) => self
                        .context
                        .lookup_class(&entry.cls)
                        .is_some_and(|declaring| is_visible_from(declaring, entry.visibility, ctx)),
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    /// Set up iteration over an object. Returns false when there is
    /// nothing to iterate.
    fn init_object_iter(&mut self, id: usize, obj: Rc<ObjectData>) -> Result<bool, VmError> {
        if obj.class.implements_iterator() {
            self.invoke_method(&obj, "rewind", &[])?;
            if !self.invoke_method(&obj, "valid", &[])?.to_bool() {
                return Ok(false);
            }
            *self.iter_mut(id)? = Iter::Object { obj };
            return Ok(true);
        }
        let ctx: Option<Arc<Class>> = self.context_class();
        let names = self.visible_props(&obj, ctx.as_deref());
        if names.is_empty() {
            return Ok(false);
        }
        *self.iter_mut(id)? = Iter::Props { obj, names, pos: 0 };
        Ok(true)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterInit
    pub(crate) fn exec_iter_init(&mut self, id: usize, offset: i32) -> Result<(), VmError> {
        let started = match self.pop_c()? {
            TypedValue::Array(arr) => {
                if arr.is_empty() {
                    false
                } else {
                    *self.iter_mut(id)? = Iter::Array { arr, pos: 0 };
                    true
                }
            }
            TypedValue::Object(obj) => self.init_object_iter(id, obj)?,
            _ => {
                self.raise_warning(INVALID_FOREACH)?;
                false
            }
        };
        trace!(iter = id, started, "iterator initialized");
        if !started {
            self.jump(offset)?;
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterInitM
    pub(crate) fn exec_iter_init_m(&mut self, id: usize, offset: i32) -> Result<(), VmError> {
        let cell = self.pop_v()?;
        let started = match cell.get() {
            TypedValue::Array(arr) if arr.is_empty() => false,
            TypedValue::Array(arr) => {
                // our copy must not count as a second owner when separating
                drop(arr);
                if let TypedValue::Array(arr) = &mut *cell.borrow_mut() {
                    Rc::make_mut(arr);
                }
                *self.iter_mut(id)? = Iter::MutableArray { cell, pos: 0 };
                true
            }
            TypedValue::Object(obj) => self.init_object_iter(id, obj)?,
            _ => {
                self.raise_warning(INVALID_FOREACH)?;
                false
            }
        };
        if !started {
            self.jump(offset)?;
        }
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterValueC
    pub(crate) fn exec_iter_value_c(&mut self, id: usize) -> Result<(), VmError> {
        let value = match self.iter_ref(id)? {
            Iter::Array { arr, pos } => arr.entry_at(*pos).map(|(_, v)| v.to_cell()),
            Iter::MutableArray { cell, pos } => with_array(cell, |arr| arr.entry_at(*pos).map(|(_, v)| v.to_cell())).flatten(),
            Iter::Props { obj, names, pos } => names.get(*pos).and_then(|n| obj.get_prop(n)).map(|v| v.to_cell()),
            Iter::Object { obj } => {
                let obj = obj.clone();
                Some(self.invoke_method(&obj, "current", &[])?.into_cell())
            }
            Iter::Undefined => None,
        };
        self.push(value.unwrap_or(TypedValue::Null));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterValueV
    pub(crate) fn exec_iter_value_v(&mut self, id: usize) -> Result<(), VmError> {
        let cell = match self.iter_ref(id)? {
            Iter::MutableArray { cell, pos } => {
                let pos = *pos;
                let mut inner = cell.borrow_mut();
                let elem = match &mut *inner {
                    TypedValue::Array(arr) => Rc::make_mut(arr)
                        .entry_at_mut(pos)
                        .map(|(_, v)| v.box_in_place()),
                    _ => None,
                };
                elem
            }
            Iter::Props { obj, names, pos } => names.get(*pos).and_then(|name| {
                obj.props
                    .borrow_mut()
                    .get_mut(&name[..])
                    .map(TypedValue::box_in_place)
            }),
            Iter::Array { arr, pos } => arr.entry_at(*pos).map(|(_, v)| RefData::new(v.to_cell())),
            Iter::Object { obj } => {
                let obj = obj.clone();
                let value = self.invoke_method(&obj, "current", &[])?;
                Some(match value {
                    TypedValue::Ref(r) => r,
                    other => RefData::new(other),
                })
            }
            Iter::Undefined => None,
        };
        let cell = cell.unwrap_or_else(|| RefData::new(TypedValue::Null));
        self.push(TypedValue::Ref(cell));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterKey
    pub(crate) fn exec_iter_key(&mut self, id: usize) -> Result<(), VmError> {
        let key = match self.iter_ref(id)? {
            Iter::Array { arr, pos } => arr.key_at(*pos).map(|k| k.to_value()),
            Iter::MutableArray { cell, pos } => with_array(cell, |arr| arr.key_at(*pos).map(|k| k.to_value())).flatten(),
            Iter::Props { names, pos, .. } => names.get(*pos).map(|n| TypedValue::string(&n[..])),
            Iter::Object { obj } => {
                let obj = obj.clone();
                Some(self.invoke_method(&obj, "key", &[])?.into_cell())
            }
            Iter::Undefined => None,
        };
        self.push(key.unwrap_or(TypedValue::Null));
        Ok(())
    }

    /// Advance; jump back to the loop body while elements remain
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterNext
    pub(crate) fn exec_iter_next(&mut self, id: usize, offset: i32) -> Result<(), VmError> {
        let more = match self.iter_mut(id)? {
            Iter::Array { arr, pos } => {
                *pos += 1;
                *pos < arr.len()
            }
            Iter::MutableArray { cell, pos } => {
                *pos += 1;
                let pos = *pos;
                with_array(cell, |arr| pos < arr.len()).unwrap_or(false)
            }
            Iter::Props { names, pos, .. } => {
                *pos += 1;
                *pos < names.len()
            }
            Iter::Object { obj } => {
                let obj = obj.clone();
                self.invoke_method(&obj, "next", &[])?;
                self.invoke_method(&obj, "valid", &[])?.to_bool()
            }
            Iter::Undefined => false,
        };
        if more {
            self.jump(offset)
        } else {
            *self.iter_mut(id)? = Iter::Undefined;
            Ok(())
        }
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopIterFree
    pub(crate) fn exec_iter_free(&mut self, id: usize) -> Result<(), VmError> {
        *self.iter_mut(id)? = Iter::Undefined;
        Ok(())
    }
}

/// Run `f` on the array a var holds, if any
fn with_array<R>(cell: &RefData, f: impl FnOnce(&ArrayData) -> R) -> Option<R> {
    match &*cell.borrow() {
        TypedValue::Array(arr) => Some(f(arr)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::assembler::assemble;
    use crate::core::value::TypedValue;
    use crate::runtime::context::EngineBuilder;
    use crate::vm::engine::{CapturingErrorHandler, VM, VmError};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn run(src: &str) -> (Result<TypedValue, VmError>, Vec<String>) {
        let unit = assemble(src, "iter.hhas").unwrap();
        let engine = Arc::new(EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap());
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        let mut vm = VM::new(engine.clone()).with_error_handler(Box::new(CapturingErrorHandler::new(
            move |_, msg: &str| sink.borrow_mut().push(msg.to_string()),
        )));
        let main = engine.main_unit().cloned().unwrap();
        let result = vm.invoke_unit(&main);
        let errors = errors.borrow().clone();
        (result, errors)
    }

    #[test]
    fn foreach_over_a_snapshot() {
        let (result, _) = run(
            r#"
            .main {
              Array [1, 2, 3]; SetL $a; PopC
              Int 0; SetL $sum; PopC
              CGetL $a; IterInit 0 End
            Body:
              IterValueC 0; SetL $v; PopC
              Int 100; SetM <L:$a W>; PopC
              CGetL $v; SetOpL $sum PlusEqual; PopC
              IterNext 0 Body
            End:
              CGetL $sum
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap(), TypedValue::Int(6));
    }

    #[test]
    fn foreach_by_reference_updates_elements() {
        let (result, _) = run(
            r#"
            .main {
              Array [1, 2]; SetL $a; PopC
              CGetL $a; SetL $copy; PopC
              VGetL $a; IterInitM 0 End
            Body:
              IterValueV 0; BindL $v; PopV
              Int 10; SetOpL $v MulEqual; PopC
              IterNext 0 Body
            End:
              UnsetL $v
              CGetM <L:$a EI:1>; String "/"; Concat
              CGetM <L:$copy EI:1>; Concat
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"20/2");
    }

    #[test]
    fn iterator_objects_drive_the_protocol() {
        let (result, _) = run(
            r#"
            .class Count implements Iterator {
              .property [private] i = 0;
              .method rewind() { This; Int 0; SetM <C PT:"i">; PopC; Null; RetC }
              .method valid() { CGetM <H PT:"i">; Int 3; Lt; RetC }
              .method current() { CGetM <H PT:"i">; Int 10; Mul; RetC }
              .method key() { CGetM <H PT:"i">; RetC }
              .method next() { IncDecM PostInc <H PT:"i">; PopC; Null; RetC }
            }
            .main {
              String ""; SetL $out; PopC
              FPushCtorD 0 "Count"; FCall 0; PopR
              IterInit 0 End
            Body:
              IterKey 0; String "="; Concat; IterValueC 0; Concat; String ";"; Concat
              SetOpL $out ConcatEqual; PopC
              IterNext 0 Body
            End:
              CGetL $out
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"0=0;1=10;2=20;");
    }

    #[test]
    fn plain_objects_iterate_visible_props() {
        let (result, _) = run(
            r#"
            .class P {
              .property [public] a = 1;
              .property [private] hidden = 2;
              .property [public] b = 3;
            }
            .main {
              String ""; SetL $out; PopC
              FPushCtorD 0 "P"; FCall 0; PopR
              IterInit 0 End
            Body:
              IterKey 0; SetOpL $out ConcatEqual; PopC
              IterNext 0 Body
            End:
              CGetL $out
              RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"ab");
    }

    #[test]
    fn non_iterable_warns_and_skips() {
        let (result, errors) = run(
            r#"
            .main {
              Int 5; IterInit 0 End
              String "entered"; RetC
            End:
              String "skipped"; RetC
            }
            "#,
        );
        assert_eq!(result.unwrap().to_string_bytes(), b"skipped");
        assert_eq!(errors, vec!["Invalid argument supplied for foreach()".to_string()]);
    }
}
