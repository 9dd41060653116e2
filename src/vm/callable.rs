//! Callable resolution
//!
//! Maps the runtime forms of a PHP callable to the function to run and
//! its `$this`/class binding:
//!
//! - `"f"`: a function
//! - `"C::m"`: a static method
//! - `[$obj, "m"]` / `["C", "m"]`: a method, `__call`/`__callStatic` as fallback
//! - an object with `__invoke`
//!
//! Used by `FPushFunc`, `call_user_func*`, the user error handler and the
//! `ArrayAccess`/`Iterator` protocols.
//!
//! Reference: HHVM `runtime/base/builtin_functions.cpp` - vm_decode_function
//! Reference: $PHP_SRC_PATH/Zend/zend_API.c - zend_is_callable_ex

use crate::core::value::{ArrayKey, ObjectData, TypedValue};
use crate::runtime::class::Class;
use crate::runtime::unit::Func;
use crate::vm::engine::{VM, VmError};
use crate::vm::frame::ThisOrClass;
use crate::vm::visibility::LookupResult;
use std::rc::Rc;
use std::sync::Arc;

/// A resolved call target
#[derive(Debug, Clone)]
pub struct Callee {
    pub func: Arc<Func>,
    pub this_or_class: ThisOrClass,
    /// Requested name when `__call`/`__callStatic` stands in
    pub inv_name: Option<Rc<[u8]>>,
}

impl Callee {
    pub fn function(func: Arc<Func>) -> Self {
        Self {
            func,
            this_or_class: ThisOrClass::Empty,
            inv_name: None,
        }
    }

    /// Bind a method lookup result. `this` is the object the call is made
    /// on (or the current `$this` for a class call).
    pub(crate) fn from_lookup(
        found: LookupResult,
        this: Option<Rc<ObjectData>>,
        cls: Arc<Class>,
        name: &str,
    ) -> Option<Self> {
        let bind_this = |this: Option<Rc<ObjectData>>, cls: Arc<Class>| match this {
            Some(obj) => ThisOrClass::This(obj),
            None => ThisOrClass::Class(cls),
        };
        let (func, this_or_class, inv_name) = match found {
            LookupResult::NotFound => return None,
            LookupResult::FoundWithThis(f) => (f, bind_this(this, cls), None),
            LookupResult::FoundNoThis(f) => (f, ThisOrClass::Class(cls), None),
            LookupResult::MagicCall(f) => (f, bind_this(this, cls), Some(name)),
            LookupResult::MagicCallStatic(f) => (f, ThisOrClass::Class(cls), Some(name)),
        };
        Some(Self {
            func,
            this_or_class,
            inv_name: inv_name.map(|n| Rc::from(n.as_bytes())),
        })
    }
}

impl VM {
    /// `None` when the value names nothing callable from here
    pub(crate) fn resolve_callable(&self, callable: &TypedValue) -> Result<Option<Callee>, VmError> {
        let callable = callable.to_cell();
        match &callable {
            v if v.is_string() => {
                let name = String::from_utf8_lossy(v.str_bytes().unwrap_or_default()).into_owned();
                if let Some((cls, method)) = name.split_once("::") {
                    let cls = TypedValue::string(cls);
                    return self.resolve_method_callable(&cls, method);
                }
                Ok(self
                    .context
                    .lookup_func(&name)
                    .map(|f| Callee::function(f.clone())))
            }
            TypedValue::Array(arr) if arr.len() == 2 => {
                let (Some(target), Some(method)) =
                    (arr.get(&ArrayKey::Int(0)), arr.get(&ArrayKey::Int(1)))
                else {
                    return Ok(None);
                };
                let method = method.to_cell();
                if !method.is_string() {
                    return Ok(None);
                }
                let method = String::from_utf8_lossy(method.str_bytes().unwrap_or_default()).into_owned();
                self.resolve_method_callable(target, &method)
            }
            TypedValue::Object(obj) => Ok(obj.class.lookup_method("__invoke").map(|f| Callee {
                func: f.clone(),
                this_or_class: ThisOrClass::This(obj.clone()),
                inv_name: None,
            })),
            _ => Ok(None),
        }
    }

    fn resolve_method_callable(
        &self,
        target: &TypedValue,
        method: &str,
    ) -> Result<Option<Callee>, VmError> {
        let ctx = self.context_class();
        match target.to_cell() {
            TypedValue::Object(obj) => {
                let found = self.lookup_obj_method(&obj.class, method, ctx.as_ref(), false)?;
                Ok(Callee::from_lookup(found, Some(obj.clone()), obj.class.clone(), method))
            }
            v if v.is_string() => {
                let name = String::from_utf8_lossy(v.str_bytes().unwrap_or_default()).into_owned();
                let Some(cls) = self.context.lookup_class(&name).cloned() else {
                    return Ok(None);
                };
                let this = self.this();
                let found = self.lookup_cls_method(&cls, method, this.as_ref(), ctx.as_ref(), false)?;
                let this = this.filter(|o| o.class.classof(&cls));
                Ok(Callee::from_lookup(found, this, cls, method))
            }
            _ => Ok(None),
        }
    }

    /// Call any callable value with `args`
    /// Reference: HHVM `runtime/base/builtin_functions.cpp` - vm_call_user_func
    pub fn call_user_func(
        &mut self,
        callable: &TypedValue,
        args: &[TypedValue],
    ) -> Result<TypedValue, VmError> {
        let Some(callee) = self.resolve_callable(callable)? else {
            self.raise_warning("call_user_func() expects parameter 1 to be a valid callback")?;
            return Ok(TypedValue::Null);
        };
        if callee.func.attrs.is_abstract {
            return Err(VmError::fatal(format!(
                "Call to abstract method {}()",
                callee.func.full_name()
            )));
        }
        self.invoke_func(
            &callee.func,
            args,
            callee.this_or_class,
            None,
            callee.inv_name,
        )
    }

    /// `$obj->name(...args)` from native code
    pub(crate) fn invoke_method(
        &mut self,
        obj: &Rc<ObjectData>,
        name: &str,
        args: &[TypedValue],
    ) -> Result<TypedValue, VmError> {
        let ctx = self.context_class();
        let found = self.lookup_obj_method(&obj.class, name, ctx.as_ref(), true)?;
        let callee = Callee::from_lookup(found, Some(obj.clone()), obj.class.clone(), name)
            .ok_or_else(|| {
                VmError::undefined_method(
                    obj.class.name.as_ref(),
                    name,
                    ctx.map(|c| c.name.to_string()),
                )
            })?;
        self.invoke_func(
            &callee.func,
            args,
            callee.this_or_class,
            None,
            callee.inv_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::assembler::assemble;
    use crate::core::value::ArrayData;
    use crate::runtime::context::EngineBuilder;

    fn vm() -> VM {
        let unit = assemble(
            r#"
            .function twice($x) { CGetL $x; Int 2; Mul; RetC }
            .class C {
              .method [static] make($x) { CGetL $x; Int 10; Add; RetC }
              .method get() { String "get"; RetC }
              .method __invoke($x) { CGetL $x; Int 1; Add; RetC }
              .method __call($name, $args) { CGetL $name; RetC }
            }
            .main { Null; RetC }
            "#,
            "callable.hhas",
        )
        .unwrap();
        let engine = EngineBuilder::new().with_prelude().with_unit(unit).build().unwrap();
        VM::new(Arc::new(engine))
    }

    fn pair(a: TypedValue, b: &str) -> TypedValue {
        let mut arr = ArrayData::new();
        arr.append(a);
        arr.append(TypedValue::string(b));
        TypedValue::Array(Rc::new(arr))
    }

    #[test]
    fn string_callables() {
        let mut vm = vm();
        let r = vm.call_user_func(&TypedValue::string("twice"), &[TypedValue::Int(4)]).unwrap();
        assert_eq!(r, TypedValue::Int(8));
        let r = vm.call_user_func(&TypedValue::string("C::make"), &[TypedValue::Int(1)]).unwrap();
        assert_eq!(r, TypedValue::Int(11));
    }

    #[test]
    fn array_and_invokable_callables() {
        let mut vm = vm();
        let cls = vm.lookup_class("C").unwrap();
        let obj = ObjectData::new(cls);
        let r = vm.call_user_func(&pair(TypedValue::Object(obj.clone()), "get"), &[]).unwrap();
        assert_eq!(r.to_string_bytes(), b"get");
        let r = vm.call_user_func(&TypedValue::Object(obj.clone()), &[TypedValue::Int(1)]).unwrap();
        assert_eq!(r, TypedValue::Int(2));
        let r = vm.call_user_func(&pair(TypedValue::Object(obj), "missing"), &[]).unwrap();
        assert_eq!(r.to_string_bytes(), b"missing");
    }

    #[test]
    fn unknown_callable_warns_and_returns_null() {
        let mut vm = vm();
        let r = vm.call_user_func(&TypedValue::Int(3), &[]).unwrap();
        assert_eq!(r, TypedValue::Null);
    }
}
