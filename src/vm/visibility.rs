//! Visibility checking and method resolution
//!
//! Methods and properties are resolved against the *context class*: the
//! class that declared the running function. PHP rules:
//!
//! - **Public**: Accessible from anywhere
//! - **Protected**: Accessible when the context class and the declaring
//!   class are related (same, ancestor or descendant)
//! - **Private**: Accessible only from the declaring class
//!
//! Method lookup additionally lets a private method of the context class
//! win over whatever `$obj->m()` would otherwise find, and falls back to
//! `__call`/`__callStatic` when nothing accessible exists.
//!
//! ## References
//!
//! - Zend: `$PHP_SRC_PATH/Zend/zend_compile.c` - zend_check_visibility
//! - HHVM: `runtime/vm/bytecode.cpp` (lookupMethodCtx)

use crate::core::value::ObjectData;
use crate::runtime::class::Class;
use crate::runtime::unit::{Func, Visibility};
use crate::vm::engine::{VM, VmError};
use std::rc::Rc;
use std::sync::Arc;

/// How the method is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// `$obj->m()`
    Obj,
    /// `C::m()`
    Cls,
    /// `new C`
    Ctor,
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    NotFound,
    FoundWithThis(Arc<Func>),
    FoundNoThis(Arc<Func>),
    /// `__call` selected; the original name travels as the invoked name
    MagicCall(Arc<Func>),
    MagicCallStatic(Arc<Func>),
}

/// Whether `ctx` may see a member of `declaring` with `visibility`
pub(crate) fn is_visible_from(
    declaring: &Class,
    visibility: Visibility,
    ctx: Option<&Class>,
) -> bool {
    match visibility {
        Visibility::Public => true,
        Visibility::Private => ctx.is_some_and(|c| c.name.eq_ignore_ascii_case(&declaring.name)),
        Visibility::Protected => {
            ctx.is_some_and(|c| c.classof(declaring) || declaring.classof(c))
        }
    }
}

/// Topmost ancestor of `cls` declaring a method called `name`
fn base_class<'a>(cls: &'a Class, name: &str) -> &'a Class {
    cls.ancestry()
        .filter(|c| c.lookup_method(name).is_some())
        .last()
        .unwrap_or(cls)
}

fn context_label(ctx: Option<&Arc<Class>>) -> String {
    match ctx {
        Some(c) => format!("context {}", c.name),
        None => "anonymous context".to_string(),
    }
}

impl VM {
    /// Resolve a method as seen from `ctx`
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - lookupMethodCtx
    pub(crate) fn lookup_method_ctx(
        &self,
        cls: &Arc<Class>,
        name: Option<&str>,
        ctx: Option<&Arc<Class>>,
        call_type: CallType,
        raise: bool,
    ) -> Result<Option<Arc<Func>>, VmError> {
        let method = match (call_type, name) {
            (CallType::Ctor, _) | (_, None) => cls.get_ctor().cloned(),
            (_, Some(name)) => match cls.lookup_method(name) {
                Some(m) => Some(m.clone()),
                None if name.eq_ignore_ascii_case("__construct") => cls.get_ctor().cloned(),
                None => {
                    if raise {
                        return Err(VmError::undefined_method(
                            cls.name.as_ref(),
                            name,
                            ctx.map(|c| c.name.to_string()),
                        ));
                    }
                    return Ok(None);
                }
            },
        };
        let Some(method) = method else {
            return Ok(None);
        };

        let visibility = method.attrs.visibility;
        let mut accessible = true;
        if visibility != Visibility::Public {
            let base = base_class(cls, &method.name);
            if ctx.is_some_and(|c| c.name.eq_ignore_ascii_case(&base.name)) {
                return Ok(Some(method));
            }
            let Some(ctx_cls) = ctx else {
                if raise {
                    return Err(VmError::fatal(format!(
                        "Call to {} method {}::{}() from anonymous context",
                        visibility.as_str(),
                        cls.name,
                        method.name
                    )));
                }
                return Ok(None);
            };
            if visibility == Visibility::Private {
                // the context class may still declare its own private method
                accessible = false;
            } else {
                if ctx_cls.classof(base) {
                    return Ok(Some(method));
                }
                if !base.classof(ctx_cls) {
                    if raise {
                        return Err(VmError::fatal(format!(
                            "Call to protected method {}::{}() from context {}",
                            cls.name, method.name, ctx_cls.name
                        )));
                    }
                    return Ok(None);
                }
            }
        }

        // $obj->m() from an ancestor context prefers that ancestor's private m
        if call_type == CallType::Obj {
            if let Some(ctx_cls) = ctx.filter(|c| cls.classof(c)) {
                if let Some(own) = ctx_cls.lookup_method(&method.name) {
                    let declared_here = own
                        .cls
                        .as_deref()
                        .is_some_and(|d| d.eq_ignore_ascii_case(&ctx_cls.name));
                    if declared_here && own.attrs.visibility == Visibility::Private {
                        return Ok(Some(own.clone()));
                    }
                }
            }
        }

        if accessible {
            return Ok(Some(method));
        }
        if raise {
            let declaring = method.cls.as_deref().unwrap_or(&cls.name).to_string();
            return Err(VmError::fatal(format!(
                "Call to private method {}::{}() from {}",
                declaring,
                method.name,
                context_label(ctx)
            )));
        }
        Ok(None)
    }

    /// `$obj->name(...)`
    pub(crate) fn lookup_obj_method(
        &self,
        cls: &Arc<Class>,
        name: &str,
        ctx: Option<&Arc<Class>>,
        raise: bool,
    ) -> Result<LookupResult, VmError> {
        if let Some(f) = self.lookup_method_ctx(cls, Some(name), ctx, CallType::Obj, false)? {
            return Ok(if f.attrs.is_static {
                LookupResult::FoundNoThis(f)
            } else {
                LookupResult::FoundWithThis(f)
            });
        }
        if let Some(magic) = cls.lookup_method("__call") {
            return Ok(LookupResult::MagicCall(magic.clone()));
        }
        if raise {
            // rerun for the precise error
            self.lookup_method_ctx(cls, Some(name), ctx, CallType::Obj, true)?;
        }
        Ok(LookupResult::NotFound)
    }

    /// `C::name(...)`, with `obj` the current `$this` if any
    pub(crate) fn lookup_cls_method(
        &self,
        cls: &Arc<Class>,
        name: &str,
        obj: Option<&Rc<ObjectData>>,
        ctx: Option<&Arc<Class>>,
        raise: bool,
    ) -> Result<LookupResult, VmError> {
        let this_fits = obj.is_some_and(|o| o.class.classof(cls));
        if let Some(f) = self.lookup_method_ctx(cls, Some(name), ctx, CallType::Cls, false)? {
            return Ok(if this_fits && !f.attrs.is_static {
                LookupResult::FoundWithThis(f)
            } else {
                LookupResult::FoundNoThis(f)
            });
        }
        if this_fits {
            if let Some(magic) = obj.and_then(|o| o.class.lookup_method("__call")) {
                return Ok(LookupResult::MagicCall(magic.clone()));
            }
        }
        if let Some(magic) = cls.lookup_method("__callStatic") {
            return Ok(LookupResult::MagicCallStatic(magic.clone()));
        }
        if raise {
            self.lookup_method_ctx(cls, Some(name), ctx, CallType::Cls, true)?;
        }
        Ok(LookupResult::NotFound)
    }

    pub(crate) fn lookup_ctor_method(
        &self,
        cls: &Arc<Class>,
        ctx: Option<&Arc<Class>>,
    ) -> Result<Option<Arc<Func>>, VmError> {
        self.lookup_method_ctx(cls, None, ctx, CallType::Ctor, true)
    }

    /// Fatal unless the running context may touch property `name` of `cls`.
    /// Returns false for properties the class does not declare.
    pub(crate) fn check_prop_access(
        &self,
        cls: &Class,
        name: &[u8],
        ctx: Option<&Class>,
    ) -> Result<bool, VmError> {
        let key = String::from_utf8_lossy(name);
        let Some(entry) = cls.props.get(key.as_ref()) else {
            return Ok(false);
        };
        if entry.visibility == Visibility::Public {
            return Ok(true);
        }
        let declaring = self.context.lookup_class(&entry.cls);
        let visible = match declaring {
            Some(d) => is_visible_from(d, entry.visibility, ctx),
            None => false,
        };
        if !visible {
            return Err(VmError::fatal(format!(
                "Cannot access {} property {}::${}",
                entry.visibility.as_str(),
                cls.name,
                key
            )));
        }
        Ok(true)
    }

    /// Storage key of a static property visible from `ctx`
    pub(crate) fn lookup_static_prop(
        &self,
        cls: &Class,
        name: &[u8],
        ctx: Option<&Class>,
    ) -> Result<(String, String), VmError> {
        let key = String::from_utf8_lossy(name).into_owned();
        let accessible = cls.static_props.get(&key).and_then(|entry| {
            let declaring = self.context.lookup_class(&entry.cls)?;
            is_visible_from(declaring, entry.visibility, ctx)
                .then(|| (entry.cls.to_ascii_lowercase(), key.clone()))
        });
        accessible.ok_or_else(|| {
            VmError::fatal(format!("Invalid static property access: {}::{}", cls.name, key))
        })
    }
}
