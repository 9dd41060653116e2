//! Engine and request contexts
//!
//! `EngineContext` is the process-wide symbol table: functions and classes
//! are registered while it is being built and it is read-only afterwards,
//! so it can be shared across request threads behind an `Arc`.
//! `RequestContext` carries the mutable state of one request (static
//! properties, static locals, constants, the user error handler).
//!
//! Functions and classes marked `[conditional]` are left out of the engine
//! table. `DefFunc`/`DefCls` declare them into the request's own table when
//! execution reaches them; lookups consult the engine first.

use crate::core::value::{RefData, TypedValue};
use crate::runtime::builtins;
use crate::runtime::class::{Class, PreClass};
use crate::runtime::unit::{Func, NativeHandler, Unit, UnitData};
use crate::vm::engine::VmError;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

pub struct EngineContext {
    functions: HashMap<String, Arc<Func>>,
    classes: HashMap<String, Arc<Class>>,
    units: Vec<Arc<Unit>>,
}

impl EngineContext {
    pub fn lookup_func(&self, name: &str) -> Option<&Arc<Func>> {
        self.functions.get(&name.to_ascii_lowercase())
    }

    pub fn lookup_class(&self, name: &str) -> Option<&Arc<Class>> {
        self.classes.get(&name.to_ascii_lowercase())
    }

    pub fn units(&self) -> &[Arc<Unit>] {
        &self.units
    }

    /// The unit whose literals `data` is
    pub fn unit_of(&self, data: &Arc<UnitData>) -> Option<&Arc<Unit>> {
        self.units.iter().find(|u| Arc::ptr_eq(&u.data, data))
    }

    /// The last unit added, which is the script when a prelude precedes it
    pub fn main_unit(&self) -> Option<&Arc<Unit>> {
        self.units.last()
    }
}

/// Builder for `EngineContext`
///
/// ```rust,ignore
/// let engine = EngineBuilder::new()
///     .with_prelude()
///     .with_unit(assemble(src, "t.hhas")?)
///     .build()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    units: Vec<Unit>,
    natives: Vec<(&'static str, &'static [&'static str], NativeHandler)>,
    prelude: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builtin functions and the prelude classes (`stdClass`, `Exception`, ...)
    pub fn with_prelude(mut self) -> Self {
        self.natives.extend(builtins::NATIVE_FUNCTIONS.iter().copied());
        self.prelude = true;
        self
    }

    pub fn with_native(
        mut self,
        name: &'static str,
        params: &'static [&'static str],
        handler: NativeHandler,
    ) -> Self {
        self.natives.push((name, params, handler));
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.units.push(unit);
        self
    }

    pub fn build(self) -> Result<EngineContext, VmError> {
        let mut units = self.units;
        if self.prelude {
            units.insert(0, builtins::prelude_unit()?);
        }
        let mut functions: HashMap<String, Arc<Func>> = HashMap::new();
        for (name, params, handler) in self.natives {
            let func = builtins::native_func(name, params, handler);
            if functions.insert(name.to_ascii_lowercase(), func).is_some() {
                return Err(VmError::load(format!("Cannot redeclare {}()", name)));
            }
        }

        let mut pending: HashMap<String, PreClass> = HashMap::new();
        let mut order = Vec::new();
        for unit in &units {
            for func in unit.funcs.iter().filter(|f| !f.attrs.is_conditional) {
                let key = func.name.to_ascii_lowercase();
                if functions.insert(key, func.clone()).is_some() {
                    return Err(VmError::load(format!("Cannot redeclare {}()", func.name)));
                }
            }
            for pre in unit.classes.iter().filter(|c| !c.attrs.is_conditional) {
                let key = pre.name.to_ascii_lowercase();
                if pending.insert(key.clone(), pre.clone()).is_some() {
                    return Err(VmError::load(format!("Cannot redeclare class {}", pre.name)));
                }
                order.push(key);
            }
        }

        let mut classes = HashMap::new();
        for key in order {
            link_class(&key, &pending, &mut classes, &mut Vec::new())?;
        }
        debug!(
            functions = functions.len(),
            classes = classes.len(),
            units = units.len(),
            "engine built"
        );

        Ok(EngineContext {
            functions,
            classes,
            units: units.into_iter().map(Arc::new).collect(),
        })
    }
}

fn link_class(
    key: &str,
    pending: &HashMap<String, PreClass>,
    classes: &mut HashMap<String, Arc<Class>>,
    linking: &mut Vec<String>,
) -> Result<Arc<Class>, VmError> {
    if let Some(cls) = classes.get(key) {
        return Ok(cls.clone());
    }
    let pre = pending
        .get(key)
        .ok_or_else(|| VmError::load(format!("Class '{}' not found", key)))?;
    if linking.iter().any(|k| k == key) {
        return Err(VmError::load(format!(
            "Cannot inherit from {}: cyclic hierarchy",
            pre.name
        )));
    }
    linking.push(key.to_string());
    let parent = match &pre.parent {
        Some(p) => Some(link_class(&p.to_ascii_lowercase(), pending, classes, linking)?),
        None => None,
    };
    let mut interfaces = Vec::new();
    for iface in &pre.interfaces {
        let linked = link_class(&iface.to_ascii_lowercase(), pending, classes, linking)?;
        interfaces.extend(linked.interfaces.iter().cloned());
        interfaces.push(linked.name.clone());
    }
    linking.pop();
    let cls = Arc::new(Class::link(pre, parent, interfaces));
    classes.insert(key.to_string(), cls.clone());
    Ok(cls)
}

/// Class declared at runtime, with the declaration it came from
pub struct DeclaredClass {
    pub cls: Arc<Class>,
    pub unit: Arc<UnitData>,
    /// Index into the unit's classes
    pub id: usize,
}

/// Mutable per-request state
pub struct RequestContext {
    pub engine: Arc<EngineContext>,
    /// Conditional functions declared so far, by lowercased name
    functions: HashMap<String, Arc<Func>>,
    classes: HashMap<String, DeclaredClass>,
    /// Keyed by (declaring class, property)
    pub static_props: HashMap<(String, String), TypedValue>,
    /// Keyed by (function, local)
    pub static_locals: HashMap<(String, String), Rc<RefData>>,
    pub constants: HashMap<String, TypedValue>,
    pub error_reporting: u32,
    pub user_error_handler: Option<TypedValue>,
}

impl RequestContext {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let mut constants = HashMap::new();
        constants.insert("PHP_EOL".to_string(), TypedValue::string("\n"));
        constants.insert("PHP_INT_MAX".to_string(), TypedValue::Int(i64::MAX));
        constants.insert("PHP_INT_SIZE".to_string(), TypedValue::Int(8));
        constants.insert("E_ALL".to_string(), TypedValue::Int(32767));
        constants.insert("E_NOTICE".to_string(), TypedValue::Int(8));
        constants.insert("E_WARNING".to_string(), TypedValue::Int(2));
        Self {
            engine,
            functions: HashMap::new(),
            classes: HashMap::new(),
            static_props: HashMap::new(),
            static_locals: HashMap::new(),
            constants,
            error_reporting: 32767, // E_ALL
            user_error_handler: None,
        }
    }

    pub fn lookup_func(&self, name: &str) -> Option<&Arc<Func>> {
        self.engine
            .lookup_func(name)
            .or_else(|| self.functions.get(&name.to_ascii_lowercase()))
    }

    pub fn lookup_class(&self, name: &str) -> Option<&Arc<Class>> {
        self.engine
            .lookup_class(name)
            .or_else(|| self.classes.get(&name.to_ascii_lowercase()).map(|d| &d.cls))
    }

    /// Declare a conditional function; declaring the same one again is a no-op
    pub fn define_func(&mut self, func: &Arc<Func>) -> Result<(), VmError> {
        if let Some(existing) = self.lookup_func(&func.name) {
            if Arc::ptr_eq(existing, func) {
                return Ok(());
            }
            return Err(VmError::fatal(format!("Cannot redeclare {}()", func.name)));
        }
        debug!(func = %func.name, "function declared");
        self.functions.insert(func.name.to_ascii_lowercase(), func.clone());
        Ok(())
    }

    /// Link and declare class `id` of a unit against the classes visible now
    pub fn define_class(&mut self, unit: &Unit, id: usize) -> Result<Arc<Class>, VmError> {
        let pre = unit
            .classes
            .get(id)
            .ok_or_else(|| VmError::fatal(format!("No class {} in {}", id, unit.filepath())))?;
        let key = pre.name.to_ascii_lowercase();
        if let Some(declared) = self.classes.get(&key) {
            if Arc::ptr_eq(&declared.unit, &unit.data) && declared.id == id {
                return Ok(declared.cls.clone());
            }
        }
        if self.lookup_class(&pre.name).is_some() {
            return Err(VmError::fatal(format!("Cannot redeclare class {}", pre.name)));
        }
        let parent = match &pre.parent {
            Some(name) => {
                let parent = self.require_class(name)?;
                if !parent.is_normal() {
                    return Err(VmError::fatal(format!(
                        "Class {} cannot extend from {}",
                        pre.name, parent.name
                    )));
                }
                Some(parent)
            }
            None => None,
        };
        let mut interfaces = Vec::new();
        for name in &pre.interfaces {
            let iface = self.require_class(name)?;
            if !iface.attrs.is_interface {
                return Err(VmError::fatal(format!(
                    "{} cannot implement {} - it is not an interface",
                    pre.name, iface.name
                )));
            }
            interfaces.extend(iface.interfaces.iter().cloned());
            interfaces.push(iface.name.clone());
        }
        let cls = Arc::new(Class::link(pre, parent, interfaces));
        debug!(class = %cls.name, "class declared");
        self.classes.insert(
            key,
            DeclaredClass {
                cls: cls.clone(),
                unit: unit.data.clone(),
                id,
            },
        );
        Ok(cls)
    }

    fn require_class(&self, name: &str) -> Result<Arc<Class>, VmError> {
        self.lookup_class(name)
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("Class '{}' not found", name)))
    }

    /// Static property storage, initialized from its default on first touch
    pub fn static_prop_mut(&mut self, cls: &Class, name: &str) -> Option<&mut TypedValue> {
        let entry = cls.static_props.get(name)?;
        let key = (entry.cls.to_ascii_lowercase(), name.to_string());
        Some(
            self.static_props
                .entry(key)
                .or_insert_with(|| entry.default_value.to_value()),
        )
    }
}
