//! Class metadata
//!
//! `PreClass` is what a unit declares; `Class` is the linked form with the
//! parent resolved and the method/property tables flattened, so lookups
//! never walk the hierarchy.
//!
//! Reference: HHVM `runtime/vm/class.h` (PreClass / Class split)

use crate::runtime::unit::{Func, StaticValue, Visibility};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PropEntry {
    pub visibility: Visibility,
    pub default_value: StaticValue,
    /// Class that declared the property
    pub cls: Arc<str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassAttrs {
    pub is_interface: bool,
    pub is_abstract: bool,
    pub is_trait: bool,
    /// Declared by `DefCls` when execution reaches it, not at load
    pub is_conditional: bool,
}

/// Declared property before linking
#[derive(Debug, Clone)]
pub struct PreProp {
    pub name: Arc<str>,
    pub visibility: Visibility,
    pub is_static: bool,
    pub default_value: StaticValue,
}

/// Class as declared in a unit
#[derive(Debug, Clone)]
pub struct PreClass {
    pub name: Arc<str>,
    pub parent: Option<Arc<str>>,
    pub interfaces: Vec<Arc<str>>,
    pub attrs: ClassAttrs,
    pub methods: Vec<Arc<Func>>,
    pub props: Vec<PreProp>,
    pub constants: Vec<(Arc<str>, StaticValue)>,
}

pub struct Class {
    pub name: Arc<str>,
    pub parent: Option<Arc<Class>>,
    pub attrs: ClassAttrs,
    /// Every interface implemented, directly or through a parent, lowercased
    pub interfaces: Vec<Arc<str>>,
    /// Lowercased method name to implementation, inherited entries included
    pub methods: IndexMap<String, Arc<Func>>,
    pub props: IndexMap<String, PropEntry>,
    pub static_props: IndexMap<String, PropEntry>,
    /// Class constants, inherited ones included; names are case-sensitive
    pub constants: IndexMap<String, StaticValue>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name.clone()))
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Class {
    /// Link `pre` against an already linked parent
    pub fn link(pre: &PreClass, parent: Option<Arc<Class>>, interfaces: Vec<Arc<str>>) -> Class {
        let mut methods = IndexMap::new();
        let mut props = IndexMap::new();
        let mut static_props = IndexMap::new();
        let mut constants = IndexMap::new();
        if let Some(p) = &parent {
            constants.extend(p.constants.iter().map(|(k, v)| (k.clone(), v.clone())));
            methods.extend(p.methods.iter().map(|(k, v)| (k.clone(), v.clone())));
            props.extend(p.props.iter().map(|(k, v)| (k.clone(), v.clone())));
            static_props.extend(p.static_props.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for (name, value) in &pre.constants {
            constants.insert(name.to_string(), value.clone());
        }
        for m in &pre.methods {
            methods.insert(m.name.to_ascii_lowercase(), m.clone());
        }
        for p in &pre.props {
            let entry = PropEntry {
                visibility: p.visibility,
                default_value: p.default_value.clone(),
                cls: pre.name.clone(),
            };
            if p.is_static {
                static_props.insert(p.name.to_string(), entry);
            } else {
                props.insert(p.name.to_string(), entry);
            }
        }
        let mut all_interfaces: Vec<Arc<str>> = parent
            .as_ref()
            .map(|p| p.interfaces.clone())
            .unwrap_or_default();
        for iface in interfaces {
            if !all_interfaces.iter().any(|i| i.eq_ignore_ascii_case(&iface)) {
                all_interfaces.push(Arc::from(iface.to_ascii_lowercase()));
            }
        }
        Class {
            name: pre.name.clone(),
            parent,
            attrs: pre.attrs,
            interfaces: all_interfaces,
            methods,
            props,
            static_props,
            constants,
        }
    }

    /// Self first, then each ancestor
    pub fn ancestry(&self) -> impl Iterator<Item = &Class> {
        std::iter::successors(Some(self), |c| c.parent.as_deref())
    }

    /// `instanceof` by name: the class itself, an ancestor or an interface
    pub fn is_subclass_of(&self, name: &str) -> bool {
        self.ancestry().any(|c| c.name.eq_ignore_ascii_case(name))
            || self.interfaces.iter().any(|i| i.eq_ignore_ascii_case(name))
    }

    /// HHVM `classof`
    pub fn classof(&self, other: &Class) -> bool {
        self.is_subclass_of(&other.name)
    }

    pub fn lookup_method(&self, name: &str) -> Option<&Arc<Func>> {
        self.methods.get(&name.to_ascii_lowercase())
    }

    pub fn get_ctor(&self) -> Option<&Arc<Func>> {
        self.lookup_method("__construct")
    }

    pub fn get_dtor(&self) -> Option<&Arc<Func>> {
        self.methods.get("__destruct")
    }

    pub fn implements_array_access(&self) -> bool {
        self.is_subclass_of("ArrayAccess")
    }

    pub fn implements_iterator(&self) -> bool {
        self.is_subclass_of("Iterator")
    }

    pub fn is_abstract(&self) -> bool {
        self.attrs.is_abstract || self.attrs.is_interface
    }

    /// A class proper: neither an interface nor a trait
    pub fn is_normal(&self) -> bool {
        !self.attrs.is_interface && !self.attrs.is_trait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pre(name: &str, parent: Option<&str>) -> PreClass {
        PreClass {
            name: Arc::from(name),
            parent: parent.map(Arc::from),
            interfaces: Vec::new(),
            attrs: ClassAttrs::default(),
            methods: Vec::new(),
            props: vec![PreProp {
                name: Arc::from(format!("p{}", name.to_lowercase())),
                visibility: Visibility::Protected,
                is_static: false,
                default_value: StaticValue::Int(1),
            }],
            constants: vec![(Arc::from(format!("K{}", name)), StaticValue::Int(2))],
        }
    }

    #[test]
    fn linking_flattens_properties_and_interfaces() {
        let a = Arc::new(Class::link(&pre("A", None), None, vec![Arc::from("ArrayAccess")]));
        let b = Class::link(&pre("B", Some("A")), Some(a.clone()), Vec::new());
        assert!(b.props.contains_key("pa"));
        assert!(b.props.contains_key("pb"));
        assert_eq!(b.props["pa"].cls.as_ref(), "A");
        assert!(b.is_subclass_of("a"));
        assert!(b.implements_array_access());
        assert!(!a.is_subclass_of("B"));
        assert_eq!(b.ancestry().count(), 2);
    }

    #[test]
    fn constants_are_inherited_and_shadowed() {
        let a = Arc::new(Class::link(&pre("A", None), None, Vec::new()));
        let mut child = pre("B", Some("A"));
        child.constants.push((Arc::from("KA"), StaticValue::Int(9)));
        let b = Class::link(&child, Some(a), Vec::new());
        assert_eq!(b.constants.get("KB"), Some(&StaticValue::Int(2)));
        assert_eq!(b.constants.get("KA"), Some(&StaticValue::Int(9)));
        assert!(b.constants.get("ka").is_none());
        assert!(b.is_normal());
    }
}
