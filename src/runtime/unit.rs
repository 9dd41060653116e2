//! Units and function metadata
//!
//! A `Unit` is the result of loading one bytecode file: its literal tables,
//! its functions (including the pseudo-main) and its class declarations.
//! Everything here is immutable once built and is shared across requests
//! through `Arc`, so nothing in this module may hold per-request values.

use crate::core::value::{ArrayData, ArrayKey, StringData, TypedValue};
use crate::runtime::class::PreClass;
use crate::vm::engine::{VM, VmError};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Bytecode offset relative to the start of a function's code
pub type Offset = usize;

/// Entry point of a builtin
pub type NativeHandler = fn(&mut VM, args: &[TypedValue]) -> Result<TypedValue, VmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Protected => "protected",
            Visibility::Private => "private",
        }
    }
}

/// Thread-safe literal used for array literals, parameter and property defaults
#[derive(Debug, Clone, PartialEq)]
pub enum StaticValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Arc<StringData>),
    Array(Arc<Vec<(StaticValue, StaticValue)>>),
}

impl StaticValue {
    /// Materialize into a request-local value
    pub fn to_value(&self) -> TypedValue {
        match self {
            StaticValue::Null => TypedValue::Null,
            StaticValue::Bool(b) => TypedValue::Bool(*b),
            StaticValue::Int(i) => TypedValue::Int(*i),
            StaticValue::Double(d) => TypedValue::Double(*d),
            StaticValue::String(s) => TypedValue::StaticString(s.clone()),
            StaticValue::Array(elems) => {
                let mut arr = ArrayData::with_capacity(elems.len());
                for (k, v) in elems.iter() {
                    let key = k.to_value().to_array_key().unwrap_or(ArrayKey::Int(0));
                    arr.set(key, v.to_value());
                }
                TypedValue::Array(Rc::new(arr))
            }
        }
    }
}

/// Declared parameter type, checked by `VerifyParamType`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeConstraint {
    /// `array`, `self`, `parent` or a class name
    pub name: Arc<str>,
    /// Null passes as well
    pub nullable: bool,
}

impl TypeConstraint {
    pub fn is_array(&self) -> bool {
        self.name.eq_ignore_ascii_case("array")
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Arc<str>,
    pub by_ref: bool,
    /// Entry offset of the default-value initializer
    pub dv_entry: Option<Offset>,
    pub type_constraint: Option<TypeConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EhKind {
    /// Cleanup funclet run for every fault, ending in `Unwind`
    Fault { handler: Offset },
    /// Ordered `(class, handler)` pairs
    Catch { handlers: Vec<(Arc<str>, Offset)> },
}

/// Exception-handler table entry covering `[base, past)`
#[derive(Debug, Clone, PartialEq)]
pub struct EhEntry {
    pub base: Offset,
    pub past: Offset,
    pub kind: EhKind,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FuncAttrs {
    pub visibility: Visibility,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Declared by `DefFunc` when execution reaches it, not at load
    pub is_conditional: bool,
}

/// Literal tables shared by all functions of a unit
#[derive(Debug, Default)]
pub struct UnitData {
    pub filepath: Arc<str>,
    pub litstrs: Vec<Arc<StringData>>,
    pub arrays: Vec<StaticValue>,
}

impl UnitData {
    pub fn litstr(&self, id: u32) -> Result<&Arc<StringData>, VmError> {
        self.litstrs
            .get(id as usize)
            .ok_or_else(|| VmError::invalid_bytecode(0, format!("string literal {} out of range", id)))
    }
}

pub struct Func {
    pub name: Arc<str>,
    /// Declaring class, for methods
    pub cls: Option<Arc<str>>,
    pub attrs: FuncAttrs,
    pub params: Vec<Param>,
    /// Named locals; parameters come first
    pub local_names: Vec<Arc<str>>,
    pub num_iterators: usize,
    pub max_stack_cells: usize,
    pub code: Vec<u8>,
    /// `(start offset, line)` pairs sorted by offset
    pub lines: Vec<(Offset, u32)>,
    pub eh_table: Vec<EhEntry>,
    pub is_pseudo_main: bool,
    pub native: Option<NativeHandler>,
    pub unit: Arc<UnitData>,
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("name", &self.full_name())
            .field("params", &self.params.len())
            .field("locals", &self.local_names.len())
            .field("code_len", &self.code.len())
            .finish()
    }
}

impl Func {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_locals(&self) -> usize {
        self.local_names.len()
    }

    pub fn is_method(&self) -> bool {
        self.cls.is_some()
    }

    pub fn is_builtin(&self) -> bool {
        self.native.is_some()
    }

    /// `C::m` for methods, `f` for functions
    pub fn full_name(&self) -> String {
        match &self.cls {
            Some(cls) => format!("{}::{}", cls, self.name),
            None => self.name.to_string(),
        }
    }

    /// Slot of a named local
    pub fn lookup_var_id(&self, name: &[u8]) -> Option<usize> {
        self.local_names.iter().position(|n| n.as_bytes() == name)
    }

    pub fn by_ref(&self, param: usize) -> bool {
        self.params.get(param).is_some_and(|p| p.by_ref)
    }

    pub fn line_for(&self, offset: Offset) -> u32 {
        match self.lines.binary_search_by(|(start, _)| start.cmp(&offset)) {
            Ok(i) => self.lines[i].1,
            Err(0) => 0,
            Err(i) => self.lines[i - 1].1,
        }
    }

    /// Innermost handler region containing `offset`
    pub fn find_eh(&self, offset: Offset) -> Option<usize> {
        self.eh_table
            .iter()
            .enumerate()
            .filter(|(_, e)| e.base <= offset && offset < e.past)
            // equal spans: the region opened later is the inner one
            .min_by(|(i, a), (j, b)| (a.past - a.base).cmp(&(b.past - b.base)).then(j.cmp(i)))
            .map(|(i, _)| i)
    }
}

/// Loaded bytecode file
#[derive(Debug)]
pub struct Unit {
    pub data: Arc<UnitData>,
    pub main: Arc<Func>,
    pub funcs: Vec<Arc<Func>>,
    pub classes: Vec<PreClass>,
}

impl Unit {
    pub fn filepath(&self) -> &str {
        &self.data.filepath
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func_with_eh(eh_table: Vec<EhEntry>) -> Func {
        Func {
            name: Arc::from("f"),
            cls: None,
            attrs: FuncAttrs::default(),
            params: Vec::new(),
            local_names: vec![Arc::from("a"), Arc::from("b")],
            num_iterators: 0,
            max_stack_cells: 0,
            code: vec![0; 64],
            lines: vec![(0, 3), (10, 4), (20, 7)],
            eh_table,
            is_pseudo_main: false,
            native: None,
            unit: Arc::new(UnitData::default()),
        }
    }

    #[test]
    fn find_eh_prefers_innermost_region() {
        let func = func_with_eh(vec![
            EhEntry {
                base: 0,
                past: 40,
                kind: EhKind::Fault { handler: 50 },
                parent: None,
            },
            EhEntry {
                base: 5,
                past: 15,
                kind: EhKind::Catch {
                    handlers: vec![(Arc::from("Exception"), 45)],
                },
                parent: Some(0),
            },
        ]);
        assert_eq!(func.find_eh(7), Some(1));
        assert_eq!(func.find_eh(20), Some(0));
        assert_eq!(func.find_eh(40), None);
    }

    #[test]
    fn line_table_lookup() {
        let func = func_with_eh(Vec::new());
        assert_eq!(func.line_for(0), 3);
        assert_eq!(func.line_for(12), 4);
        assert_eq!(func.line_for(63), 7);
        assert_eq!(func.lookup_var_id(b"b"), Some(1));
    }

    #[test]
    fn static_array_materializes_with_canonical_keys() {
        let lit = StaticValue::Array(Arc::new(vec![
            (StaticValue::String(Arc::new(b"1".to_vec())), StaticValue::Int(10)),
            (StaticValue::String(Arc::new(b"k".to_vec())), StaticValue::Bool(true)),
        ]));
        let TypedValue::Array(arr) = lit.to_value() else {
            panic!("Expected array");
        };
        assert_eq!(arr.get(&ArrayKey::Int(1)), Some(&TypedValue::Int(10)));
        assert_eq!(arr.next_free, 2);
    }
}
