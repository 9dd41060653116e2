//! Tagged value representation
//!
//! `TypedValue` is the unit of storage on the evaluation stack, in frame
//! locals, array elements and object properties.
//!
//! ## Ownership
//!
//! Heap payloads (strings, arrays, objects, boxed cells) are reference
//! counted through `Rc`. Copying a value into a new slot is `clone()`
//! (an increment), overwriting a slot releases the old payload at that
//! exact point, and moving a value out of a slot without touching the
//! count is `std::mem::take` (the slot is left `Uninit`).
//!
//! Integers, booleans, doubles, null and uninit carry no count.
//! Static strings point into a unit's literal table and are never
//! mutated in place.
//!
//! ## Cells and Vars
//!
//! A *cell* is any value other than `Ref`. A *var* is a `Ref`, a boxed cell
//! shared by every binding that aliases it (`&$x`). The referent of a `Ref`
//! is always a cell.
//!
//! ## References
//!
//! - HHVM: `runtime/base/types.h` (TypedValue, DataType)
//! - PHP: `Zend/zend_operators.c` (conversion rules)

use crate::runtime::class::Class;
use indexmap::IndexMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

pub type StringData = Vec<u8>;
pub type PropName = Rc<[u8]>;

/// Discriminant of a `TypedValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Uninit,
    Null,
    Boolean,
    Int64,
    Double,
    StaticString,
    String,
    Array,
    Object,
    Ref,
    Class,
}

#[derive(Debug, Clone, Default)]
pub enum TypedValue {
    #[default]
    Uninit,
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    StaticString(Arc<StringData>),
    String(Rc<StringData>),
    Array(Rc<ArrayData>),
    Object(Rc<ObjectData>),
    Ref(Rc<RefData>),
    Class(Arc<Class>),
}

/// Boxed cell shared by reference bindings
#[derive(Debug, Default)]
pub struct RefData {
    cell: RefCell<TypedValue>,
}

impl RefData {
    pub fn new(value: TypedValue) -> Rc<Self> {
        debug_assert!(!value.is_ref(), "boxed cell must not hold a ref");
        Rc::new(Self {
            cell: RefCell::new(value),
        })
    }

    /// Copy of the referent
    pub fn get(&self) -> TypedValue {
        self.cell.borrow().clone()
    }

    /// Store a cell; a box that is already being written through keeps its
    /// current value
    pub fn set(&self, value: TypedValue) {
        if let Ok(mut cell) = self.cell.try_borrow_mut() {
            let old = std::mem::replace(&mut *cell, value);
            drop(cell);
            drop(old);
        }
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, TypedValue> {
        self.cell.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, TypedValue> {
        self.cell.borrow_mut()
    }

    pub fn try_borrow_mut(&self) -> Option<std::cell::RefMut<'_, TypedValue>> {
        self.cell.try_borrow_mut().ok()
    }
}

/// Array key; integer-like string keys are canonicalized to `Int`
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum ArrayKey {
    Int(i64),
    Str(Rc<Vec<u8>>),
}

impl ArrayKey {
    /// Build a key from a string, turning strictly-integer strings into ints
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match is_strictly_integer(bytes) {
            Some(i) => ArrayKey::Int(i),
            None => ArrayKey::Str(Rc::new(bytes.to_vec())),
        }
    }

    pub fn to_value(&self) -> TypedValue {
        match self {
            ArrayKey::Int(i) => TypedValue::Int(*i),
            ArrayKey::Str(s) => TypedValue::String(s.clone()),
        }
    }

    pub fn to_display(&self) -> String {
        match self {
            ArrayKey::Int(i) => i.to_string(),
            ArrayKey::Str(s) => String::from_utf8_lossy(s).into_owned(),
        }
    }
}

/// Ordered hash map with PHP append semantics
/// Reference: $PHP_SRC_PATH/Zend/zend_hash.h - HashTable::nNextFreeElement
#[derive(Debug, Clone, Default)]
pub struct ArrayData {
    pub map: IndexMap<ArrayKey, TypedValue>,
    pub next_free: i64,
}

impl ArrayData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: IndexMap::with_capacity(capacity),
            next_free: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&TypedValue> {
        self.map.get(key)
    }

    pub fn exists(&self, key: &ArrayKey) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or overwrite, keeping `next_free` ahead of integer keys
    pub fn set(&mut self, key: ArrayKey, value: TypedValue) {
        if let ArrayKey::Int(i) = &key {
            if *i >= self.next_free {
                self.next_free = i.wrapping_add(1);
            }
        }
        match self.map.get_mut(&key) {
            Some(slot) => slot.assign(value),
            None => {
                self.map.insert(key, value);
            }
        }
    }

    /// Slot for `key`, inserting null when missing
    pub fn lval(&mut self, key: ArrayKey) -> &mut TypedValue {
        if let ArrayKey::Int(i) = &key {
            if *i >= self.next_free {
                self.next_free = i.wrapping_add(1);
            }
        }
        self.map.entry(key).or_insert(TypedValue::Null)
    }

    /// Slot for `key` only if present
    pub fn lval_existing(&mut self, key: &ArrayKey) -> Option<&mut TypedValue> {
        self.map.get_mut(key)
    }

    /// Append with the next integer key; `None` when the key space is exhausted
    pub fn append(&mut self, value: TypedValue) -> Option<ArrayKey> {
        if self.next_free == i64::MAX {
            return None;
        }
        let key = ArrayKey::Int(self.next_free);
        self.next_free += 1;
        self.map.insert(key.clone(), value);
        Some(key)
    }

    /// Remove preserving insertion order of the remaining elements
    pub fn remove(&mut self, key: &ArrayKey) -> Option<TypedValue> {
        self.map.shift_remove(key)
    }

    pub fn key_at(&self, pos: usize) -> Option<&ArrayKey> {
        self.map.get_index(pos).map(|(k, _)| k)
    }

    pub fn entry_at(&self, pos: usize) -> Option<(&ArrayKey, &TypedValue)> {
        self.map.get_index(pos)
    }

    pub fn entry_at_mut(&mut self, pos: usize) -> Option<(&ArrayKey, &mut TypedValue)> {
        self.map.get_index_mut(pos)
    }
}

impl PartialEq for ArrayData {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

static NEXT_OBJECT_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

/// Instance of a class
pub struct ObjectData {
    pub id: u32,
    pub class: Arc<Class>,
    pub props: RefCell<IndexMap<PropName, TypedValue>>,
    /// Set when the constructor faulted; the destructor must not run
    pub no_destruct: Cell<bool>,
    /// Native state of builtin classes (a continuation's frame)
    pub internal: Option<Rc<dyn Any>>,
}

impl ObjectData {
    /// Instantiate with the class's declared property defaults
    pub fn new(class: Arc<Class>) -> Rc<Self> {
        Self::build(class, None)
    }

    /// Instance of a builtin class carrying native state
    pub fn with_internal(class: Arc<Class>, internal: Rc<dyn Any>) -> Rc<Self> {
        Self::build(class, Some(internal))
    }

    fn build(class: Arc<Class>, internal: Option<Rc<dyn Any>>) -> Rc<Self> {
        let props = class
            .props
            .iter()
            .map(|(name, entry)| (PropName::from(name.as_bytes()), entry.default_value.to_value()))
            .collect();
        Rc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            class,
            props: RefCell::new(props),
            no_destruct: Cell::new(false),
            internal,
        })
    }

    pub fn internal<T: 'static>(&self) -> Option<&T> {
        self.internal.as_ref().and_then(|i| i.downcast_ref::<T>())
    }

    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn instance_of(&self, class_name: &str) -> bool {
        self.class.is_subclass_of(class_name)
    }

    pub fn get_prop(&self, name: &[u8]) -> Option<TypedValue> {
        self.props.borrow().get(name).cloned()
    }

    /// Assign a property, writing through a reference binding
    pub fn set_prop(&self, name: &[u8], value: TypedValue) {
        let mut props = self.props.borrow_mut();
        match props.get_mut(name) {
            Some(slot) => slot.set_cell(value),
            None => {
                props.insert(PropName::from(name), value);
            }
        }
    }

    /// Shallow copy; property values are copied with reference bindings preserved
    pub fn clone_object(&self) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            class: self.class.clone(),
            props: RefCell::new(self.props.borrow().clone()),
            no_destruct: Cell::new(false),
            internal: None,
        })
    }
}

/// State of an object whose last reference went away while its class
/// declares `__destruct`
pub struct PendingDestruct {
    pub id: u32,
    pub class: Arc<Class>,
    pub props: IndexMap<PropName, TypedValue>,
}

impl PendingDestruct {
    /// Rebuild an instance for the destructor call; it is never queued again
    pub fn revive(self) -> Rc<ObjectData> {
        Rc::new(ObjectData {
            id: self.id,
            class: self.class,
            props: RefCell::new(self.props),
            no_destruct: Cell::new(true),
            internal: None,
        })
    }
}

thread_local! {
    static PENDING_DESTRUCTS: RefCell<Vec<PendingDestruct>> = const { RefCell::new(Vec::new()) };
}

impl Drop for ObjectData {
    fn drop(&mut self) {
        if self.no_destruct.get() || self.class.get_dtor().is_none() {
            return;
        }
        let pending = PendingDestruct {
            id: self.id,
            class: self.class.clone(),
            props: std::mem::take(self.props.get_mut()),
        };
        // the queue is gone during thread teardown; the object just dies
        let _ = PENDING_DESTRUCTS.try_with(|queue| {
            if let Ok(mut queue) = queue.try_borrow_mut() {
                queue.push(pending);
            }
        });
    }
}

pub fn has_pending_destructs() -> bool {
    PENDING_DESTRUCTS
        .try_with(|queue| queue.try_borrow().is_ok_and(|q| !q.is_empty()))
        .unwrap_or(false)
}

/// Drain the queue in release order
pub fn take_pending_destructs() -> Vec<PendingDestruct> {
    PENDING_DESTRUCTS
        .try_with(|queue| queue.try_borrow_mut().map(|mut q| std::mem::take(&mut *q)).unwrap_or_default())
        .unwrap_or_default()
}

/// Put entries back at the front of the queue
pub fn requeue_pending_destructs(mut rest: Vec<PendingDestruct>) {
    if rest.is_empty() {
        return;
    }
    let _ = PENDING_DESTRUCTS.try_with(|queue| {
        if let Ok(mut queue) = queue.try_borrow_mut() {
            rest.append(&mut queue);
            *queue = rest;
        }
    });
}

/// Forget queued destructors without running them
pub fn discard_pending_destructs() {
    // property values may release further objects into the queue
    while has_pending_destructs() {
        drop(take_pending_destructs());
    }
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectData")
            .field("id", &self.id)
            .field("class", &self.class.name)
            .field("props", &self.props.borrow().len())
            .finish()
    }
}

impl PartialEq for TypedValue {
    /// Structural equality; objects, refs and classes compare by identity
    fn eq(&self, other: &Self) -> bool {
        use TypedValue::*;
        match (self, other) {
            (Uninit, Uninit) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (StaticString(_) | String(_), StaticString(_) | String(_)) => {
                self.str_bytes() == other.str_bytes()
            }
            (Array(a), Array(b)) => Rc::ptr_eq(a, b) || a == b,
            (Object(a), Object(b)) => Rc::ptr_eq(a, b),
            (Ref(a), Ref(b)) => Rc::ptr_eq(a, b),
            (Class(a), Class(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl TypedValue {
    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        TypedValue::String(Rc::new(bytes.into()))
    }

    pub fn empty_array() -> Self {
        TypedValue::Array(Rc::new(ArrayData::new()))
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TypedValue::Uninit => DataType::Uninit,
            TypedValue::Null => DataType::Null,
            TypedValue::Bool(_) => DataType::Boolean,
            TypedValue::Int(_) => DataType::Int64,
            TypedValue::Double(_) => DataType::Double,
            TypedValue::StaticString(_) => DataType::StaticString,
            TypedValue::String(_) => DataType::String,
            TypedValue::Array(_) => DataType::Array,
            TypedValue::Object(_) => DataType::Object,
            TypedValue::Ref(_) => DataType::Ref,
            TypedValue::Class(_) => DataType::Class,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TypedValue::Uninit | TypedValue::Null => "null",
            TypedValue::Bool(_) => "boolean",
            TypedValue::Int(_) => "integer",
            TypedValue::Double(_) => "double",
            TypedValue::StaticString(_) | TypedValue::String(_) => "string",
            TypedValue::Array(_) => "array",
            TypedValue::Object(_) => "object",
            TypedValue::Ref(r) => r.borrow().type_name(),
            TypedValue::Class(_) => "class",
        }
    }

    #[inline]
    pub fn is_uninit(&self) -> bool {
        matches!(self, TypedValue::Uninit)
    }

    /// Null or uninit
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Uninit | TypedValue::Null)
    }

    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, TypedValue::Ref(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, TypedValue::StaticString(_) | TypedValue::String(_))
    }

    /// Whether the payload is reference counted
    pub fn is_refcounted(&self) -> bool {
        matches!(
            self,
            TypedValue::String(_) | TypedValue::Array(_) | TypedValue::Object(_) | TypedValue::Ref(_)
        )
    }

    /// Count held on the payload, 0 for primitives and static strings
    pub fn refcount(&self) -> usize {
        match self {
            TypedValue::String(s) => Rc::strong_count(s),
            TypedValue::Array(a) => Rc::strong_count(a),
            TypedValue::Object(o) => Rc::strong_count(o),
            TypedValue::Ref(r) => Rc::strong_count(r),
            _ => 0,
        }
    }

    pub fn str_bytes(&self) -> Option<&[u8]> {
        match self {
            TypedValue::StaticString(s) => Some(s.as_slice()),
            TypedValue::String(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<ObjectData>> {
        match self {
            TypedValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Rc<ArrayData>> {
        match self {
            TypedValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// The cell this value denotes, copying through a boxed cell
    pub fn to_cell(&self) -> TypedValue {
        match self {
            TypedValue::Ref(r) => r.get(),
            other => other.clone(),
        }
    }

    /// Consume, producing a cell
    pub fn into_cell(self) -> TypedValue {
        match self {
            TypedValue::Ref(r) => r.get(),
            other => other,
        }
    }

    /// Box in place when needed, returning the shared cell
    pub fn box_in_place(&mut self) -> Rc<RefData> {
        if let TypedValue::Ref(r) = self {
            return r.clone();
        }
        let mut inner = std::mem::take(self);
        if inner.is_uninit() {
            inner = TypedValue::Null;
        }
        let r = RefData::new(inner);
        *self = TypedValue::Ref(r.clone());
        r
    }

    /// Overwrite the slot, releasing whatever it held
    #[inline]
    pub fn assign(&mut self, value: TypedValue) {
        let old = std::mem::replace(self, value);
        drop(old);
    }

    /// Store a cell, writing through a boxed cell if the slot holds one
    pub fn set_cell(&mut self, value: TypedValue) {
        debug_assert!(!value.is_ref());
        match self {
            TypedValue::Ref(r) => r.set(value),
            slot => slot.assign(value),
        }
    }

    /// Run `f` on the cell this slot denotes
    pub fn with_cell_mut<R>(&mut self, f: impl FnOnce(&mut TypedValue) -> R) -> R {
        match self {
            TypedValue::Ref(r) => {
                let r = r.clone();
                match r.try_borrow_mut() {
                    Some(mut inner) => f(&mut inner),
                    None => f(&mut TypedValue::Null),
                }
            }
            slot => f(slot),
        }
    }

    pub fn with_cell<R>(&self, f: impl FnOnce(&TypedValue) -> R) -> R {
        match self {
            TypedValue::Ref(r) => f(&r.borrow()),
            cell => f(cell),
        }
    }

    /// PHP truthiness
    /// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - zend_is_true
    pub fn to_bool(&self) -> bool {
        match self {
            TypedValue::Uninit | TypedValue::Null => false,
            TypedValue::Bool(b) => *b,
            TypedValue::Int(i) => *i != 0,
            TypedValue::Double(d) => *d != 0.0,
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                let s = self.str_bytes().unwrap_or_default();
                !(s.is_empty() || s == b"0")
            }
            TypedValue::Array(a) => !a.is_empty(),
            TypedValue::Object(_) | TypedValue::Class(_) => true,
            TypedValue::Ref(r) => r.borrow().to_bool(),
        }
    }

    /// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - convert_to_long
    pub fn to_int(&self) -> i64 {
        match self {
            TypedValue::Uninit | TypedValue::Null => 0,
            TypedValue::Bool(b) => *b as i64,
            TypedValue::Int(i) => *i,
            TypedValue::Double(d) => double_to_int(*d),
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                match parse_numeric_prefix(self.str_bytes().unwrap_or_default()) {
                    Numeric::Int(i) => i,
                    Numeric::Double(d) => double_to_int(d),
                    Numeric::None => 0,
                }
            }
            TypedValue::Array(a) => !a.is_empty() as i64,
            TypedValue::Object(_) | TypedValue::Class(_) => 1,
            TypedValue::Ref(r) => r.borrow().to_int(),
        }
    }

    /// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - convert_to_double
    pub fn to_double(&self) -> f64 {
        match self {
            TypedValue::Uninit | TypedValue::Null => 0.0,
            TypedValue::Bool(b) => *b as i64 as f64,
            TypedValue::Int(i) => *i as f64,
            TypedValue::Double(d) => *d,
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                match parse_numeric_prefix(self.str_bytes().unwrap_or_default()) {
                    Numeric::Int(i) => i as f64,
                    Numeric::Double(d) => d,
                    Numeric::None => 0.0,
                }
            }
            TypedValue::Array(a) => !a.is_empty() as i64 as f64,
            TypedValue::Object(_) | TypedValue::Class(_) => 1.0,
            TypedValue::Ref(r) => r.borrow().to_double(),
        }
    }

    /// String conversion without notices
    /// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - zend_make_printable_zval
    pub fn to_string_bytes(&self) -> Vec<u8> {
        match self {
            TypedValue::Uninit | TypedValue::Null => Vec::new(),
            TypedValue::Bool(true) => b"1".to_vec(),
            TypedValue::Bool(false) => Vec::new(),
            TypedValue::Int(i) => i.to_string().into_bytes(),
            TypedValue::Double(d) => format_double(*d).into_bytes(),
            TypedValue::StaticString(s) => s.to_vec(),
            TypedValue::String(s) => s.to_vec(),
            TypedValue::Array(_) => b"Array".to_vec(),
            TypedValue::Object(o) => format!("Object id #{}", o.id).into_bytes(),
            TypedValue::Class(c) => c.name.as_bytes().to_vec(),
            TypedValue::Ref(r) => r.borrow().to_string_bytes(),
        }
    }

    /// Shared string payload, copying only when the value is not already a string
    pub fn to_string_value(&self) -> TypedValue {
        match self {
            TypedValue::StaticString(_) | TypedValue::String(_) => self.clone(),
            TypedValue::Ref(r) => r.borrow().to_string_value(),
            other => TypedValue::string(other.to_string_bytes()),
        }
    }

    /// Convert to an array key the way array access does; `None` for
    /// arrays and objects ("Illegal offset type")
    pub fn to_array_key(&self) -> Option<ArrayKey> {
        match self {
            TypedValue::Uninit | TypedValue::Null => Some(ArrayKey::Str(Rc::new(Vec::new()))),
            TypedValue::Bool(b) => Some(ArrayKey::Int(*b as i64)),
            TypedValue::Int(i) => Some(ArrayKey::Int(*i)),
            TypedValue::Double(d) => Some(ArrayKey::Int(double_to_int(*d))),
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                Some(ArrayKey::from_bytes(self.str_bytes().unwrap_or_default()))
            }
            TypedValue::Ref(r) => r.borrow().to_array_key(),
            TypedValue::Array(_) | TypedValue::Object(_) | TypedValue::Class(_) => None,
        }
    }

    /// Whether arithmetic would treat the value as numeric
    pub fn is_numeric(&self) -> bool {
        match self {
            TypedValue::Int(_) | TypedValue::Double(_) => true,
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                is_numeric_string(self.str_bytes().unwrap_or_default()).is_some()
            }
            TypedValue::Ref(r) => r.borrow().is_numeric(),
            _ => false,
        }
    }

    /// Int or double reading of a scalar for arithmetic
    pub fn to_number(&self) -> Numeric {
        match self {
            TypedValue::Int(i) => Numeric::Int(*i),
            TypedValue::Double(d) => Numeric::Double(*d),
            TypedValue::StaticString(_) | TypedValue::String(_) => {
                match parse_numeric_prefix(self.str_bytes().unwrap_or_default()) {
                    Numeric::None => Numeric::Int(0),
                    n => n,
                }
            }
            TypedValue::Ref(r) => r.borrow().to_number(),
            other => Numeric::Int(other.to_int()),
        }
    }
}

/// Numeric reading of a value or string
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Double(f64),
    None,
}

impl Numeric {
    pub fn into_value(self) -> TypedValue {
        match self {
            Numeric::Int(i) => TypedValue::Int(i),
            Numeric::Double(d) => TypedValue::Double(d),
            Numeric::None => TypedValue::Int(0),
        }
    }
}

/// PHP double to int conversion (out of range wraps to i64::MIN)
pub fn double_to_int(d: f64) -> i64 {
    if d.is_nan() || d.is_infinite() || d >= 9.2233720368547758e18 || d < -9.2233720368547758e18 {
        i64::MIN
    } else {
        d as i64
    }
}

pub fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "NAN".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{:.0}", d)
    } else {
        let s = format!("{:.14}", d);
        let s = s.trim_end_matches('0').trim_end_matches('.');
        s.to_string()
    }
}

/// Canonical decimal integer: optional '-', no leading zeros, fits in i64
/// Reference: HHVM `StringData::isStrictlyInteger`
pub fn is_strictly_integer(s: &[u8]) -> Option<i64> {
    let digits = match s.first() {
        Some(b'-') => &s[1..],
        Some(_) => s,
        None => return None,
    };
    if digits.is_empty() || digits.len() > 19 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits[0] == b'0' && (digits.len() > 1 || s[0] == b'-') {
        return None;
    }
    std::str::from_utf8(s).ok()?.parse::<i64>().ok()
}

/// Whole-string numeric check allowing surrounding whitespace
pub fn is_numeric_string(s: &[u8]) -> Option<Numeric> {
    let trimmed = trim_ascii(s);
    if trimmed.is_empty() {
        return None;
    }
    let text = std::str::from_utf8(trimmed).ok()?;
    if let Ok(i) = text.parse::<i64>() {
        return Some(Numeric::Int(i));
    }
    if text.bytes().any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E') {
        return None;
    }
    text.parse::<f64>().ok().map(Numeric::Double)
}

/// Leading numeric prefix, as `(int)"12abc"` reads it
/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - strtol semantics
pub fn parse_numeric_prefix(s: &[u8]) -> Numeric {
    let s = match s.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &s[start..],
        None => return Numeric::None,
    };
    let mut end = 0;
    if matches!(s.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_start = end;
    while end < s.len() && s[end].is_ascii_digit() {
        end += 1;
    }
    let mut is_double = false;
    if end < s.len() && s[end] == b'.' {
        let mut frac = end + 1;
        while frac < s.len() && s[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 || end > int_start {
            is_double = frac > end + 1;
            end = frac;
        }
    }
    if end == int_start {
        return Numeric::None;
    }
    if end < s.len() && (s[end] == b'e' || s[end] == b'E') {
        let mut exp = end + 1;
        if matches!(s.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        if s.get(exp).is_some_and(u8::is_ascii_digit) {
            while exp < s.len() && s[exp].is_ascii_digit() {
                exp += 1;
            }
            end = exp;
            is_double = true;
        }
    }
    let text = match std::str::from_utf8(&s[..end]) {
        Ok(t) => t,
        Err(_) => return Numeric::None,
    };
    let text = text.trim_end_matches('.');
    if !is_double {
        if let Ok(i) = text.parse::<i64>() {
            return Numeric::Int(i);
        }
    }
    text.parse::<f64>()
        .map(Numeric::Double)
        .unwrap_or(Numeric::None)
}

fn trim_ascii(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |e| e + 1);
    &s[start..end]
}
