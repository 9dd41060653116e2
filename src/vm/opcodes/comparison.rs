//! Comparison operations
//!
//! Implements PHP comparison operations following Zend semantics.
//!
//! ## PHP Semantics
//!
//! PHP supports two types of equality:
//! - **Loose equality** (`==`): Compares after type juggling
//! - **Strict equality** (`===`): Compares types and values
//!
//! Type juggling rules for comparisons:
//! - Numeric strings compared as numbers
//! - Boolean comparisons convert to bool first
//! - null compared with a string compares against `""`
//! - Arrays compared by length, then key-by-key
//! - Objects of the same class compare property-wise
//!
//! ## Operations
//!
//! - **Eq / Neq**: `$a == $b`, `$a != $b`
//! - **Same / NSame**: `$a === $b`, `$a !== $b`
//! - **Lt / Lte / Gt / Gte**: ordering comparisons
//! - **Not / Xor**: boolean logic
//! - **InstanceOf / InstanceOfD**: class relationship
//!
//! ## References
//!
//! - HHVM: `runtime/vm/bytecode.cpp` - iopEq, iopSame, iopLt, iopInstanceOf
//! - Zend: `$PHP_SRC_PATH/Zend/zend_operators.c` - compare_function

use crate::core::value::{Numeric, TypedValue, is_numeric_string};
use crate::vm::engine::{VM, VmError};
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;

impl VM {
    fn binary_cmp(&mut self, f: impl FnOnce(&TypedValue, &TypedValue) -> bool) -> Result<(), VmError> {
        let (left, right) = self.pop_binary_cells()?;
        self.push(TypedValue::Bool(f(&left, &right)));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopSame, iopNSame
    #[inline]
    pub(crate) fn exec_same(&mut self, negate: bool) -> Result<(), VmError> {
        self.binary_cmp(|a, b| php_same(a, b) != negate)
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopEq, iopNeq
    #[inline]
    pub(crate) fn exec_eq(&mut self, negate: bool) -> Result<(), VmError> {
        self.binary_cmp(|a, b| php_loose_equals(a, b) != negate)
    }

    #[inline]
    pub(crate) fn exec_lt(&mut self) -> Result<(), VmError> {
        self.binary_cmp(|a, b| php_compare(a, b) == Some(Ordering::Less))
    }

    #[inline]
    pub(crate) fn exec_lte(&mut self) -> Result<(), VmError> {
        self.binary_cmp(|a, b| matches!(php_compare(a, b), Some(Ordering::Less | Ordering::Equal)))
    }

    #[inline]
    pub(crate) fn exec_gt(&mut self) -> Result<(), VmError> {
        self.binary_cmp(|a, b| php_compare(b, a) == Some(Ordering::Less))
    }

    #[inline]
    pub(crate) fn exec_gte(&mut self) -> Result<(), VmError> {
        self.binary_cmp(|a, b| matches!(php_compare(b, a), Some(Ordering::Less | Ordering::Equal)))
    }

    #[inline]
    pub(crate) fn exec_not(&mut self) -> Result<(), VmError> {
        let value = self.pop_c()?;
        self.push(TypedValue::Bool(!value.to_bool()));
        Ok(())
    }

    /// Logical xor
    #[inline]
    pub(crate) fn exec_xor(&mut self) -> Result<(), VmError> {
        self.binary_cmp(|a, b| a.to_bool() ^ b.to_bool())
    }

    /// `$obj instanceof $cls` with the class given as a cell: a class
    /// reference, a name, or another object
    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopInstanceOf
    pub(crate) fn exec_instance_of(&mut self) -> Result<(), VmError> {
        let (value, cls) = self.pop_binary_cells()?;
        let result = match (&value, &cls) {
            (TypedValue::Object(obj), TypedValue::Class(c)) => obj.class.classof(c),
            (TypedValue::Object(obj), TypedValue::Object(other)) => obj.class.classof(&other.class),
            (TypedValue::Object(obj), name) if name.is_string() => {
                obj.instance_of(&String::from_utf8_lossy(name.str_bytes().unwrap_or_default()))
            }
            _ => false,
        };
        self.push(TypedValue::Bool(result));
        Ok(())
    }

    /// Reference: HHVM `runtime/vm/bytecode.cpp` - iopInstanceOfD
    #[inline]
    pub(crate) fn exec_instance_of_d(&mut self, class_name: &[u8]) -> Result<(), VmError> {
        let value = self.pop_c()?;
        let result = match value {
            TypedValue::Object(obj) => obj.instance_of(&String::from_utf8_lossy(class_name)),
            _ => false,
        };
        self.push(TypedValue::Bool(result));
        Ok(())
    }
}

/// Strict equality (===)
/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - zend_is_identical
pub(crate) fn php_same(a: &TypedValue, b: &TypedValue) -> bool {
    let (a, b) = (a.to_cell(), b.to_cell());
    match (&a, &b) {
        (TypedValue::Array(x), TypedValue::Array(y)) => {
            Rc::ptr_eq(x, y)
                || (x.len() == y.len()
                    && x.map
                        .iter()
                        .zip(y.map.iter())
                        .all(|((kx, vx), (ky, vy))| kx == ky && php_same(vx, vy)))
        }
        (TypedValue::Uninit | TypedValue::Null, TypedValue::Uninit | TypedValue::Null) => true,
        _ => a == b,
    }
}

/// Loose equality (==) with type juggling
/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - zend_compare
pub(crate) fn php_loose_equals(a: &TypedValue, b: &TypedValue) -> bool {
    let (a, b) = (a.to_cell(), b.to_cell());
    match (&a, &b) {
        (TypedValue::Object(x), TypedValue::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            if !Arc::ptr_eq(&x.class, &y.class) && x.class.name != y.class.name {
                return false;
            }
            let (px, py) = (x.props.borrow(), y.props.borrow());
            px.len() == py.len()
                && px
                    .iter()
                    .all(|(k, v)| py.get(k).is_some_and(|w| php_loose_equals(v, w)))
        }
        (TypedValue::Array(x), TypedValue::Array(y)) => {
            x.len() == y.len()
                && x.map
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| php_loose_equals(v, w)))
        }
        _ => php_compare(&a, &b) == Some(Ordering::Equal),
    }
}

fn cmp_f64(x: f64, y: f64) -> Option<Ordering> {
    x.partial_cmp(&y)
}

fn cmp_numbers(x: Numeric, y: Numeric) -> Option<Ordering> {
    match (x, y) {
        (Numeric::Int(i), Numeric::Int(j)) => Some(i.cmp(&j)),
        (Numeric::Int(i), Numeric::Double(d)) => cmp_f64(i as f64, d),
        (Numeric::Double(d), Numeric::Int(j)) => cmp_f64(d, j as f64),
        (Numeric::Double(d), Numeric::Double(e)) => cmp_f64(d, e),
        _ => None,
    }
}

/// Ordering used by `<`, `<=`, `>`, `>=` and `==`; `None` when the
/// operands are uncomparable
/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - compare_function
pub(crate) fn php_compare(a: &TypedValue, b: &TypedValue) -> Option<Ordering> {
    use TypedValue::*;
    let (a, b) = (a.to_cell(), b.to_cell());
    match (&a, &b) {
        (Bool(_), _) | (_, Bool(_)) => Some(a.to_bool().cmp(&b.to_bool())),
        (Uninit | Null, Uninit | Null) => Some(Ordering::Equal),
        (Uninit | Null, s) | (s, Uninit | Null) if s.is_string() => {
            let (x, y) = (a.to_string_bytes(), b.to_string_bytes());
            Some(x.cmp(&y))
        }
        (Uninit | Null, _) | (_, Uninit | Null) => Some(a.to_bool().cmp(&b.to_bool())),
        (x, y) if x.is_string() && y.is_string() => {
            let (sx, sy) = (x.str_bytes().unwrap_or_default(), y.str_bytes().unwrap_or_default());
            match (is_numeric_string(sx), is_numeric_string(sy)) {
                (Some(nx), Some(ny)) => cmp_numbers(nx, ny),
                _ => Some(sx.cmp(sy)),
            }
        }
        (Int(_) | Double(_), _) | (_, Int(_) | Double(_))
            if !matches!(a, Array(_) | Object(_)) && !matches!(b, Array(_) | Object(_)) =>
        {
            cmp_numbers(a.to_number(), b.to_number())
        }
        (Array(x), Array(y)) => {
            if x.len() != y.len() {
                return Some(x.len().cmp(&y.len()));
            }
            for (k, v) in x.map.iter() {
                let w = y.get(k)?;
                match php_compare(v, w)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(Ordering::Equal)
        }
        // arrays are always greater than other types
        (Array(_), _) => Some(Ordering::Greater),
        (_, Array(_)) => Some(Ordering::Less),
        (Object(x), Object(y)) => {
            if php_loose_equals(&a, &b) {
                Some(Ordering::Equal)
            } else if Arc::ptr_eq(&x.class, &y.class) {
                let (px, py) = (x.props.borrow(), y.props.borrow());
                for (k, v) in px.iter() {
                    let w = py.get(k)?;
                    match php_compare(v, w)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(px.len().cmp(&py.len()))
            } else {
                None
            }
        }
        (Object(_), _) => Some(Ordering::Greater),
        (_, Object(_)) => Some(Ordering::Less),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ArrayData;

    fn s(v: &str) -> TypedValue {
        TypedValue::string(v)
    }

    #[test]
    fn loose_equality_juggles() {
        assert!(php_loose_equals(&s("10"), &TypedValue::Int(10)));
        assert!(php_loose_equals(&s("1e1"), &s("10")));
        assert!(!php_loose_equals(&s("abc"), &s("ABC")));
        assert!(php_loose_equals(&TypedValue::Null, &s("")));
        assert!(php_loose_equals(&TypedValue::Bool(true), &s("x")));
        assert!(php_loose_equals(&TypedValue::Int(0), &s("0.0")));
    }

    #[test]
    fn strict_equality_checks_types_and_order() {
        assert!(!php_same(&TypedValue::Int(1), &TypedValue::Double(1.0)));
        assert!(php_same(&s("a"), &TypedValue::StaticString(std::sync::Arc::new(b"a".to_vec()))));

        let mut a = ArrayData::new();
        a.append(TypedValue::Int(1));
        a.append(TypedValue::Int(2));
        let mut b = ArrayData::new();
        b.set(crate::core::value::ArrayKey::Int(1), TypedValue::Int(2));
        b.set(crate::core::value::ArrayKey::Int(0), TypedValue::Int(1));
        let (a, b) = (TypedValue::Array(Rc::new(a)), TypedValue::Array(Rc::new(b)));
        assert!(php_loose_equals(&a, &b));
        assert!(!php_same(&a, &b));
    }

    #[test]
    fn ordering() {
        assert_eq!(php_compare(&TypedValue::Int(1), &TypedValue::Double(1.5)), Some(Ordering::Less));
        assert_eq!(php_compare(&s("b"), &s("a")), Some(Ordering::Greater));
        assert_eq!(php_compare(&s("9"), &s("10")), Some(Ordering::Less));
        assert_eq!(php_compare(&TypedValue::Null, &TypedValue::Int(-1)), Some(Ordering::Less));
        assert_eq!(php_compare(&TypedValue::empty_array(), &TypedValue::Int(5)), Some(Ordering::Greater));
    }

    #[test]
    fn objects_of_one_class_compare_by_props() {
        use crate::core::value::ObjectData;
        use crate::runtime::class::{Class, ClassAttrs, PreClass};

        let pre = PreClass {
            name: Arc::from("P"),
            parent: None,
            interfaces: Vec::new(),
            attrs: ClassAttrs::default(),
            methods: Vec::new(),
            props: Vec::new(),
            constants: Vec::new(),
        };
        let cls = Arc::new(Class::link(&pre, None, Vec::new()));
        let obj = |n: i64| {
            let o = ObjectData::new(cls.clone());
            o.set_prop(b"n", TypedValue::Int(n));
            TypedValue::Object(o)
        };
        let (one, also_one, two) = (obj(1), obj(1), obj(2));
        assert!(php_loose_equals(&one, &also_one));
        assert!(!php_same(&one, &also_one));
        assert_eq!(php_compare(&one, &two), Some(Ordering::Less));
        assert_eq!(php_compare(&two, &one), Some(Ordering::Greater));
    }
}
