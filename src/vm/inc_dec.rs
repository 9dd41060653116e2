//! Increment/Decrement operations for PHP values
//!
//! Shared by `IncDecL/N/G/S` and the member form `IncDecM`. The helpers
//! take the cell by reference and leave the new value in place; the
//! instruction's result (new value for pre-ops, old value for post-ops)
//! is returned.
//!
//! Reference: $PHP_SRC_PATH/Zend/zend_operators.c - increment_function/decrement_function

use crate::core::value::{Numeric, TypedValue, is_numeric_string};
use crate::vm::opcode::IncDecOp;

/// Apply `op` to the cell, returning the instruction's result
pub fn inc_dec_cell(op: IncDecOp, cell: &mut TypedValue) -> TypedValue {
    let old = cell.to_cell();
    let new = if op.is_inc() {
        increment_value(&old)
    } else {
        decrement_value(&old)
    };
    cell.set_cell(new.clone());
    if op.is_pre() { new } else { old.into_cell_or_null() }
}

/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - increment_function
pub fn increment_value(val: &TypedValue) -> TypedValue {
    match val {
        // INT: increment by 1, overflow to double
        TypedValue::Int(i) => match i.checked_add(1) {
            Some(n) => TypedValue::Int(n),
            None => TypedValue::Double(*i as f64 + 1.0),
        },
        TypedValue::Double(d) => TypedValue::Double(d + 1.0),
        // NULL: becomes 1
        TypedValue::Uninit | TypedValue::Null => TypedValue::Int(1),
        TypedValue::StaticString(_) | TypedValue::String(_) => {
            increment_string(val.str_bytes().unwrap_or_default())
        }
        TypedValue::Ref(r) => increment_value(&r.borrow()),
        // bools, arrays and objects are left alone
        other => other.clone(),
    }
}

/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - decrement_function
pub fn decrement_value(val: &TypedValue) -> TypedValue {
    match val {
        TypedValue::Int(i) => match i.checked_sub(1) {
            Some(n) => TypedValue::Int(n),
            None => TypedValue::Double(*i as f64 - 1.0),
        },
        TypedValue::Double(d) => TypedValue::Double(d - 1.0),
        // NULL-- stays null
        TypedValue::Uninit | TypedValue::Null => TypedValue::Null,
        TypedValue::StaticString(_) | TypedValue::String(_) => {
            let s = val.str_bytes().unwrap_or_default();
            if s.is_empty() {
                return TypedValue::Int(-1);
            }
            match is_numeric_string(s) {
                Some(Numeric::Int(i)) => decrement_value(&TypedValue::Int(i)),
                Some(Numeric::Double(d)) => TypedValue::Double(d - 1.0),
                // non-numeric strings are not decremented
                _ => val.clone(),
            }
        }
        TypedValue::Ref(r) => decrement_value(&r.borrow()),
        other => other.clone(),
    }
}

/// Perl-style string increment: "a" -> "b", "Az" -> "Ba", "zz" -> "aaa"
/// Reference: $PHP_SRC_PATH/Zend/zend_operators.c - increment_string
fn increment_string(s: &[u8]) -> TypedValue {
    if s.is_empty() {
        return TypedValue::string("1");
    }
    match is_numeric_string(s) {
        Some(Numeric::Int(i)) => return increment_value(&TypedValue::Int(i)),
        Some(Numeric::Double(d)) => return TypedValue::Double(d + 1.0),
        _ => {}
    }

    #[derive(Clone, Copy)]
    enum Kind {
        Lower,
        Upper,
        Digit,
    }

    let mut out = s.to_vec();
    let mut last = None;
    let mut pos = out.len();
    while pos > 0 {
        pos -= 1;
        let c = out[pos];
        let (kind, wrapped) = match c {
            b'a'..=b'z' => (Kind::Lower, c == b'z'),
            b'A'..=b'Z' => (Kind::Upper, c == b'Z'),
            b'0'..=b'9' => (Kind::Digit, c == b'9'),
            _ => {
                last = None;
                break;
            }
        };
        last = Some(kind);
        if !wrapped {
            out[pos] = c + 1;
            return TypedValue::string(out);
        }
        out[pos] = match kind {
            Kind::Lower => b'a',
            Kind::Upper => b'A',
            Kind::Digit => b'0',
        };
    }
    // carried past the first alphanumeric
    let prefix = match last {
        Some(Kind::Lower) => b'a',
        Some(Kind::Upper) => b'A',
        Some(Kind::Digit) => b'1',
        None => return TypedValue::string(out),
    };
    out.insert(pos, prefix);
    TypedValue::string(out)
}

trait IntoCellOrNull {
    fn into_cell_or_null(self) -> TypedValue;
}

impl IntoCellOrNull for TypedValue {
    /// Post-ops on an undefined slot report null, not uninit
    fn into_cell_or_null(self) -> TypedValue {
        if self.is_uninit() { TypedValue::Null } else { self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> TypedValue {
        TypedValue::string(v)
    }

    #[test]
    fn increments_numbers_and_null() {
        assert_eq!(increment_value(&TypedValue::Int(1)), TypedValue::Int(2));
        assert_eq!(
            increment_value(&TypedValue::Int(i64::MAX)),
            TypedValue::Double(i64::MAX as f64 + 1.0)
        );
        assert_eq!(increment_value(&TypedValue::Null), TypedValue::Int(1));
        assert_eq!(decrement_value(&TypedValue::Null), TypedValue::Null);
        assert_eq!(increment_value(&TypedValue::Bool(true)), TypedValue::Bool(true));
    }

    #[test]
    fn perl_style_string_increment() {
        assert_eq!(increment_value(&s("a")), s("b"));
        assert_eq!(increment_value(&s("Az")), s("Ba"));
        assert_eq!(increment_value(&s("zz")), s("aaa"));
        assert_eq!(increment_value(&s("a9")), s("b0"));
        assert_eq!(increment_value(&s("Zz")), s("AAa"));
        assert_eq!(increment_value(&s("")), s("1"));
        assert_eq!(increment_value(&s("41")), TypedValue::Int(42));
    }

    #[test]
    fn string_decrement_only_touches_numbers() {
        assert_eq!(decrement_value(&s("abc")), s("abc"));
        assert_eq!(decrement_value(&s("")), TypedValue::Int(-1));
        assert_eq!(decrement_value(&s("1.5")), TypedValue::Double(0.5));
    }

    #[test]
    fn pre_and_post_results() {
        let mut cell = TypedValue::Int(5);
        assert_eq!(inc_dec_cell(IncDecOp::PostInc, &mut cell), TypedValue::Int(5));
        assert_eq!(cell, TypedValue::Int(6));
        assert_eq!(inc_dec_cell(IncDecOp::PreDec, &mut cell), TypedValue::Int(5));
        let mut undefined = TypedValue::Uninit;
        assert_eq!(inc_dec_cell(IncDecOp::PostInc, &mut undefined), TypedValue::Null);
        assert_eq!(undefined, TypedValue::Int(1));
    }
}
