//! Binary operators shared by the arithmetic opcodes and compound assignment
//!
//! `Add`, `Concat`, `BitAnd`... and every `SetOp*` form (`$a += 1`,
//! `$a[k] .= "x"`, `$o->p <<= 2`) funnel into [`VM::binary_op`], so the
//! coercion and warning rules live in one place.
//!
//! Reference: $PHP_SRC_PATH/Zend/zend_operators.c - add_function and friends

use crate::core::value::{Numeric, TypedValue, double_to_int};
use crate::vm::engine::{VM, VmError};
use crate::vm::opcode::SetOpOp;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl From<SetOpOp> for BinaryOp {
    fn from(op: SetOpOp) -> Self {
        match op {
            SetOpOp::PlusEqual => BinaryOp::Add,
            SetOpOp::MinusEqual => BinaryOp::Sub,
            SetOpOp::MulEqual => BinaryOp::Mul,
            SetOpOp::DivEqual => BinaryOp::Div,
            SetOpOp::ConcatEqual => BinaryOp::Concat,
            SetOpOp::ModEqual => BinaryOp::Mod,
            SetOpOp::AndEqual => BinaryOp::BitAnd,
            SetOpOp::OrEqual => BinaryOp::BitOr,
            SetOpOp::XorEqual => BinaryOp::BitXor,
            SetOpOp::SlEqual => BinaryOp::Shl,
            SetOpOp::SrEqual => BinaryOp::Shr,
        }
    }
}

/// Integer op with overflow to double, the way `+ - *` behave
fn int_or_double(
    a: i64,
    b: i64,
    checked: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> TypedValue {
    match checked(a, b) {
        Some(n) => TypedValue::Int(n),
        None => TypedValue::Double(float(a as f64, b as f64)),
    }
}

fn numeric_pair(left: &TypedValue, right: &TypedValue) -> (Numeric, Numeric) {
    (left.to_number(), right.to_number())
}

fn as_double(n: Numeric) -> f64 {
    match n {
        Numeric::Int(i) => i as f64,
        Numeric::Double(d) => d,
        Numeric::None => 0.0,
    }
}

/// Bytewise `& | ^` over two strings, truncated (`&`, `^`) or padded (`|`)
fn string_bitwise(op: BinaryOp, a: &[u8], b: &[u8]) -> TypedValue {
    let out: Vec<u8> = match op {
        BinaryOp::BitOr => {
            let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
            long.iter()
                .enumerate()
                .map(|(i, c)| c | short.get(i).copied().unwrap_or(0))
                .collect()
        }
        BinaryOp::BitAnd => a.iter().zip(b).map(|(x, y)| x & y).collect(),
        _ => a.iter().zip(b).map(|(x, y)| x ^ y).collect(),
    };
    TypedValue::string(out)
}

impl VM {
    /// Apply a binary operator with PHP coercions
    pub(crate) fn binary_op(
        &mut self,
        op: BinaryOp,
        left: &TypedValue,
        right: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        let left = left.to_cell();
        let right = right.to_cell();
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => self.arith(op, &left, &right),
            BinaryOp::Div => {
                let (a, b) = numeric_pair(&left, &right);
                if as_double(b) == 0.0 {
                    self.raise_warning("Division by zero")?;
                    return Ok(TypedValue::Bool(false));
                }
                Ok(match (a, b) {
                    (Numeric::Int(x), Numeric::Int(y)) if y != -1 && x % y == 0 => {
                        TypedValue::Int(x / y)
                    }
                    (Numeric::Int(x), Numeric::Int(-1)) if x != i64::MIN => TypedValue::Int(-x),
                    _ => TypedValue::Double(as_double(a) / as_double(b)),
                })
            }
            BinaryOp::Mod => {
                let b = right.to_int();
                if b == 0 {
                    self.raise_warning("Division by zero")?;
                    return Ok(TypedValue::Bool(false));
                }
                // i64::MIN % -1 overflows in hardware; the answer is 0
                Ok(TypedValue::Int(left.to_int().wrapping_rem(b)))
            }
            BinaryOp::Concat => {
                let mut out = left.to_string_bytes();
                out.extend_from_slice(&right.to_string_bytes());
                Ok(TypedValue::String(Rc::new(out)))
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                if let (Some(a), Some(b)) = (left.str_bytes(), right.str_bytes()) {
                    return Ok(string_bitwise(op, a, b));
                }
                let (a, b) = (left.to_int(), right.to_int());
                Ok(TypedValue::Int(match op {
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    _ => a ^ b,
                }))
            }
            BinaryOp::Shl => Ok(TypedValue::Int(
                left.to_int().wrapping_shl(right.to_int() as u32),
            )),
            BinaryOp::Shr => Ok(TypedValue::Int(
                left.to_int().wrapping_shr(right.to_int() as u32),
            )),
        }
    }

    fn arith(
        &mut self,
        op: BinaryOp,
        left: &TypedValue,
        right: &TypedValue,
    ) -> Result<TypedValue, VmError> {
        match (left, right) {
            (TypedValue::Array(a), TypedValue::Array(b)) if op == BinaryOp::Add => {
                // Array union: keys of the left operand win
                if b.is_empty() {
                    return Ok(left.clone());
                }
                let mut result = (**a).clone();
                for (k, v) in b.map.iter() {
                    if !result.exists(k) {
                        result.set(k.clone(), v.clone());
                    }
                }
                return Ok(TypedValue::Array(Rc::new(result)));
            }
            (TypedValue::Array(_), _) | (_, TypedValue::Array(_)) => {
                return Err(VmError::fatal("Unsupported operand types"));
            }
            _ => {}
        }
        let (a, b) = numeric_pair(left, right);
        Ok(match (a, b) {
            (Numeric::Int(x), Numeric::Int(y)) => match op {
                BinaryOp::Add => int_or_double(x, y, i64::checked_add, |p, q| p + q),
                BinaryOp::Sub => int_or_double(x, y, i64::checked_sub, |p, q| p - q),
                _ => int_or_double(x, y, i64::checked_mul, |p, q| p * q),
            },
            _ => {
                let (x, y) = (as_double(a), as_double(b));
                TypedValue::Double(match op {
                    BinaryOp::Add => x + y,
                    BinaryOp::Sub => x - y,
                    _ => x * y,
                })
            }
        })
    }

    /// `~$x`
    pub(crate) fn bit_not(&self, value: &TypedValue) -> Result<TypedValue, VmError> {
        match value.to_cell() {
            TypedValue::Int(i) => Ok(TypedValue::Int(!i)),
            TypedValue::Double(d) => Ok(TypedValue::Int(!double_to_int(d))),
            v if v.is_string() => Ok(TypedValue::string(
                v.str_bytes()
                    .unwrap_or_default()
                    .iter()
                    .map(|b| !b)
                    .collect::<Vec<u8>>(),
            )),
            _ => Err(VmError::fatal("Unsupported operand type for ~")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::EngineBuilder;
    use std::sync::Arc;

    fn vm() -> VM {
        VM::new(Arc::new(EngineBuilder::new().with_prelude().build().unwrap()))
    }

    #[test]
    fn integer_overflow_becomes_double() {
        let mut vm = vm();
        let r = vm
            .binary_op(BinaryOp::Add, &TypedValue::Int(i64::MAX), &TypedValue::Int(1))
            .unwrap();
        assert_eq!(r, TypedValue::Double(i64::MAX as f64 + 1.0));
        let r = vm
            .binary_op(BinaryOp::Mul, &TypedValue::Int(6), &TypedValue::string("7"))
            .unwrap();
        assert_eq!(r, TypedValue::Int(42));
    }

    #[test]
    fn division_stays_integral_when_exact() {
        let mut vm = vm();
        let exact = vm.binary_op(BinaryOp::Div, &TypedValue::Int(9), &TypedValue::Int(3));
        assert_eq!(exact.unwrap(), TypedValue::Int(3));
        let frac = vm.binary_op(BinaryOp::Div, &TypedValue::Int(1), &TypedValue::Int(2));
        assert_eq!(frac.unwrap(), TypedValue::Double(0.5));
        let zero = vm.binary_op(BinaryOp::Mod, &TypedValue::Int(1), &TypedValue::Int(0));
        assert_eq!(zero.unwrap(), TypedValue::Bool(false));
    }

    #[test]
    fn string_bitwise_and_concat() {
        let mut vm = vm();
        let r = vm
            .binary_op(BinaryOp::BitOr, &TypedValue::string("a"), &TypedValue::string("  "))
            .unwrap();
        assert_eq!(r, TypedValue::string("a "));
        let r = vm
            .binary_op(BinaryOp::Concat, &TypedValue::Int(1), &TypedValue::Double(2.5))
            .unwrap();
        assert_eq!(r, TypedValue::string("12.5"));
        assert!(vm.bit_not(&TypedValue::empty_array()).is_err());
    }
}
