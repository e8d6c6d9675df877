use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::sync::Arc;

use crate::util::float::F64;
use crate::util::try_match;

/// A key of a keyed array. Runtime arrays only ever key by int or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrKey {
    Int(i64),
    Str(Arc<str>),
}

impl Display for ArrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A concrete runtime value: the payload of literal immediates and the
/// domain of constant folding. Arrays are scalar-only by construction
/// (object values never appear in a bytecode literal).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Val {
    Null,
    Bool(bool),
    Int(i64),
    Dbl(F64),
    Str(Arc<str>),
    List(Arc<[Val]>),
    Dict(Arc<[(ArrKey, Val)]>),
}

impl Val {
    pub fn str(s: &str) -> Self {
        Self::Str(s.into())
    }

    pub fn dbl(value: f64) -> Self {
        Self::Dbl(value.into())
    }

    pub fn is_arr(&self) -> bool {
        matches!(self, Self::List(_) | Self::Dict(_))
    }

    pub fn to_int(&self) -> Option<i64> {
        try_match!(*self, Self::Int(v) => v)
    }

    pub fn to_str(&self) -> Option<&Arc<str>> {
        try_match!(self, Self::Str(s) => s)
    }

    /// Runtime truthiness. Only the empty string and `"0"` are falsy among
    /// strings; empty arrays are falsy; every other value converts by the
    /// usual scalar rules.
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::Dbl(v) => v.to_f64() != 0.0,
            Self::Str(s) => !s.is_empty() && &**s != "0",
            Self::List(xs) => !xs.is_empty(),
            Self::Dict(kvs) => !kvs.is_empty(),
        }
    }

    /// Identity comparison. Differs from `==` in exactly one place: a NaN
    /// double is never identical to anything, itself included.
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Dbl(a), Self::Dbl(b)) => {
                !a.is_nan() && !b.is_nan() && a.to_f64() == b.to_f64()
            }
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same(vb))
            }
            _ => self == other,
        }
    }
}

impl Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Dbl(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(xs) => {
                write!(f, "list[")?;
                for (idx, x) in xs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Self::Dict(kvs) => {
                write!(f, "dict[")?;
                for (idx, (k, v)) in kvs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

enum Num {
    Int(i64),
    Dbl(f64),
}

fn to_num(v: &Val) -> Option<Num> {
    match v {
        Val::Int(v) => Some(Num::Int(*v)),
        Val::Dbl(v) => Some(Num::Dbl(v.to_f64())),
        _ => None,
    }
}

fn int_or_dbl(checked: Option<i64>, wide: f64) -> Val {
    match checked {
        Some(v) => Val::Int(v),
        None => Val::dbl(wide),
    }
}

/// `lhs + rhs`, or `None` if either operand is non-numeric (folding such an
/// addition would have to reproduce coercion notices). Integer overflow
/// widens to a double, as the runtime does.
pub fn add(lhs: &Val, rhs: &Val) -> Option<Val> {
    Some(match (to_num(lhs)?, to_num(rhs)?) {
        (Num::Int(a), Num::Int(b)) => int_or_dbl(a.checked_add(b), a as f64 + b as f64),
        (a, b) => Val::dbl(num_f64(a) + num_f64(b)),
    })
}

pub fn sub(lhs: &Val, rhs: &Val) -> Option<Val> {
    Some(match (to_num(lhs)?, to_num(rhs)?) {
        (Num::Int(a), Num::Int(b)) => int_or_dbl(a.checked_sub(b), a as f64 - b as f64),
        (a, b) => Val::dbl(num_f64(a) - num_f64(b)),
    })
}

pub fn mul(lhs: &Val, rhs: &Val) -> Option<Val> {
    Some(match (to_num(lhs)?, to_num(rhs)?) {
        (Num::Int(a), Num::Int(b)) => int_or_dbl(a.checked_mul(b), a as f64 * b as f64),
        (a, b) => Val::dbl(num_f64(a) * num_f64(b)),
    })
}

fn num_f64(n: Num) -> f64 {
    match n {
        Num::Int(v) => v as f64,
        Num::Dbl(v) => v,
    }
}

/// Division. A zero divisor raises at runtime, so it never folds.
pub fn div(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (to_num(lhs)?, to_num(rhs)?) {
        (_, Num::Int(0)) => None,
        (_, Num::Dbl(d)) if d == 0.0 => None,
        (Num::Int(a), Num::Int(b)) => Some(if a % b == 0 {
            Val::Int(a / b)
        } else {
            Val::dbl(a as f64 / b as f64)
        }),
        (a, b) => Some(Val::dbl(num_f64(a) / num_f64(b))),
    }
}

pub fn imod(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(_), Val::Int(0)) => None,
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a.wrapping_rem(*b))),
        _ => None,
    }
}

pub fn pow(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (to_num(lhs)?, to_num(rhs)?) {
        (Num::Int(a), Num::Int(b)) if b >= 0 => {
            let exp = u32::try_from(b).ok();
            Some(match exp.and_then(|e| a.checked_pow(e)) {
                Some(v) => Val::Int(v),
                None => Val::dbl((a as f64).powf(b as f64)),
            })
        }
        (a, b) => Some(Val::dbl(num_f64(a).powf(num_f64(b)))),
    }
}

pub fn bit_and(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a & b)),
        _ => None,
    }
}

pub fn bit_or(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a | b)),
        _ => None,
    }
}

pub fn bit_xor(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a ^ b)),
        _ => None,
    }
}

pub fn bit_not(v: &Val) -> Option<Val> {
    try_match!(v, Val::Int(v) => Val::Int(!v))
}

/// Shifts throw on a negative count; a count past the word width collapses
/// the way the runtime's arithmetic shift does.
pub fn shl(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(_), Val::Int(b)) if *b < 0 => None,
        (Val::Int(_), Val::Int(b)) if *b >= 64 => Some(Val::Int(0)),
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a.wrapping_shl(*b as u32))),
        _ => None,
    }
}

pub fn shr(lhs: &Val, rhs: &Val) -> Option<Val> {
    match (lhs, rhs) {
        (Val::Int(_), Val::Int(b)) if *b < 0 => None,
        (Val::Int(a), Val::Int(b)) if *b >= 64 => Some(Val::Int(if *a < 0 { -1 } else { 0 })),
        (Val::Int(a), Val::Int(b)) => Some(Val::Int(a >> (*b as u32))),
        _ => None,
    }
}

fn fully_numeric(s: &str) -> bool {
    !s.is_empty() && s.trim() == s && s.parse::<f64>().is_ok()
}

/// Loose equality, folded only where no coercion quirk can surface: values
/// of the same scalar category, int/double mixes, and byte-identical
/// strings. Numeric-looking strings stay unfolded.
pub fn loose_eq(lhs: &Val, rhs: &Val) -> Option<bool> {
    match (lhs, rhs) {
        (Val::Null, Val::Null) => Some(true),
        (Val::Bool(a), Val::Bool(b)) => Some(a == b),
        (Val::Int(a), Val::Int(b)) => Some(a == b),
        (Val::Dbl(a), Val::Dbl(b)) => Some(a.to_f64() == b.to_f64()),
        (Val::Int(a), Val::Dbl(b)) => Some(*a as f64 == b.to_f64()),
        (Val::Dbl(a), Val::Int(b)) => Some(a.to_f64() == *b as f64),
        (Val::Str(a), Val::Str(b)) => {
            if a == b {
                Some(true)
            } else if !fully_numeric(a) && !fully_numeric(b) {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

pub fn loose_cmp(lhs: &Val, rhs: &Val) -> Option<Ordering> {
    match (lhs, rhs) {
        (Val::Bool(a), Val::Bool(b)) => Some(a.cmp(b)),
        (Val::Int(a), Val::Int(b)) => Some(a.cmp(b)),
        (Val::Dbl(a), Val::Dbl(b)) => a.to_f64().partial_cmp(&b.to_f64()),
        (Val::Int(a), Val::Dbl(b)) => (*a as f64).partial_cmp(&b.to_f64()),
        (Val::Dbl(a), Val::Int(b)) => a.to_f64().partial_cmp(&(*b as f64)),
        (Val::Str(a), Val::Str(b)) if !fully_numeric(a) && !fully_numeric(b) => {
            Some(a.as_bytes().cmp(b.as_bytes()))
        }
        _ => None,
    }
}

/// A string rendering with an exact, representation-independent spelling.
/// Doubles and arrays don't qualify (float formatting is configurable at
/// runtime; array conversion raises).
fn to_display_str(v: &Val) -> Option<Arc<str>> {
    Some(match v {
        Val::Null => "".into(),
        Val::Bool(false) => "".into(),
        Val::Bool(true) => "1".into(),
        Val::Int(v) => v.to_string().into(),
        Val::Str(s) => Arc::clone(s),
        Val::Dbl(_) | Val::List(_) | Val::Dict(_) => return None,
    })
}

pub fn concat(lhs: &Val, rhs: &Val) -> Option<Val> {
    let a = to_display_str(lhs)?;
    let b = to_display_str(rhs)?;
    let mut out = String::with_capacity(a.len() + b.len());
    out.push_str(&a);
    out.push_str(&b);
    Some(Val::Str(out.into()))
}

pub fn cast_bool(v: &Val) -> Val {
    Val::Bool(v.to_bool())
}

pub fn cast_int(v: &Val) -> Option<Val> {
    Some(match v {
        Val::Null => Val::Int(0),
        Val::Bool(b) => Val::Int(*b as i64),
        Val::Int(v) => Val::Int(*v),
        Val::Dbl(d) => {
            let d = d.to_f64();
            if d.is_finite() && d >= i64::MIN as f64 && d < i64::MAX as f64 {
                Val::Int(d.trunc() as i64)
            } else {
                return None;
            }
        }
        Val::Str(s) => match s.parse::<i64>() {
            Ok(v) => Val::Int(v),
            Err(_) => return None,
        },
        Val::List(_) | Val::Dict(_) => return None,
    })
}

pub fn cast_double(v: &Val) -> Option<Val> {
    Some(match v {
        Val::Null => Val::dbl(0.0),
        Val::Bool(b) => Val::dbl(*b as i64 as f64),
        Val::Int(v) => Val::dbl(*v as f64),
        Val::Dbl(d) => Val::Dbl(*d),
        Val::Str(s) => match s.parse::<f64>() {
            Ok(v) if fully_numeric(s) => Val::dbl(v),
            _ => return None,
        },
        Val::List(_) | Val::Dict(_) => return None,
    })
}

pub fn cast_string(v: &Val) -> Option<Val> {
    to_display_str(v).map(Val::Str)
}

/// Key lookup for literal-array `AKExists` folding.
pub fn arr_has_key(arr: &Val, key: &Val) -> Option<bool> {
    let key = match key {
        Val::Int(v) => ArrKey::Int(*v),
        Val::Str(s) => ArrKey::Str(Arc::clone(s)),
        Val::Null => ArrKey::Str("".into()),
        _ => return None,
    };

    match arr {
        Val::List(xs) => Some(match key {
            ArrKey::Int(i) => i >= 0 && (i as usize) < xs.len(),
            ArrKey::Str(_) => false,
        }),
        Val::Dict(kvs) => Some(kvs.iter().any(|(k, _)| *k == key)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_overflow_widens() {
        assert_eq!(add(&Val::Int(1), &Val::Int(2)), Some(Val::Int(3)));
        assert_eq!(
            add(&Val::Int(i64::MAX), &Val::Int(1)),
            Some(Val::dbl(i64::MAX as f64 + 1.0))
        );
        assert_eq!(add(&Val::str("a"), &Val::Int(1)), None);
    }

    #[test]
    fn test_div_by_zero_does_not_fold() {
        assert_eq!(div(&Val::Int(7), &Val::Int(0)), None);
        assert_eq!(div(&Val::Int(7), &Val::dbl(0.0)), None);
        assert_eq!(div(&Val::Int(6), &Val::Int(3)), Some(Val::Int(2)));
        assert_eq!(div(&Val::Int(7), &Val::Int(2)), Some(Val::dbl(3.5)));
    }

    #[test]
    fn test_same_nan() {
        let nan = Val::dbl(f64::NAN);
        assert!(!nan.same(&nan));
        assert!(Val::Int(3).same(&Val::Int(3)));
        assert!(!Val::Int(3).same(&Val::dbl(3.0)));
    }

    #[test]
    fn test_truthiness_legacy_strings() {
        assert!(!Val::str("").to_bool());
        assert!(!Val::str("0").to_bool());
        assert!(Val::str("0.0").to_bool());
        assert!(Val::str("false").to_bool());
    }

    #[test]
    fn test_concat_exact_only() {
        assert_eq!(
            concat(&Val::str("a"), &Val::Int(3)),
            Some(Val::str("a3"))
        );
        assert_eq!(concat(&Val::str("a"), &Val::dbl(0.5)), None);
    }

    #[test]
    fn test_loose_eq_numeric_strings_unfolded() {
        assert_eq!(loose_eq(&Val::str("1"), &Val::str("01")), None);
        assert_eq!(loose_eq(&Val::str("a"), &Val::str("b")), Some(false));
        assert_eq!(loose_eq(&Val::Int(1), &Val::dbl(1.0)), Some(true));
    }

    #[test]
    fn test_cast_int() {
        assert_eq!(cast_int(&Val::str("42")), Some(Val::Int(42)));
        assert_eq!(cast_int(&Val::str("42abc")), None);
        assert_eq!(cast_int(&Val::dbl(3.9)), Some(Val::Int(3)));
        assert_eq!(cast_int(&Val::dbl(f64::NAN)), None);
    }
}
