use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::api::CalcError;

/// A number produced by the interpreter.
///
/// Integer arithmetic stays exact until an operation cannot be represented as
/// an `i64` result (inexact division, float operand); then it promotes to `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Exact integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
}

impl Value {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Value::Int(v) => v == 0,
            Value::Float(v) => v == 0.0,
        }
    }

    pub(crate) fn neg(self) -> Result<Value, CalcError> {
        match self {
            Value::Int(v) => v.checked_neg().map(Value::Int).ok_or(CalcError::Overflow),
            Value::Float(v) => Ok(Value::Float(-v)),
        }
    }

    pub(crate) fn add(self, rhs: Value) -> Result<Value, CalcError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_add(b).map(Value::Int).ok_or(CalcError::Overflow)
            }
            (a, b) => Ok(Value::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub(crate) fn sub(self, rhs: Value) -> Result<Value, CalcError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_sub(b).map(Value::Int).ok_or(CalcError::Overflow)
            }
            (a, b) => Ok(Value::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub(crate) fn mul(self, rhs: Value) -> Result<Value, CalcError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_mul(b).map(Value::Int).ok_or(CalcError::Overflow)
            }
            (a, b) => Ok(Value::Float(a.as_f64() * b.as_f64())),
        }
    }

    pub(crate) fn div(self, rhs: Value) -> Result<Value, CalcError> {
        if rhs.is_zero() {
            return Err(CalcError::DivisionByZero);
        }
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => match a.checked_rem(b) {
                Some(0) => a.checked_div(b).map(Value::Int).ok_or(CalcError::Overflow),
                Some(_) => Ok(Value::Float(a as f64 / b as f64)),
                None => Err(CalcError::Overflow),
            },
            (a, b) => Ok(Value::Float(a.as_f64() / b.as_f64())),
        }
    }

    pub(crate) fn rem(self, rhs: Value) -> Result<Value, CalcError> {
        if rhs.is_zero() {
            return Err(CalcError::DivisionByZero);
        }
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_rem(b).map(Value::Int).ok_or(CalcError::Overflow)
            }
            (a, b) => Ok(Value::Float(a.as_f64() % b.as_f64())),
        }
    }

    pub(crate) fn pow(self, rhs: Value) -> Result<Value, CalcError> {
        match (self, rhs) {
            (Value::Int(base), Value::Int(exp)) if exp >= 0 => {
                let exp = u32::try_from(exp).map_err(|_| CalcError::Overflow)?;
                base.checked_pow(exp).map(Value::Int).ok_or(CalcError::Overflow)
            }
            (a, b) => Ok(Value::Float(a.as_f64().powf(b.as_f64()))),
        }
    }

    /// Render the value with at most `precision` fractional digits for floats.
    ///
    /// Trailing zeros are trimmed, so `3.5` stays `3.5` and `2.0` prints as `2`.
    pub fn display(self, precision: usize) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) if !v.is_finite() => v.to_string(),
            Value::Float(v) => {
                let mut out = String::new();
                let _ = write!(out, "{v:.precision$}");
                if out.contains('.') {
                    let trimmed = out.trim_end_matches('0').trim_end_matches('.');
                    out.truncate(trimmed.len());
                }
                if out == "-0" {
                    out = "0".to_string();
                }
                out
            }
        }
    }
}
