use crate::error::HyperpowerError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "FLOAT")]
    Float,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Int => f.write_str("INT"),
            ParamKind::Float => f.write_str("FLOAT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }

    /// Element 0 of a list suggestion, or a bare number.
    pub fn from_suggestion(kind: ParamKind, raw: &Value) -> Result<Self> {
        let scalar = match raw {
            Value::Array(items) => items
                .first()
                .ok_or_else(|| anyhow!("empty value list in optimizer suggestion"))?,
            other => other,
        };
        let number = match scalar {
            Value::Number(n) => n,
            other => return Err(anyhow!("optimizer suggestion is not numeric: {}", other)),
        };
        match kind {
            ParamKind::Int => match number.as_i64() {
                Some(v) => Ok(ParamValue::Int(v)),
                None => number
                    .as_f64()
                    .map(|v| ParamValue::Int(v.round() as i64))
                    .ok_or_else(|| anyhow!("integer suggestion out of range: {}", number)),
            },
            ParamKind::Float => number
                .as_f64()
                .map(ParamValue::Float)
                .ok_or_else(|| anyhow!("float suggestion out of range: {}", number)),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => {
                let text = v.to_string();
                if v.is_finite() && !text.contains('.') {
                    write!(f, "{}.0", text)
                } else {
                    f.write_str(&text)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transform {
    Multiply(i64),
    Log(u32),
    NegExp(f64),
}

impl Transform {
    pub fn parse(code: &str) -> Result<Self, HyperpowerError> {
        let invalid = |reason: &str| HyperpowerError::InvalidTransform {
            code: code.to_string(),
            reason: reason.to_string(),
        };
        if let Some(base) = code.strip_prefix("NEGEXP") {
            let base: f64 = base
                .parse()
                .map_err(|_| invalid("NEGEXP base must be a number"))?;
            if !(base.is_finite() && base > 0.0) {
                return Err(invalid("NEGEXP base must be positive"));
            }
            Ok(Transform::NegExp(base))
        } else if let Some(base) = code.strip_prefix("LOG") {
            let base: u32 = base
                .parse()
                .map_err(|_| invalid("LOG base must be a positive integer"))?;
            if base < 2 {
                return Err(invalid("LOG base must be at least 2"));
            }
            Ok(Transform::Log(base))
        } else if let Some(factor) = code.strip_prefix('X') {
            let factor: i64 = factor
                .parse()
                .map_err(|_| invalid("X multiplier must be a positive integer"))?;
            if factor < 1 {
                return Err(invalid("X multiplier must be positive"));
            }
            Ok(Transform::Multiply(factor))
        } else {
            Err(invalid("expected X<n>, LOG<b> or NEGEXP<b>"))
        }
    }

    pub fn code(&self) -> String {
        match self {
            Transform::Multiply(n) => format!("X{}", n),
            Transform::Log(b) => format!("LOG{}", b),
            Transform::NegExp(b) => format!("NEGEXP{}", b),
        }
    }

    /// `LOG<b>` takes the logarithm of the raw value, not `b^raw`.
    pub fn apply(&self, raw: ParamValue) -> Result<ParamValue> {
        match (*self, raw) {
            (Transform::Multiply(n), ParamValue::Int(v)) => v
                .checked_mul(n)
                .map(ParamValue::Int)
                .ok_or_else(|| anyhow!("X{} overflows for value {}", n, v)),
            (Transform::Multiply(n), ParamValue::Float(v)) => Ok(ParamValue::Float(v * n as f64)),
            (Transform::Log(base), value) => {
                let v = value.as_f64();
                if v <= 0.0 {
                    return Err(anyhow!("LOG{} is undefined for value {}", base, v));
                }
                Ok(ParamValue::Float(v.log(base as f64)))
            }
            (Transform::NegExp(base), value) => Ok(ParamValue::Float(base.powf(-value.as_f64()))),
        }
    }
}

pub fn apply_transform(transform: Option<&Transform>, raw: ParamValue) -> Result<ParamValue> {
    match transform {
        Some(t) => t.apply(raw),
        None => Ok(raw),
    }
}

impl TryFrom<String> for Transform {
    type Error = HyperpowerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Transform::parse(&value)
    }
}

impl From<Transform> for String {
    fn from(value: Transform) -> Self {
        value.code()
    }
}
