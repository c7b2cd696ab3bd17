//! Typed setting values
//!
//! Every setting carries one of three value kinds. Conversion from text is
//! total for strings and fallible for the numeric kinds; the textual form is
//! what ends up in the settings document.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Declared type of a setting, stored on disk as a single-letter code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "i")]
    Integer,
    #[serde(rename = "f")]
    Float,
    #[serde(rename = "s")]
    String,
}

impl ValueType {
    /// Parse a type code (`i`, `f` or `s`)
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Integer),
            "f" => Some(Self::Float),
            "s" => Some(Self::String),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Integer => "i",
            Self::Float => "f",
            Self::String => "s",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::String)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Runtime type of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Integer(_) => ValueType::Integer,
            Self::Float(_) => ValueType::Float,
            Self::String(_) => ValueType::String,
        }
    }

    /// Parse text into a value of the given type; floats must be finite
    pub fn parse(value_type: ValueType, text: &str) -> Option<Self> {
        match value_type {
            ValueType::Integer => text.trim().parse().ok().map(Self::Integer),
            ValueType::Float => text
                .trim()
                .parse()
                .ok()
                .filter(|f: &f64| f.is_finite())
                .map(Self::Float),
            ValueType::String => Some(Self::String(text.to_string())),
        }
    }

    /// Convert this value to another type.
    ///
    /// Floats truncate toward zero when converted to integers; strings go
    /// through [`Value::parse`]. Anything converts to a string.
    pub fn convert(&self, value_type: ValueType) -> Option<Self> {
        match (self, value_type) {
            (Self::Integer(i), ValueType::Integer) => Some(Self::Integer(*i)),
            (Self::Integer(i), ValueType::Float) => Some(Self::Float(*i as f64)),
            (Self::Float(f), ValueType::Integer) => {
                let truncated = f.trunc();
                if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
                    Some(Self::Integer(truncated as i64))
                } else {
                    None
                }
            }
            (Self::Float(f), ValueType::Float) => f.is_finite().then_some(Self::Float(*f)),
            (Self::String(s), ty) => Self::parse(ty, s),
            (v, ValueType::String) => Some(Self::String(v.to_string())),
        }
    }

    /// Build a value from a JSON scalar. Booleans become 0/1.
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            serde_json::Value::Bool(b) => Some(Self::Integer(i64::from(*b))),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// True for numeric zero (the unbounded sentinel)
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Integer(i) => *i == 0,
            Self::Float(f) => *f == 0.0,
            Self::String(_) => false,
        }
    }

    /// Numeric ordering; mixed integer/float pairs compare as floats.
    /// Strings are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Whole floats keep a trailing `.0` so the document stays unambiguous
fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}
