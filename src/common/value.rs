//! Values stored in the Dht.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ValueRepr", into = "ValueRepr")]
/// A value that can be stored in the Dht.
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Bytes),
}

/// Bencode has no floats or booleans, so every value travels as a single
/// key dictionary tagged with its kind.
#[derive(Serialize, Deserialize)]
enum ValueRepr {
    #[serde(rename = "i")]
    Int(i64),
    /// IEEE 754 bits.
    #[serde(rename = "f")]
    Float(i64),
    #[serde(rename = "b")]
    Bool(i64),
    #[serde(rename = "s")]
    Str(String),
    #[serde(rename = "x")]
    Bytes(serde_bytes::ByteBuf),
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Float(bits) => Value::Float(f64::from_bits(bits as u64)),
            ValueRepr::Bool(b) => Value::Bool(b != 0),
            ValueRepr::Str(s) => Value::Str(s),
            ValueRepr::Bytes(b) => Value::Bytes(b.into_vec().into()),
        }
    }
}

impl From<Value> for ValueRepr {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(i) => ValueRepr::Int(i),
            Value::Float(f) => ValueRepr::Float(f.to_bits() as i64),
            Value::Bool(b) => ValueRepr::Bool(i64::from(b)),
            Value::Str(s) => ValueRepr::Str(s),
            Value::Bytes(b) => ValueRepr::Bytes(serde_bytes::ByteBuf::from(b.to_vec())),
        }
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{b:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A [Value] in local storage, with its time to live.
pub struct StoredValue {
    pub value: Value,
    #[serde(default)]
    pub ttl: Option<Duration>,
    pub stored_at: SystemTime,
}

impl StoredValue {
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            ttl,
            stored_at: SystemTime::now(),
        }
    }

    /// Time since this value was stored.
    ///
    /// Zero if the system clock went backwards.
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed().unwrap_or_default()
    }

    /// Returns true if the time to live has elapsed.
    pub fn outdated(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.age() > ttl,
            None => false,
        }
    }
}
