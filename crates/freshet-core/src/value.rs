//! Runtime values for event payloads and materialized views.

use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Map type used for structured values (insertion-ordered, fast hashing).
pub type ValueMap = IndexMap<String, Value, FxBuildHasher>;

/// A dynamically-typed runtime value.
///
/// Events carry a `Value` payload; aggregation results and joined records are
/// stored in the state store as `Value::Map`s so the store stays agnostic of
/// what it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Build a map value from key/value pairs.
    pub fn map_from(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut map = IndexMap::with_hasher(FxBuildHasher);
        for (k, v) in entries {
            map.insert(k, v);
        }
        Value::Map(map)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Field lookup on map values; `None` for every other variant.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Float(3.7).as_int(), Some(3));
        assert_eq!(Value::Str("3".into()).as_int(), None);
    }

    #[test]
    fn test_map_get() {
        let v = Value::map_from([
            ("qty".to_string(), Value::Int(3)),
            ("price".to_string(), Value::Float(9.99)),
        ]);
        assert_eq!(v.get("qty"), Some(&Value::Int(3)));
        assert_eq!(v.get("missing"), None);
        assert_eq!(Value::Int(1).get("qty"), None);
    }

    #[test]
    fn test_display() {
        let v = Value::map_from([("a".to_string(), Value::Int(1))]);
        assert_eq!(v.to_string(), "{a: 1}");
        assert_eq!(Value::Array(vec![Value::Bool(true)]).to_string(), "[true]");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_serde_untagged_roundtrip() {
        let v = Value::map_from([
            ("n".to_string(), Value::Int(42)),
            ("s".to_string(), Value::Str("hi".into())),
        ]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("n"), Some(&Value::Int(42)));
        assert_eq!(back.get("s").and_then(|s| s.as_str()), Some("hi"));
    }
}
