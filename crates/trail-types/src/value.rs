//! Typed attribute values held by trackable records.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

/// Attribute name -> typed value. Ordered so diffs and snapshots are deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// Attribute name -> encoded (JSON) value, as stored in a version's `object`.
pub type EncodedAttributes = BTreeMap<String, serde_json::Value>;

/// A typed attribute value.
///
/// JSON-native variants encode as themselves; `Date`, `Timestamp` and `Custom`
/// go through a registered codec so that decoding yields the same variant back.
/// `Json` scalars are enveloped so they do not come back as `Text` or `Int`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    /// Free-form JSON (arrays, objects) stored as-is.
    Json(serde_json::Value),
    /// Application-defined value type, identified by `type_tag`.
    Custom {
        type_tag: String,
        data: serde_json::Value,
    },
}

impl Value {
    /// Tag used to look up the codec for this value.
    pub fn type_tag(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
            Value::Custom { type_tag, .. } => type_tag,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
