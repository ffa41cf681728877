use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A typed column value carried from source to sink.
///
/// The variant set is deliberately small: it covers what the supported
/// sources can emit and the supported sinks can absorb. Source types without
/// a natural variant flow through as [`Value::Text`] or [`Value::Bytes`]
/// unmodified; the target store performs any final coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UnsignedInt(u64),
    Double(f64),
    /// Arbitrary-precision decimal, kept as its lossless text rendering.
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
}

impl Value {
    /// Whether this is the SQL/BSON null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Map a JSON scalar or composite into a value. Used by connectors whose
    /// wire format is JSON (broker envelopes, document change events).
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UnsignedInt(u)
                } else {
                    // f64 is the only remaining representation serde_json has
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            composite @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Value::Json(composite)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
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

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UnsignedInt(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T> From<Option<T>> for Value
where
    Value: From<T>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
