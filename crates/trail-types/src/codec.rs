//! Value codecs: typed attribute value <-> stored JSON.

use crate::{Attributes, EncodedAttributes, Value};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;

const TYPE_KEY: &str = "$type";
const VALUE_KEY: &str = "$value";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode {type_tag} value: {reason}")]
    Encode { type_tag: String, reason: String },
    #[error("cannot decode {type_tag} value: {reason}")]
    Decode { type_tag: String, reason: String },
}

/// Encodes one kind of value to JSON and back.
///
/// `encode` produces the inner payload only; the registry adds the type envelope
/// for non-native values.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError>;
    fn decode(&self, type_tag: &str, raw: &serde_json::Value) -> Result<Value, CodecError>;
}

/// Codec for values that JSON represents natively.
pub struct PassThroughCodec;

impl ValueCodec for PassThroughCodec {
    fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| CodecError::Encode {
                    type_tag: "float".to_string(),
                    reason: format!("non-finite float {}", f),
                })?,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Json(j) => j.clone(),
            Value::Custom { data, .. } => data.clone(),
            other => {
                return Err(CodecError::Encode {
                    type_tag: other.type_tag().to_string(),
                    reason: "no pass-through representation".to_string(),
                })
            }
        })
    }

    fn decode(&self, type_tag: &str, raw: &serde_json::Value) -> Result<Value, CodecError> {
        if type_tag == "json" {
            return Ok(Value::Json(raw.clone()));
        }
        if !is_native_tag(type_tag) {
            return Ok(Value::Custom {
                type_tag: type_tag.to_string(),
                data: raw.clone(),
            });
        }
        Ok(match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        })
    }
}

/// `date` values as ISO-8601 calendar dates.
pub struct DateCodec;

impl ValueCodec for DateCodec {
    fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Date(d) => Ok(serde_json::Value::String(d.format("%Y-%m-%d").to_string())),
            other => Err(mismatch("date", other)),
        }
    }

    fn decode(&self, type_tag: &str, raw: &serde_json::Value) -> Result<Value, CodecError> {
        let s = raw.as_str().ok_or_else(|| CodecError::Decode {
            type_tag: type_tag.to_string(),
            reason: "expected a string".to_string(),
        })?;
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| CodecError::Decode {
                type_tag: type_tag.to_string(),
                reason: e.to_string(),
            })
    }
}

/// `timestamp` values as RFC 3339 with full sub-second precision.
pub struct TimestampCodec;

impl ValueCodec for TimestampCodec {
    fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Timestamp(t) => Ok(serde_json::Value::String(
                t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            )),
            other => Err(mismatch("timestamp", other)),
        }
    }

    fn decode(&self, type_tag: &str, raw: &serde_json::Value) -> Result<Value, CodecError> {
        let s = raw.as_str().ok_or_else(|| CodecError::Decode {
            type_tag: type_tag.to_string(),
            reason: "expected a string".to_string(),
        })?;
        DateTime::parse_from_rfc3339(s)
            .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
            .map_err(|e| CodecError::Decode {
                type_tag: type_tag.to_string(),
                reason: e.to_string(),
            })
    }
}

fn mismatch(expected: &str, got: &Value) -> CodecError {
    CodecError::Encode {
        type_tag: expected.to_string(),
        reason: format!("got a {} value", got.type_tag()),
    }
}

fn is_native_tag(tag: &str) -> bool {
    matches!(tag, "null" | "bool" | "int" | "float" | "text" | "json")
}

/// Type tag -> codec. Tags without a registered codec fall back to pass-through.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn ValueCodec>>,
    fallback: Arc<dyn ValueCodec>,
}

impl CodecRegistry {
    /// Registry with the built-in `date` and `timestamp` codecs.
    pub fn new() -> Self {
        let mut codecs: HashMap<String, Arc<dyn ValueCodec>> = HashMap::new();
        codecs.insert("date".to_string(), Arc::new(DateCodec));
        codecs.insert("timestamp".to_string(), Arc::new(TimestampCodec));
        Self {
            codecs,
            fallback: Arc::new(PassThroughCodec),
        }
    }

    /// Register (or replace) the codec for a custom type tag.
    pub fn register(&mut self, type_tag: impl Into<String>, codec: Arc<dyn ValueCodec>) {
        self.codecs.insert(type_tag.into(), codec);
    }

    fn codec_for(&self, tag: &str) -> &Arc<dyn ValueCodec> {
        self.codecs.get(tag).unwrap_or(&self.fallback)
    }

    pub fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
        let tag = value.type_tag();
        let payload = self.codec_for(tag).encode(value)?;
        if is_native_tag(tag) && !needs_json_envelope(value, &payload) {
            return Ok(payload);
        }
        let mut envelope = serde_json::Map::new();
        envelope.insert(TYPE_KEY.to_string(), serde_json::Value::String(tag.to_string()));
        envelope.insert(VALUE_KEY.to_string(), payload);
        Ok(serde_json::Value::Object(envelope))
    }

    pub fn decode(&self, raw: &serde_json::Value) -> Result<Value, CodecError> {
        if let serde_json::Value::Object(map) = raw {
            if map.len() == 2 {
                if let (Some(serde_json::Value::String(tag)), Some(inner)) =
                    (map.get(TYPE_KEY), map.get(VALUE_KEY))
                {
                    return self.codec_for(tag).decode(tag, inner);
                }
            }
        }
        self.fallback.decode(json_tag(raw), raw)
    }

    pub fn encode_attributes(&self, attrs: &Attributes) -> Result<EncodedAttributes, CodecError> {
        attrs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.encode(v)?)))
            .collect()
    }

    pub fn decode_attributes(&self, encoded: &EncodedAttributes) -> Result<Attributes, CodecError> {
        encoded
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.decode(v)?)))
            .collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Json` payload is stored bare only when it decodes back as `Json`: an
/// array, or an object that cannot be mistaken for an envelope.
fn needs_json_envelope(value: &Value, payload: &serde_json::Value) -> bool {
    if !matches!(value, Value::Json(_)) {
        return false;
    }
    match payload {
        serde_json::Value::Array(_) => false,
        serde_json::Value::Object(map) => map.contains_key(TYPE_KEY),
        _ => true,
    }
}

fn json_tag(raw: &serde_json::Value) -> &'static str {
    match raw {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_i64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::String(_) => "text",
        _ => "json",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct CentsCodec;

    impl ValueCodec for CentsCodec {
        fn encode(&self, value: &Value) -> Result<serde_json::Value, CodecError> {
            match value {
                Value::Custom { data, .. } => {
                    let cents = data.as_i64().ok_or_else(|| CodecError::Encode {
                        type_tag: "money".to_string(),
                        reason: "expected integer cents".to_string(),
                    })?;
                    Ok(serde_json::Value::String(format!(
                        "{}.{:02}",
                        cents / 100,
                        cents % 100
                    )))
                }
                other => Err(mismatch("money", other)),
            }
        }

        fn decode(&self, type_tag: &str, raw: &serde_json::Value) -> Result<Value, CodecError> {
            let text = raw.as_str().unwrap_or_default();
            let (whole, frac) = text.split_once('.').unwrap_or((text, "0"));
            let cents = whole.parse::<i64>().unwrap_or(0) * 100 + frac.parse::<i64>().unwrap_or(0);
            Ok(Value::Custom {
                type_tag: type_tag.to_string(),
                data: serde_json::json!(cents),
            })
        }
    }

    #[test]
    fn typed_values_come_back_as_the_same_variant() {
        let registry = CodecRegistry::new();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-7),
            Value::Float(2.5),
            Value::Text("Bob".to_string()),
            Value::Date(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap()),
            Value::Timestamp(ts),
            Value::Json(serde_json::json!({"tags": ["a", "b"]})),
            Value::Json(serde_json::json!([1, "two"])),
            Value::Json(serde_json::json!("x")),
            Value::Json(serde_json::json!(3)),
            Value::Json(serde_json::json!(1.5)),
            Value::Json(serde_json::json!(true)),
            Value::Json(serde_json::Value::Null),
            Value::Json(serde_json::json!({"$type": "date", "$value": "2020-02-29"})),
            Value::Json(serde_json::json!({"$type": "note", "extra": 1})),
        ];
        for v in values {
            let encoded = registry.encode(&v).unwrap();
            assert_eq!(registry.decode(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn structured_json_is_stored_bare() {
        let registry = CodecRegistry::new();
        let doc = serde_json::json!({"tags": ["a"]});
        assert_eq!(registry.encode(&Value::Json(doc.clone())).unwrap(), doc);
        let scalar = registry.encode(&Value::Json(serde_json::json!("x"))).unwrap();
        assert_eq!(scalar["$type"], "json");
        assert_eq!(scalar["$value"], "x");
    }

    #[test]
    fn dates_are_enveloped_not_plain_strings() {
        let registry = CodecRegistry::new();
        let encoded = registry
            .encode(&Value::Date(NaiveDate::from_ymd_opt(2021, 1, 2).unwrap()))
            .unwrap();
        assert_eq!(encoded["$type"], "date");
        assert_eq!(encoded["$value"], "2021-01-02");
        assert_eq!(
            registry.decode(&serde_json::json!("2021-01-02")).unwrap(),
            Value::Text("2021-01-02".to_string())
        );
    }

    #[test]
    fn custom_codec_is_used_for_its_tag() {
        let mut registry = CodecRegistry::new();
        registry.register("money", Arc::new(CentsCodec));
        let price = Value::Custom {
            type_tag: "money".to_string(),
            data: serde_json::json!(1250),
        };
        let encoded = registry.encode(&price).unwrap();
        assert_eq!(encoded["$value"], "12.50");
        assert_eq!(registry.decode(&encoded).unwrap(), price);
    }

    #[test]
    fn unregistered_custom_tag_passes_through() {
        let registry = CodecRegistry::new();
        let v = Value::Custom {
            type_tag: "point".to_string(),
            data: serde_json::json!([1, 2]),
        };
        let encoded = registry.encode(&v).unwrap();
        assert_eq!(registry.decode(&encoded).unwrap(), v);
    }

    #[test]
    fn non_finite_float_fails_to_encode() {
        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.encode(&Value::Float(f64::NAN)),
            Err(CodecError::Encode { .. })
        ));
    }
}
