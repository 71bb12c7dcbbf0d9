//! Conversion between the gateway's JSON values and CBOR wire values.
//!
//! Both protocols carry configuration, context snapshots and PDK arguments as
//! CBOR. Byte strings coming from a plugin are decoded as UTF-8 text where
//! possible, since the JSON side has no byte type.

use ciborium::Value;
use serde_json::{Map, Number, Value as JsonValue};

pub fn json_to_cbor(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Array(items) => Value::Array(items.iter().map(json_to_cbor).collect()),
        JsonValue::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

pub fn cbor_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            if let Ok(u) = u64::try_from(n) {
                JsonValue::Number(u.into())
            } else if let Ok(s) = i64::try_from(n) {
                JsonValue::Number(s.into())
            } else {
                Number::from_f64(n as f64)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            }
        }
        Value::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
        },
        Value::Array(items) => JsonValue::Array(items.iter().map(cbor_to_json).collect()),
        Value::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                let key = match k {
                    Value::Text(s) => s.clone(),
                    other => match cbor_to_json(other) {
                        JsonValue::String(s) => s,
                        json => json.to_string(),
                    },
                };
                map.insert(key, cbor_to_json(v));
            }
            JsonValue::Object(map)
        }
        Value::Tag(_, inner) => cbor_to_json(inner),
        _ => JsonValue::Null,
    }
}

/// Look up a text key in a CBOR map.
pub fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(s) if s == key))
        .map(|(_, v)| v)
}

/// Read a CBOR integer as u64.
pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Integer(i) => {
            let n: i128 = (*i).into();
            u64::try_from(n).ok()
        }
        _ => None,
    }
}
