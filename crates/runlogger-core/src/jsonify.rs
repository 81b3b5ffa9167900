//! Normalisation of outgoing payloads into JSON-compatible values.
//!
//! Callers hand the logger arbitrary [`Payload`] trees; before a request is
//! sent every tree goes through [`jsonify`]: text and paths become strings,
//! bytes become base64 text, NaN becomes `null`, containers recurse.

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};

use crate::error::{Result, RunLoggerError};

/// A value that can be logged, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Path(PathBuf),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    /// Already JSON; passed through untouched.
    Json(Value),
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}
impl From<f32> for Payload {
    fn from(v: f32) -> Self {
        Payload::Float(v as f64)
    }
}
impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Int(v)
    }
}
impl From<i32> for Payload {
    fn from(v: i32) -> Self {
        Payload::Int(v as i64)
    }
}
impl From<usize> for Payload {
    fn from(v: usize) -> Self {
        Payload::Int(v as i64)
    }
}
impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Bool(v)
    }
}
impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::Text(v)
    }
}
impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::Text(v.to_string())
    }
}
impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v)
    }
}
impl From<PathBuf> for Payload {
    fn from(v: PathBuf) -> Self {
        Payload::Path(v)
    }
}
impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}
impl From<Vec<Payload>> for Payload {
    fn from(v: Vec<Payload>) -> Self {
        Payload::List(v)
    }
}
impl<T: Into<Payload>> From<BTreeMap<String, T>> for Payload {
    fn from(v: BTreeMap<String, T>) -> Self {
        Payload::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

/// Normalise a payload into a JSON value.
///
/// Infinite floats have no JSON form and are rejected with
/// [`RunLoggerError::Serialization`] rather than being retried as a
/// backend failure.
pub fn jsonify(value: &Payload) -> Result<Value> {
    Ok(match value {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Int(i) => Value::Number((*i).into()),
        Payload::Float(f) => float_to_json(*f)?,
        Payload::Text(s) => Value::String(s.clone()),
        Payload::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
        Payload::Path(path) => Value::String(path.to_string_lossy().into_owned()),
        Payload::List(items) => {
            Value::Array(items.iter().map(jsonify).collect::<Result<Vec<_>>>()?)
        }
        Payload::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, item) in entries {
                map.insert(key.clone(), jsonify(item)?);
            }
            Value::Object(map)
        }
        Payload::Json(v) => v.clone(),
    })
}

fn float_to_json(f: f64) -> Result<Value> {
    if f.is_nan() {
        return Ok(Value::Null);
    }
    Number::from_f64(f).map(Value::Number).ok_or_else(|| {
        RunLoggerError::Serialization(format!("{f} has no JSON representation"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nan_becomes_null() {
        assert_eq!(jsonify(&Payload::Float(f64::NAN)).unwrap(), Value::Null);
    }

    #[test]
    fn bytes_become_base64() {
        let value = jsonify(&Payload::Bytes(b"hello".to_vec())).unwrap();
        assert_eq!(value, json!("aGVsbG8="));
    }

    #[test]
    fn nested_nan_is_replaced_in_place() {
        let mut map = BTreeMap::new();
        map.insert(
            "a".to_string(),
            Payload::List(vec![Payload::Int(1), Payload::Float(f64::NAN)]),
        );
        let value = jsonify(&Payload::Map(map)).unwrap();
        assert_eq!(value, json!({"a": [1, null]}));
    }

    #[test]
    fn paths_become_strings() {
        let value = jsonify(&Payload::Path(PathBuf::from("/tmp/ckpt.pt"))).unwrap();
        assert_eq!(value, json!("/tmp/ckpt.pt"));
    }

    #[test]
    fn infinity_fails_fast() {
        let err = jsonify(&Payload::List(vec![Payload::Float(f64::INFINITY)])).unwrap_err();
        assert!(matches!(err, RunLoggerError::Serialization(_)));
    }

    #[test]
    fn json_passes_through() {
        let raw = json!({"loss": 0.25, "tags": ["a", "b"]});
        assert_eq!(jsonify(&Payload::Json(raw.clone())).unwrap(), raw);
    }
}
