//! Structural decoding of a descriptor's configuration into a plugin's
//! default configuration.

use serde_json::{Map, Value};

/// Merge `doc` into `defaults`, checking every value against the kind of the
/// default it replaces.
///
/// Objects merge key by key. Keys absent from the defaults are rejected, a
/// `null` default accepts any value, and a `null` document keeps the
/// defaults. Errors name the offending key path.
pub fn decode_into(defaults: Value, doc: &Value) -> Result<Value, String> {
    merge(defaults, doc, "config")
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn merge(default: Value, doc: &Value, at: &str) -> Result<Value, String> {
    match (default, doc) {
        (default, Value::Null) => Ok(default),
        (Value::Null, doc) => Ok(doc.clone()),
        (Value::Object(mut fields), Value::Object(overrides)) => {
            merge_object(&mut fields, overrides, at)?;
            Ok(Value::Object(fields))
        }
        (Value::Bool(_), Value::Bool(b)) => Ok(Value::Bool(*b)),
        (Value::String(_), Value::String(s)) => Ok(Value::String(s.clone())),
        (Value::Array(_), Value::Array(items)) => Ok(Value::Array(items.clone())),
        (Value::Number(n), Value::Number(m)) => {
            let integer = n.is_i64() || n.is_u64();
            if integer && !(m.is_i64() || m.is_u64()) {
                return Err(format!("{at}: expected integer, found {m}"));
            }
            Ok(Value::Number(m.clone()))
        }
        (default, doc) => Err(format!(
            "{at}: expected {}, found {}",
            kind(&default),
            kind(doc)
        )),
    }
}

fn merge_object(fields: &mut Map<String, Value>, overrides: &Map<String, Value>, at: &str) -> Result<(), String> {
    for (key, value) in overrides {
        let path = format!("{at}.{key}");
        let Some(slot) = fields.get_mut(key) else {
            return Err(format!("{path}: unknown field"));
        };
        *slot = merge(std::mem::take(slot), value, &path)?;
    }
    Ok(())
}
