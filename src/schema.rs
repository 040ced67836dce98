//! JSON Schema helpers: meta-key stripping, descriptor limit checks, and
//! type reflection.
//!
//! The library accepts draft-2020-12-style schema objects and passes
//! `properties`, `items`, `enum`, the combinators, `format`, `type` and
//! `required` through untouched. The only transform applied is the removal
//! of meta keys vendors reject.

use serde_json::Value;

use crate::capabilities::StructuredResponseConfig;
use crate::error::Error;
use crate::Result;

/// Meta keys that Gemini rejects outright; stripping them is harmless for
/// every other vendor.
const META_KEYS: [&str; 4] = ["$schema", "$id", "$defs", "$ref"];

/// Recursively remove JSON-Schema meta keys from every object in `schema`.
pub fn strip_schema_meta(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in META_KEYS {
                map.remove(key);
            }
            for value in map.values_mut() {
                strip_schema_meta(value);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_schema_meta(item);
            }
        }
        _ => {}
    }
}

/// Copying variant of [`strip_schema_meta`] for callers that hold the schema
/// behind a shared reference.
pub fn stripped_schema(schema: &Value) -> Value {
    let mut copy = schema.clone();
    strip_schema_meta(&mut copy);
    copy
}

/// Maximum object/array nesting depth of the schema. A bare scalar schema
/// has depth 1.
pub fn schema_depth(schema: &Value) -> u32 {
    match schema {
        Value::Object(map) => {
            1 + map.values().map(schema_depth).max().unwrap_or(0)
        }
        Value::Array(items) => items.iter().map(schema_depth).max().unwrap_or(1),
        _ => 0,
    }
}

/// The widest `properties` object anywhere in the schema.
pub fn max_properties(schema: &Value) -> u32 {
    fn walk(value: &Value, widest: &mut u32) {
        match value {
            Value::Object(map) => {
                if let Some(Value::Object(props)) = map.get("properties") {
                    *widest = (*widest).max(props.len() as u32);
                }
                for v in map.values() {
                    walk(v, widest);
                }
            }
            Value::Array(items) => {
                for v in items {
                    walk(v, widest);
                }
            }
            _ => {}
        }
    }
    let mut widest = 0;
    walk(schema, &mut widest);
    widest
}

/// Enforce the informational limits from a structured-response descriptor.
///
/// A zero limit in the descriptor means "no limit".
pub fn check_schema_limits(schema: &Value, config: &StructuredResponseConfig) -> Result<()> {
    if config.max_schema_depth > 0 {
        let depth = schema_depth(schema);
        if depth > config.max_schema_depth {
            return Err(Error::schema_with_hint(
                format!(
                    "schema depth {} exceeds the model's limit of {}",
                    depth, config.max_schema_depth
                ),
                "flatten nested objects or inline referenced definitions",
            ));
        }
    }
    if config.max_properties > 0 {
        let widest = max_properties(schema);
        if widest > config.max_properties {
            return Err(Error::schema(format!(
                "schema object with {} properties exceeds the model's limit of {}",
                widest, config.max_properties
            )));
        }
    }
    Ok(())
}

/// Reflect a JSON Schema from a Rust type.
pub fn schema_of<T: schemars::JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| Value::Object(Default::default()))
}
