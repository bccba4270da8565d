//! Layer merging
//!
//! Tables merge key by key, recursively. Anything else in a higher layer,
//! arrays included, replaces what is below it wholesale. Replacing arrays
//! keeps checker command lines from being spliced across layers.

use serde_json::{Map, Value};

/// Lay `overlay` over `base`.
///
/// An explicit null in the overlay replaces too, so a layer can unset a default.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut into), Value::Object(from)) => {
            for (key, value) in from {
                let slot = into.entry(key).or_insert(Value::Null);
                *slot = deep_merge(slot.take(), value);
            }
            Value::Object(into)
        }
        (_, overlay) => overlay,
    }
}

/// Fold layers lowest precedence first.
pub fn merge_layers(layers: impl IntoIterator<Item = Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Build a nested object from a dotted key, e.g. `framework.burst_size`.
///
/// Used to turn individual CLI flags into an override layer.
pub fn nested(path: &str, value: Value) -> Value {
    path.rsplit('.').fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.to_string(), inner);
        Value::Object(map)
    })
}
