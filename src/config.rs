//! Structural merging of JSON configuration documents.

use serde_json::{Map, Value};

/// Deep-merges `source` into `target`.
///
/// Objects merge key by key, recursively. Any other value in `source` (scalars, arrays,
/// `null`) overwrites what `target` holds at that position.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Merges `partial` into `document` at the location addressed by the dotted `key_path`.
///
/// Missing intermediate segments are created as empty objects, and non-object values met
/// along the way are replaced by objects. An empty `key_path` merges at the root.
pub fn merge_at(document: &mut Value, key_path: &str, partial: Value) {
    let nested = key_path
        .split('.')
        .filter(|segment| !segment.is_empty())
        .rev()
        .fold(partial, |inner, segment| {
            let mut wrapper = Map::new();
            wrapper.insert(segment.to_string(), inner);
            Value::Object(wrapper)
        });

    deep_merge(document, nested);
}
