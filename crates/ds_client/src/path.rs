//! Dotted-path access into JSON documents (`"chat.config.socket"`).
//!
//! Records are addressed either as a whole or through one of these paths. A path
//! segment that parses as an integer indexes into an array when the parent is one,
//! otherwise it is treated as an object key.

use serde_json::{Map, Value};

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Read the value at `path`. `None` when any segment is missing.
pub fn get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for seg in segments(path) {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
/// Non-object intermediates are replaced by objects.
pub fn set(doc: &mut Value, path: &str, value: Value) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.is_empty() {
        *doc = value;
        return;
    }
    let mut current = doc;
    for seg in &segs[..segs.len() - 1] {
        current = child_mut(current, seg);
    }
    let last = segs[segs.len() - 1];
    if let Value::Array(items) = &mut *current {
        if let Ok(idx) = last.parse::<usize>() {
            if idx < items.len() {
                items[idx] = value;
                return;
            }
        }
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = &mut *current {
        map.insert(last.to_string(), value);
    }
}

fn child_mut<'a>(current: &'a mut Value, seg: &str) -> &'a mut Value {
    let index = match (&*current, seg.parse::<usize>()) {
        (Value::Array(items), Ok(idx)) if idx < items.len() => Some(idx),
        _ => None,
    };
    if index.is_none() && !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match (current, index) {
        (Value::Array(items), Some(idx)) => &mut items[idx],
        (Value::Object(map), _) => map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        _ => unreachable!("arrays are indexed, everything else is an object by now"),
    }
}
