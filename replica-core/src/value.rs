//! Dot-path access into JSON document values.
//!
//! Paths look like `profile.address.city`. A segment that parses as an
//! unsigned integer indexes into an array when the parent is an array and
//! is treated as an ordinary key otherwise.

use serde_json::{Map, Number, Value};

/// How far past the end of an array a write may land. Farther writes are
/// ignored instead of padding the array with nulls.
pub const MAX_ARRAY_GAP: usize = 1024;

/// Split a dot-path into its segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// `true` when `ancestor` equals `path` or is a strict prefix of it on a
/// segment boundary (`a` covers `a.b` but not `ab`).
pub fn covers(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'.'
}

/// `true` when any segment of the path is an array index.
pub fn has_index_segment(path: &str) -> bool {
    segments(path).any(|s| s.parse::<usize>().is_ok())
}

/// Read the value at `path`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for seg in segments(path) {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable access to the value at `path`, if every segment exists.
pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for seg in segments(path) {
        current = match current {
            Value::Object(map) => map.get_mut(seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `new` at `path`, creating intermediate objects as needed.
///
/// Intermediate scalars are replaced with empty objects. Writing past the end
/// of an array pads it with nulls, up to [`MAX_ARRAY_GAP`] slots; an index
/// beyond that leaves the value untouched.
pub fn set_path(value: &mut Value, path: &str, new: Value) {
    let segs: Vec<&str> = segments(path).collect();
    if segs.is_empty() {
        *value = new;
        return;
    }
    let mut current = value;
    for (i, seg) in segs.iter().enumerate() {
        let last = i == segs.len() - 1;
        let array_index = if current.is_array() {
            seg.parse::<usize>().ok()
        } else {
            None
        };
        if let Some(index) = array_index {
            let Value::Array(items) = current else {
                return;
            };
            if index >= items.len() {
                if index - items.len() >= MAX_ARRAY_GAP {
                    return;
                }
                items.resize(index + 1, Value::Null);
            }
            if last {
                items[index] = new;
                return;
            }
            current = &mut items[index];
            continue;
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if last {
            map.insert((*seg).to_string(), new);
            return;
        }
        current = map
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove the value at `path`. A missing ancestor makes this a no-op.
pub fn del_path(value: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rfind('.') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    };
    let container = if parent.is_empty() {
        value
    } else {
        get_path_mut(value, parent)?
    };
    match container {
        Value::Object(map) => map.remove(leaf),
        Value::Array(items) => {
            let index = leaf.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Add `by` to `current`, treating a missing or non-numeric current value as 0.
///
/// Integer inputs stay integers while the sum fits in an `i64`.
pub fn add_numbers(current: Option<&Value>, by: &Value) -> Value {
    let base = match current {
        Some(Value::Number(n)) => n.clone(),
        _ => Number::from(0),
    };
    let step = match by {
        Value::Number(n) => n.clone(),
        _ => Number::from(1),
    };
    if let (Some(a), Some(b)) = (base.as_i64(), step.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Value::from(sum);
        }
    }
    let sum = base.as_f64().unwrap_or(0.0) + step.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
}
