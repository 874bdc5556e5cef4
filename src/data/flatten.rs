use crate::value::{EventData, Value};

/// Flattens nested maps and arrays into a single-level map of dotted paths.
///
/// Map entries become `prefix.key`, array elements `prefix.index`. Empty
/// containers produce no entries. When two paths collide (a literal key
/// `"a.b"` next to a nested `a: {b: ..}`) the one visited last in key order
/// wins. Flattening an already flat map returns it unchanged.
#[must_use]
pub fn flatten(data: &EventData, prefix: &str) -> EventData {
    let mut out = EventData::new();
    flatten_map(data, prefix, &mut out);
    out
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn flatten_map(data: &EventData, prefix: &str, out: &mut EventData) {
    for (key, value) in data {
        flatten_value(value, join(prefix, key), out);
    }
}

fn flatten_value(value: &Value, path: String, out: &mut EventData) {
    match value {
        Value::Map(inner) => flatten_map(inner, &path, out),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_value(item, join(&path, &index.to_string()), out);
            }
        }
        scalar => {
            out.insert(path, scalar.clone());
        }
    }
}
