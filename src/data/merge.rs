use crate::value::{EventData, Value};

/// Key suffix that attaches a map to every element of the sibling array.
pub const WILDCARD_SUFFIX: &str = "[*]";

/// Deep-merges `from` into `to` and returns the result.
///
/// 1. Nested maps merge recursively, arrays concatenate (`to` first), and a
///    scalar conflict keeps the new value only when `overwrite` is set. A
///    `Null` on the `to` side never blocks the incoming value.
/// 2. A key `name[*]` whose value is a map is removed and merged into every
///    map element of the array at `name`. Non-map elements pass through.
/// 3. `Null` values are removed.
#[must_use]
pub fn merge(to: &EventData, from: &EventData, overwrite: bool) -> EventData {
    let combined = structural_merge(to, from, overwrite);
    let mut merged = apply_array_wildcards(combined, overwrite);
    merged.retain(|_, v| !v.is_null());
    merged
}

fn structural_merge(to: &EventData, from: &EventData, overwrite: bool) -> EventData {
    let mut out = to.clone();
    for (key, new) in from {
        let resolved = match out.get(key) {
            None | Some(Value::Null) => new.clone(),
            Some(Value::Map(old)) if new.is_map() => {
                let inner = new.as_map().map(|n| merge(old, n, overwrite)).unwrap_or_default();
                Value::Map(inner)
            }
            Some(Value::Array(old)) if new.is_array() => {
                let mut joined = old.clone();
                joined.extend(new.as_array().unwrap_or_default().iter().cloned());
                Value::Array(joined)
            }
            Some(old) => {
                if overwrite {
                    new.clone()
                } else {
                    old.clone()
                }
            }
        };
        out.insert(key.clone(), resolved);
    }
    out
}

fn apply_array_wildcards(data: EventData, overwrite: bool) -> EventData {
    let mut out = data.clone();
    for (key, value) in data {
        let Some((target, _)) = key.split_once(WILDCARD_SUFFIX) else {
            if let Value::Map(inner) = &value {
                out.insert(key, Value::Map(merge(inner, &EventData::new(), false)));
            }
            continue;
        };

        out.remove(&key);

        let Some(Value::Array(receivers)) = out.get(target) else {
            log::debug!("wildcard key '{key}' has no array at '{target}', dropping");
            continue;
        };
        let Value::Map(attach) = &value else {
            log::debug!("wildcard key '{key}' does not carry a map, dropping");
            continue;
        };

        let attached = receivers
            .iter()
            .map(|item| match item {
                Value::Map(item_map) => Value::Map(merge(item_map, attach, overwrite)),
                other => other.clone(),
            })
            .collect();
        out.insert(target.to_string(), Value::Array(attached));
    }
    out
}
