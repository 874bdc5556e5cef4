use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::value::{EventData, Value};

/// Bytes escaped in a query component. Mirrors the usual "query allowed"
/// set, so `=`, `&`, `,` and `/` stay literal.
const QUERY: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Renders a flat map as a URL query string.
///
/// Each pair is rendered as `key=value` and then percent-encoded as a whole
/// with the query-allowed set; pairs are joined with `&`. Array values are
/// rendered comma-joined. An empty map yields an empty string.
#[must_use]
pub fn query_string(params: &EventData) -> String {
    params
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::Array(items) if !items.is_empty() => items
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_string(),
            };
            utf8_percent_encode(&format!("{key}={rendered}"), QUERY).to_string()
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::data_from_json;
    use serde_json::json;

    #[test]
    fn test_empty() {
        assert_eq!(query_string(&EventData::new()), "");
    }

    #[test]
    fn test_pairs_are_encoded_and_joined() {
        let params = data_from_json(json!({"a.b": "x y", "n": 3}));
        assert_eq!(query_string(&params), "a.b=x%20y&n=3");
    }

    #[test]
    fn test_arrays_are_comma_joined() {
        let params = data_from_json(json!({"list": ["a", "b"]}));
        assert_eq!(query_string(&params), "list=a,b");
    }

    #[test]
    fn test_pair_is_encoded_as_a_whole() {
        let params = data_from_json(json!({"list": ["a", "b"], "k": "x=y", "q": "50% <off>"}));
        assert_eq!(query_string(&params), "k=x=y&list=a,b&q=50%25%20%3Coff%3E");
    }
}
