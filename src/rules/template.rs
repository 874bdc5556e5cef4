//! `{%...%}` template rendering and the named value transforms.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::value::Value;

use super::token::TokenSource;

pub const TOKEN_LEFT_DELIMITER: &str = "{%";
pub const TOKEN_RIGHT_DELIMITER: &str = "%}";

pub const TRANSFORM_URL_ENCODE: &str = "urlenc";
pub const TRANSFORM_TO_INT: &str = "int";
pub const TRANSFORM_TO_DOUBLE: &str = "double";
pub const TRANSFORM_TO_BOOL: &str = "bool";
pub const TRANSFORM_TO_STRING: &str = "string";

/// A named value transformation.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

static FUNCTION_TAG: OnceLock<Option<Regex>> = OnceLock::new();

fn function_tag() -> Option<&'static Regex> {
    FUNCTION_TAG
        .get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\((.*)\)\s*$").ok())
        .as_ref()
}

/// Registry of named transforms usable as `name(path)` in tags.
#[derive(Clone)]
pub struct Transformer {
    transforms: HashMap<String, Transform>,
}

impl Transformer {
    /// An empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, transform: F)
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(name.to_string(), Arc::new(transform));
    }

    /// Applies `name` to `value`. Unknown names return the value unchanged.
    #[must_use]
    pub fn transform(&self, name: &str, value: Value) -> Value {
        match self.transforms.get(name) {
            Some(t) => t(value),
            None => {
                log::trace!("no transform named '{name}', value passed through");
                value
            }
        }
    }

    /// Resolves a tag body: `path` or `fn(path)`.
    pub fn resolve_tag(&self, tag: &str, source: &dyn TokenSource) -> Option<Value> {
        if let Some(caps) = function_tag().and_then(|re| re.captures(tag)) {
            let name = caps.get(1).map_or("", |m| m.as_str());
            let path = caps.get(2).map_or("", |m| m.as_str()).trim();
            return source.get(path).map(|v| self.transform(name, v));
        }
        source.get(tag.trim())
    }

    /// Replaces every `{%tag%}` in `template`. Tags that do not resolve
    /// render as the empty string; an unclosed tag is left verbatim.
    #[must_use]
    pub fn render(&self, template: &str, source: &dyn TokenSource) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find(TOKEN_LEFT_DELIMITER) {
            let after = &rest[start + TOKEN_LEFT_DELIMITER.len()..];
            let Some(end) = after.find(TOKEN_RIGHT_DELIMITER) else {
                break;
            };
            out.push_str(&rest[..start]);
            if let Some(value) = self.resolve_tag(&after[..end], source) {
                out.push_str(&render_value(&value));
            }
            rest = &after[end + TOKEN_RIGHT_DELIMITER.len()..];
        }
        out.push_str(rest);
        out
    }
}

impl Default for Transformer {
    /// The standard rule transforms: `urlenc`, `int`, `double`, `bool`,
    /// `string`.
    fn default() -> Self {
        let mut t = Self::empty();
        t.register(TRANSFORM_URL_ENCODE, |v| match v {
            Value::String(s) => Value::String(urlencoding::encode(&s).into_owned()),
            other => other,
        });
        t.register(TRANSFORM_TO_INT, to_int);
        t.register(TRANSFORM_TO_DOUBLE, to_double);
        t.register(TRANSFORM_TO_BOOL, to_bool);
        t.register(TRANSFORM_TO_STRING, |v| Value::String(render_value(&v)));
        t
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("Transformer").field("transforms", &names).finish()
    }
}

/// Text form used for substitution.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_int(value: Value) -> Value {
    match value {
        Value::String(ref s) => s.trim().parse::<i64>().map_or(value, Value::Int),
        Value::Double(d) if d.is_finite() => Value::Int(d.trunc() as i64),
        Value::Bool(b) => Value::Int(i64::from(b)),
        other => other,
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_double(value: Value) -> Value {
    match value {
        Value::String(ref s) => s.trim().parse::<f64>().map_or(value, Value::Double),
        Value::Int(i) => Value::Double(i as f64),
        Value::Bool(b) => Value::Double(if b { 1.0 } else { 0.0 }),
        other => other,
    }
}

#[allow(clippy::float_cmp)]
fn to_bool(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Bool(s.to_lowercase() == "true"),
        Value::Double(d) => Value::Bool(d == 1.0),
        Value::Int(i) => Value::Bool(i == 1),
        other => other,
    }
}
