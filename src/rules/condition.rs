//! Rule conditions: logical groups over typed key matchers.
//!
//! Matchers coerce the resolved key to the type of each literal before
//! comparing. String comparisons are case-insensitive.

use crate::value::Value;

use super::template::{
    Transformer, TRANSFORM_TO_BOOL, TRANSFORM_TO_DOUBLE, TRANSFORM_TO_INT, TRANSFORM_TO_STRING,
};
use super::token::TokenSource;

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    /// Any other logic name. Such a group never matches.
    Unknown,
}

impl LogicalOp {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "and" => Self::And,
            "or" => Self::Or,
            _ => Self::Unknown,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Exists,
    NotExists,
}

impl MatcherOp {
    /// Parses a two-letter matcher code (`eq`, `ne`, `gt`, ...).
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "eq" => Self::Equals,
            "ne" => Self::NotEquals,
            "gt" => Self::GreaterThan,
            "ge" => Self::GreaterEqual,
            "lt" => Self::LessThan,
            "le" => Self::LessEqual,
            "co" => Self::Contains,
            "nc" => Self::NotContains,
            "sw" => Self::StartsWith,
            "ew" => Self::EndsWith,
            "ex" => Self::Exists,
            "nx" => Self::NotExists,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Equals => "eq",
            Self::NotEquals => "ne",
            Self::GreaterThan => "gt",
            Self::GreaterEqual => "ge",
            Self::LessThan => "lt",
            Self::LessEqual => "le",
            Self::Contains => "co",
            Self::NotContains => "nc",
            Self::StartsWith => "sw",
            Self::EndsWith => "ew",
            Self::Exists => "ex",
            Self::NotExists => "nx",
        }
    }
}

/// Compares one resolved key against a list of literals.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    pub key: String,
    pub op: MatcherOp,
    /// Literals, each one of String, Int, Double or Bool. Empty means a
    /// single comparison against `""`.
    pub values: Vec<Value>,
}

impl Matcher {
    #[must_use]
    pub fn new(key: impl Into<String>, op: MatcherOp, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            op,
            values,
        }
    }

    pub fn evaluate(&self, source: &dyn TokenSource, transformer: &Transformer) -> bool {
        let resolved = source.get(&self.key).filter(|v| !v.is_null());

        match self.op {
            MatcherOp::Exists => return resolved.is_some(),
            MatcherOp::NotExists => return resolved.is_none(),
            _ => {}
        }

        let Some(lhs) = resolved else {
            return false;
        };

        if self.values.is_empty() {
            let lhs = transformer.transform(TRANSFORM_TO_STRING, lhs);
            return compare(self.op, &lhs, &Value::String(String::new()));
        }

        self.values.iter().any(|expected| {
            let Some(coercion) = coercion_for(expected) else {
                return false;
            };
            let lhs = transformer.transform(coercion, lhs.clone());
            compare(self.op, &lhs, expected)
        })
    }
}

/// A parsed rule condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Group {
        logic: LogicalOp,
        operands: Vec<ConditionNode>,
    },
    Matcher(Matcher),
}

impl ConditionNode {
    /// Evaluates the tree left to right, short-circuiting groups.
    pub fn evaluate(&self, source: &dyn TokenSource, transformer: &Transformer) -> bool {
        match self {
            Self::Group { logic, operands } => match logic {
                LogicalOp::And => {
                    if operands.is_empty() {
                        log::warn!("malformed condition: 'and' group without operands matches nothing");
                        return false;
                    }
                    operands.iter().all(|c| c.evaluate(source, transformer))
                }
                LogicalOp::Or => operands.iter().any(|c| c.evaluate(source, transformer)),
                LogicalOp::Unknown => {
                    log::debug!("unsupported logical operator, condition is false");
                    false
                }
            },
            Self::Matcher(m) => m.evaluate(source, transformer),
        }
    }
}

/// The transform a literal's type asks for, or `None` for unsupported
/// literal types.
#[must_use]
pub fn coercion_for(literal: &Value) -> Option<&'static str> {
    match literal {
        Value::String(_) => Some(TRANSFORM_TO_STRING),
        Value::Int(_) => Some(TRANSFORM_TO_INT),
        Value::Double(_) => Some(TRANSFORM_TO_DOUBLE),
        Value::Bool(_) => Some(TRANSFORM_TO_BOOL),
        Value::Null | Value::Array(_) | Value::Map(_) => None,
    }
}

#[allow(clippy::float_cmp)]
fn equals(lhs: &Value, rhs: &Value) -> Option<bool> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase() == b.to_lowercase()),
        (Value::Int(a), Value::Int(b)) => Some(a == b),
        (Value::Double(a), Value::Double(b)) => Some(a == b),
        (Value::Bool(a), Value::Bool(b)) => Some(a == b),
        _ => None,
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        _ => None,
    }
}

fn strings(lhs: &Value, rhs: &Value) -> Option<(String, String)> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some((a.to_lowercase(), b.to_lowercase())),
        _ => None,
    }
}

/// Applies `op` to an already coerced pair. Unsupported type pairs are
/// false for every operator.
fn compare(op: MatcherOp, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering;

    match op {
        MatcherOp::Equals => equals(lhs, rhs).unwrap_or(false),
        MatcherOp::NotEquals => equals(lhs, rhs).is_some_and(|eq| !eq),
        MatcherOp::GreaterThan => ordering(lhs, rhs) == Some(Ordering::Greater),
        MatcherOp::GreaterEqual => matches!(ordering(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
        MatcherOp::LessThan => ordering(lhs, rhs) == Some(Ordering::Less),
        MatcherOp::LessEqual => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        MatcherOp::Contains => strings(lhs, rhs).is_some_and(|(a, b)| a.contains(&b)),
        MatcherOp::NotContains => strings(lhs, rhs).is_some_and(|(a, b)| !a.contains(&b)),
        MatcherOp::StartsWith => strings(lhs, rhs).is_some_and(|(a, b)| a.starts_with(&b)),
        MatcherOp::EndsWith => strings(lhs, rhs).is_some_and(|(a, b)| a.ends_with(&b)),
        MatcherOp::Exists | MatcherOp::NotExists => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{data_from_json, EventData};
    use serde_json::json;

    fn data() -> EventData {
        data_from_json(json!({
            "action": "Purchase",
            "count": "12",
            "qty": 3,
            "price": 9.5,
            "opted": "true",
            "empty": "",
            "nothing": null,
        }))
    }

    fn check(key: &str, code: &str, values: Vec<Value>) -> bool {
        let m = Matcher::new(key, MatcherOp::from_code(code).unwrap(), values);
        m.evaluate(&data(), &Transformer::default())
    }

    #[test]
    fn test_string_ops_are_case_insensitive() {
        assert!(check("action", "eq", vec![Value::from("purchase")]));
        assert!(!check("action", "ne", vec![Value::from("PURCHASE")]));
        assert!(check("action", "co", vec![Value::from("CHAS")]));
        assert!(check("action", "nc", vec![Value::from("refund")]));
        assert!(check("action", "sw", vec![Value::from("pur")]));
        assert!(check("action", "ew", vec![Value::from("ASE")]));
    }

    #[test]
    fn test_literal_type_drives_coercion() {
        // "12" coerced to int
        assert!(check("count", "gt", vec![Value::Int(10)]));
        assert!(check("count", "eq", vec![Value::Int(12)]));
        // 3 coerced to double
        assert!(check("qty", "le", vec![Value::Double(3.0)]));
        // 9.5 coerced to string
        assert!(check("price", "eq", vec![Value::from("9.5")]));
        // "true" coerced to bool
        assert!(check("opted", "eq", vec![Value::Bool(true)]));
        // "Purchase" cannot become an int
        assert!(!check("action", "eq", vec![Value::Int(1)]));
        assert!(!check("action", "ne", vec![Value::Int(1)]));
    }

    #[test]
    fn test_multiple_values_are_ored() {
        assert!(check("action", "eq", vec![Value::from("refund"), Value::from("purchase")]));
        assert!(!check("action", "eq", vec![Value::from("refund"), Value::from("view")]));
    }

    #[test]
    fn test_empty_values_compare_with_empty_string() {
        assert!(check("empty", "eq", vec![]));
        assert!(check("action", "ne", vec![]));
    }

    #[test]
    fn test_exists_and_absent_keys() {
        assert!(check("action", "ex", vec![]));
        assert!(!check("missing", "ex", vec![]));
        assert!(check("missing", "nx", vec![]));
        assert!(check("nothing", "nx", vec![]));
        assert!(!check("missing", "eq", vec![Value::from("")]));
        assert!(!check("missing", "ne", vec![Value::from("x")]));
    }

    #[test]
    fn test_ordering_rejects_strings() {
        assert!(!check("action", "gt", vec![Value::from("a")]));
    }

    #[test]
    fn test_groups_short_circuit() {
        let t = Transformer::default();
        let yes = ConditionNode::Matcher(Matcher::new("qty", MatcherOp::Exists, vec![]));
        let no = ConditionNode::Matcher(Matcher::new("missing", MatcherOp::Exists, vec![]));

        let and = ConditionNode::Group {
            logic: LogicalOp::And,
            operands: vec![yes.clone(), no.clone()],
        };
        let or = ConditionNode::Group {
            logic: LogicalOp::Or,
            operands: vec![no.clone(), yes.clone()],
        };
        let odd = ConditionNode::Group {
            logic: LogicalOp::from_name("xor"),
            operands: vec![yes],
        };
        assert!(!and.evaluate(&data(), &t));
        assert!(or.evaluate(&data(), &t));
        assert!(!odd.evaluate(&data(), &t));
    }

    #[test]
    fn test_empty_groups_match_nothing() {
        let t = Transformer::default();
        for logic in [LogicalOp::And, LogicalOp::Or] {
            let empty = ConditionNode::Group {
                logic,
                operands: vec![],
            };
            assert!(!empty.evaluate(&data(), &t));
        }
    }

    #[test]
    fn test_matcher_codes_round_trip() {
        for code in ["eq", "ne", "gt", "ge", "lt", "le", "co", "nc", "sw", "ew", "ex", "nx"] {
            assert_eq!(MatcherOp::from_code(code).unwrap().code(), code);
        }
        assert!(MatcherOp::from_code("zz").is_none());
    }
}
