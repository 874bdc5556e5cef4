//! Rule JSON parsing.
//!
//! Malformed pieces are logged and dropped one at a time; only a document
//! that is not JSON of the root shape fails as a whole.

use serde::Deserialize;

use crate::error::RulesError;
use crate::value::{EventData, Value};

use super::condition::{coercion_for, ConditionNode, LogicalOp, Matcher, MatcherOp};

pub const CONSEQUENCE_TYPE_ADD: &str = "add";
pub const CONSEQUENCE_TYPE_MOD: &str = "mod";
pub const CONSEQUENCE_TYPE_DISPATCH: &str = "dispatch";

const CONDITION_TYPE_GROUP: &str = "group";
const CONDITION_TYPE_MATCHER: &str = "matcher";
const CONDITION_TYPE_HISTORICAL: &str = "historical";

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsequenceKind {
    Add,
    Mod,
    Dispatch,
    Other(String),
}

impl ConsequenceKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            CONSEQUENCE_TYPE_ADD => Self::Add,
            CONSEQUENCE_TYPE_MOD => Self::Mod,
            CONSEQUENCE_TYPE_DISPATCH => Self::Dispatch,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Add => CONSEQUENCE_TYPE_ADD,
            Self::Mod => CONSEQUENCE_TYPE_MOD,
            Self::Dispatch => CONSEQUENCE_TYPE_DISPATCH,
            Self::Other(name) => name,
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq)]
pub struct Consequence {
    pub id: String,
    pub kind: ConsequenceKind,
    pub detail: EventData,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub condition: ConditionNode,
    pub consequences: Vec<Consequence>,
}

#[derive(Debug, Deserialize)]
struct RawRoot {
    #[serde(default)]
    version: Option<serde_json::Value>,
    rules: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    condition: Option<serde_json::Value>,
    #[serde(default)]
    consequences: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    definition: RawDefinition,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefinition {
    logic: Option<String>,
    conditions: Option<Vec<serde_json::Value>>,
    key: Option<String>,
    matcher: Option<String>,
    #[serde(default)]
    values: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawConsequence {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    detail: Option<serde_json::Value>,
}

/// Parses a rules document `{version, rules: [{condition, consequences}]}`.
pub fn parse_rules(bytes: &[u8]) -> Result<Vec<Rule>, RulesError> {
    let root: RawRoot = serde_json::from_slice(bytes).map_err(|e| {
        log::error!("unable to parse rules document: {e}");
        RulesError::InvalidJson {
            message: e.to_string(),
        }
    })?;
    log::trace!("parsing rules document version {:?}", root.version);

    let total = root.rules.len();
    let rules: Vec<Rule> = root
        .rules
        .into_iter()
        .enumerate()
        .filter_map(|(index, raw)| match parse_rule(raw) {
            Ok(rule) => Some(rule),
            Err(err) => {
                log::warn!("dropping rule #{index}: {err}");
                None
            }
        })
        .collect();
    log::debug!("parsed {} of {total} rules", rules.len());
    Ok(rules)
}

/// Parses one rule object.
pub fn parse_rule(raw: serde_json::Value) -> Result<Rule, RulesError> {
    let raw: RawRule = serde_json::from_value(raw).map_err(invalid)?;
    let condition = raw.condition.ok_or_else(|| RulesError::InvalidRule {
        reason: "rule has no condition".to_string(),
    })?;
    let condition = parse_condition(condition)?;

    let consequences = raw
        .consequences
        .into_iter()
        .filter_map(|c| match parse_consequence(c) {
            Ok(c) => Some(c),
            Err(err) => {
                log::warn!("dropping consequence: {err}");
                None
            }
        })
        .collect();

    Ok(Rule {
        condition,
        consequences,
    })
}

/// Parses a `group` or `matcher` condition.
pub fn parse_condition(raw: serde_json::Value) -> Result<ConditionNode, RulesError> {
    let raw: RawCondition = serde_json::from_value(raw).map_err(invalid)?;
    match raw.kind.as_str() {
        CONDITION_TYPE_GROUP => parse_group(raw.definition),
        CONDITION_TYPE_MATCHER => parse_matcher(raw.definition),
        CONDITION_TYPE_HISTORICAL => Err(RulesError::InvalidRule {
            reason: "historical conditions are not supported".to_string(),
        }),
        other => Err(RulesError::InvalidRule {
            reason: format!("unknown condition type '{other}'"),
        }),
    }
}

fn parse_group(def: RawDefinition) -> Result<ConditionNode, RulesError> {
    let (Some(logic), Some(conditions)) = (def.logic, def.conditions) else {
        return Err(RulesError::InvalidRule {
            reason: "group needs both logic and conditions".to_string(),
        });
    };

    let operands: Vec<ConditionNode> = conditions
        .into_iter()
        .filter_map(|c| match parse_condition(c) {
            Ok(node) => Some(node),
            Err(err) => {
                log::warn!("dropping condition from '{logic}' group: {err}");
                None
            }
        })
        .collect();

    if operands.is_empty() {
        return Err(RulesError::InvalidRule {
            reason: format!("'{logic}' group has no valid conditions"),
        });
    }

    Ok(ConditionNode::Group {
        logic: LogicalOp::from_name(&logic),
        operands,
    })
}

fn parse_matcher(def: RawDefinition) -> Result<ConditionNode, RulesError> {
    let (Some(key), Some(code)) = (def.key, def.matcher) else {
        return Err(RulesError::InvalidRule {
            reason: "matcher needs both key and matcher".to_string(),
        });
    };
    let op = MatcherOp::from_code(&code).ok_or_else(|| RulesError::InvalidRule {
        reason: format!("unknown matcher '{code}'"),
    })?;

    let given = def.values.len();
    let values: Vec<Value> = def
        .values
        .into_iter()
        .map(Value::from)
        .filter(|v| {
            let supported = coercion_for(v).is_some();
            if !supported {
                log::warn!("matcher on '{key}': dropping {} literal", v.type_name());
            }
            supported
        })
        .collect();

    if given > 0 && values.is_empty() {
        return Err(RulesError::InvalidRule {
            reason: format!("matcher on '{key}' has no usable values"),
        });
    }

    Ok(ConditionNode::Matcher(Matcher::new(key, op, values)))
}

fn parse_consequence(raw: serde_json::Value) -> Result<Consequence, RulesError> {
    let raw: RawConsequence = serde_json::from_value(raw).map_err(invalid)?;
    let (Some(id), Some(kind)) = (raw.id, raw.kind) else {
        return Err(RulesError::InvalidRule {
            reason: "consequence needs both id and type".to_string(),
        });
    };
    let detail = match raw.detail.map(Value::from) {
        Some(Value::Map(detail)) => detail,
        _ => {
            return Err(RulesError::InvalidRule {
                reason: format!("consequence '{id}' has no detail object"),
            })
        }
    };

    Ok(Consequence {
        id,
        kind: ConsequenceKind::from_name(&kind),
        detail,
    })
}

fn invalid(err: serde_json::Error) -> RulesError {
    RulesError::InvalidRule {
        reason: err.to_string(),
    }
}
