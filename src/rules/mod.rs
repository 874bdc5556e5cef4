//! Declarative rules over the event stream.
//!
//! A rule pairs a condition tree with consequences. [`RulesEngine`]
//! evaluates the rule set against each event, resolving keys through
//! [`TokenResolver`] and rendering `{%...%}` templates in consequence
//! details before applying them.

mod condition;
mod engine;
mod extension;
mod parser;
mod template;
mod token;

pub use condition::{coercion_for, ConditionNode, LogicalOp, Matcher, MatcherOp};
pub use engine::{
    EventSink, RulesEngine, RulesEngineConfig, RulesTracer, CONSEQUENCE_DISPATCH_EVENT_NAME, CONSEQUENCE_EVENT_NAME,
    KEY_DETAIL, KEY_EVENT_DATA, KEY_EVENT_DATA_ACTION, KEY_ID, KEY_RULES_ENGINE_NAME, KEY_SOURCE,
    KEY_TRIGGERED_CONSEQUENCE, KEY_TYPE,
};
pub use extension::{FetchOutcome, RulesExtension, RulesFetcher, RulesHandle, RULES_EXTENSION_TYPE_NAME};
pub use parser::{
    parse_condition, parse_rule, parse_rules, Consequence, ConsequenceKind, Rule, CONSEQUENCE_TYPE_ADD,
    CONSEQUENCE_TYPE_DISPATCH, CONSEQUENCE_TYPE_MOD,
};
pub use template::{render_value, Transform, Transformer, TOKEN_LEFT_DELIMITER, TOKEN_RIGHT_DELIMITER};
pub use token::{SharedStateAccess, TokenResolver, TokenSource};
