//! The rules engine: evaluates the current rule set against each event and
//! applies the consequences of every matching rule.
//!
//! Evaluation is sequential over the working event. `add` and `mod`
//! consequences replace the working event's data, so later rules observe
//! earlier merges. Every other consequence dispatches a new event chained to
//! the trigger. Chain depth is tracked in a side table keyed by event id;
//! events deeper than [`RulesEngineConfig::max_chain_depth`] are passed
//! through without evaluation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::data::merge;
use crate::error::RulesError;
use crate::event::{Event, EventId, EventSource, EventType};
use crate::hub::{EventHub, ExtensionRuntime};
use crate::value::{EventData, Value};

use super::parser::{parse_rules, Consequence, ConsequenceKind, Rule};
use super::template::Transformer;
use super::token::{SharedStateAccess, TokenResolver, TokenSource};

pub const CONSEQUENCE_EVENT_NAME: &str = "Rules Consequence Event";
pub const CONSEQUENCE_DISPATCH_EVENT_NAME: &str = "Dispatch Consequence Result";

pub const KEY_ID: &str = "id";
pub const KEY_TYPE: &str = "type";
pub const KEY_DETAIL: &str = "detail";
pub const KEY_TRIGGERED_CONSEQUENCE: &str = "triggeredconsequence";
pub const KEY_EVENT_DATA: &str = "eventdata";
pub const KEY_SOURCE: &str = "source";
pub const KEY_EVENT_DATA_ACTION: &str = "eventdataaction";
/// Data key naming the engine in its reset event.
pub const KEY_RULES_ENGINE_NAME: &str = "name";

const ACTION_COPY: &str = "copy";
const ACTION_NEW: &str = "new";

/// Receives events produced by consequences.
pub trait EventSink: Send + Sync {
    fn dispatch_event(&self, event: Event);
}

impl EventSink for EventHub {
    fn dispatch_event(&self, event: Event) {
        self.dispatch(event);
    }
}

impl EventSink for ExtensionRuntime {
    fn dispatch_event(&self, event: Event) {
        self.dispatch(event);
    }
}

/// Observes every rule evaluation: `(matched, rule index, event)`.
pub type RulesTracer = Arc<dyn Fn(bool, usize, &Event) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RulesEngineConfig {
    /// Engine name; identifies this engine's reset event.
    pub name: String,
    /// Deepest consequence chain still evaluated. Externally dispatched
    /// events are depth 0.
    pub max_chain_depth: u32,
    /// Value of the `~sdkver` token.
    pub sdk_version: String,
}

impl Default for RulesEngineConfig {
    fn default() -> Self {
        Self {
            name: "com.adobe.module.rulesengine".to_string(),
            max_chain_depth: 1,
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct RulesEngine {
    config: RulesEngineConfig,
    transformer: Transformer,
    states: Arc<dyn SharedStateAccess>,
    sink: Arc<dyn EventSink>,
    rules: RwLock<Arc<Vec<Rule>>>,
    depths: Mutex<HashMap<EventId, u32>>,
    /// `Some` until this engine's first reset event is processed.
    waiting: Mutex<Option<Vec<(Event, u32)>>>,
    tracer: RwLock<Option<RulesTracer>>,
}

impl RulesEngine {
    /// Creates an engine with no rules. `host` serves `~state` lookups and
    /// receives consequence events.
    pub fn new<H>(config: RulesEngineConfig, host: H) -> Self
    where
        H: SharedStateAccess + EventSink + 'static,
    {
        let host = Arc::new(host);
        Self {
            config,
            transformer: Transformer::default(),
            states: Arc::clone(&host) as Arc<dyn SharedStateAccess>,
            sink: host as Arc<dyn EventSink>,
            rules: RwLock::new(Arc::new(Vec::new())),
            depths: Mutex::new(HashMap::new()),
            waiting: Mutex::new(Some(Vec::new())),
            tracer: RwLock::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RulesEngineConfig {
        &self.config
    }

    /// The current rule set.
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in a new rule set and dispatches this engine's reset event so
    /// events seen before the first rule set get evaluated against it.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        log::debug!("({}) loaded {count} rule(s)", self.config.name);

        let mut data = EventData::new();
        data.insert(KEY_RULES_ENGINE_NAME.to_string(), Value::from(self.config.name.as_str()));
        self.sink.dispatch_event(Event::new(
            self.config.name.as_str(),
            EventType::RULES_ENGINE,
            EventSource::REQUEST_RESET,
            Some(data),
        ));
    }

    /// Parses a rules document and replaces the rule set with it. Returns
    /// the number of rules loaded.
    pub fn replace_rules_from_json(&self, bytes: &[u8]) -> Result<usize, RulesError> {
        let rules = parse_rules(bytes)?;
        let count = rules.len();
        self.replace_rules(rules);
        Ok(count)
    }

    pub fn trace<F>(&self, tracer: F)
    where
        F: Fn(bool, usize, &Event) + Send + Sync + 'static,
    {
        *self.tracer.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(tracer));
    }

    /// Evaluates every rule against `event` and returns the event as
    /// modified by `add` and `mod` consequences.
    ///
    /// Until the engine's own reset event (dispatched by
    /// [`replace_rules`](Self::replace_rules)) comes back through `process`,
    /// every event is also kept for replay. The host must route dispatched
    /// events back into the engine, or that buffer keeps growing.
    pub fn process(&self, event: &Event) -> Event {
        let depth = self
            .depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event.id())
            .unwrap_or(0);

        let replay = {
            let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
            if waiting.is_some() && self.is_reset_event(event) {
                waiting.take()
            } else {
                if let Some(buffer) = waiting.as_mut() {
                    buffer.push((event.clone(), depth));
                }
                None
            }
        };
        if let Some(buffered) = replay {
            log::debug!("({}) reprocessing {} waiting event(s)", self.config.name, buffered.len());
            for (waiting_event, waiting_depth) in buffered {
                self.evaluate(&waiting_event, waiting_depth);
            }
        }

        self.evaluate(event, depth)
    }

    fn is_reset_event(&self, event: &Event) -> bool {
        event.event_type() == EventType::RULES_ENGINE
            && event.source() == EventSource::REQUEST_RESET
            && event
                .data()
                .and_then(|d| d.get(KEY_RULES_ENGINE_NAME))
                .and_then(Value::as_str)
                == Some(self.config.name.as_str())
    }

    fn evaluate(&self, event: &Event, depth: u32) -> Event {
        if depth > self.config.max_chain_depth {
            log::trace!(
                "({}) chain depth {depth} exceeds {}, not evaluating {event}",
                self.config.name,
                self.config.max_chain_depth
            );
            return event.clone();
        }

        let rules = self.rules();
        let tracer = self.tracer.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut working = event.clone();

        for (index, rule) in rules.iter().enumerate() {
            let rendered: Vec<(&Consequence, EventData)> = {
                let resolver = TokenResolver::new(&working, Some(self.states.as_ref()), &self.config.sdk_version);
                let matched = rule.condition.evaluate(&resolver, &self.transformer);
                if let Some(tracer) = &tracer {
                    tracer(matched, index, &working);
                }
                if !matched {
                    continue;
                }
                rule.consequences
                    .iter()
                    .map(|c| (c, self.render_detail(&c.detail, &resolver)))
                    .collect()
            };

            for (consequence, detail) in rendered {
                match &consequence.kind {
                    ConsequenceKind::Add | ConsequenceKind::Mod => {
                        if let Some(data) = self.merge_consequence(consequence, &detail, working.data()) {
                            working = working.copy_with_new_data(Some(data));
                        }
                    }
                    ConsequenceKind::Dispatch => {
                        if let Some(out) = self.dispatch_consequence(consequence, &detail, &working) {
                            self.dispatch_chained(out, depth);
                        }
                    }
                    ConsequenceKind::Other(kind) => {
                        let out = consequence_event(&working, consequence, kind, detail);
                        self.dispatch_chained(out, depth);
                    }
                }
            }
        }
        working
    }

    fn merge_consequence(&self, consequence: &Consequence, detail: &EventData, to: Option<&EventData>) -> Option<EventData> {
        let kind = consequence.kind.as_str();
        let Some(from) = detail.get(KEY_EVENT_DATA).and_then(Value::as_map) else {
            log::error!(
                "({}) unable to process '{kind}' consequence {}: 'eventdata' is missing from detail",
                self.config.name,
                consequence.id
            );
            return None;
        };
        let Some(to) = to else {
            log::error!(
                "({}) unable to process '{kind}' consequence {}: the triggering event has no data",
                self.config.name,
                consequence.id
            );
            return None;
        };
        log::trace!("({}) applying '{kind}' consequence {}", self.config.name, consequence.id);
        Some(merge(to, from, consequence.kind == ConsequenceKind::Mod))
    }

    fn dispatch_consequence(&self, consequence: &Consequence, detail: &EventData, working: &Event) -> Option<Event> {
        let field = |key: &str| detail.get(key).and_then(Value::as_str);
        let missing = |key: &str| {
            log::error!(
                "({}) unable to process dispatch consequence {}: '{key}' is missing from detail",
                self.config.name,
                consequence.id
            );
        };

        let Some(event_type) = field(KEY_TYPE) else {
            missing(KEY_TYPE);
            return None;
        };
        let Some(source) = field(KEY_SOURCE) else {
            missing(KEY_SOURCE);
            return None;
        };
        let Some(action) = field(KEY_EVENT_DATA_ACTION) else {
            missing(KEY_EVENT_DATA_ACTION);
            return None;
        };

        let data = match action {
            ACTION_COPY => working.data().cloned(),
            ACTION_NEW => detail
                .get(KEY_EVENT_DATA)
                .and_then(Value::as_map)
                .map(|d| d.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect()),
            other => {
                log::error!(
                    "({}) unable to process dispatch consequence {}: unsupported eventdataaction '{other}', expected copy or new",
                    self.config.name,
                    consequence.id
                );
                return None;
            }
        };

        Some(working.create_chained_event(CONSEQUENCE_DISPATCH_EVENT_NAME, event_type, source, data))
    }

    fn dispatch_chained(&self, event: Event, parent_depth: u32) {
        log::trace!("({}) dispatching consequence event {event}", self.config.name);
        // Record before dispatching; the event may come back on another thread.
        self.depths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id(), parent_depth.saturating_add(1));
        self.sink.dispatch_event(event);
    }

    /// Renders `{%...%}` tokens in every string of `detail`, recursing into
    /// nested maps.
    fn render_detail(&self, detail: &EventData, source: &dyn TokenSource) -> EventData {
        detail
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => Value::String(self.transformer.render(s, source)),
                    Value::Map(m) => Value::Map(self.render_detail(m, source)),
                    other => other.clone(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}

impl std::fmt::Debug for RulesEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesEngine")
            .field("config", &self.config)
            .field("rules", &self.rules().len())
            .finish_non_exhaustive()
    }
}

/// Builds the event for a consequence of a kind the engine does not apply
/// itself.
fn consequence_event(trigger: &Event, consequence: &Consequence, kind: &str, mut detail: EventData) -> Event {
    let source = match detail.get(KEY_SOURCE) {
        Some(Value::String(s)) => s.clone(),
        _ => EventSource::RESPONSE_CONTENT.to_string(),
    };

    let data = match detail.remove(KEY_EVENT_DATA) {
        Some(Value::Map(data)) => data,
        other => {
            if let Some(value) = other {
                detail.insert(KEY_EVENT_DATA.to_string(), value);
            }
            let mut triggered = EventData::new();
            triggered.insert(KEY_ID.to_string(), Value::from(consequence.id.as_str()));
            triggered.insert(KEY_TYPE.to_string(), Value::from(kind));
            triggered.insert(KEY_DETAIL.to_string(), Value::Map(detail));
            let mut data = EventData::new();
            data.insert(KEY_TRIGGERED_CONSEQUENCE.to_string(), Value::Map(triggered));
            data
        }
    };

    trigger.create_chained_event(CONSEQUENCE_EVENT_NAME, kind, source, Some(data))
}
