//! # corebus
//!
//! In-process coordination core for instrumentation SDKs: an event hub that
//! lets independently registered extensions talk through immutable events
//! and versioned shared state, plus a rules engine that reacts to the event
//! stream by rewriting payloads or dispatching new events.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use corebus::{Event, EventHub, EventSource, EventType, RulesEngineConfig, RulesExtension};
//!
//! let hub = EventHub::new();
//! let (registration, rules) = RulesExtension::register(&hub, RulesEngineConfig::default())?;
//! registration.wait()?;
//! hub.start();
//!
//! rules.engine().unwrap().replace_rules_from_json(bundle_bytes)?;
//! hub.dispatch(Event::new("launch", EventType::GENERIC_TRACK, EventSource::REQUEST_CONTENT, None));
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod data;
pub mod error;
pub mod event;
pub mod hub;
pub mod rules;
pub mod value;

pub use error::{CoreError, CoreResult, HubError, RulesError};
pub use event::{Event, EventId, EventSource, EventType};
pub use hub::{
    EventHub, EventHubConfig, Extension, ExtensionRegistration, ExtensionRuntime, ListenerId, SharedStateQuery,
    SharedStateResolver, SharedStateResult, SharedStateStatus,
};
pub use rules::{
    FetchOutcome, Rule, RulesEngine, RulesEngineConfig, RulesExtension, RulesFetcher, RulesHandle,
};
pub use value::{EventData, Value};
