//! Listener registrations and matching rules.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{Event, EventId, EventSource, EventType};

/// Callback invoked for every matching event.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// One-shot callback for a response; `None` on timeout.
pub type ResponseCallback = Box<dyn FnOnce(Option<&Event>) + Send>;

/// Rewrites every event before it reaches any listener.
pub type EventPreprocessor = Arc<dyn Fn(Event) -> Event + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(Uuid);

impl ListenerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub id: ListenerId,
    pub event_type: String,
    pub source: String,
    pub callback: EventListener,
}

impl ListenerEntry {
    pub fn new(event_type: &str, source: &str, callback: EventListener) -> Self {
        Self {
            id: ListenerId::new(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            callback,
        }
    }

    fn is_full_wildcard(&self) -> bool {
        self.event_type == EventType::WILDCARD && self.source == EventSource::WILDCARD
    }

    /// Response events only reach listeners registered on both wildcards;
    /// everything else matches on exact or wildcard type and source.
    pub fn should_notify(&self, event: &Event) -> bool {
        if event.response_id().is_some() {
            return self.is_full_wildcard();
        }
        (self.event_type == EventType::WILDCARD || self.event_type == event.event_type())
            && (self.source == EventSource::WILDCARD || self.source == event.source())
    }

    /// Runs the callback, containing any panic.
    pub fn notify(&self, event: &Event, owner: &str) {
        let callback = &self.callback;
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            log::error!("{owner}: listener {} panicked while handling {event}", self.id);
        }
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub(crate) struct PendingResponse {
    pub trigger: EventId,
    pub deadline: Instant,
    pub callback: ResponseCallback,
}

impl PendingResponse {
    pub fn invoke(self, response: Option<&Event>) {
        let callback = self.callback;
        if catch_unwind(AssertUnwindSafe(move || callback(response))).is_err() {
            log::error!("response listener for {} panicked", self.trigger);
        }
    }
}
