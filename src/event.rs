//! The immutable event envelope and well-known type/source names.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::flatten;
use crate::value::EventData;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known event types.
pub struct EventType;

impl EventType {
    pub const CONFIGURATION: &'static str = "com.adobe.eventType.configuration";
    pub const CUSTOM: &'static str = "com.adobe.eventType.custom";
    pub const GENERIC_TRACK: &'static str = "com.adobe.eventType.generic.track";
    pub const HUB: &'static str = "com.adobe.eventType.hub";
    pub const IDENTITY: &'static str = "com.adobe.eventType.identity";
    pub const LIFECYCLE: &'static str = "com.adobe.eventType.lifecycle";
    pub const RULES_ENGINE: &'static str = "com.adobe.eventType.rulesEngine";
    pub const SIGNAL: &'static str = "com.adobe.eventType.signal";
    pub const WILDCARD: &'static str = "com.adobe.eventType._wildcard_";
}

/// Well-known event sources.
pub struct EventSource;

impl EventSource {
    pub const NONE: &'static str = "com.adobe.eventSource.none";
    pub const REQUEST_CONTENT: &'static str = "com.adobe.eventSource.requestContent";
    pub const REQUEST_RESET: &'static str = "com.adobe.eventSource.requestReset";
    pub const RESPONSE_CONTENT: &'static str = "com.adobe.eventSource.responseContent";
    pub const SHARED_STATE: &'static str = "com.adobe.eventSource.sharedState";
    pub const BOOTED: &'static str = "com.adobe.eventSource.booted";
    pub const WILDCARD: &'static str = "com.adobe.eventSource._wildcard_";
}

/// An immutable event.
///
/// Events are never mutated after construction. Rules that rewrite the
/// payload produce a new `Event` through [`Event::copy_with_new_data`],
/// which keeps the identity and lineage of the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    name: String,
    #[serde(rename = "type")]
    event_type: String,
    source: String,
    timestamp: DateTime<Utc>,
    data: Option<EventData>,
    mask: Option<Vec<String>>,
    parent_id: Option<EventId>,
    response_id: Option<EventId>,
}

impl Event {
    /// Creates a new event with a fresh id and the current time.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Option<EventData>,
    ) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            data,
            mask: None,
            parent_id: None,
            response_id: None,
        }
    }

    /// Restricts [`Event::event_hash`] to the given flattened keys.
    #[must_use]
    pub fn with_mask(mut self, mask: Vec<String>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Creates a response to this event. The response carries this event's
    /// id as both its response id and its parent id.
    #[must_use]
    pub fn create_response_event(
        &self,
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Option<EventData>,
    ) -> Self {
        let mut event = Self::new(name, event_type, source, data);
        event.response_id = Some(self.id);
        event.parent_id = Some(self.id);
        event
    }

    /// Creates an event caused by this one.
    #[must_use]
    pub fn create_chained_event(
        &self,
        name: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Option<EventData>,
    ) -> Self {
        let mut event = Self::new(name, event_type, source, data);
        event.parent_id = Some(self.id);
        event
    }

    /// Returns a copy carrying `data` and every other field unchanged.
    #[must_use]
    pub fn copy_with_new_data(&self, data: Option<EventData>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    pub const fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub const fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    pub fn mask(&self) -> Option<&[String]> {
        self.mask.as_deref()
    }

    pub const fn parent_id(&self) -> Option<EventId> {
        self.parent_id
    }

    pub const fn response_id(&self) -> Option<EventId> {
        self.response_id
    }

    /// Stable 32-bit hash of the flattened payload.
    ///
    /// When a mask is set only the listed keys contribute. Events without
    /// data, or whose mask selects nothing, hash to 0.
    #[must_use]
    pub fn event_hash(&self) -> u32 {
        let Some(data) = &self.data else {
            return 0;
        };
        let flat = flatten(data, "");
        let mut hasher = blake3::Hasher::new();
        let mut hashed_any = false;
        for (key, value) in &flat {
            if let Some(mask) = &self.mask {
                if !mask.iter().any(|m| m == key) {
                    continue;
                }
            }
            hasher.update(key.as_bytes());
            hasher.update(b":");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b"\n");
            hashed_any = true;
        }
        if !hashed_any {
            return 0;
        }
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event[{} '{}' {}/{}]",
            self.id, self.name, self.event_type, self.source
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::data_from_json;
    use serde_json::json;

    fn sample() -> Event {
        Event::new(
            "launch",
            EventType::LIFECYCLE,
            EventSource::REQUEST_CONTENT,
            Some(data_from_json(json!({"a": 1, "b": {"c": "x"}}))),
        )
    }

    #[test]
    fn test_response_event_lineage() {
        let trigger = sample();
        let response = trigger.create_response_event("resp", EventType::LIFECYCLE, EventSource::RESPONSE_CONTENT, None);
        assert_eq!(response.response_id(), Some(trigger.id()));
        assert_eq!(response.parent_id(), Some(trigger.id()));
        assert_ne!(response.id(), trigger.id());
    }

    #[test]
    fn test_chained_event_has_parent_only() {
        let trigger = sample();
        let chained = trigger.create_chained_event("next", EventType::CUSTOM, EventSource::NONE, None);
        assert_eq!(chained.parent_id(), Some(trigger.id()));
        assert!(chained.response_id().is_none());
    }

    #[test]
    fn test_copy_with_new_data_keeps_identity() {
        let original = sample().with_mask(vec!["a".to_string()]);
        let copy = original.copy_with_new_data(Some(data_from_json(json!({"z": 0}))));
        assert_eq!(copy.id(), original.id());
        assert_eq!(copy.timestamp(), original.timestamp());
        assert_eq!(copy.name(), original.name());
        assert_eq!(copy.mask(), original.mask());
        assert_ne!(copy.data(), original.data());
    }

    #[test]
    fn test_event_hash_respects_mask() {
        let a = Event::new("e", EventType::CUSTOM, EventSource::NONE, Some(data_from_json(json!({"k": 1, "noise": 1}))))
            .with_mask(vec!["k".to_string()]);
        let b = Event::new("e", EventType::CUSTOM, EventSource::NONE, Some(data_from_json(json!({"k": 1, "noise": 2}))))
            .with_mask(vec!["k".to_string()]);
        assert_eq!(a.event_hash(), b.event_hash());
        assert_ne!(a.event_hash(), 0);

        let unmasked = Event::new("e", EventType::CUSTOM, EventSource::NONE, Some(data_from_json(json!({"k": 1, "noise": 2}))));
        assert_ne!(unmasked.event_hash(), a.event_hash());
    }

    #[test]
    fn test_event_hash_without_data() {
        let e = Event::new("e", EventType::CUSTOM, EventSource::NONE, None);
        assert_eq!(e.event_hash(), 0);
    }

    #[test]
    fn test_serialization_uses_type_key() {
        let e = sample();
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], EventType::LIFECYCLE);
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
