//! Resolves rule tokens (`~type`, `~state.owner/key`, dotted data paths)
//! against one event.

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};
use rand::Rng;

use crate::data::{flatten, query_string};
use crate::event::Event;
use crate::hub::{EventHub, ExtensionRuntime};
use crate::value::{EventData, Value};

pub const TOKEN_EVENT_TYPE: &str = "~type";
pub const TOKEN_EVENT_SOURCE: &str = "~source";
pub const TOKEN_TIMESTAMP_UNIX: &str = "~timestampu";
pub const TOKEN_TIMESTAMP_ISO8601_NO_COLON: &str = "~timestampz";
pub const TOKEN_TIMESTAMP_ISO8601_UTC_MILLIS: &str = "~timestampp";
pub const TOKEN_SDK_VERSION: &str = "~sdkver";
pub const TOKEN_CACHEBUST: &str = "~cachebust";
pub const TOKEN_ALL_URL: &str = "~all_url";
pub const TOKEN_ALL_JSON: &str = "~all_json";
pub const TOKEN_SHARED_STATE: &str = "~state";

const CACHEBUST_UPPER_BOUND: i64 = 100_000_000;

/// Anything a condition or template can look keys up in.
pub trait TokenSource {
    /// Returns the value for `key`, or `None` when it does not resolve.
    fn get(&self, key: &str) -> Option<Value>;
}

impl TokenSource for EventData {
    fn get(&self, key: &str) -> Option<Value> {
        flatten(self, "").remove(key)
    }
}

/// Non-barrier shared-state reads used by `~state` tokens.
pub trait SharedStateAccess: Send + Sync {
    fn shared_state(&self, owner: &str, event: &Event) -> Option<EventData>;
}

impl SharedStateAccess for EventHub {
    fn shared_state(&self, owner: &str, event: &Event) -> Option<EventData> {
        self.get_shared_state(owner, Some(event), false)?.value
    }
}

impl SharedStateAccess for ExtensionRuntime {
    fn shared_state(&self, owner: &str, event: &Event) -> Option<EventData> {
        self.get_shared_state(owner, Some(event), false)?.value
    }
}

/// Token resolution context for a single evaluation pass.
///
/// The clock is read once at construction so every timestamp token in the
/// pass agrees. Flattened event data and `~state` lookups are computed on
/// first use and reused for the rest of the pass.
pub struct TokenResolver<'a> {
    event: &'a Event,
    states: Option<&'a dyn SharedStateAccess>,
    sdk_version: &'a str,
    now: DateTime<Utc>,
    flat: OnceCell<Option<EventData>>,
    state_cache: RefCell<HashMap<String, Option<Value>>>,
}

impl<'a> TokenResolver<'a> {
    #[must_use]
    pub fn new(event: &'a Event, states: Option<&'a dyn SharedStateAccess>, sdk_version: &'a str) -> Self {
        Self {
            event,
            states,
            sdk_version,
            now: Utc::now(),
            flat: OnceCell::new(),
            state_cache: RefCell::new(HashMap::new()),
        }
    }

    pub const fn event(&self) -> &Event {
        self.event
    }

    fn flat_data(&self) -> Option<&EventData> {
        self.flat
            .get_or_init(|| self.event.data().map(|d| flatten(d, "")))
            .as_ref()
    }

    fn shared_state_value(&self, key: &str) -> Option<Value> {
        if let Some(cached) = self.state_cache.borrow().get(key) {
            return cached.clone();
        }

        let resolved = self.lookup_shared_state(key);
        self.state_cache
            .borrow_mut()
            .insert(key.to_string(), resolved.clone());
        resolved
    }

    fn lookup_shared_state(&self, key: &str) -> Option<Value> {
        let rest = key.strip_prefix(TOKEN_SHARED_STATE)?.strip_prefix('.')?;
        let (owner, path) = rest.split_once('/')?;
        let states = self.states?;
        let Some(data) = states.shared_state(owner, self.event) else {
            log::trace!("cannot find the shared state of extension [{owner}]");
            return None;
        };
        flatten(&data, "").remove(path)
    }
}

impl TokenSource for TokenResolver<'_> {
    fn get(&self, key: &str) -> Option<Value> {
        match key {
            TOKEN_EVENT_TYPE => Some(Value::from(self.event.event_type())),
            TOKEN_EVENT_SOURCE => Some(Value::from(self.event.source())),
            TOKEN_TIMESTAMP_UNIX => Some(Value::Int(self.now.timestamp())),
            TOKEN_TIMESTAMP_ISO8601_NO_COLON => Some(Value::from(
                self.now
                    .with_timezone(&Local)
                    .format("%Y-%m-%dT%H:%M:%S%z")
                    .to_string(),
            )),
            TOKEN_TIMESTAMP_ISO8601_UTC_MILLIS => {
                Some(Value::from(self.now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()))
            }
            TOKEN_SDK_VERSION => Some(Value::from(self.sdk_version)),
            TOKEN_CACHEBUST => Some(Value::from(
                rand::rng().random_range(1..CACHEBUST_UPPER_BOUND).to_string(),
            )),
            TOKEN_ALL_URL => Some(Value::from(
                self.flat_data().map(query_string).unwrap_or_default(),
            )),
            TOKEN_ALL_JSON => Some(Value::from(
                self.event
                    .data()
                    .map(|d| Value::Map(d.clone()).to_json().to_string())
                    .unwrap_or_default(),
            )),
            _ if key.starts_with(TOKEN_SHARED_STATE) => self.shared_state_value(key),
            _ => self.flat_data()?.get(key).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventSource, EventType};
    use crate::value::data_from_json;
    use serde_json::json;

    struct FixedStates;

    impl SharedStateAccess for FixedStates {
        fn shared_state(&self, owner: &str, _event: &Event) -> Option<EventData> {
            (owner == "com.adobe.module.lifecycle")
                .then(|| data_from_json(json!({"lifecyclecontextdata": {"launches": 4}})))
        }
    }

    fn event() -> Event {
        Event::new(
            "test",
            EventType::GENERIC_TRACK,
            EventSource::REQUEST_CONTENT,
            Some(data_from_json(json!({"action": "buy", "ctx": {"qty": 2, "tags": ["a", "b"]}}))),
        )
    }

    #[test]
    fn test_pseudo_fields() {
        let e = event();
        let r = TokenResolver::new(&e, None, "1.2.3");
        assert_eq!(r.get("~type"), Some(Value::from(EventType::GENERIC_TRACK)));
        assert_eq!(r.get("~source"), Some(Value::from(EventSource::REQUEST_CONTENT)));
        assert_eq!(r.get("~sdkver"), Some(Value::from("1.2.3")));
        assert!(r.get("~timestampu").unwrap().is_int());
    }

    #[test]
    fn test_timestamp_formats() {
        let e = event();
        let r = TokenResolver::new(&e, None, "");
        let utc = r.get("~timestampp").unwrap();
        let utc = utc.as_str().unwrap();
        assert!(utc.ends_with('Z'));
        assert_eq!(utc.len(), "2024-01-01T00:00:00.000Z".len());

        let local = r.get("~timestampz").unwrap();
        let local = local.as_str().unwrap();
        assert_eq!(local.len(), "2024-01-01T00:00:00+0000".len());
        assert!(!local[19..].contains(':'));
    }

    #[test]
    fn test_cachebust_range() {
        let e = event();
        let r = TokenResolver::new(&e, None, "");
        for _ in 0..20 {
            let v = r.get("~cachebust").unwrap();
            let n: i64 = v.as_str().unwrap().parse().unwrap();
            assert!((1..100_000_000).contains(&n));
        }
    }

    #[test]
    fn test_flattened_data_paths() {
        let e = event();
        let r = TokenResolver::new(&e, None, "");
        assert_eq!(r.get("action"), Some(Value::from("buy")));
        assert_eq!(r.get("ctx.qty"), Some(Value::Int(2)));
        assert_eq!(r.get("ctx.tags.1"), Some(Value::from("b")));
        assert_eq!(r.get("ctx.missing"), None);
    }

    #[test]
    fn test_all_url_and_json() {
        let e = event();
        let r = TokenResolver::new(&e, None, "");
        let url = r.get("~all_url").unwrap();
        assert_eq!(url.as_str().unwrap(), "action=buy&ctx.qty=2&ctx.tags.0=a&ctx.tags.1=b");

        let json = r.get("~all_json").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(json.as_str().unwrap()).unwrap();
        assert_eq!(parsed["ctx"]["qty"], 2);
    }

    #[test]
    fn test_missing_data_is_absent() {
        let e = Event::new("n", EventType::CUSTOM, EventSource::NONE, None);
        let r = TokenResolver::new(&e, None, "");
        assert_eq!(r.get("anything"), None);
        assert_eq!(r.get("~all_url"), Some(Value::from("")));
        assert_eq!(r.get("~all_json"), Some(Value::from("")));
    }

    #[test]
    fn test_shared_state_token() {
        let e = event();
        let states = FixedStates;
        let r = TokenResolver::new(&e, Some(&states), "");
        assert_eq!(
            r.get("~state.com.adobe.module.lifecycle/lifecyclecontextdata.launches"),
            Some(Value::Int(4))
        );
        // cached lookups answer the same
        assert_eq!(
            r.get("~state.com.adobe.module.lifecycle/lifecyclecontextdata.launches"),
            Some(Value::Int(4))
        );
        assert_eq!(r.get("~state.com.adobe.module.other/x"), None);
        assert_eq!(r.get("~state.malformed"), None);
    }
}
