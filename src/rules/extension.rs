//! Hub integration for the rules engine and the rule acquisition boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::{CoreError, CoreResult, HubError};
use crate::event::Event;
use crate::hub::{EventHub, Extension, ExtensionRegistration, ExtensionRuntime};

use super::engine::{RulesEngine, RulesEngineConfig};

/// Registry key of the rules extension.
pub const RULES_EXTENSION_TYPE_NAME: &str = "com.adobe.module.rulesengine";
const RULES_EXTENSION_FRIENDLY_NAME: &str = "Rules Engine";

/// Result of asking a [`RulesFetcher`] for a rules document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A fresh rules document.
    Rules(Vec<u8>),
    /// The previously fetched document is still current.
    NotModified,
    Failed(String),
}

/// Source of rules documents, e.g. a bundled file or a download cache.
pub trait RulesFetcher {
    fn fetch(&self, url: &str) -> FetchOutcome;
}

/// Fetches `url` and installs the result in `engine`.
///
/// Returns the number of rules loaded, or `None` when the current rules
/// were kept.
fn load_into(engine: &RulesEngine, fetcher: &dyn RulesFetcher, url: &str) -> CoreResult<Option<usize>> {
    match fetcher.fetch(url) {
        FetchOutcome::Rules(bytes) => {
            let count = engine.replace_rules_from_json(&bytes)?;
            log::debug!("({}) loaded {count} rule(s) from {url}", engine.config().name);
            Ok(Some(count))
        }
        FetchOutcome::NotModified => {
            log::debug!("({}) rules at {url} not modified, keeping current rules", engine.config().name);
            Ok(None)
        }
        FetchOutcome::Failed(reason) => {
            log::warn!("({}) unable to fetch rules from {url}: {reason}", engine.config().name);
            Ok(None)
        }
    }
}

/// Extension that runs every dispatched event through a [`RulesEngine`].
///
/// The engine is installed as a hub preprocessor when the extension
/// registers, so each event is evaluated once on the hub worker and the
/// event returned by `add`/`mod` consequences is the one every listener
/// receives. After unregistration the preprocessor passes events through
/// untouched.
pub struct RulesExtension {
    runtime: ExtensionRuntime,
    engine: Arc<RulesEngine>,
    active: Arc<AtomicBool>,
}

impl RulesExtension {
    /// Builds the extension around a fresh engine.
    #[must_use]
    pub fn with_config(runtime: ExtensionRuntime, config: RulesEngineConfig) -> Self {
        let engine = Arc::new(RulesEngine::new(config, runtime.clone()));
        Self {
            runtime,
            engine,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a rules extension on `hub` under
    /// [`RULES_EXTENSION_TYPE_NAME`]. The returned handle reaches the engine
    /// once the extension has been constructed.
    pub fn register(hub: &EventHub, config: RulesEngineConfig) -> CoreResult<(ExtensionRegistration, RulesHandle)> {
        let handle = RulesHandle::default();
        let slot = handle.clone();
        let registration = hub.register_extension_with(RULES_EXTENSION_TYPE_NAME, move |runtime| {
            let ext = Self::with_config(runtime, config);
            // Only one construction per handle.
            let _ = slot.engine.set(Arc::clone(&ext.engine));
            Some(Box::new(ext) as Box<dyn Extension>)
        })?;
        Ok((registration, handle))
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<RulesEngine> {
        &self.engine
    }

    /// Fetches `url` and replaces the rules on success. See [`RulesHandle::load_rules`].
    pub fn load_rules(&self, fetcher: &dyn RulesFetcher, url: &str) -> CoreResult<Option<usize>> {
        load_into(&self.engine, fetcher, url)
    }
}

impl Extension for RulesExtension {
    fn name(&self) -> &str {
        &self.engine.config().name
    }

    fn friendly_name(&self) -> &str {
        RULES_EXTENSION_FRIENDLY_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn on_registered(&mut self) {
        self.active.store(true, Ordering::SeqCst);
        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        self.runtime.register_preprocessor(move |event: Event| {
            if active.load(Ordering::SeqCst) {
                engine.process(&event)
            } else {
                event
            }
        });
    }

    fn on_unregistered(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn new(runtime: ExtensionRuntime) -> Option<Self> {
        Some(Self::with_config(runtime, RulesEngineConfig::default()))
    }
}

impl std::fmt::Debug for RulesExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesExtension")
            .field("engine", &self.engine)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Caller-side handle to a registered [`RulesExtension`]'s engine.
#[derive(Debug, Clone, Default)]
pub struct RulesHandle {
    engine: Arc<OnceLock<Arc<RulesEngine>>>,
}

impl RulesHandle {
    /// The engine, once the extension has been constructed.
    #[must_use]
    pub fn engine(&self) -> Option<Arc<RulesEngine>> {
        self.engine.get().cloned()
    }

    /// Fetches `url` and replaces the rules when a fresh document arrives.
    ///
    /// `NotModified` and fetch failures keep the current rules. A document
    /// that is not valid rules JSON is an error and also keeps them.
    pub fn load_rules(&self, fetcher: &dyn RulesFetcher, url: &str) -> CoreResult<Option<usize>> {
        let engine = self.engine().ok_or_else(|| {
            CoreError::Hub(HubError::ExtensionNotRegistered {
                name: RULES_EXTENSION_TYPE_NAME.to_string(),
            })
        })?;
        load_into(&engine, fetcher, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RulesError;
    use std::collections::HashMap;

    struct MapFetcher(HashMap<&'static str, FetchOutcome>);

    impl RulesFetcher for MapFetcher {
        fn fetch(&self, url: &str) -> FetchOutcome {
            self.0
                .get(url)
                .cloned()
                .unwrap_or_else(|| FetchOutcome::Failed(format!("404 for {url}")))
        }
    }

    fn fetcher() -> MapFetcher {
        let rules = br#"{"version":1,"rules":[{"condition":{"type":"matcher","definition":{"key":"k","matcher":"ex","values":[]}},"consequences":[]}]}"#;
        MapFetcher(HashMap::from([
            ("fresh", FetchOutcome::Rules(rules.to_vec())),
            ("same", FetchOutcome::NotModified),
            ("broken", FetchOutcome::Rules(b"<html>".to_vec())),
        ]))
    }

    #[test]
    fn test_handle_before_registration() {
        let handle = RulesHandle::default();
        assert!(handle.engine().is_none());
        let err = handle.load_rules(&fetcher(), "fresh").unwrap_err();
        assert!(err.is_hub());
    }

    #[test]
    fn test_load_outcomes() {
        let hub = EventHub::new();
        let (registration, handle) = RulesExtension::register(&hub, RulesEngineConfig::default()).unwrap();
        registration.wait().unwrap();

        let f = fetcher();
        assert_eq!(handle.load_rules(&f, "fresh").unwrap(), Some(1));
        assert_eq!(handle.load_rules(&f, "same").unwrap(), None);
        assert_eq!(handle.load_rules(&f, "missing").unwrap(), None);
        let err = handle.load_rules(&f, "broken").unwrap_err();
        assert!(matches!(err, CoreError::Rules(RulesError::InvalidJson { .. })));
        assert_eq!(handle.engine().unwrap().rules().len(), 1);
        hub.shutdown();
    }
}
