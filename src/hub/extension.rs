//! The extension contract and the runtime handle extensions talk to.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{CoreError, CoreResult, HubError};
use crate::event::Event;
use crate::value::EventData;

use super::container::{ContainerMsg, ExtensionContainer};
use super::dispatcher::{EventHub, HubInner, SharedStateQuery, SharedStateResolver};
use super::listener::{ListenerEntry, ListenerId};
use super::shared_state::{SharedStateResult, SharedStateType};

/// A module registered with the hub.
///
/// The hub constructs the extension on its own worker thread, calls
/// [`Extension::on_registered`], and from then on delivers events to the
/// listeners it registered through its [`ExtensionRuntime`], one at a time
/// and in dispatch order.
pub trait Extension: Send + 'static {
    /// Shared-state owner name. Lookups are case-insensitive.
    fn name(&self) -> &str;

    /// Display name published in the hub shared state.
    fn friendly_name(&self) -> &str {
        self.name()
    }

    fn version(&self) -> &str;

    fn metadata(&self) -> Option<EventData> {
        None
    }

    fn on_registered(&mut self) {}

    fn on_unregistered(&mut self) {}

    /// Returning false parks `event` at the head of this extension's queue;
    /// delivery is retried later.
    fn ready_for_event(&mut self, _event: &Event) -> bool {
        true
    }

    /// Builds the extension. `None` reports an initialization failure.
    fn new(runtime: ExtensionRuntime) -> Option<Self>
    where
        Self: Sized;
}

/// Handle through which an extension reaches the hub.
///
/// Holds only a weak hub reference; once the hub is gone every operation
/// becomes a no-op or reports [`HubError::Disconnected`].
#[derive(Clone)]
pub struct ExtensionRuntime {
    hub: Weak<HubInner>,
    container: Arc<ExtensionContainer>,
}

impl ExtensionRuntime {
    pub(crate) fn new(hub: Weak<HubInner>, container: Arc<ExtensionContainer>) -> Self {
        Self { hub, container }
    }

    fn hub(&self) -> CoreResult<Arc<HubInner>> {
        self.hub.upgrade().ok_or_else(|| {
            CoreError::Hub(HubError::Disconnected {
                path: "event_hub".to_string(),
            })
        })
    }

    /// Returns a public handle to the owning hub, if it is still alive.
    #[must_use]
    pub fn event_hub(&self) -> Option<EventHub> {
        self.hub.upgrade().map(EventHub::from_inner)
    }

    /// The registry key this extension was registered under.
    pub fn type_name(&self) -> &str {
        self.container.type_name()
    }

    /// Registers a listener for `(event_type, source)`. Either may be the
    /// wildcard constant.
    pub fn register_listener<F>(&self, event_type: &str, source: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.container
            .add_listener(ListenerEntry::new(event_type, source, Arc::new(listener)))
    }

    /// Removes a listener. Returns false if it was not registered here.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.container.remove_listener(id)
    }

    pub fn dispatch(&self, event: Event) {
        match self.hub.upgrade() {
            Some(hub) => hub.dispatch(event),
            None => log::warn!("{}: hub is gone, dropping {event}", self.type_name()),
        }
    }

    pub fn register_response_listener<F>(&self, trigger: &Event, timeout: Duration, listener: F)
    where
        F: FnOnce(Option<&Event>) + Send + 'static,
    {
        if let Some(hub) = self.hub.upgrade() {
            hub.register_response_listener(trigger, timeout, Box::new(listener));
        }
    }

    pub fn register_preprocessor<F>(&self, preprocessor: F)
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        if let Some(hub) = self.hub.upgrade() {
            hub.register_preprocessor(Arc::new(preprocessor));
        }
    }

    pub fn create_shared_state(&self, data: EventData, event: Option<&Event>) -> CoreResult<()> {
        self.hub()?
            .create_shared_state(&self.owner_name()?, Some(data), event, SharedStateType::Standard)
    }

    pub fn create_pending_shared_state(&self, event: Option<&Event>) -> CoreResult<SharedStateResolver> {
        HubInner::create_pending_shared_state(&self.hub()?, &self.owner_name()?, event, SharedStateType::Standard)
    }

    pub fn create_xdm_shared_state(&self, data: EventData, event: Option<&Event>) -> CoreResult<()> {
        self.hub()?
            .create_shared_state(&self.owner_name()?, Some(data), event, SharedStateType::Xdm)
    }

    pub fn create_pending_xdm_shared_state(&self, event: Option<&Event>) -> CoreResult<SharedStateResolver> {
        HubInner::create_pending_shared_state(&self.hub()?, &self.owner_name()?, event, SharedStateType::Xdm)
    }

    pub fn get_shared_state(&self, extension_name: &str, event: Option<&Event>, barrier: bool) -> Option<SharedStateResult> {
        let query = SharedStateQuery {
            barrier,
            ..SharedStateQuery::default()
        };
        self.get_shared_state_with(extension_name, event, &query)
    }

    pub fn get_shared_state_with(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        query: &SharedStateQuery,
    ) -> Option<SharedStateResult> {
        self.hub.upgrade()?.get_shared_state(extension_name, event, query)
    }

    /// Resumes delivery after [`ExtensionRuntime::stop_events`].
    pub fn start_events(&self) {
        self.container.send(ContainerMsg::Start);
    }

    /// Pauses delivery; events keep queueing.
    pub fn stop_events(&self) {
        self.container.send(ContainerMsg::Stop);
    }

    /// Unregisters this extension from its hub.
    pub fn unregister_extension(&self) -> CoreResult<()> {
        self.hub()?.unregister_extension(self.type_name())
    }

    fn owner_name(&self) -> CoreResult<String> {
        self.container.shared_state_name().ok_or_else(|| {
            CoreError::Hub(HubError::ExtensionNotRegistered {
                name: self.type_name().to_string(),
            })
        })
    }
}

impl std::fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRuntime")
            .field("type_name", &self.type_name())
            .finish_non_exhaustive()
    }
}

/// Completion handle for an extension registration.
///
/// Registration returns as soon as the name is reserved; construction and
/// `on_registered` finish asynchronously on the extension's worker.
#[derive(Debug)]
pub struct ExtensionRegistration {
    type_name: String,
    rx: Receiver<Result<(), HubError>>,
}

impl ExtensionRegistration {
    pub(crate) fn new(type_name: String, rx: Receiver<Result<(), HubError>>) -> Self {
        Self { type_name, rx }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Blocks until the extension is constructed and registered.
    pub fn wait(self) -> CoreResult<()> {
        let path = self.type_name;
        self.rx
            .recv()
            .map_err(|_| CoreError::Hub(HubError::Disconnected { path }))?
            .map_err(CoreError::from)
    }

    /// Like [`ExtensionRegistration::wait`] with an upper bound.
    #[allow(clippy::cast_possible_truncation)]
    pub fn wait_timeout(self, timeout: Duration) -> CoreResult<()> {
        let path = self.type_name;
        self.rx
            .recv_timeout(timeout)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => CoreError::Hub(HubError::Timeout {
                    duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                }),
                RecvTimeoutError::Disconnected => CoreError::Hub(HubError::Disconnected { path }),
            })?
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn wait_reports_disconnected_when_sender_dropped() {
        let (tx, rx) = bounded::<Result<(), HubError>>(1);
        drop(tx);
        let reg = ExtensionRegistration::new("ext".to_string(), rx);
        let err = reg.wait().unwrap_err();
        let CoreError::Hub(HubError::Disconnected { path }) = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, "ext");
    }

    #[test]
    fn wait_timeout_reports_timeout_while_pending() {
        let (_tx, rx) = bounded::<Result<(), HubError>>(1);
        let reg = ExtensionRegistration::new("ext".to_string(), rx);
        let err = reg.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn wait_surfaces_initialization_failure() {
        let (tx, rx) = bounded::<Result<(), HubError>>(1);
        tx.send(Err(HubError::ExtensionInitializationFailure { name: "ext".to_string() }))
            .unwrap();
        let reg = ExtensionRegistration::new("ext".to_string(), rx);
        assert_eq!(
            reg.wait().unwrap_err(),
            CoreError::Hub(HubError::ExtensionInitializationFailure { name: "ext".to_string() })
        );
    }
}
