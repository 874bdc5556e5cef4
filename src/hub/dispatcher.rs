//! The event hub: registration, event numbering, ordered dispatch and
//! shared-state versioning.
//!
//! A dedicated worker thread owns the main event queue. It buffers events
//! until [`EventHub::start`], runs preprocessors, completes response
//! listeners, expires timed-out ones, and fans each event out to every
//! extension container. Event numbers are assigned synchronously inside
//! [`EventHub::dispatch`], so a shared state created right after a dispatch
//! returns always versions at that event.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::error::{CoreResult, HubError};
use crate::event::{Event, EventId, EventSource, EventType};
use crate::value::{EventData, Value};

use super::container::{ContainerMsg, ExtensionContainer, ExtensionFactory};
use super::extension::{Extension, ExtensionRegistration, ExtensionRuntime};
use super::listener::{EventPreprocessor, ListenerEntry, ListenerId, PendingResponse, ResponseCallback};
use super::shared_state::{SharedStateResolution, SharedStateResult, SharedStateStatus, SharedStateType};

/// Shared-state owner name of the hub itself.
pub const EVENT_HUB_NAME: &str = "com.adobe.module.eventhub";
/// Friendly name of the hub's own placeholder extension.
pub const EVENT_HUB_FRIENDLY_NAME: &str = "EventHub";
/// Name of the event announcing a shared-state change.
pub const STATE_CHANGE_EVENT_NAME: &str = "Shared state change";
/// Data key naming the owner in a shared-state change event.
pub const STATE_OWNER_KEY: &str = "stateowner";

const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry key used by [`EventHub::register_extension`] for type `E`.
#[must_use]
pub fn extension_type_name<E: Extension>() -> &'static str {
    std::any::type_name::<E>()
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct EventHubConfig {
    /// How often parked events are retried and idle workers check for
    /// shutdown.
    pub retry_interval: Duration,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Options for a shared-state lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedStateQuery {
    /// Report `Set` as `Pending` while the owner has not yet processed the
    /// events preceding the one the lookup is versioned at.
    pub barrier: bool,
    pub resolution: SharedStateResolution,
    pub state_type: SharedStateType,
}

/// Completes a pending shared state created by
/// [`EventHub::create_pending_shared_state`].
#[derive(Debug)]
pub struct SharedStateResolver {
    hub: Weak<HubInner>,
    owner: String,
    version: i64,
    state_type: SharedStateType,
}

impl SharedStateResolver {
    /// Version the pending entry was recorded at.
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }

    /// Replaces the pending placeholder with `data` and announces the change.
    pub fn resolve(self, data: EventData) {
        let Some(hub) = self.hub.upgrade() else {
            log::warn!("hub is gone, cannot resolve pending state for {}", self.owner);
            return;
        };
        let Some(container) = hub.find_by_owner(&self.owner) else {
            log::warn!("cannot resolve pending state: {} is no longer registered", self.owner);
            return;
        };
        if container.shared_state(self.state_type).update_pending(self.version, Some(data)) {
            log::debug!("pending {:?} state resolved for {} at version {}", self.state_type, self.owner, self.version);
            hub.dispatch(state_change_event(&self.owner));
        }
    }
}

#[derive(Debug)]
enum HubMsg {
    Event { event: Event, number: i64 },
    Start,
    Shutdown { reply: Sender<()> },
}

pub(crate) struct HubInner {
    config: EventHubConfig,
    counter: AtomicI64,
    /// Number of every event dispatched through this hub. Entries live as
    /// long as the hub so states can be versioned at, and looked up by, any
    /// earlier event; `shutdown` drops them with everything else.
    event_numbers: Mutex<HashMap<EventId, i64>>,
    registry: RwLock<HashMap<String, Arc<ExtensionContainer>>>,
    preprocessors: RwLock<Vec<EventPreprocessor>>,
    responses: Mutex<Vec<PendingResponse>>,
    started: AtomicBool,
    tx: Sender<HubMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an event hub. Cloning is cheap; all clones share one hub.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EventHubConfig::default())
    }

    /// Creates a hub and registers its placeholder extension, which owns the
    /// hub shared state and the listeners registered directly on the hub.
    #[must_use]
    pub fn with_config(config: EventHubConfig) -> Self {
        let (tx, rx) = unbounded::<HubMsg>();
        let tick = config.retry_interval;
        let inner = Arc::new(HubInner {
            config,
            counter: AtomicI64::new(0),
            event_numbers: Mutex::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            preprocessors: RwLock::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            tx,
            join: Mutex::new(None),
        });

        let worker_hub = Arc::downgrade(&inner);
        let join = thread::Builder::new()
            .name("corebus-hub".to_string())
            .spawn(move || hub_loop(&worker_hub, &rx, tick))
            .expect("failed to spawn corebus hub worker");
        *inner.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);

        let factory: ExtensionFactory = Box::new(|runtime| {
            HubPlaceholder::new(runtime).map(|ext| Box::new(ext) as Box<dyn Extension>)
        });
        if let Err(err) = inner.register(EVENT_HUB_NAME, Some(EVENT_HUB_NAME.to_string()), factory) {
            log::error!("failed to register hub placeholder: {err}");
        }

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<HubInner>) -> Self {
        Self { inner }
    }

    /// Starts delivery. Events dispatched earlier are delivered first, in
    /// their original order.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.tx.send(HubMsg::Start).is_err() {
            log::error!("hub worker is gone, cannot start");
            return;
        }
        self.inner.share_hub_state();
        log::debug!("event hub started");
    }

    /// Numbers the event and queues it for delivery.
    pub fn dispatch(&self, event: Event) {
        self.inner.dispatch(event);
    }

    /// Registers extension type `E` under its Rust type name.
    pub fn register_extension<E: Extension>(&self) -> CoreResult<ExtensionRegistration> {
        let factory: ExtensionFactory =
            Box::new(|runtime| E::new(runtime).map(|ext| Box::new(ext) as Box<dyn Extension>));
        self.inner.register(extension_type_name::<E>(), None, factory)
    }

    /// Registers an extension built by `factory` under `type_name`.
    ///
    /// An empty or already registered name fails immediately. Construction
    /// happens on the extension's worker; use the returned handle to wait.
    pub fn register_extension_with<F>(&self, type_name: &str, factory: F) -> CoreResult<ExtensionRegistration>
    where
        F: FnOnce(ExtensionRuntime) -> Option<Box<dyn Extension>> + Send + 'static,
    {
        self.inner.register(type_name, None, Box::new(factory))
    }

    /// Removes a registered extension. Its worker finishes the message it is
    /// handling, calls `on_unregistered`, and exits.
    pub fn unregister_extension(&self, type_name: &str) -> CoreResult<()> {
        self.inner.unregister_extension(type_name)
    }

    /// Registers a hub-level listener.
    pub fn register_listener<F>(&self, event_type: &str, source: &str, listener: F) -> Option<ListenerId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let Some(placeholder) = self.inner.container(EVENT_HUB_NAME) else {
            log::warn!("error registering event listener: hub placeholder missing");
            return None;
        };
        Some(placeholder.add_listener(ListenerEntry::new(event_type, source, Arc::new(listener))))
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner
            .container(EVENT_HUB_NAME)
            .is_some_and(|placeholder| placeholder.remove_listener(id))
    }

    /// Adds a preprocessor. Preprocessors run in registration order on the
    /// hub worker before any listener sees the event.
    pub fn register_preprocessor<F>(&self, preprocessor: F)
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.inner.register_preprocessor(Arc::new(preprocessor));
    }

    /// Invokes `listener` once: with the first event whose response id is
    /// `trigger`'s id, or with `None` after `timeout`.
    pub fn register_response_listener<F>(&self, trigger: &Event, timeout: Duration, listener: F)
    where
        F: FnOnce(Option<&Event>) + Send + 'static,
    {
        self.inner
            .register_response_listener(trigger, timeout, Box::new(listener));
    }

    pub fn create_shared_state(&self, extension_name: &str, data: EventData, event: Option<&Event>) -> CoreResult<()> {
        self.inner
            .create_shared_state(extension_name, Some(data), event, SharedStateType::Standard)
    }

    pub fn create_pending_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
    ) -> CoreResult<SharedStateResolver> {
        HubInner::create_pending_shared_state(&self.inner, extension_name, event, SharedStateType::Standard)
    }

    pub fn create_xdm_shared_state(&self, extension_name: &str, data: EventData, event: Option<&Event>) -> CoreResult<()> {
        self.inner
            .create_shared_state(extension_name, Some(data), event, SharedStateType::Xdm)
    }

    pub fn get_shared_state(&self, extension_name: &str, event: Option<&Event>, barrier: bool) -> Option<SharedStateResult> {
        let query = SharedStateQuery {
            barrier,
            ..SharedStateQuery::default()
        };
        self.inner.get_shared_state(extension_name, event, &query)
    }

    pub fn get_shared_state_with(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        query: &SharedStateQuery,
    ) -> Option<SharedStateResult> {
        self.inner.get_shared_state(extension_name, event, query)
    }

    /// Number assigned to `event` at dispatch, if it was dispatched here.
    #[must_use]
    pub fn event_number(&self, event: &Event) -> Option<i64> {
        self.inner.event_number(event.id())
    }

    #[must_use]
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.inner.container(type_name).is_some()
    }

    /// Stops every worker and clears all registrations. Blocks until the
    /// workers have exited, except a worker calling this itself.
    pub fn shutdown(&self) {
        let containers: Vec<Arc<ExtensionContainer>> = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for container in &containers {
            container.send(ContainerMsg::Unregister);
        }
        for container in &containers {
            container.join();
        }

        self.inner
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .preprocessors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .event_numbers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let (reply_tx, reply_rx) = bounded::<()>(1);
        if self.inner.tx.send(HubMsg::Shutdown { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv_timeout(Duration::from_secs(5));
        }
        let handle = self.inner.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("hub worker panicked");
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("events", &self.inner.counter.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl HubInner {
    fn register(
        self: &Arc<Self>,
        type_name: &str,
        preset_name: Option<String>,
        factory: ExtensionFactory,
    ) -> CoreResult<ExtensionRegistration> {
        if type_name.is_empty() {
            log::warn!("extension name must not be empty");
            return Err(HubError::InvalidExtensionName.into());
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(type_name) {
            log::warn!("cannot register extension {type_name} more than once");
            return Err(HubError::DuplicateExtensionName {
                name: type_name.to_string(),
            }
            .into());
        }

        let (reply_tx, reply_rx) = bounded::<Result<(), HubError>>(1);
        let container = ExtensionContainer::spawn(
            Arc::downgrade(self),
            type_name,
            preset_name,
            factory,
            self.config.retry_interval,
            reply_tx,
        )?;
        registry.insert(type_name.to_string(), container);
        Ok(ExtensionRegistration::new(type_name.to_string(), reply_rx))
    }

    pub(crate) fn unregister_extension(&self, type_name: &str) -> CoreResult<()> {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(type_name);
        let Some(container) = removed else {
            log::error!("cannot unregister {type_name}: not registered");
            return Err(HubError::ExtensionNotRegistered {
                name: type_name.to_string(),
            }
            .into());
        };
        container.send(ContainerMsg::Unregister);
        self.share_hub_state();
        Ok(())
    }

    /// Drops a container whose extension failed to build.
    pub(crate) fn forget_container(&self, type_name: &str) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(type_name);
    }

    /// Called by a container once its extension is registered.
    pub(crate) fn extension_ready(&self) {
        if self.started.load(Ordering::SeqCst) {
            self.share_hub_state();
        }
    }

    fn container(&self, type_name: &str) -> Option<Arc<ExtensionContainer>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
    }

    fn find_by_owner(&self, owner: &str) -> Option<Arc<ExtensionContainer>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|c| c.matches_owner(owner))
            .cloned()
    }

    pub(crate) fn dispatch(&self, event: Event) {
        // Numbering and enqueueing under one lock keeps queue order equal to
        // number order across concurrent dispatchers.
        let mut numbers = self.event_numbers.lock().unwrap_or_else(PoisonError::into_inner);
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        numbers.insert(event.id(), number);
        log::trace!("dispatching event #{number} - {event}");
        if self.tx.send(HubMsg::Event { event, number }).is_err() {
            log::warn!("hub worker is gone, event #{number} dropped");
        }
    }

    fn event_number(&self, id: EventId) -> Option<i64> {
        self.event_numbers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    fn next_number(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn register_preprocessor(&self, preprocessor: EventPreprocessor) {
        self.preprocessors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(preprocessor);
    }

    pub(crate) fn register_response_listener(&self, trigger: &Event, timeout: Duration, callback: ResponseCallback) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingResponse {
                trigger: trigger.id(),
                deadline: Instant::now() + timeout,
                callback,
            });
    }

    fn version_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        state_type: SharedStateType,
    ) -> CoreResult<(Arc<ExtensionContainer>, i64)> {
        let Some(container) = self.find_by_owner(extension_name) else {
            log::error!("extension {extension_name} not registered with the hub");
            return Err(HubError::ExtensionNotRegistered {
                name: extension_name.to_string(),
            }
            .into());
        };

        let state = container.shared_state(state_type);
        let version = match event.and_then(|e| self.event_number(e.id())) {
            Some(number) => number,
            None if !state.is_empty() => self.next_number(),
            None => 0,
        };
        Ok((container, version))
    }

    pub(crate) fn create_shared_state(
        &self,
        extension_name: &str,
        data: Option<EventData>,
        event: Option<&Event>,
        state_type: SharedStateType,
    ) -> CoreResult<()> {
        let (container, version) = self.version_shared_state(extension_name, event, state_type)?;
        let owner = container
            .shared_state_name()
            .unwrap_or_else(|| extension_name.to_string());
        if container.shared_state(state_type).set(version, data) {
            log::debug!("{state_type:?} shared state created for {owner} with version {version}");
            self.dispatch(state_change_event(&owner));
        }
        Ok(())
    }

    pub(crate) fn create_pending_shared_state(
        this: &Arc<Self>,
        extension_name: &str,
        event: Option<&Event>,
        state_type: SharedStateType,
    ) -> CoreResult<SharedStateResolver> {
        let (container, version) = this.version_shared_state(extension_name, event, state_type)?;
        let owner = container
            .shared_state_name()
            .unwrap_or_else(|| extension_name.to_string());
        if container.shared_state(state_type).add_pending(version) {
            log::debug!("pending {state_type:?} shared state created for {owner} with version {version}");
        }
        Ok(SharedStateResolver {
            hub: Arc::downgrade(this),
            owner,
            version,
            state_type,
        })
    }

    pub(crate) fn get_shared_state(
        &self,
        extension_name: &str,
        event: Option<&Event>,
        query: &SharedStateQuery,
    ) -> Option<SharedStateResult> {
        let Some(container) = self.find_by_owner(extension_name) else {
            log::warn!("unable to retrieve shared state for {extension_name}: no such extension is registered");
            return None;
        };

        let version = event.map_or(0, |e| self.event_number(e.id()).unwrap_or(0));
        let result = container
            .shared_state(query.state_type)
            .resolve_with(version, query.resolution);

        if query.barrier && container.last_processed() < version - 1 && result.status == SharedStateStatus::Set {
            return Some(SharedStateResult {
                status: SharedStateStatus::Pending,
                value: result.value,
            });
        }
        Some(result)
    }

    /// Publishes `{version, extensions: {friendlyName: {version, metadata?}}}`
    /// as the hub's own shared state.
    pub(crate) fn share_hub_state(&self) {
        let containers: Vec<Arc<ExtensionContainer>> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut extensions = EventData::new();
        let mut placeholder = None;
        for container in containers {
            if container.type_name() == EVENT_HUB_NAME {
                placeholder = Some(container);
                continue;
            }
            let Some(info) = container.info() else {
                continue;
            };
            let mut entry = EventData::new();
            entry.insert("version".to_string(), Value::from(info.version));
            if let Some(metadata) = info.metadata.filter(|m| !m.is_empty()) {
                entry.insert("metadata".to_string(), Value::Map(metadata));
            }
            extensions.insert(info.friendly_name, Value::Map(entry));
        }

        let Some(placeholder) = placeholder else {
            log::warn!("hub placeholder is not registered, cannot share hub state");
            return;
        };

        let mut data = EventData::new();
        data.insert("version".to_string(), Value::from(HUB_VERSION));
        data.insert("extensions".to_string(), Value::Map(extensions));

        let state = placeholder.shared_state(SharedStateType::Standard);
        let version = if state.is_empty() { 0 } else { self.next_number() };
        if state.set(version, Some(data)) {
            log::debug!("hub shared state published with version {version}");
            self.dispatch(state_change_event(EVENT_HUB_NAME));
        }
    }

    fn deliver(&self, event: Event, number: i64) {
        let preprocessors = self
            .preprocessors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut event = event;
        for preprocessor in &preprocessors {
            let input = event.clone();
            match catch_unwind(AssertUnwindSafe(|| preprocessor(input))) {
                Ok(out) => event = out,
                Err(_) => log::error!("preprocessor panicked on {event}, keeping the event unchanged"),
            }
        }

        if self.event_number(event.id()).is_none() {
            self.event_numbers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(event.id(), number);
        }

        if let Some(response_id) = event.response_id() {
            let matched: Vec<PendingResponse> = {
                let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
                let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *responses)
                    .into_iter()
                    .partition(|p| p.trigger == response_id);
                *responses = keep;
                hit
            };
            for pending in matched {
                pending.invoke(Some(&event));
            }
        }

        let event = Arc::new(event);
        let containers: Vec<Arc<ExtensionContainer>> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for container in containers {
            container.enqueue(Arc::clone(&event), number);
        }
    }

    fn expire_responses(&self, now: Instant) {
        let expired: Vec<PendingResponse> = {
            let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *responses)
                .into_iter()
                .partition(|p| p.deadline <= now);
            *responses = keep;
            expired
        };
        for pending in expired {
            log::debug!("response listener for {} timed out", pending.trigger);
            pending.invoke(None);
        }
    }

    fn next_wake(&self, tick: Duration) -> Duration {
        let now = Instant::now();
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.deadline.saturating_duration_since(now))
            .min()
            .map_or(tick, |d| d.min(tick))
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        // Workers hold only weak references; tell them to stop now rather
        // than at their next idle tick.
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        for container in registry.values() {
            container.send(ContainerMsg::Unregister);
        }
    }
}

fn state_change_event(owner: &str) -> Event {
    let mut data = EventData::new();
    data.insert(STATE_OWNER_KEY.to_string(), Value::from(owner));
    Event::new(STATE_CHANGE_EVENT_NAME, EventType::HUB, EventSource::SHARED_STATE, Some(data))
}

fn hub_loop(hub: &Weak<HubInner>, rx: &Receiver<HubMsg>, tick: Duration) {
    let mut started = false;
    let mut buffered: VecDeque<(Event, i64)> = VecDeque::new();
    let mut exit = false;

    while !exit {
        let wait = hub.upgrade().map_or(tick, |h| h.next_wake(tick));
        select! {
            recv(rx) -> msg => {
                match msg {
                    Ok(HubMsg::Event { event, number }) => {
                        if started {
                            if let Some(h) = hub.upgrade() {
                                h.deliver(event, number);
                            }
                        } else {
                            buffered.push_back((event, number));
                        }
                    }
                    Ok(HubMsg::Start) => {
                        started = true;
                        if let Some(h) = hub.upgrade() {
                            for (event, number) in buffered.drain(..) {
                                h.deliver(event, number);
                            }
                        }
                    }
                    Ok(HubMsg::Shutdown { reply }) => {
                        let _ = reply.send(());
                        exit = true;
                    }
                    Err(_) => exit = true,
                }
            }
            default(wait) => {}
        }

        match hub.upgrade() {
            Some(h) => h.expire_responses(Instant::now()),
            None => exit = true,
        }
    }
    log::debug!("hub worker stopped");
}

/// Placeholder extension owning the hub's shared state and hub-level
/// listeners.
struct HubPlaceholder;

impl Extension for HubPlaceholder {
    fn name(&self) -> &str {
        EVENT_HUB_NAME
    }

    fn friendly_name(&self) -> &str {
        EVENT_HUB_FRIENDLY_NAME
    }

    fn version(&self) -> &str {
        HUB_VERSION
    }

    fn new(_runtime: ExtensionRuntime) -> Option<Self> {
        Some(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::value::data_from_json;
    use serde_json::json;

    fn event(name: &str) -> Event {
        Event::new(name, EventType::CUSTOM, EventSource::REQUEST_CONTENT, None)
    }

    #[test]
    fn test_dispatch_numbers_are_sequential() {
        let hub = EventHub::new();
        let a = event("a");
        let b = event("b");
        hub.dispatch(a.clone());
        hub.dispatch(b.clone());
        let na = hub.event_number(&a).unwrap();
        let nb = hub.event_number(&b).unwrap();
        assert_eq!(nb, na + 1);
        hub.shutdown();
    }

    #[test]
    fn test_numbers_outlive_delivery() {
        let hub = EventHub::new();
        let first = event("first");
        hub.dispatch(first.clone());
        let number = hub.event_number(&first).unwrap();
        hub.start();
        for i in 0..32 {
            hub.dispatch(event(&format!("later{i}")));
        }
        hub.dispatch(event("last"));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hub.event_number(&first), Some(number));
        hub.shutdown();
    }

    #[test]
    fn test_unknown_owner_is_an_error() {
        let hub = EventHub::new();
        let err = hub
            .create_shared_state("com.example.missing", EventData::new(), None)
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::Hub(HubError::ExtensionNotRegistered {
                name: "com.example.missing".to_string()
            })
        );
        assert!(hub.get_shared_state("com.example.missing", None, false).is_none());
        hub.shutdown();
    }

    #[test]
    fn test_placeholder_state_versions_at_event() {
        let hub = EventHub::new();
        let e = event("trigger");
        hub.dispatch(e.clone());
        hub.create_shared_state(EVENT_HUB_NAME, data_from_json(json!({"k": 1})), Some(&e))
            .unwrap();
        let result = hub.get_shared_state(EVENT_HUB_NAME, Some(&e), false).unwrap();
        assert_eq!(result.status, SharedStateStatus::Set);
        assert_eq!(result.value, Some(data_from_json(json!({"k": 1}))));
        hub.shutdown();
    }

    #[test]
    fn test_empty_extension_name_rejected() {
        let hub = EventHub::new();
        let err = hub
            .register_extension_with("", |_| None)
            .unwrap_err();
        assert_eq!(err, CoreError::Hub(HubError::InvalidExtensionName));
        hub.shutdown();
    }

    #[test]
    fn test_unregister_unknown_extension() {
        let hub = EventHub::new();
        let err = hub.unregister_extension("com.example.none").unwrap_err();
        assert!(matches!(err, CoreError::Hub(HubError::ExtensionNotRegistered { .. })));
        hub.shutdown();
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let hub = EventHub::new();
        hub.create_shared_state(EVENT_HUB_NAME, data_from_json(json!({"x": true})), None)
            .unwrap();
        let upper = EVENT_HUB_NAME.to_ascii_uppercase();
        let result = hub.get_shared_state(&upper, None, false).unwrap();
        assert_eq!(result.status, SharedStateStatus::Set);
        hub.shutdown();
    }
}
