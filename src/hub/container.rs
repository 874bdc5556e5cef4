//! Per-extension worker: owns the extension instance, its serial event
//! queue, its listeners and its two shared-state namespaces.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::error::{CoreError, CoreResult, HubError};
use crate::event::Event;
use crate::value::EventData;

use super::dispatcher::HubInner;
use super::extension::{Extension, ExtensionRuntime};
use super::listener::{ListenerEntry, ListenerId};
use super::shared_state::{SharedState, SharedStateType};

/// Builds the extension on its worker thread.
pub(crate) type ExtensionFactory = Box<dyn FnOnce(ExtensionRuntime) -> Option<Box<dyn Extension>> + Send>;

#[derive(Debug)]
pub(crate) enum ContainerMsg {
    Event { event: Arc<Event>, number: i64 },
    Start,
    Stop,
    Unregister,
}

/// What the hub publishes about a registered extension.
#[derive(Debug, Clone)]
pub(crate) struct ExtensionInfo {
    pub friendly_name: String,
    pub version: String,
    pub metadata: Option<EventData>,
}

#[derive(Debug)]
pub(crate) struct ExtensionContainer {
    type_name: String,
    shared_state_name: RwLock<Option<String>>,
    info: RwLock<Option<ExtensionInfo>>,
    standard: SharedState,
    xdm: SharedState,
    listeners: RwLock<Vec<ListenerEntry>>,
    last_processed: AtomicI64,
    tx: Sender<ContainerMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ExtensionContainer {
    /// Creates the container and starts its worker. The worker builds the
    /// extension, reports on `reply`, then starts consuming events.
    pub fn spawn(
        hub: Weak<HubInner>,
        type_name: &str,
        preset_name: Option<String>,
        factory: ExtensionFactory,
        retry_interval: Duration,
        reply: Sender<Result<(), HubError>>,
    ) -> CoreResult<Arc<Self>> {
        let (tx, rx) = unbounded::<ContainerMsg>();
        let container = Arc::new(Self {
            type_name: type_name.to_string(),
            shared_state_name: RwLock::new(preset_name),
            info: RwLock::new(None),
            standard: SharedState::new(type_name),
            xdm: SharedState::new(format!("xdm.{type_name}")),
            listeners: RwLock::new(Vec::new()),
            last_processed: AtomicI64::new(0),
            tx,
            join: Mutex::new(None),
        });

        let worker = Arc::clone(&container);
        let handle = thread::Builder::new()
            .name(format!("corebus-ext-{type_name}"))
            .spawn(move || worker_loop(&hub, &worker, factory, &rx, retry_interval, &reply))
            .map_err(|e| CoreError::internal(format!("failed to spawn worker for {type_name}: {e}")))?;

        *container.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(container)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn shared_state_name(&self) -> Option<String> {
        self.shared_state_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn matches_owner(&self, owner: &str) -> bool {
        self.shared_state_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(owner))
    }

    pub fn info(&self) -> Option<ExtensionInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn shared_state(&self, state_type: SharedStateType) -> &SharedState {
        match state_type {
            SharedStateType::Standard => &self.standard,
            SharedStateType::Xdm => &self.xdm,
        }
    }

    /// Event number of the last event this extension finished handling.
    pub fn last_processed(&self) -> i64 {
        self.last_processed.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, entry: ListenerEntry) -> ListenerId {
        let id = entry.id;
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    pub fn send(&self, msg: ContainerMsg) {
        if self.tx.send(msg).is_err() {
            log::debug!("{}: worker already stopped", self.type_name);
        }
    }

    pub fn enqueue(&self, event: Arc<Event>, number: i64) {
        self.send(ContainerMsg::Event { event, number });
    }

    /// Waits for the worker to exit. A no-op when called from the worker
    /// itself.
    pub fn join(&self) {
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("{}: worker thread panicked", self.type_name);
            }
        }
    }

    fn adopt(&self, ext: &dyn Extension) {
        *self.shared_state_name.write().unwrap_or_else(PoisonError::into_inner) = Some(ext.name().to_string());
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(ExtensionInfo {
            friendly_name: ext.friendly_name().to_string(),
            version: ext.version().to_string(),
            metadata: ext.metadata(),
        });
    }

    fn drain(&self, ext: &mut dyn Extension, queue: &mut VecDeque<(Arc<Event>, i64)>) {
        loop {
            let Some((head, _)) = queue.front() else {
                return;
            };
            let ready = catch_unwind(AssertUnwindSafe(|| ext.ready_for_event(head))).unwrap_or_else(|_| {
                log::error!("{}: ready_for_event panicked, delivering anyway", self.type_name);
                true
            });
            if !ready {
                return;
            }
            let Some((event, number)) = queue.pop_front() else {
                return;
            };

            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
            for listener in listeners.iter().filter(|l| l.should_notify(&event)) {
                listener.notify(&event, &self.type_name);
            }
            self.last_processed.store(number, Ordering::SeqCst);
        }
    }
}

fn worker_loop(
    hub: &Weak<HubInner>,
    container: &Arc<ExtensionContainer>,
    factory: ExtensionFactory,
    rx: &Receiver<ContainerMsg>,
    retry_interval: Duration,
    reply: &Sender<Result<(), HubError>>,
) {
    let runtime = ExtensionRuntime::new(hub.clone(), Arc::clone(container));
    let built = catch_unwind(AssertUnwindSafe(|| factory(runtime))).ok().flatten();
    let Some(mut ext) = built else {
        log::error!("failed to initialize extension {}", container.type_name);
        if let Some(hub) = hub.upgrade() {
            hub.forget_container(&container.type_name);
        }
        let _ = reply.send(Err(HubError::ExtensionInitializationFailure {
            name: container.type_name.clone(),
        }));
        return;
    };

    container.adopt(ext.as_ref());
    if catch_unwind(AssertUnwindSafe(|| ext.on_registered())).is_err() {
        log::error!("{}: on_registered panicked", container.type_name);
    }
    log::debug!("{} successfully registered", container.type_name);
    let _ = reply.send(Ok(()));
    if let Some(hub) = hub.upgrade() {
        hub.extension_ready();
    }

    let mut queue: VecDeque<(Arc<Event>, i64)> = VecDeque::new();
    let mut running = true;
    let mut exit = false;

    while !exit {
        select! {
            recv(rx) -> msg => {
                match msg {
                    Ok(ContainerMsg::Event { event, number }) => queue.push_back((event, number)),
                    Ok(ContainerMsg::Start) => running = true,
                    Ok(ContainerMsg::Stop) => running = false,
                    Ok(ContainerMsg::Unregister) | Err(_) => exit = true,
                }
            }
            default(retry_interval) => {
                if hub.strong_count() == 0 {
                    exit = true;
                }
            }
        }

        if running && !exit {
            container.drain(ext.as_mut(), &mut queue);
        }
    }

    if !queue.is_empty() {
        log::debug!("{}: dropping {} undelivered events on shutdown", container.type_name, queue.len());
    }
    if catch_unwind(AssertUnwindSafe(|| ext.on_unregistered())).is_err() {
        log::error!("{}: on_unregistered panicked", container.type_name);
    }
    log::debug!("{} worker stopped", container.type_name);
}
