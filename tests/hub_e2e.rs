use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};

use corebus::hub::{EVENT_HUB_NAME, STATE_OWNER_KEY};
use corebus::value::data_from_json;
use corebus::{
    CoreError, Event, EventHub, EventSource, EventType, Extension, ExtensionRuntime, HubError, SharedStateStatus,
    Value,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(2);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn collect(hub: &EventHub, event_type: &str, source: &str) -> Receiver<Event> {
    let (tx, rx) = unbounded();
    hub.register_listener(event_type, source, move |event: &Event| {
        let _ = tx.send(event.clone());
    })
    .unwrap();
    rx
}

fn custom(name: &str) -> Event {
    Event::new(name, EventType::CUSTOM, EventSource::REQUEST_CONTENT, None)
}

struct Probe;

impl Extension for Probe {
    fn name(&self) -> &str {
        "com.example.probe"
    }

    fn friendly_name(&self) -> &str {
        "Probe"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn new(_runtime: ExtensionRuntime) -> Option<Self> {
        Some(Self)
    }
}

/// Holds every event at the head of its queue until the gate opens.
struct Gated {
    name: String,
    open: Arc<AtomicBool>,
}

impl Extension for Gated {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn ready_for_event(&mut self, _event: &Event) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn new(_runtime: ExtensionRuntime) -> Option<Self> {
        None
    }
}

#[test]
fn duplicate_registration_is_rejected() {
    init();
    let hub = EventHub::new();
    hub.register_extension::<Probe>().unwrap().wait().unwrap();

    let err = hub.register_extension::<Probe>().unwrap_err();
    assert!(matches!(err, CoreError::Hub(HubError::DuplicateExtensionName { .. })));
    hub.shutdown();
}

#[test]
fn concurrent_registration_from_many_threads() {
    init();
    let hub = EventHub::new();
    let threads: Vec<_> = (0..16)
        .map(|i| {
            let hub = hub.clone();
            thread::spawn(move || {
                let name = format!("com.example.ext{i}");
                let owner = name.clone();
                hub.register_extension_with(&name, move |_runtime| {
                    Some(Box::new(Gated {
                        name: owner,
                        open: Arc::new(AtomicBool::new(true)),
                    }) as Box<dyn Extension>)
                })
                .and_then(|registration| registration.wait_timeout(WAIT))
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap().unwrap();
    }
    for i in 0..16 {
        assert!(hub.is_registered(&format!("com.example.ext{i}")));
    }
    hub.shutdown();
}

#[test]
fn events_dispatched_before_start_are_delivered_in_order() {
    init();
    let hub = EventHub::new();
    let rx = collect(&hub, EventType::CUSTOM, EventSource::WILDCARD);

    for i in 0..5 {
        hub.dispatch(custom(&format!("e{i}")));
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    hub.start();
    let names: Vec<String> = (0..5)
        .map(|_| rx.recv_timeout(WAIT).unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["e0", "e1", "e2", "e3", "e4"]);
    hub.shutdown();
}

#[test]
fn preprocessor_replaces_event_before_listeners() {
    init();
    let hub = EventHub::new();
    hub.register_preprocessor(|event: Event| {
        if event.event_type() == EventType::CUSTOM {
            event.copy_with_new_data(Some(data_from_json(json!({"seen": true}))))
        } else {
            event
        }
    });
    let rx = collect(&hub, EventType::CUSTOM, EventSource::WILDCARD);
    hub.start();

    let original = custom("raw");
    hub.dispatch(original.clone());
    let received = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(received.id(), original.id());
    assert_eq!(received.data(), Some(&data_from_json(json!({"seen": true}))));
    hub.shutdown();
}

#[test]
fn response_listener_fires_once_with_response() {
    init();
    let hub = EventHub::new();
    hub.start();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let trigger = custom("request");
    let sink = Arc::clone(&calls);
    hub.register_response_listener(&trigger, Duration::from_secs(5), move |response| {
        sink.lock().unwrap().push(response.map(Event::id));
    });
    hub.dispatch(trigger.clone());

    let response = trigger.create_response_event("response", EventType::CUSTOM, EventSource::RESPONSE_CONTENT, None);
    hub.dispatch(response.clone());
    hub.dispatch(trigger.create_response_event("again", EventType::CUSTOM, EventSource::RESPONSE_CONTENT, None));

    assert!(wait_until(|| !calls.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*calls.lock().unwrap(), vec![Some(response.id())]);
    hub.shutdown();
}

#[test]
fn response_listener_times_out_once() {
    init();
    let hub = EventHub::new();
    hub.start();

    let calls = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicBool::new(false));
    let trigger = custom("request");
    let (count, flag) = (Arc::clone(&calls), Arc::clone(&timed_out));
    hub.register_response_listener(&trigger, Duration::from_millis(50), move |response| {
        count.fetch_add(1, Ordering::SeqCst);
        flag.store(response.is_none(), Ordering::SeqCst);
    });
    hub.dispatch(trigger.clone());

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    assert!(timed_out.load(Ordering::SeqCst));

    // a late response finds nothing to complete
    hub.dispatch(trigger.create_response_event("late", EventType::CUSTOM, EventSource::RESPONSE_CONTENT, None));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    hub.shutdown();
}

#[test]
fn panicking_listener_does_not_stop_delivery() {
    init();
    let hub = EventHub::new();
    hub.register_listener(EventType::CUSTOM, EventSource::WILDCARD, |_event: &Event| {
        panic!("listener failure");
    })
    .unwrap();
    let rx = collect(&hub, EventType::CUSTOM, EventSource::WILDCARD);
    hub.start();

    hub.dispatch(custom("first"));
    hub.dispatch(custom("second"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().name(), "first");
    assert_eq!(rx.recv_timeout(WAIT).unwrap().name(), "second");
    hub.shutdown();
}

#[test]
fn extension_listeners_receive_matching_events() {
    init();
    let hub = EventHub::new();
    let (tx, rx) = unbounded::<String>();
    hub.register_extension_with("com.example.listener", move |runtime| {
        runtime.register_listener(EventType::CUSTOM, EventSource::REQUEST_CONTENT, move |event: &Event| {
            let _ = tx.send(event.name().to_string());
        });
        Some(Box::new(Gated {
            name: "com.example.listener".to_string(),
            open: Arc::new(AtomicBool::new(true)),
        }) as Box<dyn Extension>)
    })
    .unwrap()
    .wait()
    .unwrap();
    hub.start();

    hub.dispatch(custom("match"));
    hub.dispatch(Event::new("other-source", EventType::CUSTOM, EventSource::REQUEST_RESET, None));
    hub.dispatch(Event::new("other-type", EventType::LIFECYCLE, EventSource::REQUEST_CONTENT, None));
    hub.dispatch(custom("match-again"));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "match");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "match-again");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    hub.shutdown();
}

#[test]
fn failed_initialization_frees_the_name() {
    init();
    let hub = EventHub::new();
    let err = hub
        .register_extension_with("com.example.broken", |_runtime| None)
        .unwrap()
        .wait()
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::Hub(HubError::ExtensionInitializationFailure {
            name: "com.example.broken".to_string()
        })
    );
    assert!(!hub.is_registered("com.example.broken"));

    hub.register_extension_with("com.example.broken", |_runtime| {
        Some(Box::new(Probe) as Box<dyn Extension>)
    })
    .unwrap()
    .wait()
    .unwrap();
    hub.shutdown();
}

#[test]
fn unregister_allows_registering_again() {
    init();
    let hub = EventHub::new();
    hub.register_extension::<Probe>().unwrap().wait().unwrap();
    let type_name = corebus::hub::extension_type_name::<Probe>();
    assert!(hub.is_registered(type_name));

    hub.unregister_extension(type_name).unwrap();
    assert!(!hub.is_registered(type_name));
    hub.register_extension::<Probe>().unwrap().wait().unwrap();
    hub.shutdown();
}

#[test]
fn hub_state_lists_registered_extensions() {
    init();
    let hub = EventHub::new();
    let changes = collect(&hub, EventType::HUB, EventSource::SHARED_STATE);
    hub.register_extension::<Probe>().unwrap().wait().unwrap();
    hub.start();

    let probe_listed = || {
        hub.get_shared_state(EVENT_HUB_NAME, None, false)
            .and_then(|r| r.value)
            .and_then(|data| data.get("extensions").and_then(Value::as_map).cloned())
            .and_then(|extensions| extensions.get("Probe").cloned())
            == Some(Value::Map(data_from_json(json!({"version": "1.0.0"}))))
    };
    assert!(wait_until(probe_listed));

    let change = changes.recv_timeout(WAIT).unwrap();
    assert_eq!(change.data().and_then(|d| d.get(STATE_OWNER_KEY)), Some(&Value::from(EVENT_HUB_NAME)));
    hub.shutdown();
}

#[test]
fn barrier_reports_pending_until_owner_catches_up() {
    init();
    let hub = EventHub::new();
    let open = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&open);
    hub.register_extension_with("com.example.gated", move |_runtime| {
        Some(Box::new(Gated {
            name: "com.example.gated".to_string(),
            open: gate,
        }) as Box<dyn Extension>)
    })
    .unwrap()
    .wait()
    .unwrap();
    hub.start();

    let e1 = custom("e1");
    let e2 = custom("e2");
    hub.dispatch(e1);
    hub.dispatch(e2.clone());
    hub.create_shared_state("com.example.gated", data_from_json(json!({"v": 2})), Some(&e2))
        .unwrap();

    let plain = hub.get_shared_state("com.example.gated", Some(&e2), false).unwrap();
    assert_eq!(plain.status, SharedStateStatus::Set);
    let barrier = hub.get_shared_state("com.example.gated", Some(&e2), true).unwrap();
    assert_eq!(barrier.status, SharedStateStatus::Pending);

    open.store(true, Ordering::SeqCst);
    assert!(wait_until(|| {
        hub.get_shared_state("com.example.gated", Some(&e2), true)
            .is_some_and(|r| r.status == SharedStateStatus::Set)
    }));
    hub.shutdown();
}

#[test]
fn extension_can_unregister_itself() {
    init();
    let hub = EventHub::new();
    let slot: Arc<Mutex<Option<ExtensionRuntime>>> = Arc::new(Mutex::new(None));
    let keep = Arc::clone(&slot);
    hub.register_extension_with("com.example.leaver", move |runtime| {
        *keep.lock().unwrap() = Some(runtime);
        Some(Box::new(Gated {
            name: "com.example.leaver".to_string(),
            open: Arc::new(AtomicBool::new(true)),
        }) as Box<dyn Extension>)
    })
    .unwrap()
    .wait()
    .unwrap();
    assert!(hub.is_registered("com.example.leaver"));

    let runtime = slot.lock().unwrap().take().unwrap();
    runtime.unregister_extension().unwrap();
    assert!(!hub.is_registered("com.example.leaver"));
    hub.shutdown();
}
