use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_tether::launch::events::{LaunchEvent, LaunchListener, ListenerSet};
use agent_tether::AuthorizationKey;

fn destroyed(key: &str) -> LaunchEvent {
    LaunchEvent::AgentDestroyed {
        key: AuthorizationKey::from_wire(key),
    }
}

#[test]
fn dispatch_reaches_every_listener() {
    let set = ListenerSet::new();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let hits = Arc::clone(&hits);
        set.add(Arc::new(move |_: &LaunchEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }

    set.dispatch(&destroyed("k"));

    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn removed_listener_is_not_called() {
    let set = ListenerSet::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = set.add(Arc::new(move |_: &LaunchEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(set.remove(id));
    assert!(!set.remove(id));
    set.dispatch(&destroyed("k"));

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(set.is_empty());
}

#[test]
fn panicking_listener_does_not_stop_the_rest() {
    let set = ListenerSet::new();
    set.add(Arc::new(|_: &LaunchEvent| panic!("listener failure")));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    set.add(Arc::new(move |event: &LaunchEvent| {
        sink.lock().unwrap().push(event.key().clone());
    }));

    set.dispatch(&destroyed("survivor"));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![AuthorizationKey::from_wire("survivor")]
    );
}

#[test]
fn listener_added_during_dispatch_sees_only_later_events() {
    struct Registrar {
        set: Arc<ListenerSet>,
        late_hits: Arc<AtomicUsize>,
    }

    impl LaunchListener for Registrar {
        fn on_event(&self, _: &LaunchEvent) {
            let hits = Arc::clone(&self.late_hits);
            self.set.add(Arc::new(move |_: &LaunchEvent| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
    }

    let set = Arc::new(ListenerSet::new());
    let late_hits = Arc::new(AtomicUsize::new(0));
    set.add(Arc::new(Registrar {
        set: Arc::clone(&set),
        late_hits: Arc::clone(&late_hits),
    }));

    set.dispatch(&destroyed("first"));
    assert_eq!(late_hits.load(Ordering::SeqCst), 0);
    assert_eq!(set.len(), 2);

    set.dispatch(&destroyed("second"));
    assert_eq!(late_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn events_serialize_with_tag() {
    let value = serde_json::to_value(LaunchEvent::ConnectionClosed {
        key: AuthorizationKey::from_wire("k"),
        connection_id: 7,
        remote: true,
    })
    .expect("json");
    assert_eq!(value["event"], "connection_closed");
    assert_eq!(value["connection_id"], 7);
    assert_eq!(value["remote"], true);
}
