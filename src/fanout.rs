//! In-process fan-out of followed entries to listeners.
//!
//! Listeners register under an event name or under the wildcard
//! [`WILDCARD_EVENT`]. Dispatching an entry delivers its message to every
//! listener registered for the entry's event name, then to every wildcard
//! listener, in registration order. Delivery is synchronous: dispatch returns
//! once every listener has run.

use crate::types::LogEntry;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Event name that receives every published message.
pub const WILDCARD_EVENT: &str = "message";

/// Callback invoked with a message payload.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registration order of a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

/// Where a listener is registered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ListenerKey {
    Event(String),
    Wildcard,
}

impl ListenerKey {
    fn for_event(event: &str) -> Self {
        if event == WILDCARD_EVENT {
            ListenerKey::Wildcard
        } else {
            ListenerKey::Event(event.to_string())
        }
    }
}

#[derive(Default)]
struct Registry {
    by_event: HashMap<String, BTreeMap<ListenerId, Listener>>,
    wildcard: BTreeMap<ListenerId, Listener>,
}

impl Registry {
    fn group_mut(&mut self, key: &ListenerKey) -> Option<&mut BTreeMap<ListenerId, Listener>> {
        match key {
            ListenerKey::Event(event) => self.by_event.get_mut(event),
            ListenerKey::Wildcard => Some(&mut self.wildcard),
        }
    }
}

/// Name-keyed listener registry with a wildcard group.
#[derive(Default)]
pub struct Fanout {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `event`.
    pub fn subscribe(self: &Arc<Self>, event: &str, listener: Listener) -> Subscription {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let key = ListenerKey::for_event(event);

        {
            let mut registry = self.registry.write();
            match &key {
                ListenerKey::Event(name) => {
                    registry
                        .by_event
                        .entry(name.clone())
                        .or_default()
                        .insert(id, listener);
                }
                ListenerKey::Wildcard => {
                    registry.wildcard.insert(id, listener);
                }
            }
        }

        Subscription {
            id,
            event: event.to_string(),
            key,
            fanout: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Remove one registration. Returns false if it was already gone.
    fn remove(&self, key: &ListenerKey, id: ListenerId) -> bool {
        let mut registry = self.registry.write();
        let Some(group) = registry.group_mut(key) else {
            return false;
        };
        let removed = group.remove(&id).is_some();
        let now_empty = group.is_empty();

        if let (ListenerKey::Event(event), true) = (key, now_empty) {
            registry.by_event.remove(event);
        }
        removed
    }

    /// Deliver an entry to its listeners. Returns how many ran.
    ///
    /// Marker entries (no event name) are dropped without dispatch.
    pub fn dispatch(&self, entry: &LogEntry) -> usize {
        let Some(event) = entry.event.as_deref() else {
            return 0;
        };

        // Snapshot so listeners can (un)subscribe while being called.
        let listeners: Vec<Listener> = {
            let registry = self.registry.read();
            let named = match event {
                WILDCARD_EVENT => None,
                name => registry.by_event.get(name),
            };
            named
                .into_iter()
                .flat_map(|group| group.values())
                .chain(registry.wildcard.values())
                .cloned()
                .collect()
        };

        let payload = entry.message.as_ref().unwrap_or(&Value::Null);
        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    /// Number of listeners registered under `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        let registry = self.registry.read();
        match ListenerKey::for_event(event) {
            ListenerKey::Event(name) => registry.by_event.get(&name).map_or(0, |g| g.len()),
            ListenerKey::Wildcard => registry.wildcard.len(),
        }
    }

    /// Number of listeners across all events.
    pub fn total_listeners(&self) -> usize {
        let registry = self.registry.read();
        registry.wildcard.len() + registry.by_event.values().map(|g| g.len()).sum::<usize>()
    }

    /// Remove every registration.
    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.by_event.clear();
        registry.wildcard.clear();
    }
}

/// Handle returned by [`Fanout::subscribe`].
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: ListenerId,
    event: String,
    key: ListenerKey,
    fanout: Weak<Fanout>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event name this listener was registered under.
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove exactly this registration. Further calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.remove(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryId, NewEntry};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;

    fn entry(id: u64, event: &str, message: Value) -> LogEntry {
        NewEntry::message(event, message).into_entry(EntryId(id))
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |v: &Value| sink.lock().push(v.clone())))
    }

    #[test]
    fn test_named_and_wildcard_delivery() {
        let fanout = Arc::new(Fanout::new());
        let (on_x, x_listener) = recorder();
        let (on_all, all_listener) = recorder();
        fanout.subscribe("x", x_listener);
        fanout.subscribe(WILDCARD_EVENT, all_listener);

        fanout.dispatch(&entry(1, "x", json!({"v": 1})));
        fanout.dispatch(&entry(2, "y", json!({"v": 2})));

        assert_eq!(*on_x.lock(), vec![json!({"v": 1})]);
        assert_eq!(*on_all.lock(), vec![json!({"v": 1}), json!({"v": 2})]);
    }

    #[test]
    fn test_marker_not_dispatched() {
        let fanout = Arc::new(Fanout::new());
        let (on_all, all_listener) = recorder();
        fanout.subscribe(WILDCARD_EVENT, all_listener);

        let delivered = fanout.dispatch(&NewEntry::marker().into_entry(EntryId(1)));
        assert_eq!(delivered, 0);
        assert!(on_all.lock().is_empty());
    }

    #[test]
    fn test_message_event_delivered_once() {
        let fanout = Arc::new(Fanout::new());
        let (on_all, all_listener) = recorder();
        fanout.subscribe(WILDCARD_EVENT, all_listener);

        fanout.dispatch(&entry(1, WILDCARD_EVENT, json!("hi")));
        assert_eq!(on_all.lock().len(), 1);
    }

    #[test]
    fn test_registration_order() {
        let fanout = Arc::new(Fanout::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            let order = Arc::clone(&order);
            fanout.subscribe("tick", Arc::new(move |_: &Value| order.lock().push(n)));
        }

        fanout.dispatch(&entry(1, "tick", json!(null)));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unsubscribe_is_exact_and_idempotent() {
        let fanout = Arc::new(Fanout::new());
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let sub = fanout.subscribe("x", first);
        fanout.subscribe("x", second);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(fanout.listener_count("x"), 1);

        fanout.dispatch(&entry(1, "x", json!(1)));
        assert!(first_seen.lock().is_empty());
        assert_eq!(second_seen.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribe_from_inside_listener() {
        let fanout = Arc::new(Fanout::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let inner_slot = Arc::clone(&slot);
        let inner_calls = Arc::clone(&calls);
        let sub = fanout.subscribe(
            "once",
            Arc::new(move |_: &Value| {
                inner_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = inner_slot.lock().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        *slot.lock() = Some(sub);

        fanout.dispatch(&entry(1, "once", json!(1)));
        fanout.dispatch(&entry(2, "once", json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear() {
        let fanout = Arc::new(Fanout::new());
        let (_, a) = recorder();
        let (_, b) = recorder();
        let sub = fanout.subscribe("x", a);
        fanout.subscribe(WILDCARD_EVENT, b);
        assert_eq!(fanout.total_listeners(), 2);

        fanout.clear();
        assert_eq!(fanout.total_listeners(), 0);
        // Unsubscribing after a bulk clear is harmless.
        sub.unsubscribe();
    }

    proptest! {
        #[test]
        fn prop_dispatch_preserves_order(events in prop::collection::vec(0u8..3, 0..50)) {
            let fanout = Arc::new(Fanout::new());
            let (on_a, a) = recorder();
            let (on_all, all) = recorder();
            fanout.subscribe("e0", a);
            fanout.subscribe(WILDCARD_EVENT, all);

            for (i, e) in events.iter().enumerate() {
                fanout.dispatch(&entry(i as u64 + 1, &format!("e{e}"), json!(i)));
            }

            let expected_all: Vec<Value> = (0..events.len()).map(|i| json!(i)).collect();
            let expected_a: Vec<Value> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| **e == 0)
                .map(|(i, _)| json!(i))
                .collect();

            prop_assert_eq!(on_all.lock().clone(), expected_all);
            prop_assert_eq!(on_a.lock().clone(), expected_a);
        }
    }
}
