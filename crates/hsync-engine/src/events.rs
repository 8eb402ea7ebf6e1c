//! Named event channels (distilled spec §4.G): `status`, `updated`, `banner`, `fee`,
//! `servers`, `interfaces`. Registration is invoked from foreign threads so the table
//! lives behind a short `std::sync::Mutex` (SPEC_FULL.md §7); firing copies the
//! callback list out and invokes it outside the lock.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// The fixed set of named channels the engine fires events on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Connectivity/mode transition of the main peer.
    Status,
    /// Local chain height advanced.
    Updated,
    /// A peer's banner text changed.
    Banner,
    /// Fee estimate refreshed.
    Fee,
    /// Server directory rebuilt.
    Servers,
    /// Set of connected interfaces changed.
    Interfaces,
}

/// A registered callback: boxed so callers can close over arbitrary state.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A callback's registration handle, used to unregister it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

#[derive(Default)]
struct Channel {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

/// Thread-safe named callback lists.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<Topic, Channel>>>,
}

impl EventBus {
    /// A fresh bus with no registered callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` on `topic`, returning an id usable with
    /// [`EventBus::unregister_callback`].
    pub fn register_callback(
        &self,
        topic: Topic,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> CallbackId {
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        let channel = channels.entry(topic).or_default();
        let id = channel.next_id;
        channel.next_id += 1;
        channel.callbacks.push((id, Arc::new(callback)));
        CallbackId(id)
    }

    /// Remove a previously registered callback. A no-op if it's already gone.
    pub fn unregister_callback(&self, topic: Topic, id: CallbackId) {
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        if let Some(channel) = channels.get_mut(&topic) {
            channel.callbacks.retain(|(cid, _)| *cid != id.0);
        }
    }

    /// Fire every callback registered on `topic` with `payload`, snapshot-copied out
    /// of the lock before invocation so a callback can itself register/unregister
    /// without deadlocking.
    pub fn trigger_callback(&self, topic: Topic, payload: &Value) {
        let snapshot: Vec<Callback> = {
            let channels = self.channels.lock().expect("event bus mutex poisoned");
            match channels.get(&topic) {
                Some(channel) => channel.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };

        for callback in snapshot {
            callback(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    #[test]
    fn trigger_invokes_every_registered_callback() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = calls.clone();
        bus.register_callback(Topic::Updated, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = calls.clone();
        bus.register_callback(Topic::Updated, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        bus.trigger_callback(Topic::Updated, &json!({"height": 10}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_stops_future_invocations() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let id = bus.register_callback(Topic::Status, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });

        bus.trigger_callback(Topic::Status, &json!(null));
        bus.unregister_callback(Topic::Status, id);
        bus.trigger_callback(Topic::Status, &json!(null));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trigger_on_unknown_topic_is_a_no_op() {
        let bus = EventBus::new();
        bus.trigger_callback(Topic::Banner, &json!(null));
    }

    #[test]
    fn callback_can_reregister_during_invocation_without_deadlock() {
        let bus = EventBus::new();
        let bus_clone = bus.clone();
        bus.register_callback(Topic::Fee, move |_| {
            bus_clone.register_callback(Topic::Fee, |_| {});
        });
        bus.trigger_callback(Topic::Fee, &json!(null));
    }
}
