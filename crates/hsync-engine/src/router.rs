//! Request router (distilled spec §4.D): assigns monotonic message ids, matches
//! responses to callbacks, caches subscriptions, and canonicalizes notification
//! shapes so callers always see the subscribe-response layout.
use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use hsync_types::protocol::{MessageId, Notification, Request, Response};

/// Errors raised by router operations.
#[derive(Debug, Error)]
pub enum Error {
    /// There is no main peer to route a client-initiated request to.
    #[error("no main peer available to route request")]
    NoMainPeer,
}

/// A callback invoked with a response (or a server-pushed update to a subscription).
pub type Callback = Box<dyn FnOnce(Response) + Send>;

/// The subscription/cache index: `method`, plus `:params[0]` when a first param is
/// present (distilled spec §4.D: exactly one parameter participates in identity).
pub fn subscription_index(method: &str, params: &[Value]) -> String {
    match params.first() {
        Some(first) => format!("{method}:{}", index_key(first)),
        None => method.to_string(),
    }
}

fn index_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A record of an outstanding client-initiated request, awaiting a response.
pub struct UnansweredRequest {
    /// Original method name.
    pub method: String,
    /// Original parameters.
    pub params: Vec<Value>,
    /// Callback to invoke once a response with this id arrives.
    pub callback: Callback,
    /// When this request was first enqueued (survives reissue on peer switch).
    pub enqueued_at: std::time::Instant,
}

/// A registered subscription: the callbacks waiting on pushes for this index, plus
/// the last cached response so newly attached peers can replay without a round trip.
#[derive(Default)]
struct Subscription {
    callbacks: Vec<SubscriptionCallback>,
    cached: Option<Value>,
}

/// A subscription callback, invoked on both the initial subscribe response and every
/// subsequent push.
pub type SubscriptionCallback = std::sync::Arc<dyn Fn(&Value) + Send + Sync>;

/// Router state: the monotonic id counter, outstanding requests, and subscriptions.
#[derive(Default)]
pub struct Router {
    next_id: MessageId,
    unanswered: HashMap<MessageId, UnansweredRequest>,
    subscriptions: HashMap<String, Subscription>,
}

impl Router {
    /// A fresh router with no outstanding state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next message id (distilled spec invariant 1: strictly monotonic
    /// process-wide).
    pub fn next_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record an outstanding request so a later response can be matched to it.
    pub fn track(&mut self, id: MessageId, request: UnansweredRequest) {
        self.unanswered.insert(id, request);
    }

    /// Pop the outstanding request for `id`, if any (distilled spec §4.D: only valid
    /// if the responder is the main peer - callers are expected to have already
    /// checked that before calling this).
    pub fn take_unanswered(&mut self, id: MessageId) -> Option<UnansweredRequest> {
        self.unanswered.remove(&id)
    }

    /// Every outstanding request, for reissue on a peer switch (distilled spec
    /// §4.D `send_subscriptions`).
    pub fn drain_unanswered(&mut self) -> Vec<(MessageId, UnansweredRequest)> {
        self.unanswered.drain().collect()
    }

    /// Whether a request is still tracked as unanswered - distilled spec invariant 2.
    pub fn is_unanswered(&self, id: MessageId) -> bool {
        self.unanswered.contains_key(&id)
    }

    /// Register a subscription callback at `index`, returning the cached response (if
    /// any) so the caller can replay it synchronously (distilled spec §4.D: "register
    /// callback ... and replay any cached response synchronously").
    pub fn subscribe(
        &mut self,
        index: String,
        callback: SubscriptionCallback,
    ) -> Option<Value> {
        let sub = self.subscriptions.entry(index).or_default();
        sub.callbacks.push(callback);
        sub.cached.clone()
    }

    /// Update the cache for `index` and fire every registered callback with the new
    /// value (distilled spec §4.D: "all subscription responses update `sub_cache`").
    pub fn publish(&mut self, index: &str, value: Value) {
        if let Some(sub) = self.subscriptions.get_mut(index) {
            sub.cached = Some(value.clone());
            for callback in sub.callbacks.clone() {
                callback(&value);
            }
        }
    }

    /// Clear every cached subscription response, done on peer switch before resending
    /// subscriptions (distilled spec §4.D `send_subscriptions`).
    pub fn clear_cache(&mut self) {
        for sub in self.subscriptions.values_mut() {
            sub.cached = None;
        }
    }

    /// Every subscription index currently registered, for resubscribing on a new peer.
    pub fn subscription_indices(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }
}

/// Canonicalize a server-pushed notification into the shape subscribe responses use,
/// so callbacks never need to special-case which one they're looking at
/// (distilled spec §4.D, §9 "Shape canonicalization").
pub fn canonicalize_notification(notification: Notification) -> (String, Value) {
    match notification.method.as_str() {
        "blockchain.headers.subscribe" => {
            let result = notification.params.into_iter().next().unwrap_or(Value::Null);
            ("blockchain.headers.subscribe".to_string(), result)
        }
        "blockchain.scripthash.subscribe" => {
            let mut params = notification.params.into_iter();
            let scripthash = params.next().unwrap_or(Value::Null);
            let result = params.next().unwrap_or(Value::Null);
            let index = subscription_index(
                "blockchain.scripthash.subscribe",
                std::slice::from_ref(&scripthash),
            );
            (index, result)
        }
        other => (
            subscription_index(other, &notification.params),
            Value::Array(notification.params),
        ),
    }
}

/// Build an outstanding-request id list for every `Request` in `requests`, pairing
/// each with a freshly allocated id (distilled spec §4.D `send_subscriptions`: "resend
/// every entry in `unanswered_requests`... get fresh ids").
pub fn reissue(router: &mut Router, requests: Vec<(UnansweredRequest, Vec<Value>)>) -> Vec<(MessageId, Request)> {
    requests
        .into_iter()
        .map(|(unanswered, params)| {
            let id = router.next_id();
            let request = Request::new(id, unanswered.method.clone(), params);
            router.track(id, unanswered);
            (id, request)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn next_id_is_strictly_monotonic() {
        let mut r = Router::new();
        let a = r.next_id();
        let b = r.next_id();
        assert!(b > a);
    }

    #[test]
    fn subscription_index_uses_only_first_param() {
        assert_eq!(
            subscription_index("blockchain.scripthash.subscribe", &[json!("abcd"), json!("ignored")]),
            "blockchain.scripthash.subscribe:abcd"
        );
        assert_eq!(subscription_index("server.peers.subscribe", &[]), "server.peers.subscribe");
    }

    #[test]
    fn subscribe_replays_cached_response_synchronously() {
        let mut r = Router::new();
        let index = subscription_index("blockchain.headers.subscribe", &[]);
        r.publish(&index, json!({"height": 1}));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cached = r.subscribe(index, Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(cached, Some(json!({"height": 1})));
    }

    #[test]
    fn publish_fires_every_registered_callback() {
        let mut r = Router::new();
        let index = "blockchain.headers.subscribe".to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        r.subscribe(index.clone(), Arc::new(move |_| { c1.fetch_add(1, Ordering::SeqCst); }));
        let c2 = calls.clone();
        r.subscribe(index.clone(), Arc::new(move |_| { c2.fetch_add(1, Ordering::SeqCst); }));

        r.publish(&index, json!({"height": 2}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn canonicalize_headers_subscribe_moves_param_to_result() {
        let n = Notification {
            method: "blockchain.headers.subscribe".to_string(),
            params: vec![json!({"height": 10})],
        };
        let (index, result) = canonicalize_notification(n);
        assert_eq!(index, "blockchain.headers.subscribe");
        assert_eq!(result, json!({"height": 10}));
    }

    #[test]
    fn canonicalize_scripthash_subscribe_reshapes_params() {
        let n = Notification {
            method: "blockchain.scripthash.subscribe".to_string(),
            params: vec![json!("scripthash123"), json!("status456")],
        };
        let (index, result) = canonicalize_notification(n);
        assert_eq!(index, "blockchain.scripthash.subscribe:scripthash123");
        assert_eq!(result, json!("status456"));
    }

    #[test]
    fn take_unanswered_removes_tracked_request() {
        let mut r = Router::new();
        let id = r.next_id();
        r.track(
            id,
            UnansweredRequest {
                method: "server.version".to_string(),
                params: vec![],
                callback: Box::new(|_| {}),
                enqueued_at: std::time::Instant::now(),
            },
        );
        assert!(r.is_unanswered(id));
        assert!(r.take_unanswered(id).is_some());
        assert!(!r.is_unanswered(id));
    }
}
