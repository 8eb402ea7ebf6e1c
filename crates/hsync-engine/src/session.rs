//! Peer session (distilled spec §4.B): one connection's request queue, response
//! stream, and liveness bookkeeping. Transport I/O itself lives in the three
//! cooperative tasks the supervisor spawns per peer (§4.C); `Session` is the shared
//! state those tasks and the synchronizer (§4.E) read and mutate.
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;

use hsync_chain::Header;
use hsync_types::network::Height;
use hsync_types::peer::PeerDescriptor;
use hsync_types::protocol::{classify, Frame, MessageId, Notification, Request, Response};
use thiserror::Error;

/// Errors raised by session operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A request was queued on a session that has already been closed.
    #[error("session for {0} is closed")]
    Closed(String),
}

/// How long a session may sit without any inbound traffic before a keepalive ping is
/// due. Not named as a distinct constant in the distilled spec; chosen well inside the
/// 20s request timeout so a ping always has time to round-trip before that fires.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// The header synchronizer's current mode for this peer (distilled spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// No active search; the peer's advertised tip already matches or extends local state.
    #[default]
    Default,
    /// Exponentially widening backward search for a known ancestor.
    Backward,
    /// Binary search narrowing in on the exact divergence height.
    Binary,
    /// Streaming headers forward from a located common ancestor to the peer's tip.
    CatchUp,
}

/// The `(good, bad, bad_header)` search bounds the backward/binary search narrows.
#[derive(Debug, Clone, Default)]
pub struct SearchBounds {
    /// Highest height known to connect to a registered branch.
    pub good: Height,
    /// Lowest height known to diverge from every registered branch.
    pub bad: Height,
    /// The header observed at `bad`, if any.
    pub bad_header: Option<Header>,
}

/// The single outstanding search request this session may have in flight
/// (SPEC_FULL.md §11: one field name, `requested_at`, everywhere).
#[derive(Debug, Clone, Copy)]
pub struct OutstandingRequest {
    /// Height (or chunk index, for `blockchain.block.get_chunk`) requested.
    pub height: Height,
    /// Whether this was a chunk request rather than a single header.
    pub is_chunk: bool,
    /// When the request was sent.
    pub requested_at: Instant,
}

/// One peer connection's queues and synchronizer state.
pub struct Session {
    /// This peer's address.
    pub descriptor: PeerDescriptor,
    /// Declared protocol version, stashed from `server.version`.
    pub server_version: Option<String>,
    /// Most recently advertised tip height.
    pub tip: Option<Height>,
    /// Most recently advertised tip header.
    pub tip_header: Option<Header>,
    /// Chain branch this peer is currently attached to.
    pub branch: Option<Height>,
    /// Current synchronizer mode.
    pub mode: SyncMode,
    /// Active search bounds, meaningful only in `Backward`/`Binary` mode.
    pub search: SearchBounds,
    /// The single in-flight synchronizer request, if any.
    pub requested: Option<OutstandingRequest>,
    pending: HashMap<MessageId, Request>,
    outbox: VecDeque<Request>,
    inbox: VecDeque<Value>,
    last_activity: Instant,
    closed: bool,
}

impl Session {
    /// A freshly connecting session for `descriptor`.
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            server_version: None,
            tip: None,
            tip_header: None,
            branch: None,
            mode: SyncMode::default(),
            search: SearchBounds::default(),
            requested: None,
            pending: HashMap::new(),
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
            last_activity: Instant::now(),
            closed: false,
        }
    }

    /// Enqueue an outbound request, assigning it `id` (message ids are allocated by
    /// the router - distilled spec invariant 1 - so callers pass one in rather than
    /// letting the session mint it).
    pub fn queue_request(
        &mut self,
        id: MessageId,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed(self.descriptor.to_string()));
        }
        let request = Request::new(id, method, params);
        self.pending.insert(id, request.clone());
        self.outbox.push_back(request);
        Ok(())
    }

    /// Drain everything queued for the outbound driver task to actually send.
    pub fn drain_outbox(&mut self) -> Vec<Request> {
        self.outbox.drain(..).collect()
    }

    /// Feed a decoded frame in from the inbound driver task.
    pub fn push_inbound(&mut self, value: Value) {
        self.last_activity = Instant::now();
        self.inbox.push_back(value);
    }

    /// Pull the next decoded frame, matching it against this session's own
    /// outstanding requests. Returns `None` once the inbox is empty or the session is
    /// closed (distilled spec §4.B: `(nil, nil)` for remote closure / malformed frame).
    pub fn get_response(&mut self) -> Option<Inbound> {
        if self.closed {
            return None;
        }
        let value = self.inbox.pop_front()?;
        let frame = match classify(value) {
            Ok(frame) => frame,
            Err(_) => return Some(Inbound::Malformed),
        };

        match frame {
            Frame::Response(response) => {
                let echo = self.pending.remove(&response.id);
                Some(Inbound::Response { echo, response })
            }
            Frame::Notification(notification) => Some(Inbound::Notification(notification)),
        }
    }

    /// Whether a keepalive ping is due (distilled spec §5: keepalive task, 1s tick).
    pub fn ping_required(&self) -> bool {
        !self.closed && self.last_activity.elapsed() >= PING_INTERVAL
    }

    /// Whether the current search request has sat unanswered past the 20s timeout
    /// (distilled spec §6, §7).
    pub fn has_timed_out(&self) -> bool {
        match &self.requested {
            Some(req) => req.requested_at.elapsed() >= hsync_types::network::REQUEST_TIMEOUT,
            None => false,
        }
    }

    /// Idempotently close this session, cancelling anything still pending.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.outbox.clear();
        self.inbox.clear();
        self.requested = None;
    }

    /// Whether this session has already been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// The outcome of pulling one inbound frame from a session.
#[derive(Debug)]
pub enum Inbound {
    /// A response matched against a request this session itself sent.
    Response {
        /// The original request, if this session still had it pending (a response
        /// can arrive for a request this session no longer recognizes, e.g. after a
        /// reconnect reissued it with a fresh id elsewhere).
        echo: Option<Request>,
        /// The response payload.
        response: Response,
    },
    /// An unsolicited server push.
    Notification(Notification),
    /// A frame that failed to parse; the caller should treat this like a protocol
    /// violation (distilled spec §7).
    Malformed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_types::peer::Protocol;
    use serde_json::json;

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor::new("peer.example", 50002, Protocol::Tls)
    }

    #[test]
    fn queue_and_drain_outbox() {
        let mut s = Session::new(descriptor());
        s.queue_request(1, "server.version", vec![]).unwrap();
        let drained = s.drain_outbox();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].method, "server.version");
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn get_response_matches_pending_request_by_id() {
        let mut s = Session::new(descriptor());
        s.queue_request(7, "blockchain.block.get_header", vec![json!(100)]).unwrap();
        s.drain_outbox();
        s.push_inbound(json!({"id": 7, "result": {"height": 100}}));

        match s.get_response().unwrap() {
            Inbound::Response { echo, response } => {
                assert_eq!(echo.unwrap().id, 7);
                assert_eq!(response.id, 7);
            }
            other => panic!("expected a matched response, got {other:?}"),
        }
    }

    #[test]
    fn get_response_surfaces_unmatched_notifications() {
        let mut s = Session::new(descriptor());
        s.push_inbound(json!({"method": "blockchain.headers.subscribe", "params": [{"height": 5}]}));
        match s.get_response().unwrap() {
            Inbound::Notification(n) => assert_eq!(n.method, "blockchain.headers.subscribe"),
            other => panic!("expected a notification, got {other:?}"),
        }
    }

    #[test]
    fn get_response_is_none_when_inbox_empty_or_closed() {
        let mut s = Session::new(descriptor());
        assert!(s.get_response().is_none());
        s.push_inbound(json!({"id": 1, "result": null}));
        s.close();
        assert!(s.get_response().is_none());
    }

    #[test]
    fn close_is_idempotent_and_clears_pending_state() {
        let mut s = Session::new(descriptor());
        s.queue_request(1, "server.version", vec![]).unwrap();
        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(s.drain_outbox().is_empty());
    }

    #[test]
    fn has_timed_out_reflects_requested_at() {
        let mut s = Session::new(descriptor());
        assert!(!s.has_timed_out());
        s.requested = Some(OutstandingRequest {
            height: 10,
            is_chunk: false,
            requested_at: Instant::now() - hsync_types::network::REQUEST_TIMEOUT - Duration::from_secs(1),
        });
        assert!(s.has_timed_out());
    }
}
