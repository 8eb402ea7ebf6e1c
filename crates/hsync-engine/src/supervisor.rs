//! The session supervisor (component C): the single task that owns every mutable
//! piece of engine state and is the only thing allowed to touch it. Per-peer I/O runs
//! on its own spawned tasks (keepalive, outbound driver, inbound driver) that only
//! ever talk back to this task over a channel; nothing outside `Supervisor::run`
//! mutates a `Session`, the `Registry`, or the `Router` directly.
//!
//! Grounded on `apps/node/src/cli/node.rs`'s `Node`: a `CancellationToken` +
//! `TaskTracker` pair, `spawn_*` helpers for each background task, and a bounded-wait
//! `shutdown()`. Unlike `Node`, which fans work out across several long-lived
//! subsystem tasks that each own their own state, this supervisor keeps state
//! ownership on a single task and lets spawned tasks carry only the transport halves -
//! the cooperative-scheduler model the peer-session state machine was designed around.
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn, Instrument};

use hsync_chain::{Header, Registry};
use hsync_types::network::{
    Height, NetworkConstants, LAGGING_THRESHOLD, MAINTENANCE_TICK, NODES_RETRY_INTERVAL,
    SERVER_RETRY_INTERVAL,
};
use hsync_types::peer::{PeerDescriptor, Protocol};
use hsync_types::protocol::{MessageId, Notification, Request, Response};
use hsync_types::proxy::ProxyDescriptor;

use crate::config::EngineConfig;
use crate::control::{Command, ControlError};
use crate::directory::Directory;
use crate::events::{EventBus, Topic};
use crate::persist;
use crate::router::{self, Router};
use crate::session::{Inbound, Session};
use crate::sync::{self, BinaryBase, SyncAction};
use crate::transport;

/// How long a connection attempt may take before it's treated as a failure.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a spawned per-peer task reports back to the supervisor. The supervisor
/// is the only place these are matched on, so it's the only place state changes.
enum PeerEvent {
    /// A dial attempt finished, one way or the other.
    Connected(PeerDescriptor, Result<transport::Split, String>),
    /// A frame arrived from a connected peer.
    Inbound(String, Value),
    /// A peer's connection (inbound or outbound half) broke.
    LinkDown(String),
    /// The 1s keepalive tick fired for a peer.
    KeepaliveTick(String),
}

/// The session supervisor: owns the directory, chain registry, router, every live
/// peer session, and the bookkeeping the maintenance tick acts on.
pub struct Supervisor {
    config: EngineConfig,
    constants: NetworkConstants,
    config_dir: Option<PathBuf>,
    tls_connector: Option<Arc<tokio_rustls::TlsConnector>>,

    directory: Directory,
    registry: Registry,
    router: Router,
    sessions: HashMap<String, Session>,
    binary_bases: HashMap<String, BinaryBase>,
    outboxes: HashMap<String, flume::Sender<Request>>,

    connecting: HashSet<String>,
    disconnected_servers: HashSet<String>,
    recent_servers: Vec<String>,
    main_peer: Option<String>,
    banner: Option<String>,
    stopped: bool,

    nodes_retry_time: Instant,
    server_retry_time: Instant,

    event_bus: EventBus,
    events_tx: flume::Sender<PeerEvent>,

    cancellation: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    /// Build a supervisor, ready for [`Supervisor::run`]. `config_dir`, when given,
    /// is where the recent-servers file and certs directory live (distilled spec §6).
    pub fn new(
        config: EngineConfig,
        constants: NetworkConstants,
        config_dir: Option<PathBuf>,
        tls_connector: Option<Arc<tokio_rustls::TlsConnector>>,
        event_bus: EventBus,
    ) -> Self {
        let (events_tx, _events_rx) = flume::unbounded();
        let now = Instant::now();
        let registry = Registry::preallocate(constants.checkpoints);
        Self {
            config,
            constants,
            config_dir,
            tls_connector,
            directory: Directory::new(),
            registry,
            router: Router::new(),
            sessions: HashMap::new(),
            binary_bases: HashMap::new(),
            outboxes: HashMap::new(),
            connecting: HashSet::new(),
            disconnected_servers: HashSet::new(),
            recent_servers: Vec::new(),
            main_peer: None,
            banner: None,
            stopped: false,
            nodes_retry_time: now,
            server_retry_time: now,
            event_bus,
            events_tx,
            cancellation: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the supervisor until `cancellation` fires or a [`Command::Stop`] arrives,
    /// then wait (with a bound) for every spawned peer task to wind down.
    pub async fn run(mut self, commands: flume::Receiver<Command>, cancellation: CancellationToken) {
        self.cancellation = cancellation.clone();
        let (events_tx, events_rx) = flume::unbounded();
        self.events_tx = events_tx;

        if let Some(dir) = self.config_dir.clone() {
            self.recent_servers = persist::read_recent_servers(&dir);
        }
        self.start_network();

        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = maintenance.tick() => self.run_maintenance(),
                Ok(command) = commands.recv_async() => {
                    let stop = matches!(command, Command::Stop);
                    self.handle_command(command);
                    if stop { break; }
                }
                Ok(event) = events_rx.recv_async() => self.handle_event(event),
                else => break,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&self) {
        info!("supervisor shutting down, waiting for peer tasks to finish");
        self.cancellation.cancel();
        self.tracker.close();

        tokio::select! {
            _ = self.tracker.wait() => {}
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                warn!("shutdown timeout reached with peer tasks still running");
            }
        }
    }

    // ---- boot / peer slot management -----------------------------------------

    fn start_network(&mut self) {
        if self.stopped {
            return;
        }
        if self.config.target_peer_count() == 0 {
            if let Some(server) = self.config.server.clone() {
                self.spawn_connect(server);
            }
            return;
        }
        self.fill_peer_slots();
    }

    fn fill_peer_slots(&mut self) {
        if self.stopped {
            return;
        }
        let target = self.config.target_peer_count();
        let have = self.sessions.len() + self.connecting.len();
        if have >= target {
            return;
        }

        let mut candidates: Vec<PeerDescriptor> = Vec::new();
        if let Some(server) = self.config.server.clone() {
            if !self.is_connected_or_connecting(&server) {
                candidates.push(server);
            }
        }

        while have + candidates.len() < target {
            let exclude = self.known_descriptors();
            match self.directory.pick_random_server(Protocol::Tls, &exclude) {
                Some(candidate) if !candidates.contains(&candidate) => candidates.push(candidate),
                Some(_) => break,
                None => break,
            }
        }

        if candidates.is_empty() && have == 0 {
            candidates = Directory::default_servers(&self.constants)
                .into_iter()
                .filter(|d| !self.disconnected_servers.contains(&d.to_string()))
                .collect();
        }

        let slots = target.saturating_sub(have);
        for descriptor in candidates.into_iter().take(slots) {
            self.spawn_connect(descriptor);
        }
    }

    fn known_descriptors(&self) -> Vec<PeerDescriptor> {
        self.sessions
            .keys()
            .chain(self.connecting.iter())
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    fn is_connected_or_connecting(&self, descriptor: &PeerDescriptor) -> bool {
        let id = descriptor.to_string();
        self.sessions.contains_key(&id) || self.connecting.contains(&id)
    }

    fn spawn_connect(&mut self, descriptor: PeerDescriptor) {
        let peer_id = descriptor.to_string();
        if self.is_connected_or_connecting(&descriptor) {
            return;
        }
        self.connecting.insert(peer_id);

        let events_tx = self.events_tx.clone();
        let cancellation = self.cancellation.clone();
        let tls_connector = self.tls_connector.clone();

        self.tracker.spawn(async move {
            let attempt = tokio::time::timeout(
                CONNECT_TIMEOUT,
                transport::connect(&descriptor, tls_connector),
            );
            let outcome = tokio::select! {
                _ = cancellation.cancelled() => return,
                r = attempt => r,
            };

            let event = match outcome {
                Ok(Ok(split)) => PeerEvent::Connected(descriptor, Ok(split)),
                Ok(Err(e)) => PeerEvent::Connected(descriptor, Err(e.to_string())),
                Err(_) => PeerEvent::Connected(descriptor, Err("connection attempt timed out".to_string())),
            };
            let _ = events_tx.send_async(event).await;
        });
    }

    // ---- per-peer background tasks --------------------------------------------

    fn spawn_inbound_driver(&mut self, peer_id: String, mut reader: Box<dyn transport::FrameReader>) {
        let events_tx = self.events_tx.clone();
        let cancellation = self.cancellation.clone();
        let span = tracing::info_span!("peer_inbound", peer = %peer_id);
        self.tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        result = reader.recv() => match result {
                            Ok(Some(value)) => {
                                if events_tx.send_async(PeerEvent::Inbound(peer_id.clone(), value)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) | Err(_) => {
                                let _ = events_tx.send_async(PeerEvent::LinkDown(peer_id.clone())).await;
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn spawn_outbound_driver(
        &mut self,
        peer_id: String,
        mut writer: Box<dyn transport::FrameWriter>,
        outbound_rx: flume::Receiver<Request>,
    ) {
        let events_tx = self.events_tx.clone();
        let cancellation = self.cancellation.clone();
        let span = tracing::info_span!("peer_outbound", peer = %peer_id);
        self.tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => { writer.close().await; break; }
                        request = outbound_rx.recv_async() => match request {
                            Ok(request) => {
                                let value = serde_json::to_value(&request).expect("Request always serializes");
                                if writer.send(value).await.is_err() {
                                    let _ = events_tx.send_async(PeerEvent::LinkDown(peer_id.clone())).await;
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn spawn_keepalive(&mut self, peer_id: String) {
        let events_tx = self.events_tx.clone();
        let cancellation = self.cancellation.clone();
        let span = tracing::info_span!("peer_keepalive", peer = %peer_id);
        self.tracker.spawn(
            async move {
                let mut ticker = tokio::time::interval(hsync_types::network::MAINTENANCE_TICK);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = ticker.tick() => {
                            if events_tx.send_async(PeerEvent::KeepaliveTick(peer_id.clone())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    // ---- event handling ----------------------------------------------------

    fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected(descriptor, Ok(split)) => self.on_connected(descriptor, split),
            PeerEvent::Connected(descriptor, Err(reason)) => self.on_connect_failed(descriptor, reason),
            PeerEvent::Inbound(peer_id, value) => self.on_inbound(peer_id, value),
            PeerEvent::LinkDown(peer_id) => self.connection_down(&peer_id),
            PeerEvent::KeepaliveTick(peer_id) => self.on_keepalive_tick(&peer_id),
        }
    }

    fn on_connected(&mut self, descriptor: PeerDescriptor, split: transport::Split) {
        let peer_id = descriptor.to_string();
        self.connecting.remove(&peer_id);

        let (outbound_tx, outbound_rx) = flume::unbounded();
        self.outboxes.insert(peer_id.clone(), outbound_tx);
        self.sessions.insert(peer_id.clone(), Session::new(descriptor));

        self.spawn_inbound_driver(peer_id.clone(), split.reader);
        self.spawn_outbound_driver(peer_id.clone(), split.writer, outbound_rx);
        self.spawn_keepalive(peer_id.clone());

        self.send_request(
            &peer_id,
            "server.version",
            vec![json!("hsyncd"), json!(self.constants.protocol_version)],
        );

        self.event_bus.trigger_callback(Topic::Interfaces, &self.interfaces_snapshot());
    }

    fn on_connect_failed(&mut self, descriptor: PeerDescriptor, reason: String) {
        let peer_id = descriptor.to_string();
        self.connecting.remove(&peer_id);
        self.disconnected_servers.insert(peer_id.clone());
        warn!(peer = %peer_id, error = %reason, "connection attempt failed");
    }

    fn on_inbound(&mut self, peer_id: String, value: Value) {
        let drained = {
            let Some(session) = self.sessions.get_mut(&peer_id) else {
                return;
            };
            session.push_inbound(value);
            let mut drained = Vec::new();
            while let Some(inbound) = session.get_response() {
                drained.push(inbound);
            }
            drained
        };

        for inbound in drained {
            match inbound {
                Inbound::Malformed => {
                    self.connection_down(&peer_id);
                    return;
                }
                Inbound::Response { echo, response } => self.handle_response(&peer_id, echo, response),
                Inbound::Notification(notification) => self.handle_notification(&peer_id, notification),
            }
        }
    }

    fn on_keepalive_tick(&mut self, peer_id: &str) {
        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        if session.has_timed_out() {
            self.connection_down(peer_id);
            return;
        }
        if session.ping_required() {
            self.send_request(
                peer_id,
                "server.version",
                vec![json!("hsyncd"), json!(self.constants.protocol_version)],
            );
        }
    }

    fn connection_down(&mut self, peer_id: &str) {
        if let Some(mut session) = self.sessions.remove(peer_id) {
            session.close();
        }
        self.outboxes.remove(peer_id);
        self.binary_bases.remove(peer_id);

        for checkpoint in self.registry.checkpoints().collect::<Vec<_>>() {
            if let Some(branch) = self.registry.branch_mut(checkpoint) {
                if branch.leader() == Some(peer_id) {
                    branch.clear_leader();
                }
            }
        }

        if self.main_peer.as_deref() == Some(peer_id) {
            self.main_peer = None;
            self.event_bus.trigger_callback(Topic::Status, &json!({"connected": false}));
        }

        self.disconnected_servers.insert(peer_id.to_string());
        self.event_bus.trigger_callback(Topic::Interfaces, &self.interfaces_snapshot());
        info!(peer = %peer_id, "connection down");
    }

    fn interfaces_snapshot(&self) -> Value {
        json!(self.sessions.keys().cloned().collect::<Vec<_>>())
    }

    // ---- response / notification dispatch --------------------------------

    fn handle_response(&mut self, peer_id: &str, echo: Option<Request>, response: Response) {
        let Some(request) = echo else {
            if let Some(unanswered) = self.router.take_unanswered(response.id) {
                (unanswered.callback)(response);
            }
            return;
        };

        match request.method.as_str() {
            "server.version" => self.handle_server_version(peer_id, response),
            "blockchain.headers.subscribe" => self.handle_headers_subscribe_response(peer_id, response),
            "blockchain.block.get_header" => self.handle_get_header_response(peer_id, response),
            "blockchain.block.get_chunk" => self.handle_get_chunk_response(peer_id, response, &request),
            _ => {
                if let Some(unanswered) = self.router.take_unanswered(response.id) {
                    (unanswered.callback)(response);
                }
            }
        }
    }

    fn handle_server_version(&mut self, peer_id: &str, response: Response) {
        if response.is_error() {
            self.connection_down(peer_id);
            return;
        }
        let version = response
            .result
            .as_ref()
            .and_then(|v| v.as_array())
            .and_then(|a| a.get(1))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let already_subscribed = match self.sessions.get_mut(peer_id) {
            Some(session) => {
                session.server_version = version;
                session.tip.is_some()
            }
            None => return,
        };

        if !already_subscribed {
            self.send_request(peer_id, "blockchain.headers.subscribe", vec![]);
        }
    }

    fn handle_headers_subscribe_response(&mut self, peer_id: &str, response: Response) {
        if response.is_error() {
            self.connection_down(peer_id);
            return;
        }
        let Some(result) = response.result else {
            self.connection_down(peer_id);
            return;
        };
        self.dispatch_header_push(peer_id, result);
    }

    fn dispatch_header_push(&mut self, peer_id: &str, result: Value) {
        let Ok(header) = serde_json::from_value::<Header>(result) else {
            self.connection_down(peer_id);
            return;
        };
        let Some(mut session) = self.sessions.remove(peer_id) else {
            return;
        };
        let base = self.binary_bases.entry(peer_id.to_string()).or_default();
        let action = sync::on_notify_header(&mut self.registry, base, &mut session, peer_id, header, &self.constants);
        self.sessions.insert(peer_id.to_string(), session);
        self.apply_sync_action(peer_id, action);
    }

    fn handle_get_header_response(&mut self, peer_id: &str, response: Response) {
        if response.is_error() {
            self.connection_down(peer_id);
            return;
        }
        let Some(result) = response.result else {
            self.connection_down(peer_id);
            return;
        };
        let Ok(header) = serde_json::from_value::<Header>(result) else {
            self.connection_down(peer_id);
            return;
        };
        let Some(mut session) = self.sessions.remove(peer_id) else {
            return;
        };
        let base = self.binary_bases.entry(peer_id.to_string()).or_default();
        let action = sync::on_get_header(&mut self.registry, base, &mut session, peer_id, header, &self.constants);
        self.sessions.insert(peer_id.to_string(), session);
        self.apply_sync_action(peer_id, action);
    }

    fn handle_get_chunk_response(&mut self, peer_id: &str, response: Response, request: &Request) {
        if response.is_error() {
            self.connection_down(peer_id);
            return;
        }
        let Some(result) = response.result else {
            self.connection_down(peer_id);
            return;
        };
        let Ok(chunk) = serde_json::from_value::<Vec<Header>>(result) else {
            self.connection_down(peer_id);
            return;
        };
        let idx = request.params.first().and_then(|v| v.as_u64()).unwrap_or(0);
        let Some(mut session) = self.sessions.remove(peer_id) else {
            return;
        };
        let action = sync::on_get_chunk(&mut self.registry, &mut session, peer_id, idx, &chunk, &self.constants);
        self.sessions.insert(peer_id.to_string(), session);
        self.apply_sync_action(peer_id, action);
    }

    fn apply_sync_action(&mut self, peer_id: &str, action: SyncAction) {
        match action {
            SyncAction::None => {}
            SyncAction::RequestHeader(height) => {
                self.send_request(peer_id, "blockchain.block.get_header", vec![json!(height)]);
            }
            SyncAction::RequestChunk(idx) => {
                self.send_request(peer_id, "blockchain.block.get_chunk", vec![json!(idx)]);
            }
            SyncAction::CaughtUp => {
                self.event_bus.trigger_callback(Topic::Updated, &json!({"peer": peer_id}));
                self.maybe_switch_lagging_interface();
            }
            SyncAction::Attached => {
                self.maybe_switch_lagging_interface();
            }
            SyncAction::ConnectionDown => self.connection_down(peer_id),
        }
    }

    fn handle_notification(&mut self, peer_id: &str, notification: Notification) {
        match notification.method.as_str() {
            "blockchain.headers.subscribe" => {
                let (_, result) = router::canonicalize_notification(notification);
                self.dispatch_header_push(peer_id, result);
            }
            "server.peers.subscribe" => self.handle_peers_push(notification),
            "server.banner" => {
                if let Some(banner) = notification.params.first().and_then(|v| v.as_str()) {
                    self.banner = Some(banner.to_string());
                    self.event_bus.trigger_callback(Topic::Banner, &json!(banner));
                }
            }
            _ => {
                let (index, result) = router::canonicalize_notification(notification);
                self.router.publish(&index, result);
            }
        }
    }

    fn handle_peers_push(&mut self, notification: Notification) {
        let Some(result) = notification.params.into_iter().next() else {
            return;
        };
        let Ok(entries) = serde_json::from_value::<Vec<(String, String, Vec<String>)>>(result) else {
            return;
        };
        self.directory = Directory::parse_servers(&entries);
        self.event_bus
            .trigger_callback(Topic::Servers, &json!({"count": self.directory.len()}));
    }

    // ---- sending -------------------------------------------------------------

    fn send_request(&mut self, peer_id: &str, method: impl Into<String>, params: Vec<Value>) -> Option<MessageId> {
        let id = self.router.next_id();
        self.forward_to_peer(peer_id, id, method, params);
        Some(id)
    }

    fn forward_to_peer(&mut self, peer_id: &str, id: MessageId, method: impl Into<String>, params: Vec<Value>) {
        let method = method.into();
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        if session.queue_request(id, method, params).is_err() {
            return;
        }
        let requests = session.drain_outbox();
        if let Some(tx) = self.outboxes.get(peer_id) {
            for request in requests {
                let _ = tx.send(request);
            }
        }
    }

    // ---- maintenance / main-peer switching ------------------------------------

    fn run_maintenance(&mut self) {
        if self.stopped {
            return;
        }
        self.fill_peer_slots();

        let now = Instant::now();
        if now.duration_since(self.nodes_retry_time) >= NODES_RETRY_INTERVAL {
            self.disconnected_servers.clear();
            self.nodes_retry_time = now;
        }

        if self.config.server.is_some()
            && !self.config.auto_connect
            && now.duration_since(self.server_retry_time) >= SERVER_RETRY_INTERVAL
        {
            self.server_retry_time = now;
            if let Some(server) = self.config.server.clone() {
                if !self.is_connected_or_connecting(&server) {
                    self.spawn_connect(server);
                }
            }
        }

        self.maybe_switch_lagging_interface();
    }

    /// distilled spec §4.C: "only if `auto_connect` AND local height exceeds main
    /// peer's tip by > 1. Chooses uniformly among peers whose `tip_header` equals the
    /// local header at local height; fallback: stay." Ground truth at
    /// `examples/original_source/lib/network.py`'s `server_is_lagging`/
    /// `switch_lagging_interface`: `sh = main peer's declared tip`, `lh = local branch
    /// height`, lagging iff `lh - sh > 1`.
    fn maybe_switch_lagging_interface(&mut self) {
        if !self.config.auto_connect {
            return;
        }

        if let Some(current) = self.main_peer.clone() {
            if !self.sessions.contains_key(&current) {
                self.main_peer = None;
            } else {
                let server_height = self.sessions.get(&current).and_then(|s| s.tip).unwrap_or(0);
                let current_branch = self
                    .peer_branch(&current)
                    .unwrap_or_else(|| self.registry.current(self.config.blockchain_index, None));
                let current_height = self.registry.height(current_branch).unwrap_or(0);
                if current_height.saturating_sub(server_height) > LAGGING_THRESHOLD {
                    self.switch_to_matching_peer(current_branch, current_height, Some(current.as_str()));
                }
                return;
            }
        }

        let current_branch = self.registry.current(self.config.blockchain_index, None);
        if let Some(current_height) = self.registry.height(current_branch) {
            self.switch_to_matching_peer(current_branch, current_height, None);
        }
    }

    /// Switch to a uniformly-random connected peer (other than `exclude`) whose
    /// declared `tip_header` equals the header stored locally at `(branch, height)`;
    /// does nothing if no such peer is connected (distilled spec §4.C fallback: stay).
    fn switch_to_matching_peer(&mut self, branch: Height, height: Height, exclude: Option<&str>) {
        let Some(local_header) = self.registry.read_header(branch, height).copied() else {
            return;
        };
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|(id, _)| exclude != Some(id.as_str()))
            .filter(|(_, session)| session.tip_header.as_ref() == Some(&local_header))
            .map(|(id, _)| id.clone())
            .collect();
        if candidates.is_empty() {
            return;
        }
        let choice = candidates[fastrand::usize(..candidates.len())].clone();
        self.switch_to_interface(choice);
    }

    fn peer_branch(&self, peer_id: &str) -> Option<Height> {
        self.sessions.get(peer_id)?.branch
    }

    fn switch_to_interface(&mut self, peer_id: String) {
        if self.main_peer.as_deref() == Some(peer_id.as_str()) {
            return;
        }
        if !self.sessions.contains_key(&peer_id) {
            return;
        }
        self.main_peer = Some(peer_id.clone());
        self.router.clear_cache();

        let pending: Vec<(router::UnansweredRequest, Vec<Value>)> = self
            .router
            .drain_unanswered()
            .into_iter()
            .map(|(_, unanswered)| {
                let params = unanswered.params.clone();
                (unanswered, params)
            })
            .collect();
        let reissued = router::reissue(&mut self.router, pending);
        for (id, request) in reissued {
            self.forward_to_peer(&peer_id, id, request.method, request.params);
        }

        for index in self.router.subscription_indices() {
            let (method, params) = split_subscription_index(&index);
            let id = self.router.next_id();
            self.forward_to_peer(&peer_id, id, method, params);
        }

        if let Ok(descriptor) = peer_id.parse::<PeerDescriptor>() {
            persist::add_recent_server(&mut self.recent_servers, &descriptor);
            if let Some(dir) = self.config_dir.clone() {
                let _ = persist::save_recent_servers(&dir, &self.recent_servers);
            }
        }

        self.event_bus.trigger_callback(Topic::Status, &json!({"connected": true, "peer": peer_id}));
    }

    // ---- control API entry points ---------------------------------------------

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Synchronous { method, params, reply } => self.handle_synchronous(method, params, reply),
            Command::Subscribe { method, params, callback, reply } => {
                self.handle_subscribe(method, params, callback, reply)
            }
            Command::SetParameters { server, proxy, auto_connect, oneserver } => {
                self.set_parameters(server, proxy, auto_connect, oneserver)
            }
            Command::SwitchToInterface(peer_id) => self.switch_to_interface(peer_id),
            Command::GetInterfaces(reply) => {
                let _ = reply.send(self.sessions.keys().cloned().collect());
            }
            Command::GetBlockchains(reply) => {
                let attachments = self.sessions.iter().filter_map(|(id, s)| s.branch.map(|b| (id.as_str(), b)));
                let grouped = self.registry.peers_by_branch(attachments);
                let owned = grouped
                    .into_iter()
                    .map(|(h, peers)| (h, peers.into_iter().map(str::to_string).collect()))
                    .collect();
                let _ = reply.send(owned);
            }
            Command::Stop => {
                self.stopped = true;
            }
        }
    }

    fn handle_synchronous(
        &mut self,
        method: String,
        params: Vec<Value>,
        reply: tokio::sync::oneshot::Sender<Result<Value, ControlError>>,
    ) {
        let Some(main_peer) = self.main_peer.clone() else {
            let _ = reply.send(Err(ControlError::NoMainPeer));
            return;
        };

        let reply = std::sync::Mutex::new(Some(reply));
        let callback: router::Callback = Box::new(move |response| {
            if let Some(reply) = reply.lock().expect("reply mutex poisoned").take() {
                let outcome = if response.is_error() {
                    Err(ControlError::Rpc(response.error.expect("is_error implies Some")))
                } else {
                    Ok(response.result.unwrap_or(Value::Null))
                };
                let _ = reply.send(outcome);
            }
        });

        let id = self.router.next_id();
        self.router.track(
            id,
            router::UnansweredRequest {
                method: method.clone(),
                params: params.clone(),
                callback,
                enqueued_at: Instant::now(),
            },
        );
        self.forward_to_peer(&main_peer, id, method, params);
    }

    fn handle_subscribe(
        &mut self,
        method: String,
        params: Vec<Value>,
        callback: router::SubscriptionCallback,
        reply: tokio::sync::oneshot::Sender<Option<Value>>,
    ) {
        let index = router::subscription_index(&method, &params);
        let cached = self.router.subscribe(index, callback);
        if cached.is_none() {
            if let Some(main_peer) = self.main_peer.clone() {
                self.send_request(&main_peer, method, params);
            }
        }
        let _ = reply.send(cached);
    }

    /// Apply new server/proxy/auto-connect/oneserver knobs (distilled spec §4.C): a
    /// changed proxy forces a full teardown and reconnect since every live socket was
    /// dialed through the old one; a changed default server (proxy unchanged) just
    /// switches main peer; otherwise only a lagging-interface switch may apply.
    fn set_parameters(
        &mut self,
        server: Option<PeerDescriptor>,
        proxy: Option<ProxyDescriptor>,
        auto_connect: bool,
        oneserver: bool,
    ) {
        let proxy_changed = proxy != self.config.proxy;
        let server_changed = server != self.config.server;

        self.config.server = server.clone();
        self.config.proxy = proxy;
        self.config.auto_connect = auto_connect;
        self.config.oneserver = oneserver;

        if proxy_changed {
            self.stop_network();
            self.start_network();
            return;
        }

        if server_changed {
            if let Some(server) = server {
                self.switch_to_interface(server.to_string());
            }
            self.fill_peer_slots();
            return;
        }

        self.maybe_switch_lagging_interface();
        self.event_bus
            .trigger_callback(Topic::Status, &json!({"auto_connect": auto_connect}));
    }

    /// Tear down every live peer session, as if each had gone down on its own
    /// (distilled spec §4.C `stop_network`: "close main and all peers"). Used before
    /// reconnecting under a changed proxy, since every existing socket was dialed
    /// through the old one.
    fn stop_network(&mut self) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer_id in peers {
            self.connection_down(&peer_id);
        }
        self.disconnected_servers.clear();
    }
}

/// Recover `(method, params)` from a subscription index string built by
/// [`router::subscription_index`] (distilled spec §4.D `send_subscriptions`: resend
/// every registered subscription to the new main peer).
fn split_subscription_index(index: &str) -> (String, Vec<Value>) {
    match index.split_once(':') {
        Some((method, param)) => (method.to_string(), vec![Value::String(param.to_string())]),
        None => (index.to_string(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_subscription_index_recovers_method_and_param() {
        assert_eq!(
            split_subscription_index("blockchain.scripthash.subscribe:abcd"),
            ("blockchain.scripthash.subscribe".to_string(), vec![json!("abcd")])
        );
        assert_eq!(
            split_subscription_index("server.peers.subscribe"),
            ("server.peers.subscribe".to_string(), Vec::new())
        );
    }
}
