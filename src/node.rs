/// Node module - lifecycle and public API of a communicating node
///
/// A `Node` owns its transport, dispatch table, acknowledgment tracker and
/// query correlator. It is a cheap handle: clones share the same node, and
/// every handler receives `&Node` so it can reply without capturing one.
///
/// Inbound pipeline, run on the receive thread for each envelope:
/// TTL check, acknowledgment resolution, query correlation, dispatch, then
/// an automatic acknowledgment when the sender asked for one.
use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::ack_manager::{AckManager, AckResolution};
use crate::config::NodeConfig;
use crate::contracts::{new_id, now_secs, payload, Envelope, MessageKind, Payload, Priority};
use crate::correlator::{DataQuery, QueryCorrelator, QueryTicket};
use crate::dispatch::{DispatchKey, DispatchOutcome, DispatchTable};
use crate::errors::{HandlerError, NodeError, QueryError, SendError};
use crate::receiver::EnvelopeSink;
use crate::transmitter::Transmitter;
use crate::transport::Transport;

/// Lifecycle states
///
/// `Initializing -> Starting -> Running -> Stopping -> Stopped`, with
/// `Error` reachable from `Starting` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Initializing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a node, as returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusSnapshot {
    pub node_name: String,
    pub node_id: String,
    pub status: NodeState,
    pub last_heartbeat: f64,
    /// Seconds since the node last entered RUNNING, zero if it never did
    pub uptime: f64,
    pub pending_acks: usize,
    pub pending_queries: usize,
}

/// What the inbound pipeline did with an envelope
#[derive(Debug)]
pub enum ProcessOutcome {
    /// TTL had passed; dropped before dispatch
    Expired,
    /// Consumed as an acknowledgment
    Acknowledged,
    /// Consumed by a pending query
    QueryCompleted,
    Dispatched(DispatchOutcome),
}

/// Result of an emergency multicast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyReport {
    pub envelope_id: String,
    pub sent: usize,
    pub attempted: usize,
}

struct Runtime {
    state: NodeState,
    last_heartbeat: f64,
    started_at: Option<Instant>,
}

struct NodeInner {
    name: String,
    node_id: String,
    config: NodeConfig,
    runtime: Mutex<Runtime>,
    handlers: DispatchTable<Node>,
    acks: AckManager,
    queries: QueryCorrelator,
    transport: Mutex<Option<Transport>>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("node_id", &self.inner.node_id)
            .field("state", &self.status())
            .finish()
    }
}

impl Node {
    /// Create a node with the default handlers registered
    pub fn new(name: impl Into<String>, config: NodeConfig) -> Self {
        let node = Self {
            inner: Arc::new(NodeInner {
                name: name.into(),
                node_id: new_id(),
                config,
                runtime: Mutex::new(Runtime {
                    state: NodeState::Initializing,
                    last_heartbeat: now_secs(),
                    started_at: None,
                }),
                handlers: DispatchTable::new(),
                acks: AckManager::new(),
                queries: QueryCorrelator::new(),
                transport: Mutex::new(None),
            }),
        };
        node.register_default_handlers();
        info!(node = %node.inner.name, node_id = %node.inner.node_id, "node initialized");
        node
    }

    fn register_default_handlers(&self) {
        let handlers = &self.inner.handlers;

        handlers.register(MessageKind::Heartbeat, |node: &Node, envelope: &Envelope, _| {
            node.runtime().last_heartbeat = now_secs();
            debug!(node = %node.name(), from = envelope.source(), "heartbeat received");
            Ok(())
        });

        handlers.register(MessageKind::Status, |node: &Node, envelope: &Envelope, from| {
            let status = node.get_status();
            let body = payload(json!({
                "node_name": status.node_name,
                "status": status.status,
                "last_heartbeat": status.last_heartbeat,
                "uptime": status.uptime,
            }));
            node.respond(envelope, body, from)?;
            Ok(())
        });

        handlers.register(MessageKind::Emergency, |node: &Node, envelope: &Envelope, _| {
            error!(
                node = %node.name(),
                from = envelope.source(),
                payload = %serde_json::Value::Object(envelope.payload().clone()),
                "EMERGENCY MESSAGE"
            );
            Ok(())
        });

        handlers.register(crate::ACK_DISPATCH_KEY, |node: &Node, envelope: &Envelope, _| {
            debug!(node = %node.name(), ack_for = ?envelope.acknowledged_id(), "acknowledgment received");
            Ok(())
        });
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn status(&self) -> NodeState {
        self.runtime().state
    }

    /// Address of the bound endpoint while running with direct communication
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport()
            .as_ref()
            .and_then(|transport| transport.local_addr().ok())
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.inner.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transport(&self) -> MutexGuard<'_, Option<Transport>> {
        self.inner.transport.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ----- lifecycle -----

    /// Start the node
    ///
    /// Binds the local endpoint and starts the receive loop when direct
    /// communication is enabled. Returns false if the node is not in a
    /// startable state or the endpoint cannot be bound; the latter leaves the
    /// node in `Error`.
    pub fn start(&self) -> bool {
        {
            let mut runtime = self.runtime();
            match runtime.state {
                NodeState::Initializing | NodeState::Stopped => runtime.state = NodeState::Starting,
                state => {
                    warn!(node = %self.name(), %state, "start refused");
                    return false;
                }
            }
        }

        match self.start_communication() {
            Ok(transport) => self.finish_start(transport),
            Err(err) => {
                let mut runtime = self.runtime();
                if runtime.state == NodeState::Starting {
                    runtime.state = NodeState::Error;
                }
                error!(node = %self.name(), error = %err, "failed to start node");
                false
            }
        }
    }

    fn start_communication(&self) -> Result<Option<Transport>, NodeError> {
        let config = self.config();
        if !config.direct_communication {
            info!(node = %self.name(), "direct communication disabled, send only");
            return Ok(None);
        }

        let mut transport = Transport::bind(config.bind_addr()?)?.with_poll_interval(config.poll_interval());
        transport.start_receiving(
            self.name(),
            NodeSink {
                node: Arc::downgrade(&self.inner),
            },
        )?;
        info!(node = %self.name(), addr = ?transport.local_addr().ok(), "listening");
        Ok(Some(transport))
    }

    /// Publish the transport and enter `Running`, unless `stop()` got in
    /// while the endpoint was being set up
    fn finish_start(&self, transport: Option<Transport>) -> bool {
        {
            let mut runtime = self.runtime();
            if runtime.state == NodeState::Starting {
                *self.transport() = transport;
                runtime.state = NodeState::Running;
                runtime.started_at = Some(Instant::now());
                info!(node = %self.name(), "node started");
                return true;
            }
        }

        warn!(node = %self.name(), "stopped during startup, releasing endpoint");
        if let Some(transport) = transport {
            transport.stop_receiving(self.config().shutdown_timeout());
        }
        false
    }

    /// Stop the node
    ///
    /// Safe in any state. A running receive loop is signalled and given up
    /// to the configured shutdown timeout to finish its current handler.
    pub fn stop(&self) {
        {
            let mut runtime = self.runtime();
            match runtime.state {
                NodeState::Running | NodeState::Starting => runtime.state = NodeState::Stopping,
                NodeState::Stopping => return,
                _ => {
                    runtime.state = NodeState::Stopped;
                    info!(node = %self.name(), "node stopped");
                    return;
                }
            }
        }

        // Take the transport out before waiting so handlers replying during
        // shutdown never block on this lock.
        let transport = self.transport().take();
        if let Some(transport) = transport {
            if !transport.stop_receiving(self.config().shutdown_timeout()) {
                warn!(node = %self.name(), "receive loop still running after shutdown timeout");
            }
        }

        let mut runtime = self.runtime();
        runtime.state = NodeState::Stopped;
        runtime.started_at = None;
        info!(node = %self.name(), "node stopped");
    }

    // ----- handlers -----

    /// Register a handler, replacing any previous one for `key`
    pub fn register_handler<F>(&self, key: impl Into<DispatchKey>, handler: F)
    where
        F: Fn(&Node, &Envelope, SocketAddr) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.handlers.register(key, handler);
    }

    pub fn unregister_handler(&self, key: impl Into<DispatchKey>) -> bool {
        self.inner.handlers.unregister(key).is_some()
    }

    pub fn has_handler(&self, key: impl Into<DispatchKey>) -> bool {
        self.inner.handlers.contains(key)
    }

    // ----- inbound -----

    /// Run one inbound envelope through the pipeline
    ///
    /// Normally driven by the receive loop; callable directly to inject an
    /// envelope as if it had arrived from `from`.
    pub fn process_envelope(&self, envelope: Envelope, from: SocketAddr) -> ProcessOutcome {
        if envelope.is_expired() {
            warn!(node = %self.name(), id = %envelope.id(), from = envelope.source(), "envelope expired");
            return ProcessOutcome::Expired;
        }

        if let resolution @ (AckResolution::Resolved(_) | AckResolution::Unmatched(_)) =
            self.inner.acks.resolve(&envelope)
        {
            if let AckResolution::Unmatched(ack_for) = &resolution {
                debug!(node = %self.name(), %ack_for, "ack for nothing pending");
            }
            self.inner
                .handlers
                .dispatch_to(DispatchKey::from(crate::ACK_DISPATCH_KEY), self, &envelope, from);
            return ProcessOutcome::Acknowledged;
        }

        let outcome = if self.inner.queries.resolve(&envelope) {
            ProcessOutcome::QueryCompleted
        } else {
            ProcessOutcome::Dispatched(self.inner.handlers.dispatch(self, &envelope, from))
        };

        if envelope.requires_ack() {
            let ack = Envelope::ack_for(&envelope, self.name());
            if let Err(err) = self.send(&ack, from) {
                warn!(node = %self.name(), id = %envelope.id(), error = %err, "failed to send ack");
            }
        }

        outcome
    }

    fn sweep_expired(&self) {
        if let Some(max_age) = self.config().ack_expiry() {
            self.inner.acks.sweep_expired(max_age);
        }
        if let Some(max_age) = self.config().query_expiry() {
            self.inner.queries.sweep_expired(max_age);
        }
    }

    // ----- outbound -----

    /// Send an envelope to an address
    ///
    /// Uses the bound endpoint when running, a throwaway socket otherwise.
    /// Envelopes that require an ack are tracked from just before the send;
    /// a failed first send stops tracking again.
    pub fn send(&self, envelope: &Envelope, addr: SocketAddr) -> Result<usize, SendError> {
        let tracked = envelope.requires_ack() && self.inner.acks.mark_pending(envelope);
        let endpoint: Option<Arc<UdpSocket>> = self.transport().as_ref().map(Transport::endpoint);
        let result = match endpoint {
            Some(socket) => Transmitter::send(&socket, envelope, addr),
            None => Transmitter::send_ephemeral(envelope, addr),
        };
        if result.is_err() && tracked {
            self.inner.acks.forget(envelope.id());
        }
        result
    }

    /// Send an envelope to a peer named in `known_nodes`
    pub fn send_to_peer(&self, envelope: &Envelope) -> Result<usize, SendError> {
        let addr = self
            .config()
            .peer_addr(envelope.destination())
            .ok_or_else(|| SendError::UnknownPeer(envelope.destination().to_string()))?;
        self.send(envelope, addr)
    }

    /// Reply to `request` at the address it came from, echoing its id
    pub fn respond(&self, request: &Envelope, body: Payload, from: SocketAddr) -> Result<usize, SendError> {
        let response = Envelope::reply_to(request, self.name(), body);
        self.send(&response, from)
    }

    pub fn send_to_master(
        &self,
        kind: MessageKind,
        body: Payload,
        priority: Priority,
        requires_ack: bool,
    ) -> bool {
        let envelope = Envelope::new(kind, self.name(), crate::MASTER_CORE_NAME, body)
            .with_priority(priority)
            .with_requires_ack(requires_ack);

        let Some(addr) = self.config().master_addr() else {
            error!(node = %self.name(), host = %self.config().master_core_host, "cannot resolve master core");
            return false;
        };
        self.log_send(&envelope, self.send(&envelope, addr))
    }

    pub fn send_to_node(
        &self,
        node_name: &str,
        kind: MessageKind,
        body: Payload,
        priority: Priority,
        requires_ack: bool,
    ) -> bool {
        let envelope = Envelope::new(kind, self.name(), node_name, body)
            .with_priority(priority)
            .with_requires_ack(requires_ack);
        self.log_send(&envelope, self.send_to_peer(&envelope))
    }

    /// Send one emergency envelope to each named node
    ///
    /// True iff at least one send succeeded.
    pub fn send_emergency<S: AsRef<str>>(&self, node_names: &[S], body: Payload) -> bool {
        self.broadcast_emergency(node_names, body).sent > 0
    }

    /// Emergency multicast to the configured `emergency_nodes`
    pub fn send_emergency_to_configured(&self, body: Payload) -> bool {
        let targets = self.config().emergency_nodes.clone();
        self.send_emergency(&targets, body)
    }

    /// Emergency multicast with a per-target count
    ///
    /// The same envelope (one id) goes to every target with `requires_ack`
    /// set; the first ack to arrive resolves it.
    pub fn broadcast_emergency<S: AsRef<str>>(&self, node_names: &[S], body: Payload) -> EmergencyReport {
        let envelope = Envelope::new(
            MessageKind::Emergency,
            self.name(),
            crate::BROADCAST_DESTINATION,
            body,
        )
        .with_priority(Priority::Emergency)
        .with_requires_ack(true);

        let mut sent = 0;
        for target in node_names {
            let target: &str = target.as_ref();
            let result = self
                .config()
                .peer_addr(target)
                .ok_or_else(|| SendError::UnknownPeer(target.to_string()))
                .and_then(|addr| self.send(&envelope, addr));
            match result {
                Ok(_) => sent += 1,
                Err(err) => error!(node = %self.name(), %target, error = %err, "emergency send failed"),
            }
        }

        info!(node = %self.name(), sent, attempted = node_names.len(), "emergency message sent to {}/{} nodes", sent, node_names.len());
        EmergencyReport {
            envelope_id: envelope.id().to_string(),
            sent,
            attempted: node_names.len(),
        }
    }

    /// HEARTBEAT to the master core
    pub fn send_heartbeat(&self) -> bool {
        let body = payload(json!({
            "node_id": self.node_id(),
            "status": self.status(),
            "timestamp": now_secs(),
        }));
        self.send_to_master(MessageKind::Heartbeat, body, Priority::Normal, false)
    }

    fn log_send(&self, envelope: &Envelope, result: Result<usize, SendError>) -> bool {
        match result {
            Ok(_) => true,
            Err(err) => {
                error!(node = %self.name(), id = %envelope.id(), destination = envelope.destination(), error = %err, "failed to send message");
                false
            }
        }
    }

    // ----- queries -----

    /// Send a COMMAND to `destination` and call `on_result` with its response
    ///
    /// Returns the request id. The responder should echo it as
    /// `payload.request_id` (see `Envelope::reply_to`).
    pub fn query<F>(&self, destination: &str, body: Payload, on_result: F) -> Result<String, QueryError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        let (request, addr) = self.prepare_query(destination, body)?;
        self.inner.queries.register(request.id(), destination, on_result);
        self.dispatch_query(request, addr)
    }

    /// Like `query`, returning a ticket to await instead of taking a callback
    pub fn query_async(&self, destination: &str, body: Payload) -> Result<QueryTicket, QueryError> {
        let (request, addr) = self.prepare_query(destination, body)?;
        let ticket = self.inner.queries.register_ticket(request.id(), destination);
        self.dispatch_query(request, addr)?;
        Ok(ticket)
    }

    /// Record query against the `db_client` node
    pub fn query_data<F>(&self, query: &DataQuery, on_result: F) -> Result<String, QueryError>
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        self.query(crate::DB_CLIENT_NODE, query.to_payload(), on_result)
    }

    pub fn cancel_query(&self, request_id: &str) -> bool {
        self.inner.queries.cancel(request_id)
    }

    fn prepare_query(&self, destination: &str, body: Payload) -> Result<(Envelope, SocketAddr), QueryError> {
        let addr = self
            .config()
            .peer_addr(destination)
            .ok_or_else(|| QueryError::UnknownPeer(destination.to_string()))?;
        let request = Envelope::new(MessageKind::Command, self.name(), destination, body);
        Ok((request, addr))
    }

    fn dispatch_query(&self, request: Envelope, addr: SocketAddr) -> Result<String, QueryError> {
        match self.send(&request, addr) {
            Ok(_) => Ok(request.id().to_string()),
            Err(err) => {
                self.inner.queries.cancel(request.id());
                Err(err.into())
            }
        }
    }

    // ----- status -----

    pub fn get_status(&self) -> NodeStatusSnapshot {
        let (status, last_heartbeat, uptime) = {
            let runtime = self.runtime();
            let uptime = runtime
                .started_at
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(0.0);
            (runtime.state, runtime.last_heartbeat, uptime)
        };
        NodeStatusSnapshot {
            node_name: self.name().to_string(),
            node_id: self.node_id().to_string(),
            status,
            last_heartbeat,
            uptime,
            pending_acks: self.inner.acks.pending_count(),
            pending_queries: self.inner.queries.pending_count(),
        }
    }

    pub fn last_heartbeat(&self) -> f64 {
        self.runtime().last_heartbeat
    }

    pub fn is_ack_pending(&self, id: &str) -> bool {
        self.inner.acks.is_pending(id)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.acks.pending_count()
    }
}

/// Receive-loop adapter; holds the node weakly so dropping every `Node`
/// handle lets the loop wind down
struct NodeSink {
    node: Weak<NodeInner>,
}

impl EnvelopeSink for NodeSink {
    fn on_envelope(&mut self, envelope: Envelope, from: SocketAddr) {
        if let Some(inner) = self.node.upgrade() {
            Node { inner }.process_envelope(envelope, from);
        }
    }

    fn on_poll(&mut self) {
        if let Some(inner) = self.node.upgrade() {
            Node { inner }.sweep_expired();
        }
    }
}
