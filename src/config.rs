/// Node configuration
///
/// Loading configuration from disk is left to the embedding application;
/// `NodeConfig` only needs to deserialize from whatever it reads. Every
/// field has a default so partial documents are accepted.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::NodeError;

/// Static address of a peer node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address, preferring IPv4
    pub fn resolve(&self) -> Option<SocketAddr> {
        resolve_host(&self.host, self.port)
    }
}

fn resolve_host(host: &str, port: u16) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().ok()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub master_core_host: String,
    pub master_core_port: u16,

    /// Interface the node binds when direct communication is enabled
    pub bind_host: String,
    pub node_port: u16,

    /// Bind a local endpoint and run a receive loop; when off the node can
    /// only send
    pub direct_communication: bool,

    /// Peer name to address table
    pub known_nodes: HashMap<String, PeerAddress>,

    /// Targets for `send_emergency_to_configured`
    pub emergency_nodes: Vec<String>,

    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,

    /// Drop unacknowledged sends after this long; `None` keeps them forever
    pub ack_expiry_ms: Option<u64>,

    /// Drop unanswered queries after this long; `None` keeps them forever
    pub query_expiry_ms: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master_core_host: "localhost".to_string(),
            master_core_port: 14550,
            bind_host: Ipv4Addr::UNSPECIFIED.to_string(),
            node_port: 14551,
            direct_communication: true,
            known_nodes: HashMap::new(),
            emergency_nodes: Vec::new(),
            poll_interval_ms: crate::DEFAULT_POLL_INTERVAL_MS,
            shutdown_timeout_ms: crate::DEFAULT_SHUTDOWN_TIMEOUT_MS,
            ack_expiry_ms: None,
            query_expiry_ms: None,
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }

    /// Local endpoint address
    pub fn bind_addr(&self) -> Result<SocketAddr, NodeError> {
        let ip: IpAddr = self
            .bind_host
            .parse()
            .map_err(|_| NodeError::Config(format!("invalid bind_host `{}`", self.bind_host)))?;
        Ok(SocketAddr::new(ip, self.node_port))
    }

    pub fn master_addr(&self) -> Option<SocketAddr> {
        resolve_host(&self.master_core_host, self.master_core_port)
    }

    pub fn peer_addr(&self, name: &str) -> Option<SocketAddr> {
        self.known_nodes.get(name).and_then(PeerAddress::resolve)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn ack_expiry(&self) -> Option<Duration> {
        self.ack_expiry_ms.map(Duration::from_millis)
    }

    pub fn query_expiry(&self) -> Option<Duration> {
        self.query_expiry_ms.map(Duration::from_millis)
    }
}

/// NodeConfigBuilder - fluent interface over `NodeConfig`
#[derive(Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_master_core(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.master_core_host = host.into();
        self.config.master_core_port = port;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.config.bind_host = host.into();
        self
    }

    pub fn with_node_port(mut self, port: u16) -> Self {
        self.config.node_port = port;
        self
    }

    pub fn with_direct_communication(mut self, enabled: bool) -> Self {
        self.config.direct_communication = enabled;
        self
    }

    pub fn with_known_node(mut self, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.config
            .known_nodes
            .insert(name.into(), PeerAddress::new(host, port));
        self
    }

    pub fn with_emergency_node(mut self, name: impl Into<String>) -> Self {
        self.config.emergency_nodes.push(name.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ack_expiry(mut self, expiry: Duration) -> Self {
        self.config.ack_expiry_ms = Some(expiry.as_millis() as u64);
        self
    }

    pub fn with_query_expiry(mut self, expiry: Duration) -> Self {
        self.config.query_expiry_ms = Some(expiry.as_millis() as u64);
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}
