//! Node Comm - UDP communication core for autonomous control nodes
//!
//! **Creator**: Shayan Golmezerji
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! Each node exchanges typed, prioritized envelopes with a master core and
//! with peer nodes directly, over plain UDP datagrams.
//!
//! # Design Principles
//! - One JSON envelope per datagram, no fragmentation
//! - No delivery or ordering guarantees; acknowledgments are tracked, never resent
//! - A single receive thread per node; handlers run sequentially on it
//! - Nothing that happens while processing one datagram may stop the next

pub mod errors;
pub mod contracts;
pub mod codec;
pub mod config;
pub mod transmitter;
pub mod receiver;
pub mod transport;
pub mod dispatch;
pub mod ack_manager;
pub mod correlator;
pub mod node;

pub use ack_manager::{AckManager, AckRecord, AckResolution};
pub use config::{NodeConfig, NodeConfigBuilder, PeerAddress};
pub use contracts::{payload, Envelope, MessageKind, Payload, Priority};
pub use correlator::{DataQuery, QueryCorrelator, QueryTicket};
pub use dispatch::{DispatchKey, DispatchOutcome, DispatchTable, Handler};
pub use errors::{
    DecodeError, HandlerError, NodeError, QueryError, Result, SendError, StartupError,
};
pub use node::{EmergencyReport, Node, NodeState, NodeStatusSnapshot, ProcessOutcome};
pub use transport::Transport;

/// Largest envelope that fits in one UDP datagram over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Receive loop wait window in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// How long `stop()` waits for the receive loop to exit
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Logical name of the coordinator node
pub const MASTER_CORE_NAME: &str = "master_core";

/// Destination used for emergency multicast envelopes
pub const BROADCAST_DESTINATION: &str = "multiple";

/// Dispatch key that observes consumed acknowledgments
pub const ACK_DISPATCH_KEY: &str = "ack";

/// Peer name of the data-service node targeted by `query_data`
pub const DB_CLIENT_NODE: &str = "db_client";
