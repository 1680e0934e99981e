/// Error types for node communication
///
/// Each failure domain gets its own enum so callers can tell a malformed
/// datagram from a failed send or a broken handler. `NodeError` wraps all of
/// them for APIs that can fail in more than one way.
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for node communication operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Wire data could not be turned into an `Envelope`
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not UTF-8 JSON, not an object, or a field has the wrong JSON type
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// A required field is absent or null
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// `kind` or `priority` holds a value outside the closed set
    #[error("invalid value {value} for field `{field}`")]
    InvalidEnum { field: &'static str, value: String },
}

/// An outbound envelope could not be transmitted
#[derive(Debug, Error)]
pub enum SendError {
    /// Serialization of the envelope failed
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// Encoded envelope does not fit in one datagram
    #[error("envelope too large: {size} bytes exceeds datagram limit of {max}")]
    TooLarge { size: usize, max: usize },

    /// Socket level failure (unreachable destination, closed socket, ...)
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Peer name has no entry in the known-node table
    #[error("no address known for node `{0}`")]
    UnknownPeer(String),
}

/// A registered handler failed while processing an envelope
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("reply failed: {0}")]
    Send(#[from] SendError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// The node could not acquire its local endpoint
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure socket: {0}")]
    Socket(#[from] io::Error),

    #[error("receive loop already running")]
    AlreadyReceiving,
}

/// A query could not be issued
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no address known for node `{0}`")]
    UnknownPeer(String),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Umbrella error for operations that cross failure domains
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
