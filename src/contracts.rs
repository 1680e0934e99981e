/// Core data structures for node communication
///
/// An `Envelope` is the single unit exchanged between nodes. It is built once
/// by the sender and never mutated afterwards: replies and acknowledgments are
/// new envelopes that reference the original by id.
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application-defined envelope content
pub type Payload = Map<String, Value>;

/// Payload key carrying the id of the envelope being acknowledged
pub const ACK_FOR_KEY: &str = "ack_for";

/// Payload key a responder uses to echo the id of the request it answers
pub const REQUEST_ID_KEY: &str = "request_id";

/// Payload key selecting a custom dispatch sub-key for command envelopes
pub const COMMAND_KEY: &str = "command";

/// Message kinds, closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Response,
    Status,
    Emergency,
    Heartbeat,
    Data,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        Self::Command,
        Self::Response,
        Self::Status,
        Self::Emergency,
        Self::Heartbeat,
        Self::Data,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Status => "status",
            Self::Emergency => "emergency",
            Self::Heartbeat => "heartbeat",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Priority levels, ordered from `Low` to `Emergency`
///
/// Advisory only: the transport never reorders delivery by priority.
/// Carried on the wire as the integers 1 through 5.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
    Emergency = 5,
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            5 => Ok(Self::Emergency),
            other => Err(format!("unknown priority {}", other)),
        }
    }
}

/// Current wall clock time in seconds since the UNIX epoch
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Fresh random 128-bit identifier in hyphenated form
pub fn new_id() -> String {
    uuid::Builder::from_random_bytes(rand::random())
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// Build a payload from a JSON value
///
/// Objects are used as-is; any other value is stored under the `"value"` key.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// One unit of communication between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    kind: MessageKind,
    priority: Priority,
    source: String,
    destination: String,
    payload: Payload,
    timestamp: f64,
    ttl: Option<f64>,
    #[serde(default)]
    requires_ack: bool,
}

impl Envelope {
    /// Create an envelope with a fresh id, `Normal` priority and the current time
    pub fn new(
        kind: MessageKind,
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: new_id(),
            kind,
            priority: Priority::Normal,
            source: source.into(),
            destination: destination.into(),
            payload,
            timestamp: now_secs(),
            ttl: None,
            requires_ack: false,
        }
    }

    /// Reassemble an envelope from decoded wire fields
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        kind: MessageKind,
        priority: Priority,
        source: String,
        destination: String,
        payload: Payload,
        timestamp: f64,
        ttl: Option<f64>,
        requires_ack: bool,
    ) -> Self {
        Self {
            id,
            kind,
            priority,
            source,
            destination,
            payload,
            timestamp,
            ttl,
            requires_ack,
        }
    }

    /// Use a caller-chosen id (request ids generated ahead of sending)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Absolute expiry, seconds since the UNIX epoch
    ///
    /// Must be finite: `codec::encode` refuses NaN and infinities, which JSON
    /// cannot carry.
    pub fn with_ttl(mut self, expires_at: f64) -> Self {
        self.ttl = Some(expires_at);
        self
    }

    /// Expiry relative to the envelope timestamp
    pub fn with_ttl_in(mut self, lifetime: Duration) -> Self {
        self.ttl = Some(self.timestamp + lifetime.as_secs_f64());
        self
    }

    pub fn with_requires_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    /// RESPONSE addressed to the sender of `request`, echoing its id
    pub fn reply_to(request: &Envelope, source: impl Into<String>, mut payload: Payload) -> Self {
        payload
            .entry(REQUEST_ID_KEY)
            .or_insert_with(|| Value::String(request.id.clone()));
        Self::new(MessageKind::Response, source, request.source.clone(), payload)
    }

    /// Acknowledgment for a `requires_ack` envelope
    pub fn ack_for(request: &Envelope, source: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert(ACK_FOR_KEY.to_string(), Value::String(request.id.clone()));
        payload.insert("status".to_string(), Value::String("received".to_string()));
        Self::new(MessageKind::Response, source, request.source.clone(), payload)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn ttl(&self) -> Option<f64> {
        self.ttl
    }

    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    /// Id this envelope acknowledges, if it is an acknowledgment
    pub fn acknowledged_id(&self) -> Option<&str> {
        self.payload.get(ACK_FOR_KEY).and_then(Value::as_str)
    }

    /// Request id echoed by a responder
    pub fn echoed_request_id(&self) -> Option<&str> {
        self.payload.get(REQUEST_ID_KEY).and_then(Value::as_str)
    }

    /// Custom command name carried in the payload
    pub fn command(&self) -> Option<&str> {
        self.payload.get(COMMAND_KEY).and_then(Value::as_str)
    }

    /// Check if the envelope has expired at `now` (seconds since epoch)
    pub fn is_expired_at(&self, now: f64) -> bool {
        matches!(self.ttl, Some(expires_at) if now > expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_kind_names() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>(), Ok(kind));
        }
        assert!("alarm".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Critical < Priority::Emergency);
        assert_eq!(Priority::try_from(3u8), Ok(Priority::High));
        assert!(Priority::try_from(0u8).is_err());
        assert!(Priority::try_from(6u8).is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Envelope::new(MessageKind::Data, "a", "b", Payload::new());
        let b = Envelope::new(MessageKind::Data, "a", "b", Payload::new());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 36);
        assert!(Uuid::parse_str(a.id()).is_ok());
    }

    #[test]
    fn test_ttl_expiration() {
        let envelope = Envelope::new(MessageKind::Data, "a", "b", Payload::new()).with_ttl(1000.0);
        assert!(!envelope.is_expired_at(999.0));
        assert!(!envelope.is_expired_at(1000.0));
        assert!(envelope.is_expired_at(1000.5));

        let no_ttl = Envelope::new(MessageKind::Data, "a", "b", Payload::new());
        assert!(!no_ttl.is_expired_at(f64::MAX));
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let request = Envelope::new(
            MessageKind::Command,
            "sensor_node",
            "db_client",
            payload(json!({"command": "query_data"})),
        );
        let reply = Envelope::reply_to(&request, "db_client", payload(json!({"status": "success"})));

        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.destination(), "sensor_node");
        assert_eq!(reply.echoed_request_id(), Some(request.id()));
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn test_ack_payload() {
        let request = Envelope::new(MessageKind::Emergency, "a", "multiple", Payload::new())
            .with_requires_ack(true);
        let ack = Envelope::ack_for(&request, "b");

        assert_eq!(ack.acknowledged_id(), Some(request.id()));
        assert_eq!(ack.payload()["status"], json!("received"));
        assert!(!ack.requires_ack());
    }

    #[test]
    fn test_payload_helper() {
        assert_eq!(payload(json!({"k": 1}))["k"], json!(1));
        assert_eq!(payload(json!(7))["value"], json!(7));
        assert!(payload(Value::Null).is_empty());
    }
}
