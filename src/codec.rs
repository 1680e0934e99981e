/// Codec module - envelope wire format
///
/// Envelopes travel as one UTF-8 JSON object per datagram. Decoding is
/// tolerant of unknown extra fields and strict about required fields and
/// enum values.
use serde::Deserialize;
use serde_json::Value;

use crate::contracts::{Envelope, MessageKind, Payload, Priority};
use crate::errors::{DecodeError, SendError};

/// Loose view of the wire object
///
/// Every field is optional so that absence can be reported by name instead
/// of as a generic serde error.
#[derive(Deserialize)]
struct WireEnvelope {
    id: Option<String>,
    kind: Option<Value>,
    priority: Option<Value>,
    source: Option<String>,
    destination: Option<String>,
    payload: Option<Payload>,
    timestamp: Option<f64>,
    #[serde(default)]
    ttl: Option<f64>,
    #[serde(default)]
    requires_ack: Option<bool>,
}

/// Serialize an envelope to wire bytes
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, SendError> {
    // serde_json writes NaN and infinities as null, which would silently
    // drop an expiry.
    if !envelope.timestamp().is_finite() {
        return Err(SendError::Encode(format!("non-finite timestamp {}", envelope.timestamp())));
    }
    if let Some(ttl) = envelope.ttl().filter(|ttl| !ttl.is_finite()) {
        return Err(SendError::Encode(format!("non-finite ttl {}", ttl)));
    }
    serde_json::to_vec(envelope).map_err(|e| SendError::Encode(e.to_string()))
}

/// Parse wire bytes into an envelope
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let id = required(wire.id, "id")?;
    let kind = parse_kind(required(wire.kind, "kind")?)?;
    let priority = parse_priority(required(wire.priority, "priority")?)?;
    let source = required(wire.source, "source")?;
    let destination = required(wire.destination, "destination")?;
    let payload = required(wire.payload, "payload")?;
    let timestamp = required(wire.timestamp, "timestamp")?;

    Ok(Envelope::from_parts(
        id,
        kind,
        priority,
        source,
        destination,
        payload,
        timestamp,
        wire.ttl,
        wire.requires_ack.unwrap_or(false),
    ))
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, DecodeError> {
    value.ok_or(DecodeError::MissingField(field))
}

fn parse_kind(value: Value) -> Result<MessageKind, DecodeError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DecodeError::InvalidEnum {
            field: "kind",
            value: value.to_string(),
        })
}

/// Accepts integers and whole-number floats (`2.0`), since senders may not
/// keep the distinction
fn parse_priority(value: Value) -> Result<Priority, DecodeError> {
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|n| n.fract() == 0.0 && (0.0..=f64::from(u8::MAX)).contains(n))
                .map(|n| n as u64)
        })
        .and_then(|n| u8::try_from(n).ok())
        .and_then(|n| Priority::try_from(n).ok())
        .ok_or_else(|| DecodeError::InvalidEnum {
            field: "priority",
            value: value.to_string(),
        })
}
