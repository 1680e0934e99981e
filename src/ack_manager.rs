/// ACK Manager module - acknowledgment bookkeeping
///
/// Records outbound envelopes sent with `requires_ack` and resolves them when
/// the matching RESPONSE arrives. Nothing is ever retransmitted. Entries stay
/// until resolved, unless the owner opts into `sweep_expired`.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::contracts::{Envelope, MessageKind};

struct PendingAck {
    envelope: Envelope,
    sent_at: Instant,
}

/// A resolved acknowledgment
#[derive(Debug, Clone)]
pub struct AckRecord {
    /// The outbound envelope that was acknowledged
    pub envelope: Envelope,

    /// Always true for a resolved record
    pub acknowledged: bool,

    /// Time between recording the send and receiving the ACK
    pub rtt: Duration,
}

/// Outcome of offering an inbound envelope to the manager
#[derive(Debug)]
pub enum AckResolution {
    /// Not an acknowledgment; continue with normal processing
    NotAck,

    /// Matched a pending entry, which has been removed
    Resolved(AckRecord),

    /// Carries `ack_for` but nothing is pending under that id, e.g. the
    /// second reply to an emergency multicast
    Unmatched(String),
}

impl AckResolution {
    /// Whether the envelope was consumed as an acknowledgment
    pub fn is_ack(&self) -> bool {
        !matches!(self, Self::NotAck)
    }
}

#[derive(Default)]
pub struct AckManager {
    pending: Mutex<HashMap<String, PendingAck>>,
}

impl AckManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound envelope as awaiting acknowledgment
    ///
    /// Returns false if the id was already pending; the original send time
    /// is kept in that case.
    pub fn mark_pending(&self, envelope: &Envelope) -> bool {
        let mut pending = self.pending();
        if pending.contains_key(envelope.id()) {
            return false;
        }
        pending.insert(
            envelope.id().to_string(),
            PendingAck {
                envelope: envelope.clone(),
                sent_at: Instant::now(),
            },
        );
        debug!(id = %envelope.id(), destination = envelope.destination(), "awaiting ack");
        true
    }

    /// Stop waiting for `id` without resolving it
    pub fn forget(&self, id: &str) -> bool {
        self.pending().remove(id).is_some()
    }

    /// Try to resolve a pending entry with an inbound envelope
    ///
    /// Only RESPONSE envelopes qualify. A match is either the envelope's own
    /// id or the id named by its `ack_for` payload field.
    pub fn resolve(&self, response: &Envelope) -> AckResolution {
        if response.kind() != MessageKind::Response {
            return AckResolution::NotAck;
        }

        let mut pending = self.pending();
        let matched = pending
            .remove(response.id())
            .or_else(|| response.acknowledged_id().and_then(|id| pending.remove(id)));

        match (matched, response.acknowledged_id()) {
            (Some(entry), _) => {
                let rtt = entry.sent_at.elapsed();
                debug!(id = %entry.envelope.id(), from = response.source(), ?rtt, "ack received");
                AckResolution::Resolved(AckRecord {
                    envelope: entry.envelope,
                    acknowledged: true,
                    rtt,
                })
            }
            (None, Some(ack_for)) => AckResolution::Unmatched(ack_for.to_string()),
            (None, None) => AckResolution::NotAck,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending().keys().cloned().collect()
    }

    /// Drop entries recorded more than `max_age` ago
    ///
    /// Returns the envelopes that were never acknowledged.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<Envelope> {
        let mut pending = self.pending();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.sent_at.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let dropped: Vec<Envelope> = expired
            .iter()
            .filter_map(|id| pending.remove(id))
            .map(|entry| entry.envelope)
            .collect();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), ?max_age, "dropping unacknowledged envelopes");
        }
        dropped
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingAck>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
