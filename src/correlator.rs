/// Query correlator - request/response matching over fire-and-forget UDP
///
/// Every outstanding query lives in an explicit table keyed by its request
/// id. Responders echo that id as `payload.request_id`, which makes any
/// number of concurrent queries to the same peer distinguishable.
///
/// Responders that do not echo the id are still served: a RESPONSE without
/// `request_id` completes the oldest query waiting on its source. Two such
/// queries in flight to the same peer can then be completed in the wrong
/// order, since nothing on the wire tells them apart.
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::contracts::{Envelope, MessageKind, Payload, COMMAND_KEY};

/// Single-shot completion for a query
pub type QueryCallback = Box<dyn FnOnce(Envelope) + Send + 'static>;

struct PendingQuery {
    responder: String,
    callback: QueryCallback,
    created_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct QueryTable {
    entries: HashMap<String, PendingQuery>,
    next_seq: u64,
}

impl QueryTable {
    /// Find the entry a response completes, if any
    fn match_response(&self, response: &Envelope) -> Option<String> {
        match response.echoed_request_id() {
            Some(request_id) => self
                .entries
                .get(request_id)
                .filter(|entry| entry.responder == response.source())
                .map(|_| request_id.to_string()),
            None => self
                .entries
                .iter()
                .filter(|(_, entry)| entry.responder == response.source())
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone()),
        }
    }
}

#[derive(Default)]
pub struct QueryCorrelator {
    table: Mutex<QueryTable>,
}

impl QueryCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a response from `responder` to request `request_id`
    pub fn register<F>(&self, request_id: impl Into<String>, responder: impl Into<String>, on_result: F)
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        let request_id = request_id.into();
        let responder = responder.into();
        let mut table = self.table();
        let seq = table.next_seq;
        table.next_seq += 1;
        debug!(%request_id, %responder, "query pending");
        table.entries.insert(
            request_id,
            PendingQuery {
                responder,
                callback: Box::new(on_result),
                created_at: Instant::now(),
                seq,
            },
        );
    }

    /// Like `register`, delivering the response through a `QueryTicket`
    pub fn register_ticket(&self, request_id: impl Into<String>, responder: impl Into<String>) -> QueryTicket {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        self.register(request_id.clone(), responder, move |response| {
            // The ticket may have been dropped; nobody is waiting then.
            let _ = tx.send(response);
        });
        QueryTicket {
            request_id,
            receiver: rx,
        }
    }

    /// Complete the query a RESPONSE belongs to
    ///
    /// Returns true when the response was consumed. The callback runs after
    /// the table lock is released, so it may issue new queries.
    pub fn resolve(&self, response: &Envelope) -> bool {
        if response.kind() != MessageKind::Response || response.acknowledged_id().is_some() {
            return false;
        }

        let entry = {
            let mut table = self.table();
            table
                .match_response(response)
                .and_then(|request_id| table.entries.remove(&request_id).map(|entry| (request_id, entry)))
        };
        let Some((request_id, entry)) = entry else {
            return false;
        };

        debug!(%request_id, responder = %entry.responder, elapsed = ?entry.created_at.elapsed(), "query completed");
        let callback = entry.callback;
        let response = response.clone();
        if panic::catch_unwind(AssertUnwindSafe(move || callback(response))).is_err() {
            error!(%request_id, "query callback panicked");
        }
        true
    }

    /// Forget a pending query; its callback is never invoked
    pub fn cancel(&self, request_id: &str) -> bool {
        self.table().entries.remove(request_id).is_some()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.table().entries.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Drop queries older than `max_age`, returning their request ids
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let mut table = self.table();
        let expired: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            table.entries.remove(id);
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), ?max_age, "dropping unanswered queries");
        }
        expired
    }

    fn table(&self) -> MutexGuard<'_, QueryTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Record query addressed to the data-service node
///
/// Serializes to `{command: "query_data", collection, query, limit, skip,
/// sort?}` where `sort` is a list of `[field, direction]` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct DataQuery {
    pub collection: String,
    pub filter: Payload,
    pub sort: Vec<(String, i32)>,
    pub limit: u64,
    pub skip: u64,
}

impl DataQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Payload::new(),
            sort: Vec::new(),
            limit: 100,
            skip: 0,
        }
    }

    pub fn filter(mut self, filter: Payload) -> Self {
        self.filter = filter;
        self
    }

    /// Add a sort key; direction is 1 for ascending, -1 for descending
    pub fn sort_by(mut self, field: impl Into<String>, direction: i32) -> Self {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn to_payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(COMMAND_KEY.to_string(), json!("query_data"));
        payload.insert("collection".to_string(), json!(self.collection));
        payload.insert("query".to_string(), Value::Object(self.filter.clone()));
        payload.insert("limit".to_string(), json!(self.limit));
        payload.insert("skip".to_string(), json!(self.skip));
        if !self.sort.is_empty() {
            payload.insert("sort".to_string(), json!(self.sort));
        }
        payload
    }
}

/// Awaitable handle to a query's response
#[derive(Debug)]
pub struct QueryTicket {
    request_id: String,
    receiver: oneshot::Receiver<Envelope>,
}

impl QueryTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response
    ///
    /// Yields `None` if the query was cancelled or expired.
    pub async fn recv(self) -> Option<Envelope> {
        self.receiver.await.ok()
    }

    /// Blocking variant of `recv`, for use outside an async runtime
    pub fn blocking_recv(self) -> Option<Envelope> {
        self.receiver.blocking_recv().ok()
    }

    /// Take the response if it has already arrived
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }
}
