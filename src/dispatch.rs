/// Dispatch module - routes inbound envelopes to handlers
///
/// Handlers are looked up by `DispatchKey`: the envelope kind, or a custom
/// sub-key named by the payload's `"command"` field. Registration replaces
/// any previous handler atomically; a dispatch already in flight keeps the
/// handler it looked up.
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::contracts::{Envelope, MessageKind};
use crate::errors::HandlerError;

/// Handler invoked with a context (the node), the envelope and its sender
pub type Handler<C> =
    Arc<dyn Fn(&C, &Envelope, SocketAddr) -> Result<(), HandlerError> + Send + Sync>;

/// Lookup key for a handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Kind(MessageKind),
    Custom(String),
}

impl From<MessageKind> for DispatchKey {
    fn from(kind: MessageKind) -> Self {
        Self::Kind(kind)
    }
}

impl From<&str> for DispatchKey {
    /// Kind names map to `Kind`, so `"response"` and `MessageKind::Response`
    /// address the same handler.
    fn from(key: &str) -> Self {
        match key.parse::<MessageKind>() {
            Ok(kind) => Self::Kind(kind),
            Err(_) => Self::Custom(key.to_string()),
        }
    }
}

impl From<String> for DispatchKey {
    fn from(key: String) -> Self {
        Self::from(key.as_str())
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => f.write_str(kind.as_str()),
            Self::Custom(key) => f.write_str(key),
        }
    }
}

/// What happened to a dispatched envelope
#[derive(Debug)]
pub enum DispatchOutcome {
    Handled(DispatchKey),
    NoHandler(DispatchKey),
    Failed(DispatchKey, HandlerError),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }
}

pub struct DispatchTable<C> {
    handlers: RwLock<HashMap<DispatchKey, Handler<C>>>,
}

impl<C> DispatchTable<C> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for `key`
    pub fn register<F>(&self, key: impl Into<DispatchKey>, handler: F)
    where
        F: Fn(&C, &Envelope, SocketAddr) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_arc(key.into(), Arc::new(handler));
    }

    pub fn register_arc(&self, key: DispatchKey, handler: Handler<C>) {
        let previous = self.write().insert(key.clone(), handler);
        debug!(%key, replaced = previous.is_some(), "handler registered");
    }

    pub fn unregister(&self, key: impl Into<DispatchKey>) -> Option<Handler<C>> {
        self.write().remove(&key.into())
    }

    pub fn get(&self, key: &DispatchKey) -> Option<Handler<C>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: impl Into<DispatchKey>) -> bool {
        self.read().contains_key(&key.into())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Key an envelope dispatches under
    ///
    /// A payload `"command"` wins when a handler is registered for it;
    /// otherwise the envelope kind is used.
    pub fn resolve_key(&self, envelope: &Envelope) -> DispatchKey {
        if let Some(command) = envelope.command() {
            let custom = DispatchKey::from(command);
            if matches!(custom, DispatchKey::Custom(_)) && self.read().contains_key(&custom) {
                return custom;
            }
        }
        DispatchKey::Kind(envelope.kind())
    }

    /// Route an envelope to its handler
    pub fn dispatch(&self, ctx: &C, envelope: &Envelope, from: SocketAddr) -> DispatchOutcome {
        let key = self.resolve_key(envelope);
        self.dispatch_to(key, ctx, envelope, from)
    }

    /// Invoke the handler registered for `key`
    ///
    /// Handler errors and panics are contained here and reported in the
    /// outcome; they never reach the caller as a panic.
    pub fn dispatch_to(
        &self,
        key: DispatchKey,
        ctx: &C,
        envelope: &Envelope,
        from: SocketAddr,
    ) -> DispatchOutcome {
        // Clone the Arc so the lock is not held while the handler runs.
        let Some(handler) = self.get(&key) else {
            debug!(%key, id = %envelope.id(), source = envelope.source(), "no handler");
            return DispatchOutcome::NoHandler(key);
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, envelope, from)))
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => DispatchOutcome::Handled(key),
            Err(err) => {
                error!(%key, id = %envelope.id(), source = envelope.source(), error = %err, "handler failed");
                DispatchOutcome::Failed(key, err)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DispatchKey, Handler<C>>> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<DispatchKey, Handler<C>>> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{payload, Payload};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    fn addr() -> SocketAddr {
        "127.0.0.1:14551".parse().unwrap()
    }

    fn envelope(kind: MessageKind) -> Envelope {
        Envelope::new(kind, "peer", "me", Payload::new())
    }

    #[test]
    fn test_key_normalisation() {
        assert_eq!(DispatchKey::from("response"), DispatchKey::Kind(MessageKind::Response));
        assert_eq!(DispatchKey::from("ack"), DispatchKey::Custom("ack".into()));
        assert_eq!(DispatchKey::from(MessageKind::Data).to_string(), "data");
    }

    #[test]
    fn test_unregistered_key_is_noop() {
        let table: DispatchTable<()> = DispatchTable::new();
        let outcome = table.dispatch(&(), &envelope(MessageKind::Data), addr());
        assert!(matches!(outcome, DispatchOutcome::NoHandler(DispatchKey::Kind(MessageKind::Data))));
    }

    #[test]
    fn test_register_overwrites() {
        let table: DispatchTable<Mutex<Vec<&'static str>>> = DispatchTable::new();
        table.register(MessageKind::Data, |log: &Mutex<Vec<&'static str>>, _: &Envelope, _| {
            log.lock().unwrap().push("first");
            Ok(())
        });
        table.register("data", |log: &Mutex<Vec<&'static str>>, _: &Envelope, _| {
            log.lock().unwrap().push("second");
            Ok(())
        });

        let log = Mutex::new(Vec::new());
        assert!(table.dispatch(&log, &envelope(MessageKind::Data), addr()).is_handled());
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_command_subkey() {
        let table: DispatchTable<AtomicUsize> = DispatchTable::new();
        table.register("increment", |count: &AtomicUsize, _: &Envelope, _| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let count = AtomicUsize::new(0);
        let cmd = Envelope::new(
            MessageKind::Command,
            "peer",
            "me",
            payload(json!({"command": "increment"})),
        );
        let outcome = table.dispatch(&count, &cmd, addr());
        assert!(matches!(outcome, DispatchOutcome::Handled(DispatchKey::Custom(ref k)) if k == "increment"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Unregistered command falls back to the kind key.
        let other = Envelope::new(
            MessageKind::Command,
            "peer",
            "me",
            payload(json!({"command": "reset"})),
        );
        assert_eq!(table.resolve_key(&other), DispatchKey::Kind(MessageKind::Command));
    }

    #[test]
    fn test_handler_failures_contained() {
        let table: DispatchTable<()> = DispatchTable::new();
        table.register(MessageKind::Data, |_: &(), _: &Envelope, _| Err(HandlerError::failed("boom")));
        table.register(MessageKind::Status, |_: &(), _: &Envelope, _| panic!("handler bug"));

        match table.dispatch(&(), &envelope(MessageKind::Data), addr()) {
            DispatchOutcome::Failed(_, HandlerError::Failed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome {:?}", other),
        }
        match table.dispatch(&(), &envelope(MessageKind::Status), addr()) {
            DispatchOutcome::Failed(_, HandlerError::Panicked(msg)) => assert_eq!(msg, "handler bug"),
            other => panic!("unexpected outcome {:?}", other),
        }
        // Table still usable after a panic.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_concurrent_registration_no_crosstalk() {
        let table: Arc<DispatchTable<Mutex<Vec<String>>>> = Arc::new(DispatchTable::new());

        let workers: Vec<_> = [("alpha", MessageKind::Data), ("beta", MessageKind::Status)]
            .into_iter()
            .map(|(name, kind)| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..500 {
                        table.register(kind, move |log: &Mutex<Vec<String>>, _: &Envelope, _| {
                            log.lock().unwrap().push(name.to_string());
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let log = Mutex::new(Vec::new());
        table.dispatch(&log, &envelope(MessageKind::Data), addr());
        table.dispatch(&log, &envelope(MessageKind::Status), addr());
        assert_eq!(*log.lock().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    }
}
