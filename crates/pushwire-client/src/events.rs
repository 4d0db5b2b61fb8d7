//! Event subscriber lists.
//!
//! Each event kind keeps its own list. Handlers are snapshotted before
//! invocation, so a handler may subscribe or unsubscribe without deadlocking.
//! Invocation order across subscribers of one kind is unspecified.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use pushwire_core::StateChange;

use crate::error::ClientError;

/// Identifies one subscription, for [`crate::Connection::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handler for received payloads. An `Err` becomes an error event.
pub type ReceivedHandler = dyn Fn(&str) -> anyhow::Result<()> + Send + Sync;
pub type ErrorHandler = dyn Fn(&ClientError) + Send + Sync;
pub type StateChangedHandler = dyn Fn(&StateChange) + Send + Sync;
/// Handler for events without a payload.
pub type SignalHandler = dyn Fn() + Send + Sync;

pub(crate) struct Subscribers<H: ?Sized> {
    entries: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
}

impl<H: ?Sized> Subscribers<H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.write().push((id, handler));
        id
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.entries
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Subscribers<SignalHandler> {
    pub fn emit(&self) {
        for handler in self.snapshot() {
            handler();
        }
    }
}

impl Subscribers<ErrorHandler> {
    pub fn emit(&self, error: &ClientError) {
        for handler in self.snapshot() {
            handler(error);
        }
    }
}

impl Subscribers<StateChangedHandler> {
    pub fn emit(&self, change: &StateChange) {
        for handler in self.snapshot() {
            handler(change);
        }
    }
}

/// All event lists of a connection.
pub(crate) struct Events {
    pub received: Subscribers<ReceivedHandler>,
    pub error: Subscribers<ErrorHandler>,
    pub closed: Subscribers<SignalHandler>,
    pub reconnecting: Subscribers<SignalHandler>,
    pub reconnected: Subscribers<SignalHandler>,
    pub state_changed: Subscribers<StateChangedHandler>,
    pub connection_slow: Subscribers<SignalHandler>,
}

impl Events {
    pub fn new() -> Self {
        Self {
            received: Subscribers::new(),
            error: Subscribers::new(),
            closed: Subscribers::new(),
            reconnecting: Subscribers::new(),
            reconnected: Subscribers::new(),
            state_changed: Subscribers::new(),
            connection_slow: Subscribers::new(),
        }
    }

    /// Remove `id` from whichever list holds it.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.received.remove(id)
            || self.error.remove(id)
            || self.closed.remove(id)
            || self.reconnecting.remove(id)
            || self.reconnected.remove(id)
            || self.state_changed.remove(id)
            || self.connection_slow.remove(id)
    }
}
