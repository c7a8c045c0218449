//! Status events published by the coalescers and the dispatcher.
//!
//! Per-path outcomes are logged where they happen and also published here;
//! the daemon's status tracker subscribes to keep a failing-path summary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Events emitted while turning changes into transfers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The coalescer finalized an action for a path.
    ActionFinalized {
        root: String,
        path: String,
        /// "put" or "delete"
        operation: String,
        timestamp: u64,
    },
    /// A queued action was replaced by a newer one before it was sent.
    ActionSuperseded {
        root: String,
        path: String,
        timestamp: u64,
    },
    /// Pending actions dropped because their root was disabled.
    PendingCancelled {
        root: String,
        count: usize,
        timestamp: u64,
    },
    /// The server acknowledged a transfer.
    TransferSucceeded {
        root: String,
        path: String,
        operation: String,
        timestamp: u64,
    },
    /// A transfer failed permanently or exhausted its retries.
    TransferFailed {
        root: String,
        path: String,
        operation: String,
        error: String,
        timestamp: u64,
    },
}

/// Milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Receives every published event.
type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of [`SyncEvent`]s to listeners. Shared as `Arc<EventBus>`.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` until the returned [`Subscription`] is dropped.
    pub fn subscribe(self: &Arc<Self>, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every listener in subscription order.
    pub fn emit(&self, event: SyncEvent) {
        // Listeners run without the lock held, so they may subscribe or unsubscribe
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for listener in &listeners {
            listener(&event);
        }
    }
}

/// Keeps a listener registered; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}
