//! Transfer status summary fed from the event bus.
//!
//! The daemon logs individual failures as they happen; this keeps the
//! aggregate view (which paths are currently failing, and counters) so it
//! can be reported periodically and at shutdown.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use sync_core::{EventBus, Subscription, SyncEvent};

/// Failing paths listed individually in a report.
const MAX_LISTED_FAILURES: usize = 10;

/// Counters and failing paths at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub superseded: u64,
    pub cancelled: u64,
    /// `root:path` → last error, for paths whose latest transfer failed
    pub failing: BTreeMap<String, String>,
}

impl StatusSnapshot {
    fn record(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::TransferSucceeded { root, path, .. } => {
                self.sent += 1;
                self.failing.remove(&format!("{}:{}", root, path));
            }
            SyncEvent::TransferFailed {
                root, path, error, ..
            } => {
                self.failed += 1;
                self.failing.insert(format!("{}:{}", root, path), error.clone());
            }
            SyncEvent::ActionSuperseded { .. } => self.superseded += 1,
            SyncEvent::PendingCancelled { count, .. } => self.cancelled += *count as u64,
            SyncEvent::ActionFinalized { .. } => {}
        }
    }

    /// Write the summary to the log.
    pub fn log(&self) {
        info!(
            "Transfers: {} sent, {} failed, {} superseded, {} cancelled",
            self.sent, self.failed, self.superseded, self.cancelled
        );
        if self.failing.is_empty() {
            return;
        }

        warn!("{} path(s) out of sync", self.failing.len());
        for (path, error) in self.failing.iter().take(MAX_LISTED_FAILURES) {
            warn!("  {}: {}", path, error);
        }
        if self.failing.len() > MAX_LISTED_FAILURES {
            warn!("  ... and {} more", self.failing.len() - MAX_LISTED_FAILURES);
        }
    }
}

#[derive(Default)]
struct Shared {
    snapshot: StatusSnapshot,
    changed: bool,
}

/// Subscribes to an [`EventBus`] and accumulates a [`StatusSnapshot`].
pub struct StatusTracker {
    shared: Arc<Mutex<Shared>>,
    _subscription: Subscription,
}

impl StatusTracker {
    pub fn attach(bus: &Arc<EventBus>) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let listener_shared = Arc::clone(&shared);
        let subscription = bus.subscribe(move |event| {
            let mut shared = listener_shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.snapshot.record(event);
            shared.changed = true;
        });

        Self {
            shared,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().snapshot.clone()
    }

    /// The current snapshot if anything happened since the last call.
    pub fn take_changed(&self) -> Option<StatusSnapshot> {
        let mut shared = self.lock();
        if !shared.changed {
            return None;
        }
        shared.changed = false;
        Some(shared.snapshot.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
