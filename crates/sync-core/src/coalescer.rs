//! Per-root debouncing of raw filesystem changes into sync actions.
//!
//! Each watched root gets one coalescer task. The task owns the pending
//! table, so every transition for a path (new event, deadline reached, root
//! disabled) happens on a single task and cannot interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::action::{SyncAction, file_mode};
use crate::change::{ChangeEvent, ChangeKind};
use crate::events::{EventBus, SyncEvent, now_ms};
use crate::path::RelativePath;
use crate::protocol::MAX_PAYLOAD_SIZE;
use crate::registry::WatchedRoot;

/// Default quiescence window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);

/// What will be sent once a path goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    intent: Intent,
    deadline: Instant,
}

/// Handle to a running coalescer task.
pub struct CoalescerHandle {
    pub events: mpsc::UnboundedSender<ChangeEvent>,
    pub task: JoinHandle<()>,
}

/// Collapses bursts of changes on a path into one [`SyncAction`].
pub struct EventCoalescer {
    root: Arc<WatchedRoot>,
    window: Duration,
    pending: HashMap<RelativePath, Pending>,
    bus: Option<Arc<EventBus>>,
}

impl EventCoalescer {
    pub fn new(root: Arc<WatchedRoot>, window: Duration) -> Self {
        Self {
            root,
            window,
            pending: HashMap::new(),
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn root(&self) -> &Arc<WatchedRoot> {
        &self.root
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn intent(&self, path: &str) -> Option<Intent> {
        self.pending
            .iter()
            .find(|(p, _)| p.as_str() == path)
            .map(|(_, pending)| pending.intent)
    }

    /// Record one raw change. Moves are split into a delete of the source and
    /// a create of the destination, each filtered on its own.
    pub fn ingest(&mut self, event: ChangeEvent) {
        match (event.kind, event.from_path) {
            (ChangeKind::Moved, Some(from)) => {
                self.record(from, ChangeKind::Deleted);
                self.record(event.relative_path, ChangeKind::Created);
            }
            (ChangeKind::Moved, None) => self.record(event.relative_path, ChangeKind::Created),
            (kind, _) => self.record(event.relative_path, kind),
        }
    }

    fn record(&mut self, path: RelativePath, kind: ChangeKind) {
        if !self.root.should_sync_event(path.as_str(), kind) {
            trace!("Skipping {:?} on {}:{}", kind, self.root.name(), path);
            return;
        }

        let intent = match kind {
            ChangeKind::Deleted => Intent::Delete,
            _ => Intent::Put,
        };
        let deadline = Instant::now() + self.window;
        trace!("Pending {:?} on {}:{}", intent, self.root.name(), path);
        self.pending.insert(path, Pending { intent, deadline });
    }

    /// Earliest deadline in the pending table.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove every entry whose deadline has passed, in deadline order.
    pub fn take_due(&mut self, now: Instant) -> Vec<(RelativePath, Intent)> {
        let mut due: Vec<(RelativePath, Pending)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(path, p)| (path.clone(), *p))
            .collect();
        for (path, _) in &due {
            self.pending.remove(path);
        }
        due.sort_by_key(|(_, p)| p.deadline);
        due.into_iter().map(|(path, p)| (path, p.intent)).collect()
    }

    /// Remove every entry regardless of deadline.
    pub fn take_all(&mut self) -> Vec<(RelativePath, Intent)> {
        let mut all: Vec<(RelativePath, Pending)> = self.pending.drain().collect();
        all.sort_by_key(|(_, p)| p.deadline);
        all.into_iter().map(|(path, p)| (path, p.intent)).collect()
    }

    /// Drop all pending entries without emitting. Returns how many were dropped.
    pub fn cancel_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!("Cancelled {} pending actions for {}", count, self.root.name());
            self.publish(SyncEvent::PendingCancelled {
                root: self.root.name().to_string(),
                count,
                timestamp: now_ms(),
            });
        }
        count
    }

    /// Turn a due entry into an action. File contents are read now, not when
    /// the change was observed.
    pub async fn finalize(&self, path: RelativePath, intent: Intent) -> Option<SyncAction> {
        let remote_path = match path.under(self.root.remote_path()) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Cannot map {}:{} to a remote path: {}", self.root.name(), path, e);
                return None;
            }
        };

        let action = match intent {
            Intent::Delete => SyncAction::delete(self.root.name(), path, remote_path),
            Intent::Put => {
                let full_path = self.root.local_path().join(path.as_str());
                match tokio::fs::metadata(&full_path).await {
                    Ok(meta) if meta.is_dir() => {
                        trace!("Dropping directory {}:{}", self.root.name(), path);
                        return None;
                    }
                    Ok(meta) if meta.len() > MAX_PAYLOAD_SIZE as u64 => {
                        warn!(
                            "Skipping {}:{} ({} bytes exceeds the {} byte limit)",
                            self.root.name(),
                            path,
                            meta.len(),
                            MAX_PAYLOAD_SIZE
                        );
                        return None;
                    }
                    Ok(meta) => match tokio::fs::read(&full_path).await {
                        Ok(payload) => SyncAction::put(
                            self.root.name(),
                            path,
                            remote_path,
                            payload,
                            file_mode(&meta),
                        ),
                        Err(e) => {
                            debug!("{}:{} unreadable ({}), sending delete", self.root.name(), path, e);
                            SyncAction::delete(self.root.name(), path, remote_path)
                        }
                    },
                    Err(_) => {
                        debug!("{}:{} vanished, sending delete", self.root.name(), path);
                        SyncAction::delete(self.root.name(), path, remote_path)
                    }
                }
            }
        };

        self.publish(SyncEvent::ActionFinalized {
            root: action.root.clone(),
            path: action.relative_path.to_string(),
            operation: action.op.name().to_string(),
            timestamp: now_ms(),
        });
        Some(action)
    }

    fn publish(&self, event: SyncEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }

    /// Run until the event channel closes or the action receiver goes away.
    /// Remaining entries are flushed when the event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        actions: mpsc::Sender<SyncAction>,
    ) {
        let mut enabled = self.root.subscribe_enabled();

        loop {
            let next_deadline = self.next_deadline();

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.ingest(event),
                    None => {
                        let remaining = self.take_all();
                        self.emit(remaining, &actions).await;
                        break;
                    }
                },

                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    let due = self.take_due(Instant::now());
                    if !self.emit(due, &actions).await {
                        break;
                    }
                }

                Ok(()) = enabled.changed() => {
                    if !*enabled.borrow_and_update() {
                        self.cancel_pending();
                    }
                }
            }
        }

        debug!("Coalescer for {} stopped", self.root.name());
    }

    async fn emit(&self, due: Vec<(RelativePath, Intent)>, actions: &mpsc::Sender<SyncAction>) -> bool {
        for (path, intent) in due {
            let Some(action) = self.finalize(path, intent).await else {
                continue;
            };
            if actions.send(action).await.is_err() {
                debug!("Action receiver closed for {}", self.root.name());
                return false;
            }
        }
        true
    }
}

/// Start a coalescer task for `root` that forwards actions to `actions`.
pub fn spawn(
    root: Arc<WatchedRoot>,
    window: Duration,
    bus: Option<Arc<EventBus>>,
    actions: mpsc::Sender<SyncAction>,
) -> CoalescerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut coalescer = EventCoalescer::new(root, window);
    if let Some(bus) = bus {
        coalescer = coalescer.with_event_bus(bus);
    }
    let task = tokio::spawn(coalescer.run(rx, actions));
    CoalescerHandle { events: tx, task }
}
