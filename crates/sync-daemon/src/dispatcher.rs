//! Routes finalized actions to the transfer client.
//!
//! At most one transfer per (root, path) is in flight. An action for a busy
//! path waits in a one-slot queue, and a newer action replaces the waiting
//! one. Different paths proceed concurrently, each on its own task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sync_core::events::now_ms;
use sync_core::{ActionKey, EventBus, SyncAction, SyncEvent};

use crate::client::Transfer;

pub struct Dispatcher<T: Transfer> {
    transfer: Arc<T>,
    bus: Option<Arc<EventBus>>,
    in_flight: HashSet<ActionKey>,
    queued: HashMap<ActionKey, SyncAction>,
}

impl<T: Transfer> Dispatcher<T> {
    pub fn new(transfer: Arc<T>) -> Self {
        Self {
            transfer,
            bus: None,
            in_flight: HashSet::new(),
            queued: HashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Process actions until the channel closes and every transfer has finished.
    pub async fn run(mut self, mut actions: mpsc::Receiver<SyncAction>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ActionKey>();
        let mut open = true;

        loop {
            tokio::select! {
                // New actions first so a waiting action can be replaced before its slot frees up
                biased;

                action = actions.recv(), if open => match action {
                    Some(action) => self.submit(action, &done_tx),
                    None => open = false,
                },

                Some(key) = done_rx.recv() => self.complete(key, &done_tx),
            }

            if !open && self.in_flight.is_empty() {
                break;
            }
        }

        debug!("Dispatcher stopped");
    }

    fn submit(&mut self, action: SyncAction, done_tx: &mpsc::UnboundedSender<ActionKey>) {
        let key = action.key();
        if !self.in_flight.contains(&key) {
            self.start(action, done_tx);
            return;
        }

        debug!("{} busy, queueing {}", key, action.op.name());
        if self.queued.insert(key.clone(), action).is_some() {
            self.publish(SyncEvent::ActionSuperseded {
                root: key.root.clone(),
                path: key.path.to_string(),
                timestamp: now_ms(),
            });
        }
    }

    fn complete(&mut self, key: ActionKey, done_tx: &mpsc::UnboundedSender<ActionKey>) {
        self.in_flight.remove(&key);
        if let Some(next) = self.queued.remove(&key) {
            self.start(next, done_tx);
        }
    }

    fn start(&mut self, action: SyncAction, done_tx: &mpsc::UnboundedSender<ActionKey>) {
        let key = action.key();
        self.in_flight.insert(key.clone());

        let transfer = Arc::clone(&self.transfer);
        let bus = self.bus.clone();
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let operation = action.op.name().to_string();
            let event = match transfer.send(&action).await {
                Ok(_) => {
                    info!("Synced {} {}", operation, key);
                    SyncEvent::TransferSucceeded {
                        root: key.root.clone(),
                        path: key.path.to_string(),
                        operation,
                        timestamp: now_ms(),
                    }
                }
                Err(e) => {
                    warn!("Failed to {} {}: {}", operation, key, e);
                    SyncEvent::TransferFailed {
                        root: key.root.clone(),
                        path: key.path.to_string(),
                        operation,
                        error: e.to_string(),
                        timestamp: now_ms(),
                    }
                }
            };
            if let Some(bus) = bus {
                bus.emit(event);
            }
            let _ = done_tx.send(key);
        });
    }

    fn publish(&self, event: SyncEvent) {
        if let Some(bus) = &self.bus {
            bus.emit(event);
        }
    }
}

/// Start a dispatcher task. Returns the sender that coalescers feed.
pub fn spawn<T: Transfer>(
    transfer: Arc<T>,
    bus: Option<Arc<EventBus>>,
    capacity: usize,
) -> (mpsc::Sender<SyncAction>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let mut dispatcher = Dispatcher::new(transfer);
    if let Some(bus) = bus {
        dispatcher = dispatcher.with_event_bus(bus);
    }
    (tx, tokio::spawn(dispatcher.run(rx)))
}
