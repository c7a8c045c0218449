//! Raw filesystem changes as delivered by a watch source.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::path::RelativePath;
use crate::registry::WatchedRoot;

/// Type of change observed on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// `relative_path` is the destination, `from_path` the source
    Moved,
}

/// One notification from the watch source. Consumed by the coalescer.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub root: Arc<WatchedRoot>,
    pub relative_path: RelativePath,
    pub kind: ChangeKind,
    pub observed_at: Instant,
    pub from_path: Option<RelativePath>,
}

impl ChangeEvent {
    pub fn new(root: Arc<WatchedRoot>, relative_path: RelativePath, kind: ChangeKind) -> Self {
        Self {
            root,
            relative_path,
            kind,
            observed_at: Instant::now(),
            from_path: None,
        }
    }

    pub fn moved(root: Arc<WatchedRoot>, from: RelativePath, to: RelativePath) -> Self {
        Self {
            root,
            relative_path: to,
            kind: ChangeKind::Moved,
            observed_at: Instant::now(),
            from_path: Some(from),
        }
    }
}
