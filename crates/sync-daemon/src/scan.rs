//! Initial upload of existing directory contents.
//!
//! Directories given with `--dirs` are walked once the watchers are running.
//! Every eligible file is handed to its root's coalescer as a creation, so
//! the upload shares the debounce and per-path ordering of live changes and
//! an edit made during the walk merges with it. Nothing is deleted remotely.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use sync_core::{ChangeEvent, ChangeKind, SyncRegistry, WatchedRoot};

/// Files found below one `--dirs` directory.
#[derive(Debug)]
pub struct InitialScan {
    pub root: Arc<WatchedRoot>,
    pub changes: Vec<ChangeEvent>,
    pub skipped: usize,
}

impl InitialScan {
    /// Hand the changes to the root's coalescer. Returns how many were queued.
    pub fn queue(self, events: &mpsc::UnboundedSender<ChangeEvent>) -> Result<usize> {
        let count = self.changes.len();
        for change in self.changes {
            events
                .send(change)
                .map_err(|_| anyhow::anyhow!("Coalescer for {} has stopped", self.root.name()))?;
        }
        Ok(count)
    }
}

/// Collect every eligible file below `dir`, which must lie inside a root.
pub async fn scan_directory(registry: &SyncRegistry, dir: &Path) -> Result<InitialScan> {
    let Some((root, _)) = registry.locate(dir) else {
        bail!("{} is not inside a configured root", dir.display());
    };
    if !root.is_enabled() {
        bail!("Root {} is disabled", root.name());
    }

    let start = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    let files = tokio::task::spawn_blocking(move || list_files(&start))
        .await
        .context("Directory walk panicked")?;

    let mut changes = Vec::new();
    let mut skipped = 0;
    for file in files {
        match root.relativize(&file) {
            Some(relative) if root.should_sync(relative.as_str()) => {
                changes.push(ChangeEvent::new(Arc::clone(root), relative, ChangeKind::Created));
            }
            Some(relative) => {
                debug!("Skipping {}:{}", root.name(), relative);
                skipped += 1;
            }
            None => skipped += 1,
        }
    }

    info!(
        "Initial sync of {}: {} file(s) to upload, {} skipped",
        dir.display(),
        changes.len(),
        skipped
    );
    Ok(InitialScan {
        root: Arc::clone(root),
        changes,
        skipped,
    })
}

fn list_files(start: &Path) -> Vec<PathBuf> {
    WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}
