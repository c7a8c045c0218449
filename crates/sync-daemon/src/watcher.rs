//! Filesystem watcher for a watched root.
//!
//! Wraps a raw `notify` watcher. Events are translated into [`ChangeEvent`]s
//! and forwarded to the root's coalescer, which does all debouncing.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use walkdir::WalkDir;

use sync_core::{ChangeEvent, ChangeKind, WatchedRoot};

/// Watches one root recursively. Dropping it stops the watch.
pub struct RootWatcher {
    root: Arc<WatchedRoot>,
    _watcher: RecommendedWatcher,
}

impl RootWatcher {
    pub fn start(root: Arc<WatchedRoot>, events: mpsc::UnboundedSender<ChangeEvent>) -> Result<Self> {
        let callback_root = Arc::clone(&root);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in translate(&callback_root, &event) {
                        if events.send(change).is_err() {
                            // Coalescer gone
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error on {}: {}", callback_root.name(), e);
                }
            }
        })?;

        watcher
            .watch(root.local_path(), RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.local_path().display()))?;
        debug!("Watching {} ({})", root.name(), root.local_path().display());

        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Arc<WatchedRoot> {
        &self.root
    }
}

/// Translate one raw notify event into change events for `root`.
///
/// Paths outside the root (or not representable as relative paths) are
/// dropped. A directory that appears, by creation or by being moved in, is
/// walked and reported as one `Created` per file inside it: files can land
/// there before the recursive watch covers the new directory.
pub fn translate(root: &Arc<WatchedRoot>, event: &Event) -> Vec<ChangeEvent> {
    let relative = |path: &Path| root.relativize(path);
    let single = |kind: ChangeKind| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .filter_map(|path| relative(path))
            .map(|path| ChangeEvent::new(Arc::clone(root), path, kind))
            .collect()
    };
    let appeared_all = || -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .flat_map(|path| appeared(root, path))
            .collect()
    };

    let changes = match &event.kind {
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .iter()
            .flat_map(|path| files_below(root, path))
            .collect(),
        EventKind::Create(_) => appeared_all(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let (source, target) = (&event.paths[0], &event.paths[1]);
            match (relative(source), relative(target)) {
                (Some(from), Some(to)) if !target.is_dir() => {
                    vec![ChangeEvent::moved(Arc::clone(root), from, to)]
                }
                (from, _) => from
                    .map(|from| ChangeEvent::new(Arc::clone(root), from, ChangeKind::Deleted))
                    .into_iter()
                    .chain(appeared(root, target))
                    .collect(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => appeared_all(),
        EventKind::Modify(ModifyKind::Name(_)) => by_existence(root, event),
        EventKind::Modify(_) => single(ChangeKind::Modified),
        EventKind::Remove(_) => single(ChangeKind::Deleted),
        EventKind::Access(_) => Vec::new(),
        EventKind::Any | EventKind::Other => by_existence(root, event),
    };

    for change in &changes {
        trace!("{:?} {}:{}", change.kind, root.name(), change.relative_path);
    }
    changes
}

/// Platforms that cannot tell which side of a rename a path is on report a
/// bare rename; decide by whether the path still exists.
fn by_existence(root: &Arc<WatchedRoot>, event: &Event) -> Vec<ChangeEvent> {
    event
        .paths
        .iter()
        .flat_map(|path| {
            if path.is_dir() {
                return appeared(root, path);
            }
            let kind = if path.exists() {
                ChangeKind::Modified
            } else {
                ChangeKind::Deleted
            };
            root.relativize(path)
                .map(|relative| ChangeEvent::new(Arc::clone(root), relative, kind))
                .into_iter()
                .collect()
        })
        .collect()
}

/// `Created` for a new file, or for every file below a new directory.
fn appeared(root: &Arc<WatchedRoot>, path: &Path) -> Vec<ChangeEvent> {
    if path.is_dir() {
        return files_below(root, path);
    }
    root.relativize(path)
        .map(|relative| ChangeEvent::new(Arc::clone(root), relative, ChangeKind::Created))
        .into_iter()
        .collect()
}

fn files_below(root: &Arc<WatchedRoot>, dir: &Path) -> Vec<ChangeEvent> {
    if root.relativize(dir).is_none() || !dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", root.name(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| root.relativize(entry.path()))
        .map(|relative| ChangeEvent::new(Arc::clone(root), relative, ChangeKind::Created))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::RemoveKind;
    use std::time::Duration;
    use sync_core::PathMatcher;
    use tempfile::TempDir;

    fn root(dir: &TempDir) -> Arc<WatchedRoot> {
        Arc::new(WatchedRoot::new("docs", dir.path(), "", PathMatcher::default(), true).unwrap())
    }

    fn kinds(changes: &[ChangeEvent]) -> Vec<(ChangeKind, String)> {
        changes
            .iter()
            .map(|c| (c.kind, c.relative_path.to_string()))
            .collect()
    }

    #[test]
    fn test_translate_create_modify_remove() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        let file = root.local_path().join("sub/a.txt");

        let created = translate(&root, &Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()));
        assert_eq!(kinds(&created), vec![(ChangeKind::Created, "sub/a.txt".to_string())]);

        let modified = translate(
            &root,
            &Event::new(EventKind::Modify(ModifyKind::Any)).add_path(file.clone()),
        );
        assert_eq!(kinds(&modified), vec![(ChangeKind::Modified, "sub/a.txt".to_string())]);

        let removed = translate(&root, &Event::new(EventKind::Remove(RemoveKind::File)).add_path(file));
        assert_eq!(kinds(&removed), vec![(ChangeKind::Deleted, "sub/a.txt".to_string())]);
    }

    #[test]
    fn test_translate_skips_folders_and_outside_paths() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);

        let folder = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.local_path().join("sub"));
        assert!(translate(&root, &folder).is_empty());

        let outside = Event::new(EventKind::Create(CreateKind::File)).add_path("/elsewhere/a.txt".into());
        assert!(translate(&root, &outside).is_empty());
    }

    #[test]
    fn test_translate_rename_both_is_move() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.local_path().join("old.txt"))
            .add_path(root.local_path().join("new.txt"));

        let changes = translate(&root, &event);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Moved);
        assert_eq!(changes[0].from_path.as_ref().unwrap().as_str(), "old.txt");
        assert_eq!(changes[0].relative_path.as_str(), "new.txt");
    }

    #[test]
    fn test_translate_rename_halves() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);

        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(root.local_path().join("old.txt"));
        assert_eq!(kinds(&translate(&root, &from)), vec![(ChangeKind::Deleted, "old.txt".to_string())]);

        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(root.local_path().join("new.txt"));
        assert_eq!(kinds(&translate(&root, &to)), vec![(ChangeKind::Created, "new.txt".to_string())]);
    }

    #[test]
    fn test_new_directory_reports_files_inside() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        std::fs::create_dir_all(root.local_path().join("sub/deeper")).unwrap();
        std::fs::write(root.local_path().join("sub/a.txt"), "a").unwrap();
        std::fs::write(root.local_path().join("sub/deeper/b.txt"), "b").unwrap();

        let folder = Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.local_path().join("sub"));
        let mut changes = kinds(&translate(&root, &folder));
        changes.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            changes,
            vec![
                (ChangeKind::Created, "sub/a.txt".to_string()),
                (ChangeKind::Created, "sub/deeper/b.txt".to_string()),
            ]
        );

        let moved_in = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(root.local_path().join("sub/deeper"));
        assert_eq!(
            kinds(&translate(&root, &moved_in)),
            vec![(ChangeKind::Created, "sub/deeper/b.txt".to_string())]
        );
    }

    #[test]
    fn test_directory_rename_deletes_source_and_creates_files() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        std::fs::create_dir(root.local_path().join("dir2")).unwrap();
        std::fs::write(root.local_path().join("dir2/a.txt"), "a").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.local_path().join("dir"))
            .add_path(root.local_path().join("dir2"));
        assert_eq!(
            kinds(&translate(&root, &event)),
            vec![
                (ChangeKind::Deleted, "dir".to_string()),
                (ChangeKind::Created, "dir2/a.txt".to_string()),
            ]
        );

        let moved_out = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.local_path().join("dir2"))
            .add_path("/elsewhere/dir2".into());
        assert_eq!(kinds(&translate(&root, &moved_out)), vec![(ChangeKind::Deleted, "dir2".to_string())]);
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let root = root(&dir);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = RootWatcher::start(Arc::clone(&root), tx).unwrap();

        // Give the OS watcher a moment to register
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(root.local_path().join("a.txt"), "hello").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let change = rx.recv().await.unwrap();
                if change.relative_path.as_str() == "a.txt" {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(change.kind, ChangeKind::Created | ChangeKind::Modified));
    }
}
