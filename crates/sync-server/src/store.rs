//! Destination directory tree on the server.
//!
//! Every operation takes an already-validated [`RelativePath`] and resolves it
//! under the canonical root. Puts and deletes on the same path are serialized
//! through a per-path async mutex; the lock table only holds paths that are
//! currently in use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use rand::Rng;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use sync_core::{ListEntry, Listing, MAX_PAYLOAD_SIZE, RelativePath, resolve_under};

use crate::error::StoreError;

/// Suffix of in-progress uploads. Hidden from listings.
const TEMP_SUFFIX: &str = ".sync-tmp";

type LockTable = Mutex<HashMap<RelativePath, Arc<tokio::sync::Mutex<()>>>>;

/// What a path currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

pub struct DestinationStore {
    root: PathBuf,
    locks: Arc<LockTable>,
}

/// Exclusive access to one path. Removes its table entry when released and
/// nobody else is waiting.
pub struct PathLock {
    guard: Option<OwnedMutexGuard<()>>,
    key: RelativePath,
    table: Arc<LockTable>,
}

impl Drop for PathLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let idle = table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            table.remove(&self.key);
        }
    }
}

impl DestinationStore {
    /// Open the store rooted at an existing directory.
    pub fn new(root: &Path) -> Result<Self, StoreError> {
        let root = root
            .canonicalize()
            .map_err(|_| StoreError::NotFound(root.display().to_string()))?;
        if !root.is_dir() {
            return Err(StoreError::NotADirectory(root.display().to_string()));
        }
        Ok(Self {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of paths with a live lock entry.
    pub fn active_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn lock(&self, path: &RelativePath) -> PathLock {
        let lock = {
            let mut table = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(table.entry(path.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        PathLock {
            guard: Some(guard),
            key: path.clone(),
            table: Arc::clone(&self.locks),
        }
    }

    fn resolve(&self, path: &RelativePath) -> Result<PathBuf, StoreError> {
        Ok(resolve_under(&self.root, path)?)
    }

    pub async fn kind(&self, path: &RelativePath) -> Result<Option<EntryKind>, StoreError> {
        let target = self.resolve(path)?;
        match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
            Ok(_) => Ok(Some(EntryKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file at `path` with `payload`. Readers see either the old
    /// or the new contents, never a partial write.
    pub async fn put(&self, path: &RelativePath, payload: &[u8], mode: Option<u32>) -> Result<(), StoreError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(StoreError::TooLarge(payload.len()));
        }

        let _lock = self.lock(path).await;
        let target = self.resolve(path)?;

        if fs::metadata(&target).await.is_ok_and(|meta| meta.is_dir()) {
            return Err(StoreError::IsDirectory(path.to_string()));
        }

        let parent = target
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent).await.map_err(|e| match e.kind() {
            // Some ancestor is a regular file
            std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::NotADirectory => {
                StoreError::NotADirectory(path.to_string())
            }
            _ => StoreError::Io(e),
        })?;

        let temp_path = parent.join(format!(".{}.{}{}", path.file_name(), random_hex(), TEMP_SUFFIX));
        if let Err(e) = write_temp(&temp_path, payload, mode).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!("Wrote {} ({} bytes)", path, payload.len());
        Ok(())
    }

    /// Remove the file or directory at `path`. Returns false if nothing was there.
    pub async fn delete(&self, path: &RelativePath) -> Result<bool, StoreError> {
        let _lock = self.lock(path).await;
        let target = self.resolve(path)?;

        let meta = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match result {
            Ok(()) => {
                debug!("Deleted {}", path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, path: &RelativePath) -> Result<Vec<u8>, StoreError> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// List a directory (`None` = the root), sorted case-insensitively by name.
    pub async fn list(&self, path: Option<&RelativePath>) -> Result<Listing, StoreError> {
        let (dir, display) = match path {
            Some(path) => (self.resolve(path)?, path.to_string()),
            None => (self.root.clone(), String::new()),
        };

        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound(display)),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between read_dir and stat
                Err(_) => continue,
            };
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            entries.push(ListEntry {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                modified_ms,
            });
        }
        entries.sort_by_key(|e| e.name.to_lowercase());

        Ok(Listing {
            path: display,
            entries,
        })
    }
}

async fn write_temp(temp_path: &Path, payload: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    drop(file);
    if let Some(mode) = mode {
        set_mode(temp_path, mode).await?;
    }
    Ok(())
}

/// Only permission bits are applied; setuid, setgid and sticky are dropped.
#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn random_hex() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(p: &str) -> RelativePath {
        RelativePath::parse(p).unwrap()
    }

    fn store() -> (TempDir, DestinationStore) {
        let dir = TempDir::new().unwrap();
        let store = DestinationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_creates_parents_and_overwrites() {
        let (dir, store) = store();

        store.put(&path("a/b/c.txt"), b"one", None).await.unwrap();
        store.put(&path("a/b/c.txt"), b"two", None).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a/b/c.txt")).unwrap(), b"two");
        assert_eq!(store.read(&path("a/b/c.txt")).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let (dir, store) = store();
        store.put(&path("a.txt"), b"x", None).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_put_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = store();

        store.put(&path("run.sh"), b"#!/bin/sh", Some(0o755)).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_put_drops_special_mode_bits() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, store) = store();

        store.put(&path("suid"), b"x", Some(0o6755)).await.unwrap();
        store.put(&path("sticky"), b"x", Some(0o1777)).await.unwrap();

        let mode = |name: &str| std::fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
        assert_eq!(mode("suid") & 0o7777, 0o755);
        assert_eq!(mode("sticky") & 0o7777, 0o777);
    }

    #[tokio::test]
    async fn test_put_onto_directory_is_rejected() {
        let (dir, store) = store();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let result = store.put(&path("sub"), b"x", None).await;
        assert!(matches!(result, Err(StoreError::IsDirectory(_))));
        assert!(dir.path().join("sub").is_dir());
    }

    #[tokio::test]
    async fn test_put_below_a_file_is_rejected() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let result = store.put(&path("a.txt/b.txt"), b"x", None).await;
        assert!(matches!(result, Err(StoreError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (dir, store) = store();
        store.put(&path("a.txt"), b"x", None).await.unwrap();

        assert!(store.delete(&path("a.txt")).await.unwrap());
        assert!(!store.delete(&path("a.txt")).await.unwrap());
        assert!(!store.delete(&path("never/existed.txt")).await.unwrap());
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_directory_is_recursive() {
        let (dir, store) = store();
        store.put(&path("sub/inner/a.txt"), b"x", None).await.unwrap();

        assert!(store.delete(&path("sub")).await.unwrap());
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn test_list_sorted_case_insensitively() {
        let (_dir, store) = store();
        store.put(&path("b.txt"), b"bb", None).await.unwrap();
        store.put(&path("A.txt"), b"a", None).await.unwrap();
        store.put(&path("c/d.txt"), b"d", None).await.unwrap();

        let listing = store.list(None).await.unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A.txt", "b.txt", "c"]);
        assert_eq!(listing.entries[1].size, 2);
        assert!(listing.entries[2].is_dir);

        let sub = store.list(Some(&path("c"))).await.unwrap();
        assert_eq!(sub.path, "c");
        assert_eq!(sub.entries.len(), 1);

        assert!(matches!(
            store.list(Some(&path("missing"))).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_locks_removed_when_idle() {
        let (_dir, store) = store();

        let first = store.lock(&path("a.txt")).await;
        assert_eq!(store.active_locks(), 1);
        drop(first);
        assert_eq!(store.active_locks(), 0);

        store.put(&path("a.txt"), b"x", None).await.unwrap();
        assert_eq!(store.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_same_path_operations_are_serialized() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let held = store.lock(&path("a.txt")).await;
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.put(&path("a.txt"), b"x", None).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert!(store.kind(&path("a.txt")).await.unwrap().is_none());

        drop(held);
        writer.await.unwrap().unwrap();
        assert_eq!(store.kind(&path("a.txt")).await.unwrap(), Some(EntryKind::File));
        assert_eq!(store.active_locks(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let (dir, store) = store();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let result = store.put(&path("link/evil.txt"), b"x", None).await;
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
        assert!(!outside.path().join("evil.txt").exists());
    }
}
