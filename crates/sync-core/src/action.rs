//! Coalesced actions handed to the transfer layer.

use std::fmt;
use std::fs::Metadata;

use crate::path::RelativePath;

/// What to do with a path on the server.
#[derive(Clone, PartialEq, Eq)]
pub enum SyncOp {
    /// Upload the full file contents, read when the action was finalized.
    Put {
        payload: Vec<u8>,
        /// Unix permission bits of the local file, if known
        mode: Option<u32>,
    },
    Delete,
}

impl SyncOp {
    pub fn name(&self) -> &'static str {
        match self {
            SyncOp::Put { .. } => "put",
            SyncOp::Delete => "delete",
        }
    }
}

impl fmt::Debug for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOp::Put { payload, mode } => f
                .debug_struct("Put")
                .field("len", &payload.len())
                .field("mode", mode)
                .finish(),
            SyncOp::Delete => f.write_str("Delete"),
        }
    }
}

/// One finalized change for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAction {
    /// Identity of the owning watched root
    pub root: String,
    /// Path relative to the watched root
    pub relative_path: RelativePath,
    /// Path relative to the server root (remote prefix applied)
    pub remote_path: RelativePath,
    pub op: SyncOp,
}

impl SyncAction {
    pub fn put(
        root: impl Into<String>,
        relative_path: RelativePath,
        remote_path: RelativePath,
        payload: Vec<u8>,
        mode: Option<u32>,
    ) -> Self {
        Self {
            root: root.into(),
            relative_path,
            remote_path,
            op: SyncOp::Put { payload, mode },
        }
    }

    pub fn delete(root: impl Into<String>, relative_path: RelativePath, remote_path: RelativePath) -> Self {
        Self {
            root: root.into(),
            relative_path,
            remote_path,
            op: SyncOp::Delete,
        }
    }

    /// Key used to serialize actions on the same path.
    pub fn key(&self) -> ActionKey {
        ActionKey {
            root: self.root.clone(),
            path: self.relative_path.clone(),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.op, SyncOp::Delete)
    }
}

/// (root, relative path) pair identifying a stream of actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub root: String,
    pub path: RelativePath,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.path)
    }
}

/// Permission bits sent with a Put. Special bits (setuid, setgid, sticky)
/// are never propagated.
#[cfg(unix)]
pub fn file_mode(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
pub fn file_mode(_meta: &Metadata) -> Option<u32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_file_mode_keeps_permission_bits_only() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("run.sh");
        std::fs::write(&file, "#!/bin/sh").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o4755)).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(file_mode(&meta), Some(0o755));
    }
}
