//! Relative path validation shared by both ends of a transfer.
//!
//! Every path that crosses the wire is a `/`-separated relative path. The
//! server resolves it under its root with [`resolve_under`], which refuses
//! anything that would land outside that root.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathValidationError {
    #[error("Path is empty")]
    Empty,

    #[error("Path is absolute: {0}")]
    AbsolutePath(String),

    #[error("Path contains directory traversal: {0}")]
    DirectoryTraversal(String),

    #[error("Path contains an invalid component: {0}")]
    InvalidComponent(String),

    #[error("Path escapes the destination root: {0}")]
    EscapesRoot(String),
}

/// A validated, normalized relative path (`a/b/c.txt`).
///
/// Never empty, never absolute, never contains `..`, `.` or empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    /// Validate a `/`-separated path received from a peer or from config.
    pub fn parse(path: &str) -> Result<Self, PathValidationError> {
        if path.is_empty() {
            return Err(PathValidationError::Empty);
        }

        if path.starts_with('/') || Path::new(path).is_absolute() || has_drive_prefix(path) {
            return Err(PathValidationError::AbsolutePath(path.to_string()));
        }

        let mut segments = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(PathValidationError::DirectoryTraversal(path.to_string())),
                s if s.contains('\\') || s.contains('\0') => {
                    return Err(PathValidationError::InvalidComponent(path.to_string()));
                }
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(PathValidationError::Empty);
        }

        Ok(Self(segments.join("/")))
    }

    /// Build from a filesystem path already relative to a watched root.
    pub fn from_fs(path: &Path) -> Result<Self, PathValidationError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        PathValidationError::InvalidComponent(path.display().to_string())
                    })?;
                    segments.push(name);
                }
                Component::CurDir => continue,
                Component::ParentDir => {
                    return Err(PathValidationError::DirectoryTraversal(
                        path.display().to_string(),
                    ));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathValidationError::AbsolutePath(path.display().to_string()));
                }
            }
        }
        Self::parse(&segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Prefix this path with a destination directory (which may be empty).
    pub fn under(&self, prefix: &str) -> Result<Self, PathValidationError> {
        if prefix.trim_matches('/').is_empty() {
            return Ok(self.clone());
        }
        Self::parse(&format!("{}/{}", prefix.trim_end_matches('/'), self.0))
    }

    /// Final segment of the path.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolve a relative path under `root` and verify it stays inside.
///
/// `root` must already be canonical. The deepest existing ancestor of the
/// target is canonicalized so a symlinked directory cannot redirect the
/// write outside the root.
pub fn resolve_under(root: &Path, path: &RelativePath) -> Result<PathBuf, PathValidationError> {
    let mut target = root.to_path_buf();
    for segment in path.segments() {
        target.push(segment);
    }

    let mut existing = target.as_path();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            if !canonical.starts_with(root) {
                return Err(PathValidationError::EscapesRoot(path.to_string()));
            }
            break;
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }

    if !target.starts_with(root) {
        return Err(PathValidationError::EscapesRoot(path.to_string()));
    }

    Ok(target)
}
