//! Table of watched roots.
//!
//! Built once from configuration and shared as `Arc<SyncRegistry>`. The only
//! runtime mutation is the enabled flag, which goes through
//! [`SyncRegistry::set_enabled`] so coalescers watching the flag can drop
//! their pending work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::change::ChangeKind;
use crate::config::{ClientConfig, RootConfig};
use crate::error::ConfigError;
use crate::matcher::{PathMatcher, PatternSet};
use crate::path::RelativePath;

/// A local directory mirrored to the server.
#[derive(Debug)]
pub struct WatchedRoot {
    name: String,
    local_path: PathBuf,
    remote_path: String,
    matcher: PathMatcher,
    enabled: watch::Sender<bool>,
}

impl WatchedRoot {
    /// Create a root. `local_path` must be an existing directory.
    pub fn new(
        name: impl Into<String>,
        local_path: &Path,
        remote_path: &str,
        matcher: PathMatcher,
        enabled: bool,
    ) -> Result<Self, ConfigError> {
        let name = name.into();

        if !local_path.exists() {
            return Err(ConfigError::MissingDirectory(local_path.to_path_buf()));
        }
        if !local_path.is_dir() {
            return Err(ConfigError::NotADirectory(local_path.to_path_buf()));
        }
        // Canonicalize so watcher paths (which are canonical on macOS) strip cleanly.
        let local_path = local_path
            .canonicalize()
            .map_err(|_| ConfigError::MissingDirectory(local_path.to_path_buf()))?;

        let remote_path = if remote_path.trim_matches('/').is_empty() {
            String::new()
        } else {
            RelativePath::parse(remote_path)
                .map_err(|source| ConfigError::InvalidRemotePath {
                    root: name.clone(),
                    source,
                })?
                .to_string()
        };

        let (enabled, _) = watch::channel(enabled);

        Ok(Self {
            name,
            local_path,
            remote_path,
            matcher,
            enabled,
        })
    }

    pub fn from_config(config: &RootConfig) -> Result<Self, ConfigError> {
        let mut matcher = PathMatcher::new(
            PatternSet::compile(&config.include)?,
            PatternSet::compile(&config.ignore)?,
            config.include_hidden,
        );
        for (kind, patterns) in &config.ignore_on {
            matcher = matcher.with_ignore_on(*kind, PatternSet::compile(patterns)?);
        }

        Self::new(
            config.identity(),
            &config.local_path,
            &config.remote_path,
            matcher,
            config.enabled,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Receiver that observes enable/disable toggles.
    pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }

    /// Returns true if the flag changed.
    fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        })
    }

    /// Whether a path under this root should be synchronized.
    pub fn should_sync(&self, relative_path: &str) -> bool {
        self.is_enabled() && self.matcher.matches(relative_path)
    }

    /// [`should_sync`](Self::should_sync) plus the per-kind ignore list.
    pub fn should_sync_event(&self, relative_path: &str, kind: ChangeKind) -> bool {
        self.is_enabled() && self.matcher.matches_event(relative_path, kind)
    }

    /// Convert an absolute path below this root to a relative one.
    pub fn relativize(&self, path: &Path) -> Option<RelativePath> {
        let relative = path.strip_prefix(&self.local_path).ok()?;
        RelativePath::from_fs(relative).ok()
    }
}

/// Process-wide table of watched roots.
#[derive(Debug, Default)]
pub struct SyncRegistry {
    roots: Vec<Arc<WatchedRoot>>,
}

impl SyncRegistry {
    pub fn new(roots: Vec<WatchedRoot>) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for root in roots {
            if registry.get(root.name()).is_some() {
                return Err(ConfigError::DuplicateRoot(root.name().to_string()));
            }
            registry.roots.push(Arc::new(root));
        }
        Ok(registry)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let roots = config
            .roots
            .iter()
            .map(WatchedRoot::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(roots)
    }

    pub fn roots(&self) -> &[Arc<WatchedRoot>] {
        &self.roots
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WatchedRoot>> {
        self.roots.iter().find(|r| r.name() == name)
    }

    /// Enable or disable a root. Disabling cancels its pending (not yet
    /// dispatched) actions.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, ConfigError> {
        let root = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRoot(name.to_string()))?;
        let changed = root.set_enabled(enabled);
        if changed {
            info!(
                "Root {} {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(changed)
    }

    /// Apply the enabled flags from a reloaded configuration. Other settings
    /// require a restart and are ignored. Returns the roots that changed.
    pub fn apply_enabled(&self, config: &ClientConfig) -> Vec<String> {
        let mut changed = Vec::new();
        for root_config in &config.roots {
            let name = root_config.identity();
            if let Ok(true) = self.set_enabled(&name, root_config.enabled) {
                changed.push(name);
            }
        }
        changed
    }

    /// Find the root containing an absolute path.
    pub fn locate(&self, path: &Path) -> Option<(&Arc<WatchedRoot>, Option<RelativePath>)> {
        let path = path.canonicalize().ok()?;
        self.roots
            .iter()
            .filter(|root| path.starts_with(root.local_path()))
            .max_by_key(|root| root.local_path().components().count())
            .map(|root| (root, root.relativize(&path)))
    }
}
