//! Client configuration loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credential;
use crate::change::ChangeKind;
use crate::error::ConfigError;

/// Main configuration for the sync client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the transfer server (e.g. `http://127.0.0.1:8888`)
    pub server_url: String,

    /// Shared secret presented on every request
    pub credential: Credential,

    /// Quiescence window before a changed path is sent
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry behavior for transient transfer failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directories to watch
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Identity of the root (defaults to the local path)
    #[serde(default)]
    pub name: Option<String>,

    /// Local directory to watch
    pub local_path: PathBuf,

    /// Destination directory under the server root ("" = server root)
    #[serde(default)]
    pub remote_path: String,

    /// Only watched while enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Paths must match one of these (empty = everything)
    #[serde(default, rename = "match")]
    pub include: Vec<String>,

    /// Paths matching any of these are skipped
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Sync files and directories whose name starts with '.'
    #[serde(default)]
    pub include_hidden: bool,

    /// Patterns skipped only for one kind of change
    #[serde(default)]
    pub ignore_on: HashMap<ChangeKind, Vec<String>>,
}

impl RootConfig {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            local_path: local_path.into(),
            remote_path: String::new(),
            enabled: true,
            include: Vec::new(),
            ignore: Vec::new(),
            include_hidden: false,
            ignore_on: HashMap::new(),
        }
    }

    /// Name used to identify this root in logs and actions.
    pub fn identity(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.local_path.display().to_string())
    }
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            server_url: server_url.into(),
            credential,
            debounce_ms: default_debounce_ms(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
            roots: Vec::new(),
        }
    }

    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClientConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Check settings that serde cannot express. Roots are checked when the
    /// registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url is empty".into()));
        }
        if self.credential.is_empty() {
            return Err(ConfigError::Invalid("credential is empty".into()));
        }
        if self.debounce_ms == 0 {
            return Err(ConfigError::Invalid("debounce_ms must be greater than 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
