//! Configuration errors. All of these are fatal at startup.

use std::path::PathBuf;

use thiserror::Error;

use crate::path::PathValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Watched path does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Watched path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Root '{0}' is configured more than once")]
    DuplicateRoot(String),

    #[error("Unknown root: {0}")]
    UnknownRoot(String),

    #[error("Invalid remote path for root '{root}': {source}")]
    InvalidRemotePath {
        root: String,
        #[source]
        source: PathValidationError,
    },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}
