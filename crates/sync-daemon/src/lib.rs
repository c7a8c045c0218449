//! sync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod client;
pub mod dispatcher;
pub mod retry;
pub mod scan;
pub mod status;
pub mod watcher;

// Re-export key types for convenience
pub use client::{Transfer, TransferClient, TransferError};
pub use dispatcher::Dispatcher;
pub use retry::{RetryPolicy, calculate_backoff};
pub use scan::{InitialScan, scan_directory};
pub use status::{StatusSnapshot, StatusTracker};
pub use watcher::RootWatcher;
