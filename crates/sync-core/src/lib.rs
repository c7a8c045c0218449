//! sync-core: Shared library for mirroring local directories to a transfer server.
//!
//! This crate provides the core functionality for:
//! - Matching paths against per-root include/ignore rules
//! - Coalescing raw filesystem changes into per-path sync actions
//! - Path sanitization and credential checks shared by client and server
//! - Wire protocol types and configuration loading

pub mod action;
pub mod auth;
pub mod change;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod path;
pub mod protocol;
pub mod registry;

pub use action::{ActionKey, SyncAction, SyncOp, file_mode};
pub use auth::{AuthGate, Credential};
pub use change::{ChangeEvent, ChangeKind};
pub use coalescer::{CoalescerHandle, EventCoalescer, Intent};
pub use config::{ClientConfig, RetryConfig, RootConfig};
pub use error::ConfigError;
pub use events::{EventBus, Subscription, SyncEvent};
pub use matcher::{PathMatcher, PatternSet};
pub use path::{PathValidationError, RelativePath, resolve_under};
pub use protocol::{Ack, ListEntry, Listing, MAX_PAYLOAD_SIZE};
pub use registry::{SyncRegistry, WatchedRoot};
