//! HTTP wire protocol shared by the client and the server.
//!
//! | Operation | Request                     | Body          |
//! |-----------|-----------------------------|---------------|
//! | Put       | `PUT /files/{path}`         | file bytes    |
//! | Delete    | `DELETE /files/{path}`      | -             |
//! | List      | `GET /files[/{dir}]`        | -             |
//! | Download  | `GET /files/{file}`         | -             |
//!
//! Every request carries `Authorization: Bearer <credential>`. Put may carry
//! `X-Sync-Mode` with the decimal unix mode of the source file.

use serde::{Deserialize, Serialize};

use crate::path::RelativePath;

/// Maximum accepted payload (50MB). Larger files are out of scope.
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024 * 1024;

pub const FILES_ROUTE: &str = "/files";
pub const HEALTH_ROUTE: &str = "/health";
pub const MODE_HEADER: &str = "x-sync-mode";

/// Acknowledgement returned for every mutating request and for errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    pub message: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: "success".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time in milliseconds since epoch
    pub modified_ms: u64,
}

/// Directory listing, entries sorted case-insensitively by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<ListEntry>,
}

/// Build the URL for a file under the server's `/files` route.
pub fn files_url(base_url: &str, path: &RelativePath) -> String {
    let encoded: Vec<String> = path
        .segments()
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}{}/{}",
        base_url.trim_end_matches('/'),
        FILES_ROUTE,
        encoded.join("/")
    )
}

pub fn health_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), HEALTH_ROUTE)
}
