//! Request pipeline shared by every file route.
//!
//! A request moves through Received → Authenticated → PathValidated →
//! Applied → Acknowledged. It can leave early as a rejection (401/400/404/
//! 409/413) or a failure (500). Authentication runs in the router's auth
//! layer, before the request body is read, and [`handle`] only accepts
//! requests carrying the resulting [`Authenticated`] proof.

use axum::Json;
use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use sync_core::{Ack, Listing, MAX_PAYLOAD_SIZE, RelativePath};

use crate::AppState;
use crate::error::ApiError;
use crate::store::EntryKind;

/// A request as received, before authentication or path validation.
#[derive(Debug)]
pub enum TransferRequest {
    Put {
        path: String,
        payload: Bytes,
        mode: Option<String>,
    },
    Delete {
        path: String,
    },
    /// `None` lists the root
    List {
        path: Option<String>,
    },
    /// Lists a directory, or returns the bytes of a file
    Download {
        path: String,
    },
}

impl TransferRequest {
    fn name(&self) -> &'static str {
        match self {
            TransferRequest::Put { .. } => "put",
            TransferRequest::Delete { .. } => "delete",
            TransferRequest::List { .. } => "list",
            TransferRequest::Download { .. } => "download",
        }
    }
}

/// Successful result of a request.
#[derive(Debug)]
pub enum Outcome {
    Acknowledged(Ack),
    Listing(Listing),
    File(Vec<u8>),
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Acknowledged(ack) => (StatusCode::OK, Json(ack)).into_response(),
            Outcome::Listing(listing) => (StatusCode::OK, Json(listing)).into_response(),
            Outcome::File(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response(),
        }
    }
}

/// Proof that a request presented the configured credential.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated(());

/// Check the `Authorization` header against the configured credential.
pub fn authenticate(state: &AppState, authorization: Option<&str>) -> Result<Authenticated, ApiError> {
    if state.gate.authenticate_header(authorization) {
        Ok(Authenticated(()))
    } else {
        warn!("Rejected request with missing or invalid credential");
        Err(ApiError::Unauthorized)
    }
}

fn validate(raw: &str) -> Result<RelativePath, ApiError> {
    RelativePath::parse(raw).map_err(|e| {
        warn!("Rejected path {:?}: {}", raw, e);
        ApiError::BadRequest(e.to_string())
    })
}

fn parse_mode(raw: Option<&str>) -> Result<Option<u32>, ApiError> {
    raw.map(|value| {
        value
            .trim()
            .parse::<u32>()
            .map_err(|_| ApiError::BadRequest(format!("Invalid mode: {}", value)))
    })
    .transpose()
}

/// Run one request through the pipeline.
pub async fn handle(
    state: &AppState,
    _: Authenticated,
    request: TransferRequest,
) -> Result<Outcome, ApiError> {
    debug!("Received {} request", request.name());

    match request {
        TransferRequest::Put {
            path,
            payload,
            mode,
        } => {
            let path = validate(&path)?;
            let mode = parse_mode(mode.as_deref())?;
            if payload.len() > MAX_PAYLOAD_SIZE {
                return Err(ApiError::TooLarge(format!(
                    "Payload of {} bytes exceeds {} bytes",
                    payload.len(),
                    MAX_PAYLOAD_SIZE
                )));
            }

            state.store.put(&path, &payload, mode).await?;
            info!("Stored {} ({} bytes)", path, payload.len());
            Ok(Outcome::Acknowledged(Ack::ok()))
        }

        TransferRequest::Delete { path } => {
            let path = validate(&path)?;
            let existed = state.store.delete(&path).await?;
            if existed {
                info!("Deleted {}", path);
            } else {
                debug!("Delete of missing {}", path);
            }
            Ok(Outcome::Acknowledged(Ack::ok()))
        }

        TransferRequest::List { path } => {
            let path = path.as_deref().map(validate).transpose()?;
            let listing = state.store.list(path.as_ref()).await?;
            Ok(Outcome::Listing(listing))
        }

        TransferRequest::Download { path } => {
            let path = validate(&path)?;
            match state.store.kind(&path).await? {
                Some(EntryKind::Directory) => Ok(Outcome::Listing(state.store.list(Some(&path)).await?)),
                Some(EntryKind::File) => Ok(Outcome::File(state.store.read(&path).await?)),
                None => Err(ApiError::NotFound(format!("Not found: {}", path))),
            }
        }
    }
}
