//! sync-server: receiving side of the directory mirror.
//!
//! Provides:
//! - `PUT /files/{*path}` and `DELETE /files/{*path}` to apply transfers
//! - `GET /files[/{*path}]` to list directories or download files
//! - `GET /health` for startup reachability checks
//!
//! Every route requires `Authorization: Bearer <credential>`.

pub mod error;
pub mod pipeline;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use tower_http::trace::TraceLayer;

use sync_core::protocol::{FILES_ROUTE, HEALTH_ROUTE, MODE_HEADER};
use sync_core::{Ack, AuthGate, Credential, MAX_PAYLOAD_SIZE};

use crate::error::{ApiError, StoreError};
use crate::pipeline::{Authenticated, TransferRequest, handle};
use crate::store::DestinationStore;

/// Shared application state
pub struct AppState {
    pub gate: AuthGate,
    pub store: DestinationStore,
}

impl AppState {
    pub fn new(directory: &Path, credential: &Credential) -> Result<Self, StoreError> {
        Ok(Self {
            gate: AuthGate::new(credential),
            store: DestinationStore::new(directory)?,
        })
    }
}

/// Build the router for `state`.
///
/// Every route sits behind [`require_credential`], which runs before any
/// handler extracts the request body.
pub fn router(state: Arc<AppState>) -> Router {
    let file_route = format!("{}/{{*path}}", FILES_ROUTE);

    Router::new()
        .route(HEALTH_ROUTE, get(health))
        .route(FILES_ROUTE, get(list_root))
        .route(
            &file_route,
            get(get_path).put(put_file).delete(delete_file),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_credential,
        ))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn require_credential(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match pipeline::authenticate(&state, authorization(request.headers())) {
        Ok(authenticated) => {
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

async fn run(state: &AppState, authenticated: Authenticated, request: TransferRequest) -> Response {
    match handle(state, authenticated, request).await {
        Ok(outcome) => outcome.into_response(),
        Err(e) => {
            if matches!(e, ApiError::Failed(_)) {
                tracing::error!("Request failed: {}", e);
            }
            e.into_response()
        }
    }
}

/// Handler for `GET /health`
async fn health(Extension(_): Extension<Authenticated>) -> Json<Ack> {
    Json(Ack::ok())
}

/// Handler for `GET /files`
async fn list_root(
    State(state): State<Arc<AppState>>,
    Extension(authenticated): Extension<Authenticated>,
) -> Response {
    run(&state, authenticated, TransferRequest::List { path: None }).await
}

/// Handler for `GET /files/{*path}`
async fn get_path(
    State(state): State<Arc<AppState>>,
    Extension(authenticated): Extension<Authenticated>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    run(&state, authenticated, TransferRequest::Download { path }).await
}

/// Handler for `PUT /files/{*path}`
async fn put_file(
    State(state): State<Arc<AppState>>,
    Extension(authenticated): Extension<Authenticated>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
    payload: Bytes,
) -> Response {
    let mode = headers
        .get(MODE_HEADER)
        .map(|value| value.to_str().unwrap_or("invalid").to_string());
    run(&state, authenticated, TransferRequest::Put { path, payload, mode }).await
}

/// Handler for `DELETE /files/{*path}`
async fn delete_file(
    State(state): State<Arc<AppState>>,
    Extension(authenticated): Extension<Authenticated>,
    UrlPath(path): UrlPath<String>,
) -> Response {
    run(&state, authenticated, TransferRequest::Delete { path }).await
}
