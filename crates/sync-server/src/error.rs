//! Server-side errors and their HTTP mapping.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use sync_core::{Ack, PathValidationError};

/// Errors from the destination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Parent is not a directory: {0}")]
    NotADirectory(String),

    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PathValidationError> for StoreError {
    fn from(err: PathValidationError) -> Self {
        StoreError::InvalidPath(err.to_string())
    }
}

/// Terminal failure of a request. Every variant except `Failed` is a
/// rejection the client should not retry.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TooLarge(String),

    #[error("{0}")]
    Failed(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(_) => ApiError::BadRequest(err.to_string()),
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::IsDirectory(_) | StoreError::NotADirectory(_) => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::TooLarge(_) => ApiError::TooLarge(err.to_string()),
            StoreError::Io(_) => ApiError::Failed(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(Ack::error(self.to_string()));
        if matches!(self, ApiError::Unauthorized) {
            (self.status(), [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (self.status(), body).into_response()
        }
    }
}
