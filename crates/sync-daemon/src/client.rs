//! HTTP client that delivers sync actions to the transfer server.
//!
//! Transient failures (connection errors, timeouts, 5xx) are retried with
//! exponential backoff. Authentication failures and other 4xx responses are
//! returned immediately.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use thiserror::Error;
use tracing::{debug, warn};

use sync_core::protocol::{MODE_HEADER, files_url, health_url};
use sync_core::{Ack, ClientConfig, Credential, SyncAction, SyncOp};

use crate::retry::{RetryPolicy, calculate_backoff};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Server rejected the credential (HTTP {status})")]
    Authentication { status: u16 },

    #[error("Server rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Giving up after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl TransferError {
    /// Whether the same request might succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transient { .. })
    }
}

/// Seam between the dispatcher and the network.
#[async_trait]
pub trait Transfer: Send + Sync + 'static {
    async fn send(&self, action: &SyncAction) -> Result<Ack, TransferError>;
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    Retry(String),
    Fatal(TransferError),
}

/// Sends actions to `{server_url}/files/...`.
pub struct TransferClient {
    http: reqwest::Client,
    server_url: String,
    credential: Credential,
    retry: RetryPolicy,
}

impl TransferClient {
    pub fn new(
        server_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            server_url: server_url.into(),
            credential,
            retry,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, TransferError> {
        Self::new(
            config.server_url.clone(),
            config.credential.clone(),
            config.timeout(),
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Check that the server is reachable and accepts our credential.
    /// Makes a single attempt.
    pub async fn health_check(&self) -> Result<(), TransferError> {
        let response = self
            .http
            .get(health_url(&self.server_url))
            .header(AUTHORIZATION, self.credential.bearer())
            .send()
            .await
            .map_err(|e| TransferError::Transient {
                attempts: 1,
                message: e.to_string(),
            })?;

        match classify(response).await {
            Ok(_) => Ok(()),
            Err(Attempt::Fatal(e)) => Err(e),
            Err(Attempt::Retry(message)) => Err(TransferError::Transient {
                attempts: 1,
                message,
            }),
        }
    }

    async fn send_once(&self, action: &SyncAction) -> Result<Ack, Attempt> {
        let url = files_url(&self.server_url, &action.remote_path);
        let request = match &action.op {
            SyncOp::Put { payload, mode } => {
                let mut request = self.http.put(&url).body(payload.clone());
                if let Some(mode) = mode {
                    request = request.header(MODE_HEADER, mode.to_string());
                }
                request
            }
            SyncOp::Delete => self.http.delete(&url),
        };

        let response = request
            .header(AUTHORIZATION, self.credential.bearer())
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.to_string()))?;

        classify(response).await
    }
}

/// Map an HTTP response onto success, retry, or permanent failure.
async fn classify(response: reqwest::Response) -> Result<Ack, Attempt> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let ack = serde_json::from_str::<Ack>(&body).ok();

    if status.is_success() {
        return Ok(ack.unwrap_or_else(Ack::ok));
    }

    let message = ack
        .map(|ack| ack.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(Attempt::Fatal(TransferError::Authentication {
            status: status.as_u16(),
        }))
    } else if status.is_server_error() {
        Err(Attempt::Retry(format!("HTTP {}: {}", status.as_u16(), message)))
    } else {
        Err(Attempt::Fatal(TransferError::Rejected {
            status: status.as_u16(),
            message,
        }))
    }
}

#[async_trait]
impl Transfer for TransferClient {
    async fn send(&self, action: &SyncAction) -> Result<Ack, TransferError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.send_once(action).await {
                Ok(ack) => {
                    debug!(
                        "{} {} acknowledged after {} attempt(s)",
                        action.op.name(),
                        action.remote_path,
                        attempts
                    );
                    return Ok(ack);
                }
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(message)) => {
                    if !self.retry.allows_retry(attempts) {
                        return Err(TransferError::Transient { attempts, message });
                    }
                    let delay = calculate_backoff(attempts, &self.retry);
                    warn!(
                        "{} {} failed ({}), retrying in {:?}",
                        action.op.name(),
                        action.remote_path,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
