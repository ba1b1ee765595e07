//! HTTP client for the meter's local snapshot endpoint

use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fetching a snapshot from the meter failed
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Meter request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Meter endpoint returned status {0}")]
    Status(StatusCode),

    #[error("Meter request cancelled")]
    Cancelled,
}

/// Unauthenticated GET client for one configured meter endpoint
#[derive(Debug, Clone)]
pub struct MeterClient {
    client: Client,
    endpoint: String,
}

impl MeterClient {
    /// Create a client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("p1-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the raw snapshot body
    ///
    /// Anything other than `200 OK` is a failure. Cancelling the token aborts
    /// the in-flight request.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_inner() => result,
        }
    }

    async fn fetch_inner(&self) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(&self.endpoint).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status));
        }

        let body = response.bytes().await?;
        debug!(endpoint = %self.endpoint, bytes = body.len(), "Fetched meter snapshot");

        Ok(body.to_vec())
    }
}
