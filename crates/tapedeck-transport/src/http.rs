use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tapedeck_protocol::{Chunk, ChunkTransport, TransportError};
use tracing::debug;

/// Header carrying the project-scoping credential.
pub const PROJECT_KEY_HEADER: &str = "x-project-key";

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs a chunk as JSON; any non-2xx status is a failed attempt.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_attempt_timeout(DEFAULT_ATTEMPT_TIMEOUT)
    }

    /// Bound a single attempt. The retry budget stays with the uploader.
    pub fn with_attempt_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send(&self, endpoint: &str, chunk: &Chunk) -> Result<(), TransportError> {
        let body = serde_json::to_vec(chunk).map_err(|err| TransportError::Encode(err.to_string()))?;

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(PROJECT_KEY_HEADER, chunk.project_key.as_str())
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "collector acknowledged chunk");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
