//! Pure ingestion sink REST client.
//!
//! Delivers batches of normalized message records to the sink's import
//! endpoint with bearer authentication, retrying transport failures and
//! non-success responses with exponential backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! use ingest_client::IngestClient;
//!
//! let client = IngestClient::new("https://sink.example/api/messages/import", token)?;
//! let counts = client.send_batch(&records).await?;
//! println!("created {}, updated {}", counts.created, counts.updated);
//! ```

pub mod error;
pub mod types;

pub use error::{IngestError, Result};
pub use types::{
    ChannelPayload, EntityPayload, EntityType, ImportCounts, ImportRecord, MessagePayload,
    MessageType, SenderPayload,
};

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("channel-harvester/", env!("CARGO_PKG_VERSION"));

/// Retry and timeout settings for batch delivery.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Total attempts per batch, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

impl DeliveryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backoff before retrying after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

pub struct IngestClient {
    client: reqwest::Client,
    endpoint: String,
    token: SecretString,
    policy: DeliveryPolicy,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestClient")
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl IngestClient {
    pub fn new(endpoint: impl Into<String>, token: SecretString) -> Result<Self> {
        Self::with_policy(endpoint, token, DeliveryPolicy::default())
    }

    pub fn with_policy(
        endpoint: impl Into<String>,
        token: SecretString,
        policy: DeliveryPolicy,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(IngestError::Config(format!(
                "sink endpoint must be an http(s) URL, got {endpoint:?}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            token,
            policy,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop waiting between retries once `cancel` fires.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Deliver one batch, retrying per the [`DeliveryPolicy`].
    ///
    /// Returns the sink's counters on success. When every attempt fails with a
    /// retryable error the result is [`IngestError::Exhausted`] wrapping the
    /// last failure. If the cancel token fires during a backoff the result is
    /// [`IngestError::Interrupted`]; a request already in flight is not cut off.
    pub async fn send_batch(&self, records: &[ImportRecord]) -> Result<ImportCounts> {
        if records.is_empty() {
            return Ok(ImportCounts::default());
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(records).await {
                Ok(counts) => {
                    debug!(
                        records = records.len(),
                        attempt,
                        created = counts.created,
                        updated = counts.updated,
                        "batch delivered"
                    );
                    return Ok(counts);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.backoff_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sink delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(IngestError::Interrupted {
                                attempts: attempt,
                                last: Box::new(e),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_retryable() => {
                    return Err(IngestError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, records: &[ImportRecord]) -> Result<ImportCounts> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.token.expose_secret())
            .json(records)
            .send()
            .await
            .map_err(IngestError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Status {
                status: status.as_u16(),
                body: error::truncate_body(body),
            });
        }

        // Delivery already succeeded; an unreadable body only loses the counters.
        let body = response.text().await.unwrap_or_default();
        Ok(ImportCounts::from_body(&body))
    }
}
