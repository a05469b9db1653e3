//! Error types for the ingestion client.

use thiserror::Error;

/// Result type for ingestion client operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingestion client errors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Configuration error (bad endpoint, client construction)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error (connection refused, timeout, reset)
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The request could not be built or followed (never retried)
    #[error("request error: {0}")]
    Request(#[source] reqwest::Error),

    /// Sink answered with a non-success status
    #[error("sink returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Every delivery attempt failed; `last` is the final failure
    #[error("delivery failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<IngestError>,
    },

    /// Shutdown fired while waiting to retry; `last` is the failure before it
    #[error("delivery interrupted after {attempts} attempts: {last}")]
    Interrupted {
        attempts: u32,
        #[source]
        last: Box<IngestError>,
    },
}

impl IngestError {
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_builder() || error.is_redirect() {
            IngestError::Request(error)
        } else {
            IngestError::Transport(error)
        }
    }

    /// Whether another delivery attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transport(_) | IngestError::Status { .. })
    }
}

/// Keep sink error bodies short enough for a log line.
pub(crate) fn truncate_body(body: String) -> String {
    const MAX_BODY: usize = 200;
    if body.chars().count() <= MAX_BODY {
        return body;
    }
    let mut short: String = body.chars().take(MAX_BODY).collect();
    short.push('…');
    short
}
