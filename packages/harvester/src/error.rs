//! Typed errors for the harvester library.
//!
//! Uses `thiserror` for library errors (not `anyhow`); the binary wraps these
//! with context.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a message-source session.
///
/// Every source failure arrives as one of these variants; the fetch protocol
/// maps them onto outcomes without inspecting error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Handle is invalid, deleted, private or restricted
    #[error("channel not found: {reason}")]
    NotFound { reason: String },

    /// Source demands that the whole session pause
    #[error("rate limited for {seconds}s")]
    RateLimited { seconds: u64 },

    /// Session credentials were rejected
    #[error("authorization failed: {reason}")]
    Auth { reason: String },

    /// Anything that may succeed on a later attempt
    #[error("transient source error: {reason}")]
    Transient { reason: String },
}

impl SourceError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        SourceError::NotFound {
            reason: reason.into(),
        }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        SourceError::Auth {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        SourceError::Transient {
            reason: reason.into(),
        }
    }
}

/// Persistence failures. Logged by callers, never fatal to a run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state in {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid state key: {0:?}")]
    InvalidKey(String),

    /// The document could not be read at startup; writing would destroy it
    #[error("refusing to overwrite unreadable state in {key}")]
    Unreadable { key: String },
}

/// Startup configuration errors. Abort before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("unknown ledger requeue policy {0:?} (expected none, retryable or all)")]
    UnknownPolicy(String),

    #[error("no accounts configured in {}", path.display())]
    NoAccounts { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Account-level failures. Terminate only that account's worker.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account {account} could not open a session: {source}")]
    Connect {
        account: String,
        #[source]
        source: SourceError,
    },

    #[error("account {account} lost authorization: {reason}")]
    FatalAuth { account: String, reason: String },

    #[error("account {account} could not load its cursors: {source}")]
    State {
        account: String,
        #[source]
        source: StoreError,
    },

    #[error("worker for account {account} stopped abnormally: {reason}")]
    Aborted { account: String, reason: String },
}

impl AccountError {
    pub fn account(&self) -> &str {
        match self {
            AccountError::Connect { account, .. }
            | AccountError::FatalAuth { account, .. }
            | AccountError::State { account, .. }
            | AccountError::Aborted { account, .. } => account,
        }
    }
}

/// Result type alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for persistence operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
