//! Core data types shared by the scheduler components.

use serde::{Deserialize, Serialize};

/// A channel named in the source list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Public identity (handle without the leading `@`)
    pub username: String,
    /// Classification flag forwarded to the sink
    #[serde(default)]
    pub is_adults: bool,
}

impl ChannelRef {
    pub fn new(username: impl Into<String>, is_adults: bool) -> Self {
        Self {
            username: username.into(),
            is_adults,
        }
    }

    /// Normalize the identity; `None` when nothing usable remains.
    pub fn normalized(self) -> Option<Self> {
        let username = normalize_identity(&self.username)?;
        Some(Self {
            username,
            is_adults: self.is_adults,
        })
    }
}

/// Trim whitespace and a single leading `@`.
pub fn normalize_identity(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A unit of work in the channel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTask {
    pub channel: ChannelRef,
    /// Attempts charged so far (rate limits and transient failures)
    pub attempts: u32,
    /// Highest sequence id reached for this channel during the current run
    pub cursor: i64,
}

impl ChannelTask {
    pub fn new(channel: ChannelRef) -> Self {
        Self {
            channel,
            attempts: 0,
            cursor: 0,
        }
    }

    pub fn identity(&self) -> &str {
        &self.channel.username
    }
}

/// Why a channel ended up in the failure ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Permanent: the channel cannot be resolved
    NotFound,
    /// Attempt cap exhausted by rate limits
    RateLimited,
    /// Attempt cap exhausted by transient failures
    #[default]
    Transient,
}

impl FailureKind {
    /// Whether a later run may reasonably try the channel again.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::NotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
        }
    }
}

/// A channel that could not be processed, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub username: String,
    #[serde(default)]
    pub is_adults: bool,
    pub reason: String,
    #[serde(default)]
    pub kind: FailureKind,
}

impl FailureRecord {
    pub fn new(channel: &ChannelRef, reason: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            username: channel.username.clone(),
            is_adults: channel.is_adults,
            reason: reason.into(),
            kind,
        }
    }

    pub fn channel(&self) -> ChannelRef {
        ChannelRef::new(self.username.clone(), self.is_adults)
    }
}
