//! Message-source traits and the records they return.
//!
//! The scheduler only needs a narrow view of the remote source: resolve a
//! channel, page through its history, and report failures as typed
//! [`SourceError`](crate::error::SourceError) variants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AccountConfig;
use crate::error::SourceResult;

/// A resolved channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    /// Public handle, when the channel has one
    #[serde(default)]
    pub handle: Option<String>,
    /// Source-specific kind name (e.g. "Channel", "Chat")
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub member_count: Option<i64>,
}

fn default_kind() -> String {
    "Channel".to_string()
}

impl ChannelHandle {
    /// Identity to use when addressing the channel again.
    pub fn address(&self) -> String {
        self.handle.clone().unwrap_or_else(|| self.id.to_string())
    }
}

/// Media attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFlags {
    pub photo: bool,
    pub video: bool,
    pub document: bool,
    /// MIME type of the document, when there is one
    pub document_mime: Option<String>,
    pub voice: bool,
    pub audio: bool,
    pub sticker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEntityKind {
    Hashtag,
    Url,
    Mention,
    #[serde(other)]
    Other,
}

/// Formatting entity over the message text. Offsets and lengths are in
/// UTF-16 code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub kind: TextEntityKind,
    pub offset: usize,
    pub length: usize,
}

impl TextEntity {
    pub fn new(kind: TextEntityKind, offset: usize, length: usize) -> Self {
        Self {
            kind,
            offset,
            length,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderInfo {
    pub id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub is_bot: bool,
}

/// One message as returned by the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMessage {
    /// Sequence id, strictly increasing within a channel
    pub id: i64,
    pub text: Option<String>,
    pub entities: Vec<TextEntity>,
    pub media: MediaFlags,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub replies: Option<i64>,
    pub date: Option<DateTime<Utc>>,
    pub sender: Option<SenderInfo>,
}

impl SourceMessage {
    /// Plain text message with the given id.
    pub fn text(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// One open session against the message source.
///
/// A session serves a single account; calls are made sequentially.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Resolve a channel identity.
    ///
    /// Fails with `NotFound` for invalid, deleted, private or restricted
    /// handles.
    async fn resolve(&self, identity: &str) -> SourceResult<ChannelHandle>;

    /// Up to `limit` messages with sequence id strictly greater than `after`.
    async fn fetch_page(
        &self,
        channel: &ChannelHandle,
        after: i64,
        limit: usize,
    ) -> SourceResult<Vec<SourceMessage>>;

    /// Close the session.
    async fn disconnect(&self) {}
}

/// Opens sessions, one per account.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self, account: &AccountConfig) -> SourceResult<Box<dyn MessageSource>>;
}
