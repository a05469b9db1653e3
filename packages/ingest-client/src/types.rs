use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized message as accepted by the sink's batch import endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub message: MessagePayload,
    pub channel: ChannelPayload,
    pub sender: SenderPayload,
    pub entities: Vec<EntityPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Photo,
    Video,
    Document,
    Voice,
    Audio,
    Sticker,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Photo => "photo",
            MessageType::Video => "video",
            MessageType::Document => "document",
            MessageType::Voice => "voice",
            MessageType::Audio => "audio",
            MessageType::Sticker => "sticker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Source sequence id; the sink upserts on (channel, telegram_id)
    pub telegram_id: i64,
    pub message_type: MessageType,
    pub content_text: String,
    /// Canonical public link, when the channel has a public handle
    pub media_file_path: Option<String>,
    pub views: i64,
    pub forwards: i64,
    pub replies_count: i64,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub telegram_id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub is_private: bool,
    pub is_adults: bool,
    pub description: Option<String>,
    pub members_count: Option<i64>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderPayload {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub is_bot: bool,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Hashtag,
    Url,
    Mention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub entity_type: EntityType,
    pub entity_value: String,
}

/// Created/updated counters reported by the sink.
///
/// Informational only: the batch is already stored when these are read, so
/// a missing or malformed body yields zero counts instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportCounts {
    pub created: u64,
    pub updated: u64,
}

impl ImportCounts {
    pub fn from_body(body: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
            return Self::default();
        };
        Self {
            created: count_field(&value, "created"),
            updated: count_field(&value, "updated"),
        }
    }
}

impl std::ops::AddAssign for ImportCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
    }
}

// Sinks have been seen to send counters as numbers or numeric strings.
fn count_field(value: &serde_json::Value, key: &str) -> u64 {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_from_body() {
        assert_eq!(
            ImportCounts::from_body(r#"{"created": 7, "updated": 2, "skipped": 1}"#),
            ImportCounts {
                created: 7,
                updated: 2
            }
        );
        assert_eq!(
            ImportCounts::from_body(r#"{"created": "4"}"#),
            ImportCounts {
                created: 4,
                updated: 0
            }
        );
    }

    #[test]
    fn test_counts_tolerate_garbage() {
        assert_eq!(ImportCounts::from_body(""), ImportCounts::default());
        assert_eq!(ImportCounts::from_body("<html>ok</html>"), ImportCounts::default());
        assert_eq!(ImportCounts::from_body("[1, 2]"), ImportCounts::default());
        assert_eq!(
            ImportCounts::from_body(r#"{"created": -3, "updated": null}"#),
            ImportCounts::default()
        );
    }

    #[test]
    fn test_record_wire_shape() {
        let record = ImportRecord {
            message: MessagePayload {
                telegram_id: 42,
                message_type: MessageType::Photo,
                content_text: "hi #rust".into(),
                media_file_path: Some("https://t.me/rustlang/42".into()),
                views: 10,
                forwards: 1,
                replies_count: 0,
                posted_at: None,
            },
            channel: ChannelPayload {
                telegram_id: 9,
                title: Some("Rust".into()),
                username: Some("rustlang".into()),
                kind: "channel".into(),
                is_private: false,
                is_adults: false,
                description: None,
                members_count: Some(1000),
                photo_url: None,
            },
            sender: SenderPayload {
                telegram_id: 0,
                username: None,
                display_name: None,
                is_bot: false,
                photo_url: None,
            },
            entities: vec![EntityPayload {
                entity_type: EntityType::Hashtag,
                entity_value: "#rust".into(),
            }],
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["message"]["message_type"], "photo");
        assert_eq!(json["channel"]["type"], "channel");
        assert_eq!(json["entities"][0]["entity_type"], "hashtag");
        assert!(json["message"]["posted_at"].is_null());
    }
}
