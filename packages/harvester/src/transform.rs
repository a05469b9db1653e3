//! Normalization of source messages into sink records.

use ingest_client::{
    ChannelPayload, EntityPayload, EntityType, ImportRecord, MessagePayload, MessageType,
    SenderPayload,
};

use crate::traits::{ChannelHandle, MediaFlags, SourceMessage, TextEntity, TextEntityKind};
use crate::types::ChannelRef;

/// Longest message text forwarded to the sink, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Default base for canonical message links.
pub const DEFAULT_LINK_BASE: &str = "https://t.me";

/// Media kind by fixed priority: photo, video, document (refined by MIME),
/// voice, audio, sticker, then plain text.
pub fn classify_media(media: &MediaFlags) -> MessageType {
    if media.photo {
        MessageType::Photo
    } else if media.video {
        MessageType::Video
    } else if media.document {
        match media.document_mime.as_deref() {
            Some(mime) if mime.starts_with("audio/") => MessageType::Audio,
            Some(mime) if mime.starts_with("video/") => MessageType::Video,
            _ => MessageType::Document,
        }
    } else if media.voice {
        MessageType::Voice
    } else if media.audio {
        MessageType::Audio
    } else if media.sticker {
        MessageType::Sticker
    } else {
        MessageType::Text
    }
}

/// Hashtags, URLs and mentions sliced out of `text`.
///
/// Entities whose bounds fall outside the text, that are empty, or that split
/// a surrogate pair are dropped.
pub fn extract_entities(text: &str, entities: &[TextEntity]) -> Vec<EntityPayload> {
    if entities.is_empty() || text.is_empty() {
        return Vec::new();
    }
    let units: Vec<u16> = text.encode_utf16().collect();

    entities
        .iter()
        .filter_map(|entity| {
            let entity_type = match entity.kind {
                TextEntityKind::Hashtag => EntityType::Hashtag,
                TextEntityKind::Url => EntityType::Url,
                TextEntityKind::Mention => EntityType::Mention,
                TextEntityKind::Other => return None,
            };
            if entity.length == 0 {
                return None;
            }
            let end = entity.offset.checked_add(entity.length)?;
            let slice = units.get(entity.offset..end)?;
            let entity_value = String::from_utf16(slice).ok()?;
            Some(EntityPayload {
                entity_type,
                entity_value,
            })
        })
        .collect()
}

/// Strip control characters (keeping newline, tab and carriage return) and
/// cap the length.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .take(MAX_TEXT_CHARS)
        .collect()
}

/// The channel's public handle; an empty handle counts as none.
pub fn public_handle(handle: Option<&str>) -> Option<&str> {
    handle.filter(|h| !h.is_empty())
}

/// `{link_base}/{handle}/{id}` for channels with a public handle.
pub fn message_link(link_base: &str, handle: Option<&str>, id: i64) -> Option<String> {
    let handle = public_handle(handle)?;
    Some(format!("{}/{}/{}", link_base.trim_end_matches('/'), handle, id))
}

/// Build the sink record for one message.
pub fn build_record(
    channel: &ChannelRef,
    handle: &ChannelHandle,
    message: &SourceMessage,
    link_base: &str,
) -> ImportRecord {
    let raw_text = message.text.as_deref().unwrap_or_default();
    let sender = message.sender.clone().unwrap_or_default();
    let public = public_handle(handle.handle.as_deref());

    ImportRecord {
        message: MessagePayload {
            telegram_id: message.id,
            message_type: classify_media(&message.media),
            content_text: sanitize_text(raw_text),
            media_file_path: message_link(link_base, public, message.id),
            views: message.views.unwrap_or(0),
            forwards: message.forwards.unwrap_or(0),
            replies_count: message.replies.unwrap_or(0),
            posted_at: message.date,
        },
        channel: ChannelPayload {
            telegram_id: handle.id,
            title: handle.title.clone(),
            username: public.map(str::to_string),
            kind: handle.kind.clone(),
            is_private: public.is_none(),
            is_adults: channel.is_adults,
            description: handle.description.clone(),
            members_count: handle.member_count,
            photo_url: None,
        },
        sender: SenderPayload {
            telegram_id: sender.id,
            username: sender.username,
            display_name: sender.display_name,
            is_bot: sender.is_bot,
            photo_url: None,
        },
        entities: extract_entities(raw_text, &message.entities),
    }
}
