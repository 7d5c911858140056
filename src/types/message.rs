use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
}

impl MessageKind {
    /// Short tag used for conversation previews of non-text messages.
    pub fn label(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Location => "location",
            MessageKind::Contact => "contact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub session_id: String,
    pub contact_id: Option<String>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub from_me: bool,
    /// The network-assigned message identifier. Deduplication key for
    /// inbound events and correlation key for status acknowledgements.
    /// Absent for sends that failed before the network assigned one.
    pub external_id: Option<String>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

/// Insert payload for [`Message`]; the store assigns the record id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub session_id: String,
    pub contact_id: Option<String>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub from_me: bool,
    pub external_id: Option<String>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}
