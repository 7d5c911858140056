//! The event/command contract between the bridge and the wire-level
//! messaging client. The wire protocol itself lives behind these traits;
//! the bridge only drives handles and consumes their event streams.

use crate::types::message::{MessageKind, MessageStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Host part of a plain user chat identifier.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Chat identifier of the network's broadcast pseudo-peer; never ingested.
pub const BROADCAST_CHAT: &str = "status@broadcast";

pub fn phone_from_chat_id(chat_id: &str) -> &str {
    chat_id.split('@').next().unwrap_or(chat_id)
}

pub fn chat_id_for_phone(phone: &str) -> String {
    format!("{phone}@{USER_SERVER}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn folder(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
            MediaKind::Audio => "audios",
            MediaKind::Document => "documents",
            MediaKind::Sticker => "stickers",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Image => ".jpg",
            MediaKind::Video => ".mp4",
            MediaKind::Audio => ".ogg",
            MediaKind::Document => ".bin",
            MediaKind::Sticker => ".webp",
        }
    }

    pub fn message_kind(self) -> MessageKind {
        match self {
            MediaKind::Image => MessageKind::Image,
            MediaKind::Video => MessageKind::Video,
            MediaKind::Audio => MessageKind::Audio,
            MediaKind::Document => MessageKind::Document,
            MediaKind::Sticker => MessageKind::Sticker,
        }
    }
}

/// Opaque pointer to a binary blob hosted by the network. The protocol
/// client knows how to fetch and decrypt it; the bridge only stores the
/// resulting bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub direct_path: String,
    pub file_length: Option<u64>,
    pub caption: Option<String>,
}

/// Content of an inbound wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireBody {
    Text(String),
    /// Text carrying link previews or formatting; same textual content.
    ExtendedText(String),
    Media(MediaRef),
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    ContactCard {
        display_name: String,
        vcard: Option<String>,
    },
}

impl WireBody {
    /// First non-empty textual content of the message, if any.
    pub fn text(&self) -> Option<&str> {
        let text = match self {
            WireBody::Text(t) | WireBody::ExtendedText(t) => Some(t.as_str()),
            WireBody::Media(m) => m.caption.as_deref(),
            WireBody::Location { name, .. } => name.as_deref(),
            WireBody::ContactCard { display_name, .. } => Some(display_name.as_str()),
        };
        text.filter(|t| !t.is_empty())
    }

    pub fn media(&self) -> Option<&MediaRef> {
        match self {
            WireBody::Media(m) => Some(m),
            _ => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            WireBody::Text(_) | WireBody::ExtendedText(_) => MessageKind::Text,
            WireBody::Media(m) => m.kind.message_kind(),
            WireBody::Location { .. } => MessageKind::Location,
            WireBody::ContactCard { .. } => MessageKind::Contact,
        }
    }
}

/// One inbound message event as delivered by the protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Network-assigned message identifier.
    pub external_id: String,
    /// Chat the message belongs to, `<phone>@<server>` or a group id.
    pub chat_id: String,
    pub from_me: bool,
    /// Display name asserted by the sending device. For `from_me`
    /// messages this names the local account, not the peer.
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: WireBody,
}

/// One roster entry from the network's contact list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub chat_id: String,
    /// Name the account holder saved for this contact in their phone book.
    pub saved_name: Option<String>,
    /// Name the contact set on their own profile.
    pub profile_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub chats: Vec<ChatSummary>,
    pub contacts: Vec<RosterEntry>,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was unlinked on the peer device; credentials are dead.
    LoggedOut,
    ConnectionLost,
    StreamError,
}

impl CloseReason {
    pub fn should_reconnect(self) -> bool {
        !matches!(self, CloseReason::LoggedOut)
    }
}

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A raw pairing challenge to be rendered and approved out-of-band.
    PairingChallenge { payload: String },
    /// Handshake finished; the session is live on the network.
    Opened { phone: Option<String> },
    Closed { reason: CloseReason },
    MessageBatch(Vec<WireMessage>),
    /// Delivery/read acknowledgement for a previously seen message.
    StatusUpdate { external_id: String, code: u32 },
    RosterUpsert(Vec<RosterEntry>),
    HistorySnapshot(HistorySnapshot),
}

/// Wire status codes for message acknowledgements. Unknown codes are
/// dropped by the caller.
pub fn status_from_code(code: u32) -> Option<MessageStatus> {
    match code {
        2 => Some(MessageStatus::Sent),
        3 => Some(MessageStatus::Delivered),
        4 => Some(MessageStatus::Read),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingPayload {
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<OutgoingMedia>,
}

/// Send acknowledgement carrying the id the network assigned.
#[derive(Debug, Clone)]
pub struct SendAck {
    pub external_id: String,
}

/// A live, connected handle to the messaging network for one session.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn send_message(&self, recipient: &str, payload: OutgoingPayload) -> Result<SendAck>;

    async fn mark_read(&self, recipient: &str, external_ids: &[String]) -> Result<()>;

    /// All groups the account participates in, id to subject.
    async fn fetch_groups(&self) -> Result<HashMap<String, String>>;

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>>;

    /// Best-effort close of the underlying connection.
    async fn close(&self);
}

/// Creates connected protocol handles. One call per connection attempt;
/// the returned receiver carries that connection's event stream.
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    async fn connect(
        &self,
        credentials_dir: &Path,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<ProtocolEvent>)>;
}
