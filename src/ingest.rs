use crate::media::MediaStore;
use crate::protocol::{
    BROADCAST_CHAT, ProtocolClient, WireMessage, phone_from_chat_id, status_from_code,
};
use crate::store::error::Result;
use crate::store::traits::{Backend, ContactStore, ConversationStore, MessageStore};
use crate::types::events::{EventBus, NewMessageEvent};
use crate::types::message::{MessageStatus, NewMessage};
use log::{debug, info, warn};
use std::sync::Arc;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// Broadcast chatter or an external id we already persisted.
    Skipped,
}

/// Converts inbound wire messages into durable CRM state, once per
/// external message id. Failure policy lives here, in one place: media
/// and store errors are logged and the batch continues.
pub struct IngestionPipeline {
    backend: Arc<dyn Backend>,
    media: Arc<MediaStore>,
    bus: Arc<EventBus>,
}

impl IngestionPipeline {
    pub fn new(backend: Arc<dyn Backend>, media: Arc<MediaStore>, bus: Arc<EventBus>) -> Self {
        Self {
            backend,
            media,
            bus,
        }
    }

    pub async fn ingest_batch(
        &self,
        session_id: &str,
        client: &Arc<dyn ProtocolClient>,
        batch: &[WireMessage],
    ) {
        for message in batch {
            if let Err(e) = self.ingest_message(session_id, client.as_ref(), message).await {
                warn!(
                    target: "Ingest",
                    "failed to process message {} from {}: {e}",
                    message.external_id, message.chat_id
                );
            }
        }
    }

    pub async fn ingest_message(
        &self,
        session_id: &str,
        client: &dyn ProtocolClient,
        wire: &WireMessage,
    ) -> Result<IngestOutcome> {
        if wire.chat_id.is_empty() || wire.chat_id == BROADCAST_CHAT {
            return Ok(IngestOutcome::Skipped);
        }

        // At-least-once delivery upstream; the external id makes us
        // exactly-once downstream.
        if self
            .backend
            .find_by_external_id(session_id, &wire.external_id)
            .await?
            .is_some()
        {
            debug!(target: "Ingest", "duplicate message {}, skipping", wire.external_id);
            return Ok(IngestOutcome::Skipped);
        }

        let phone = phone_from_chat_id(&wire.chat_id);
        let text = wire.body.text().map(str::to_string);
        let kind = wire.body.kind();

        info!(
            target: "Ingest",
            "[{session_id}] {} from {phone}: {}",
            if wire.from_me { "sent" } else { "received" },
            text.as_deref().unwrap_or(kind.label()),
        );

        let media_url = match wire.body.media() {
            Some(media) => {
                let downloaded = match client.download_media(media).await {
                    Ok(bytes) => self.media.save(media.kind, &wire.external_id, &bytes).await,
                    Err(e) => Err(e),
                };
                match downloaded {
                    Ok(url) => Some(url),
                    Err(e) => {
                        // The message is persisted regardless; only the
                        // binary is lost.
                        warn!(
                            target: "Ingest",
                            "media download failed for {}: {e:?}",
                            wire.external_id
                        );
                        None
                    }
                }
            }
            None => None,
        };

        // A from_me push name refers to the local account and must never
        // name the peer.
        let push_name = if wire.from_me {
            None
        } else {
            wire.push_name.as_deref().filter(|n| !n.is_empty())
        };
        let mut contact = self
            .backend
            .find_or_create_by_phone(phone, push_name)
            .await?;
        if let (None, Some(name)) = (&contact.name, push_name) {
            self.backend.set_contact_name(&contact.id, name).await?;
            contact.name = Some(name.to_string());
        }

        let conversation = self
            .backend
            .find_or_create_conversation(session_id, &contact.id)
            .await?;

        let message = self
            .backend
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                session_id: session_id.to_string(),
                contact_id: Some(contact.id.clone()),
                kind,
                content: text.clone(),
                media_url,
                from_me: wire.from_me,
                external_id: Some(wire.external_id.clone()),
                status: if wire.from_me {
                    MessageStatus::Sent
                } else {
                    MessageStatus::Delivered
                },
                timestamp: wire.timestamp,
            })
            .await?;

        let preview = text.unwrap_or_else(|| format!("[{}]", kind.label()));
        self.backend
            .touch_last_message(&conversation.id, &preview)
            .await?;
        if !wire.from_me {
            self.backend.increment_unread(&conversation.id).await?;
        }

        self.bus.emit_new_message(NewMessageEvent {
            session_id: session_id.to_string(),
            conversation_id: conversation.id.clone(),
            contact,
            message,
        });

        Ok(IngestOutcome::Stored)
    }

    /// Applies a delivery/read acknowledgement to the matching stored
    /// message. Unknown external ids and repeated acknowledgements are
    /// silently dropped.
    pub async fn apply_status_update(&self, session_id: &str, external_id: &str, code: u32) {
        let Some(status) = status_from_code(code) else {
            return;
        };

        let found = match self.backend.find_by_external_id(session_id, external_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(target: "Ingest", "status lookup failed for {external_id}: {e}");
                return;
            }
        };
        // The message may predate the session or be untracked.
        let Some(message) = found else { return };
        if message.status == status {
            return;
        }

        if let Err(e) = self.backend.set_message_status(&message.id, status).await {
            warn!(target: "Ingest", "status update failed for {}: {e}", message.id);
            return;
        }
        self.bus
            .emit_message_status(session_id, &message.id, status);
    }
}
