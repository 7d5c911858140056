use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::ingest::IngestionPipeline;
use crate::media::MediaStore;
use crate::pairing::{ChallengeVerdict, PairingController};
use crate::protocol::{
    CloseReason, MediaKind, OutgoingMedia, OutgoingPayload, ProtocolClient, ProtocolEvent,
    ProtocolFactory, chat_id_for_phone, phone_from_chat_id,
};
use crate::roster::RosterSyncer;
use crate::snapshot::SnapshotStore;
use crate::store::error::StoreError;
use crate::store::traits::{
    Backend, ContactStore, ConversationStore, MessageStore, SessionPatch, SessionStore,
};
use crate::types::events::EventBus;
use crate::types::message::{MessageKind, MessageStatus, NewMessage};
use crate::types::session::{Session, SessionSnapshot, SessionStatus};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc, watch};

/// Transient per-session connection state. Lives only while a protocol
/// handle is open; the durable shadow is the session record.
struct SessionData {
    client: Arc<dyn ProtocolClient>,
    /// Freshest rendered pairing code, ahead of the durable copy.
    last_pairing_code: Mutex<Option<String>>,
    cancel: watch::Sender<()>,
}

/// Outbound message content as accepted from operators.
#[derive(Debug, Clone, Default)]
pub struct OutgoingContent {
    pub text: Option<String>,
    pub caption: Option<String>,
    /// Local file to attach; classified by extension.
    pub media_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    pub conversation_id: String,
    pub external_id: String,
}

enum WorkerFlow {
    Continue,
    Stop,
}

/// Owns the per-session state machine and the mapping from session id to
/// live protocol handle. All session mutation funnels through here; the
/// registry is never exposed.
pub struct ConnectionManager {
    config: BridgeConfig,
    backend: Arc<dyn Backend>,
    factory: Arc<dyn ProtocolFactory>,
    bus: Arc<EventBus>,
    pairing: PairingController,
    ingest: Arc<IngestionPipeline>,
    roster: Arc<RosterSyncer>,
    snapshot: Arc<SnapshotStore>,
    registry: DashMap<String, SessionData>,
    /// Connect attempts in flight, for idempotency under concurrent calls.
    connecting: DashMap<String, ()>,
    shutdown: Arc<Notify>,
}

impl ConnectionManager {
    pub async fn new(
        config: BridgeConfig,
        backend: Arc<dyn Backend>,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let media = Arc::new(MediaStore::new(config.media_dir.clone()));
        let snapshot = Arc::new(SnapshotStore::load(config.snapshot_path.clone()).await);
        let ingest = Arc::new(IngestionPipeline::new(
            backend.clone(),
            media,
            bus.clone(),
        ));
        let roster = Arc::new(RosterSyncer::new(
            backend.clone(),
            ingest.clone(),
            snapshot.clone(),
        ));
        let pairing = PairingController::new(
            config.max_pairing_attempts,
            backend.clone(),
            bus.clone(),
        );
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(
            snapshot
                .clone()
                .flush_loop(config.snapshot_flush_interval, shutdown.clone()),
        );

        Arc::new(Self {
            config,
            backend,
            factory,
            bus,
            pairing,
            ingest,
            roster,
            snapshot,
            registry: DashMap::new(),
            connecting: DashMap::new(),
            shutdown,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn create_session(&self, name: &str) -> Result<Session> {
        let session = self.backend.create_session(name).await?;
        info!(target: "Manager", "session created: {} ({})", session.name, session.id);
        Ok(session)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.backend.list_sessions().await?)
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionSnapshot> {
        let mut session = self.require_session(session_id).await?;
        let is_active = match self.registry.get(session_id) {
            Some(data) => {
                if let Some(code) = data.last_pairing_code.lock().unwrap().clone() {
                    session.pairing_code = Some(code);
                }
                true
            }
            None => false,
        };
        Ok(SessionSnapshot { session, is_active })
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.registry.contains_key(session_id)
    }

    /// Opens a protocol connection for the session and starts its event
    /// worker. A no-op if the session already has a live handle or a
    /// connect attempt in flight.
    pub fn connect<'a>(
        self: &'a Arc<Self>,
        session_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let session = self.require_session(session_id).await?;

        if self.registry.contains_key(session_id) {
            warn!(target: "Manager", "session {session_id} is already active");
            return Ok(());
        }
        if self.connecting.insert(session_id.to_string(), ()).is_some() {
            debug!(target: "Manager", "connect already in flight for {session_id}");
            return Ok(());
        }
        let _guard = scopeguard::guard((), |_| {
            self.connecting.remove(session_id);
        });

        info!(target: "Manager", "connecting session {}...", session.name);
        self.update_session_logged(
            session_id,
            SessionPatch::status(SessionStatus::Connecting),
        )
        .await;
        self.bus
            .emit_status(session_id, SessionStatus::Connecting, None);

        let credentials_dir = self.config.credentials_dir.join(session_id);
        tokio::fs::create_dir_all(&credentials_dir)
            .await
            .map_err(StoreError::Io)?;

        // Challenges are counted per connection attempt.
        self.pairing.reset(session_id);

        match self.factory.connect(&credentials_dir).await {
            Ok((client, events)) => {
                let (cancel, cancel_rx) = watch::channel(());
                self.registry.insert(
                    session_id.to_string(),
                    SessionData {
                        client: client.clone(),
                        last_pairing_code: Mutex::new(None),
                        cancel,
                    },
                );

                let manager = self.clone();
                let id = session_id.to_string();
                let name = session.name.clone();
                tokio::spawn(async move {
                    manager.session_worker(id, name, client, events, cancel_rx).await;
                });
                Ok(())
            }
            Err(e) => {
                error!(
                    target: "Manager",
                    "failed to connect session {}: {e:?}", session.name
                );
                self.update_session_logged(
                    session_id,
                    SessionPatch::status(SessionStatus::Error),
                )
                .await;
                self.bus.emit_status(session_id, SessionStatus::Error, None);
                Err(BridgeError::Protocol(e))
            }
        }
        })
    }

    /// Best-effort close of the live handle. Missing handles are fine;
    /// the durable record is marked disconnected either way.
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        self.require_session(session_id).await?;
        self.close_handle(session_id).await;
        self.pairing.reset(session_id);

        self.update_session_logged(
            session_id,
            SessionPatch {
                status: Some(SessionStatus::Disconnected),
                pairing_code: Some(None),
                ..Default::default()
            },
        )
        .await;
        self.bus
            .emit_status(session_id, SessionStatus::Disconnected, None);
        info!(target: "Manager", "session {session_id} disconnected");
        Ok(())
    }

    /// Disconnects, erases pairing credentials, cascade-deletes the
    /// session's conversations and messages, then the session itself.
    /// Contacts are cross-session and survive.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.require_session(session_id).await?;
        if self.registry.contains_key(session_id) {
            self.disconnect(session_id).await?;
        }

        self.remove_credentials(session_id).await;

        let messages = self.backend.delete_messages_by_session(session_id).await?;
        let conversations = self
            .backend
            .delete_conversations_by_session(session_id)
            .await?;
        self.backend.delete_session(session_id).await?;
        info!(
            target: "Manager",
            "session {session_id} removed ({messages} messages, {conversations} conversations)"
        );
        Ok(())
    }

    /// Best-effort disconnect of every active session; a failure for one
    /// session never blocks the others. Also stops background loops.
    pub async fn shutdown(&self) {
        info!(target: "Manager", "disconnecting all active sessions...");
        let ids: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!(target: "Manager", "failed to disconnect {id} during shutdown: {e}");
            }
        }
        self.shutdown.notify_waiters();
        if let Err(e) = self.snapshot.flush().await {
            warn!(target: "Manager", "final cache flush failed: {e}");
        }
        info!(target: "Manager", "all sessions disconnected");
    }

    /// Sends a message through the session's live handle and persists the
    /// outbound record. A send the network rejects is persisted as Failed
    /// (without an external id) before the error is returned.
    pub async fn send_message(
        &self,
        session_id: &str,
        recipient: &str,
        content: OutgoingContent,
    ) -> Result<SendReceipt> {
        let client = self.live_client(session_id).await?;
        let payload = self.build_payload(&content).await;

        let phone = phone_from_chat_id(recipient);
        let contact = self.backend.find_or_create_by_phone(phone, None).await?;
        let conversation = self
            .backend
            .find_or_create_conversation(session_id, &contact.id)
            .await?;

        let kind = payload
            .media
            .as_ref()
            .map(|m| m.kind.message_kind())
            .unwrap_or(MessageKind::Text);
        let body = content.caption.clone().or_else(|| content.text.clone());
        let media_url = content
            .media_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let ack = match client.send_message(recipient, payload).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(target: "Manager", "send failed for session {session_id}: {e:?}");
                let _ = self
                    .backend
                    .create_message(NewMessage {
                        conversation_id: conversation.id.clone(),
                        session_id: session_id.to_string(),
                        contact_id: Some(contact.id.clone()),
                        kind,
                        content: body,
                        media_url,
                        from_me: true,
                        external_id: None,
                        status: MessageStatus::Failed,
                        timestamp: Utc::now(),
                    })
                    .await;
                return Err(BridgeError::Protocol(e));
            }
        };

        let message = self
            .backend
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                session_id: session_id.to_string(),
                contact_id: Some(contact.id.clone()),
                kind,
                content: body.clone(),
                media_url,
                from_me: true,
                external_id: Some(ack.external_id.clone()),
                status: MessageStatus::Sent,
                timestamp: Utc::now(),
            })
            .await?;

        let preview = body.unwrap_or_else(|| format!("[{}]", kind.label()));
        self.backend
            .touch_last_message(&conversation.id, &preview)
            .await?;

        info!(target: "Manager", "message sent via session {session_id} to {recipient}");
        Ok(SendReceipt {
            message_id: message.id,
            conversation_id: conversation.id,
            external_id: ack.external_id,
        })
    }

    /// Marks a conversation read: issues the protocol read receipt for
    /// tracked messages, marks them Read and resets the unread counter.
    pub async fn send_read_receipt(&self, session_id: &str, conversation_id: &str) -> Result<()> {
        let client = self.live_client(session_id).await?;

        let conversation = self
            .backend
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| BridgeError::ConversationNotFound(conversation_id.to_string()))?;
        let contact = self
            .backend
            .get_contact(&conversation.contact_id)
            .await?
            .ok_or_else(|| {
                BridgeError::Store(StoreError::NotFound(format!(
                    "contact {}",
                    conversation.contact_id
                )))
            })?;

        let unread = self.backend.unread_inbound(conversation_id).await?;
        debug!(
            target: "Manager",
            "conversation {conversation_id}: {} unread messages", unread.len()
        );
        if unread.is_empty() {
            return Ok(());
        }

        let external_ids: Vec<String> = unread
            .iter()
            .filter_map(|m| m.external_id.clone())
            .collect();
        if !external_ids.is_empty() {
            let recipient = chat_id_for_phone(&contact.phone);
            if let Err(e) = client.mark_read(&recipient, &external_ids).await {
                warn!(target: "Manager", "failed to send read receipt: {e:?}");
            }
        }

        for message in &unread {
            if let Err(e) = self
                .backend
                .set_message_status(&message.id, MessageStatus::Read)
                .await
            {
                warn!(target: "Manager", "failed to mark {} read: {e}", message.id);
                continue;
            }
            self.bus
                .emit_message_status(session_id, &message.id, MessageStatus::Read);
        }
        self.backend.reset_unread(conversation_id).await?;
        Ok(())
    }

    /// On-demand roster reconciliation from the protocol cache.
    pub async fn sync_contacts(&self, session_id: &str) -> Result<()> {
        self.live_client(session_id).await?;
        self.roster.sync_cached_contacts().await;
        Ok(())
    }

    async fn session_worker(
        self: Arc<Self>,
        session_id: String,
        session_name: String,
        client: Arc<dyn ProtocolClient>,
        mut events: mpsc::Receiver<ProtocolEvent>,
        mut cancel: watch::Receiver<()>,
    ) {
        debug!(target: "Manager/Worker", "event worker started for {session_name}");
        loop {
            // Cancellation is only observed between events, so an event
            // already dequeued always finishes processing.
            tokio::select! {
                _ = cancel.changed() => {
                    debug!(target: "Manager/Worker", "worker for {session_name} cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let WorkerFlow::Stop = self
                            .handle_event(&session_id, &session_name, &client, event)
                            .await
                        {
                            break;
                        }
                    }
                    None => {
                        debug!(target: "Manager/Worker", "event stream for {session_name} ended");
                        break;
                    }
                },
            }
        }
        debug!(target: "Manager/Worker", "event worker stopped for {session_name}");
    }

    async fn handle_event(
        self: &Arc<Self>,
        session_id: &str,
        session_name: &str,
        client: &Arc<dyn ProtocolClient>,
        event: ProtocolEvent,
    ) -> WorkerFlow {
        match event {
            ProtocolEvent::PairingChallenge { payload } => {
                match self.pairing.handle_challenge(session_id, &payload).await {
                    ChallengeVerdict::Accepted(code) => {
                        if let (Some(code), Some(data)) = (code, self.registry.get(session_id)) {
                            *data.last_pairing_code.lock().unwrap() = Some(code);
                        }
                        WorkerFlow::Continue
                    }
                    ChallengeVerdict::Exhausted => {
                        self.close_handle(session_id).await;
                        self.update_session_logged(
                            session_id,
                            SessionPatch {
                                status: Some(SessionStatus::Error),
                                pairing_code: Some(None),
                                ..Default::default()
                            },
                        )
                        .await;
                        self.bus.emit_status(session_id, SessionStatus::Error, None);
                        WorkerFlow::Stop
                    }
                }
            }

            ProtocolEvent::Opened { phone } => {
                info!(target: "Manager", "session {session_name} connected");
                self.pairing.reset(session_id);
                if let Some(data) = self.registry.get(session_id) {
                    *data.last_pairing_code.lock().unwrap() = None;
                }
                self.update_session_logged(
                    session_id,
                    SessionPatch {
                        status: Some(SessionStatus::Connected),
                        phone: Some(phone.clone()),
                        pairing_code: Some(None),
                    },
                )
                .await;
                self.bus
                    .emit_status(session_id, SessionStatus::Connected, phone);

                let cancel = self
                    .registry
                    .get(session_id)
                    .map(|data| data.cancel.subscribe());
                self.spawn_post_connect(session_id, client, cancel);
                WorkerFlow::Continue
            }

            ProtocolEvent::Closed { reason } => {
                self.registry.remove(session_id);
                if reason.should_reconnect() {
                    warn!(
                        target: "Manager",
                        "session {session_name} closed ({reason:?}), reconnecting in {:?}",
                        self.config.reconnect_delay
                    );
                    let manager = self.clone();
                    let id = session_id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(manager.config.reconnect_delay).await;
                        if let Err(e) = manager.connect(&id).await {
                            error!(target: "Manager", "failed to reconnect {id}: {e}");
                        }
                    });
                } else {
                    info!(
                        target: "Manager",
                        "session {session_name} logged out, clearing credentials"
                    );
                    self.remove_credentials(session_id).await;
                    self.pairing.reset(session_id);
                    self.update_session_logged(
                        session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Disconnected),
                            phone: Some(None),
                            pairing_code: Some(None),
                        },
                    )
                    .await;
                    self.bus
                        .emit_status(session_id, SessionStatus::Disconnected, None);
                }
                WorkerFlow::Stop
            }

            ProtocolEvent::MessageBatch(messages) => {
                for message in &messages {
                    self.snapshot.record_message(message).await;
                }
                self.ingest.ingest_batch(session_id, client, &messages).await;
                WorkerFlow::Continue
            }

            ProtocolEvent::StatusUpdate { external_id, code } => {
                self.ingest
                    .apply_status_update(session_id, &external_id, code)
                    .await;
                WorkerFlow::Continue
            }

            ProtocolEvent::RosterUpsert(entries) => {
                self.snapshot.record_roster(&entries).await;
                self.roster.sync_roster_entries(&entries).await;
                WorkerFlow::Continue
            }

            ProtocolEvent::HistorySnapshot(history) => {
                info!(
                    target: "Manager",
                    "history snapshot for {session_name}: {} chats, {} contacts, {} messages",
                    history.chats.len(),
                    history.contacts.len(),
                    history.messages.len()
                );
                self.snapshot.record_history(&history).await;
                self.roster.sync_roster_entries(&history.contacts).await;
                self.roster.sync_chats(session_id, &history.chats).await;
                WorkerFlow::Continue
            }
        }
    }

    /// Group fetch, cached-contact sync and (after a settling delay)
    /// history backfill, each isolated in its own task. The backfill is
    /// dropped if the session goes away before the delay elapses; once
    /// started it runs to completion like any in-flight ingestion.
    fn spawn_post_connect(
        self: &Arc<Self>,
        session_id: &str,
        client: &Arc<dyn ProtocolClient>,
        cancel: Option<watch::Receiver<()>>,
    ) {
        let roster = self.roster.clone();
        let id = session_id.to_string();
        let handle = client.clone();
        tokio::spawn(async move {
            roster.sync_groups(&id, handle.as_ref()).await;
        });

        let roster = self.roster.clone();
        tokio::spawn(async move {
            roster.sync_cached_contacts().await;
        });

        let roster = self.roster.clone();
        let id = session_id.to_string();
        let handle = client.clone();
        let settle = self.config.history_settle_delay;
        tokio::spawn(async move {
            if let Some(mut cancel) = cancel {
                tokio::select! {
                    _ = tokio::time::sleep(settle) => {}
                    _ = cancel.changed() => {
                        debug!(target: "Manager", "session {id} went away before backfill");
                        return;
                    }
                }
            } else {
                tokio::time::sleep(settle).await;
            }
            roster.backfill_history(&id, &handle).await;
        });
    }

    async fn require_session(&self, session_id: &str) -> Result<Session> {
        self.backend
            .get_session(session_id)
            .await?
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))
    }

    /// The live handle for a session, or the precise error for why there
    /// is none.
    async fn live_client(&self, session_id: &str) -> Result<Arc<dyn ProtocolClient>> {
        if let Some(data) = self.registry.get(session_id) {
            return Ok(data.client.clone());
        }
        self.require_session(session_id).await?;
        Err(BridgeError::NotConnected(session_id.to_string()))
    }

    /// Closes and forgets the live handle without touching durable state.
    async fn close_handle(&self, session_id: &str) {
        if let Some((_, data)) = self.registry.remove(session_id) {
            let _ = data.cancel.send(());
            data.client.close().await;
        }
    }

    async fn remove_credentials(&self, session_id: &str) {
        let dir = self.config.credentials_dir.join(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "Manager",
                    "failed to clear credentials for {session_id}: {e}"
                );
            }
        }
    }

    async fn update_session_logged(&self, session_id: &str, patch: SessionPatch) {
        if let Err(e) = self.backend.update_session(session_id, patch).await {
            warn!(target: "Manager", "failed to update session {session_id}: {e}");
        }
    }

    async fn build_payload(&self, content: &OutgoingContent) -> OutgoingPayload {
        let media = match &content.media_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "attachment".to_string());
                    Some(OutgoingMedia {
                        kind: media_kind_for_path(path),
                        file_name,
                        bytes,
                    })
                }
                Err(e) => {
                    warn!(
                        target: "Manager",
                        "could not read attachment {}: {e}", path.display()
                    );
                    None
                }
            },
            None => None,
        };
        OutgoingPayload {
            text: content.text.clone(),
            caption: content.caption.clone(),
            media,
        }
    }
}

fn media_kind_for_path(path: &std::path::Path) -> MediaKind {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Image,
        "mp4" | "mov" | "avi" | "mkv" => MediaKind::Video,
        "mp3" | "ogg" | "wav" => MediaKind::Audio,
        _ => MediaKind::Document,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_are_classified_by_extension() {
        assert_eq!(
            media_kind_for_path(std::path::Path::new("a/photo.JPG")),
            MediaKind::Image
        );
        assert_eq!(
            media_kind_for_path(std::path::Path::new("clip.mp4")),
            MediaKind::Video
        );
        assert_eq!(
            media_kind_for_path(std::path::Path::new("note.ogg")),
            MediaKind::Audio
        );
        assert_eq!(
            media_kind_for_path(std::path::Path::new("report.pdf")),
            MediaKind::Document
        );
        assert_eq!(
            media_kind_for_path(std::path::Path::new("no_extension")),
            MediaKind::Document
        );
    }
}
