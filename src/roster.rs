use crate::ingest::IngestionPipeline;
use crate::protocol::{
    BROADCAST_CHAT, ChatSummary, ProtocolClient, RosterEntry, phone_from_chat_id,
};
use crate::snapshot::SnapshotStore;
use crate::store::error::Result;
use crate::store::traits::{Backend, ContactStore, ConversationStore};
use log::{debug, info, warn};
use std::sync::Arc;

/// Reconciles the network's contact list, group list and cached chat
/// history into the CRM's records. Every per-item failure is isolated;
/// partial progress is the expected success mode.
pub struct RosterSyncer {
    backend: Arc<dyn Backend>,
    ingest: Arc<IngestionPipeline>,
    snapshot: Arc<SnapshotStore>,
}

impl RosterSyncer {
    pub fn new(
        backend: Arc<dyn Backend>,
        ingest: Arc<IngestionPipeline>,
        snapshot: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            backend,
            ingest,
            snapshot,
        }
    }

    /// Upserts roster entries into the contact table, applying the name
    /// quality ladder: saved name > profile name > none. A stored name is
    /// only replaced by a strictly better one, never downgraded.
    pub async fn sync_roster_entries(&self, entries: &[RosterEntry]) {
        debug!(target: "Roster", "syncing {} roster entries", entries.len());
        for entry in entries {
            if let Err(e) = self.apply_roster_entry(entry).await {
                warn!(target: "Roster", "failed to sync {}: {e}", entry.chat_id);
            }
        }
    }

    async fn apply_roster_entry(&self, entry: &RosterEntry) -> Result<()> {
        if entry.chat_id.is_empty() || entry.chat_id == BROADCAST_CHAT {
            return Ok(());
        }

        let phone = phone_from_chat_id(&entry.chat_id);
        let saved = entry.saved_name.as_deref().filter(|n| !n.is_empty());
        let profile = entry.profile_name.as_deref().filter(|n| !n.is_empty());

        let contact = self
            .backend
            .find_or_create_by_phone(phone, saved.or(profile))
            .await?;

        if let Some(saved) = saved {
            if contact.name.as_deref() != Some(saved) {
                self.backend.set_contact_name(&contact.id, saved).await?;
            }
        } else if let (None, Some(profile)) = (&contact.name, profile) {
            self.backend.set_contact_name(&contact.id, profile).await?;
        }
        Ok(())
    }

    /// Models each group as a contact keyed by the group id, named after
    /// the group subject, with a conversation ensured for it.
    pub async fn sync_groups(&self, session_id: &str, client: &dyn ProtocolClient) {
        let groups = match client.fetch_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(target: "Roster", "failed to fetch groups: {e:?}");
                return;
            }
        };
        info!(target: "Roster", "found {} groups for session {session_id}", groups.len());

        for (group_id, subject) in groups {
            if let Err(e) = self
                .ensure_chat(session_id, &group_id, Some(&subject), true)
                .await
            {
                warn!(target: "Roster", "failed to process group {group_id}: {e}");
            }
        }
    }

    /// On-demand contact sync from the protocol cache.
    pub async fn sync_cached_contacts(&self) {
        let cache = self.snapshot.cache().await;
        let entries: Vec<RosterEntry> = cache.contacts.into_values().collect();
        info!(target: "Roster", "syncing {} contacts from the protocol cache", entries.len());
        self.sync_roster_entries(&entries).await;
    }

    /// Ensures contact + conversation records for each known chat.
    pub async fn sync_chats(&self, session_id: &str, chats: &[ChatSummary]) {
        let mut imported = 0usize;
        for chat in chats {
            match self
                .ensure_chat(session_id, &chat.chat_id, chat.display_name.as_deref(), false)
                .await
            {
                Ok(true) => imported += 1,
                Ok(false) => {}
                Err(e) => warn!(target: "Roster", "failed to import chat {}: {e}", chat.chat_id),
            }
        }
        info!(target: "Roster", "{imported} conversations imported for session {session_id}");
    }

    /// `authoritative` names (group subjects) replace whatever is stored;
    /// others only seed a newly created contact.
    async fn ensure_chat(
        &self,
        session_id: &str,
        chat_id: &str,
        display_name: Option<&str>,
        authoritative: bool,
    ) -> Result<bool> {
        if chat_id.is_empty() || chat_id == BROADCAST_CHAT {
            return Ok(false);
        }
        let phone = phone_from_chat_id(chat_id);
        let name = display_name.filter(|n| !n.is_empty());
        let contact = self.backend.find_or_create_by_phone(phone, name).await?;
        if authoritative && let Some(name) = name {
            if contact.name.as_deref() != Some(name) {
                self.backend.set_contact_name(&contact.id, name).await?;
            }
        }
        self.backend
            .find_or_create_conversation(session_id, &contact.id)
            .await?;
        Ok(true)
    }

    /// Replays cached historical messages through the live ingestion
    /// path. Duplicates are dropped by the pipeline's external-id check;
    /// individual failures do not abort the batch.
    pub async fn backfill_history(&self, session_id: &str, client: &Arc<dyn ProtocolClient>) {
        let cache = self.snapshot.cache().await;
        info!(
            target: "Roster",
            "starting history backfill for session {session_id}: {} chats cached",
            cache.messages.len()
        );

        for (chat_id, messages) in &cache.messages {
            if let Err(e) = self.ensure_chat(session_id, chat_id, None, false).await {
                warn!(target: "Roster", "backfill skipped chat {chat_id}: {e}");
                continue;
            }
            self.ingest.ingest_batch(session_id, client, messages).await;
        }
        info!(target: "Roster", "history backfill finished for session {session_id}");
    }
}
