use crate::store::error::Result;
use crate::types::contact::{Contact, Conversation};
use crate::types::message::{Message, MessageStatus, NewMessage};
use crate::types::session::{Session, SessionStatus};
use async_trait::async_trait;

/// Partial update for a session record. `None` leaves a field untouched;
/// the nested options carry explicit clears.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub phone: Option<Option<String>>,
    pub pairing_code: Option<Option<String>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, name: &str) -> Result<Session>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    /// Applies the patch atomically to one record; `NotFound` if the id
    /// is unknown.
    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()>;
    async fn delete_session(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Returns the contact with this phone number, creating it (with the
    /// given name) only if none exists. An existing contact is returned
    /// untouched; name upgrades are the caller's policy.
    async fn find_or_create_by_phone(&self, phone: &str, name: Option<&str>) -> Result<Contact>;
    async fn get_contact(&self, id: &str) -> Result<Option<Contact>>;
    async fn set_contact_name(&self, id: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the Open/Pending conversation for the pair, creating an
    /// Open one if none exists. Never creates a second active
    /// conversation for the same pair.
    async fn find_or_create_conversation(
        &self,
        session_id: &str,
        contact_id: &str,
    ) -> Result<Conversation>;
    /// The Open/Pending conversation for the pair, if one exists.
    async fn find_active_conversation(
        &self,
        session_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    /// Sets the preview text and bumps the activity timestamp.
    async fn touch_last_message(&self, id: &str, preview: &str) -> Result<()>;
    async fn increment_unread(&self, id: &str) -> Result<()>;
    async fn reset_unread(&self, id: &str) -> Result<()>;
    async fn delete_conversations_by_session(&self, session_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> Result<Message>;
    async fn find_by_external_id(
        &self,
        session_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>>;
    async fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<()>;
    /// Inbound messages of a conversation not yet marked Read, newest
    /// first.
    async fn unread_inbound(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn delete_messages_by_session(&self, session_id: &str) -> Result<u64>;
}

/// The full durable backend the bridge writes to.
pub trait Backend: SessionStore + ContactStore + ConversationStore + MessageStore {}

// Blanket implementation for any type that implements all four stores.
impl<T> Backend for T where T: SessionStore + ContactStore + ConversationStore + MessageStore {}
