use crate::store::error::{Result, StoreError};
use crate::store::new_record_id;
use crate::store::traits::*;
use crate::types::contact::{Contact, Conversation, ConversationStatus};
use crate::types::message::{Message, MessageStatus, NewMessage};
use crate::types::session::{Session, SessionStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory backend. Each collection sits behind its own `RwLock`, so
/// find-or-create and counter updates are atomic per record.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    contacts: Arc<RwLock<HashMap<String, Contact>>>,
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, name: &str) -> Result<Session> {
        let session = Session {
            id: new_record_id(),
            name: name.to_string(),
            status: SessionStatus::Disconnected,
            phone: None,
            pairing_code: None,
            updated_at: Utc::now(),
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(phone) = patch.phone {
            session.phone = phone;
        }
        if let Some(code) = patch.pairing_code {
            session.pairing_code = code;
        }
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn find_or_create_by_phone(&self, phone: &str, name: Option<&str>) -> Result<Contact> {
        let mut contacts = self.contacts.write().await;
        if let Some(existing) = contacts.values().find(|c| c.phone == phone) {
            return Ok(existing.clone());
        }
        let contact = Contact {
            id: new_record_id(),
            phone: phone.to_string(),
            name: name.map(str::to_string),
            tags: Vec::new(),
        };
        contacts.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        let contacts = self.contacts.read().await;
        Ok(contacts.get(id).cloned())
    }

    async fn set_contact_name(&self, id: &str, name: &str) -> Result<()> {
        let mut contacts = self.contacts.write().await;
        let contact = contacts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("contact {id}")))?;
        contact.name = Some(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_or_create_conversation(
        &self,
        session_id: &str,
        contact_id: &str,
    ) -> Result<Conversation> {
        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations.values().find(|c| {
            c.session_id == session_id && c.contact_id == contact_id && c.status.is_active()
        }) {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: new_record_id(),
            session_id: session_id.to_string(),
            contact_id: contact_id.to_string(),
            status: ConversationStatus::Open,
            last_message: None,
            last_activity: Utc::now(),
            unread_count: 0,
            assignee_id: None,
            department_id: None,
        };
        conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn find_active_conversation(
        &self,
        session_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .find(|c| {
                c.session_id == session_id && c.contact_id == contact_id && c.status.is_active()
            })
            .cloned())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(id).cloned())
    }

    async fn touch_last_message(&self, id: &str, preview: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
        conversation.last_message = Some(preview.to_string());
        conversation.last_activity = Utc::now();
        Ok(())
    }

    async fn increment_unread(&self, id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
        conversation.unread_count += 1;
        Ok(())
    }

    async fn reset_unread(&self, id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
        conversation.unread_count = 0;
        Ok(())
    }

    async fn delete_conversations_by_session(&self, session_id: &str) -> Result<u64> {
        let mut conversations = self.conversations.write().await;
        let before = conversations.len();
        conversations.retain(|_, c| c.session_id != session_id);
        Ok((before - conversations.len()) as u64)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, new: NewMessage) -> Result<Message> {
        let message = Message {
            id: new_record_id(),
            conversation_id: new.conversation_id,
            session_id: new.session_id,
            contact_id: new.contact_id,
            kind: new.kind,
            content: new.content,
            media_url: new.media_url,
            from_me: new.from_me,
            external_id: new.external_id,
            status: new.status,
            timestamp: new.timestamp,
        };
        let mut messages = self.messages.write().await;
        messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn find_by_external_id(
        &self,
        session_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .find(|m| {
                m.session_id == session_id && m.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        message.status = status;
        Ok(())
    }

    async fn unread_inbound(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut unread: Vec<Message> = messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && !m.from_me
                    && m.status != MessageStatus::Read
            })
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(unread)
    }

    async fn delete_messages_by_session(&self, session_id: &str) -> Result<u64> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| m.session_id != session_id);
        Ok((before - messages.len()) as u64)
    }
}
