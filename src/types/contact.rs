use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A person (or group) known to the CRM, keyed by phone number.
/// Contacts are shared across sessions and survive session deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub phone: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStatus {
    Open,
    Pending,
    Closed,
}

impl ConversationStatus {
    /// Open and Pending conversations are the ones ingestion attaches new
    /// messages to; at most one such conversation exists per
    /// (session, contact) pair.
    pub fn is_active(self) -> bool {
        matches!(self, ConversationStatus::Open | ConversationStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub last_message: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub assignee_id: Option<String>,
    pub department_id: Option<String>,
}
