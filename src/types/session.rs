use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    QrReady,
    Connected,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::QrReady => "QR_READY",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Durable projection of one logical connection to the messaging network.
///
/// The in-memory connection state (live handle, pairing retry counter) is
/// owned by the connection manager and never persisted; `status` and
/// `pairing_code` are its durable shadow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub phone: Option<String>,
    pub pairing_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// `Session` as reported to callers, combined with liveness of the
/// in-memory handle.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Session,
    pub is_active: bool,
}
