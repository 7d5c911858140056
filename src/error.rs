use crate::store::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} has no live connection")]
    NotConnected(String),
    #[error("conversation {0} not found")]
    ConversationNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("protocol error: {0}")]
    Protocol(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
