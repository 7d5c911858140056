use crate::protocol::{ChatSummary, HistorySnapshot, RosterEntry, WireMessage};
use crate::store::error::{Result, StoreError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Notify, RwLock};

/// Protocol-level cache of everything the network has told us about
/// contacts, chats and messages. Survives restarts so roster
/// reconciliation and history backfill need not wait for a fresh full
/// sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolCache {
    pub contacts: HashMap<String, RosterEntry>,
    pub chats: HashMap<String, ChatSummary>,
    /// Cached messages keyed by chat id, in arrival order.
    pub messages: HashMap<String, Vec<WireMessage>>,
}

pub struct SnapshotStore {
    path: PathBuf,
    cache: RwLock<ProtocolCache>,
}

impl SnapshotStore {
    /// Loads the cache from disk. A missing or corrupt file starts an
    /// empty cache; neither is fatal.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = match fs::read(&path).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(cache) => {
                    info!(target: "Snapshot", "loaded protocol cache from {}", path.display());
                    cache
                }
                Err(e) => {
                    warn!(
                        target: "Snapshot",
                        "corrupt cache at {}, starting empty: {e}",
                        path.display()
                    );
                    ProtocolCache::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(target: "Snapshot", "no cache at {}, starting empty", path.display());
                ProtocolCache::default()
            }
            Err(e) => {
                warn!(target: "Snapshot", "failed to read cache: {e}");
                ProtocolCache::default()
            }
        };
        Self {
            path,
            cache: RwLock::new(cache),
        }
    }

    pub async fn record_roster(&self, entries: &[RosterEntry]) {
        let mut cache = self.cache.write().await;
        for entry in entries {
            cache
                .contacts
                .insert(entry.chat_id.clone(), entry.clone());
        }
    }

    pub async fn record_message(&self, message: &WireMessage) {
        let mut cache = self.cache.write().await;
        let chat = cache.messages.entry(message.chat_id.clone()).or_default();
        if !chat.iter().any(|m| m.external_id == message.external_id) {
            chat.push(message.clone());
        }
    }

    pub async fn record_history(&self, history: &HistorySnapshot) {
        let mut cache = self.cache.write().await;
        for chat in &history.chats {
            cache.chats.insert(chat.chat_id.clone(), chat.clone());
        }
        for contact in &history.contacts {
            cache
                .contacts
                .entry(contact.chat_id.clone())
                .or_insert_with(|| contact.clone());
        }
        for message in &history.messages {
            let chat = cache.messages.entry(message.chat_id.clone()).or_default();
            if !chat.iter().any(|m| m.external_id == message.external_id) {
                chat.push(message.clone());
            }
        }
    }

    pub async fn cache(&self) -> ProtocolCache {
        self.cache.read().await.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        let data = {
            let cache = self.cache.read().await;
            serde_json::to_vec_pretty(&*cache)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, data).await?;
        Ok(())
    }

    /// Periodic flush; runs until the shutdown notifier fires. Flush
    /// failures are logged and swallowed.
    pub async fn flush_loop(self: Arc<Self>, interval: Duration, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.flush().await {
                        warn!(target: "Snapshot", "cache flush failed: {e}");
                    }
                }
                _ = shutdown.notified() => {
                    debug!(target: "Snapshot", "shutdown signaled, exiting flush loop");
                    return;
                }
            }
        }
    }
}
