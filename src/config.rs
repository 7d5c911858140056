use std::path::PathBuf;
use std::time::Duration;

/// Tunables and filesystem layout for the bridge.
///
/// One credential directory is created per session id under
/// `credentials_dir`; downloaded media lands under `media_dir`, partitioned
/// by media kind; `snapshot_path` holds the protocol-level cache.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub credentials_dir: PathBuf,
    pub media_dir: PathBuf,
    pub snapshot_path: PathBuf,
    /// Pairing challenges allowed per connection attempt before the
    /// session is aborted.
    pub max_pairing_attempts: u32,
    /// Fixed delay before a reconnect after a non-logout close.
    pub reconnect_delay: Duration,
    /// How long to wait after a successful connection before replaying
    /// cached history.
    pub history_settle_delay: Duration,
    pub snapshot_flush_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            credentials_dir: PathBuf::from("auth_sessions"),
            media_dir: PathBuf::from("media"),
            snapshot_path: PathBuf::from("auth_sessions/store.json"),
            max_pairing_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            history_settle_delay: Duration::from_secs(5),
            snapshot_flush_interval: Duration::from_secs(10),
        }
    }
}
