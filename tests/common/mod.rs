#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::config::BridgeConfig;
use switchboard::manager::ConnectionManager;
use switchboard::protocol::{
    MediaRef, OutgoingPayload, ProtocolClient, ProtocolEvent, ProtocolFactory, SendAck, WireBody,
    WireMessage, chat_id_for_phone,
};
use switchboard::store::memory::MemoryStore;
use switchboard::types::events::{BridgeEvent, ConnectionStatusChanged, Subscription};
use tokio::sync::mpsc;

/// A protocol handle driven entirely by the test: records every command
/// and lets the test feed events into the session worker.
pub struct FakeClient {
    events: mpsc::Sender<ProtocolEvent>,
    pub sent: Mutex<Vec<(String, OutgoingPayload)>>,
    pub read_marks: Mutex<Vec<(String, Vec<String>)>>,
    pub groups: Mutex<HashMap<String, String>>,
    pub media: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_sends: AtomicBool,
    pub closed: AtomicBool,
    ack_counter: AtomicUsize,
}

impl FakeClient {
    fn new(events: mpsc::Sender<ProtocolEvent>) -> Self {
        Self {
            events,
            sent: Mutex::new(Vec::new()),
            read_marks: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            media: Mutex::new(HashMap::new()),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ack_counter: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, event: ProtocolEvent) {
        self.events
            .send(event)
            .await
            .expect("session worker is gone");
    }

    pub fn add_media(&self, direct_path: &str, bytes: &[u8]) {
        self.media
            .lock()
            .unwrap()
            .insert(direct_path.to_string(), bytes.to_vec());
    }

    pub fn set_groups(&self, groups: &[(&str, &str)]) {
        let mut lock = self.groups.lock().unwrap();
        for (id, subject) in groups {
            lock.insert(id.to_string(), subject.to_string());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn send_message(
        &self,
        recipient: &str,
        payload: OutgoingPayload,
    ) -> anyhow::Result<SendAck> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("network rejected send"));
        }
        let n = self.ack_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), payload));
        Ok(SendAck {
            external_id: format!("WIRE-OUT-{n}"),
        })
    }

    async fn mark_read(&self, recipient: &str, external_ids: &[String]) -> anyhow::Result<()> {
        self.read_marks
            .lock()
            .unwrap()
            .push((recipient.to_string(), external_ids.to_vec()));
        Ok(())
    }

    async fn fetch_groups(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn download_media(&self, media: &MediaRef) -> anyhow::Result<Vec<u8>> {
        self.media
            .lock()
            .unwrap()
            .get(&media.direct_path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("media not available"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one `FakeClient` per connect call, pre-feeding the scripted
/// events for that attempt.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<VecDeque<Vec<ProtocolEvent>>>,
    pub clients: Mutex<Vec<Arc<FakeClient>>>,
    calls: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue_script(&self, events: Vec<ProtocolEvent>) {
        self.scripts.lock().unwrap().push_back(events);
    }

    pub fn connect_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        self.clients.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ProtocolFactory for ScriptedFactory {
    async fn connect(
        &self,
        _credentials_dir: &Path,
    ) -> anyhow::Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<ProtocolEvent>)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        for event in script {
            tx.send(event)
                .await
                .map_err(|_| anyhow::anyhow!("script channel closed"))?;
        }
        let client = Arc::new(FakeClient::new(tx));
        self.clients.lock().unwrap().push(client.clone());
        Ok((client, rx))
    }
}

pub struct TestBridge {
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<MemoryStore>,
    pub factory: Arc<ScriptedFactory>,
    pub dir: Option<tempfile::TempDir>,
}

pub async fn bridge() -> TestBridge {
    let dir = tempfile::tempdir().unwrap();
    let mut bridge = bridge_in(dir.path()).await;
    bridge.dir = Some(dir);
    bridge
}

/// Builds a bridge rooted at an existing directory, so tests can restart
/// against the same on-disk state.
pub async fn bridge_in(root: &Path) -> TestBridge {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = BridgeConfig {
        credentials_dir: root.join("auth_sessions"),
        media_dir: root.join("media"),
        snapshot_path: root.join("auth_sessions/store.json"),
        ..Default::default()
    };
    let store = Arc::new(MemoryStore::new());
    let factory = ScriptedFactory::new();
    let manager = ConnectionManager::new(config, store.clone(), factory.clone()).await;
    TestBridge {
        manager,
        store,
        factory,
        dir: None,
    }
}

pub fn text_message(external_id: &str, phone: &str, text: &str, from_me: bool) -> WireMessage {
    WireMessage {
        external_id: external_id.to_string(),
        chat_id: chat_id_for_phone(phone),
        from_me,
        push_name: None,
        timestamp: Utc::now(),
        body: WireBody::Text(text.to_string()),
    }
}

pub fn with_push_name(mut message: WireMessage, name: &str) -> WireMessage {
    message.push_name = Some(name.to_string());
    message
}

const EVENT_DEADLINE: Duration = Duration::from_secs(10);

pub async fn next_event(sub: &mut Subscription) -> BridgeEvent {
    tokio::time::timeout(EVENT_DEADLINE, sub.next())
        .await
        .expect("timed out waiting for bridge event")
        .expect("event bus closed")
}

/// Skips to the next connection-status event.
pub async fn next_status(sub: &mut Subscription) -> Arc<ConnectionStatusChanged> {
    loop {
        if let BridgeEvent::Status(status) = next_event(sub).await {
            return status;
        }
    }
}

/// Polls until the condition holds; panics if it never does.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time: {what}");
}
