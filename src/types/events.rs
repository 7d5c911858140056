use crate::types::contact::Contact;
use crate::types::message::{Message, MessageStatus};
use crate::types::session::SessionStatus;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct PairingCodeReady {
    pub session_id: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionStatusChanged {
    pub session_id: String,
    pub status: SessionStatus,
    pub phone: Option<String>,
}

/// Denormalized new-message notification: carries the contact and the full
/// message so a subscriber can render without a follow-up fetch.
#[derive(Debug, Clone)]
pub struct NewMessageEvent {
    pub session_id: String,
    pub conversation_id: String,
    pub contact: Contact,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct MessageStatusChanged {
    pub session_id: String,
    pub message_id: String,
    pub status: MessageStatus,
}

/// Typed event bus fanning session/pairing/message events out to
/// subscribers. Holds no business state; slow subscribers lag and drop
/// per broadcast-channel semantics.
#[derive(Debug)]
pub struct EventBus {
    pub pairing_code: broadcast::Sender<Arc<PairingCodeReady>>,
    pub status: broadcast::Sender<Arc<ConnectionStatusChanged>>,
    pub new_message: broadcast::Sender<Arc<NewMessageEvent>>,
    pub message_status: broadcast::Sender<Arc<MessageStatusChanged>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            pairing_code: broadcast::channel(CHANNEL_CAPACITY).0,
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            new_message: broadcast::channel(CHANNEL_CAPACITY).0,
            message_status: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn emit_pairing_code(&self, session_id: &str, code: &str) {
        let _ = self.pairing_code.send(Arc::new(PairingCodeReady {
            session_id: session_id.to_string(),
            code: code.to_string(),
        }));
    }

    pub fn emit_status(&self, session_id: &str, status: SessionStatus, phone: Option<String>) {
        let _ = self.status.send(Arc::new(ConnectionStatusChanged {
            session_id: session_id.to_string(),
            status,
            phone,
        }));
    }

    pub fn emit_new_message(&self, event: NewMessageEvent) {
        let _ = self.new_message.send(Arc::new(event));
    }

    pub fn emit_message_status(&self, session_id: &str, message_id: &str, status: MessageStatus) {
        let _ = self.message_status.send(Arc::new(MessageStatusChanged {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            status,
        }));
    }

    /// Subscribe to every event kind, optionally filtered to one session.
    pub fn subscribe(&self, session_id: Option<&str>) -> Subscription {
        Subscription {
            session_id: session_id.map(str::to_string),
            pairing_code: self.pairing_code.subscribe(),
            status: self.status.subscribe(),
            new_message: self.new_message.subscribe(),
            message_status: self.message_status.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    PairingCode(Arc<PairingCodeReady>),
    Status(Arc<ConnectionStatusChanged>),
    NewMessage(Arc<NewMessageEvent>),
    MessageStatus(Arc<MessageStatusChanged>),
}

impl BridgeEvent {
    fn session_id(&self) -> &str {
        match self {
            BridgeEvent::PairingCode(e) => &e.session_id,
            BridgeEvent::Status(e) => &e.session_id,
            BridgeEvent::NewMessage(e) => &e.session_id,
            BridgeEvent::MessageStatus(e) => &e.session_id,
        }
    }
}

/// Merged receiver over the four event channels. Lagged channels are
/// skipped over; `None` means the bus itself was dropped.
pub struct Subscription {
    session_id: Option<String>,
    pairing_code: broadcast::Receiver<Arc<PairingCodeReady>>,
    status: broadcast::Receiver<Arc<ConnectionStatusChanged>>,
    new_message: broadcast::Receiver<Arc<NewMessageEvent>>,
    message_status: broadcast::Receiver<Arc<MessageStatusChanged>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        loop {
            let event = tokio::select! {
                ev = self.pairing_code.recv() => map_recv(ev, BridgeEvent::PairingCode)?,
                ev = self.status.recv() => map_recv(ev, BridgeEvent::Status)?,
                ev = self.new_message.recv() => map_recv(ev, BridgeEvent::NewMessage)?,
                ev = self.message_status.recv() => map_recv(ev, BridgeEvent::MessageStatus)?,
            };
            let Some(event) = event else { continue };
            match &self.session_id {
                Some(id) if event.session_id() != id => continue,
                _ => return Some(event),
            }
        }
    }
}

/// Ok → deliver, Lagged → skip (inner None), Closed → end (outer None).
fn map_recv<T>(
    result: Result<T, broadcast::error::RecvError>,
    wrap: impl FnOnce(T) -> BridgeEvent,
) -> Option<Option<BridgeEvent>> {
    match result {
        Ok(ev) => Some(Some(wrap(ev))),
        Err(broadcast::error::RecvError::Lagged(_)) => Some(None),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}
