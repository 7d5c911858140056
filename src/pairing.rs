use crate::store::traits::{SessionPatch, SessionStore};
use crate::types::events::EventBus;
use crate::types::session::SessionStatus;
use anyhow::Result;
use dashmap::DashMap;
use log::{info, warn};
use qrcode::QrCode;
use qrcode::render::unicode;
use std::sync::Arc;

/// Outcome of one pairing challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeVerdict {
    /// The challenge was within the ceiling. Carries the rendered code,
    /// or `None` when rendering failed (logged, nothing broadcast).
    Accepted(Option<String>),
    /// The ceiling was exceeded; the caller must abort the connection.
    Exhausted,
}

/// Turns raw pairing challenges into displayable codes and bounds how many
/// a single connection attempt may consume.
pub struct PairingController {
    max_attempts: u32,
    attempts: DashMap<String, u32>,
    sessions: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
}

impl PairingController {
    pub fn new(max_attempts: u32, sessions: Arc<dyn SessionStore>, bus: Arc<EventBus>) -> Self {
        Self {
            max_attempts,
            attempts: DashMap::new(),
            sessions,
            bus,
        }
    }

    /// Counts the challenge against the session's ceiling and, when still
    /// within it, renders the code, stores it on the session record and
    /// broadcasts it. The caller handles `Exhausted` (force-disconnect
    /// plus error status); no code is rendered past the ceiling.
    pub async fn handle_challenge(&self, session_id: &str, payload: &str) -> ChallengeVerdict {
        let attempt = {
            let mut entry = self.attempts.entry(session_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt > self.max_attempts {
            warn!(
                target: "Pairing",
                "session {session_id} exceeded {} pairing challenges, aborting",
                self.max_attempts
            );
            return ChallengeVerdict::Exhausted;
        }

        info!(target: "Pairing", "pairing code #{attempt} for session {session_id}");

        let code = match render_code(payload) {
            Ok(code) => code,
            Err(e) => {
                warn!(target: "Pairing", "failed to render pairing code: {e:?}");
                return ChallengeVerdict::Accepted(None);
            }
        };

        let patch = SessionPatch {
            status: Some(SessionStatus::QrReady),
            pairing_code: Some(Some(code.clone())),
            ..Default::default()
        };
        if let Err(e) = self.sessions.update_session(session_id, patch).await {
            warn!(target: "Pairing", "failed to persist pairing code for {session_id}: {e}");
        }

        self.bus
            .emit_status(session_id, SessionStatus::QrReady, None);
        self.bus.emit_pairing_code(session_id, &code);

        ChallengeVerdict::Accepted(Some(code))
    }

    /// Resets the counter; called on a successful connection and at the
    /// start of each fresh connection attempt.
    pub fn reset(&self, session_id: &str) {
        self.attempts.remove(session_id);
    }
}

fn render_code(payload: &str) -> Result<String> {
    let qr = QrCode::new(payload.as_bytes())?;
    Ok(qr
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}
