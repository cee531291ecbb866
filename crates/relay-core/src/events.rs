use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Session lifecycle events delivered to the external webhook sink.
/// Fire-and-forget, at-least-once; never blocks session processing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "pairing_ready")]
    PairingReady {
        session_id: SessionId,
        code: String,
        expires_in_seconds: u64,
    },

    #[serde(rename = "connected")]
    Connected {
        session_id: SessionId,
        identity: String,
    },

    #[serde(rename = "message_received")]
    MessageReceived {
        session_id: SessionId,
        id: String,
        from: String,
        content: String,
        timestamp: i64,
    },

    #[serde(rename = "disconnected")]
    Disconnected {
        session_id: SessionId,
        reason: String,
    },

    #[serde(rename = "logged_out")]
    LoggedOut { session_id: SessionId },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::PairingReady { session_id, .. }
            | Self::Connected { session_id, .. }
            | Self::MessageReceived { session_id, .. }
            | Self::Disconnected { session_id, .. }
            | Self::LoggedOut { session_id } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PairingReady { .. } => "pairing_ready",
            Self::Connected { .. } => "connected",
            Self::MessageReceived { .. } => "message_received",
            Self::Disconnected { .. } => "disconnected",
            Self::LoggedOut { .. } => "logged_out",
        }
    }
}
