//! Capability boundary to the underlying wire-protocol client.
//!
//! The gateway never speaks the remote protocol itself; it drives an
//! implementation of [`ProtocolClient`] and consumes its event stream. The
//! real client lives outside this repository — tests use
//! [`crate::mock::MockProtocolClient`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ids::SessionId;

/// Close reason codes carried by [`ProtocolEvent::Closed`].
///
/// The numeric values mirror the remote service's stream-error codes; only
/// the classification below matters to the orchestration layer.
pub mod close {
    /// Credentials revoked / logged out from the phone. Absorbing.
    pub const LOGGED_OUT: u16 = 401;
    /// Another device took over the session. Expected to self-resolve.
    pub const CONFLICT: u16 = 440;
    /// Synthetic code used when the event stream ends without a close frame.
    pub const STREAM_ENDED: u16 = 0;
}

/// Branch taken by the state machine for a given close code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseClass {
    LoggedOut,
    Conflict,
    Other,
}

pub fn classify_close(code: u16) -> CloseClass {
    match code {
        close::LOGGED_OUT | 403 => CloseClass::LoggedOut,
        close::CONFLICT => CloseClass::Conflict,
        _ => CloseClass::Other,
    }
}

/// Best-effort content summary of an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// Typed placeholder for non-text content, e.g. "image", "audio".
    Media { kind: String },
    Unknown,
}

impl MessageContent {
    pub fn summary(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Media { kind } => format!("[{kind}]"),
            Self::Unknown => "[unsupported]".to_string(),
        }
    }
}

/// One message delivered by the remote service.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Protocol-level message id; used for redelivery dedup.
    pub id: String,
    pub from: String,
    pub content: MessageContent,
    /// Unix timestamp (seconds) as reported by the protocol layer.
    pub timestamp: i64,
}

/// Events emitted by a live protocol connection.
#[derive(Clone, Debug)]
pub enum ProtocolEvent {
    /// A pairing code is ready to be scanned.
    PairingCode { code: String },
    /// Handshake completed; the session is live.
    Opened { identity: String },
    /// The connection dropped with the given reason code.
    Closed { code: u16 },
    Message(InboundMessage),
    /// Key material changed. `critical` marks rotations that affect whether
    /// the session can re-authenticate at all.
    Credentials { blob: Vec<u8>, critical: bool },
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure of a single send attempt.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SendError {
    /// Recipient-side problem: unknown number, blocked, not on the service.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
    #[error("send timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// A live connection plus the event stream that drives the state machine.
pub struct ProtocolSession {
    pub connection: Arc<dyn ProtocolConnection>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Capability to establish sessions. One implementation per remote service.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    /// Perform the handshake. `credentials` is the durable blob from a prior
    /// pairing, or `None` for a fresh QR pairing flow.
    async fn connect(
        &self,
        session_id: &SessionId,
        credentials: Option<&[u8]>,
    ) -> Result<ProtocolSession, ProtocolError>;
}

/// Capability of one live connection.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Send a text message; returns the protocol-assigned message id.
    async fn send_text(&self, to: &str, text: &str) -> Result<String, SendError>;

    async fn send_media(
        &self,
        to: &str,
        bytes: Bytes,
        caption: Option<&str>,
    ) -> Result<String, SendError>;

    /// Invalidate the credentials remotely. Best-effort.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Tear down the underlying transport. Must be called before any new
    /// connect attempt for the same session.
    async fn close(&self);
}
