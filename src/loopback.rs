//! Local protocol backend: pairs instantly and echoes sends.
//!
//! Useful for exercising the full gateway — routing, pairing, persistence,
//! webhooks — without a real remote service. A session connecting without
//! stored credentials goes through the pairing flow once and receives a
//! credential blob, so a restart reconnects directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use relay_core::ids::SessionId;
use relay_core::protocol::{
    ProtocolClient, ProtocolConnection, ProtocolError, ProtocolEvent, ProtocolSession, SendError,
};

pub struct LoopbackClient {
    seq: Arc<AtomicUsize>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self {
            seq: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(
        &self,
        session_id: &SessionId,
        credentials: Option<&[u8]>,
    ) -> Result<ProtocolSession, ProtocolError> {
        let (tx, rx) = mpsc::channel(8);
        let identity = format!("loopback:{session_id}");
        let fresh = credentials.is_none();

        tokio::spawn(async move {
            if fresh {
                let _ = tx
                    .send(ProtocolEvent::PairingCode {
                        code: format!("LOOP-{}", &identity[9..]),
                    })
                    .await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx
                    .send(ProtocolEvent::Credentials {
                        blob: identity.clone().into_bytes(),
                        critical: true,
                    })
                    .await;
            }
            let _ = tx.send(ProtocolEvent::Opened { identity }).await;
        });

        Ok(ProtocolSession {
            connection: Arc::new(LoopbackConnection {
                seq: Arc::clone(&self.seq),
            }),
            events: rx,
        })
    }
}

struct LoopbackConnection {
    seq: Arc<AtomicUsize>,
}

impl LoopbackConnection {
    fn next_id(&self) -> String {
        format!("loop_{}", self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl ProtocolConnection for LoopbackConnection {
    async fn send_text(&self, _to: &str, _text: &str) -> Result<String, SendError> {
        Ok(self.next_id())
    }

    async fn send_media(
        &self,
        _to: &str,
        _bytes: Bytes,
        _caption: Option<&str>,
    ) -> Result<String, SendError> {
        Ok(self.next_id())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn close(&self) {}
}
