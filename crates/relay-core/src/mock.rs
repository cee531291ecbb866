//! Scripted protocol client for deterministic tests without a remote service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ids::SessionId;
use crate::protocol::{
    ProtocolClient, ProtocolConnection, ProtocolError, ProtocolEvent, ProtocolSession, SendError,
};

/// Pre-programmed outcome for one `connect()` call.
pub enum MockConnect {
    /// Handshake succeeds; the listed events are replayed after their delays.
    Session(MockSession),
    /// Handshake fails outright.
    Fail(ProtocolError),
}

pub struct MockSession {
    pub events: Vec<(Duration, ProtocolEvent)>,
    /// Results handed out to successive send attempts on this connection.
    /// When exhausted, further sends succeed with a generated id.
    pub send_results: Vec<Result<String, SendError>>,
}

impl MockSession {
    pub fn new(events: Vec<(Duration, ProtocolEvent)>) -> Self {
        Self {
            events,
            send_results: Vec::new(),
        }
    }

    pub fn with_send_results(mut self, results: Vec<Result<String, SendError>>) -> Self {
        self.send_results = results;
        self
    }
}

/// A record of one send performed against a mock connection.
#[derive(Clone, Debug)]
pub struct SentRecord {
    pub to: String,
    pub body: String,
}

/// Mock client that consumes scripts in connect order.
pub struct MockProtocolClient {
    scripts: Mutex<VecDeque<MockConnect>>,
    connect_count: AtomicUsize,
    live_connections: Arc<AtomicUsize>,
    logout_count: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<SentRecord>>>,
}

impl MockProtocolClient {
    pub fn new(scripts: Vec<MockConnect>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connect_count: AtomicUsize::new(0),
            live_connections: Arc::new(AtomicUsize::new(0)),
            logout_count: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Connections opened but not yet closed. The orchestration invariant is
    /// that this never exceeds 1 per session.
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Relaxed)
    }

    pub fn logout_count(&self) -> usize {
        self.logout_count.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn connect(
        &self,
        session_id: &SessionId,
        _credentials: Option<&[u8]>,
    ) -> Result<ProtocolSession, ProtocolError> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        let script = self.scripts.lock().pop_front();
        let session = match script {
            Some(MockConnect::Session(s)) => s,
            Some(MockConnect::Fail(e)) => return Err(e),
            None => {
                return Err(ProtocolError::Handshake(format!(
                    "no script left for session {session_id}"
                )))
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let feeder = tx.clone();
        tokio::spawn(async move {
            for (delay, event) in session.events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if feeder.send(event).await.is_err() {
                    break;
                }
            }
        });

        self.live_connections.fetch_add(1, Ordering::Relaxed);

        let connection = Arc::new(MockConnection {
            send_results: Mutex::new(session.send_results.into()),
            send_seq: AtomicUsize::new(0),
            // Held so the event stream stays open after the script is
            // exhausted; a real connection does not end just because it has
            // nothing to say. Dropped on close().
            events_tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            live_connections: Arc::clone(&self.live_connections),
            logout_count: Arc::clone(&self.logout_count),
            sent: Arc::clone(&self.sent),
        });

        Ok(ProtocolSession {
            connection,
            events: rx,
        })
    }
}

struct MockConnection {
    send_results: Mutex<VecDeque<Result<String, SendError>>>,
    send_seq: AtomicUsize,
    events_tx: Mutex<Option<mpsc::Sender<ProtocolEvent>>>,
    closed: AtomicBool,
    live_connections: Arc<AtomicUsize>,
    logout_count: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<SentRecord>>>,
}

impl MockConnection {
    fn next_send(&self, to: &str, body: &str) -> Result<String, SendError> {
        let result = self.send_results.lock().pop_front().unwrap_or_else(|| {
            Ok(format!(
                "mock_{}",
                self.send_seq.fetch_add(1, Ordering::Relaxed)
            ))
        });
        if result.is_ok() {
            self.sent.lock().push(SentRecord {
                to: to.to_string(),
                body: body.to_string(),
            });
        }
        result
    }
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    async fn send_text(&self, to: &str, text: &str) -> Result<String, SendError> {
        self.next_send(to, text)
    }

    async fn send_media(
        &self,
        to: &str,
        bytes: Bytes,
        caption: Option<&str>,
    ) -> Result<String, SendError> {
        let body = format!("media:{}b:{}", bytes.len(), caption.unwrap_or(""));
        self.next_send(to, &body)
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logout_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.events_tx.lock().take();
            self.live_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_event() -> ProtocolEvent {
        ProtocolEvent::Opened {
            identity: "15550001".into(),
        }
    }

    #[tokio::test]
    async fn replays_scripted_events() {
        let client = MockProtocolClient::new(vec![MockConnect::Session(MockSession::new(vec![
            (Duration::ZERO, open_event()),
            (Duration::from_millis(10), ProtocolEvent::Closed { code: 408 }),
        ]))]);

        let mut session = client
            .connect(&SessionId::from_raw("a"), None)
            .await
            .unwrap();

        assert!(matches!(
            session.events.recv().await,
            Some(ProtocolEvent::Opened { .. })
        ));
        assert!(matches!(
            session.events.recv().await,
            Some(ProtocolEvent::Closed { code: 408 })
        ));
        assert_eq!(client.connect_count(), 1);
    }

    #[tokio::test]
    async fn tracks_live_connections() {
        let client = MockProtocolClient::new(vec![MockConnect::Session(MockSession::new(vec![]))]);
        let session = client
            .connect(&SessionId::from_raw("a"), None)
            .await
            .unwrap();
        assert_eq!(client.live_connections(), 1);

        session.connection.close().await;
        session.connection.close().await; // Idempotent
        assert_eq!(client.live_connections(), 0);
    }

    #[tokio::test]
    async fn scripted_send_results_then_default() {
        let client = MockProtocolClient::new(vec![MockConnect::Session(
            MockSession::new(vec![]).with_send_results(vec![
                Err(SendError::Timeout),
                Ok("id1".into()),
            ]),
        )]);
        let session = client
            .connect(&SessionId::from_raw("a"), None)
            .await
            .unwrap();

        assert!(session.connection.send_text("x", "1").await.is_err());
        assert_eq!(session.connection.send_text("x", "2").await.unwrap(), "id1");
        // Script exhausted: generated id
        assert!(session
            .connection
            .send_text("x", "3")
            .await
            .unwrap()
            .starts_with("mock_"));
        assert_eq!(client.sent().len(), 2);
    }

    #[tokio::test]
    async fn event_stream_outlives_the_script() {
        let client = MockProtocolClient::new(vec![MockConnect::Session(MockSession::new(vec![(
            Duration::ZERO,
            open_event(),
        )]))]);
        let mut session = client
            .connect(&SessionId::from_raw("a"), None)
            .await
            .unwrap();

        assert!(matches!(
            session.events.recv().await,
            Some(ProtocolEvent::Opened { .. })
        ));

        // Script exhausted, but the connection is still up: the stream must
        // stay open rather than reporting a closure that never happened.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            session.events.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        // Only close() ends the stream
        session.connection.close().await;
        assert!(session.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_scripts_fail_handshake() {
        let client = MockProtocolClient::new(vec![]);
        let result = client.connect(&SessionId::from_raw("a"), None).await;
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
    }
}
