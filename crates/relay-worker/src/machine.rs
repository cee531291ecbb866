//! Per-session connection lifecycle.
//!
//! Each resident session is driven by exactly one machine task: it owns the
//! protocol handle, consumes the typed event stream, and is the sole writer
//! of the session's state. Reconnection is a loop inside this single task, so
//! overlapping close events can never spawn parallel handshakes for the same
//! id.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::events::SessionEvent;
use relay_core::ids::SessionId;
use relay_core::ipc::WorkerEvent;
use relay_core::protocol::{
    classify_close, close, CloseClass, ProtocolClient, ProtocolConnection, ProtocolEvent,
};
use relay_core::session::{SessionSnapshot, SessionStatus};
use relay_store::CredentialRepo;

use crate::backoff::ReconnectPolicy;
use crate::persist::{PersistConfig, PersistenceCoordinator};

#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Validity window of a pairing code.
    pub qr_ttl: Duration,
    /// How long a connection must hold before it counts as stable.
    pub stable_dwell: Duration,
    pub reconnect: ReconnectPolicy,
    /// Trailing window (entry count) for inbound message-id dedup.
    pub dedup_window: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            qr_ttl: Duration::from_secs(60),
            stable_dwell: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            dedup_window: 64,
        }
    }
}

struct Inner {
    identity: Option<String>,
    pairing_code: Option<String>,
    qr_expires_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    connected_at: Option<DateTime<Utc>>,
    stable: bool,
}

/// State shared between a session's machine task and the worker's action
/// handlers. The machine writes; handlers read and wait on the status channel.
pub struct SessionShared {
    pub id: SessionId,
    status_tx: watch::Sender<SessionStatus>,
    inner: Mutex<Inner>,
    connection: Mutex<Option<Arc<dyn ProtocolConnection>>>,
    cancel: CancellationToken,
}

impl SessionShared {
    pub fn new(id: SessionId, cancel: CancellationToken) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::Initializing);
        Arc::new(Self {
            id,
            status_tx,
            inner: Mutex::new(Inner {
                identity: None,
                pairing_code: None,
                qr_expires_at: None,
                reconnect_attempts: 0,
                connected_at: None,
                stable: false,
            }),
            connection: Mutex::new(None),
            cancel,
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Wait primitive for action handlers: signaled on every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn connection(&self) -> Option<Arc<dyn ProtocolConnection>> {
        self.connection.lock().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            status: self.status(),
            identity: inner.identity.clone(),
            pairing_code: inner.pairing_code.clone(),
            qr_expires_at: inner.qr_expires_at,
            reconnect_attempts: inner.reconnect_attempts,
            connected_at: inner.connected_at,
            stable: inner.stable,
        }
    }

    fn set_status(&self, status: SessionStatus) {
        self.status_tx.send_replace(status);
    }

    fn set_connection(&self, conn: Arc<dyn ProtocolConnection>) {
        *self.connection.lock() = Some(conn);
    }

    fn take_connection(&self) -> Option<Arc<dyn ProtocolConnection>> {
        self.connection.lock().take()
    }

    fn on_pairing(&self, code: String, expires_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.pairing_code = Some(code);
        inner.qr_expires_at = Some(expires_at);
    }

    fn on_connected(&self, identity: String) {
        let mut inner = self.inner.lock();
        inner.identity = Some(identity);
        inner.pairing_code = None;
        inner.qr_expires_at = None;
        inner.reconnect_attempts = 0;
        inner.connected_at = Some(Utc::now());
        inner.stable = false;
    }

    fn mark_stable(&self) {
        if self.status() == SessionStatus::Connected {
            self.inner.lock().stable = true;
        }
    }

    fn bump_attempts(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.stable = false;
        inner.reconnect_attempts += 1;
        inner.reconnect_attempts
    }
}

/// What ended one connection's event stream.
enum Outcome {
    Closed(u16),
    LoggedOut,
    Expired,
    Cancelled,
}

pub struct ConnectionMachine {
    shared: Arc<SessionShared>,
    client: Arc<dyn ProtocolClient>,
    creds: CredentialRepo,
    persist: PersistenceCoordinator,
    config: MachineConfig,
    worker: usize,
    events_tx: mpsc::Sender<WorkerEvent>,
    sessions: Arc<DashMap<SessionId, Arc<SessionShared>>>,
    recent_ids: HashSet<String>,
    recent_order: VecDeque<String>,
}

impl ConnectionMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<SessionShared>,
        client: Arc<dyn ProtocolClient>,
        creds: CredentialRepo,
        persist_config: PersistConfig,
        config: MachineConfig,
        worker: usize,
        events_tx: mpsc::Sender<WorkerEvent>,
        sessions: Arc<DashMap<SessionId, Arc<SessionShared>>>,
    ) -> Self {
        let persist = PersistenceCoordinator::new(
            shared.id.clone(),
            Arc::new(creds.clone()),
            persist_config,
        );
        Self {
            shared,
            client,
            creds,
            persist,
            config,
            worker,
            events_tx,
            sessions,
            recent_ids: HashSet::new(),
            recent_order: VecDeque::new(),
        }
    }

    /// Run until the session reaches a terminal state or is cancelled.
    pub async fn run(mut self) {
        let id = self.shared.id.clone();

        loop {
            // Tear down any prior handle before a new attempt
            if let Some(conn) = self.shared.take_connection() {
                conn.close().await;
            }
            if self.shared.cancel.is_cancelled() {
                self.finish(Outcome::Cancelled).await;
                return;
            }

            let blob = match self.creds.load(&id) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "credential load failed, pairing fresh");
                    None
                }
            };

            let connected = tokio::select! {
                _ = self.shared.cancel.cancelled() => None,
                result = self.client.connect(&id, blob.as_deref()) => Some(result),
            };

            let outcome = match connected {
                None => Outcome::Cancelled,
                Some(Err(e)) => {
                    warn!(session_id = %id, error = %e, "handshake failed");
                    Outcome::Closed(close::STREAM_ENDED)
                }
                Some(Ok(session)) => {
                    self.shared.set_connection(Arc::clone(&session.connection));
                    self.drive(session.events).await
                }
            };

            match outcome {
                Outcome::Cancelled => {
                    self.finish(Outcome::Cancelled).await;
                    return;
                }
                Outcome::LoggedOut => {
                    info!(session_id = %id, "logged out, releasing session");
                    self.shared.set_status(SessionStatus::LoggedOut);
                    let _ = self.creds.set_status(&id, "logged_out");
                    self.notify(SessionEvent::LoggedOut {
                        session_id: id.clone(),
                    })
                    .await;
                    self.finish(Outcome::LoggedOut).await;
                    return;
                }
                Outcome::Expired => {
                    info!(session_id = %id, "pairing code expired");
                    self.shared.set_status(SessionStatus::Expired);
                    self.notify(SessionEvent::Disconnected {
                        session_id: id.clone(),
                        reason: "pairing_expired".into(),
                    })
                    .await;
                    self.finish(Outcome::Expired).await;
                    return;
                }
                Outcome::Closed(code) => {
                    let class = classify_close(code);
                    let attempt = self.shared.bump_attempts();
                    match self.config.reconnect.delay(class, attempt) {
                        Some(delay) => {
                            info!(
                                session_id = %id,
                                code,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "connection closed, reconnecting"
                            );
                            self.shared.set_status(SessionStatus::Reconnecting);
                            tokio::select! {
                                _ = self.shared.cancel.cancelled() => {
                                    self.finish(Outcome::Cancelled).await;
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            warn!(session_id = %id, code, attempt, "reconnect budget exhausted");
                            self.shared.set_status(SessionStatus::Terminated);
                            self.notify(SessionEvent::Disconnected {
                                session_id: id.clone(),
                                reason: format!("retry_exhausted:{code}"),
                            })
                            .await;
                            self.finish(Outcome::Closed(code)).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Consume one connection's events until it closes or a timer fires.
    async fn drive(&mut self, mut events: mpsc::Receiver<ProtocolEvent>) -> Outcome {
        let mut qr_deadline: Option<Instant> = None;
        let mut dwell_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return Outcome::Cancelled,

                event = events.recv() => match event {
                    None => return Outcome::Closed(close::STREAM_ENDED),
                    Some(ProtocolEvent::PairingCode { code }) => {
                        let expires_at = Utc::now()
                            + chrono::Duration::from_std(self.config.qr_ttl)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        self.shared.on_pairing(code.clone(), expires_at);
                        self.shared.set_status(SessionStatus::QrReady);
                        qr_deadline = Some(Instant::now() + self.config.qr_ttl);
                        self.notify(SessionEvent::PairingReady {
                            session_id: self.shared.id.clone(),
                            code,
                            expires_in_seconds: self.config.qr_ttl.as_secs(),
                        })
                        .await;
                    }
                    Some(ProtocolEvent::Opened { identity }) => {
                        self.shared.on_connected(identity.clone());
                        self.shared.set_status(SessionStatus::Connected);
                        qr_deadline = None;
                        dwell_deadline = Some(Instant::now() + self.config.stable_dwell);
                        let _ = self.creds.set_status(&self.shared.id, "connected");
                        info!(session_id = %self.shared.id, identity = %identity, "session connected");
                        self.notify(SessionEvent::Connected {
                            session_id: self.shared.id.clone(),
                            identity,
                        })
                        .await;
                    }
                    Some(ProtocolEvent::Closed { code }) => {
                        return match classify_close(code) {
                            CloseClass::LoggedOut => Outcome::LoggedOut,
                            _ => Outcome::Closed(code),
                        };
                    }
                    Some(ProtocolEvent::Message(msg)) => {
                        if self.remember(&msg.id) {
                            self.notify(SessionEvent::MessageReceived {
                                session_id: self.shared.id.clone(),
                                id: msg.id,
                                from: msg.from,
                                content: msg.content.summary(),
                                timestamp: msg.timestamp,
                            })
                            .await;
                        } else {
                            debug!(session_id = %self.shared.id, message_id = %msg.id, "dropping redelivered message");
                        }
                    }
                    Some(ProtocolEvent::Credentials { blob, critical }) => {
                        if critical {
                            self.persist.force(blob).await;
                        } else {
                            self.persist.soft(blob);
                        }
                    }
                },

                _ = tokio::time::sleep_until(deadline_or_far(qr_deadline)), if qr_deadline.is_some() => {
                    return Outcome::Expired;
                }

                _ = tokio::time::sleep_until(deadline_or_far(dwell_deadline)), if dwell_deadline.is_some() => {
                    self.shared.mark_stable();
                    dwell_deadline = None;
                }
            }
        }
    }

    /// Dedup inbound message ids over a bounded trailing window.
    /// Returns true for first sightings.
    fn remember(&mut self, message_id: &str) -> bool {
        if self.recent_ids.contains(message_id) {
            return false;
        }
        self.recent_ids.insert(message_id.to_string());
        self.recent_order.push_back(message_id.to_string());
        while self.recent_order.len() > self.config.dedup_window {
            if let Some(evicted) = self.recent_order.pop_front() {
                self.recent_ids.remove(&evicted);
            }
        }
        true
    }

    async fn notify(&self, event: SessionEvent) {
        let _ = self.events_tx.send(WorkerEvent::Session(event)).await;
    }

    /// Common teardown: drop the handle, remove the session from the
    /// worker's resident map, and release ownership unless the worker
    /// already did (disconnect / shutdown paths cancel first).
    async fn finish(&self, outcome: Outcome) {
        if let Some(conn) = self.shared.take_connection() {
            conn.close().await;
        }
        self.sessions.remove(&self.shared.id);
        if !matches!(outcome, Outcome::Cancelled) {
            let _ = self
                .events_tx
                .send(WorkerEvent::Release {
                    session_id: self.shared.id.clone(),
                    worker: self.worker,
                })
                .await;
        }
    }
}

fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::mock::{MockConnect, MockProtocolClient, MockSession};
    use relay_core::protocol::{InboundMessage, MessageContent, SendError};
    use relay_store::Database;

    struct Harness {
        client: Arc<MockProtocolClient>,
        shared: Arc<SessionShared>,
        events_rx: mpsc::Receiver<WorkerEvent>,
        sessions: Arc<DashMap<SessionId, Arc<SessionShared>>>,
    }

    fn fast_config() -> MachineConfig {
        MachineConfig {
            qr_ttl: Duration::from_millis(60),
            stable_dwell: Duration::from_millis(40),
            reconnect: ReconnectPolicy {
                linear_increment: Duration::from_millis(10),
                linear_max_attempts: 2,
                conflict_base: Duration::from_millis(10),
                conflict_cap: Duration::from_millis(40),
                conflict_max_attempts: 1,
            },
            dedup_window: 4,
        }
    }

    fn start(scripts: Vec<MockConnect>, config: MachineConfig) -> Harness {
        let client = Arc::new(MockProtocolClient::new(scripts));
        let creds = CredentialRepo::new(Database::in_memory().unwrap());
        let (events_tx, events_rx) = mpsc::channel(256);
        let sessions: Arc<DashMap<SessionId, Arc<SessionShared>>> = Arc::new(DashMap::new());

        let shared = SessionShared::new(SessionId::from_raw("acct"), CancellationToken::new());
        sessions.insert(shared.id.clone(), Arc::clone(&shared));

        let machine = ConnectionMachine::new(
            Arc::clone(&shared),
            Arc::clone(&client) as Arc<dyn ProtocolClient>,
            creds,
            PersistConfig {
                debounce: Duration::from_millis(30),
                retry_delay: Duration::from_millis(10),
            },
            config,
            0,
            events_tx,
            Arc::clone(&sessions),
        );
        tokio::spawn(machine.run());

        Harness {
            client,
            shared,
            events_rx,
            sessions,
        }
    }

    fn opened() -> ProtocolEvent {
        ProtocolEvent::Opened {
            identity: "15550001".into(),
        }
    }

    async fn collect_session_events(rx: &mut mpsc::Receiver<WorkerEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let WorkerEvent::Session(ev) = ev {
                out.push(ev);
            }
        }
        out
    }

    #[tokio::test]
    async fn pairing_code_then_expiry() {
        let mut h = start(
            vec![MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                ProtocolEvent::PairingCode { code: "2@abc".into() },
            )]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.shared.status(), SessionStatus::QrReady);
        assert_eq!(h.shared.snapshot().pairing_code.as_deref(), Some("2@abc"));

        // Expiry timer fires while still unconnected
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(h.shared.status(), SessionStatus::Expired);
        assert!(h.sessions.is_empty());
        assert_eq!(h.client.live_connections(), 0);

        let events = collect_session_events(&mut h.events_rx).await;
        assert_eq!(events[0].event_type(), "pairing_ready");
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected { reason, .. } if reason == "pairing_expired")));
    }

    #[tokio::test]
    async fn connect_marks_stable_after_dwell() {
        let h = start(
            vec![MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                opened(),
            )]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.shared.status(), SessionStatus::Connected);
        assert!(!h.shared.snapshot().stable);
        assert_eq!(h.shared.snapshot().identity.as_deref(), Some("15550001"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.shared.snapshot().stable);
        assert_eq!(h.shared.snapshot().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn consecutive_failed_reconnects_terminate() {
        // Every connection closes before opening, so the attempt counter is
        // never reset. linear_max_attempts = 2: two retries, then the third
        // close exhausts the budget.
        let script = || {
            MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                ProtocolEvent::Closed { code: 408 },
            )]))
        };
        let mut h = start(vec![script(), script(), script()], fast_config());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.shared.status(), SessionStatus::Terminated);
        assert_eq!(h.client.connect_count(), 3);
        assert_eq!(h.client.live_connections(), 0);
        assert!(h.sessions.is_empty());

        let events = collect_session_events(&mut h.events_rx).await;
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Disconnected { reason, .. } if reason.starts_with("retry_exhausted")))
            .collect();
        assert_eq!(terminal.len(), 1, "terminal notification emitted exactly once");
    }

    #[tokio::test]
    async fn successful_open_resets_the_reconnect_budget() {
        // A close after a successful open starts a fresh budget: fail (1),
        // open-then-close (reset, 1), fail (2), fail (3 > max) — four
        // connects before giving up, not three.
        let fail = || {
            MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                ProtocolEvent::Closed { code: 408 },
            )]))
        };
        let flap = MockConnect::Session(MockSession::new(vec![
            (Duration::ZERO, opened()),
            (Duration::from_millis(10), ProtocolEvent::Closed { code: 408 }),
        ]));
        let h = start(vec![fail(), flap, fail(), fail()], fast_config());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.shared.status(), SessionStatus::Terminated);
        assert_eq!(h.client.connect_count(), 4);
    }

    #[tokio::test]
    async fn logged_out_close_is_absorbing() {
        let mut h = start(
            vec![MockConnect::Session(MockSession::new(vec![
                (Duration::ZERO, opened()),
                (Duration::from_millis(10), ProtocolEvent::Closed { code: close::LOGGED_OUT }),
            ]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.shared.status(), SessionStatus::LoggedOut);
        // No reconnect attempt after logout
        assert_eq!(h.client.connect_count(), 1);
        assert!(h.sessions.is_empty());

        let mut released = false;
        let mut logged_out_events = 0;
        while let Ok(ev) = h.events_rx.try_recv() {
            match ev {
                WorkerEvent::Release { .. } => released = true,
                WorkerEvent::Session(SessionEvent::LoggedOut { .. }) => logged_out_events += 1,
                _ => {}
            }
        }
        assert!(released);
        assert_eq!(logged_out_events, 1);
    }

    #[tokio::test]
    async fn conflict_close_retries_with_smaller_budget() {
        // conflict_max_attempts = 1: one reconnect, then terminated.
        let script = || {
            MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                ProtocolEvent::Closed { code: close::CONFLICT },
            )]))
        };
        let h = start(vec![script(), script(), script()], fast_config());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.shared.status(), SessionStatus::Terminated);
        assert_eq!(h.client.connect_count(), 2);
    }

    #[tokio::test]
    async fn inbound_messages_deduplicated() {
        let msg = |id: &str| {
            ProtocolEvent::Message(InboundMessage {
                id: id.into(),
                from: "15550002".into(),
                content: MessageContent::Text("hi".into()),
                timestamp: 1_700_000_000,
            })
        };
        let mut h = start(
            vec![MockConnect::Session(MockSession::new(vec![
                (Duration::ZERO, opened()),
                (Duration::ZERO, msg("m1")),
                (Duration::ZERO, msg("m1")),
                (Duration::ZERO, msg("m2")),
            ]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        let events = collect_session_events(&mut h.events_rx).await;
        let received: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::MessageReceived { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn media_message_forwards_placeholder() {
        let mut h = start(
            vec![MockConnect::Session(MockSession::new(vec![
                (Duration::ZERO, opened()),
                (
                    Duration::ZERO,
                    ProtocolEvent::Message(InboundMessage {
                        id: "m1".into(),
                        from: "x".into(),
                        content: MessageContent::Media { kind: "image".into() },
                        timestamp: 0,
                    }),
                ),
            ]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        let events = collect_session_events(&mut h.events_rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::MessageReceived { content, .. } if content == "[image]")));
    }

    #[tokio::test]
    async fn cancellation_tears_down_without_release() {
        let mut h = start(
            vec![MockConnect::Session(MockSession::new(vec![(
                Duration::ZERO,
                opened(),
            )]))],
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.shared.cancel_token().cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.client.live_connections(), 0);
        assert!(h.sessions.is_empty());
        while let Ok(ev) = h.events_rx.try_recv() {
            assert!(
                !matches!(ev, WorkerEvent::Release { .. }),
                "cancelled machine must not release; the worker already did"
            );
        }
    }

    #[tokio::test]
    async fn send_results_unused_by_machine() {
        // The machine never sends; the worker does. This pins the seam.
        let h = start(
            vec![MockConnect::Session(
                MockSession::new(vec![(Duration::ZERO, opened())])
                    .with_send_results(vec![Err(SendError::Timeout)]),
            )],
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.client.sent().is_empty());
    }
}
