//! A worker hosts a partition of sessions and executes actions dispatched by
//! the coordinator.
//!
//! The mailbox loop never blocks: mutating actions (start, disconnect) are
//! handled inline because they must observe and update the resident map
//! atomically with respect to each other, while sends run as spawned tasks so
//! a slow delivery only stalls its own caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::errors::ActionError;
use relay_core::ids::{CorrelationId, SessionId};
use relay_core::ipc::{Action, ActionReply, ActionRequest, WorkerEvent};
use relay_core::protocol::{ProtocolClient, SendError};
use relay_core::session::SessionStatus;
use relay_store::CredentialRepo;

use crate::machine::{ConnectionMachine, MachineConfig, SessionShared};
use crate::persist::PersistConfig;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub mailbox_capacity: usize,
    /// Ceiling a send waits for the session to become connected.
    pub connected_wait: Duration,
    pub send_attempts: u32,
    pub send_attempt_timeout: Duration,
    pub send_retry_delay: Duration,
    pub machine: MachineConfig,
    pub persist: PersistConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            connected_wait: Duration::from_secs(20),
            send_attempts: 3,
            send_attempt_timeout: Duration::from_secs(10),
            send_retry_delay: Duration::from_secs(1),
            machine: MachineConfig::default(),
            persist: PersistConfig::default(),
        }
    }
}

/// Coordinator-side handle to one worker.
pub struct WorkerHandle {
    pub index: usize,
    pub mailbox: mpsc::Sender<ActionRequest>,
    pub token: CancellationToken,
    pub join: JoinHandle<()>,
}

/// Spawn a worker task for partition `index`.
pub fn spawn(
    index: usize,
    client: Arc<dyn ProtocolClient>,
    creds: CredentialRepo,
    events_tx: mpsc::Sender<WorkerEvent>,
    config: WorkerConfig,
) -> WorkerHandle {
    let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity);
    let token = CancellationToken::new();
    let worker = Worker {
        index,
        client,
        creds,
        events_tx,
        config,
        sessions: Arc::new(DashMap::new()),
        token: token.clone(),
    };
    let join = tokio::spawn(worker.run(mailbox_rx));
    WorkerHandle {
        index,
        mailbox: mailbox_tx,
        token,
        join,
    }
}

struct Worker {
    index: usize,
    client: Arc<dyn ProtocolClient>,
    creds: CredentialRepo,
    events_tx: mpsc::Sender<WorkerEvent>,
    config: WorkerConfig,
    sessions: Arc<DashMap<SessionId, Arc<SessionShared>>>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self, mut mailbox: mpsc::Receiver<ActionRequest>) {
        info!(worker = self.index, "worker started");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                req = mailbox.recv() => match req {
                    None => break,
                    Some(req) => self.dispatch(req).await,
                },
            }
        }
        // Session tokens are children of the worker token, so this tears
        // down every resident machine.
        self.token.cancel();
        info!(worker = self.index, "worker stopped");
    }

    async fn dispatch(&self, req: ActionRequest) {
        debug!(worker = self.index, session_id = %req.session_id, action = req.action.name(), "dispatch");
        match req.action {
            Action::Start => self.handle_start(req.request_id, req.session_id).await,
            Action::GetStatus => self.handle_status(req.request_id, req.session_id).await,
            Action::Disconnect => self.handle_disconnect(req.request_id, req.session_id).await,
            Action::SendText { to, text } => {
                self.handle_send(req.request_id, req.session_id, SendPayload::Text { to, text })
                    .await
            }
            Action::SendMedia { to, bytes, caption } => {
                self.handle_send(
                    req.request_id,
                    req.session_id,
                    SendPayload::Media { to, bytes, caption },
                )
                .await
            }
        }
    }

    /// Idempotent: a session already resident reports its current status and
    /// nothing else happens. Otherwise the session is created, claimed
    /// immediately (before the handshake, so racing requests converge here),
    /// and connecting begins in the background.
    async fn handle_start(&self, request_id: CorrelationId, session_id: SessionId) {
        let existing = self
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()));

        let status = match existing {
            Some(shared) => shared.status(),
            None => {
                let shared = SessionShared::new(session_id.clone(), self.token.child_token());
                self.sessions.insert(session_id.clone(), Arc::clone(&shared));
                let _ = self
                    .events_tx
                    .send(WorkerEvent::Claim {
                        session_id: session_id.clone(),
                        worker: self.index,
                    })
                    .await;

                let machine = ConnectionMachine::new(
                    shared,
                    Arc::clone(&self.client),
                    self.creds.clone(),
                    self.config.persist.clone(),
                    self.config.machine.clone(),
                    self.index,
                    self.events_tx.clone(),
                    Arc::clone(&self.sessions),
                );
                tokio::spawn(machine.run());
                SessionStatus::Initializing
            }
        };

        self.reply(ActionReply::ok(request_id, json!({ "status": status.to_string() })))
            .await;
    }

    async fn handle_status(&self, request_id: CorrelationId, session_id: SessionId) {
        let snapshot = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().snapshot());

        let reply = match snapshot {
            Some(snap) => match serde_json::to_value(&snap) {
                Ok(value) => ActionReply::ok(request_id, value),
                Err(e) => ActionReply::err(request_id, &ActionError::Internal(e.to_string())),
            },
            None => ActionReply::err(request_id, &ActionError::NotFound(session_id.to_string())),
        };
        self.reply(reply).await;
    }

    /// Best-effort logout, then unconditional removal and release. The caller
    /// always sees success.
    async fn handle_disconnect(&self, request_id: CorrelationId, session_id: SessionId) {
        if let Some((_, shared)) = self.sessions.remove(&session_id) {
            let _ = self
                .events_tx
                .send(WorkerEvent::Release {
                    session_id: session_id.clone(),
                    worker: self.index,
                })
                .await;

            let conn = shared.connection();
            let token = shared.cancel_token().clone();
            tokio::spawn(async move {
                if let Some(conn) = conn {
                    if let Err(e) = conn.logout().await {
                        warn!(session_id = %session_id, error = %e, "logout failed, removing anyway");
                    }
                }
                token.cancel();
            });
        }
        self.reply(ActionReply::ok(request_id, json!({ "ok": true })))
            .await;
    }

    async fn handle_send(&self, request_id: CorrelationId, session_id: SessionId, payload: SendPayload) {
        let shared = self
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()));

        let Some(shared) = shared else {
            self.reply(ActionReply::err(
                request_id,
                &ActionError::NotAvailable(session_id.to_string()),
            ))
            .await;
            return;
        };

        let config = self.config.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = match run_send(&shared, payload, &config).await {
                Ok(data) => ActionReply::ok(request_id, data),
                Err(e) => ActionReply::err(request_id, &e),
            };
            let _ = events_tx.send(WorkerEvent::Reply(reply)).await;
        });
    }

    async fn reply(&self, reply: ActionReply) {
        let _ = self.events_tx.send(WorkerEvent::Reply(reply)).await;
    }
}

enum SendPayload {
    Text {
        to: String,
        text: String,
    },
    Media {
        to: String,
        bytes: Bytes,
        caption: Option<String>,
    },
}

/// Wait for `connected` (bounded), then deliver with bounded retries.
async fn run_send(
    shared: &SessionShared,
    payload: SendPayload,
    config: &WorkerConfig,
) -> Result<serde_json::Value, ActionError> {
    wait_connected(shared, config.connected_wait).await?;

    let mut attempts_used = 0;
    for attempt in 1..=config.send_attempts {
        attempts_used = attempt;

        let Some(conn) = shared.connection() else {
            // Handle mid-swap during a reconnect; counts as a transient miss.
            tokio::time::sleep(config.send_retry_delay).await;
            continue;
        };

        let send = async {
            match &payload {
                SendPayload::Text { to, text } => conn.send_text(to, text).await,
                SendPayload::Media { to, bytes, caption } => {
                    conn.send_media(to, bytes.clone(), caption.as_deref()).await
                }
            }
        };

        match tokio::time::timeout(config.send_attempt_timeout, send).await {
            Ok(Ok(message_id)) => {
                return Ok(json!({ "id": message_id, "delivered": true }));
            }
            Ok(Err(SendError::Unreachable(reason))) => {
                return Err(ActionError::RecipientUnreachable(reason));
            }
            Ok(Err(e)) => {
                warn!(session_id = %shared.id, attempt, error = %e, "send attempt failed");
            }
            Err(_) => {
                warn!(session_id = %shared.id, attempt, "send attempt timed out");
            }
        }

        if attempt < config.send_attempts {
            tokio::time::sleep(config.send_retry_delay).await;
        }
    }

    Err(ActionError::TransportTimeout {
        attempts: attempts_used,
    })
}

/// Block this action (only) until the session transitions into `connected`,
/// signaled by the status watch channel rather than polling.
async fn wait_connected(shared: &SessionShared, ceiling: Duration) -> Result<(), ActionError> {
    let mut rx = shared.subscribe();
    let wait = async {
        loop {
            let status = *rx.borrow_and_update();
            match status {
                SessionStatus::Connected => return Ok(()),
                s if s.is_terminal() => {
                    return Err(ActionError::NotAvailable(shared.id.to_string()))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ActionError::NotAvailable(shared.id.to_string()));
            }
        }
    };

    match tokio::time::timeout(ceiling, wait).await {
        Ok(result) => result,
        Err(_) => Err(ActionError::NotConnected(ceiling)),
    }
}
