//! Worker pool lifecycle and request forwarding.
//!
//! The supervisor owns the ownership directory, the reply correlator, and one
//! mailbox per worker. Workers report upward on a single shared event
//! channel; the pump task applies claims and releases to the directory,
//! resolves replies, and hands session events to the webhook notifier. A
//! worker whose task exits is replaced in place: its claims are swept so
//! routing falls back to the hash, and the next start for any of its sessions
//! re-creates them from stored credentials.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::errors::ActionError;
use relay_core::ids::SessionId;
use relay_core::ipc::{Action, ActionRequest, WorkerEvent};
use relay_core::protocol::ProtocolClient;
use relay_store::CredentialRepo;
use relay_worker::worker::{self, WorkerConfig, WorkerHandle};

use crate::correlator::Correlator;
use crate::directory::OwnershipDirectory;
use crate::webhook::Notifier;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub workers: usize,
    /// Ceiling on waiting for any single worker reply.
    pub ipc_timeout: Duration,
    pub worker: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            ipc_timeout: Duration::from_secs(30),
            worker: WorkerConfig::default(),
        }
    }
}

struct Slot {
    mailbox: mpsc::Sender<ActionRequest>,
    token: CancellationToken,
}

struct Inner {
    directory: OwnershipDirectory,
    correlator: Correlator,
    notifier: Notifier,
    client: Arc<dyn ProtocolClient>,
    creds: CredentialRepo,
    config: SupervisorConfig,
    slots: Vec<Mutex<Slot>>,
    events_tx: mpsc::Sender<WorkerEvent>,
    shutdown: CancellationToken,
    started_at: Instant,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub workers: usize,
    pub resident_sessions: usize,
    pub pending_requests: usize,
    pub uptime_seconds: u64,
}

impl Supervisor {
    pub fn start(
        client: Arc<dyn ProtocolClient>,
        creds: CredentialRepo,
        notifier: Notifier,
        config: SupervisorConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let handles: Vec<WorkerHandle> = (0..config.workers)
            .map(|index| {
                worker::spawn(
                    index,
                    Arc::clone(&client),
                    creds.clone(),
                    events_tx.clone(),
                    config.worker.clone(),
                )
            })
            .collect();

        let slots = handles
            .iter()
            .map(|h| {
                Mutex::new(Slot {
                    mailbox: h.mailbox.clone(),
                    token: h.token.clone(),
                })
            })
            .collect();

        let inner = Arc::new(Inner {
            directory: OwnershipDirectory::new(config.workers),
            correlator: Correlator::new(),
            notifier,
            client,
            creds,
            config,
            slots,
            events_tx,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        });

        for handle in handles {
            tokio::spawn(supervise(Arc::clone(&inner), handle));
        }
        tokio::spawn(pump(Arc::clone(&inner), events_rx));

        log_stored_sessions(&inner.creds);

        Self { inner }
    }

    /// Route an action to the owning worker and await its reply.
    pub async fn forward(&self, session_id: SessionId, action: Action) -> Result<Value, ActionError> {
        let worker = self.inner.directory.route(&session_id);
        let mailbox = self.inner.slots[worker].lock().mailbox.clone();

        let (request_id, rx) = self.inner.correlator.register();
        debug!(session_id = %session_id, worker, action = action.name(), request_id = %request_id, "forward");

        let request = ActionRequest {
            request_id: request_id.clone(),
            session_id,
            action,
        };
        if mailbox.send(request).await.is_err() {
            self.inner.correlator.abandon(&request_id);
            return Err(ActionError::WorkerUnavailable(worker));
        }

        self.inner
            .correlator
            .wait(&request_id, rx, self.inner.config.ipc_timeout)
            .await?
            .into_result()
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            workers: self.inner.config.workers,
            resident_sessions: self.inner.directory.claim_count(),
            pending_requests: self.inner.correlator.pending_count(),
            uptime_seconds: self.inner.started_at.elapsed().as_secs(),
        }
    }

    /// Stop every worker and the pump. Resident sessions are torn down; their
    /// credentials stay in the store for the next run.
    pub fn shutdown(&self) {
        info!("shutting down worker pool");
        self.inner.shutdown.cancel();
        for slot in &self.inner.slots {
            slot.lock().token.cancel();
        }
    }
}

/// Watch one worker generation; replace it when its task ends outside of
/// shutdown.
async fn supervise(inner: Arc<Inner>, mut handle: WorkerHandle) {
    loop {
        let index = handle.index;
        let result = handle.join.await;
        if inner.shutdown.is_cancelled() {
            return;
        }

        match result {
            Ok(()) => warn!(worker = index, "worker exited unexpectedly"),
            Err(e) => warn!(worker = index, error = %e, "worker task failed"),
        }
        // Tear down any sessions the old generation left running
        handle.token.cancel();

        let dropped = inner.directory.release_worker(index);
        if dropped > 0 {
            warn!(
                worker = index,
                sessions = dropped,
                "sessions lost residency; the next start recreates them from stored credentials"
            );
        }

        handle = worker::spawn(
            index,
            Arc::clone(&inner.client),
            inner.creds.clone(),
            inner.events_tx.clone(),
            inner.config.worker.clone(),
        );
        *inner.slots[index].lock() = Slot {
            mailbox: handle.mailbox.clone(),
            token: handle.token.clone(),
        };
        info!(worker = index, "worker replaced");
    }
}

/// Apply upward worker traffic: claims and releases mutate the directory,
/// replies resolve the correlator, session events go out the webhook.
async fn pump(inner: Arc<Inner>, mut events_rx: mpsc::Receiver<WorkerEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            WorkerEvent::Claim { session_id, worker } => {
                inner.directory.claim(session_id, worker);
            }
            WorkerEvent::Release { session_id, worker } => {
                inner.directory.release_if(&session_id, worker);
            }
            WorkerEvent::Reply(reply) => {
                inner.correlator.complete(reply);
            }
            WorkerEvent::Session(event) => {
                inner.notifier.dispatch(event);
            }
        }
    }
}

fn log_stored_sessions(creds: &CredentialRepo) {
    match creds.list() {
        Ok(records) => {
            let restorable = records
                .iter()
                .filter(|r| r.status != "logged_out")
                .count();
            if restorable > 0 {
                info!(
                    count = restorable,
                    "stored credentials found; sessions reconnect on their next start"
                );
            }
        }
        Err(e) => warn!(error = %e, "could not list stored credentials"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::mock::{MockConnect, MockProtocolClient, MockSession};
    use relay_core::protocol::{close, ProtocolEvent};
    use relay_store::Database;
    use relay_worker::machine::MachineConfig;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            workers: 2,
            ipc_timeout: Duration::from_secs(2),
            worker: WorkerConfig {
                connected_wait: Duration::from_millis(200),
                send_retry_delay: Duration::from_millis(10),
                machine: MachineConfig {
                    qr_ttl: Duration::from_millis(500),
                    stable_dwell: Duration::from_millis(20),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn opened_script() -> MockConnect {
        MockConnect::Session(MockSession::new(vec![(
            Duration::ZERO,
            ProtocolEvent::Opened {
                identity: "15550001".into(),
            },
        )]))
    }

    fn start_pool(scripts: Vec<MockConnect>) -> (Supervisor, Arc<MockProtocolClient>) {
        let client = Arc::new(MockProtocolClient::new(scripts));
        let creds = CredentialRepo::new(Database::in_memory().unwrap());
        let supervisor = Supervisor::start(
            Arc::clone(&client) as Arc<dyn ProtocolClient>,
            creds,
            Notifier::new(None),
            fast_config(),
        );
        (supervisor, client)
    }

    #[tokio::test]
    async fn start_claims_and_status_follows() {
        let (sup, client) = start_pool(vec![opened_script()]);
        let id = SessionId::from_raw("acct");

        let value = sup.forward(id.clone(), Action::Start).await.unwrap();
        assert_eq!(value["status"], "initializing");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            sup.inner.directory.claimed(&id),
            Some(sup.inner.directory.hash_route(&id))
        );

        let status = sup.forward(id, Action::GetStatus).await.unwrap();
        assert_eq!(status["status"], "connected");
        assert_eq!(client.connect_count(), 1);
    }

    #[tokio::test]
    async fn status_for_unknown_session_is_not_found() {
        let (sup, _client) = start_pool(vec![]);
        let err = sup
            .forward(SessionId::from_raw("ghost"), Action::GetStatus)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn logout_releases_the_claim() {
        let (sup, _client) = start_pool(vec![MockConnect::Session(MockSession::new(vec![
            (
                Duration::ZERO,
                ProtocolEvent::Opened {
                    identity: "x".into(),
                },
            ),
            (
                Duration::from_millis(30),
                ProtocolEvent::Closed {
                    code: close::LOGGED_OUT,
                },
            ),
        ]))]);
        let id = SessionId::from_raw("acct");

        sup.forward(id.clone(), Action::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(sup.inner.directory.claimed(&id), None);
        let err = sup.forward(id, Action::GetStatus).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn dead_worker_is_replaced_and_sessions_restart() {
        let (sup, client) = start_pool(vec![opened_script(), opened_script()]);
        let id = SessionId::from_raw("acct");

        sup.forward(id.clone(), Action::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let worker = sup.inner.directory.claimed(&id).expect("claimed");

        // Simulate the worker dying
        sup.inner.slots[worker].lock().token.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Claims were swept, so routing fell back to the hash
        assert_eq!(sup.inner.directory.claimed(&id), None);

        // The replacement worker accepts a fresh start for the same session
        let value = sup.forward(id.clone(), Action::Start).await.unwrap();
        assert_eq!(value["status"], "initializing");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(client.connect_count(), 2);
        assert_eq!(
            sup.forward(id, Action::GetStatus).await.unwrap()["status"],
            "connected"
        );
    }

    #[tokio::test]
    async fn health_reports_pool_shape() {
        let (sup, _client) = start_pool(vec![opened_script()]);
        sup.forward(SessionId::from_raw("acct"), Action::Start)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let health = sup.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.workers, 2);
        assert_eq!(health.resident_sessions, 1);
        assert_eq!(health.pending_requests, 0);
    }

    #[tokio::test]
    async fn shutdown_tears_down_connections() {
        let (sup, client) = start_pool(vec![opened_script()]);
        sup.forward(SessionId::from_raw("acct"), Action::Start)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(client.live_connections(), 1);

        sup.shutdown();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(client.live_connections(), 0);
    }
}
