//! Pairs asynchronous worker replies with the requests that caused them.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use relay_core::errors::ActionError;
use relay_core::ids::CorrelationId;
use relay_core::ipc::ActionReply;

/// In-flight request table. Each correlation id admits exactly one reply:
/// whoever removes the entry — the arriving reply or the expiring waiter —
/// wins, and the loser's side becomes a no-op.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<CorrelationId, oneshot::Sender<ActionReply>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a correlation id and register a single-use reply slot.
    pub fn register(&self) -> (CorrelationId, oneshot::Receiver<ActionReply>) {
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a worker reply. Returns false for late or duplicate replies,
    /// which are dropped.
    pub fn complete(&self, reply: ActionReply) -> bool {
        match self.pending.remove(&reply.request_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!(request_id = %reply.request_id, "dropping late reply");
                false
            }
        }
    }

    /// Withdraw a registration whose request was never delivered.
    pub fn abandon(&self, id: &CorrelationId) {
        self.pending.remove(id);
    }

    /// Await the reply for `id`, bounded by `timeout`.
    ///
    /// On expiry the entry is withdrawn; if withdrawal finds the entry gone,
    /// a reply won the race a moment ago and is already in the channel, so it
    /// is returned instead of a timeout.
    pub async fn wait(
        &self,
        id: &CorrelationId,
        mut rx: oneshot::Receiver<ActionReply>,
        timeout: Duration,
    ) -> Result<ActionReply, ActionError> {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ActionError::Internal("reply channel dropped".into())),
            Err(_) => {
                if self.pending.remove(id).is_some() {
                    Err(ActionError::IpcTimeout(timeout))
                } else {
                    rx.await
                        .map_err(|_| ActionError::Internal("reply channel dropped".into()))
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
