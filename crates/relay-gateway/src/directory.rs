//! Session-to-worker routing.
//!
//! A claim recorded here is authoritative. A session with no claim routes by
//! a deterministic hash of its id, so racing requests for a not-yet-resident
//! session all land on the same worker and the idempotent start there
//! collapses them into one protocol connection.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use relay_core::ids::SessionId;

pub struct OwnershipDirectory {
    worker_count: usize,
    owners: RwLock<HashMap<SessionId, usize>>,
}

impl OwnershipDirectory {
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "need at least one worker");
        Self {
            worker_count,
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Worker index for a session: its claim if one exists, otherwise the
    /// hash fallback.
    pub fn route(&self, session_id: &SessionId) -> usize {
        self.owners
            .read()
            .get(session_id)
            .copied()
            .unwrap_or_else(|| self.hash_route(session_id))
    }

    /// Deterministic fallback: first eight bytes of SHA-256(id), mod workers.
    pub fn hash_route(&self, session_id: &SessionId) -> usize {
        let digest = Sha256::digest(session_id.as_str().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.worker_count as u64) as usize
    }

    pub fn claim(&self, session_id: SessionId, worker: usize) {
        debug!(session_id = %session_id, worker, "claim");
        self.owners.write().insert(session_id, worker);
    }

    /// Release only if `worker` still holds the claim. A release from a
    /// replaced worker generation must not clobber a newer claim.
    pub fn release_if(&self, session_id: &SessionId, worker: usize) -> bool {
        let mut owners = self.owners.write();
        match owners.get(session_id) {
            Some(&current) if current == worker => {
                owners.remove(session_id);
                debug!(session_id = %session_id, worker, "release");
                true
            }
            _ => false,
        }
    }

    /// Drop every claim held by one worker. Used when a worker is replaced;
    /// returns how many sessions lost residency.
    pub fn release_worker(&self, worker: usize) -> usize {
        let mut owners = self.owners.write();
        let before = owners.len();
        owners.retain(|_, &mut w| w != worker);
        before - owners.len()
    }

    pub fn claimed(&self, session_id: &SessionId) -> Option<usize> {
        self.owners.read().get(session_id).copied()
    }

    pub fn claim_count(&self) -> usize {
        self.owners.read().len()
    }
}
