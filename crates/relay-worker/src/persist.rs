use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use relay_core::ids::SessionId;
use relay_store::CredentialSink;

#[derive(Clone, Debug)]
pub struct PersistConfig {
    /// Debounce window for routine key-material churn.
    pub debounce: Duration,
    /// Delay before the single retry of a failed write.
    pub retry_delay: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Coalesces credential writes for one session.
///
/// Soft updates (routine churn) re-arm a debounce timer and only the most
/// recent blob is written when it fires. Force updates (credential rotation —
/// anything that changes whether the session can re-authenticate) cancel the
/// pending timer and write before returning, because losing the latest
/// rotation is a data-loss risk while losing an intermediate soft update is
/// not. A failed write is retried once; repeated failure is a warning, never
/// a worker crash.
pub struct PersistenceCoordinator {
    session_id: SessionId,
    sink: Arc<dyn CredentialSink>,
    config: PersistConfig,
    latest: Arc<Mutex<Option<Vec<u8>>>>,
    pending: Mutex<Option<JoinHandle<()>>>,
    writes: Arc<AtomicU64>,
}

impl PersistenceCoordinator {
    pub fn new(session_id: SessionId, sink: Arc<dyn CredentialSink>, config: PersistConfig) -> Self {
        Self {
            session_id,
            sink,
            config,
            latest: Arc::new(Mutex::new(None)),
            pending: Mutex::new(None),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a routine update; write happens when the debounce window closes.
    pub fn soft(&self, blob: Vec<u8>) {
        *self.latest.lock() = Some(blob);

        let mut pending = self.pending.lock();
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let latest = Arc::clone(&self.latest);
        let sink = Arc::clone(&self.sink);
        let writes = Arc::clone(&self.writes);
        let session_id = self.session_id.clone();
        let debounce = self.config.debounce;
        let retry_delay = self.config.retry_delay;

        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Take the blob first so the state lock is not held across the
            // write await.
            let blob = latest.lock().take();
            if let Some(blob) = blob {
                write_with_retry(&*sink, &session_id, &blob, retry_delay, &writes).await;
            }
        }));
    }

    /// Write immediately, preempting any pending debounce timer.
    pub async fn force(&self, blob: Vec<u8>) {
        {
            let mut pending = self.pending.lock();
            if let Some(handle) = pending.take() {
                handle.abort();
            }
            self.latest.lock().take();
        }
        write_with_retry(
            &*self.sink,
            &self.session_id,
            &blob,
            self.config.retry_delay,
            &self.writes,
        )
        .await;
    }

    /// Completed writes, for tests and diagnostics.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

async fn write_with_retry(
    sink: &dyn CredentialSink,
    session_id: &SessionId,
    blob: &[u8],
    retry_delay: Duration,
    writes: &AtomicU64,
) {
    match sink.store(session_id, blob) {
        Ok(()) => {
            writes.fetch_add(1, Ordering::Relaxed);
        }
        Err(first) => {
            warn!(session_id = %session_id, error = %first, "credential write failed, retrying");
            tokio::time::sleep(retry_delay).await;
            match sink.store(session_id, blob) {
                Ok(()) => {
                    writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(second) => {
                    warn!(session_id = %session_id, error = %second, "credential write failed twice, giving up");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::StoreError;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        attempts: AtomicUsize,
        fail_first: usize,
        stored: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail_first,
                stored: Mutex::new(Vec::new()),
            })
        }
    }

    impl CredentialSink for RecordingSink {
        fn store(&self, _session_id: &SessionId, blob: &[u8]) -> Result<(), StoreError> {
            let n = self.attempts.fetch_add(1, Ordering::Relaxed);
            if n < self.fail_first {
                return Err(StoreError::Database("disk full".into()));
            }
            self.stored.lock().push(blob.to_vec());
            Ok(())
        }
    }

    fn coordinator(sink: Arc<RecordingSink>, debounce_ms: u64) -> PersistenceCoordinator {
        PersistenceCoordinator::new(
            SessionId::from_raw("acct"),
            sink,
            PersistConfig {
                debounce: Duration::from_millis(debounce_ms),
                retry_delay: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn soft_updates_coalesce_to_one_write() {
        let sink = RecordingSink::new(0);
        let pc = coordinator(Arc::clone(&sink), 50);

        pc.soft(b"one".to_vec());
        pc.soft(b"two".to_vec());
        pc.soft(b"three".to_vec());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pc.write_count(), 1);
        // Only the most recent state is written
        assert_eq!(sink.stored.lock().as_slice(), &[b"three".to_vec()]);
    }

    #[tokio::test]
    async fn force_preempts_pending_debounce() {
        let sink = RecordingSink::new(0);
        let pc = coordinator(Arc::clone(&sink), 50);

        pc.soft(b"soft".to_vec());
        pc.force(b"rotated".to_vec()).await;

        // Force wrote synchronously
        assert_eq!(pc.write_count(), 1);
        assert_eq!(sink.stored.lock().as_slice(), &[b"rotated".to_vec()]);

        // The preempted debounce timer never fires a second write
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(pc.write_count(), 1);
    }

    #[tokio::test]
    async fn failed_write_retried_once() {
        let sink = RecordingSink::new(1);
        let pc = coordinator(Arc::clone(&sink), 10);

        pc.force(b"keys".to_vec()).await;

        assert_eq!(sink.attempts.load(Ordering::Relaxed), 2);
        assert_eq!(pc.write_count(), 1);
    }

    #[tokio::test]
    async fn repeated_failure_does_not_crash() {
        let sink = RecordingSink::new(usize::MAX);
        let pc = coordinator(Arc::clone(&sink), 10);

        pc.force(b"keys".to_vec()).await;

        assert_eq!(sink.attempts.load(Ordering::Relaxed), 2);
        assert_eq!(pc.write_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn debounce_task_runs_across_threads() {
        // The debounce write is a spawned task, so it must be schedulable on
        // any worker thread, including when soft() itself is called from a
        // spawned task.
        let sink = RecordingSink::new(0);
        let pc = Arc::new(coordinator(Arc::clone(&sink), 20));

        let handle = {
            let pc = Arc::clone(&pc);
            tokio::spawn(async move {
                pc.soft(b"from-task".to_vec());
            })
        };
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pc.write_count(), 1);
        assert_eq!(sink.stored.lock().as_slice(), &[b"from-task".to_vec()]);
    }

    #[tokio::test]
    async fn separate_windows_write_separately() {
        let sink = RecordingSink::new(0);
        let pc = coordinator(Arc::clone(&sink), 20);

        pc.soft(b"a".to_vec());
        tokio::time::sleep(Duration::from_millis(60)).await;
        pc.soft(b"b".to_vec());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(pc.write_count(), 2);
    }
}
