use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::queue::JobId;

pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<JobId, Pending>>>;

struct Pending {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Rollback timers for speculative local edits
///
/// At most one rollback is pending per id. Whoever removes the pending
/// entry first (the timer, `confirm` or a newer update) decides its fate,
/// so a rollback runs at most once and never after a confirmation.
pub struct ReconciliationStore {
    timeout: Duration,
    pending: PendingMap,
    generation: AtomicU64,
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(DEFAULT_ROLLBACK_TIMEOUT)
    }
}

impl ReconciliationStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply an edit now and undo it unless `id` is confirmed in time.
    /// Supersedes an update still pending for the same id.
    pub fn optimistic_update<A, R>(&self, id: JobId, apply: A, rollback: R)
    where
        A: FnOnce(),
        R: FnOnce() + Send + 'static,
    {
        apply();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slots = self.pending.clone();
        let timeout = self.timeout;

        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.remove(&id) {
            previous.timer.abort();
            debug!(job_id = %id, "Pending optimistic update superseded");
        }

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let owned = {
                let mut pending = lock(&slots);
                match pending.get(&id) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&id);
                        true
                    }
                    _ => false,
                }
            };
            if owned {
                debug!(job_id = %id, "Optimistic update not confirmed, rolling back");
                rollback();
            }
        });

        pending.insert(id, Pending { generation, timer });
    }

    /// A server event for `id` arrived. Returns whether a rollback was pending.
    pub fn confirm(&self, id: JobId) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: JobId) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for ReconciliationStore {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.pending).drain() {
            entry.timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_runs_once_after_timeout() {
        let store = ReconciliationStore::new(TIMEOUT);
        let applied = AtomicUsize::new(0);
        let (rolled_back, rollback) = counter();

        store.optimistic_update(
            JobId(1),
            || {
                applied.fetch_add(1, Ordering::SeqCst);
            },
            rollback,
        );
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(store.is_pending(JobId(1)));

        tokio::time::sleep(TIMEOUT * 3).await;
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert!(!store.is_pending(JobId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_prevents_rollback() {
        let store = ReconciliationStore::new(TIMEOUT);
        let (rolled_back, rollback) = counter();

        store.optimistic_update(JobId(1), || {}, rollback);
        tokio::time::sleep(TIMEOUT / 2).await;
        assert!(store.confirm(JobId(1)));

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_update_supersedes_first() {
        let store = ReconciliationStore::new(TIMEOUT);
        let (first, first_rollback) = counter();
        let (second, second_rollback) = counter();

        store.optimistic_update(JobId(1), || {}, first_rollback);
        tokio::time::sleep(TIMEOUT / 2).await;
        store.optimistic_update(JobId(1), || {}, second_rollback);
        assert_eq!(store.pending_count(), 1);

        // The first timer would have fired here
        tokio::time::sleep(TIMEOUT * 3 / 4).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(TIMEOUT).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_without_pending_is_noop() {
        let store = ReconciliationStore::new(TIMEOUT);
        assert!(!store.confirm(JobId(9)));

        let (rolled_back, rollback) = counter();
        store.optimistic_update(JobId(1), || {}, rollback);
        assert!(!store.confirm(JobId(2)));
        assert!(store.confirm(JobId(1)));
        assert!(!store.confirm(JobId(1)));

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_independent() {
        let store = ReconciliationStore::new(TIMEOUT);
        let (one, one_rollback) = counter();
        let (two, two_rollback) = counter();

        store.optimistic_update(JobId(1), || {}, one_rollback);
        store.optimistic_update(JobId(2), || {}, two_rollback);
        store.confirm(JobId(1));

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(one.load(Ordering::SeqCst), 0);
        assert_eq!(two.load(Ordering::SeqCst), 1);
    }
}
