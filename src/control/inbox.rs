use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use super::bus::{BusSubscription, ControlBus};
use super::{ControlCommand, ControlKind};
use crate::queue::JobId;

type Slots = Arc<Mutex<HashMap<JobId, Slot>>>;

struct Slot {
    generation: u64,
    tx: watch::Sender<Option<ControlKind>>,
}

/// Per-process router from the control bus to the workers owning jobs
///
/// Every worker in the process shares this one subscription. A worker
/// registers the job it claimed and gets back a [`ControlWatch`]; commands
/// for jobs nobody registered are dropped.
pub struct ControlInbox {
    slots: Slots,
    generation: AtomicU64,
    _subscription: BusSubscription,
}

impl ControlInbox {
    pub fn attach(bus: &ControlBus) -> Arc<Self> {
        let slots: Slots = Arc::new(Mutex::new(HashMap::new()));

        let routed = slots.clone();
        let subscription = bus.subscribe(move |command| deliver(&routed, command));

        Arc::new(Self {
            slots,
            generation: AtomicU64::new(0),
            _subscription: subscription,
        })
    }

    /// Start routing commands for `job_id` to the returned watch
    pub fn register(&self, job_id: JobId) -> ControlWatch {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        lock(&self.slots).insert(job_id, Slot { generation, tx });

        ControlWatch {
            job_id,
            generation,
            rx,
            slots: self.slots.clone(),
        }
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        lock(&self.slots).contains_key(&job_id)
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<JobId, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record the strongest pending intent for a registered job.
/// Cancel supersedes pause; repeats change nothing.
fn deliver(slots: &Slots, command: ControlCommand) {
    let slots = lock(slots);
    let Some(slot) = slots.get(&command.job_id) else {
        debug!(job_id = %command.job_id, kind = %command.kind, "Control command for job not owned here");
        return;
    };

    slot.tx.send_if_modified(|pending| {
        let next = match (*pending, command.kind) {
            (Some(ControlKind::Cancel), _) => return false,
            (Some(ControlKind::Pause), ControlKind::Pause) => return false,
            (_, kind) => kind,
        };
        *pending = Some(next);
        true
    });
}

/// A worker's view of control commands for the job it owns
pub struct ControlWatch {
    job_id: JobId,
    generation: u64,
    rx: watch::Receiver<Option<ControlKind>>,
    slots: Slots,
}

impl ControlWatch {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Command received so far, if any
    pub fn pending(&self) -> Option<ControlKind> {
        *self.rx.borrow()
    }

    /// Wait until a command is pending and return it
    pub async fn changed(&mut self) -> ControlKind {
        loop {
            if let Some(kind) = *self.rx.borrow_and_update() {
                return kind;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone: no command can arrive any more
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for ControlWatch {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        // A later claim of the same job may already own the slot
        if slots
            .get(&self.job_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_routes_only_registered_jobs() {
        let bus = ControlBus::default();
        let inbox = ControlInbox::attach(&bus);
        let watch = inbox.register(JobId(1));

        bus.send(ControlCommand::pause(JobId(2)));
        settle().await;
        assert_eq!(watch.pending(), None);

        bus.send(ControlCommand::pause(JobId(1)));
        settle().await;
        assert_eq!(watch.pending(), Some(ControlKind::Pause));
    }

    #[tokio::test]
    async fn test_cancel_supersedes_pause() {
        let bus = ControlBus::default();
        let inbox = ControlInbox::attach(&bus);
        let mut watch = inbox.register(JobId(1));

        bus.send(ControlCommand::cancel(JobId(1)));
        bus.send(ControlCommand::pause(JobId(1)));
        bus.send(ControlCommand::cancel(JobId(1)));

        let kind = tokio::time::timeout(Duration::from_secs(1), watch.changed())
            .await
            .unwrap();
        assert_eq!(kind, ControlKind::Cancel);
        settle().await;
        assert_eq!(watch.pending(), Some(ControlKind::Cancel));
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = ControlBus::default();
        let inbox = ControlInbox::attach(&bus);

        let watch = inbox.register(JobId(3));
        assert!(inbox.is_registered(JobId(3)));
        drop(watch);
        assert!(!inbox.is_registered(JobId(3)));
    }

    #[tokio::test]
    async fn test_stale_watch_keeps_new_registration() {
        let bus = ControlBus::default();
        let inbox = ControlInbox::attach(&bus);

        let stale = inbox.register(JobId(3));
        let fresh = inbox.register(JobId(3));
        drop(stale);

        assert!(inbox.is_registered(JobId(3)));
        bus.send(ControlCommand::pause(JobId(3)));
        settle().await;
        assert_eq!(fresh.pending(), Some(ControlKind::Pause));
    }
}
