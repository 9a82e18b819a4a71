//! Client-side view of bundles and parts
//!
//! [`ClientStore`] folds hub events into a local [`ClientView`] and lets a UI
//! apply pause, resume and cancel before the server confirms them. Edits
//! that are not confirmed by a lifecycle event for the same id within the
//! rollback timeout are undone.

pub mod reconcile;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

use crate::flow::{PartState, PartSummary};
use crate::progress::{BundleProgress, EventData, HubEvent, Topic};
use crate::queue::JobId;

pub use reconcile::{DEFAULT_ROLLBACK_TIMEOUT, ReconciliationStore};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleView {
    pub name: Option<String>,
    pub completed: bool,
    pub progress: Option<BundleProgress>,
}

/// Display-only state; never written back to the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientView {
    pub parts: BTreeMap<JobId, PartSummary>,
    pub bundles: BTreeMap<JobId, BundleView>,
}

impl ClientView {
    /// Fold one pushed event in. Returns the id a lifecycle event confirms.
    pub fn apply(&mut self, event: &HubEvent) -> Option<JobId> {
        match &event.data {
            EventData::Sample(report) => {
                match self.parts.get_mut(&report.job_id) {
                    // Late samples must not revive a finished part
                    Some(part) if part.state.is_terminal() => {
                        trace!(job_id = %report.job_id, "Progress for finished part ignored");
                    }
                    Some(part) => part.progress = Some(report.clone()),
                    None => {}
                }
                None
            }
            EventData::Part(summary) => {
                if event.topic == Topic::Removed {
                    self.parts.remove(&summary.id);
                } else {
                    let mut summary = (**summary).clone();
                    // Lifecycle summaries may predate the latest sample
                    if summary.progress.is_none() {
                        summary.progress = self
                            .parts
                            .get(&summary.id)
                            .and_then(|part| part.progress.clone());
                    }
                    self.parts.insert(summary.id, summary);
                }
                Some(summary.id)
            }
            EventData::BundleProgress(progress) => {
                self.bundles.entry(progress.bundle_id).or_default().progress =
                    Some(progress.clone());
                None
            }
            EventData::Bundle(bundle) => {
                let view = self.bundles.entry(bundle.id).or_default();
                view.name = Some(bundle.name.clone());
                view.completed = bundle.completed;
                Some(bundle.id)
            }
        }
    }
}

pub struct ClientStore {
    view: Arc<Mutex<ClientView>>,
    reconciler: ReconciliationStore,
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new(DEFAULT_ROLLBACK_TIMEOUT)
    }
}

impl ClientStore {
    pub fn new(rollback_timeout: Duration) -> Self {
        Self {
            view: Arc::new(Mutex::new(ClientView::default())),
            reconciler: ReconciliationStore::new(rollback_timeout),
        }
    }

    pub fn view(&self) -> ClientView {
        lock(&self.view).clone()
    }

    pub fn part(&self, id: JobId) -> Option<PartSummary> {
        lock(&self.view).parts.get(&id).cloned()
    }

    pub fn reconciler(&self) -> &ReconciliationStore {
        &self.reconciler
    }

    /// Apply a pushed event and confirm any pending edit it settles
    pub fn apply_event(&self, event: &HubEvent) {
        let confirmed = lock(&self.view).apply(event);
        if let Some(id) = confirmed {
            self.reconciler.confirm(id);
        }
    }

    /// Replace a part with a snapshot fetched after a reconnect
    pub fn apply_snapshot(&self, summary: PartSummary) {
        let id = summary.id;
        lock(&self.view).parts.insert(id, summary);
        self.reconciler.confirm(id);
    }

    /// Show the part as paused right away. False if it cannot be paused.
    pub fn optimistic_pause(&self, id: JobId) -> bool {
        self.optimistic_state(id, PartState::Paused, |state| {
            matches!(state, PartState::Queued | PartState::Active)
        })
    }

    pub fn optimistic_resume(&self, id: JobId) -> bool {
        self.optimistic_state(id, PartState::Queued, |state| state == PartState::Paused)
    }

    pub fn optimistic_cancel(&self, id: JobId) -> bool {
        self.optimistic_state(id, PartState::Cancelled, |state| !state.is_terminal())
    }

    fn optimistic_state(
        &self,
        id: JobId,
        target: PartState,
        allowed: impl Fn(PartState) -> bool,
    ) -> bool {
        let Some(previous) = self.part(id) else {
            return false;
        };
        if !allowed(previous.state) {
            return false;
        }

        let view = self.view.clone();
        self.reconciler.optimistic_update(
            id,
            || {
                if let Some(part) = lock(&self.view).parts.get_mut(&id) {
                    part.state = target;
                }
            },
            move || {
                lock(&view).parts.insert(id, previous);
            },
        );
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
