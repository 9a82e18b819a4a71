use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::sample::{BundleProgress, ProgressSample};
use crate::queue::JobId;

/// Latest known sample per part, kept in memory only
///
/// Samples are last-write-wins by ingest order. Timestamps are carried
/// along for clients but never used to discard a late sample.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    latest: Mutex<HashMap<JobId, ProgressSample>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest(&self) -> MutexGuard<'_, HashMap<JobId, ProgressSample>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ingest(&self, sample: ProgressSample) {
        self.latest().insert(sample.job_id, sample);
    }

    pub fn sample(&self, job_id: JobId) -> Option<ProgressSample> {
        self.latest().get(&job_id).copied()
    }

    /// Drop the sample of a part that no longer exists
    pub fn forget(&self, job_id: JobId) {
        self.latest().remove(&job_id);
    }

    /// Aggregate over the latest sample of each listed part
    pub fn bundle_progress(&self, bundle_id: JobId, part_ids: &BTreeSet<JobId>) -> BundleProgress {
        let latest = self.latest();
        BundleProgress::compute(
            bundle_id,
            part_ids.len(),
            part_ids.iter().filter_map(|id| latest.get(id)),
        )
    }

    pub fn tracked(&self) -> usize {
        self.latest().len()
    }
}
