/// Retention of finished jobs
use std::time::Duration;

use tracing::{debug, info};

use super::job::{BUNDLE_QUEUE, JobId, JobState, PART_QUEUE};
use super::keys::{decode_state_key, encode_dep_key, encode_state_prefix};
use super::store::{FjallQueue, now_ms};
use super::Result;

/// Pruning statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneStats {
    pub bundles_pruned: usize,
    pub parts_pruned: usize,
    /// Parts deleted by this run
    pub part_ids: Vec<JobId>,
}

impl FjallQueue {
    /// Delete terminal jobs that finished more than `older_than` ago.
    ///
    /// A finished bundle goes together with its children once every child is
    /// terminal. Children of a bundle that still exists are never pruned on
    /// their own, so a live bundle always sees all of its parts.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<PruneStats> {
        let _guard = self.write_lock.lock().await;

        let cutoff = now_ms() - older_than.as_millis() as i64;
        let mut stats = PruneStats::default();
        let mut batch = self.keyspace.batch();

        for queue in [BUNDLE_QUEUE, PART_QUEUE] {
            for state in [JobState::Completed, JobState::Failed] {
                for item in self.states.prefix(encode_state_prefix(queue, state)) {
                    let (key, _) = item?;
                    let Some(id) = decode_state_key(&key) else {
                        continue;
                    };
                    let Some(job) = self.load(id)? else {
                        continue;
                    };
                    if job.finished_at_ms.is_none_or(|at| at > cutoff) {
                        continue;
                    }
                    if let Some(parent) = job.parent_id {
                        if self.load(parent)?.is_some() {
                            continue;
                        }
                    }

                    let mut children = Vec::new();
                    let mut all_terminal = true;
                    for (child_id, _) in self.child_edges(id)? {
                        if let Some(child) = self.load(child_id)? {
                            all_terminal &= child.state.is_terminal();
                            children.push(child);
                        }
                    }
                    if !all_terminal {
                        debug!(job_id = %id, "Skipping prune, children still running");
                        continue;
                    }

                    for (child_id, _) in self.child_edges(id)? {
                        batch.remove(&self.deps, encode_dep_key(id, child_id));
                    }
                    for child in &children {
                        self.stage_delete(&mut batch, child);
                    }
                    self.stage_delete(&mut batch, &job);

                    if queue == BUNDLE_QUEUE {
                        stats.bundles_pruned += 1;
                        stats.parts_pruned += children.len();
                        stats.part_ids.extend(children.iter().map(|child| child.id));
                    } else {
                        stats.parts_pruned += 1;
                        stats.part_ids.push(id);
                    }
                }
            }
        }

        batch.commit()?;
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        info!(
            bundles = stats.bundles_pruned,
            parts = stats.parts_pruned,
            "Pruning complete"
        );

        Ok(stats)
    }
}
