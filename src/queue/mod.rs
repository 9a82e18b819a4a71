//! Durable job queue consumed by the orchestration layer.
//!
//! The core only talks to the queue through [`JobQueue`]; [`FjallQueue`] is
//! the embedded implementation backing the server and the tests.

pub mod job;
mod keys;
pub mod pruning;
pub mod retry;
pub mod store;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub use job::{
    BUNDLE_QUEUE, BundlePayload, CANCELLED_REASON, Dependencies, DownloadPayload, FailOutcome,
    FlowIds, FlowRequest, JobId, JobPayload, JobState, NewJob, PART_QUEUE, QueueJob,
};
pub use pruning::PruneStats;
pub use retry::RetryPolicy;
pub use store::FjallQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {0} is leased by a worker")]
    Leased(JobId),

    #[error("Job {id} is {actual}, expected {expected}")]
    StateMismatch {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error("Cannot {operation} job {id} in state {state}")]
    InvalidTransition {
        id: JobId,
        state: JobState,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Narrow interface onto the durable queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new waiting job
    async fn enqueue(&self, job: NewJob) -> Result<JobId>;

    /// Submit a parent and its children as one unit.
    ///
    /// The default enqueues one job at a time and removes everything already
    /// created when a later enqueue fails. Stores with atomic batches override it.
    async fn add_flow(&self, flow: FlowRequest) -> Result<FlowIds> {
        let parent = self.enqueue(flow.parent).await?;
        let mut children = Vec::with_capacity(flow.children.len());

        for child in flow.children {
            match self.enqueue(child.with_parent(parent)).await {
                Ok(id) => children.push(id),
                Err(err) => {
                    warn!(%parent, created = children.len(), error = %err, "Flow submission failed, rolling back");
                    for id in children.iter().rev() {
                        if let Err(e) = self.remove(*id).await {
                            warn!(job_id = %id, error = %e, "Failed to roll back child job");
                        }
                    }
                    if let Err(e) = self.remove(parent).await {
                        warn!(job_id = %parent, error = %e, "Failed to roll back parent job");
                    }
                    return Err(err);
                }
            }
        }

        Ok(FlowIds { parent, children })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<QueueJob>>;

    /// Ids of jobs in `queue` currently in `state`, oldest first
    async fn list_by_state(&self, queue: &str, state: JobState) -> Result<Vec<JobId>>;

    /// Lease the oldest waiting job of `queue`, counting a new attempt
    async fn claim(&self, queue: &str) -> Result<Option<QueueJob>>;

    /// Mark a job completed. Returns false if it already was.
    async fn complete(&self, id: JobId) -> Result<bool>;

    /// Report a failed attempt and let the retry policy decide what follows
    async fn fail(&self, id: JobId, reason: &str) -> Result<FailOutcome>;

    /// Fail a job permanently, bypassing the retry policy
    async fn discard(&self, id: JobId, reason: &str) -> Result<()>;

    /// Move a job in state `expected` to delayed. `None` delays indefinitely.
    ///
    /// Pausing an active job hands its attempt back.
    async fn delay(&self, id: JobId, until_ms: Option<i64>, expected: JobState) -> Result<()>;

    /// Move a delayed job back to waiting
    async fn promote(&self, id: JobId) -> Result<()>;

    /// Promote delayed jobs of `queue` whose wake time has passed
    async fn promote_due(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>>;

    /// Delete a job no worker holds. Returns false if it did not exist.
    async fn remove(&self, id: JobId) -> Result<bool>;

    /// Delete a job leased by the caller, e.g. cancelled before any output
    async fn remove_claimed(&self, id: JobId) -> Result<bool>;

    /// Return jobs left active by a previous process to waiting
    async fn requeue_active(&self, queue: &str) -> Result<Vec<JobId>>;

    async fn get_dependencies(&self, parent: JobId) -> Result<Dependencies>;

    async fn health_check(&self) -> Result<()>;
}
