use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::{ControlBus, ControlCommand};
use crate::flow::{FlowError, PartState, PartSummary};
use crate::progress::{ProgressPipeline, Topic};
use crate::queue::{CANCELLED_REASON, JobId, JobQueue, JobState, QueueError, QueueJob};
use crate::storage::{LocalStorage, StorageError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Part not found: {0}")]
    NotFound(JobId),

    #[error("Part {id} is {state} and cannot be resumed")]
    Conflict { id: JobId, state: PartState },
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    /// Not running: moved to the paused representation in the queue
    Paused,
    /// Running: the owning worker was asked to pause at its next checkpoint
    Signalled,
    /// Missing, terminal or already paused
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Not started: removed from the queue
    Removed,
    /// Stopped earlier with output on disk: file deleted, part finished as cancelled
    Cancelled,
    /// Running: the owning worker was asked to cancel
    Signalled,
    /// Missing or terminal
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// Already queued or running
    Unchanged,
}

/// Pause, resume and cancel as requested through the API
///
/// Parts no worker holds are transitioned in the queue directly, guarded by
/// the state they were observed in. Leased parts can only be reached through
/// the control bus. Ids of bundles or other non-part jobs are treated as
/// missing.
#[derive(Clone)]
pub struct JobControl {
    queue: Arc<dyn JobQueue>,
    bus: ControlBus,
    pipeline: ProgressPipeline,
    storage: LocalStorage,
}

impl JobControl {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        bus: ControlBus,
        pipeline: ProgressPipeline,
        storage: LocalStorage,
    ) -> Self {
        Self {
            queue,
            bus,
            pipeline,
            storage,
        }
    }

    async fn part(&self, id: JobId) -> Result<Option<QueueJob>> {
        let job = self.queue.get_job(id).await?;
        Ok(job.filter(QueueJob::is_part))
    }

    pub async fn pause(&self, id: JobId) -> Result<PauseOutcome> {
        let Some(job) = self.part(id).await? else {
            debug!(job_id = %id, "Pause for missing part ignored");
            return Ok(PauseOutcome::Unchanged);
        };
        if job.state.is_terminal() || job.is_paused() {
            return Ok(PauseOutcome::Unchanged);
        }
        if job.state == JobState::Active {
            return Ok(self.signal(ControlCommand::pause(id)));
        }

        match self.queue.delay(id, None, job.state).await {
            Ok(()) => {
                info!(job_id = %id, "Part paused before start");
                self.announce(id, Topic::Paused).await?;
                Ok(PauseOutcome::Paused)
            }
            // Claimed in the meantime
            Err(QueueError::StateMismatch {
                actual: JobState::Active,
                ..
            }) => Ok(self.signal(ControlCommand::pause(id))),
            Err(QueueError::StateMismatch { .. }) | Err(QueueError::JobNotFound(_)) => {
                Ok(PauseOutcome::Unchanged)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome> {
        let Some(job) = self.part(id).await? else {
            debug!(job_id = %id, "Cancel for missing part ignored");
            return Ok(CancelOutcome::Unchanged);
        };
        if job.state.is_terminal() {
            return Ok(CancelOutcome::Unchanged);
        }
        if job.state == JobState::Active {
            return Ok(self.signal_cancel(id));
        }
        if self.has_output(&job).await {
            return self.cancel_with_output(&job).await;
        }

        match self.queue.remove(id).await {
            Ok(true) => {
                info!(job_id = %id, "Part cancelled before start");
                self.announce_removed(&job).await?;
                Ok(CancelOutcome::Removed)
            }
            Ok(false) => Ok(CancelOutcome::Unchanged),
            Err(QueueError::Leased(_)) => Ok(self.signal_cancel(id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn resume(&self, id: JobId) -> Result<ResumeOutcome> {
        let job = self.part(id).await?.ok_or(ControlError::NotFound(id))?;

        let state = PartState::from_job(&job);
        if state.is_terminal() {
            return Err(ControlError::Conflict { id, state });
        }
        if state != PartState::Paused {
            return Ok(ResumeOutcome::Unchanged);
        }

        match self.queue.promote(id).await {
            Ok(()) => {
                info!(job_id = %id, "Part resumed");
                self.announce(id, Topic::Resumed).await?;
                Ok(ResumeOutcome::Resumed)
            }
            Err(QueueError::InvalidTransition { .. }) | Err(QueueError::JobNotFound(_)) => {
                Ok(ResumeOutcome::Unchanged)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn has_output(&self, job: &QueueJob) -> bool {
        match job.download() {
            Some(payload) => {
                self.storage
                    .has_output(job.parent_id, job.id, &payload.name)
                    .await
            }
            None => false,
        }
    }

    /// Cancel a part an earlier attempt already wrote to
    ///
    /// The part is parked first so no worker can claim it while its file is
    /// deleted. It then finishes as cancelled rather than disappearing.
    async fn cancel_with_output(&self, job: &QueueJob) -> Result<CancelOutcome> {
        let id = job.id;
        match self.queue.delay(id, None, job.state).await {
            Ok(()) => {}
            Err(QueueError::StateMismatch {
                actual: JobState::Active,
                ..
            }) => return Ok(self.signal_cancel(id)),
            Err(QueueError::StateMismatch { .. }) | Err(QueueError::JobNotFound(_)) => {
                return Ok(CancelOutcome::Unchanged);
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(payload) = job.download() {
            self.storage.remove(job.parent_id, id, &payload.name).await?;
        }
        self.queue.discard(id, CANCELLED_REASON).await?;
        info!(job_id = %id, "Stopped part cancelled, partial output deleted");

        self.announce(id, Topic::Cancelled).await?;
        if let Some(bundle_id) = job.parent_id {
            self.pipeline.settle_bundle(bundle_id).await?;
        }
        Ok(CancelOutcome::Cancelled)
    }

    fn signal(&self, command: ControlCommand) -> PauseOutcome {
        self.bus.send(command);
        PauseOutcome::Signalled
    }

    fn signal_cancel(&self, id: JobId) -> CancelOutcome {
        self.bus.send(ControlCommand::cancel(id));
        CancelOutcome::Signalled
    }

    async fn announce(&self, id: JobId, topic: Topic) -> Result<()> {
        if let Some(summary) = self.pipeline.part_summary(id).await? {
            self.pipeline.part_event(topic, summary);
        }
        Ok(())
    }

    async fn announce_removed(&self, job: &QueueJob) -> Result<()> {
        let (name, url) = job
            .download()
            .map(|payload| (payload.name.clone(), payload.url.clone()))
            .unwrap_or_default();

        self.pipeline.aggregator().forget(job.id);
        self.pipeline.part_event(
            Topic::Removed,
            PartSummary::removed(job.id, job.parent_id, name, url),
        );
        if let Some(bundle_id) = job.parent_id {
            self.pipeline.settle_bundle(bundle_id).await?;
        }
        Ok(())
    }
}
