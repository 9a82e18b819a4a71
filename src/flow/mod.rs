//! Bundle decomposition and dependency introspection.
//!
//! A bundle is one parent job in the `bundle` queue with one child job per
//! URL in the `part` queue. Membership is always read back from the queue's
//! dependency edges; nothing here keeps its own copy.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::progress::{ProgressSample, SampleReport};
use crate::queue::{
    BUNDLE_QUEUE, BundlePayload, CANCELLED_REASON, Dependencies, DownloadPayload, FlowIds,
    FlowRequest, JobId, JobPayload, JobQueue, JobState, NewJob, PART_QUEUE, QueueError, QueueJob,
};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Bundle not found: {0}")]
    BundleNotFound(JobId),

    #[error("Job {0} is not a bundle")]
    NotABundle(JobId),

    #[error("A bundle needs at least one URL")]
    EmptyBundle,
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Part lifecycle as clients see it, derived from the queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PartState {
    pub fn from_job(job: &QueueJob) -> Self {
        match job.state {
            JobState::Waiting => PartState::Queued,
            JobState::Active => PartState::Active,
            // A retry wait has a wake time and still counts as queued
            JobState::Delayed if job.is_paused() => PartState::Paused,
            JobState::Delayed => PartState::Queued,
            JobState::Completed => PartState::Completed,
            JobState::Failed if job.failed_reason.as_deref() == Some(CANCELLED_REASON) => {
                PartState::Cancelled
            }
            JobState::Failed => PartState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PartState::Completed | PartState::Failed | PartState::Cancelled
        )
    }
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartState::Queued => "queued",
            PartState::Active => "active",
            PartState::Paused => "paused",
            PartState::Completed => "completed",
            PartState::Failed => "failed",
            PartState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Display view of one part
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartSummary {
    pub id: JobId,
    pub bundle_id: Option<JobId>,
    pub name: String,
    pub url: String,
    pub state: PartState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub progress: Option<SampleReport>,
}

impl PartSummary {
    pub fn from_job(job: &QueueJob, sample: Option<&ProgressSample>) -> Self {
        let (name, url) = match job.download() {
            Some(payload) => (payload.name.clone(), payload.url.clone()),
            None => (job.payload.job_name().to_string(), String::new()),
        };

        Self {
            id: job.id,
            bundle_id: job.parent_id,
            name,
            url,
            state: PartState::from_job(job),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            failed_reason: job.failed_reason.clone(),
            progress: sample.map(ProgressSample::report),
        }
    }

    /// Summary of a part whose queue record is already gone
    pub fn removed(id: JobId, bundle_id: Option<JobId>, name: String, url: String) -> Self {
        Self {
            id,
            bundle_id,
            name,
            url,
            state: PartState::Cancelled,
            attempts_made: 0,
            max_attempts: 0,
            failed_reason: Some(CANCELLED_REASON.to_string()),
            progress: None,
        }
    }
}

/// A bundle and its membership as recorded by the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bundle {
    pub id: JobId,
    pub name: String,
    pub completed: bool,
    pub part_ids: BTreeSet<JobId>,
    pub processed: BTreeSet<JobId>,
    pub unprocessed: BTreeSet<JobId>,
}

impl Bundle {
    fn new(parent: &QueueJob, name: String, deps: Dependencies) -> Self {
        Self {
            id: parent.id,
            name,
            completed: parent.state == JobState::Completed,
            part_ids: deps.all().copied().collect(),
            processed: deps.processed,
            unprocessed: deps.unprocessed,
        }
    }
}

/// File name for a part, taken from the last path segment of its URL
pub fn part_name(url: &str, index: usize) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);

    match path.split_once('/') {
        Some((_, tail)) => tail
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("part-{}", index)),
        None => format!("part-{}", index),
    }
}

/// Builds bundles in the queue and answers membership questions
#[derive(Clone)]
pub struct FlowBuilder {
    queue: Arc<dyn JobQueue>,
}

impl FlowBuilder {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Create the parent job and one child per URL as a single unit
    pub async fn create_bundle(&self, name: &str, urls: &[String]) -> Result<FlowIds> {
        if urls.is_empty() {
            return Err(FlowError::EmptyBundle);
        }

        let children = urls
            .iter()
            .enumerate()
            .map(|(index, url)| {
                NewJob::new(
                    PART_QUEUE,
                    JobPayload::Download(DownloadPayload {
                        name: part_name(url, index),
                        url: url.clone(),
                    }),
                )
            })
            .collect();

        let flow = FlowRequest {
            parent: NewJob::new(
                BUNDLE_QUEUE,
                JobPayload::Bundle(BundlePayload {
                    name: name.to_string(),
                }),
            ),
            children,
        };

        let ids = self.queue.add_flow(flow).await?;
        info!(bundle_id = %ids.parent, parts = ids.children.len(), name, "Bundle created");
        Ok(ids)
    }

    /// Children split into processed and unprocessed, straight from the queue
    pub async fn outstanding_children(&self, bundle_id: JobId) -> Result<Dependencies> {
        self.queue
            .get_dependencies(bundle_id)
            .await
            .map_err(|err| match err {
                QueueError::JobNotFound(id) => FlowError::BundleNotFound(id),
                other => other.into(),
            })
    }

    /// Unprocessed children currently leased by a worker
    ///
    /// One listing of the active part queue instead of a lookup per child.
    pub async fn active_children(&self, bundle_id: JobId) -> Result<Vec<JobId>> {
        let deps = self.outstanding_children(bundle_id).await?;
        let active: HashSet<JobId> = self
            .queue
            .list_by_state(PART_QUEUE, JobState::Active)
            .await?
            .into_iter()
            .collect();

        Ok(deps
            .unprocessed
            .into_iter()
            .filter(|id| active.contains(id))
            .collect())
    }

    pub async fn bundle(&self, bundle_id: JobId) -> Result<Option<Bundle>> {
        let Some(parent) = self.queue.get_job(bundle_id).await? else {
            return Ok(None);
        };
        let JobPayload::Bundle(payload) = &parent.payload else {
            return Err(FlowError::NotABundle(bundle_id));
        };

        let deps = self.outstanding_children(bundle_id).await?;
        Ok(Some(Bundle::new(&parent, payload.name.clone(), deps)))
    }

    /// Bundles that still have unprocessed parts
    pub async fn active_bundles(&self) -> Result<Vec<JobId>> {
        Ok(self
            .queue
            .list_by_state(BUNDLE_QUEUE, JobState::Waiting)
            .await?)
    }

    /// Part records currently in `state`
    pub async fn parts_in_state(&self, state: PartState) -> Result<Vec<QueueJob>> {
        let job_states: &[JobState] = match state {
            PartState::Queued => &[JobState::Waiting, JobState::Delayed],
            PartState::Active => &[JobState::Active],
            PartState::Paused => &[JobState::Delayed],
            PartState::Completed => &[JobState::Completed],
            PartState::Failed | PartState::Cancelled => &[JobState::Failed],
        };

        let mut parts = Vec::new();
        for job_state in job_states {
            for id in self.queue.list_by_state(PART_QUEUE, *job_state).await? {
                if let Some(job) = self.queue.get_job(id).await? {
                    if PartState::from_job(&job) == state {
                        parts.push(job);
                    }
                }
            }
        }
        parts.sort_by_key(|job| job.id);
        Ok(parts)
    }

    /// Complete the bundle once every child is processed
    ///
    /// Returns the bundle when this call completed it.
    pub async fn settle_bundle(&self, bundle_id: JobId) -> Result<Option<Bundle>> {
        let Some(parent) = self.queue.get_job(bundle_id).await? else {
            return Ok(None);
        };
        if parent.state != JobState::Waiting {
            return Ok(None);
        }

        let deps = self.outstanding_children(bundle_id).await?;
        if !deps.unprocessed.is_empty() {
            return Ok(None);
        }

        if !self.queue.complete(bundle_id).await? {
            return Ok(None);
        }
        debug!(bundle_id = %bundle_id, parts = deps.total(), "Bundle completed");

        let name = match &parent.payload {
            JobPayload::Bundle(payload) => payload.name.clone(),
            JobPayload::Download(payload) => payload.name.clone(),
        };
        let mut bundle = Bundle::new(&parent, name, deps);
        bundle.completed = true;
        Ok(Some(bundle))
    }

    pub async fn bundle_of(&self, part_id: JobId) -> Result<Option<JobId>> {
        Ok(self
            .queue
            .get_job(part_id)
            .await?
            .and_then(|job| job.parent_id))
    }
}
