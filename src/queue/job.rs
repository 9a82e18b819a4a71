//! Job records, payloads and dependency views exchanged with the queue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Queue holding one parent job per bundle
pub const BUNDLE_QUEUE: &str = "bundle";
/// Queue holding one child job per downloadable part
pub const PART_QUEUE: &str = "part";

/// Failure reason recorded when a started part is cancelled
pub const CANCELLED_REASON: &str = "cancelled";

/// Sequential job identifier assigned by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// Job states exposed by the queue. A removed job has no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parent job data: the bundle as requested by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePayload {
    pub name: String,
}

/// Child job data: one file to fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub name: String,
    pub url: String,
}

/// Job data tagged by job name, decoded once at the worker boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    Bundle(BundlePayload),
    Download(DownloadPayload),
}

impl JobPayload {
    pub fn job_name(&self) -> &'static str {
        match self {
            JobPayload::Bundle(_) => "bundle",
            JobPayload::Download(_) => "download",
        }
    }
}

/// A durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub parent_id: Option<JobId>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Wake-up time while delayed; `None` while delayed means paused
    pub delay_until_ms: Option<i64>,
    pub failed_reason: Option<String>,
    pub created_at_ms: i64,
    pub processed_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

impl QueueJob {
    /// Delayed with no wake time: the paused representation
    pub fn is_paused(&self) -> bool {
        self.state == JobState::Delayed && self.delay_until_ms.is_none()
    }

    /// A download in the part queue; bundles and stray jobs are not parts
    pub fn is_part(&self) -> bool {
        self.queue == PART_QUEUE && self.download().is_some()
    }

    pub fn download(&self) -> Option<&DownloadPayload> {
        match &self.payload {
            JobPayload::Download(payload) => Some(payload),
            JobPayload::Bundle(_) => None,
        }
    }
}

/// Submission of a single job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub payload: JobPayload,
    pub parent_id: Option<JobId>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// A parent job plus dependency-linked children
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub parent: NewJob,
    pub children: Vec<NewJob>,
}

/// Ids assigned to a submitted flow, children in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowIds {
    pub parent: JobId,
    pub children: Vec<JobId>,
}

/// Children of a parent split by whether the queue has finished with them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dependencies {
    pub processed: BTreeSet<JobId>,
    pub unprocessed: BTreeSet<JobId>,
}

impl Dependencies {
    pub fn total(&self) -> usize {
        self.processed.len() + self.unprocessed.len()
    }

    pub fn all(&self) -> impl Iterator<Item = &JobId> {
        self.processed.iter().chain(self.unprocessed.iter())
    }
}

/// Result of reporting a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued by the retry policy, wakes at the given time
    Retrying { attempts_made: u32, wake_at_ms: i64 },
    /// Retry budget exhausted
    Failed { attempts_made: u32 },
}

impl FailOutcome {
    pub fn is_final(&self) -> bool {
        matches!(self, FailOutcome::Failed { .. })
    }

    pub fn attempts_made(&self) -> u32 {
        match self {
            FailOutcome::Retrying { attempts_made, .. } | FailOutcome::Failed { attempts_made } => {
                *attempts_made
            }
        }
    }
}
