//! Out-of-band control plane for cooperative pause and cancel.
//!
//! The queue cannot interrupt a job a worker has leased, so intents travel
//! over the [`ControlBus`] instead. Each process holds one [`ControlInbox`]
//! subscription that routes commands to the worker owning the job, and
//! [`JobControl`] is the API-side entry point deciding whether a command can
//! be applied to the queue directly or has to go through the bus.

pub mod bus;
pub mod inbox;
pub mod service;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::queue::JobId;

pub use bus::{BusSubscription, ControlBus};
pub use inbox::{ControlInbox, ControlWatch};
pub use service::{CancelOutcome, ControlError, JobControl, PauseOutcome, ResumeOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Pause,
    Cancel,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlKind::Pause => f.write_str("pause"),
            ControlKind::Cancel => f.write_str("cancel"),
        }
    }
}

/// Transient intent addressed to whichever worker owns `job_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub kind: ControlKind,
    pub job_id: JobId,
}

impl ControlCommand {
    pub fn pause(job_id: JobId) -> Self {
        Self {
            kind: ControlKind::Pause,
            job_id,
        }
    }

    pub fn cancel(job_id: JobId) -> Self {
        Self {
            kind: ControlKind::Cancel,
            job_id,
        }
    }
}
