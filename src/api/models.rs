//! Request and response bodies of the HTTP surface.
//!
//! Creating a bundle:
//!
//! ```json
//! POST /bundles
//! { "name": "X", "urls": ["http://a/1", "http://a/2"] }
//! ```
//!
//! answers `201 Created` with the parent id and one child id per URL, in
//! request order:
//!
//! ```json
//! { "bundle_id": 0, "part_ids": [1, 2] }
//! ```
//!
//! Lifecycle and progress are pushed on `GET /bundles/stream` and
//! `GET /parts/stream`; the other GET routes are snapshots a reconnecting
//! client uses to catch up.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::control::{CancelOutcome, PauseOutcome, ResumeOutcome};
use crate::flow::{Bundle, PartSummary};
use crate::observability::MetricsSnapshot;
use crate::queue::JobId;

#[derive(Debug, Deserialize, Clone)]
pub struct CreateBundleRequest {
    pub name: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BundleCreatedResponse {
    pub bundle_id: JobId,
    pub part_ids: Vec<JobId>,
}

#[derive(Debug, Serialize)]
pub struct BundleResponse {
    #[serde(flatten)]
    pub bundle: Bundle,
    pub parts: Vec<PartSummary>,
}

#[derive(Debug, Serialize)]
pub struct BundleListResponse {
    pub bundles: Vec<Bundle>,
}

#[derive(Debug, Serialize)]
pub struct PartListResponse {
    pub parts: Vec<PartSummary>,
}

/// Result of a pause, resume or cancel request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub id: JobId,
    pub outcome: String,
}

impl ControlResponse {
    pub fn paused(id: JobId, outcome: PauseOutcome) -> Self {
        let outcome = match outcome {
            PauseOutcome::Paused => "paused",
            PauseOutcome::Signalled => "signalled",
            PauseOutcome::Unchanged => "unchanged",
        };
        Self {
            id,
            outcome: outcome.to_string(),
        }
    }

    pub fn resumed(id: JobId, outcome: ResumeOutcome) -> Self {
        let outcome = match outcome {
            ResumeOutcome::Resumed => "resumed",
            ResumeOutcome::Unchanged => "unchanged",
        };
        Self {
            id,
            outcome: outcome.to_string(),
        }
    }

    pub fn cancelled(id: JobId, outcome: CancelOutcome) -> Self {
        let outcome = match outcome {
            CancelOutcome::Removed => "removed",
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::Signalled => "signalled",
            CancelOutcome::Unchanged => "unchanged",
        };
        Self {
            id,
            outcome: outcome.to_string(),
        }
    }
}

/// Query of the stream routes: `?topics=progress,completed`
#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    #[serde(default)]
    pub topics: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
    pub rate_budget: String,
    pub metrics: MetricsSnapshot,
}
