use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use std::collections::HashMap;
use tracing::info;

use super::{
    error::ApiError,
    models::{
        BundleCreatedResponse, BundleListResponse, BundleResponse, ControlResponse,
        CreateBundleRequest, HealthResponse, PartListResponse,
    },
    state::AppState,
    utils,
    validation::validate_bundle,
};
use crate::control::{CancelOutcome, PauseOutcome};
use crate::flow::{PartState, PartSummary};
use crate::humanize::format_rate;
use crate::progress::Topic;
use crate::queue::JobId;

/// Bundle creation endpoint (POST /bundles)
///
/// Validates `{name, urls}` and creates the parent job plus one part per
/// URL in a single queue submission. Either all jobs exist afterwards or
/// none do.
pub async fn create_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;
    utils::parse_content_type(content_type)?;

    let max_payload = state.config.api.max_payload_bytes.as_u64() as usize;
    let body_bytes = read_body(body, max_payload).await?;

    let request: CreateBundleRequest = serde_json::from_slice(&body_bytes)?;
    validate_bundle(&request, &state.config.api)?;

    let ids = state
        .flow
        .create_bundle(request.name.trim(), &request.urls)
        .await?;
    state.metrics.bundle_created();

    if let Some(bundle) = state.flow.bundle(ids.parent).await? {
        state.pipeline.bundle_event(Topic::Active, bundle);
    }

    let response = BundleCreatedResponse {
        bundle_id: ids.parent,
        part_ids: ids.children,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Reads the request body and enforces the size limit
///
/// Decompression is handled by `RequestDecompressionLayer`, so the limit
/// applies to the decompressed bytes.
async fn read_body(body: axum::body::Body, max_size: usize) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    utils::validate_body_size(&data, max_size)?;
    Ok(data)
}

/// Bundle snapshot (GET /bundles/{id}): membership plus every part still on record
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(bundle_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let bundle = state
        .flow
        .bundle(bundle_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("bundle {bundle_id}")))?;

    let mut parts = Vec::with_capacity(bundle.part_ids.len());
    for part_id in &bundle.part_ids {
        if let Some(summary) = state.pipeline.part_summary(*part_id).await? {
            parts.push(summary);
        }
    }

    Ok(Json(BundleResponse { bundle, parts }))
}

/// Bundles with unprocessed parts (GET /bundles/active)
pub async fn active_bundles(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut bundles = Vec::new();
    for bundle_id in state.flow.active_bundles().await? {
        if let Some(bundle) = state.flow.bundle(bundle_id).await? {
            bundles.push(bundle);
        }
    }
    Ok(Json(BundleListResponse { bundles }))
}

/// Aggregate progress of one bundle (GET /bundles/{id}/progress)
pub async fn bundle_progress(
    State(state): State<AppState>,
    Path(bundle_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state.pipeline.bundle_progress(bundle_id).await?;
    Ok(Json(progress))
}

/// Part snapshot (GET /parts/{id})
pub async fn get_part(
    State(state): State<AppState>,
    Path(part_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = state
        .pipeline
        .part_summary(part_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("part {part_id}")))?;
    Ok(Json(summary))
}

/// GET /parts/active
pub async fn active_parts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    parts_in_state(&state, PartState::Active).await
}

/// GET /parts/paused
pub async fn paused_parts(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    parts_in_state(&state, PartState::Paused).await
}

async fn parts_in_state(
    state: &AppState,
    part_state: PartState,
) -> Result<Json<PartListResponse>, ApiError> {
    let parts = state
        .flow
        .parts_in_state(part_state)
        .await?
        .iter()
        .map(|job| {
            let sample = state.pipeline.aggregator().sample(job.id);
            PartSummary::from_job(job, sample.as_ref())
        })
        .collect();
    Ok(Json(PartListResponse { parts }))
}

/// PATCH /parts/{id}/pause
///
/// A part no worker holds is paused in the queue right away. A running part
/// is signalled and pauses at its next checkpoint; that answer is
/// `202 Accepted` with outcome `signalled`.
pub async fn pause_part(
    State(state): State<AppState>,
    Path(part_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.control.pause(part_id).await?;
    info!(job_id = %part_id, ?outcome, "Pause requested");
    let status = if outcome == PauseOutcome::Signalled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ControlResponse::paused(part_id, outcome))))
}

/// PATCH /parts/{id}/resume
pub async fn resume_part(
    State(state): State<AppState>,
    Path(part_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.control.resume(part_id).await?;
    info!(job_id = %part_id, ?outcome, "Resume requested");
    Ok((StatusCode::OK, Json(ControlResponse::resumed(part_id, outcome))))
}

/// DELETE /parts/{id}
///
/// Missing and finished parts answer `unchanged`; cancelling is idempotent.
/// A stopped part with a partial file answers `cancelled` and loses the file.
pub async fn cancel_part(
    State(state): State<AppState>,
    Path(part_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.control.cancel(part_id).await?;
    info!(job_id = %part_id, ?outcome, "Cancel requested");
    if matches!(outcome, CancelOutcome::Removed | CancelOutcome::Cancelled) {
        state.metrics.part_cancelled();
    }
    let status = if outcome == CancelOutcome::Signalled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ControlResponse::cancelled(part_id, outcome))))
}

/// Health check endpoint (GET /health)
///
/// Returns 503 when the queue cannot be read.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let queue_status = match state.queue.health_check().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {}", e),
    };
    components.insert("queue".to_string(), queue_status);
    components.insert(
        "parts_hub".to_string(),
        format!(
            "{} subscribers",
            state.pipeline.parts_hub().subscriber_count()
        ),
    );
    components.insert(
        "bundles_hub".to_string(),
        format!(
            "{} subscribers",
            state.pipeline.bundles_hub().subscriber_count()
        ),
    );

    let all_healthy = components
        .values()
        .all(|status| !status.starts_with("unhealthy"));
    let (status_code, overall_status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
        rate_budget: format_rate(state.limiter.bytes_per_sec()),
        metrics: state.metrics.snapshot(),
    };

    (status_code, Json(response))
}
