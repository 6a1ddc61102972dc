//! Run API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mps_relay_core::{
    OrchestratorError, ProgressSnapshot, RunId, RunReport, RunRequest, RunSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::{RUNS_REJECTED_TOTAL, RUNS_STARTED_TOTAL};
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Response for a newly started run
#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub jobs: usize,
    pub concurrency_limit: usize,
}

/// Full state of one run
#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    pub summary: RunSummary,
    pub snapshot: ProgressSnapshot,
    /// Present once every job has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
}

/// Request body for changing a run's concurrency limit
#[derive(Debug, Deserialize)]
pub struct SetConcurrencyBody {
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct ConcurrencyResponse {
    pub run_id: RunId,
    pub limit: usize,
    /// Slots held right now; may exceed `limit` right after a shrink.
    pub in_use: usize,
}

/// Simple message response
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn run_not_found(run_id: &RunId) -> ApiError {
    error(StatusCode::NOT_FOUND, format!("Run not found: {}", run_id))
}

fn orchestrator_error(e: OrchestratorError) -> ApiError {
    let (status, reason) = match &e {
        OrchestratorError::NoInputs => (StatusCode::BAD_REQUEST, "no_inputs"),
        OrchestratorError::InvalidConcurrency(_) => {
            (StatusCode::BAD_REQUEST, "invalid_concurrency")
        }
        OrchestratorError::StorageNotConfigured => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage_not_configured")
        }
        OrchestratorError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
        }
    };
    RUNS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    warn!(reason, "Run rejected: {}", e);
    error(status, e.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a run
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<CreateRunResponse>), ApiError> {
    let handle = state.start_run(request).await.map_err(orchestrator_error)?;
    let snapshot = handle.snapshot();

    RUNS_STARTED_TOTAL
        .with_label_values(&[handle.mode().as_str()])
        .inc();
    info!(run_id = %handle.run_id(), jobs = snapshot.jobs.len(), "Run accepted");

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run_id: handle.run_id().clone(),
            jobs: snapshot.jobs.len(),
            concurrency_limit: handle.concurrency_limit(),
        }),
    ))
}

/// List runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<Vec<RunSummary>> {
    Json(state.run_summaries())
}

/// Get a run's snapshot, plus its report once finished
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let run_id = RunId::from(id.as_str());
    let handle = state.run(&run_id).ok_or_else(|| run_not_found(&run_id))?;

    Ok(Json(RunDetailResponse {
        summary: handle.summary(),
        snapshot: handle.snapshot(),
        report: handle.report().map(|report| report.as_ref().clone()),
    }))
}

/// Cancel every unfinished job of a run
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let run_id = RunId::from(id.as_str());
    let handle = state.run(&run_id).ok_or_else(|| run_not_found(&run_id))?;

    if handle.is_finished() {
        return Err(error(
            StatusCode::CONFLICT,
            format!("Run {} has already finished", run_id),
        ));
    }
    handle.cancel();

    Ok(Json(MessageResponse {
        message: format!("Run {} cancellation requested", run_id),
    }))
}

/// Change a run's concurrency limit
pub async fn set_concurrency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetConcurrencyBody>,
) -> Result<Json<ConcurrencyResponse>, ApiError> {
    let run_id = RunId::from(id.as_str());
    let handle = state.run(&run_id).ok_or_else(|| run_not_found(&run_id))?;

    let limit = handle
        .set_concurrency(body.limit)
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(ConcurrencyResponse {
        run_id,
        limit,
        in_use: handle.gate().in_use(),
    }))
}
