use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use super::{ApiError, ApiJsonResult, AppState};
use crate::{
    supervisor::SessionInfo,
    types::{JobId, JobStart, StartOutcome},
};

pub fn stream_router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(sessions))
        .route("/streams/{id}/start", post(start))
        .route("/streams/{id}/stop", post(stop))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeResponse {
    job_id: JobId,
    outcome: String,
}

async fn sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.dispatcher.sessions().await)
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiJsonResult<OutcomeResponse> {
    let outcome = state
        .dispatcher
        .request_job_start(JobStart::immediate(id), &state.media_dir)
        .await?;
    match &outcome {
        StartOutcome::UnknownJob => {
            return Err(ApiError::not_found(anyhow::anyhow!("job {} not found", id)));
        }
        StartOutcome::Failed(reason) => {
            log::warn!("API: start of job {} failed: {}", id, reason);
        }
        _ => {}
    }
    Ok(Json(OutcomeResponse {
        job_id: id,
        outcome: outcome.to_string(),
    }))
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiJsonResult<OutcomeResponse> {
    let outcome = state.dispatcher.request_stop(id).await?;
    Ok(Json(OutcomeResponse {
        job_id: id,
        outcome: outcome.to_string(),
    }))
}
