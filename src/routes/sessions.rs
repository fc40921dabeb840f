use crate::{
    domain::{SampledResult, Session, SessionStatus},
    orchestrator::ControlSignal,
    routes::ApiError,
    server::SharedState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

const STOP_SAMPLE_LIMIT: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct CreateSession {
    pub lot_id: String,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    SessionStatus::Active.as_str().to_string()
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: SessionStatus,
    pub sampled_data: Vec<SampledResult>,
}

#[instrument(skip(state))]
pub async fn start_session(
    State(state): State<SharedState>,
    Json(request): Json<CreateSession>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    if request.lot_id.trim().is_empty() {
        return Err(ApiError::BadRequest("lot_id must not be empty".to_string()));
    }
    let status = SessionStatus::try_from(request.status.as_str()).map_err(ApiError::BadRequest)?;

    let session = state.store.create_session(&request.lot_id, status).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .store
        .get_session(&session_id)
        .await?
        .map(Json)
        .ok_or(ApiError::SessionNotFound(session_id))
}

/// Stops the session and tells any stream running for it to close.
#[instrument(skip(state))]
pub async fn stop_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let session = state.store.stop_session(&session_id).await?;

    if state
        .control
        .send(ControlSignal::SessionStopped(session.id))
        .is_err()
    {
        tracing::debug!("No running streams to notify for session {}", session.id);
    }

    let sampled_data = state
        .store
        .sampled_results(&session.id.to_string(), STOP_SAMPLE_LIMIT)
        .await?;

    Ok(Json(StopResponse {
        status: session.status,
        sampled_data,
    }))
}
