use crate::{
    domain::{SampledResult, SessionStats},
    routes::ApiError,
    server::SharedState,
};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub pending: i64,
    pub sampled: i64,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct SampledQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[instrument(skip(state))]
pub async fn session_stats(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state
        .store
        .session_stats(&session_id)
        .await?
        .ok_or(ApiError::SessionNotFound(session_id))?;

    Ok(Json(StatsResponse::from_stats(stats, Utc::now())))
}

impl StatsResponse {
    fn from_stats(stats: SessionStats, now: DateTime<Utc>) -> Self {
        let session = stats.session;
        let duration = session.end_time.unwrap_or(now) - session.start_time;

        Self {
            start_time: session.start_time,
            end_time: session.end_time,
            duration_seconds: duration.num_seconds(),
            accepted: stats.accepted,
            rejected: stats.rejected,
            pending: stats.pending,
            sampled: stats.sampled,
            total: stats.total,
        }
    }
}

#[instrument(skip(state))]
pub async fn sampled_results(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<SampledQuery>,
) -> Result<Json<Vec<SampledResult>>, ApiError> {
    if query.limit < 1 {
        return Err(ApiError::BadRequest("limit must be positive".to_string()));
    }
    let sampled = state
        .store
        .sampled_results(&session_id, query.limit)
        .await?;
    Ok(Json(sampled))
}
