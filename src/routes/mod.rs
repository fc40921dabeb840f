mod classify;
mod error;
mod health;
mod metrics;
mod sessions;
mod stats;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use error::ApiError;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/session/start", post(sessions::start_session))
        .route("/session/{session_id}", get(sessions::get_session))
        .route("/session/{session_id}/stop", post(sessions::stop_session))
        .route("/stats/{session_id}", get(stats::session_stats))
        .route("/stats/sampled/{session_id}", get(stats::sampled_results))
        .route(
            "/classification/{session_id}/classify",
            get(classify::classify_stream),
        )
}
