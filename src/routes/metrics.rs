use crate::{routes::ApiError, server::SharedState};
use axum::extract::State;
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, ApiError> {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Metrics(e.to_string()))?;

    String::from_utf8(buffer).map_err(|e| ApiError::Metrics(e.to_string()))
}
