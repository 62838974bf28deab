//! HTTP handlers for the REST API

use axum::{extract::State, http::StatusCode, Json};
use tracing::instrument;

use super::dto::{HealthResponse, ReadinessResponse, StatusResponse};
use super::server::ApiState;

/// Liveness: the process is serving
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: 503 until every watched cache has synced
#[instrument(skip(state))]
pub async fn ready(State(state): State<ApiState>) -> (StatusCode, Json<ReadinessResponse>) {
    let synced = state.status.caches_synced();
    let code = if synced {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadinessResponse {
            ready: synced,
            caches_synced: synced,
        }),
    )
}

#[instrument(skip(state))]
pub async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        snapshot: state.status.snapshot(),
        reported_errors: state.reporter.reported(),
        last_error: state.reporter.last_error(),
    })
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
