//! Prometheus scrape endpoint.

use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};

use crate::server::AppState;

/// Metrics in Prometheus text exposition format.
pub async fn prometheus_metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not enabled".to_string(),
        ),
    }
}
