//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::infrastructure::metrics::{self, QUEUES_DECLARED, QUEUE_DEPTH};
use crate::server::AppState;

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

fn update_metrics_from_state(state: &AppState) {
    let queues = state.broker.queues();
    QUEUES_DECLARED.set(queues.len() as i64);
    QUEUE_DEPTH.reset();
    for queue in &queues {
        QUEUE_DEPTH
            .with_label_values(&[queue.name.as_str()])
            .set(queue.size as i64);
    }
}
