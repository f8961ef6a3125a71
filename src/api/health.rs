//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreHealthResponse,
    pub queues: usize,
    pub scheduled_tasks: usize,
    pub in_doubt_transactions: usize,
}

#[derive(Debug, Serialize)]
pub struct StoreHealthResponse {
    pub backend: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker = &state.broker;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        store: StoreHealthResponse {
            backend: broker.store().backend_name().to_string(),
        },
        queues: broker.queue_count(),
        scheduled_tasks: broker.scheduler().task_count(),
        in_doubt_transactions: broker.in_doubt_xids().len(),
    })
}
