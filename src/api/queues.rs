//! Queue inspection and purge endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::broker::QueueInfo;
use crate::infrastructure::error::{BrokerError, Result};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct QueueListResponse {
    pub queues: Vec<QueueInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub queue: String,
    pub discarded: usize,
}

/// GET /queues
pub async fn list_queues(State(state): State<AppState>) -> Json<QueueListResponse> {
    let queues = state.broker.queues();
    let total = queues.len();
    Json(QueueListResponse { queues, total })
}

/// GET /queues/{name}
pub async fn get_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueInfo>> {
    state
        .broker
        .queue_info(&name)
        .map(Json)
        .ok_or_else(|| BrokerError::NotFound(format!("queue {}", name)))
}

/// DELETE /queues/{name}/messages
///
/// Rejected with 400 while consumers are attached.
pub async fn purge_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PurgeResponse>> {
    let discarded = state.broker.purge(&name).await?;
    tracing::info!(queue = %name, discarded = discarded, "Queue purged via admin API");
    Ok(Json(PurgeResponse {
        queue: name,
        discarded,
    }))
}
