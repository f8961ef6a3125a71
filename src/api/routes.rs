use axum::{routing::get, Router};

use crate::server::AppState;

use super::dtx::in_doubt;
use super::health::health;
use super::metrics::prometheus_metrics;
use super::queues::{get_queue, list_queues, purge_queue};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/queues", get(list_queues))
        .route("/queues/{name}", get(get_queue))
        .route("/queues/{name}/messages", axum::routing::delete(purge_queue))
        .route("/dtx/in-doubt", get(in_doubt))
}
