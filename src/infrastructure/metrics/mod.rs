//! Prometheus metrics for the broker core.
//!
//! - Queue metrics (enqueued, rejected, requeued, purged, in-memory depth)
//! - Delivery metrics (delivered, acknowledged, task invocations by hint)
//! - Distributed transaction metrics (prepare, commit, rollback)
//! - Durable store latency

mod helpers;

pub use helpers::{encode_metrics, DeliveryMetrics, DtxMetrics, QueueMetrics, StoreMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_broker";

lazy_static! {
    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Messages currently held in memory by all queue handlers
    pub static ref IN_MEMORY_MESSAGES: IntGauge = register_int_gauge!(
        format!("{}_in_memory_messages", METRIC_PREFIX),
        "Messages currently held in memory by queue handlers"
    ).unwrap();

    pub static ref QUEUES_DECLARED: IntGauge = register_int_gauge!(
        format!("{}_queues_declared", METRIC_PREFIX),
        "Number of declared queues"
    ).unwrap();

    /// Per-queue depth, refreshed on every scrape
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Messages in a queue including those awaiting redelivery",
        &["queue"]
    ).unwrap();

    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_enqueued_total", METRIC_PREFIX),
        "Total messages accepted by queues"
    ).unwrap();

    /// Enqueue attempts refused because a bounded queue was full
    pub static ref QUEUE_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_rejected_total", METRIC_PREFIX),
        "Total messages rejected by full bounded queues"
    ).unwrap();

    pub static ref QUEUE_REQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_requeued_total", METRIC_PREFIX),
        "Total messages returned to redelivery queues"
    ).unwrap();

    pub static ref QUEUE_PURGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queue_purged_total", METRIC_PREFIX),
        "Total messages discarded by queue purges"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages handed to consumers",
        &["kind"]
    ).unwrap();

    pub static ref MESSAGES_ACKNOWLEDGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_acknowledged_total", METRIC_PREFIX),
        "Total messages acknowledged by consumers"
    ).unwrap();

    pub static ref DELIVERY_TASK_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_task_runs_total", METRIC_PREFIX),
        "Delivery task invocations by returned hint",
        &["hint"]
    ).unwrap();

    // ============================================================================
    // Distributed Transaction Metrics
    // ============================================================================

    pub static ref DTX_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dtx_operations_total", METRIC_PREFIX),
        "Distributed transaction operations by phase and outcome",
        &["phase", "outcome"]
    ).unwrap();

    pub static ref DTX_IN_DOUBT: IntGauge = register_int_gauge!(
        format!("{}_dtx_in_doubt", METRIC_PREFIX),
        "Prepared transaction branches awaiting commit or rollback"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_latency_seconds", METRIC_PREFIX),
        "Durable store transaction latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Durable store transaction failures",
        &["operation"]
    ).unwrap();
}
