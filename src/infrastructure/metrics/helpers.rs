//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    DELIVERY_TASK_RUNS_TOTAL, DTX_IN_DOUBT, DTX_OPERATIONS_TOTAL, IN_MEMORY_MESSAGES,
    MESSAGES_ACKNOWLEDGED_TOTAL, MESSAGES_DELIVERED_TOTAL, QUEUE_ENQUEUED_TOTAL,
    QUEUE_PURGED_TOTAL, QUEUE_REJECTED_TOTAL, QUEUE_REQUEUED_TOTAL, STORE_ERRORS_TOTAL,
    STORE_OPERATION_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued() {
        QUEUE_ENQUEUED_TOTAL.inc();
        IN_MEMORY_MESSAGES.inc();
    }

    pub fn record_rejected() {
        QUEUE_REJECTED_TOTAL.inc();
    }

    pub fn record_requeued() {
        QUEUE_REQUEUED_TOTAL.inc();
    }

    /// Purged messages leave memory without an acknowledgement
    pub fn record_purged(count: u64) {
        QUEUE_PURGED_TOTAL.inc_by(count);
        IN_MEMORY_MESSAGES.sub(count as i64);
    }

    /// Stored messages loaded into memory were never counted as enqueued
    pub fn record_restored(count: u64) {
        IN_MEMORY_MESSAGES.add(count as i64);
    }

    pub fn record_discarded(count: u64) {
        IN_MEMORY_MESSAGES.sub(count as i64);
    }

    /// A transaction committed on one queue: staged enqueues become
    /// visible and detached buffered messages leave memory.
    pub fn record_committed(enqueues: u64, detaches: u64) {
        QUEUE_ENQUEUED_TOTAL.inc_by(enqueues);
        IN_MEMORY_MESSAGES.add(enqueues as i64 - detaches as i64);
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_delivered(redelivery: bool) {
        let kind = if redelivery { "redelivery" } else { "fresh" };
        MESSAGES_DELIVERED_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_acknowledged() {
        MESSAGES_ACKNOWLEDGED_TOTAL.inc();
        IN_MEMORY_MESSAGES.dec();
    }

    pub fn record_task_run(hint: &str) {
        DELIVERY_TASK_RUNS_TOTAL.with_label_values(&[hint]).inc();
    }
}

/// Helper struct for recording distributed transaction metrics
pub struct DtxMetrics;

impl DtxMetrics {
    pub fn record(phase: &str, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        DTX_OPERATIONS_TOTAL.with_label_values(&[phase, outcome]).inc();
    }

    pub fn set_in_doubt(count: usize) {
        DTX_IN_DOUBT.set(count as i64);
    }
}

/// Helper struct for durable store metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_latency(operation: &str, elapsed: Duration) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(operation: &str) {
        STORE_ERRORS_TOTAL.with_label_values(&[operation]).inc();
    }
}
