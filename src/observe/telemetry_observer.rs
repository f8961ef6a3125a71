//! Observer that turns broker events into tracing events and Prometheus metrics.

use std::time::Duration;

use uuid::Uuid;

use crate::delivery::TaskHint;
use crate::infrastructure::metrics::{DeliveryMetrics, DtxMetrics, QueueMetrics, StoreMetrics};
use crate::message::{Message, MessageId};
use crate::transaction::Xid;

use super::{BrokerObserver, DtxPhase, StagedCounts, StagedKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryObserver;

impl TelemetryObserver {
    pub fn new() -> Self {
        Self
    }
}

impl BrokerObserver for TelemetryObserver {
    fn on_enqueue(&self, queue: &str, message_id: MessageId, accepted: bool) {
        if accepted {
            QueueMetrics::record_enqueued();
            tracing::trace!(queue = %queue, message_id = %message_id, "Message enqueued");
        } else {
            QueueMetrics::record_rejected();
            tracing::debug!(
                queue = %queue,
                message_id = %message_id,
                "Message rejected, queue at capacity"
            );
        }
    }

    fn on_take_for_delivery(&self, queue: &str, message: &Message) {
        tracing::trace!(
            queue = %queue,
            message_id = %message.id(),
            redelivered = message.is_redelivered(),
            "Message taken for delivery"
        );
    }

    fn on_deliver(
        &self,
        queue: &str,
        consumer_id: Uuid,
        message_id: MessageId,
        redelivered: bool,
    ) {
        DeliveryMetrics::record_delivered(redelivered);
        tracing::trace!(
            queue = %queue,
            consumer_id = %consumer_id,
            message_id = %message_id,
            "Message delivered"
        );
    }

    fn on_acknowledge(&self, queue: &str, message_id: MessageId) {
        DeliveryMetrics::record_acknowledged();
        tracing::trace!(queue = %queue, message_id = %message_id, "Message acknowledged");
    }

    fn on_requeue(&self, queue: &str, message: &Message) {
        QueueMetrics::record_requeued();
        tracing::debug!(
            queue = %queue,
            message_id = %message.id(),
            redelivery_count = message.redelivery_count(),
            "Message requeued for redelivery"
        );
    }

    fn on_purge(&self, queue: &str, discarded: usize) {
        QueueMetrics::record_purged(discarded as u64);
        tracing::info!(queue = %queue, discarded = discarded, "Queue purged");
    }

    fn on_restore(&self, queue: &str, count: usize) {
        QueueMetrics::record_restored(count as u64);
        tracing::debug!(queue = %queue, count = count, "Messages restored into queue");
    }

    fn on_discard(&self, queue: &str, discarded: usize) {
        QueueMetrics::record_discarded(discarded as u64);
        tracing::info!(queue = %queue, discarded = discarded, "Messages discarded with deleted queue");
    }

    fn on_stage(&self, queue: &str, xid: &Xid, kind: StagedKind) {
        tracing::trace!(queue = %queue, xid = %xid, kind = kind.as_str(), "Operation staged");
    }

    fn on_queue_resolve(&self, queue: &str, xid: &Xid, committed: bool, counts: StagedCounts) {
        if committed {
            QueueMetrics::record_committed(counts.enqueues as u64, counts.detaches as u64);
        }
        tracing::debug!(
            queue = %queue,
            xid = %xid,
            committed = committed,
            enqueues = counts.enqueues,
            detaches = counts.detaches,
            "Staged operations resolved"
        );
    }

    fn on_store_operation(&self, operation: &'static str, elapsed: Duration, success: bool) {
        StoreMetrics::record_latency(operation, elapsed);
        if !success {
            StoreMetrics::record_error(operation);
        }
    }

    fn on_dtx(&self, phase: DtxPhase, xid: &Xid, success: bool) {
        DtxMetrics::record(phase.as_str(), success);
        if success {
            tracing::debug!(xid = %xid, phase = phase.as_str(), "Distributed transaction step completed");
        } else {
            tracing::warn!(xid = %xid, phase = phase.as_str(), "Distributed transaction step failed");
        }
    }

    fn on_in_doubt_changed(&self, count: usize) {
        DtxMetrics::set_in_doubt(count);
    }

    fn on_delivery_run(&self, queue: &str, hint: TaskHint, delivered: usize) {
        DeliveryMetrics::record_task_run(hint.as_str());
        tracing::trace!(
            queue = %queue,
            hint = hint.as_str(),
            delivered = delivered,
            "Delivery task run finished"
        );
    }
}
