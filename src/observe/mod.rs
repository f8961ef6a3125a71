//! Observer capability for broker events.
//!
//! Every component that emits metrics or trace events does so through an
//! injected [`BrokerObserver`]. Hooks are fire-and-forget: they return `()`
//! and must never influence the operation they observe, so [`NoOpObserver`]
//! can replace [`TelemetryObserver`] with no change in behavior.

mod telemetry_observer;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::delivery::TaskHint;
use crate::message::{Message, MessageId};
use crate::transaction::Xid;

pub use telemetry_observer::TelemetryObserver;

/// Kind of operation staged under a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    Enqueue,
    Detach,
}

impl StagedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Detach => "detach",
        }
    }
}

/// Staged operations one queue applied or discarded when a transaction
/// resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagedCounts {
    pub enqueues: usize,
    /// Detaches that removed a message still buffered in the queue
    pub detaches: usize,
}

impl StagedCounts {
    pub fn total(&self) -> usize {
        self.enqueues + self.detaches
    }
}

/// Phase of a distributed transaction as seen by the store coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxPhase {
    Prepare,
    Commit,
    Rollback,
}

impl DtxPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Hooks invoked around queue, delivery and store operations.
///
/// All methods default to doing nothing.
#[allow(unused_variables)]
pub trait BrokerObserver: Send + Sync {
    /// A message was offered to a queue; `accepted` is false on capacity rejection.
    fn on_enqueue(&self, queue: &str, message_id: MessageId, accepted: bool) {}

    fn on_take_for_delivery(&self, queue: &str, message: &Message) {}

    fn on_deliver(
        &self,
        queue: &str,
        consumer_id: Uuid,
        message_id: MessageId,
        redelivered: bool,
    ) {
    }

    fn on_acknowledge(&self, queue: &str, message_id: MessageId) {}

    fn on_requeue(&self, queue: &str, message: &Message) {}

    fn on_purge(&self, queue: &str, discarded: usize) {}

    /// Messages taken into a handler's keeping without an enqueue, such as
    /// stored messages loaded at declare time.
    fn on_restore(&self, queue: &str, count: usize) {}

    /// Messages dropped because their queue was deleted.
    fn on_discard(&self, queue: &str, discarded: usize) {}

    fn on_stage(&self, queue: &str, xid: &Xid, kind: StagedKind) {}

    /// Staged operations on one queue were committed or rolled back.
    fn on_queue_resolve(&self, queue: &str, xid: &Xid, committed: bool, counts: StagedCounts) {}

    fn on_store_operation(&self, operation: &'static str, elapsed: Duration, success: bool) {}

    fn on_dtx(&self, phase: DtxPhase, xid: &Xid, success: bool) {}

    /// Number of prepared, unresolved transactions changed.
    fn on_in_doubt_changed(&self, count: usize) {}

    fn on_delivery_run(&self, queue: &str, hint: TaskHint, delivered: usize) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl BrokerObserver for NoOpObserver {}

/// Shared observer handle injected into broker components.
pub type SharedObserver = Arc<dyn BrokerObserver>;

pub fn noop() -> SharedObserver {
    Arc::new(NoOpObserver)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_observer_accepts_every_hook() {
        let observer = noop();
        let message = Message::new(
            MessageId::new(1),
            crate::message::Metadata::new("ex", "key"),
            b"x".to_vec(),
        );
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());

        observer.on_enqueue("q", message.id(), true);
        observer.on_take_for_delivery("q", &message);
        observer.on_deliver("q", Uuid::new_v4(), message.id(), false);
        observer.on_acknowledge("q", message.id());
        observer.on_requeue("q", &message);
        observer.on_purge("q", 3);
        observer.on_stage("q", &xid, StagedKind::Enqueue);
        observer.on_restore("q", 2);
        observer.on_discard("q", 2);
        observer.on_queue_resolve("q", &xid, true, StagedCounts { enqueues: 1, detaches: 0 });
        observer.on_store_operation("persist", Duration::from_millis(1), true);
        observer.on_dtx(DtxPhase::Prepare, &xid, true);
        observer.on_in_doubt_changed(1);
        observer.on_delivery_run("q", TaskHint::Idle, 0);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(DtxPhase::Prepare.as_str(), "prepare");
        assert_eq!(DtxPhase::Commit.as_str(), "commit");
        assert_eq!(DtxPhase::Rollback.as_str(), "rollback");
        assert_eq!(StagedKind::Detach.as_str(), "detach");
    }
}
