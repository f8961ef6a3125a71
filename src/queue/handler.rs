//! Per-queue handler: admission, dispatch bookkeeping and redelivery.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::consumer::{Consumer, CyclicConsumerIterator};
use crate::infrastructure::error::{BrokerError, Result};
use crate::message::{Message, MessageId};
use crate::observe::{SharedObserver, StagedKind};
use crate::transaction::Xid;

use super::{Binding, BindingListener, MemQueue, Queue};

/// Owns one queue together with its redelivery queue, consumers and
/// binding listeners.
///
/// The redelivery queue is unbounded: it only holds messages that were
/// already resident in memory.
pub struct QueueHandler {
    queue: Box<dyn Queue>,
    redelivery_queue: MemQueue,
    consumers: DashMap<Uuid, Arc<dyn Consumer>>,
    binding_listeners: DashMap<Binding, BindingListener>,
    observer: SharedObserver,
}

impl std::fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandler")
            .field("name", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl QueueHandler {
    pub fn new(queue: Box<dyn Queue>, observer: SharedObserver) -> Self {
        let redelivery_queue = MemQueue::unbounded(queue.name(), false);
        let preloaded = queue.size();
        if preloaded > 0 {
            observer.on_restore(queue.name(), preloaded);
        }
        Self {
            queue,
            redelivery_queue,
            consumers: DashMap::new(),
            binding_listeners: DashMap::new(),
            observer,
        }
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> &dyn Queue {
        self.queue.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> bool {
        let id = consumer.id();
        let added = self.consumers.insert(id, consumer).is_none();
        if added {
            tracing::debug!(queue = %self.name(), consumer_id = %id, "Consumer added");
        }
        added
    }

    pub fn remove_consumer(&self, consumer_id: Uuid) -> bool {
        let removed = self.consumers.remove(&consumer_id).is_some();
        if removed {
            tracing::debug!(queue = %self.name(), consumer_id = %consumer_id, "Consumer removed");
        }
        removed
    }

    pub fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// True when no consumer is attached.
    pub fn is_unused(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Messages in the queue plus messages awaiting redelivery.
    pub fn size(&self) -> usize {
        self.queue.size() + self.redelivery_queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn redelivery_size(&self) -> usize {
        self.redelivery_queue.size()
    }

    /// Append a message to the queue.
    ///
    /// A full queue rejects the message: it is released and `false` is
    /// returned. The producer is not blocked.
    pub fn enqueue(&self, message: Message) -> bool {
        let message_id = message.id();
        match self.queue.enqueue(message) {
            Ok(()) => {
                self.observer.on_enqueue(self.name(), message_id, true);
                true
            }
            Err(rejected) => {
                self.observer.on_enqueue(self.name(), message_id, false);
                tracing::info!(
                    queue = %self.name(),
                    message_id = %message_id,
                    "Failed to enqueue message, queue is full"
                );
                rejected.release();
                false
            }
        }
    }

    pub fn prepare_for_enqueue(&self, xid: &Xid, message: Message) -> Result<()> {
        self.observer.on_stage(self.name(), xid, StagedKind::Enqueue);
        self.queue.prepare_enqueue(xid, message)
    }

    pub fn prepare_for_detach(&self, xid: &Xid, message_id: MessageId) -> Result<()> {
        self.observer.on_stage(self.name(), xid, StagedKind::Detach);
        self.queue.prepare_detach(xid, message_id)
    }

    pub fn commit(&self, xid: &Xid) {
        let counts = self.queue.commit(xid);
        self.observer.on_queue_resolve(self.name(), xid, true, counts);
    }

    pub fn rollback(&self, xid: &Xid) {
        let counts = self.queue.rollback(xid);
        self.observer.on_queue_resolve(self.name(), xid, false, counts);
    }

    /// Account for delivered messages this handler takes back into its
    /// keeping without an enqueue, such as acknowledgements held by a
    /// recovered transaction.
    pub fn restore_in_flight(&self, count: usize) {
        if count > 0 {
            self.observer.on_restore(self.name(), count);
        }
    }

    /// Next message to hand to a consumer. Messages awaiting redelivery are
    /// always served before fresh ones.
    pub fn take_for_delivery(&self) -> Option<Message> {
        let message = self
            .redelivery_queue
            .dequeue()
            .or_else(|| self.queue.dequeue())?;
        self.observer.on_take_for_delivery(self.name(), &message);
        Some(message)
    }

    /// Remove an acknowledged message and release it.
    pub fn dequeue(&self, message: Message) {
        self.queue.detach(message.id());
        self.observer.on_acknowledge(self.name(), message.id());
        message.release();
    }

    /// Return a message for redelivery ahead of fresh messages.
    pub fn requeue(&self, mut message: Message) {
        message.mark_redelivered();
        self.observer.on_requeue(self.name(), &message);
        if let Err(message) = self.redelivery_queue.enqueue(message) {
            tracing::warn!(
                queue = %self.name(),
                message_id = %message.id(),
                "Redelivery queue is full, enqueuing message to the queue"
            );
            self.enqueue(message);
        }
    }

    /// Put back a message that was taken for delivery but never reached a
    /// consumer. It keeps its position at the head of delivery.
    pub fn return_undelivered(&self, message: Message) {
        self.redelivery_queue.enqueue_front(message);
    }

    /// Fresh round-robin view over the consumers attached right now.
    pub fn cyclic_consumer_iterator(&self) -> CyclicConsumerIterator {
        CyclicConsumerIterator::new(self.consumers())
    }

    /// Drop every message in the queue and the redelivery queue.
    ///
    /// Only allowed while no consumer is attached.
    pub fn purge(&self) -> Result<usize> {
        let consumer_count = self.consumer_count();
        if consumer_count > 0 {
            return Err(BrokerError::Validation(format!(
                "Cannot purge queue {} since there are {} active consumer(s)",
                self.name(),
                consumer_count
            )));
        }

        let discarded = self.queue.clear() + self.redelivery_queue.clear();
        self.observer.on_purge(self.name(), discarded);
        Ok(discarded)
    }

    /// Drop every buffered message because the queue is going away.
    ///
    /// Unlike [`purge`](Self::purge) this ignores attached consumers.
    pub fn discard(&self) -> usize {
        let discarded = self.queue.clear() + self.redelivery_queue.clear();
        if discarded > 0 {
            self.observer.on_discard(self.name(), discarded);
        }
        discarded
    }

    pub fn add_binding(&self, binding: Binding, listener: BindingListener) {
        self.binding_listeners.insert(binding, listener);
    }

    pub fn remove_binding(&self, binding: &Binding) -> bool {
        self.binding_listeners.remove(binding).is_some()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.binding_listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn close_all_consumers(&self) {
        let ids: Vec<Uuid> = self.consumers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, consumer)) = self.consumers.remove(&id) {
                if let Err(e) = consumer.close() {
                    tracing::error!(
                        queue = %self.name(),
                        consumer_id = %id,
                        error = %e,
                        "Error occurred while closing consumer"
                    );
                }
            }
        }
    }

    /// Close every consumer, then fire every binding listener.
    ///
    /// Consumer close failures are logged and do not stop the teardown.
    /// Listener failures are all attempted; the first one is returned.
    pub fn release_resources(&self) -> Result<()> {
        self.close_all_consumers();

        let bindings = self.bindings();
        let mut first_error = None;
        for binding in bindings {
            if let Some((binding, listener)) = self.binding_listeners.remove(&binding) {
                if let Err(e) = listener(&binding) {
                    tracing::error!(binding = %binding, error = %e, "Binding listener failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
