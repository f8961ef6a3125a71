//! Delivery task draining one queue handler to its ready consumers.

use std::sync::Arc;

use uuid::Uuid;

use crate::consumer::DeliveryError;
use crate::observe::SharedObserver;
use crate::queue::QueueHandler;

use super::{Task, TaskHint};

pub struct MessageDeliveryTask {
    queue_handler: Arc<QueueHandler>,
    max_batch_size: usize,
    observer: SharedObserver,
}

impl MessageDeliveryTask {
    pub fn new(
        queue_handler: Arc<QueueHandler>,
        max_batch_size: usize,
        observer: SharedObserver,
    ) -> Self {
        Self {
            queue_handler,
            max_batch_size: max_batch_size.max(1),
            observer,
        }
    }

    /// One delivery round. Returns the hint and the number of messages sent.
    fn deliver(&self) -> (TaskHint, usize) {
        let mut consumers = self.queue_handler.cyclic_consumer_iterator();
        if !consumers.has_next() {
            return (TaskHint::Idle, 0);
        }

        let queue = self.queue_handler.name();
        let mut delivered = 0;
        // First consumer found unable to take a message since the last
        // successful send. Meeting it again means a full cycle without progress.
        let mut first_not_ready: Option<Uuid> = None;

        while let Some(consumer) = consumers.next() {
            let consumer_id = consumer.id();

            if !consumer.is_ready() {
                tracing::trace!(queue = %queue, consumer_id = %consumer_id, "Consumer not ready");
                match first_not_ready {
                    Some(id) if id == consumer_id => return (TaskHint::Idle, delivered),
                    Some(_) => {}
                    None => first_not_ready = Some(consumer_id),
                }
                continue;
            }

            let Some(message) = self.queue_handler.take_for_delivery() else {
                break;
            };

            let message_id = message.id();
            let redelivered = message.is_redelivered();
            match consumer.send(message) {
                Ok(()) => {
                    self.observer
                        .on_deliver(queue, consumer_id, message_id, redelivered);
                    first_not_ready = None;
                    delivered += 1;
                    if delivered >= self.max_batch_size {
                        return (TaskHint::Active, delivered);
                    }
                }
                Err(DeliveryError { message, reason }) => {
                    tracing::warn!(
                        queue = %queue,
                        consumer_id = %consumer_id,
                        message_id = %message.id(),
                        reason = %reason,
                        "Failed to send message to consumer"
                    );
                    self.queue_handler.return_undelivered(message);
                    match first_not_ready {
                        Some(id) if id == consumer_id => return (TaskHint::Idle, delivered),
                        Some(_) => {}
                        None => first_not_ready = Some(consumer_id),
                    }
                }
            }
        }

        if delivered > 0 {
            (TaskHint::Active, delivered)
        } else {
            (TaskHint::Idle, delivered)
        }
    }
}

impl Task for MessageDeliveryTask {
    fn id(&self) -> &str {
        self.queue_handler.name()
    }

    fn call(&self) -> TaskHint {
        let (hint, delivered) = self.deliver();
        self.observer
            .on_delivery_run(self.queue_handler.name(), hint, delivered);
        hint
    }

    fn on_add(&self) {
        tracing::debug!(queue = %self.queue_handler.name(), "Delivery task scheduled");
    }

    fn on_remove(&self) {
        tracing::debug!(queue = %self.queue_handler.name(), "Delivery task removed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::consumer::{ChannelConsumer, Consumer};
    use crate::infrastructure::error::Result;
    use crate::message::{Message, MessageId, Metadata};
    use crate::observe;
    use crate::queue::MemQueue;

    fn message(id: u64) -> Message {
        Message::new(MessageId::new(id), Metadata::new("ex", "q"), Vec::new())
    }

    fn handler() -> Arc<QueueHandler> {
        Arc::new(QueueHandler::new(
            Box::new(MemQueue::bounded("q", 10_000, false)),
            observe::noop(),
        ))
    }

    /// Consumer whose readiness is toggled by the test and which counts
    /// readiness checks.
    #[derive(Debug)]
    struct StubConsumer {
        id: Uuid,
        ready: AtomicBool,
        accept: bool,
        checks: AtomicUsize,
        received: AtomicUsize,
    }

    impl StubConsumer {
        fn new(ready: bool, accept: bool) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                ready: AtomicBool::new(ready),
                accept,
                checks: AtomicUsize::new(0),
                received: AtomicUsize::new(0),
            })
        }
    }

    impl Consumer for StubConsumer {
        fn id(&self) -> Uuid {
            self.id
        }

        fn queue_name(&self) -> &str {
            "q"
        }

        fn is_ready(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.ready.load(Ordering::SeqCst)
        }

        fn send(&self, message: Message) -> std::result::Result<(), DeliveryError> {
            if self.accept {
                self.received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(DeliveryError::new(message, "rejected"))
            }
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_no_consumers_is_idle() {
        let handler = handler();
        handler.enqueue(message(1));
        let task = MessageDeliveryTask::new(handler.clone(), 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Idle);
        assert_eq!(handler.size(), 1);
    }

    #[test]
    fn test_all_consumers_not_ready_terminates_idle() {
        let handler = handler();
        handler.enqueue(message(1));
        let consumers: Vec<_> = (0..4).map(|_| StubConsumer::new(false, true)).collect();
        for consumer in &consumers {
            handler.add_consumer(consumer.clone());
        }
        let task = MessageDeliveryTask::new(handler.clone(), 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Idle);
        let checks: usize = consumers.iter().map(|c| c.checks.load(Ordering::SeqCst)).sum();
        // One full cycle plus the repeat of the first consumer
        assert_eq!(checks, 5);
        assert_eq!(handler.size(), 1);
    }

    #[test]
    fn test_single_not_ready_consumer_terminates_idle() {
        let handler = handler();
        handler.enqueue(message(1));
        handler.add_consumer(StubConsumer::new(false, true));
        let task = MessageDeliveryTask::new(handler, 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Idle);
    }

    #[test]
    fn test_drains_queue_round_robin() {
        let handler = handler();
        for id in 1..=6 {
            handler.enqueue(message(id));
        }
        let a = StubConsumer::new(true, true);
        let b = StubConsumer::new(true, true);
        handler.add_consumer(a.clone());
        handler.add_consumer(b.clone());
        let task = MessageDeliveryTask::new(handler.clone(), 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Active);
        assert!(handler.is_empty());
        assert_eq!(a.received.load(Ordering::SeqCst), 3);
        assert_eq!(b.received.load(Ordering::SeqCst), 3);

        // Nothing left to deliver
        assert_eq!(task.call(), TaskHint::Idle);
    }

    #[test]
    fn test_batch_limit_yields_active() {
        let handler = handler();
        for id in 1..=10 {
            handler.enqueue(message(id));
        }
        let consumer = StubConsumer::new(true, true);
        handler.add_consumer(consumer.clone());
        let task = MessageDeliveryTask::new(handler.clone(), 4, observe::noop());

        assert_eq!(task.call(), TaskHint::Active);
        assert_eq!(consumer.received.load(Ordering::SeqCst), 4);
        assert_eq!(handler.size(), 6);
    }

    #[test]
    fn test_skips_not_ready_consumer() {
        let handler = handler();
        for id in 1..=3 {
            handler.enqueue(message(id));
        }
        let busy = StubConsumer::new(false, true);
        let ready = StubConsumer::new(true, true);
        handler.add_consumer(busy.clone());
        handler.add_consumer(ready.clone());
        let task = MessageDeliveryTask::new(handler.clone(), 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Active);
        assert_eq!(ready.received.load(Ordering::SeqCst), 3);
        assert_eq!(busy.received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_send_keeps_message_first_in_line() {
        let handler = handler();
        handler.enqueue(message(1));
        handler.enqueue(message(2));
        handler.add_consumer(StubConsumer::new(true, false));
        let task = MessageDeliveryTask::new(handler.clone(), 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Idle);
        assert_eq!(handler.size(), 2);
        let next = handler.take_for_delivery().unwrap();
        assert_eq!(next.id(), MessageId::new(1));
        assert!(!next.is_redelivered());
    }

    #[tokio::test]
    async fn test_channel_consumer_receives_in_order() {
        let handler = handler();
        for id in 1..=3 {
            handler.enqueue(message(id));
        }
        let (consumer, mut rx) = ChannelConsumer::new("q", 8);
        handler.add_consumer(Arc::new(consumer));
        let task = MessageDeliveryTask::new(handler, 1000, observe::noop());

        assert_eq!(task.call(), TaskHint::Active);
        for id in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().id(), MessageId::new(id));
        }
    }
}
