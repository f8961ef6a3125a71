//! Non-durable in-memory queue.

use crate::infrastructure::error::{BrokerError, Result};
use crate::message::{Message, MessageId};
use crate::observe::StagedCounts;
use crate::transaction::Xid;

use super::buffer::QueueBuffer;
use super::Queue;

/// In-memory queue, bounded for non-durable queues and unbounded when used
/// as a redelivery queue.
#[derive(Debug)]
pub struct MemQueue {
    name: String,
    auto_delete: bool,
    buffer: QueueBuffer,
}

impl MemQueue {
    pub fn bounded(name: impl Into<String>, capacity: usize, auto_delete: bool) -> Self {
        Self {
            name: name.into(),
            auto_delete,
            buffer: QueueBuffer::new(Some(capacity)),
        }
    }

    pub fn unbounded(name: impl Into<String>, auto_delete: bool) -> Self {
        Self {
            name: name.into(),
            auto_delete,
            buffer: QueueBuffer::new(None),
        }
    }

    /// Put a message back at the head of the queue.
    pub fn enqueue_front(&self, message: Message) {
        self.buffer.push_front(message);
    }
}

impl Queue for MemQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Option<usize> {
        self.buffer.capacity()
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    fn size(&self) -> usize {
        self.buffer.len()
    }

    fn enqueue(&self, message: Message) -> std::result::Result<(), Message> {
        self.buffer.push_back(message)
    }

    fn dequeue(&self) -> Option<Message> {
        self.buffer.pop_front()
    }

    fn detach(&self, message_id: MessageId) -> bool {
        match self.buffer.remove(message_id) {
            Some(message) => {
                message.release();
                true
            }
            None => false,
        }
    }

    fn prepare_enqueue(&self, xid: &Xid, message: Message) -> Result<()> {
        self.buffer.stage_enqueue(xid, message).map_err(|rejected| {
            let err = BrokerError::Validation(format!(
                "Queue {} is full, cannot stage message {} for {}",
                self.name,
                rejected.id(),
                xid
            ));
            rejected.release();
            err
        })
    }

    fn prepare_detach(&self, xid: &Xid, message_id: MessageId) -> Result<()> {
        self.buffer.stage_detach(xid, message_id);
        Ok(())
    }

    fn commit(&self, xid: &Xid) -> StagedCounts {
        self.buffer.commit(xid)
    }

    fn rollback(&self, xid: &Xid) -> StagedCounts {
        self.buffer.rollback(xid)
    }

    fn clear(&self) -> usize {
        self.buffer.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;

    fn message(id: u64) -> Message {
        Message::new(MessageId::new(id), Metadata::new("ex", "q"), Vec::new())
    }

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let queue = MemQueue::bounded("q", 2, false);
        assert!(queue.enqueue(message(1)).is_ok());
        assert!(queue.enqueue(message(2)).is_ok());

        let rejected = queue.enqueue(message(3)).unwrap_err();
        assert_eq!(rejected.id(), MessageId::new(3));
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_unbounded_queue_accepts_everything() {
        let queue = MemQueue::unbounded("q", false);
        for id in 0..100 {
            queue.enqueue(message(id)).unwrap();
        }
        assert_eq!(queue.size(), 100);
        assert_eq!(queue.capacity(), None);
    }

    #[test]
    fn test_prepare_enqueue_on_full_queue_is_validation_error() {
        let queue = MemQueue::bounded("q", 1, false);
        queue.enqueue(message(1)).unwrap();
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());

        let err = queue.prepare_enqueue(&xid, message(2)).unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }

    #[test]
    fn test_detach_and_clear() {
        let queue = MemQueue::unbounded("q", true);
        queue.enqueue(message(1)).unwrap();
        queue.enqueue(message(2)).unwrap();

        assert!(queue.detach(MessageId::new(1)));
        assert!(!queue.detach(MessageId::new(1)));
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert!(queue.is_auto_delete());
    }
}
