//! Durable queue backed by the message store.
//!
//! Message persistence happens in the broker before the in-memory buffer is
//! touched; the queue itself keeps the delivery order of stored messages.

use std::sync::Arc;

use crate::infrastructure::error::Result;
use crate::message::{Message, MessageId};
use crate::observe::StagedCounts;
use crate::store::MessageStore;
use crate::transaction::Xid;

use super::buffer::QueueBuffer;
use super::Queue;

#[derive(Debug)]
pub struct DurableQueue {
    name: String,
    auto_delete: bool,
    buffer: QueueBuffer,
}

impl DurableQueue {
    pub fn new(name: impl Into<String>, auto_delete: bool) -> Self {
        Self {
            name: name.into(),
            auto_delete,
            buffer: QueueBuffer::new(None),
        }
    }

    /// Create the queue with every message already stored for it.
    pub async fn load(
        name: impl Into<String>,
        auto_delete: bool,
        store: &Arc<MessageStore>,
    ) -> Result<Self> {
        let name = name.into();
        let messages = store.read_all(&name).await?;
        tracing::info!(queue = %name, messages = messages.len(), "Durable queue loaded");
        Ok(Self {
            name,
            auto_delete,
            buffer: QueueBuffer::with_messages(messages),
        })
    }
}

impl Queue for DurableQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn is_durable(&self) -> bool {
        true
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
        self.buffer.remove(message_id).map(Message::release).is_some()
    }

    fn prepare_enqueue(&self, xid: &Xid, message: Message) -> Result<()> {
        self.buffer.force_stage_enqueue(xid, message);
        Ok(())
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
    use crate::observe;
    use crate::store::MemoryStore;
    use crate::transaction::TransactionData;

    #[tokio::test]
    async fn test_load_restores_stored_order() {
        let store = Arc::new(MessageStore::new(
            Arc::new(MemoryStore::new()),
            observe::noop(),
        ));
        let mut data = TransactionData::new();
        for id in [3, 1, 2] {
            data.add_enqueue(
                "orders",
                &Message::new(MessageId::new(id), Metadata::new("ex", "orders"), Vec::new()),
            );
        }
        store.persist(&data).await.unwrap();

        let queue = DurableQueue::load("orders", false, &store).await.unwrap();
        assert!(queue.is_durable());
        assert_eq!(queue.size(), 3);
        let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue())
            .map(|m| m.id().value())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_staged_enqueues_are_never_dropped() {
        let store = Arc::new(MessageStore::new(
            Arc::new(MemoryStore::new()),
            observe::noop(),
        ));
        let queue = DurableQueue::load("orders", false, &store).await.unwrap();
        let xid = Xid::new(1, b"g".to_vec(), b"b".to_vec());
        for id in 1..=64 {
            let message = Message::new(MessageId::new(id), Metadata::new("ex", "orders"), Vec::new());
            queue.prepare_enqueue(&xid, message).unwrap();
        }

        assert_eq!(queue.size(), 0);
        assert_eq!(queue.commit(&xid).enqueues, 64);
        assert_eq!(queue.size(), 64);
    }
}
