use std::collections::{BTreeSet, HashMap};

use crate::message::{Message, MessageId};

/// A message routed to a queue within one unit of work.
#[derive(Debug)]
pub struct EnqueueEntry {
    pub queue_name: String,
    pub message: Message,
}

/// Everything one unit of work changes in the durable store.
///
/// Built by the caller and applied by the message store as a whole:
/// messages to insert, acknowledged messages to detach per queue, and
/// messages no queue refers to any more.
#[derive(Debug, Default)]
pub struct TransactionData {
    enqueue_messages: Vec<EnqueueEntry>,
    detach_message_map: HashMap<String, Vec<MessageId>>,
    deletable_messages: BTreeSet<MessageId>,
}

impl TransactionData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds its own reference to the message until the batch is dropped.
    pub fn add_enqueue(&mut self, queue_name: impl Into<String>, message: &Message) {
        self.enqueue_messages.push(EnqueueEntry {
            queue_name: queue_name.into(),
            message: message.shallow_copy(),
        });
    }

    pub fn add_detach(&mut self, queue_name: impl Into<String>, message_id: MessageId) {
        self.detach_message_map
            .entry(queue_name.into())
            .or_default()
            .push(message_id);
    }

    pub fn add_deletable(&mut self, message_id: MessageId) {
        self.deletable_messages.insert(message_id);
    }

    pub fn enqueue_messages(&self) -> &[EnqueueEntry] {
        &self.enqueue_messages
    }

    pub fn detach_message_map(&self) -> &HashMap<String, Vec<MessageId>> {
        &self.detach_message_map
    }

    pub fn deletable_messages(&self) -> &BTreeSet<MessageId> {
        &self.deletable_messages
    }

    /// Queues touched by this batch.
    pub fn queue_names(&self) -> BTreeSet<&str> {
        self.enqueue_messages
            .iter()
            .map(|e| e.queue_name.as_str())
            .chain(self.detach_message_map.keys().map(String::as_str))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue_messages.is_empty()
            && self.detach_message_map.is_empty()
            && self.deletable_messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;

    #[test]
    fn test_batch_collects_operations() {
        let msg = Message::new(MessageId::new(1), Metadata::new("ex", "q1"), b"x".to_vec());

        let mut data = TransactionData::new();
        assert!(data.is_empty());

        data.add_enqueue("q1", &msg);
        data.add_detach("q2", MessageId::new(9));
        data.add_detach("q2", MessageId::new(10));
        data.add_deletable(MessageId::new(9));
        data.add_deletable(MessageId::new(9));

        assert!(!data.is_empty());
        assert_eq!(data.enqueue_messages().len(), 1);
        assert_eq!(data.detach_message_map()["q2"].len(), 2);
        assert_eq!(data.deletable_messages().len(), 1);
        assert_eq!(data.queue_names().into_iter().collect::<Vec<_>>(), vec!["q1", "q2"]);

        // The batch holds its own reference
        assert_eq!(msg.reference_count(), 2);
        drop(data);
        assert_eq!(msg.reference_count(), 1);
    }
}
