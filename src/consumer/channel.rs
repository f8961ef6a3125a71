//! Consumer backed by a bounded tokio channel.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::infrastructure::error::Result;
use crate::message::Message;

use super::{Consumer, DeliveryError};

/// Delivers messages into an `mpsc` channel read by the subscriber.
///
/// Ready while open, with flow enabled and free channel capacity.
#[derive(Debug)]
pub struct ChannelConsumer {
    id: Uuid,
    queue_name: String,
    sender: mpsc::Sender<Message>,
    open: AtomicBool,
    flow: AtomicBool,
}

impl ChannelConsumer {
    pub fn new(queue_name: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let consumer = Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            sender,
            open: AtomicBool::new(true),
            flow: AtomicBool::new(true),
        };
        (consumer, receiver)
    }

    /// Enable or pause delivery to this consumer.
    pub fn set_flow(&self, enabled: bool) {
        self.flow.store(enabled, Ordering::Release);
        tracing::debug!(consumer_id = %self.id, enabled = enabled, "Consumer flow changed");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Consumer for ChannelConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn is_ready(&self) -> bool {
        self.is_open()
            && self.flow.load(Ordering::Acquire)
            && !self.sender.is_closed()
            && self.sender.capacity() > 0
    }

    fn send(&self, message: Message) -> std::result::Result<(), DeliveryError> {
        if !self.is_open() {
            return Err(DeliveryError::new(message, "consumer closed"));
        }
        self.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(message) => DeliveryError::new(message, "channel full"),
            TrySendError::Closed(message) => DeliveryError::new(message, "receiver dropped"),
        })
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(consumer_id = %self.id, queue = %self.queue_name, "Consumer closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, Metadata};

    fn message(id: u64) -> Message {
        Message::new(MessageId::new(id), Metadata::new("ex", "q"), Vec::new())
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (consumer, mut rx) = ChannelConsumer::new("q", 4);
        assert!(consumer.is_ready());
        consumer.send(message(1)).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id(), MessageId::new(1));
        assert_eq!(consumer.queue_name(), "q");
    }

    #[test]
    fn test_full_channel_is_not_ready_and_returns_message() {
        let (consumer, _rx) = ChannelConsumer::new("q", 1);
        consumer.send(message(1)).unwrap();
        assert!(!consumer.is_ready());

        let err = consumer.send(message(2)).unwrap_err();
        assert_eq!(err.message.id(), MessageId::new(2));
    }

    #[test]
    fn test_flow_control_and_close() {
        let (consumer, _rx) = ChannelConsumer::new("q", 1);
        consumer.set_flow(false);
        assert!(!consumer.is_ready());
        consumer.set_flow(true);
        assert!(consumer.is_ready());

        consumer.close().unwrap();
        assert!(!consumer.is_ready());
        assert!(consumer.send(message(1)).is_err());
    }

    #[test]
    fn test_dropped_receiver_is_not_ready() {
        let (consumer, rx) = ChannelConsumer::new("q", 1);
        drop(rx);
        assert!(!consumer.is_ready());
    }
}
