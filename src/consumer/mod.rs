//! Message consumers.

mod channel;
mod iterator;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::infrastructure::error::Result;
use crate::message::Message;

pub use channel::ChannelConsumer;
pub use iterator::CyclicConsumerIterator;

/// A message a consumer could not accept, handed back to the caller.
#[derive(Debug, Error)]
#[error("delivery of message {} failed: {reason}", .message.id())]
pub struct DeliveryError {
    pub message: Message,
    pub reason: String,
}

impl DeliveryError {
    pub fn new(message: Message, reason: impl Into<String>) -> Self {
        Self {
            message,
            reason: reason.into(),
        }
    }
}

/// A subscriber attached to one queue.
pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> Uuid;

    fn queue_name(&self) -> &str;

    /// Whether the consumer can take another message right now.
    fn is_ready(&self) -> bool;

    fn send(&self, message: Message) -> std::result::Result<(), DeliveryError>;

    fn close(&self) -> Result<()>;
}
