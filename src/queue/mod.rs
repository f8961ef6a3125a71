//! Broker queues.
//!
//! A [`Queue`] is an ordered message container with two-phase staging.
//! Variants are chosen at declare time by [`QueueHandlerFactory`]; every
//! queue is owned by exactly one [`QueueHandler`], which adds the redelivery
//! queue, consumers and binding listeners on top.

mod binding;
mod buffer;
mod durable;
mod factory;
mod handler;
mod memory;

pub use binding::{Binding, BindingListener};
pub use durable::DurableQueue;
pub use factory::QueueHandlerFactory;
pub use handler::QueueHandler;
pub use memory::MemQueue;

use crate::infrastructure::error::Result;
use crate::message::{Message, MessageId};
use crate::observe::StagedCounts;
use crate::transaction::Xid;

/// Capability shared by all queue variants.
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum number of buffered messages, `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    fn is_durable(&self) -> bool;

    fn is_auto_delete(&self) -> bool;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append a message. The message is handed back if the queue is full.
    fn enqueue(&self, message: Message) -> std::result::Result<(), Message>;

    fn dequeue(&self) -> Option<Message>;

    /// Remove an acknowledged message. Returns false if it was no longer buffered.
    fn detach(&self, message_id: MessageId) -> bool;

    fn prepare_enqueue(&self, xid: &Xid, message: Message) -> Result<()>;

    fn prepare_detach(&self, xid: &Xid, message_id: MessageId) -> Result<()>;

    /// Apply staged operations for `xid`.
    fn commit(&self, xid: &Xid) -> StagedCounts;

    /// Discard staged operations for `xid`.
    fn rollback(&self, xid: &Xid) -> StagedCounts;

    /// Drop all buffered messages, returning how many were removed.
    fn clear(&self) -> usize;
}
