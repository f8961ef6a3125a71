//! Backend trait for the durable message store.
//!
//! The broker core never talks SQL directly: the coordinator opens a
//! [`StoreTransaction`] and drives the individual operations through it, so
//! every batch commits or rolls back as one unit.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Message, MessageId, Metadata};
use crate::transaction::{EnqueueEntry, Xid};

/// Errors raised by durable store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend could not complete the operation (I/O failure, injected fault)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The requested write contradicts existing durable state
    #[error("Store conflict: {0}")]
    Conflict(String),
}

/// Named store operations, used for metrics labels and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    StoreMessages,
    DetachFromQueue,
    Delete,
    StoreXid,
    PrepareEnqueue,
    PrepareDetach,
    CopyEnqueue,
    RemovePreparedData,
    RestoreDequeue,
    Commit,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreMessages => "store_messages",
            Self::DetachFromQueue => "detach_from_queue",
            Self::Delete => "delete",
            Self::StoreXid => "store_xid",
            Self::PrepareEnqueue => "prepare_enqueue",
            Self::PrepareDetach => "prepare_detach",
            Self::CopyEnqueue => "copy_enqueue",
            Self::RemovePreparedData => "remove_prepared_data",
            Self::RestoreDequeue => "restore_dequeue",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable form of a message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub metadata: Metadata,
    pub content: Vec<u8>,
    pub arrived_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn into_message(self) -> Message {
        Message::from_parts(self.id, self.metadata, self.content, self.arrived_at)
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id(),
            metadata: message.metadata().clone(),
            content: message.content().to_vec(),
            arrived_at: message.arrived_at(),
        }
    }
}

/// A prepared transaction found in the store during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredXid {
    pub xid: Xid,
    pub internal_id: i64,
}

/// One open durable transaction. Dropping it without `commit` discards
/// every operation applied through it.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert message rows and link them to their queues.
    async fn store_messages(&mut self, entries: &[EnqueueEntry]) -> Result<(), StoreError>;

    /// Unlink messages from queues without deleting the rows.
    async fn detach_from_queue(
        &mut self,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError>;

    /// Physically delete those of the given message rows that no queue and
    /// no prepared detach references any more.
    async fn delete(&mut self, message_ids: &BTreeSet<MessageId>) -> Result<(), StoreError>;

    /// Register a distributed transaction and return its internal id.
    ///
    /// Fails with [`StoreError::Conflict`] if the Xid is already stored.
    async fn store_xid(&mut self, xid: &Xid) -> Result<i64, StoreError>;

    async fn prepare_enqueue_messages(
        &mut self,
        internal_xid: i64,
        entries: &[EnqueueEntry],
    ) -> Result<(), StoreError>;

    async fn prepare_detach_messages(
        &mut self,
        internal_xid: i64,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError>;

    /// Make staged enqueues of a prepared transaction live.
    async fn copy_enqueue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError>;

    /// Drop the Xid record together with its staged enqueues and detaches.
    async fn remove_prepared_data(&mut self, internal_xid: i64) -> Result<(), StoreError>;

    /// Re-attach messages detached by a prepared transaction.
    async fn restore_dequeue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable store backend.
///
/// # Thread Safety
///
/// Implementations are shared by every queue handler and must be
/// `Send + Sync`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend type identifier
    fn backend_name(&self) -> &'static str;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// All messages attached to a queue, oldest first.
    async fn read_all(&self, queue_name: &str) -> Result<Vec<Message>, StoreError>;

    async fn retrieve_all_xids(&self) -> Result<Vec<RecoveredXid>, StoreError>;

    /// Staged enqueues of a prepared transaction as `(queue, message)` pairs.
    async fn retrieve_enqueued_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError>;

    /// Messages detached by a prepared transaction as `(queue, message)`
    /// pairs, for rows that still exist.
    async fn retrieve_detached_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError>;

    /// Highest message id ever written, live or staged.
    async fn max_message_id(&self) -> Result<Option<MessageId>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_message_round_trips_message_fields() {
        let message = Message::new(
            MessageId::new(5),
            Metadata::new("amq.topic", "a.b").with_property("priority", "3"),
            b"body".to_vec(),
        );

        let stored = StoredMessage::from(&message);
        let json = serde_json::to_string(&stored).unwrap();
        let restored: StoredMessage = serde_json::from_str(&json).unwrap();
        let rebuilt = restored.into_message();

        assert_eq!(rebuilt.id(), message.id());
        assert_eq!(rebuilt.metadata(), message.metadata());
        assert_eq!(rebuilt.content(), b"body");
        assert_eq!(rebuilt.arrived_at(), message.arrived_at());
        assert!(!rebuilt.is_redelivered());
    }

    #[test]
    fn test_operation_labels() {
        assert_eq!(StoreOperation::CopyEnqueue.to_string(), "copy_enqueue");
        assert_eq!(StoreOperation::Commit.as_str(), "commit");
    }
}
