//! In-memory durable store backend.
//!
//! Keeps the same tables as the PostgreSQL backend in plain maps. Transactions
//! are serialized: `begin` takes the state lock and every operation applies
//! in place while recording its inverse. `commit` forgets the undo log;
//! rollback, a failed commit or dropping the transaction replays it.
//! State is lost on restart; this backend serves non-persistent brokers and
//! tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::message::{Message, MessageId};
use crate::transaction::{EnqueueEntry, Xid};

use super::backend::{
    DurableStore, RecoveredXid, StoreError, StoreOperation, StoreTransaction, StoredMessage,
};

type StagedEnqueues = Vec<(String, StoredMessage)>;
type StagedDetaches = Vec<(String, MessageId)>;

#[derive(Debug, Default)]
struct StoreState {
    messages: HashMap<MessageId, StoredMessage>,
    /// queue name -> attached message ids (ordered by id)
    queues: HashMap<String, BTreeSet<MessageId>>,
    xids: BTreeMap<i64, Xid>,
    next_internal_xid: i64,
    prepared_enqueues: HashMap<i64, StagedEnqueues>,
    prepared_detaches: HashMap<i64, StagedDetaches>,
}

impl StoreState {
    /// Still linked to a queue or held by a prepared detach.
    fn is_referenced(&self, id: &MessageId) -> bool {
        self.queues.values().any(|attached| attached.contains(id))
            || self
                .prepared_detaches
                .values()
                .flatten()
                .any(|(_, detached)| detached == id)
    }

    fn revert(&mut self, change: Undo) {
        match change {
            Undo::RemoveMessage(id) => {
                self.messages.remove(&id);
            }
            Undo::RestoreMessage(stored) => {
                self.messages.insert(stored.id, stored);
            }
            Undo::Unlink(queue_name, id) => {
                if let Some(attached) = self.queues.get_mut(&queue_name) {
                    attached.remove(&id);
                }
            }
            Undo::Link(queue_name, id) => {
                self.queues.entry(queue_name).or_default().insert(id);
            }
            Undo::RemoveXid(internal_xid) => {
                self.xids.remove(&internal_xid);
            }
            Undo::RestoreXid(internal_xid, xid) => {
                self.xids.insert(internal_xid, xid);
            }
            Undo::NextInternalXid(value) => self.next_internal_xid = value,
            Undo::PreparedEnqueues(internal_xid, previous) => match previous {
                Some(staged) => {
                    self.prepared_enqueues.insert(internal_xid, staged);
                }
                None => {
                    self.prepared_enqueues.remove(&internal_xid);
                }
            },
            Undo::PreparedDetaches(internal_xid, previous) => match previous {
                Some(staged) => {
                    self.prepared_detaches.insert(internal_xid, staged);
                }
                None => {
                    self.prepared_detaches.remove(&internal_xid);
                }
            },
        }
    }
}

/// Inverse of one change made by an open transaction.
#[derive(Debug)]
enum Undo {
    RemoveMessage(MessageId),
    RestoreMessage(StoredMessage),
    Unlink(String, MessageId),
    Link(String, MessageId),
    RemoveXid(i64),
    RestoreXid(i64, Xid),
    NextInternalXid(i64),
    PreparedEnqueues(i64, Option<StagedEnqueues>),
    PreparedDetaches(i64, Option<StagedDetaches>),
}

/// One-shot fault injection shared by the store and its transactions.
#[derive(Debug, Default)]
struct FailPoint {
    operation: Mutex<Option<StoreOperation>>,
}

impl FailPoint {
    fn check(&self, operation: StoreOperation) -> Result<(), StoreError> {
        let mut armed = self.operation.lock();
        if *armed == Some(operation) {
            *armed = None;
            return Err(StoreError::Unavailable(format!(
                "injected failure at {}",
                operation
            )));
        }
        Ok(())
    }
}

/// In-memory implementation of [`DurableStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<StoreState>>,
    fail_point: Arc<FailPoint>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next occurrence of `operation` fail.
    pub fn fail_at(&self, operation: StoreOperation) {
        *self.fail_point.operation.lock() = Some(operation);
    }

    /// Number of message rows currently stored.
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    /// Number of stored transaction records.
    pub async fn xid_count(&self) -> usize {
        self.state.lock().await.xids.len()
    }

    /// Message ids attached to a queue, oldest first.
    pub async fn queue_message_ids(&self, queue_name: &str) -> Vec<MessageId> {
        self.state
            .lock()
            .await
            .queues
            .get(queue_name)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

struct MemoryTransaction {
    state: OwnedMutexGuard<StoreState>,
    undo_log: Vec<Undo>,
    fail_point: Arc<FailPoint>,
}

impl MemoryTransaction {
    fn attach(&mut self, queue_name: &str, message: StoredMessage) {
        let id = message.id;
        if !self.state.messages.contains_key(&id) {
            self.state.messages.insert(id, message);
            self.undo_log.push(Undo::RemoveMessage(id));
        }
        if self
            .state
            .queues
            .entry(queue_name.to_string())
            .or_default()
            .insert(id)
        {
            self.undo_log.push(Undo::Unlink(queue_name.to_string(), id));
        }
    }

    fn unlink(&mut self, queue_name: &str, id: MessageId) {
        let removed = self
            .state
            .queues
            .get_mut(queue_name)
            .is_some_and(|attached| attached.remove(&id));
        if removed {
            self.undo_log.push(Undo::Link(queue_name.to_string(), id));
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        while let Some(change) = self.undo_log.pop() {
            self.state.revert(change);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn store_messages(&mut self, entries: &[EnqueueEntry]) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::StoreMessages)?;
        for entry in entries {
            self.attach(&entry.queue_name, StoredMessage::from(&entry.message));
        }
        Ok(())
    }

    async fn detach_from_queue(
        &mut self,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::DetachFromQueue)?;
        for (queue_name, ids) in detach {
            for id in ids {
                self.unlink(queue_name, *id);
            }
        }
        Ok(())
    }

    async fn delete(&mut self, message_ids: &BTreeSet<MessageId>) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::Delete)?;
        for id in message_ids {
            if self.state.is_referenced(id) {
                continue;
            }
            if let Some(stored) = self.state.messages.remove(id) {
                self.undo_log.push(Undo::RestoreMessage(stored));
            }
        }
        Ok(())
    }

    async fn store_xid(&mut self, xid: &Xid) -> Result<i64, StoreError> {
        self.fail_point.check(StoreOperation::StoreXid)?;
        if self.state.xids.values().any(|stored| stored == xid) {
            return Err(StoreError::Conflict(format!("xid {} already stored", xid)));
        }
        let previous = self.state.next_internal_xid;
        self.undo_log.push(Undo::NextInternalXid(previous));
        let internal_xid = previous + 1;
        self.state.next_internal_xid = internal_xid;
        self.state.xids.insert(internal_xid, xid.clone());
        self.undo_log.push(Undo::RemoveXid(internal_xid));
        Ok(internal_xid)
    }

    async fn prepare_enqueue_messages(
        &mut self,
        internal_xid: i64,
        entries: &[EnqueueEntry],
    ) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::PrepareEnqueue)?;
        let previous = self.state.prepared_enqueues.get(&internal_xid).cloned();
        self.undo_log
            .push(Undo::PreparedEnqueues(internal_xid, previous));
        let staged = self.state.prepared_enqueues.entry(internal_xid).or_default();
        for entry in entries {
            staged.push((entry.queue_name.clone(), StoredMessage::from(&entry.message)));
        }
        Ok(())
    }

    async fn prepare_detach_messages(
        &mut self,
        internal_xid: i64,
        detach: &HashMap<String, Vec<MessageId>>,
    ) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::PrepareDetach)?;
        let previous = self.state.prepared_detaches.get(&internal_xid).cloned();
        self.undo_log
            .push(Undo::PreparedDetaches(internal_xid, previous));
        let staged = self.state.prepared_detaches.entry(internal_xid).or_default();
        for (queue_name, ids) in detach {
            staged.extend(ids.iter().map(|id| (queue_name.clone(), *id)));
        }
        Ok(())
    }

    async fn copy_enqueue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::CopyEnqueue)?;
        let staged = self
            .state
            .prepared_enqueues
            .get(&internal_xid)
            .cloned()
            .unwrap_or_default();
        for (queue_name, message) in staged {
            self.attach(&queue_name, message);
        }
        Ok(())
    }

    async fn remove_prepared_data(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::RemovePreparedData)?;
        if let Some(xid) = self.state.xids.remove(&internal_xid) {
            self.undo_log.push(Undo::RestoreXid(internal_xid, xid));
        }
        let enqueues = self.state.prepared_enqueues.remove(&internal_xid);
        self.undo_log
            .push(Undo::PreparedEnqueues(internal_xid, enqueues));
        let detaches = self.state.prepared_detaches.remove(&internal_xid);
        self.undo_log
            .push(Undo::PreparedDetaches(internal_xid, detaches));
        Ok(())
    }

    async fn restore_dequeue_messages(&mut self, internal_xid: i64) -> Result<(), StoreError> {
        self.fail_point.check(StoreOperation::RestoreDequeue)?;
        let staged = self
            .state
            .prepared_detaches
            .get(&internal_xid)
            .cloned()
            .unwrap_or_default();
        for (queue_name, id) in staged {
            // Only rows that still exist can be re-attached
            if !self.state.messages.contains_key(&id) {
                continue;
            }
            if self.state.queues.entry(queue_name.clone()).or_default().insert(id) {
                self.undo_log.push(Undo::Unlink(queue_name, id));
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        // On failure the undo log is replayed when `tx` drops
        tx.fail_point.check(StoreOperation::Commit)?;
        tx.undo_log.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Dropping replays the undo log
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let state = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            state,
            undo_log: Vec::new(),
            fail_point: Arc::clone(&self.fail_point),
        }))
    }

    async fn read_all(&self, queue_name: &str) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock().await;
        let messages = state
            .queues
            .get(queue_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.messages.get(id))
                    .map(|stored| stored.clone().into_message())
                    .collect()
            })
            .unwrap_or_default();
        Ok(messages)
    }

    async fn retrieve_all_xids(&self) -> Result<Vec<RecoveredXid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .xids
            .iter()
            .map(|(internal_id, xid)| RecoveredXid {
                xid: xid.clone(),
                internal_id: *internal_id,
            })
            .collect())
    }

    async fn retrieve_enqueued_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .prepared_enqueues
            .get(&internal_xid)
            .map(|staged| {
                staged
                    .iter()
                    .map(|(queue_name, stored)| (queue_name.clone(), stored.clone().into_message()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn retrieve_detached_messages(
        &self,
        internal_xid: i64,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .prepared_detaches
            .get(&internal_xid)
            .map(|staged| {
                staged
                    .iter()
                    .filter_map(|(queue_name, id)| {
                        let stored = state.messages.get(id)?;
                        Some((queue_name.clone(), stored.clone().into_message()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn max_message_id(&self) -> Result<Option<MessageId>, StoreError> {
        let state = self.state.lock().await;
        let live = state.messages.keys().copied().max();
        let staged = state
            .prepared_enqueues
            .values()
            .flat_map(|staged| staged.iter().map(|(_, m)| m.id))
            .max();
        Ok(live.max(staged))
    }
}
