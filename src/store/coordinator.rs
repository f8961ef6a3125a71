//! Message store coordinator.
//!
//! Translates queue-level durability operations into atomic store
//! transactions and tracks which Xids are prepared. The Xid registry is only
//! modified after the durable transaction for that step has committed, so a
//! failed prepare, commit or rollback can be retried as-is.

use std::sync::Arc;
use std::time::Instant;

use crate::message::{Message, MessageId};
use crate::observe::{DtxPhase, SharedObserver};
use crate::transaction::{TransactionData, Xid};

use super::backend::{DurableStore, StoreError, StoreTransaction};
use super::registry::XidRegistry;

/// Commit `tx` if the unit of work succeeded, otherwise roll it back.
async fn finish<T>(
    tx: Box<dyn StoreTransaction>,
    outcome: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Failed to roll back store transaction");
            }
            Err(err)
        }
    }
}

pub struct MessageStore {
    store: Arc<dyn DurableStore>,
    registry: XidRegistry,
    observer: SharedObserver,
}

impl MessageStore {
    pub fn new(store: Arc<dyn DurableStore>, observer: SharedObserver) -> Self {
        Self {
            store,
            registry: XidRegistry::new(),
            observer,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn registry(&self) -> &XidRegistry {
        &self.registry
    }

    pub fn is_prepared(&self, xid: &Xid) -> bool {
        self.registry.contains(xid)
    }

    fn observe<T>(&self, operation: &'static str, started: Instant, result: &Result<T, StoreError>) {
        self.observer
            .on_store_operation(operation, started.elapsed(), result.is_ok());
        if let Err(err) = result {
            tracing::error!(operation = operation, error = %err, "Store operation failed");
        }
    }

    /// Store enqueued messages, detach acknowledged ones and delete orphans
    /// as one durable transaction.
    ///
    /// Deletable ids are only candidates: the store keeps any row another
    /// queue or a prepared transaction still references.
    pub async fn persist(&self, data: &TransactionData) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = async {
            tx.store_messages(data.enqueue_messages()).await?;
            tx.detach_from_queue(data.detach_message_map()).await?;
            tx.delete(data.deletable_messages()).await
        }
        .await;
        let result = finish(tx, outcome).await;

        self.observe("persist", started, &result);
        result
    }

    /// All messages attached to `queue_name`, oldest first.
    pub async fn read_all(&self, queue_name: &str) -> Result<Vec<Message>, StoreError> {
        let started = Instant::now();
        let result = self.store.read_all(queue_name).await;
        self.observe("read_all", started, &result);
        result
    }

    /// Durably stage `data` under `xid` and detach its acknowledged messages.
    ///
    /// Staged enqueues stay invisible to `read_all` until
    /// [`commit_prepared_data`](Self::commit_prepared_data).
    pub async fn prepare(&self, xid: &Xid, data: &TransactionData) -> Result<(), StoreError> {
        if self.registry.contains(xid) {
            let err = StoreError::Conflict(format!("xid {} is already prepared", xid));
            self.observer.on_dtx(DtxPhase::Prepare, xid, false);
            return Err(err);
        }

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = async {
            let internal_xid = tx.store_xid(xid).await?;
            tx.prepare_enqueue_messages(internal_xid, data.enqueue_messages())
                .await?;
            tx.prepare_detach_messages(internal_xid, data.detach_message_map())
                .await?;
            tx.detach_from_queue(data.detach_message_map()).await?;
            Ok::<_, StoreError>(internal_xid)
        }
        .await;
        let result = finish(tx, outcome).await;
        self.observe("prepare", started, &result);

        let outcome = result.map(|internal_xid| {
            self.registry.insert(xid.clone(), internal_xid);
            tracing::debug!(xid = %xid, internal_xid = internal_xid, "Transaction prepared");
        });
        self.observer.on_dtx(DtxPhase::Prepare, xid, outcome.is_ok());
        self.observer.on_in_doubt_changed(self.registry.len());
        outcome
    }

    /// Make the staged enqueues of `xid` live, drop the prepared record and
    /// delete the messages `data` marks as deletable once nothing references
    /// them.
    ///
    /// Committing an Xid that was never prepared only deletes the
    /// unreferenced deletable rows.
    pub async fn commit_prepared_data(
        &self,
        xid: &Xid,
        data: &TransactionData,
    ) -> Result<(), StoreError> {
        let Some(internal_xid) = self.registry.get(xid) else {
            tracing::warn!(xid = %xid, "Commit requested for unknown xid, deleting orphans only");
            if data.deletable_messages().is_empty() {
                return Ok(());
            }
            let started = Instant::now();
            let mut tx = self.store.begin().await?;
            let outcome = tx.delete(data.deletable_messages()).await;
            let result = finish(tx, outcome).await;
            self.observe("commit_prepared", started, &result);
            return result;
        };

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = async {
            tx.copy_enqueue_messages(internal_xid).await?;
            // The staged detaches pin their rows until the record is gone
            tx.remove_prepared_data(internal_xid).await?;
            tx.delete(data.deletable_messages()).await
        }
        .await;
        let result = finish(tx, outcome).await;
        self.observe("commit_prepared", started, &result);

        if result.is_ok() {
            self.registry.remove(xid);
            tracing::debug!(xid = %xid, internal_xid = internal_xid, "Prepared transaction committed");
        }
        self.observer.on_dtx(DtxPhase::Commit, xid, result.is_ok());
        self.observer.on_in_doubt_changed(self.registry.len());
        result
    }

    /// Re-attach the messages detached by `xid` and drop its prepared record.
    ///
    /// Rolling back an Xid that was never prepared is a no-op.
    pub async fn rollback_prepared_data(&self, xid: &Xid) -> Result<(), StoreError> {
        let Some(internal_xid) = self.registry.get(xid) else {
            tracing::warn!(xid = %xid, "Rollback requested for unknown xid, ignoring");
            self.registry.remove(xid);
            return Ok(());
        };

        let started = Instant::now();
        let mut tx = self.store.begin().await?;
        let outcome = async {
            tx.restore_dequeue_messages(internal_xid).await?;
            tx.remove_prepared_data(internal_xid).await
        }
        .await;
        let result = finish(tx, outcome).await;
        self.observe("rollback_prepared", started, &result);

        if result.is_ok() {
            self.registry.remove(xid);
            tracing::debug!(xid = %xid, internal_xid = internal_xid, "Prepared transaction rolled back");
        }
        self.observer.on_dtx(DtxPhase::Rollback, xid, result.is_ok());
        self.observer.on_in_doubt_changed(self.registry.len());
        result
    }

    /// Rebuild the Xid registry from the store, calling `on_xid` for each
    /// prepared transaction found. Returns the number of Xids indexed.
    pub async fn retrieve_all_stored_xids<F>(&self, mut on_xid: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Xid),
    {
        let started = Instant::now();
        let result = self.store.retrieve_all_xids().await;
        self.observe("retrieve_xids", started, &result);

        let recovered = result?;
        for entry in &recovered {
            self.registry.insert(entry.xid.clone(), entry.internal_id);
            on_xid(&entry.xid);
        }
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered prepared transactions");
        }
        self.observer.on_in_doubt_changed(self.registry.len());
        Ok(recovered.len())
    }

    /// Staged enqueues of a prepared `xid` as `(queue, message)` pairs.
    pub async fn retrieve_all_enqueued_messages(
        &self,
        xid: &Xid,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let Some(internal_xid) = self.registry.get(xid) else {
            return Ok(Vec::new());
        };

        let started = Instant::now();
        let result = self.store.retrieve_enqueued_messages(internal_xid).await;
        self.observe("retrieve_enqueued", started, &result);
        result
    }

    /// Acknowledged messages held back by a prepared `xid`, as
    /// `(queue, message)` pairs.
    pub async fn retrieve_all_detached_messages(
        &self,
        xid: &Xid,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        let Some(internal_xid) = self.registry.get(xid) else {
            return Ok(Vec::new());
        };

        let started = Instant::now();
        let result = self.store.retrieve_detached_messages(internal_xid).await;
        self.observe("retrieve_detached", started, &result);
        result
    }

    pub async fn max_message_id(&self) -> Result<Option<MessageId>, StoreError> {
        self.store.max_message_id().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Metadata;
    use crate::observe;
    use crate::store::{MemoryStore, StoreOperation};

    fn message(id: u64) -> Message {
        Message::new(MessageId::new(id), Metadata::new("amq.direct", "q"), b"body".to_vec())
    }

    fn xid(branch: &[u8]) -> Xid {
        Xid::new(1, b"global".to_vec(), branch.to_vec())
    }

    fn coordinator() -> (MemoryStore, MessageStore) {
        let backend = MemoryStore::new();
        let store = MessageStore::new(Arc::new(backend.clone()), observe::noop());
        (backend, store)
    }

    async fn seed(store: &MessageStore, queue: &str, ids: &[u64]) {
        let mut data = TransactionData::new();
        for id in ids {
            data.add_enqueue(queue, &message(*id));
        }
        store.persist(&data).await.unwrap();
    }

    fn ids(messages: &[Message]) -> Vec<u64> {
        messages.iter().map(|m| m.id().value()).collect()
    }

    #[tokio::test]
    async fn test_persist_applies_all_three_steps() {
        let (_, store) = coordinator();
        seed(&store, "q", &[1, 2]).await;

        let mut data = TransactionData::new();
        data.add_enqueue("q", &message(3));
        data.add_detach("q", MessageId::new(1));
        data.add_deletable(MessageId::new(1));
        store.persist(&data).await.unwrap();

        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_persist_is_atomic_on_failure() {
        for failing in [
            StoreOperation::StoreMessages,
            StoreOperation::DetachFromQueue,
            StoreOperation::Delete,
            StoreOperation::Commit,
        ] {
            let (backend, store) = coordinator();
            seed(&store, "q", &[1]).await;

            let mut data = TransactionData::new();
            data.add_enqueue("q", &message(2));
            data.add_detach("q", MessageId::new(1));
            data.add_deletable(MessageId::new(1));

            backend.fail_at(failing);
            assert!(store.persist(&data).await.is_err(), "{} should fail", failing);

            assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![1]);
            assert_eq!(backend.message_count().await, 1);
        }
    }

    #[tokio::test]
    async fn test_prepare_then_commit() {
        let (backend, store) = coordinator();
        seed(&store, "q", &[1]).await;
        let xid = xid(b"a");

        let mut data = TransactionData::new();
        data.add_enqueue("q", &message(2));
        data.add_enqueue("q", &message(3));
        data.add_detach("q", MessageId::new(1));
        data.add_deletable(MessageId::new(1));

        store.prepare(&xid, &data).await.unwrap();
        assert!(store.is_prepared(&xid));
        // Staged enqueues are invisible, detaches are applied
        assert!(store.read_all("q").await.unwrap().is_empty());

        store.commit_prepared_data(&xid, &data).await.unwrap();
        assert!(!store.is_prepared(&xid));
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![2, 3]);
        assert_eq!(backend.xid_count().await, 0);
        assert_eq!(backend.message_count().await, 2);
    }

    #[tokio::test]
    async fn test_prepare_then_rollback_restores_detached() {
        let (backend, store) = coordinator();
        seed(&store, "q", &[1, 2]).await;
        let xid = xid(b"b");

        let mut data = TransactionData::new();
        data.add_enqueue("q", &message(3));
        data.add_detach("q", MessageId::new(1));

        store.prepare(&xid, &data).await.unwrap();
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![2]);

        store.rollback_prepared_data(&xid).await.unwrap();
        assert!(!store.is_prepared(&xid));
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![1, 2]);
        assert_eq!(backend.xid_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_prepare_leaves_no_mapping() {
        let (backend, store) = coordinator();
        seed(&store, "q", &[1]).await;
        let xid = xid(b"c");

        let mut data = TransactionData::new();
        data.add_detach("q", MessageId::new(1));

        backend.fail_at(StoreOperation::PrepareDetach);
        assert!(store.prepare(&xid, &data).await.is_err());
        assert!(!store.is_prepared(&xid));
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![1]);

        // Retry succeeds with the same xid
        store.prepare(&xid, &data).await.unwrap();
        assert!(store.is_prepared(&xid));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_mapping_for_retry() {
        let (backend, store) = coordinator();
        let xid = xid(b"d");
        let mut data = TransactionData::new();
        data.add_enqueue("q", &message(5));
        store.prepare(&xid, &data).await.unwrap();

        backend.fail_at(StoreOperation::CopyEnqueue);
        assert!(store.commit_prepared_data(&xid, &data).await.is_err());
        assert!(store.is_prepared(&xid));
        assert!(store.read_all("q").await.unwrap().is_empty());

        store.commit_prepared_data(&xid, &data).await.unwrap();
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![5]);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_mapping_for_retry() {
        let (backend, store) = coordinator();
        seed(&store, "q", &[1]).await;
        let xid = xid(b"e");
        let mut data = TransactionData::new();
        data.add_detach("q", MessageId::new(1));
        store.prepare(&xid, &data).await.unwrap();

        backend.fail_at(StoreOperation::RestoreDequeue);
        assert!(store.rollback_prepared_data(&xid).await.is_err());
        assert!(store.is_prepared(&xid));

        store.rollback_prepared_data(&xid).await.unwrap();
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![1]);
    }

    #[tokio::test]
    async fn test_unknown_xid_resolution_is_noop() {
        let (_, store) = coordinator();
        seed(&store, "q", &[1]).await;
        let xid = xid(b"unknown");

        let mut data = TransactionData::new();
        data.add_deletable(MessageId::new(1));
        store.commit_prepared_data(&xid, &data).await.unwrap();
        store.rollback_prepared_data(&xid).await.unwrap();

        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![1]);
        assert!(store.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_xid_commit_deletes_orphans() {
        let (backend, store) = coordinator();
        seed(&store, "q", &[1, 2]).await;
        let mut detach = TransactionData::new();
        detach.add_detach("q", MessageId::new(1));
        store.persist(&detach).await.unwrap();

        let mut data = TransactionData::new();
        data.add_deletable(MessageId::new(1));
        data.add_deletable(MessageId::new(2));
        store.commit_prepared_data(&xid(b"gone"), &data).await.unwrap();

        assert_eq!(backend.message_count().await, 1);
        assert_eq!(ids(&store.read_all("q").await.unwrap()), vec![2]);
    }

    #[tokio::test]
    async fn test_duplicate_prepare_rejected() {
        let (_, store) = coordinator();
        let xid = xid(b"dup");
        let data = TransactionData::new();

        store.prepare(&xid, &data).await.unwrap();
        let err = store.prepare(&xid, &data).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_recovery_reindexes_xids() {
        let backend = MemoryStore::new();
        let first = MessageStore::new(Arc::new(backend.clone()), observe::noop());
        let xid = xid(b"r");
        let mut data = TransactionData::new();
        data.add_enqueue("q", &message(9));
        first.prepare(&xid, &data).await.unwrap();

        // A new coordinator over the same store simulates a restart
        let second = MessageStore::new(Arc::new(backend), observe::noop());
        assert!(!second.is_prepared(&xid));

        let mut seen = Vec::new();
        let count = second
            .retrieve_all_stored_xids(|x| seen.push(x.clone()))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![xid.clone()]);
        assert!(second.is_prepared(&xid));

        let staged = second.retrieve_all_enqueued_messages(&xid).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, "q");
        assert_eq!(staged[0].1.id(), MessageId::new(9));

        second.commit_prepared_data(&xid, &data).await.unwrap();
        assert_eq!(ids(&second.read_all("q").await.unwrap()), vec![9]);
    }

    #[tokio::test]
    async fn test_recovery_returns_detached_messages() {
        let backend = MemoryStore::new();
        let first = MessageStore::new(Arc::new(backend.clone()), observe::noop());
        seed(&first, "q", &[4]).await;
        let xid = xid(b"d");
        let mut data = TransactionData::new();
        data.add_detach("q", MessageId::new(4));
        data.add_deletable(MessageId::new(4));
        first.prepare(&xid, &data).await.unwrap();

        let second = MessageStore::new(Arc::new(backend.clone()), observe::noop());
        second.retrieve_all_stored_xids(|_| {}).await.unwrap();
        let detached = second.retrieve_all_detached_messages(&xid).await.unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].0, "q");
        assert_eq!(detached[0].1.id(), MessageId::new(4));

        // The prepared detach no longer pins the row once committed
        second.commit_prepared_data(&xid, &data).await.unwrap();
        assert_eq!(backend.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_deletable_shared_row_survives_until_last_detach() {
        let (backend, store) = coordinator();
        let mut data = TransactionData::new();
        data.add_enqueue("a", &message(1));
        data.add_enqueue("b", &message(1));
        store.persist(&data).await.unwrap();

        let mut ack = TransactionData::new();
        ack.add_detach("a", MessageId::new(1));
        ack.add_deletable(MessageId::new(1));
        store.persist(&ack).await.unwrap();
        assert_eq!(ids(&store.read_all("b").await.unwrap()), vec![1]);

        let mut ack = TransactionData::new();
        ack.add_detach("b", MessageId::new(1));
        ack.add_deletable(MessageId::new(1));
        store.persist(&ack).await.unwrap();
        assert_eq!(backend.message_count().await, 0);
    }
}
