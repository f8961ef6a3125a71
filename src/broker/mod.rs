//! Broker facade.
//!
//! Ties queue handlers, the delivery scheduler and the message store
//! together and exposes the operations the protocol layer calls: queue
//! declaration, publish, acknowledge, requeue, consumers, bindings, purge
//! and distributed transactions.
//!
//! For durable queues every change is written to the store first; the
//! in-memory queues are only touched once the durable step succeeded.

mod branch;

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::consumer::Consumer;
use crate::delivery::{MessageDeliveryTask, TaskScheduler};
use crate::infrastructure::config::{BrokerConfig, DeliveryConfig};
use crate::infrastructure::error::{BrokerError, Result};
use crate::message::{Message, MessageId, MessageIdGenerator, Metadata};
use crate::observe::SharedObserver;
use crate::queue::{Binding, BindingListener, QueueHandler, QueueHandlerFactory};
use crate::store::MessageStore;
use crate::transaction::{TransactionData, Xid};

use branch::{Branch, BranchState};

/// Snapshot of one queue for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub capacity: Option<usize>,
    pub size: usize,
    pub redelivery_size: usize,
    pub consumer_count: usize,
    pub binding_count: usize,
}

impl QueueInfo {
    fn from_handler(handler: &QueueHandler) -> Self {
        Self {
            name: handler.name().to_string(),
            durable: handler.is_durable(),
            auto_delete: handler.queue().is_auto_delete(),
            capacity: handler.queue().capacity(),
            size: handler.size(),
            redelivery_size: handler.redelivery_size(),
            consumer_count: handler.consumer_count(),
            binding_count: handler.bindings().len(),
        }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub message_id: MessageId,
    /// Queues that accepted the message
    pub enqueued: usize,
    /// Queues that rejected it for lack of capacity
    pub rejected: usize,
}

/// Summary of startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub in_doubt: usize,
    pub restaged_messages: usize,
    /// Acknowledged messages a prepared branch keeps from redelivery
    pub held_acknowledgements: usize,
}

pub struct Broker {
    queues: DashMap<String, Arc<QueueHandler>>,
    factory: QueueHandlerFactory,
    store: Arc<MessageStore>,
    scheduler: Arc<TaskScheduler>,
    branches: DashMap<Xid, Branch>,
    id_generator: MessageIdGenerator,
    observer: SharedObserver,
    max_batch_size: usize,
}

impl Broker {
    pub fn new(
        store: Arc<MessageStore>,
        scheduler: Arc<TaskScheduler>,
        observer: SharedObserver,
        broker_config: &BrokerConfig,
        delivery_config: &DeliveryConfig,
    ) -> Self {
        let factory = QueueHandlerFactory::new(
            Arc::clone(&store),
            Arc::clone(&observer),
            broker_config.non_durable_queue_max_depth,
        );
        Self {
            queues: DashMap::new(),
            factory,
            store,
            scheduler,
            branches: DashMap::new(),
            id_generator: MessageIdGenerator::new(),
            observer,
            max_batch_size: delivery_config.max_batch_size,
        }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn next_message_id(&self) -> MessageId {
        self.id_generator.next_id()
    }

    fn handler(&self, queue_name: &str) -> Result<Arc<QueueHandler>> {
        self.queues
            .get(queue_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue_name)))
    }

    pub fn queue_handler(&self, queue_name: &str) -> Option<Arc<QueueHandler>> {
        self.queues.get(queue_name).map(|entry| Arc::clone(entry.value()))
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Declare a queue. Re-declaring an existing queue with the same
    /// durability returns the existing handler.
    pub async fn declare_queue(
        &self,
        queue_name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<QueueHandler>> {
        if queue_name.is_empty() {
            return Err(BrokerError::Validation("queue name must not be empty".to_string()));
        }
        if let Some(existing) = self.queue_handler(queue_name) {
            return Self::check_redeclare(existing, durable);
        }

        let handler = if durable {
            self.factory
                .create_durable_queue_handler(queue_name, auto_delete)
                .await?
        } else {
            self.factory
                .create_non_durable_queue_handler(queue_name, auto_delete)
        };

        let handler = match self.queues.entry(queue_name.to_string()) {
            // Declared concurrently while the durable queue was loading
            Entry::Occupied(entry) => {
                handler.discard();
                return Self::check_redeclare(Arc::clone(entry.get()), durable);
            }
            Entry::Vacant(entry) => Arc::clone(entry.insert(Arc::new(handler)).value()),
        };

        self.scheduler.add_task(Arc::new(MessageDeliveryTask::new(
            Arc::clone(&handler),
            self.max_batch_size,
            Arc::clone(&self.observer),
        )));
        tracing::info!(queue = %queue_name, durable = durable, "Queue declared");
        Ok(handler)
    }

    fn check_redeclare(existing: Arc<QueueHandler>, durable: bool) -> Result<Arc<QueueHandler>> {
        if existing.is_durable() != durable {
            return Err(BrokerError::Validation(format!(
                "queue {} already exists with durable={}",
                existing.name(),
                existing.is_durable()
            )));
        }
        Ok(existing)
    }

    /// Delete a queue, closing its consumers and firing its binding
    /// listeners. Returns the number of messages discarded.
    pub async fn delete_queue(&self, queue_name: &str) -> Result<usize> {
        let (_, handler) = self
            .queues
            .remove(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue_name)))?;

        self.scheduler.remove_task(queue_name);
        let release = handler.release_resources();
        let discarded = handler.discard();
        if handler.is_durable() {
            self.detach_stored(queue_name).await?;
        }
        tracing::info!(queue = %queue_name, discarded = discarded, "Queue deleted");
        release.map(|_| discarded)
    }

    pub fn queue_info(&self, queue_name: &str) -> Option<QueueInfo> {
        self.queues
            .get(queue_name)
            .map(|entry| QueueInfo::from_handler(entry.value()))
    }

    pub fn queues(&self) -> Vec<QueueInfo> {
        let mut queues: Vec<QueueInfo> = self
            .queues
            .iter()
            .map(|entry| QueueInfo::from_handler(entry.value()))
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Unlink every stored message from a durable queue, deleting rows that
    /// no other queue holds.
    async fn detach_stored(&self, queue_name: &str) -> Result<()> {
        let stored = self.store.read_all(queue_name).await?;
        if stored.is_empty() {
            return Ok(());
        }
        let mut data = TransactionData::new();
        for message in &stored {
            data.add_detach(queue_name, message.id());
            data.add_deletable(message.id());
        }
        self.store.persist(&data).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Publish a new message to every queue in `queue_names`.
    ///
    /// Durable queues get the message stored first. Capacity rejections on
    /// non-durable queues are counted in the result, not returned as errors.
    pub async fn publish(
        &self,
        queue_names: &[&str],
        metadata: Metadata,
        content: impl Into<Vec<u8>>,
    ) -> Result<Published> {
        let handlers = queue_names
            .iter()
            .map(|name| self.handler(name))
            .collect::<Result<Vec<_>>>()?;

        let message = Message::new(self.next_message_id(), metadata, content);

        let mut data = TransactionData::new();
        for handler in handlers.iter().filter(|h| h.is_durable()) {
            data.add_enqueue(handler.name(), &message);
        }
        self.store.persist(&data).await?;
        drop(data);

        let message_id = message.id();
        let mut enqueued = 0;
        for handler in &handlers {
            if handler.enqueue(message.shallow_copy()) {
                enqueued += 1;
                self.scheduler.wake(handler.name());
            }
        }
        message.release();

        Ok(Published {
            message_id,
            enqueued,
            rejected: handlers.len() - enqueued,
        })
    }

    /// Acknowledge a delivered message, removing it from its queue.
    ///
    /// The stored row is only deleted once no other queue holds it.
    pub async fn acknowledge(&self, queue_name: &str, message: Message) -> Result<()> {
        let handler = self.handler(queue_name)?;
        if handler.is_durable() {
            let mut data = TransactionData::new();
            data.add_detach(queue_name, message.id());
            data.add_deletable(message.id());
            self.store.persist(&data).await?;
        }
        handler.dequeue(message);
        Ok(())
    }

    /// Return a delivered message for redelivery.
    pub fn requeue(&self, queue_name: &str, message: Message) -> Result<()> {
        let handler = self.handler(queue_name)?;
        handler.requeue(message);
        self.scheduler.wake(queue_name);
        Ok(())
    }

    /// Purge a queue and, if durable, unlink its stored messages.
    ///
    /// Fails with a validation error while consumers are attached.
    pub async fn purge(&self, queue_name: &str) -> Result<usize> {
        let handler = self.handler(queue_name)?;
        let discarded = handler.purge()?;
        if handler.is_durable() {
            self.detach_stored(queue_name).await?;
        }
        Ok(discarded)
    }

    // ------------------------------------------------------------------
    // Consumers and bindings
    // ------------------------------------------------------------------

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<bool> {
        let handler = self.handler(consumer.queue_name())?;
        let queue_name = handler.name().to_string();
        let added = handler.add_consumer(consumer);
        self.scheduler.wake(&queue_name);
        Ok(added)
    }

    pub fn remove_consumer(&self, queue_name: &str, consumer_id: Uuid) -> Result<bool> {
        Ok(self.handler(queue_name)?.remove_consumer(consumer_id))
    }

    /// Signal that a consumer regained capacity.
    pub fn consumer_ready(&self, queue_name: &str) {
        self.scheduler.wake(queue_name);
    }

    pub fn add_binding(&self, binding: Binding, listener: BindingListener) -> Result<()> {
        let handler = self.handler(&binding.queue_name)?;
        tracing::debug!(binding = %binding, "Binding added");
        handler.add_binding(binding, listener);
        Ok(())
    }

    pub fn remove_binding(&self, binding: &Binding) -> Result<bool> {
        Ok(self.handler(&binding.queue_name)?.remove_binding(binding))
    }

    // ------------------------------------------------------------------
    // Distributed transactions
    // ------------------------------------------------------------------

    fn take_branch(&self, xid: &Xid) -> Result<Branch> {
        self.branches
            .remove(xid)
            .map(|(_, branch)| branch)
            .ok_or_else(|| BrokerError::NotFound(format!("transaction branch {}", xid)))
    }

    fn with_active_branch<T>(&self, xid: &Xid, f: impl FnOnce(&mut Branch) -> Result<T>) -> Result<T> {
        let mut branch = self
            .branches
            .entry(xid.clone())
            .or_insert_with(|| Branch::new(xid.clone()));
        if branch.is_prepared() {
            return Err(BrokerError::Validation(format!(
                "transaction {} is already prepared",
                xid
            )));
        }
        f(&mut *branch)
    }

    /// Stage a new message for `queue_names` under `xid`. The message stays
    /// invisible until the branch commits.
    pub fn enqueue_in_transaction(
        &self,
        xid: &Xid,
        queue_names: &[&str],
        metadata: Metadata,
        content: impl Into<Vec<u8>>,
    ) -> Result<MessageId> {
        let handlers = queue_names
            .iter()
            .map(|name| self.handler(name))
            .collect::<Result<Vec<_>>>()?;
        let message = Message::new(self.next_message_id(), metadata, content);
        let message_id = message.id();

        self.with_active_branch(xid, |branch| {
            for handler in &handlers {
                handler.prepare_for_enqueue(xid, message.shallow_copy())?;
                branch.queues.insert(handler.name().to_string());
                if handler.is_durable() {
                    branch.data.add_enqueue(handler.name(), &message);
                }
            }
            Ok(())
        })?;
        message.release();
        Ok(message_id)
    }

    /// Stage the acknowledgement of a delivered message under `xid`.
    pub fn detach_in_transaction(&self, xid: &Xid, queue_name: &str, message: Message) -> Result<()> {
        let handler = self.handler(queue_name)?;
        self.with_active_branch(xid, |branch| {
            handler.prepare_for_detach(xid, message.id())?;
            branch.queues.insert(queue_name.to_string());
            if handler.is_durable() {
                branch.data.add_detach(queue_name, message.id());
                branch.data.add_deletable(message.id());
            }
            branch.detached.push((queue_name.to_string(), message));
            Ok(())
        })
    }

    /// Durably prepare the branch. On failure the branch stays active and
    /// prepare can be retried.
    pub async fn prepare(&self, xid: &Xid) -> Result<()> {
        let mut branch = self.take_branch(xid)?;
        if branch.is_prepared() {
            self.branches.insert(xid.clone(), branch);
            return Err(BrokerError::Validation(format!(
                "transaction {} is already prepared",
                xid
            )));
        }

        let result = self.store.prepare(xid, &branch.data).await;
        if result.is_ok() {
            branch.state = BranchState::Prepared;
        }
        self.branches.insert(xid.clone(), branch);
        result?;
        tracing::info!(xid = %xid, "Transaction prepared");
        Ok(())
    }

    /// Commit the branch. With `one_phase` an active branch is prepared
    /// first; otherwise it must already be prepared.
    ///
    /// Committing an unknown Xid is a no-op.
    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let Some((_, mut branch)) = self.branches.remove(xid) else {
            self.store
                .commit_prepared_data(xid, &TransactionData::new())
                .await?;
            return Ok(());
        };

        if !branch.is_prepared() {
            if !one_phase {
                self.branches.insert(xid.clone(), branch);
                return Err(BrokerError::Validation(format!(
                    "transaction {} must be prepared before a two-phase commit",
                    xid
                )));
            }
            if let Err(e) = self.store.prepare(xid, &branch.data).await {
                self.branches.insert(xid.clone(), branch);
                return Err(e.into());
            }
            branch.state = BranchState::Prepared;
        }

        if let Err(e) = self.store.commit_prepared_data(xid, &branch.data).await {
            self.branches.insert(xid.clone(), branch);
            return Err(e.into());
        }

        self.resolve_queues(&branch, true);
        for (queue_name, message) in branch.detached {
            match self.queue_handler(&queue_name) {
                Some(handler) => handler.dequeue(message),
                None => message.release(),
            }
        }
        tracing::info!(xid = %xid, one_phase = one_phase, "Transaction committed");
        Ok(())
    }

    /// Roll back the branch, returning its acknowledged messages for
    /// redelivery. Rolling back an unknown Xid is a no-op.
    pub async fn rollback(&self, xid: &Xid) -> Result<()> {
        let Some((_, branch)) = self.branches.remove(xid) else {
            self.store.rollback_prepared_data(xid).await?;
            return Ok(());
        };

        if branch.is_prepared() {
            if let Err(e) = self.store.rollback_prepared_data(xid).await {
                self.branches.insert(xid.clone(), branch);
                return Err(e.into());
            }
        }

        self.resolve_queues(&branch, false);
        for (queue_name, message) in branch.detached {
            match self.queue_handler(&queue_name) {
                Some(handler) => {
                    handler.requeue(message);
                    self.scheduler.wake(&queue_name);
                }
                None => message.release(),
            }
        }
        tracing::info!(xid = %xid, "Transaction rolled back");
        Ok(())
    }

    fn resolve_queues(&self, branch: &Branch, commit: bool) {
        for queue_name in &branch.queues {
            let Some(handler) = self.queue_handler(queue_name) else {
                tracing::warn!(
                    xid = %branch.xid,
                    queue = %queue_name,
                    "Queue deleted before transaction resolved"
                );
                continue;
            };
            if commit {
                handler.commit(&branch.xid);
                self.scheduler.wake(queue_name);
            } else {
                handler.rollback(&branch.xid);
            }
        }
    }

    /// Xids prepared but not yet committed or rolled back.
    pub fn in_doubt_xids(&self) -> Vec<Xid> {
        self.branches
            .iter()
            .filter(|entry| entry.value().is_prepared())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Prepared Xids found in the store at startup and still unresolved.
    pub fn recovered_xids(&self) -> Vec<Xid> {
        self.branches
            .iter()
            .filter(|entry| entry.value().recovered)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Rebuild in-memory state from the store: seed message ids, re-index
    /// prepared Xids, re-stage their enqueues on the declared queues and
    /// hold their acknowledged messages until the branch resolves.
    ///
    /// Durable queues must be declared before calling this.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if let Some(max_id) = self.store.max_message_id().await? {
            self.id_generator.advance_past(max_id);
        }

        let mut xids = Vec::new();
        self.store
            .retrieve_all_stored_xids(|xid| xids.push(xid.clone()))
            .await?;

        let mut report = RecoveryReport::default();
        for xid in xids {
            let staged = self.store.retrieve_all_enqueued_messages(&xid).await?;
            let detached = self.store.retrieve_all_detached_messages(&xid).await?;
            let mut branch = Branch::recovered(xid.clone());
            let mut queues = BTreeSet::new();

            for (queue_name, message) in staged {
                match self.queue_handler(&queue_name) {
                    Some(handler) => {
                        handler.prepare_for_enqueue(&xid, message)?;
                        queues.insert(queue_name);
                        report.restaged_messages += 1;
                    }
                    None => tracing::warn!(
                        xid = %xid,
                        queue = %queue_name,
                        "Prepared message targets an undeclared queue"
                    ),
                }
            }

            // Held acknowledgements: dropped on commit, redelivered on rollback
            for (queue_name, message) in detached {
                branch.data.add_deletable(message.id());
                match self.queue_handler(&queue_name) {
                    Some(handler) => {
                        handler.restore_in_flight(1);
                        branch.detached.push((queue_name, message));
                        report.held_acknowledgements += 1;
                    }
                    None => {
                        tracing::warn!(
                            xid = %xid,
                            queue = %queue_name,
                            "Prepared acknowledgement targets an undeclared queue"
                        );
                        message.release();
                    }
                }
            }

            branch.queues = queues;
            self.branches.insert(xid, branch);
            report.in_doubt += 1;
        }

        tracing::info!(
            in_doubt = report.in_doubt,
            restaged_messages = report.restaged_messages,
            held_acknowledgements = report.held_acknowledgements,
            "Broker recovery completed"
        );
        Ok(report)
    }

    /// Stop delivery for every queue.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        tracing::info!(queues = self.queues.len(), "Broker stopped");
    }
}
