//! Queue handler factory.

use std::sync::Arc;

use crate::infrastructure::error::Result;
use crate::observe::SharedObserver;
use crate::store::MessageStore;

use super::{DurableQueue, MemQueue, QueueHandler};

/// Creates queue handlers with the queue variant matching the declaration.
///
/// # Example
///
/// ```rust,ignore
/// let factory = QueueHandlerFactory::new(store, observer, settings.broker.non_durable_queue_max_depth);
/// let handler = factory.create_durable_queue_handler("orders", false).await?;
/// ```
pub struct QueueHandlerFactory {
    store: Arc<MessageStore>,
    observer: SharedObserver,
    non_durable_queue_max_depth: usize,
}

impl QueueHandlerFactory {
    pub fn new(
        store: Arc<MessageStore>,
        observer: SharedObserver,
        non_durable_queue_max_depth: usize,
    ) -> Self {
        Self {
            store,
            observer,
            non_durable_queue_max_depth,
        }
    }

    /// Durable handler, loaded with the messages already stored for the queue.
    pub async fn create_durable_queue_handler(
        &self,
        queue_name: &str,
        auto_delete: bool,
    ) -> Result<QueueHandler> {
        let queue = DurableQueue::load(queue_name, auto_delete, &self.store).await?;
        tracing::info!(queue = %queue_name, durable = true, "Creating queue handler");
        Ok(QueueHandler::new(Box::new(queue), Arc::clone(&self.observer)))
    }

    pub fn create_non_durable_queue_handler(
        &self,
        queue_name: &str,
        auto_delete: bool,
    ) -> QueueHandler {
        let queue = MemQueue::bounded(queue_name, self.non_durable_queue_max_depth, auto_delete);
        tracing::info!(
            queue = %queue_name,
            durable = false,
            capacity = self.non_durable_queue_max_depth,
            "Creating queue handler"
        );
        QueueHandler::new(Box::new(queue), Arc::clone(&self.observer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe;
    use crate::store::MemoryStore;

    fn factory(depth: usize) -> QueueHandlerFactory {
        let store = Arc::new(MessageStore::new(Arc::new(MemoryStore::new()), observe::noop()));
        QueueHandlerFactory::new(store, observe::noop(), depth)
    }

    #[test]
    fn test_non_durable_handler_is_bounded() {
        let handler = factory(5).create_non_durable_queue_handler("q", true);
        assert!(!handler.is_durable());
        assert_eq!(handler.queue().capacity(), Some(5));
        assert!(handler.queue().is_auto_delete());
    }

    #[tokio::test]
    async fn test_durable_handler_is_unbounded() {
        let handler = factory(5)
            .create_durable_queue_handler("q", false)
            .await
            .unwrap();
        assert!(handler.is_durable());
        assert_eq!(handler.queue().capacity(), None);
        assert!(handler.is_empty());
    }
}
