//! Durable message storage.
//!
//! [`DurableStore`] is the backend seam (in-memory or PostgreSQL);
//! [`MessageStore`] coordinates queue-level persistence and distributed
//! transaction state on top of it.

pub mod backend;
pub mod coordinator;
pub mod memory_backend;
pub mod postgres_backend;
pub mod registry;

use std::sync::Arc;

pub use backend::{
    DurableStore, RecoveredXid, StoreError, StoreOperation, StoreTransaction, StoredMessage,
};
pub use coordinator::MessageStore;
pub use memory_backend::MemoryStore;
pub use postgres_backend::PostgresStore;
pub use registry::XidRegistry;

use crate::infrastructure::config::{Settings, StoreBackend};
use crate::infrastructure::postgres::{PostgresPool, PostgresPoolError};

/// Create the durable store backend selected in configuration.
pub async fn create_durable_store(settings: &Settings) -> Result<Arc<dyn DurableStore>, StoreError> {
    match settings.broker.store_backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory message store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let pool = PostgresPool::new(&settings.database)
                .await
                .map_err(|PostgresPoolError::Sqlx(err)| StoreError::Postgres(err))?;
            tracing::info!(
                url = %pool.database_url_masked(),
                "Using PostgreSQL message store"
            );
            let store = PostgresStore::new(pool.pool().clone());
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}
