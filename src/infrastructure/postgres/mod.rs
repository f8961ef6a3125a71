//! PostgreSQL persistence module.
//!
//! Provides connection pooling for the PostgreSQL message store.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
