//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Broker configuration and settings
//! - `error`: Unified error types
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool

pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
