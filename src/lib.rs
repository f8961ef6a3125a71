// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Broker core
pub mod message;
pub mod transaction;
pub mod store;
pub mod queue;
pub mod consumer;
pub mod delivery;
pub mod broker;

// Supporting modules
pub mod observe;
pub mod telemetry;

// Application layer
pub mod api;
pub mod server;
