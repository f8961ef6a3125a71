//! Admin HTTP API.

mod dtx;
mod health;
mod metrics;
mod queues;
mod routes;

pub use routes::api_routes;
