use std::sync::Arc;
use std::time::Instant;

use crate::broker::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            started_at: Instant::now(),
        }
    }
}
