use std::fmt;

use serde::Serialize;

use crate::infrastructure::error::Result;

/// Routing rule linking a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Binding {
    pub exchange_name: String,
    pub routing_key: String,
    pub queue_name: String,
}

impl Binding {
    pub fn new(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            queue_name: queue_name.into(),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.exchange_name, self.routing_key, self.queue_name
        )
    }
}

/// Callback fired when the bound queue is deleted, used to unregister the
/// binding from its exchange.
pub type BindingListener = Box<dyn Fn(&Binding) -> Result<()> + Send + Sync>;
