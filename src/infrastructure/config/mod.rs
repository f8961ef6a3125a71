mod settings;

pub use settings::{
    BrokerConfig, DatabaseConfig, DeliveryConfig, OtelConfig, ServerConfig, Settings, StoreBackend,
};
