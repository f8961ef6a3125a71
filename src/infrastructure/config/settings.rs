use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

/// Admin HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Capacity of every non-durable queue
    #[serde(default = "default_non_durable_queue_max_depth")]
    pub non_durable_queue_max_depth: usize,
    #[serde(default = "default_store_backend")]
    pub store_backend: StoreBackend,
    /// Durable queues declared at startup, before recovery runs
    #[serde(default)]
    pub durable_queues: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound of messages handed out by one delivery task invocation
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long an idle delivery task sleeps before polling again
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Random extra delay added to the idle interval
    #[serde(default = "default_idle_jitter_ms")]
    pub idle_jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit log lines as JSON instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_non_durable_queue_max_depth() -> usize {
    10_000
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_idle_interval_ms() -> u64 {
    100
}

fn default_idle_jitter_ms() -> u64 {
    20
}

fn default_database_url() -> String {
    "postgres://localhost:5432/ara_broker".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-broker".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("broker.non_durable_queue_max_depth", 10_000)?
            .set_default("broker.store_backend", "memory")?
            .set_default("delivery.max_batch_size", 1000)?
            .set_default("delivery.idle_interval_ms", 100)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // BROKER__STORE_BACKEND, DELIVERY__MAX_BATCH_SIZE, DATABASE__URL, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl DeliveryConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            non_durable_queue_max_depth: default_non_durable_queue_max_depth(),
            store_backend: default_store_backend(),
            durable_queues: Vec::new(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            idle_interval_ms: default_idle_interval_ms(),
            idle_jitter_ms: default_idle_jitter_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            delivery: DeliveryConfig::default(),
            database: DatabaseConfig::default(),
            otel: OtelConfig::default(),
        }
    }
}
