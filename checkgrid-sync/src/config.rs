//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

const ENV_BIND_ADDR: &str = "CHECKGRID_BIND_ADDR";
const ENV_VECTOR_SIZE: &str = "CHECKGRID_VECTOR_SIZE";
const ENV_BATCH_SIZE: &str = "CHECKGRID_BATCH_SIZE";
const ENV_FLUSH_INTERVAL_MS: &str = "CHECKGRID_FLUSH_INTERVAL_MS";
const ENV_OBSERVER_QUEUE: &str = "CHECKGRID_OBSERVER_QUEUE";
const ENV_INGEST_QUEUE: &str = "CHECKGRID_INGEST_QUEUE";
const ENV_STORAGE_PATH: &str = "CHECKGRID_STORAGE_PATH";
const ENV_STATE_KEY: &str = "CHECKGRID_STATE_KEY";
const ENV_HANDSHAKE_TIMEOUT_MS: &str = "CHECKGRID_HANDSHAKE_TIMEOUT_MS";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Number of cells in the shared vector
    pub vector_size: u64,
    /// Flush as soon as this many mutations are pending (1 = pass-through)
    pub batch_size: usize,
    /// Flush a non-empty batch at least this often
    pub flush_interval: Duration,
    /// Outbound notifications buffered per observer before dropping
    pub observer_queue_capacity: usize,
    /// Inbound mutations buffered before producers wait
    pub ingest_queue_capacity: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Key the grid state is stored under
    pub state_key: String,
    /// Connections that have not completed the WebSocket upgrade by then are dropped
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            vector_size: 1_000_000_000,
            batch_size: 1,
            flush_interval: Duration::from_secs(1),
            observer_queue_capacity: 10,
            ingest_queue_capacity: 100,
            storage_path: None,
            state_key: "bitset".to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `CHECKGRID_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns per variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(v) = lookup(ENV_VECTOR_SIZE) {
            config.vector_size = parse(ENV_VECTOR_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = parse(ENV_BATCH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_FLUSH_INTERVAL_MS) {
            config.flush_interval = Duration::from_millis(parse(ENV_FLUSH_INTERVAL_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_OBSERVER_QUEUE) {
            config.observer_queue_capacity = parse(ENV_OBSERVER_QUEUE, &v)?;
        }
        if let Some(v) = lookup(ENV_INGEST_QUEUE) {
            config.ingest_queue_capacity = parse(ENV_INGEST_QUEUE, &v)?;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH).filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(key) = lookup(ENV_STATE_KEY) {
            config.state_key = key;
        }
        if let Some(v) = lookup(ENV_HANDSHAKE_TIMEOUT_MS) {
            config.handshake_timeout = Duration::from_millis(parse(ENV_HANDSHAKE_TIMEOUT_MS, &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vector_size == 0 {
            return Err(ConfigError::Zero("vector_size"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Zero("flush_interval"));
        }
        if self.observer_queue_capacity == 0 {
            return Err(ConfigError::Zero("observer_queue_capacity"));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(ConfigError::Zero("ingest_queue_capacity"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Zero("handshake_timeout"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        var,
        value: value.to_string(),
    })
}
