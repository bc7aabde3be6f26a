//! Persistence gateway for the bit-vector state.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   save(bytes)   ┌──────────────────┐
//! │ Batcher     │ ──────────────► │ PersistenceGateway│
//! └─────────────┘                 │  key = "bitset"   │
//! ┌─────────────┐   load()        └────────┬─────────┘
//! │ SyncServer  │ ◄─────────────           │ spawn_blocking
//! │ (startup)   │                          ▼
//! └─────────────┘                 ┌──────────────────┐
//!                                 │ dyn BlobStore     │
//!                                 │  MemoryBlobStore  │
//!                                 │  RocksBlobStore   │
//!                                 └──────────────────┘
//! ```
//!
//! The durable copy is best-effort relative to the in-memory state: a
//! failed save is reported to the caller, which logs it and moves on.

pub mod memory;
pub mod rocks;

use std::sync::Arc;

pub use memory::MemoryBlobStore;
pub use rocks::{BlobMetadata, RocksBlobStore, RocksConfig};

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Blob key/value service the core persists through.
///
/// Implementations are blocking; async callers go through
/// [`PersistenceGateway`].
pub trait BlobStore: Send + Sync {
    /// Fetch the blob stored under `key`, `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `value` under `key`, replacing any previous blob.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;
}

/// Binds a [`BlobStore`] to the single key holding the grid state.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn BlobStore>,
    key: Arc<str>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn BlobStore>, key: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted blob, `None` if nothing was saved yet.
    pub async fn load(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let store = self.store.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || store.get(&key))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }

    /// Replace the persisted blob.
    pub async fn save(&self, bytes: Vec<u8>) -> Result<(), PersistenceError> {
        let store = self.store.clone();
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || store.set(&key, &bytes))
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }
}
