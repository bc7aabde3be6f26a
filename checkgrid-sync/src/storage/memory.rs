//! In-process blob store.
//!
//! Used when no storage path is configured, and by tests. Can be switched
//! into an unavailable state to exercise the persistence-failure path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{BlobStore, PersistenceError};

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// When set, every call fails with [`PersistenceError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Current blob under `key`, bypassing the availability switch.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(key).cloned()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(PersistenceError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.check_available()?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(blobs.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        blobs.insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", b"abc").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"abc".to_vec()));
        store.set("k", b"xyz").unwrap();
        assert_eq!(store.peek("k"), Some(b"xyz".to_vec()));
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryBlobStore::new();
        store.set("k", b"abc").unwrap();
        store.set_unavailable(true);
        assert!(store.set("k", b"new").is_err());
        assert!(store.get("k").is_err());
        // failed writes are not counted and leave the old blob in place
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.peek("k"), Some(b"abc".to_vec()));

        store.set_unavailable(false);
        assert_eq!(store.get("k").unwrap(), Some(b"abc".to_vec()));
    }
}
