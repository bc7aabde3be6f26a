//! Shared owner of the canonical bit vector.
//!
//! All access goes through a `tokio::sync::RwLock`: readers proceed in
//! parallel, a writer excludes everyone. A batch is applied under a single
//! write guard, so readers see either none or all of it.

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::bitvec::{BitVector, BitVectorError, Update};

/// Result of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Mutations written, in arrival order.
    pub applied: Vec<Update>,
    /// Mutations rejected, with the reason.
    pub rejected: Vec<(Update, BitVectorError)>,
}

pub struct BitStore {
    len: u64,
    bits: RwLock<BitVector>,
}

impl BitStore {
    /// Create a store holding an all-false vector of `len` bits.
    pub fn new(len: u64) -> Self {
        Self::from_vector(BitVector::new(len))
    }

    pub fn from_vector(bits: BitVector) -> Self {
        Self {
            len: bits.len(),
            bits: RwLock::new(bits),
        }
    }

    /// Number of cells. Fixed for the lifetime of the store.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn get(&self, index: u64) -> Result<bool, BitVectorError> {
        self.bits.read().await.get(index)
    }

    pub async fn set(&self, index: u64, value: bool) -> Result<(), BitVectorError> {
        self.bits.write().await.set(index, value)
    }

    /// Apply every mutation in order under one write guard.
    ///
    /// Later mutations to the same index win. An out-of-range mutation is
    /// rejected on its own; the rest of the batch still lands.
    pub async fn apply_batch(&self, batch: &[Update]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            applied: Vec::with_capacity(batch.len()),
            rejected: Vec::new(),
        };

        let mut bits = self.bits.write().await;
        for &update in batch {
            match bits.apply(update) {
                Ok(()) => outcome.applied.push(update),
                Err(e) => outcome.rejected.push((update, e)),
            }
        }
        outcome
    }

    /// Shared guard over the vector. No batch lands while it is held.
    pub async fn read(&self) -> RwLockReadGuard<'_, BitVector> {
        self.bits.read().await
    }

    /// Point-in-time copy of the packed words.
    pub async fn snapshot(&self) -> Vec<u64> {
        self.bits.read().await.words().to_vec()
    }

    /// Point-in-time copy in the persistence blob format.
    pub async fn save_to(&self) -> Vec<u8> {
        self.bits.read().await.to_bytes()
    }

    /// Replace the whole state from a persisted blob.
    pub async fn load_from(&self, bytes: &[u8]) -> Result<(), BitVectorError> {
        let loaded = BitVector::from_bytes(self.len, bytes)?;
        *self.bits.write().await = loaded;
        Ok(())
    }

    pub async fn count_ones(&self) -> u64 {
        self.bits.read().await.count_ones()
    }
}
