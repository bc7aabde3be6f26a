//! Fixed-size packed bit vector.
//!
//! Bits are packed LSB-first into `u64` words:
//! ```text
//! word 0: [bit 0][bit 1] ... [bit 63]
//! word 1: [bit 64]       ... [bit 127]
//! ```
//! Bits past `len` in the last word are always zero, so two vectors with
//! the same cells have identical words (and identical encodings).
//!
//! Blob format: the words serialized little-endian, back to back.

use serde::{Deserialize, Serialize};

const WORD_BITS: u64 = 64;

/// Bit vector errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitVectorError {
    #[error("index {index} out of range for vector of {len} bits")]
    OutOfRange { index: u64, len: u64 },
    #[error("blob of {actual} bytes does not hold {expected} bytes of packed words")]
    BlobSize { expected: usize, actual: usize },
    #[error("expected {expected} words, got {actual}")]
    WordCount { expected: usize, actual: usize },
}

/// A single cell assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Update {
    pub index: u64,
    pub value: bool,
}

impl Update {
    pub fn new(index: u64, value: bool) -> Self {
        Self { index, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    len: u64,
}

impl BitVector {
    /// Create an all-false vector of `len` bits.
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; Self::words_for(len)],
            len,
        }
    }

    /// Number of words needed to hold `len` bits.
    pub fn words_for(len: u64) -> usize {
        len.div_ceil(WORD_BITS) as usize
    }

    /// Rebuild a vector from packed words.
    ///
    /// Stray bits past `len` in the last word are cleared.
    pub fn from_words(len: u64, mut words: Vec<u64>) -> Result<Self, BitVectorError> {
        let expected = Self::words_for(len);
        if words.len() != expected {
            return Err(BitVectorError::WordCount {
                expected,
                actual: words.len(),
            });
        }
        if let Some(last) = words.last_mut() {
            *last &= Self::tail_mask(len);
        }
        Ok(Self { words, len })
    }

    /// Deserialize from the little-endian blob format.
    pub fn from_bytes(len: u64, bytes: &[u8]) -> Result<Self, BitVectorError> {
        let expected = Self::words_for(len) * 8;
        if bytes.len() != expected {
            return Err(BitVectorError::BlobSize {
                expected,
                actual: bytes.len(),
            });
        }
        let words = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Self::from_words(len, words)
    }

    /// Serialize to the little-endian blob format.
    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.words)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn get(&self, index: u64) -> Result<bool, BitVectorError> {
        let (word, mask) = self.locate(index)?;
        Ok(self.words[word] & mask != 0)
    }

    pub fn set(&mut self, index: u64, value: bool) -> Result<(), BitVectorError> {
        let (word, mask) = self.locate(index)?;
        if value {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
        Ok(())
    }

    pub fn apply(&mut self, update: Update) -> Result<(), BitVectorError> {
        self.set(update.index, update.value)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    fn locate(&self, index: u64) -> Result<(usize, u64), BitVectorError> {
        if index >= self.len {
            return Err(BitVectorError::OutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(((index / WORD_BITS) as usize, 1u64 << (index % WORD_BITS)))
    }

    fn tail_mask(len: u64) -> u64 {
        match len % WORD_BITS {
            0 => u64::MAX,
            used => (1u64 << used) - 1,
        }
    }
}

/// Serialize packed words little-endian.
pub fn words_to_bytes(words: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_all_false() {
        let bv = BitVector::new(130);
        assert_eq!(bv.words().len(), 3);
        assert_eq!(bv.count_ones(), 0);
        assert!(!bv.get(129).unwrap());
    }

    #[test]
    fn test_set_then_get() {
        let mut bv = BitVector::new(200);
        for i in [0, 63, 64, 127, 199] {
            bv.set(i, true).unwrap();
            assert!(bv.get(i).unwrap());
        }
        assert_eq!(bv.count_ones(), 5);
        bv.set(64, false).unwrap();
        assert!(!bv.get(64).unwrap());
        assert!(bv.get(63).unwrap());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut bv = BitVector::new(8);
        assert_eq!(
            bv.set(8, true),
            Err(BitVectorError::OutOfRange { index: 8, len: 8 })
        );
        assert!(bv.get(u64::MAX).is_err());
        // last word is not silently extended
        assert_eq!(bv.words(), &[0]);
    }

    #[test]
    fn test_bit_order_lsb_first() {
        let mut bv = BitVector::new(8);
        bv.set(5, true).unwrap();
        assert_eq!(bv.words(), &[0b0010_0000]);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut bv = BitVector::new(1000);
        bv.set(3, true).unwrap();
        bv.set(999, true).unwrap();
        let bytes = bv.to_bytes();
        assert_eq!(bytes.len(), 16 * 8);
        assert_eq!(BitVector::from_bytes(1000, &bytes).unwrap(), bv);
    }

    #[test]
    fn test_from_bytes_wrong_size() {
        let err = BitVector::from_bytes(128, &[0u8; 8]).unwrap_err();
        assert_eq!(
            err,
            BitVectorError::BlobSize {
                expected: 16,
                actual: 8
            }
        );
    }

    #[test]
    fn test_from_words_clears_tail() {
        let bv = BitVector::from_words(4, vec![u64::MAX]).unwrap();
        assert_eq!(bv.words(), &[0b1111]);
        assert_eq!(bv.count_ones(), 4);
    }

    #[test]
    fn test_empty_vector() {
        let bv = BitVector::new(0);
        assert!(bv.is_empty());
        assert!(bv.words().is_empty());
        assert!(bv.to_bytes().is_empty());
        assert_eq!(BitVector::from_bytes(0, &[]).unwrap(), bv);
    }
}
