//! Full-state transfer frame.
//!
//! The packed words are run-length encoded ([`crate::rle`]) and then
//! base64'd so the frame travels as text:
//! ```json
//! {"bitsetRLE": "<base64(rle(words))>", "size": 1000000000}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::bitvec::{BitVector, BitVectorError};
use crate::rle::{self, CodecError};

/// Transfer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid full-state frame: {0}")]
    Json(String),
    #[error(transparent)]
    Vector(#[from] BitVectorError),
}

/// RLE + base64 encode packed words.
pub fn encode_words(words: &[u64]) -> String {
    STANDARD.encode(rle::encode(words))
}

/// Inverse of [`encode_words`].
pub fn decode_words(encoded: &str) -> Result<Vec<u64>, TransferError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| TransferError::Base64(e.to_string()))?;
    Ok(rle::decode(&bytes)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStateFrame {
    #[serde(rename = "bitsetRLE")]
    pub bitset_rle: String,
    /// Number of cells in the vector
    pub size: u64,
}

impl FullStateFrame {
    pub fn from_words(size: u64, words: &[u64]) -> Self {
        Self {
            bitset_rle: encode_words(words),
            size,
        }
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        serde_json::to_string(self).map_err(|e| TransferError::Json(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text).map_err(|e| TransferError::Json(e.to_string()))
    }

    pub fn words(&self) -> Result<Vec<u64>, TransferError> {
        decode_words(&self.bitset_rle)
    }

    /// Expand into a bit vector of `size` cells.
    ///
    /// The run table is totalled first, so a frame describing the wrong
    /// number of words is refused before anything is expanded.
    pub fn to_vector(&self) -> Result<BitVector, TransferError> {
        let bytes = self.rle_bytes()?;
        let expected = BitVector::words_for(self.size);
        let described = rle::decoded_len(&bytes)?;
        if described != expected as u64 {
            return Err(BitVectorError::WordCount {
                expected,
                actual: usize::try_from(described).unwrap_or(usize::MAX),
            }
            .into());
        }
        Ok(BitVector::from_words(self.size, rle::decode(&bytes)?)?)
    }

    /// Number of set cells, counted from the run table without expanding.
    pub fn count_ones(&self) -> Result<u64, TransferError> {
        let counts = rle::decode_as_counts(&self.rle_bytes()?)?;
        Ok(counts
            .iter()
            .map(|(word, run)| u64::from(word.count_ones()) * run)
            .sum())
    }

    fn rle_bytes(&self) -> Result<Vec<u8>, TransferError> {
        STANDARD
            .decode(&self.bitset_rle)
            .map_err(|e| TransferError::Base64(e.to_string()))
    }
}
