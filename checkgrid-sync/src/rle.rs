//! Run-length codec for packed bit-vector words.
//!
//! Wire format:
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┬─────
//! │ value₀       │ run₀         │ value₁       │ run₁         │ ...
//! │ uvarint      │ uvarint ≥ 1  │ uvarint      │ uvarint ≥ 1  │
//! └──────────────┴──────────────┴──────────────┴──────────────┴─────
//! ```
//!
//! Each value is a whole 64-bit word, not a single bit, and each run counts
//! consecutive equal words. Varints are LEB128 (least significant group
//! first, high bit = continuation). An empty word sequence encodes to an
//! empty byte stream.
//!
//! A sparse 10⁹-bit grid is ~15.6M words that collapse into a handful of
//! pairs, so decoding is streaming: [`Decoder`] yields one word per `next()`
//! and [`Runs`] yields one `(value, run)` pair per `next()`, letting callers
//! stop early or count without expanding.

use std::collections::HashMap;

use unsigned_varint::{decode, encode};

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Stream ended in the middle of a `(value, run)` pair.
    #[error("unexpected end of stream")]
    Truncated,
    /// A varint could not be decoded.
    #[error("malformed varint: {0}")]
    Malformed(String),
    /// A pair declared a run of zero words.
    #[error("run length of zero for value {0:#x}")]
    ZeroRun(u64),
}

/// Encode a word sequence as `(value, run)` varint pairs.
pub fn encode(words: &[u64]) -> Vec<u8> {
    let Some((&first, rest)) = words.split_first() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut buf = encode::u64_buffer();
    let mut current = first;
    let mut run: u64 = 1;

    for &word in rest {
        if word != current {
            push_pair(&mut out, &mut buf, current, run);
            current = word;
            run = 0;
        }
        run += 1;
    }

    // Final run is always flushed, including runs of length 1.
    push_pair(&mut out, &mut buf, current, run);
    out
}

fn push_pair(out: &mut Vec<u8>, buf: &mut [u8; 10], value: u64, run: u64) {
    out.extend_from_slice(encode::u64(value, buf));
    out.extend_from_slice(encode::u64(run, buf));
}

/// Decode a stream back into the exact word sequence.
pub fn decode(bytes: &[u8]) -> Result<Vec<u64>, CodecError> {
    Decoder::new(bytes).collect()
}

/// Decode a stream into a `value → total run` frequency table.
///
/// Runs are summed without being expanded, so a stream describing billions
/// of words is counted in time proportional to its byte length.
pub fn decode_as_counts(bytes: &[u8]) -> Result<HashMap<u64, u64>, CodecError> {
    let mut counts = HashMap::new();
    for pair in Runs::new(bytes) {
        let (value, run) = pair?;
        *counts.entry(value).or_insert(0u64) += run;
    }
    Ok(counts)
}

/// Total number of words described by a stream, without expanding it.
pub fn decoded_len(bytes: &[u8]) -> Result<u64, CodecError> {
    Runs::new(bytes).try_fold(0u64, |acc, pair| {
        let (_, run) = pair?;
        Ok(acc.saturating_add(run))
    })
}

/// Iterator over the `(value, run)` pairs of an encoded stream.
///
/// Stops after the first error.
#[derive(Debug, Clone)]
pub struct Runs<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Runs<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }

    fn read_pair(&mut self) -> Result<(u64, u64), CodecError> {
        let (value, rest) = read_varint(self.buf)?;
        if rest.is_empty() {
            return Err(CodecError::Truncated);
        }
        let (run, rest) = read_varint(rest)?;
        if run == 0 {
            return Err(CodecError::ZeroRun(value));
        }
        self.buf = rest;
        Ok((value, run))
    }
}

impl Iterator for Runs<'_> {
    type Item = Result<(u64, u64), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        let pair = self.read_pair();
        self.failed = pair.is_err();
        Some(pair)
    }
}

fn read_varint(buf: &[u8]) -> Result<(u64, &[u8]), CodecError> {
    decode::u64(buf).map_err(|e| match e {
        decode::Error::Insufficient => CodecError::Truncated,
        other => CodecError::Malformed(other.to_string()),
    })
}

/// Streaming word decoder.
///
/// Each `next()` yields one word, draining the pending run before any new
/// bytes are consumed.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    runs: Runs<'a>,
    value: u64,
    remaining: u64,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            runs: Runs::new(buf),
            value: 0,
            remaining: 0,
        }
    }

    /// The word most recently yielded (or about to be repeated).
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Repetitions of [`value`](Self::value) still pending in the current run.
    pub fn remaining_run(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<u64, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Some(Ok(self.value));
        }

        match self.runs.next()? {
            Ok((value, run)) => {
                self.value = value;
                self.remaining = run - 1;
                Some(Ok(value))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
