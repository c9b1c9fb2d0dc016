//! Bloom filter used for bandwidth-compact key summaries.
//!
//! Sized by the standard formulas from the expected item count and target
//! false-positive rate. The probe family is derived from two 64-bit base
//! hashes of one blake3 digest (double hashing), so peers only need to agree
//! on the seed to probe identically.

use std::f64::consts::LN_2;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Filters can only be combined or compared when their parameters agree.
#[derive(Debug, thiserror::Error)]
#[error("bloom filter parameter mismatch (bit count, hash count and seed must agree)")]
pub struct ParamMismatch;

/// A Bloom filter over byte-string items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    m: u64,
    k: u32,
    seed: u64,
    items: u64,
}

impl BloomFilter {
    /// Create an empty filter sized for `expected_items` at false-positive
    /// rate `fpr`, with `m = ⌈-n·ln p / (ln 2)²⌉` and `k = round((m/n)·ln 2)`.
    ///
    /// `fpr` must be in (0, 1).
    pub fn new(expected_items: usize, fpr: f64, seed: u64) -> Self {
        debug_assert!(fpr > 0.0 && fpr < 1.0, "fpr out of range: {fpr}");
        let n = expected_items.max(1) as f64;
        let m = (((-n) * fpr.ln()) / (LN_2 * LN_2)).ceil().max(1.0) as u64;
        let k = (((m as f64) / n) * LN_2).round().max(1.0) as u32;
        let words = (m + 63) / 64;
        BloomFilter {
            bits: vec![0; words as usize],
            m,
            k,
            seed,
            items: 0,
        }
    }

    /// Reassemble a filter from its wire parts.
    pub fn from_parts(bytes: &[u8], m: u64, k: u32, seed: u64, items: u64) -> Result<Self, ParamMismatch> {
        let words = ((m + 63) / 64) as usize;
        if bytes.len() != words * 8 || m == 0 || k == 0 {
            return Err(ParamMismatch);
        }
        let bits = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunked by 8")))
            .collect();
        Ok(BloomFilter {
            bits,
            m,
            k,
            seed,
            items,
        })
    }

    /// The raw bit array, little-endian words.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.bits.len() * 8);
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.into()
    }

    /// Insert an item.
    pub fn add(&mut self, item: impl AsRef<[u8]>) {
        let (h1, h2) = self.base_hashes(item.as_ref());
        for i in 0..self.k as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.items += 1;
    }

    /// Test membership. False positives at roughly the configured rate, never
    /// false negatives; an empty filter reports no members at all.
    pub fn contains(&self, item: impl AsRef<[u8]>) -> bool {
        let (h1, h2) = self.base_hashes(item.as_ref());
        (0..self.k as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.m;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// Merge `other` into `self`. The resulting filter contains the union of
    /// both item sets; `items` becomes an upper bound since overlap is
    /// unobservable.
    pub fn union(&mut self, other: &BloomFilter) -> Result<(), ParamMismatch> {
        if self.m != other.m || self.k != other.k || self.seed != other.seed {
            return Err(ParamMismatch);
        }
        for (word, rhs) in self.bits.iter_mut().zip(&other.bits) {
            *word |= rhs;
        }
        self.items += other.items;
        Ok(())
    }

    /// Number of items inserted (an upper bound after [`BloomFilter::union`]).
    pub fn item_count(&self) -> u64 {
        self.items
    }

    /// Whether any item was inserted.
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Number of bits in the filter.
    pub fn bit_len(&self) -> u64 {
        self.m
    }

    /// Number of probe hashes.
    pub fn hash_count(&self) -> u32 {
        self.k
    }

    /// The probe family seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn base_hashes(&self, item: &[u8]) -> (u64, u64) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(item);
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        let h1 = u64::from_le_bytes(bytes[..8].try_into().expect("digest is 32 bytes"));
        // force odd so the probe sequence cannot collapse onto h1
        let h2 = u64::from_le_bytes(bytes[8..16].try_into().expect("digest is 32 bytes")) | 1;
        (h1, h2)
    }
}
