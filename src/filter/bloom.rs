//! Bloom filter.
//!
//! Every block of a disk fragment carries a small fixed-size filter over the
//! column families it contains, so scans restricted to a few families can
//! skip blocks without reading them.

use crate::error::{Error, Result};
use crate::filter::Filter;
use std::hash::{Hash, Hasher};

/// Bits in a per-block column family filter.
pub const FAMILY_FILTER_BITS: usize = 256;

/// Hash functions used by a per-block column family filter.
pub const FAMILY_FILTER_HASHES: u32 = 4;

const ENCODED_HEADER: usize = 12;

/// Probabilistic set membership over byte strings.
///
/// # Example
/// ```
/// use tabletdb::filter::{BloomFilter, Filter};
///
/// let mut filter = BloomFilter::for_families();
/// filter.add(b"meta");
/// assert!(filter.may_contain(b"meta"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
    num_bits: usize,
}

impl BloomFilter {
    /// Create a filter sized for `expected_keys` at the given false positive
    /// rate.
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Self {
        if expected_keys == 0 {
            return Self::with_size(64, 1);
        }
        let n = expected_keys as f64;
        let p = false_positive_rate.clamp(0.0001, 0.9999);
        // m = -n * ln(p) / ln(2)^2, k = (m / n) * ln(2)
        let num_bits = ((-n * p.ln() / 2.0_f64.ln().powi(2)).ceil() as usize).max(64);
        let num_hashes = ((num_bits as f64 / n) * 2.0_f64.ln()).ceil() as u32;
        Self::with_size(num_bits, num_hashes.clamp(1, 30))
    }

    /// Create an empty filter with exactly `num_bits` bits and `num_hashes`
    /// probes per key.
    pub fn with_size(num_bits: usize, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_hashes: num_hashes.max(1),
            num_bits,
        }
    }

    /// An empty column family filter.
    pub fn for_families() -> Self {
        Self::with_size(FAMILY_FILTER_BITS, FAMILY_FILTER_HASHES)
    }

    /// True if no key has been added.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// True if any of `keys` may be present.
    pub fn may_contain_any<K: AsRef<[u8]>>(&self, keys: &[K]) -> bool {
        keys.iter().any(|k| self.may_contain(k.as_ref()))
    }

    /// Get the number of hash functions used.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Get the number of bits in the filter.
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    // Double hashing: h_i = h1 + i * h2 (mod m).
    fn probes(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let h1 = hash_with_seed(key, 0xbc9f1d34);
        let h2 = hash_with_seed(key, 0xd0e89c7b);
        (0..self.num_hashes).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) as usize) % self.num_bits)
    }
}

impl Filter for BloomFilter {
    fn may_contain(&self, key: &[u8]) -> bool {
        self.probes(key).all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    fn add(&mut self, key: &[u8]) {
        let positions: Vec<usize> = self.probes(key).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Format: `[num_hashes: u32][num_bits: u64][bits]`.
    fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(ENCODED_HEADER + self.bits.len());
        encoded.extend_from_slice(&self.num_hashes.to_le_bytes());
        encoded.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        encoded.extend_from_slice(&self.bits);
        encoded
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENCODED_HEADER {
            return Err(Error::corruption("bloom filter data too short"));
        }
        let num_hashes = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[4..12]);
        let num_bits = u64::from_le_bytes(raw) as usize;
        if num_bits == 0 || num_hashes == 0 || data.len() != ENCODED_HEADER + num_bits.div_ceil(8) {
            return Err(Error::corruption("bloom filter size mismatch"));
        }
        Ok(Self { bits: data[ENCODED_HEADER..].to_vec(), num_hashes, num_bits })
    }
}

fn hash_with_seed(key: &[u8], seed: u32) -> u32 {
    let mut hasher = FnvHasher::new_with_seed(seed);
    key.hash(&mut hasher);
    hasher.finish() as u32
}

/// FNV-1a with a seeded offset basis.
struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    fn new_with_seed(seed: u32) -> Self {
        Self { state: Self::FNV_OFFSET_BASIS ^ (seed as u64) }
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(Self::FNV_PRIME);
        }
    }
}
