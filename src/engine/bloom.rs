//! Marten - Bloom Filter
//! Probabilistic membership filter embedded in every sorted segment.
//!
//! False positives are possible, false negatives are not: a `false`
//! answer lets the read path skip the segment entirely, which is what
//! bounds read amplification for missing keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A Bloom filter for probabilistic set membership testing.
///
/// Sized from the expected item count and target false positive rate:
/// - bits: `m = -n * ln(p) / (ln(2)^2)`
/// - hash functions: `k = (m/n) * ln(2)`
///
/// Serialized with the segment it guards, so a reopened segment gets
/// the exact filter it was built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Bit array packed into 64-bit words.
    words: Vec<u64>,
    /// Number of usable bits in the filter.
    num_bits: u64,
    /// Number of hash probes per key.
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at the given
    /// `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(0.0001, 0.5);

        let num_bits = (-n * p.ln() / (2.0_f64.ln().powi(2))).ceil() as u64;
        let num_bits = num_bits.max(64);

        let num_hashes = ((num_bits as f64 / n) * 2.0_f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(2, 16);

        let num_words = num_bits.div_ceil(64) as usize;

        Self {
            words: vec![0u64; num_words],
            num_bits,
            num_hashes,
        }
    }

    /// Insert a key into the filter.
    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit = self.probe(key, i);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// Check if a key *may* be in the set.
    /// `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let bit = self.probe(key, i);
            if self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of usable bits.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash probes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Double hashing: probe i maps to `h1 + i * h2` mod num_bits.
    fn probe(&self, key: &[u8], i: u32) -> u64 {
        let h1 = Self::hash_seeded(key, 0x6d61_7274);
        let h2 = Self::hash_seeded(key, 0x656e_5f6b_76);
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn hash_seeded(key: &[u8], seed: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_keys_are_reported_present() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            bf.insert(format!("key_{}", i).as_bytes());
        }
        // No false negatives, ever.
        for i in 0..500 {
            assert!(bf.may_contain(format!("key_{}", i).as_bytes()));
        }
    }

    #[test]
    fn absent_keys_mostly_reported_absent() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("present_{}", i).as_bytes());
        }

        let mut false_positives = 0;
        for i in 0..1000 {
            if bf.may_contain(format!("absent_{}", i).as_bytes()) {
                false_positives += 1;
            }
        }
        // Target rate is 1%; allow generous slack.
        assert!(false_positives < 50, "fp count: {}", false_positives);
    }

    #[test]
    fn survives_serialization() {
        let mut bf = BloomFilter::new(100, 0.01);
        bf.insert(b"alpha");
        bf.insert(b"bravo");

        let bytes = bincode::serialize(&bf).unwrap();
        let restored: BloomFilter = bincode::deserialize(&bytes).unwrap();

        assert!(restored.may_contain(b"alpha"));
        assert!(restored.may_contain(b"bravo"));
        assert_eq!(restored.num_bits(), bf.num_bits());
        assert_eq!(restored.num_hashes(), bf.num_hashes());
    }

    #[test]
    fn minimum_sizing() {
        let bf = BloomFilter::new(0, 0.0);
        assert!(bf.num_bits() >= 64);
        assert!(bf.num_hashes() >= 2);
    }
}
