//! Bounded membership filters used by relay policy.
//!
//! [`RollingSet`] remembers at least the last `capacity` inserted items and
//! forgets older ones in bulk. [`BloomFilter`] is the probabilistic filter a
//! lightweight peer loads to select which transactions we relay to it.

use std::collections::HashSet;
use std::hash::Hash;

use weir_core::types::{Hash256, OutPoint, Transaction};

/// Largest filter, in bytes, a peer may load.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Most hash functions a loaded filter may use.
pub const MAX_HASH_FUNCS: u32 = 50;

/// Never update the filter on a match.
pub const BLOOM_UPDATE_NONE: u8 = 0;
/// Insert the outpoint of every matched output.
pub const BLOOM_UPDATE_ALL: u8 = 1;

/// Set with two generations. Once the current generation fills up it becomes
/// the previous one and the old previous generation is dropped.
#[derive(Debug, Clone)]
pub struct RollingSet<T: Eq + Hash> {
    capacity: usize,
    current: HashSet<T>,
    previous: HashSet<T>,
}

impl<T: Eq + Hash> RollingSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            current: HashSet::new(),
            previous: HashSet::new(),
        }
    }

    pub fn insert(&mut self, item: T) {
        if self.current.contains(&item) {
            return;
        }
        if self.current.len() >= self.capacity {
            self.previous = std::mem::take(&mut self.current);
        }
        self.current.insert(item);
    }

    pub fn contains(&self, item: &T) -> bool {
        self.current.contains(item) || self.previous.contains(item)
    }

    pub fn reset(&mut self) {
        self.current.clear();
        self.previous.clear();
    }

    /// Items currently remembered, across both generations.
    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }
}

/// Peer-supplied bloom filter, as carried by `filterload`.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BloomFilter {
    pub data: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: u8,
}

impl BloomFilter {
    /// Empty filter sized for `elements` items at roughly `fp_rate` false positives.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: u8) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let bits = (-1.0 / (ln2 * ln2) * elements.max(1) as f64 * fp_rate.clamp(1e-9, 1.0).ln())
            .min((MAX_BLOOM_FILTER_SIZE * 8) as f64);
        let bytes = ((bits / 8.0) as usize).max(1);
        let funcs = ((bytes * 8) as f64 / elements.max(1) as f64 * ln2) as u32;
        Self {
            data: vec![0; bytes],
            hash_funcs: funcs.clamp(1, MAX_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    /// Whether the filter respects the size limits peers must honor.
    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn bit_index(&self, n: u32, key: &[u8]) -> usize {
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed.to_le_bytes());
        hasher.update(key);
        let digest = hasher.finalize();
        let mut word = [0u8; 4];
        word.copy_from_slice(&digest.as_bytes()[..4]);
        u32::from_le_bytes(word) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, key: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let bit = self.bit_index(n, key);
            self.data[bit >> 3] |= 1 << (bit & 7);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if self.is_full() {
            return true;
        }
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|n| {
            let bit = self.bit_index(n, key);
            self.data[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    fn is_full(&self) -> bool {
        !self.data.is_empty() && self.data.iter().all(|b| *b == 0xff)
    }

    /// Whether `tx` matches the filter. Matching outputs are added as
    /// outpoints when the filter asks for updates, so spends of them match too.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction) -> bool {
        if self.is_full() {
            return true;
        }
        let txid = tx.txid();
        let mut found = self.contains(txid.as_bytes());
        for (i, output) in tx.outputs.iter().enumerate() {
            if self.contains(output.pubkey_hash.as_bytes()) {
                found = true;
                if self.flags & BLOOM_UPDATE_ALL != 0 {
                    self.insert(&OutPoint::new(txid, i as u64).to_bytes());
                }
            }
        }
        if found {
            return true;
        }
        tx.inputs.iter().any(|input| {
            self.contains(&input.previous_output.to_bytes())
                || (!input.public_key.is_empty() && self.contains(&input.public_key))
        })
    }

    pub fn insert_hash(&mut self, hash: &Hash256) {
        self.insert(hash.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::memory::make_tx;

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// The most recent `capacity` items are always remembered.
    #[test]
    fn rolling_set_keeps_recent_items() {
        let mut set = RollingSet::new(10);
        for i in 0..35u32 {
            set.insert(i);
        }
        for i in 25..35 {
            assert!(set.contains(&i), "missing {i}");
        }
        assert!(!set.contains(&0));
        assert!(set.len() <= 20);
    }

    /// Reset forgets everything.
    #[test]
    fn rolling_set_reset() {
        let mut set = RollingSet::new(4);
        set.insert(Hash256([1; 32]));
        set.reset();
        assert!(set.is_empty());
        assert!(!set.contains(&Hash256([1; 32])));
    }

    /// Inserted keys are found; filters stay within peer limits.
    #[test]
    fn bloom_insert_and_contains() {
        let mut filter = BloomFilter::new(10, 0.0001, 7, BLOOM_UPDATE_NONE);
        assert!(filter.is_within_size_constraints());
        filter.insert(b"hello");
        assert!(filter.contains(b"hello"));
        assert!(!filter.contains(b"definitely absent key"));
    }

    /// Oversized filters are flagged.
    #[test]
    fn bloom_size_constraints() {
        let filter = BloomFilter {
            data: vec![0; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 1,
            tweak: 0,
            flags: 0,
        };
        assert!(!filter.is_within_size_constraints());
    }

    /// A matching output makes its spender relevant under BLOOM_UPDATE_ALL.
    #[test]
    fn bloom_update_all_tracks_spends() {
        let parent = make_tx(&[OutPoint::new(Hash256([3; 32]), 0)], 1);
        let child = make_tx(&[OutPoint::new(parent.txid(), 0)], 1);
        let mut filter = BloomFilter::new(10, 0.0001, 0, BLOOM_UPDATE_ALL);
        filter.insert_hash(&parent.outputs[0].pubkey_hash);
        assert!(filter.is_relevant_and_update(&parent));
        assert!(filter.is_relevant_and_update(&child));
    }

    /// Unrelated transactions do not match an empty filter.
    #[test]
    fn empty_bloom_matches_nothing() {
        let tx = make_tx(&[OutPoint::new(Hash256([4; 32]), 1)], 2);
        let mut filter = BloomFilter::new(10, 0.0001, 0, BLOOM_UPDATE_NONE);
        assert!(!filter.is_relevant_and_update(&tx));
    }
}
