//! Trait interfaces for the collaborators of the sync engine.
//!
//! - [`ChainIndex`]: read-only view of the validation engine's block index
//! - [`BlockProcessor`]: header and block acceptance
//! - [`TxMempool`]: transaction pool queries and admission
//! - [`Clock`]: wall-clock source, mockable in tests
//!
//! The sync engine never mutates the chain index directly. Implementations
//! must not call back into the peer manager from inside these methods.

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ChainError, TxAcceptError};
use crate::types::{Block, BlockHeader, BlockIndexEntry, DoubleSpendProof, Hash256, OutPoint, Transaction};
use crate::validation::{DsProofOutcome, HeaderRejection, Rejection};

/// Source of the current time, as a duration since the UNIX epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Current time in whole seconds.
    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

/// [`Clock`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

/// Read-only view of the block index owned by the validation engine.
///
/// Entries are returned by value; callers keep hashes, not references, and
/// resolve them again when needed.
pub trait ChainIndex: Send + Sync {
    /// Look up an index entry by block hash.
    fn lookup(&self, hash: &Hash256) -> Option<BlockIndexEntry>;

    /// Tip of the active chain.
    fn active_tip(&self) -> BlockIndexEntry;

    /// Active-chain entry at `height`, or `None` above the tip.
    fn active_at(&self, height: u64) -> Option<BlockIndexEntry>;

    /// Header with the most work we know of, valid or not yet validated.
    fn best_header(&self) -> BlockIndexEntry;

    /// Whether the node is still catching up with the network.
    fn is_initial_block_download(&self) -> bool;

    /// Minimum cumulative work a chain must have before we download it.
    fn min_chain_work(&self) -> u128;

    /// Read a stored block.
    fn read_block(&self, hash: &Hash256) -> Result<Block, ChainError>;

    /// Whether the unspent output exists in the coins view.
    fn coins_exist(&self, outpoint: &OutPoint) -> bool;

    /// Expected time between blocks.
    fn target_spacing(&self) -> Duration;

    /// Whether `entry` is part of the active chain.
    fn contains(&self, entry: &BlockIndexEntry) -> bool {
        self.active_at(entry.height)
            .is_some_and(|e| e.hash == entry.hash)
    }

    /// Successor of `entry` in the active chain.
    fn next_in_active(&self, entry: &BlockIndexEntry) -> Option<BlockIndexEntry> {
        if self.contains(entry) {
            self.active_at(entry.height + 1)
        } else {
            None
        }
    }

    /// Ancestor of `entry` at `height`.
    fn ancestor(&self, entry: &BlockIndexEntry, height: u64) -> Option<BlockIndexEntry> {
        if height > entry.height {
            return None;
        }
        if self.contains(entry) {
            return self.active_at(height);
        }
        let mut walk = entry.clone();
        while walk.height > height {
            walk = self.lookup(&walk.prev_hash())?;
        }
        Some(walk)
    }

    /// Deepest common ancestor of two entries.
    fn last_common_ancestor(
        &self,
        a: &BlockIndexEntry,
        b: &BlockIndexEntry,
    ) -> Option<BlockIndexEntry> {
        let height = a.height.min(b.height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a.hash != b.hash {
            if a.height == 0 {
                return None;
            }
            a = self.lookup(&a.prev_hash())?;
            b = self.lookup(&b.prev_hash())?;
        }
        Some(a)
    }

    /// First locator hash that is on the active chain, or genesis.
    fn find_fork(&self, locator: &[Hash256]) -> Option<BlockIndexEntry> {
        for hash in locator {
            if let Some(entry) = self.lookup(hash) {
                if self.contains(&entry) {
                    return Some(entry);
                }
            }
        }
        self.active_at(0)
    }

    /// Block locator starting at `entry`: dense for the first ten hashes,
    /// then exponentially sparser, always ending at genesis.
    fn locator(&self, entry: &BlockIndexEntry) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1u64;
        let mut walk = Some(entry.clone());
        while let Some(current) = walk {
            hashes.push(current.hash);
            if current.height == 0 {
                break;
            }
            let next_height = current.height.saturating_sub(step);
            walk = self.ancestor(&current, next_height);
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }
}

/// Header and block acceptance, provided by the validation engine.
pub trait BlockProcessor: Send + Sync {
    /// Validate and index a batch of headers. Returns the entry of the last
    /// header on success.
    fn process_new_headers(&self, headers: &[BlockHeader]) -> Result<BlockIndexEntry, HeaderRejection>;

    /// Validate, store and possibly connect a block. `force` processes it even
    /// if it was not requested. Returns whether the block was new to us.
    fn process_new_block(&self, block: &Block, force: bool) -> Result<bool, Rejection>;
}

/// Snapshot of one mempool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMempoolInfo {
    pub tx: Transaction,
    pub txid: Hash256,
    /// When the transaction entered the pool.
    pub time: Duration,
    /// Fee rate in base units per 1000 bytes.
    pub fee_per_kb: u64,
    pub size: usize,
}

/// Transaction pool, provided by the validation engine.
pub trait TxMempool: Send + Sync {
    /// Try to admit a transaction.
    fn accept(
        &self,
        tx: &Transaction,
        bypass_limits: bool,
        absurd_fee: Option<u64>,
    ) -> Result<(), TxAcceptError>;

    fn exists(&self, txid: &Hash256) -> bool;

    fn get(&self, txid: &Hash256) -> Option<Transaction>;

    fn info(&self, txid: &Hash256) -> Option<TxMempoolInfo>;

    fn info_all(&self) -> Vec<TxMempoolInfo>;

    /// Relay order: parents before children, then by score.
    fn compare_depth_and_score(&self, a: &Hash256, b: &Hash256) -> Ordering;

    /// Current minimum fee rate for admission, per 1000 bytes.
    fn min_fee_per_kb(&self) -> u64;

    /// Validate and store a double-spend proof.
    fn add_dsproof(&self, proof: &DoubleSpendProof) -> DsProofOutcome;

    fn dsproof_exists(&self, id: &Hash256) -> bool;

    fn dsproof_get(&self, id: &Hash256) -> Option<DoubleSpendProof>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockStatus, BlockValidity};
    use proptest::prelude::*;
    use std::collections::HashMap;

    // ------------------------------------------------------------------
    // Mock: ChainIndex over a single linear chain plus side branches
    // ------------------------------------------------------------------

    struct MockIndex {
        entries: HashMap<Hash256, BlockIndexEntry>,
        active: Vec<Hash256>,
    }

    fn header(prev: Hash256, nonce: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000 + nonce,
            difficulty_target: u64::MAX,
            nonce,
        }
    }

    impl MockIndex {
        fn linear(len: u64) -> Self {
            let mut idx = MockIndex {
                entries: HashMap::new(),
                active: Vec::new(),
            };
            let mut prev = Hash256::ZERO;
            for h in 0..len {
                let e = idx.insert(prev, h, h);
                idx.active.push(e.hash);
                prev = e.hash;
            }
            idx
        }

        fn insert(&mut self, prev: Hash256, height: u64, nonce: u64) -> BlockIndexEntry {
            let hdr = header(prev, nonce);
            let entry = BlockIndexEntry {
                hash: hdr.hash(),
                header: hdr,
                height,
                chain_work: u128::from(height) + 1,
                status: BlockStatus {
                    validity: BlockValidity::Scripts,
                    have_data: true,
                    failed: false,
                },
            };
            self.entries.insert(entry.hash, entry.clone());
            entry
        }
    }

    impl ChainIndex for MockIndex {
        fn lookup(&self, hash: &Hash256) -> Option<BlockIndexEntry> {
            self.entries.get(hash).cloned()
        }
        fn active_tip(&self) -> BlockIndexEntry {
            self.entries[self.active.last().unwrap()].clone()
        }
        fn active_at(&self, height: u64) -> Option<BlockIndexEntry> {
            self.active
                .get(height as usize)
                .map(|h| self.entries[h].clone())
        }
        fn best_header(&self) -> BlockIndexEntry {
            self.active_tip()
        }
        fn is_initial_block_download(&self) -> bool {
            false
        }
        fn min_chain_work(&self) -> u128 {
            0
        }
        fn read_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
            Err(ChainError::BlockNotFound(hash.to_string()))
        }
        fn coins_exist(&self, _outpoint: &OutPoint) -> bool {
            false
        }
        fn target_spacing(&self) -> Duration {
            Duration::from_secs(600)
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Ancestors resolve both on and off the active chain.
    #[test]
    fn ancestor_walks_side_branch() {
        let mut idx = MockIndex::linear(10);
        let fork = idx.active[5];
        let side1 = idx.insert(fork, 6, 1000);
        let side2 = idx.insert(side1.hash, 7, 1001);
        let anc = idx.ancestor(&side2, 5).unwrap();
        assert_eq!(anc.hash, fork);
        assert!(idx.ancestor(&side2, 8).is_none());
        let tip = idx.active_tip();
        assert_eq!(idx.ancestor(&tip, 3).unwrap().hash, idx.active[3]);
    }

    /// The common ancestor of a side branch and the tip is the fork point.
    #[test]
    fn last_common_ancestor_finds_fork() {
        let mut idx = MockIndex::linear(10);
        let fork = idx.active[4];
        let side = idx.insert(fork, 5, 2000);
        let lca = idx.last_common_ancestor(&side, &idx.active_tip()).unwrap();
        assert_eq!(lca.hash, fork);
    }

    /// Locators start at the entry, end at genesis and thin out exponentially.
    #[test]
    fn locator_shape() {
        let idx = MockIndex::linear(100);
        let loc = idx.locator(&idx.active_tip());
        assert_eq!(loc[0], idx.active[99]);
        assert_eq!(*loc.last().unwrap(), idx.active[0]);
        assert!(loc.len() < 30);
        assert_eq!(loc[1], idx.active[98]);
    }

    /// find_fork picks the first locator entry on the active chain.
    #[test]
    fn find_fork_uses_first_known() {
        let idx = MockIndex::linear(20);
        let unknown = Hash256([9; 32]);
        let fork = idx.find_fork(&[unknown, idx.active[12], idx.active[3]]).unwrap();
        assert_eq!(fork.height, 12);
        let genesis = idx.find_fork(&[unknown]).unwrap();
        assert_eq!(genesis.height, 0);
    }

    /// next_in_active steps along the active chain only.
    #[test]
    fn next_in_active_only_on_chain() {
        let mut idx = MockIndex::linear(5);
        let g = idx.active_at(0).unwrap();
        assert_eq!(idx.next_in_active(&g).unwrap().height, 1);
        let side = idx.insert(idx.active[2], 3, 77);
        assert!(idx.next_in_active(&side).is_none());
    }

    // --- proptest ---

    proptest! {
        /// Any locator is strictly descending, ends at genesis and forks at its own start.
        #[test]
        fn locator_descends_to_genesis(len in 1u64..300, pick in any::<prop::sample::Index>()) {
            let idx = MockIndex::linear(len);
            let start = idx.active_at(pick.index(len as usize) as u64).unwrap();
            let loc = idx.locator(&start);
            prop_assert_eq!(loc[0], start.hash);
            prop_assert_eq!(*loc.last().unwrap(), idx.active[0]);
            let heights: Vec<u64> = loc.iter().map(|h| idx.lookup(h).unwrap().height).collect();
            prop_assert!(heights.windows(2).all(|w| w[0] > w[1]));
            prop_assert_eq!(idx.find_fork(&loc).unwrap().hash, start.hash);
        }

        /// Ancestors on the active chain land on the requested height.
        #[test]
        fn ancestor_has_requested_height(len in 1u64..200, h in 0u64..250) {
            let idx = MockIndex::linear(len);
            let tip = idx.active_tip();
            match idx.ancestor(&tip, h) {
                Some(anc) => {
                    prop_assert_eq!(anc.height, h);
                    prop_assert_eq!(anc.hash, idx.active[h as usize]);
                }
                None => prop_assert!(h > tip.height),
            }
        }
    }
}
