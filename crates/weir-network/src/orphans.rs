//! Pool of transactions whose inputs we have not seen yet.
//!
//! Orphans are indexed by id and by every outpoint they spend, so that a
//! newly accepted parent finds its children without a scan. The pool is
//! bounded by count (random eviction) and by age (batched expiry sweeps).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use weir_core::constants::MAX_STANDARD_TX_SIZE;
use weir_core::types::{Block, Hash256, OutPoint, Transaction};

use crate::peer::NodeId;

/// How long an orphan may wait for its parents.
pub const ORPHAN_TX_EXPIRE_TIME: Duration = Duration::from_secs(20 * 60);
/// Minimum spacing of expiry sweeps.
pub const ORPHAN_TX_EXPIRE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Recently seen transactions kept for compact block reconstruction.
pub const DEFAULT_BLOCK_RECONSTRUCTION_EXTRA_TXN: usize = 100;

#[derive(Debug, Clone)]
struct OrphanEntry {
    tx: Transaction,
    from_peer: NodeId,
    expires: Duration,
}

#[derive(Debug)]
pub struct OrphanPool {
    orphans: BTreeMap<Hash256, OrphanEntry>,
    by_prev: HashMap<OutPoint, BTreeSet<Hash256>>,
    next_sweep: Duration,
    extra_txn: VecDeque<Transaction>,
    max_extra_txn: usize,
    rng: StdRng,
}

impl OrphanPool {
    pub fn new(rng_seed: Option<u64>) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            orphans: BTreeMap::new(),
            by_prev: HashMap::new(),
            next_sweep: Duration::ZERO,
            extra_txn: VecDeque::new(),
            max_extra_txn: DEFAULT_BLOCK_RECONSTRUCTION_EXTRA_TXN,
            rng,
        }
    }

    /// Store an orphan received from `peer`. Returns false if it was already
    /// present or too large to keep.
    pub fn add(&mut self, tx: &Transaction, peer: NodeId, now: Duration) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        // Larger orphans would let a peer fill memory cheaply.
        let size = tx.serialized_size();
        if size > MAX_STANDARD_TX_SIZE {
            debug!(%txid, size, "ignoring large orphan tx");
            return false;
        }
        for input in &tx.inputs {
            self.by_prev.entry(input.previous_output).or_default().insert(txid);
        }
        self.orphans.insert(
            txid,
            OrphanEntry {
                tx: tx.clone(),
                from_peer: peer,
                expires: now + ORPHAN_TX_EXPIRE_TIME,
            },
        );
        self.remember_extra(tx.clone());
        debug!(%txid, peer, pool = self.orphans.len(), "stored orphan tx");
        true
    }

    /// Remove one orphan. Returns whether it was present.
    pub fn erase(&mut self, txid: &Hash256) -> bool {
        let Some(entry) = self.orphans.remove(txid) else {
            return false;
        };
        for input in &entry.tx.inputs {
            let op = input.previous_output;
            if let Some(spenders) = self.by_prev.get_mut(&op) {
                spenders.remove(txid);
                if spenders.is_empty() {
                    self.by_prev.remove(&op);
                }
            }
        }
        true
    }

    /// Drop every orphan that came from `peer`.
    pub fn erase_for_peer(&mut self, peer: NodeId) -> usize {
        let doomed: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, e)| e.from_peer == peer)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &doomed {
            self.erase(txid);
        }
        if !doomed.is_empty() {
            debug!(peer, erased = doomed.len(), "erased orphan txs from peer");
        }
        doomed.len()
    }

    /// Drop orphans included in, or conflicting with, a connected block.
    pub fn erase_for_block(&mut self, block: &Block) -> usize {
        let mut doomed = BTreeSet::new();
        for tx in &block.transactions {
            doomed.insert(tx.txid());
            for input in &tx.inputs {
                if let Some(spenders) = self.by_prev.get(&input.previous_output) {
                    doomed.extend(spenders.iter().copied());
                }
            }
        }
        let erased = doomed.iter().filter(|txid| self.erase(txid)).count();
        if erased > 0 {
            debug!(erased, "erased orphan txs included or conflicted by block");
        }
        erased
    }

    /// Expire old orphans, then evict random ones until at most `max` remain.
    /// Returns the number evicted for size.
    pub fn limit(&mut self, max: usize, now: Duration) -> usize {
        if self.next_sweep <= now {
            let mut min_expiry = now + ORPHAN_TX_EXPIRE_TIME - ORPHAN_TX_EXPIRE_INTERVAL;
            let expired: Vec<Hash256> = self
                .orphans
                .iter()
                .filter_map(|(txid, e)| {
                    if e.expires <= now {
                        Some(*txid)
                    } else {
                        min_expiry = min_expiry.min(e.expires);
                        None
                    }
                })
                .collect();
            // Sweep again once the soonest survivor can have expired.
            self.next_sweep = min_expiry + ORPHAN_TX_EXPIRE_INTERVAL;
            for txid in &expired {
                self.erase(txid);
            }
            if !expired.is_empty() {
                debug!(erased = expired.len(), "erased expired orphan txs");
            }
        }

        let mut evicted = 0;
        while self.orphans.len() > max {
            let probe = Hash256(self.rng.r#gen());
            let victim = self
                .orphans
                .range(probe..)
                .next()
                .or_else(|| self.orphans.iter().next())
                .map(|(txid, _)| *txid);
            let Some(victim) = victim else { break };
            self.erase(&victim);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, "orphan pool overflow, removed random txs");
        }
        evicted
    }

    /// Orphans spending `outpoint`.
    pub fn spenders_of(&self, outpoint: &OutPoint) -> Vec<Hash256> {
        self.by_prev
            .get(outpoint)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The orphan and the peer that sent it.
    pub fn get(&self, txid: &Hash256) -> Option<(&Transaction, NodeId)> {
        self.orphans.get(txid).map(|e| (&e.tx, e.from_peer))
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Keep a transaction around for compact block reconstruction even
    /// though it is not in the mempool.
    pub fn remember_extra(&mut self, tx: Transaction) {
        if self.max_extra_txn == 0 {
            return;
        }
        if self.extra_txn.len() >= self.max_extra_txn {
            self.extra_txn.pop_front();
        }
        self.extra_txn.push_back(tx);
    }

    pub fn extra_transactions(&self) -> Vec<Transaction> {
        self.extra_txn.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::memory::{make_block, make_tx};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn op(n: u8, index: u64) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), index)
    }

    fn pool() -> OrphanPool {
        OrphanPool::new(Some(42))
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Orphans are indexed by every outpoint they spend.
    #[test]
    fn add_indexes_by_prevout() {
        let mut pool = pool();
        let tx = make_tx(&[op(1, 0), op(2, 1)], 1);
        assert!(pool.add(&tx, 7, secs(0)));
        assert!(!pool.add(&tx, 8, secs(0)));
        assert_eq!(pool.spenders_of(&op(1, 0)), vec![tx.txid()]);
        assert_eq!(pool.spenders_of(&op(2, 1)), vec![tx.txid()]);
        assert_eq!(pool.get(&tx.txid()).unwrap().1, 7);
        assert!(pool.erase(&tx.txid()));
        assert!(pool.spenders_of(&op(1, 0)).is_empty());
        assert!(!pool.erase(&tx.txid()));
    }

    /// Oversized transactions are not kept.
    #[test]
    fn rejects_oversized() {
        let mut pool = pool();
        let mut tx = make_tx(&[op(1, 0)], 1);
        tx.inputs[0].signature = vec![0u8; MAX_STANDARD_TX_SIZE + 1];
        assert!(!pool.add(&tx, 1, secs(0)));
        assert!(pool.is_empty());
    }

    /// Only the disconnected peer's orphans go.
    #[test]
    fn erase_for_peer() {
        let mut pool = pool();
        pool.add(&make_tx(&[op(1, 0)], 1), 1, secs(0));
        pool.add(&make_tx(&[op(2, 0)], 1), 2, secs(0));
        pool.add(&make_tx(&[op(3, 0)], 1), 1, secs(0));
        assert_eq!(pool.erase_for_peer(1), 2);
        assert_eq!(pool.len(), 1);
    }

    /// Orphans double-spent by a block are erased.
    #[test]
    fn erase_for_block_conflicts() {
        let mut pool = pool();
        let orphan = make_tx(&[op(1, 0)], 1);
        let other = make_tx(&[op(2, 0)], 1);
        pool.add(&orphan, 1, secs(0));
        pool.add(&other, 1, secs(0));
        let conflicting = make_tx(&[op(1, 0)], 2);
        let block = make_block(Hash256::ZERO, 1, vec![conflicting]);
        assert_eq!(pool.erase_for_block(&block), 1);
        assert!(pool.contains(&other.txid()));
    }

    /// Expired orphans are swept and the pool is capped.
    #[test]
    fn limit_expires_and_caps() {
        let mut pool = pool();
        pool.add(&make_tx(&[op(1, 0)], 1), 1, secs(0));
        for n in 2..10u8 {
            pool.add(&make_tx(&[op(n, 0)], 1), 1, secs(600));
        }
        assert_eq!(pool.limit(100, secs(600) + Duration::from_secs(10)), 0);
        assert_eq!(pool.len(), 9);
        // The first one expires at 1200s; the next sweep is due at 1500s.
        assert_eq!(pool.limit(100, secs(1600)), 0);
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.limit(3, secs(1600)), 5);
        assert_eq!(pool.len(), 3);
    }

    /// The extra-transaction ring keeps only the newest entries.
    #[test]
    fn extra_ring_is_bounded() {
        let mut pool = pool();
        for n in 0..(DEFAULT_BLOCK_RECONSTRUCTION_EXTRA_TXN + 5) {
            pool.remember_extra(make_tx(&[op((n % 250) as u8, n as u64)], 1));
        }
        assert_eq!(pool.extra_transactions().len(), DEFAULT_BLOCK_RECONSTRUCTION_EXTRA_TXN);
    }
}
