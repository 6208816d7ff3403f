//! In-memory reference implementation of the collaborator traits.
//!
//! [`MemoryChain`] plays the validation engine: it keeps a block index, an
//! active chain, a coins set and a small mempool, all behind one `RwLock`.
//! It performs only the structural checks the sync engine depends on
//! (connectivity, timestamps, merkle commitment, double spends) and lets
//! tests mark individual blocks or transactions invalid. [`MockClock`] is a
//! settable [`Clock`].

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::constants::NetworkType;
use crate::error::{ChainError, TxAcceptError};
use crate::traits::{BlockProcessor, ChainIndex, Clock, TxMempool, TxMempoolInfo};
use crate::types::{
    Block, BlockHeader, BlockIndexEntry, BlockStatus, BlockValidity, DoubleSpendProof, Hash256,
    OutPoint, Transaction, TxInput, TxOutput,
};
use crate::validation::{
    DsProofOutcome, HeaderRejectKind, HeaderRejection, REJECT_ALREADY_KNOWN, REJECT_CONFLICT,
    REJECT_INSUFFICIENTFEE, REJECT_INTERNAL, REJECT_INVALID, Rejection,
};

/// Headers further than this in the future are refused as `TimeTooNew`.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;
/// Fee rate assigned to transactions without an explicit one.
pub const DEFAULT_FEE_PER_KB: u64 = 2000;
/// Minimum relay fee rate of a fresh pool.
pub const DEFAULT_MIN_FEE_PER_KB: u64 = 1000;
/// A tip older than this means initial block download.
pub const DEFAULT_MAX_TIP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A [`Clock`] whose time only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<Duration>,
}

impl MockClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at a whole number of seconds since the epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

struct PoolEntry {
    tx: Transaction,
    time: Duration,
    fee_per_kb: u64,
    size: usize,
    seq: u64,
}

struct Inner {
    index: HashMap<Hash256, BlockIndexEntry>,
    active: Vec<Hash256>,
    best_header: Hash256,
    blocks: HashMap<Hash256, Block>,
    coins: HashSet<OutPoint>,
    /// Outpoints funded outside the chain, kept across coin rebuilds.
    funded: HashSet<OutPoint>,
    pool: HashMap<Hash256, PoolEntry>,
    pool_spends: HashMap<OutPoint, Hash256>,
    next_seq: u64,
    tx_rejections: HashMap<Hash256, Rejection>,
    invalid_blocks: HashSet<Hash256>,
    fee_rates: HashMap<Hash256, u64>,
    dsproofs: HashMap<Hash256, DoubleSpendProof>,
    orphan_dsproofs: HashMap<Hash256, DoubleSpendProof>,
    ibd_override: Option<bool>,
    min_chain_work: u128,
    min_fee_per_kb: u64,
}

/// In-memory chain index, block store, coins view and mempool.
pub struct MemoryChain {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
    spacing: Duration,
    max_tip_age: Duration,
}

/// Coinbase paying to a tag derived from `seed`, unique per seed.
pub fn make_coinbase(seed: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: seed.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            value: 50,
            pubkey_hash: Hash256([seed as u8; 32]),
        }],
        lock_time: seed,
    }
}

/// Transaction spending `inputs` into `outputs` outputs of equal value.
pub fn make_tx(inputs: &[OutPoint], outputs: usize) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|op| TxInput {
                previous_output: *op,
                signature: vec![0; 64],
                public_key: vec![0; 32],
            })
            .collect(),
        outputs: (0..outputs)
            .map(|i| TxOutput {
                value: 10,
                pubkey_hash: Hash256([i as u8; 32]),
            })
            .collect(),
        lock_time: 0,
    }
}

/// Block on `prev` with a coinbase plus `txs` and a correct merkle root.
pub fn make_block(prev: Hash256, timestamp: u64, txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![make_coinbase(prev.low_u64() ^ timestamp)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: Hash256::ZERO,
            timestamp,
            difficulty_target: u64::MAX,
            nonce: 0,
        },
        transactions,
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// `count` coinbase-only blocks extending `prev`, one `spacing_secs` apart.
pub fn make_chain(prev: Hash256, count: usize, start_time: u64, spacing_secs: u64) -> Vec<Block> {
    let mut out = Vec::with_capacity(count);
    let mut prev = prev;
    for i in 0..count {
        let block = make_block(prev, start_time + i as u64 * spacing_secs, Vec::new());
        prev = block.hash();
        out.push(block);
    }
    out
}

fn header_reject(kind: HeaderRejectKind, reason: &str, severity: i32, hash: Hash256) -> HeaderRejection {
    HeaderRejection {
        kind,
        reason: reason.to_string(),
        severity,
        first_invalid: Some(hash),
    }
}

impl MemoryChain {
    /// Chain with a genesis block stamped at the clock's current time.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_secs();
        Self::with_genesis(clock, now)
    }

    pub fn with_genesis(clock: Arc<dyn Clock>, genesis_time: u64) -> Self {
        let genesis = make_block(Hash256::ZERO, genesis_time, Vec::new());
        let hash = genesis.hash();
        let entry = BlockIndexEntry {
            hash,
            header: genesis.header.clone(),
            height: 0,
            chain_work: genesis.header.work(),
            status: BlockStatus {
                validity: BlockValidity::Scripts,
                have_data: true,
                failed: false,
            },
        };
        let mut inner = Inner {
            index: HashMap::from([(hash, entry)]),
            active: vec![hash],
            best_header: hash,
            blocks: HashMap::from([(hash, genesis)]),
            coins: HashSet::new(),
            funded: HashSet::new(),
            pool: HashMap::new(),
            pool_spends: HashMap::new(),
            next_seq: 0,
            tx_rejections: HashMap::new(),
            invalid_blocks: HashSet::new(),
            fee_rates: HashMap::new(),
            dsproofs: HashMap::new(),
            orphan_dsproofs: HashMap::new(),
            ibd_override: None,
            min_chain_work: 0,
            min_fee_per_kb: DEFAULT_MIN_FEE_PER_KB,
        };
        Self::rebuild_coins(&mut inner);
        Self {
            inner: RwLock::new(inner),
            clock,
            spacing: Duration::from_secs(NetworkType::Mainnet.target_spacing_secs()),
            max_tip_age: DEFAULT_MAX_TIP_AGE,
        }
    }

    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.inner.read().active[0]
    }

    pub fn height(&self) -> u64 {
        self.inner.read().active.len() as u64 - 1
    }

    /// Build a block on the current tip, process it and return it.
    pub fn mine_block(&self, txs: Vec<Transaction>) -> Block {
        let tip = self.active_tip();
        let timestamp = (tip.time() + 1).max(self.clock.now_secs());
        let block = make_block(tip.hash, timestamp, txs);
        // Blocks built here are always structurally valid.
        let _ = self.process_new_block(&block, true);
        block
    }

    /// Force (or clear, with `None`) the initial-block-download answer.
    pub fn set_initial_block_download(&self, ibd: Option<bool>) {
        self.inner.write().ibd_override = ibd;
    }

    pub fn set_min_chain_work(&self, work: u128) {
        self.inner.write().min_chain_work = work;
    }

    pub fn set_min_fee_per_kb(&self, fee: u64) {
        self.inner.write().min_fee_per_kb = fee;
    }

    /// Make admission of `txid` fail with `rejection` once its inputs resolve.
    pub fn reject_tx(&self, txid: Hash256, rejection: Rejection) {
        self.inner.write().tx_rejections.insert(txid, rejection);
    }

    /// Make `hash` fail validation when its data arrives.
    pub fn reject_block(&self, hash: Hash256) {
        self.inner.write().invalid_blocks.insert(hash);
    }

    /// Mark an indexed entry failed, as if validation had rejected it.
    pub fn mark_failed(&self, hash: &Hash256) {
        if let Some(e) = self.inner.write().index.get_mut(hash) {
            e.status.failed = true;
        }
    }

    pub fn set_fee_rate(&self, txid: Hash256, fee_per_kb: u64) {
        self.inner.write().fee_rates.insert(txid, fee_per_kb);
    }

    /// Add an outpoint to the coins view without a funding block.
    pub fn fund(&self, outpoint: OutPoint) {
        let mut inner = self.inner.write();
        inner.funded.insert(outpoint);
        inner.coins.insert(outpoint);
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.read().pool.len()
    }

    fn accept_header(
        &self,
        inner: &mut Inner,
        header: &BlockHeader,
    ) -> Result<BlockIndexEntry, HeaderRejection> {
        let hash = header.hash();
        if let Some(existing) = inner.index.get(&hash) {
            if existing.status.failed {
                return Err(header_reject(HeaderRejectKind::CachedInvalid, "duplicate", 0, hash));
            }
            return Ok(existing.clone());
        }
        let Some(parent) = inner.index.get(&header.prev_hash).cloned() else {
            return Err(header_reject(HeaderRejectKind::Invalid, "prev-blk-not-found", 10, hash));
        };
        if parent.status.failed {
            return Err(header_reject(HeaderRejectKind::Invalid, "bad-prevblk", 100, hash));
        }
        if header.is_null() {
            return Err(header_reject(HeaderRejectKind::Invalid, "high-hash", 50, hash));
        }
        if header.timestamp > self.clock.now_secs() + MAX_FUTURE_BLOCK_TIME {
            return Err(header_reject(HeaderRejectKind::TimeTooNew, "time-too-new", 0, hash));
        }
        let entry = BlockIndexEntry {
            hash,
            header: header.clone(),
            height: parent.height + 1,
            chain_work: parent.chain_work + header.work(),
            status: BlockStatus {
                validity: BlockValidity::Tree,
                have_data: false,
                failed: false,
            },
        };
        let best_work = inner
            .index
            .get(&inner.best_header)
            .map_or(0, |e| e.chain_work);
        if entry.chain_work > best_work {
            inner.best_header = hash;
        }
        inner.index.insert(hash, entry.clone());
        Ok(entry)
    }

    fn rebuild_coins(inner: &mut Inner) {
        let mut coins = inner.funded.clone();
        for hash in &inner.active {
            let Some(block) = inner.blocks.get(hash) else { continue };
            for tx in &block.transactions {
                for input in &tx.inputs {
                    coins.remove(&input.previous_output);
                }
                let txid = tx.txid();
                for i in 0..tx.outputs.len() {
                    coins.insert(OutPoint::new(txid, i as u64));
                }
            }
        }
        inner.coins = coins;
    }

    /// Every block between `entry` and the active chain is stored and not failed.
    fn fully_available(inner: &Inner, entry: &BlockIndexEntry) -> bool {
        let mut walk = entry.clone();
        loop {
            if inner.active.get(walk.height as usize) == Some(&walk.hash) {
                return true;
            }
            if walk.status.failed || !walk.status.have_data {
                return false;
            }
            match inner.index.get(&walk.prev_hash()) {
                Some(prev) => walk = prev.clone(),
                None => return false,
            }
        }
    }

    fn activate_best_chain(inner: &mut Inner) {
        loop {
            let tip_work = inner
                .active
                .last()
                .and_then(|h| inner.index.get(h))
                .map_or(0, |e| e.chain_work);
            let view: &Inner = inner;
            let best = view
                .index
                .values()
                .filter(|e| !e.status.failed && e.status.have_data && e.chain_work > tip_work)
                .filter(|e| Self::fully_available(view, e))
                .max_by_key(|e| e.chain_work)
                .cloned();
            let Some(best) = best else { break };

            let mut path = Vec::new();
            let mut walk = best;
            while inner.active.get(walk.height as usize) != Some(&walk.hash) {
                path.push(walk.hash);
                let Some(prev) = inner.index.get(&walk.prev_hash()).cloned() else { return };
                walk = prev;
            }
            inner.active.truncate(walk.height as usize + 1);
            for hash in path.into_iter().rev() {
                if let Some(e) = inner.index.get_mut(&hash) {
                    e.status.validity = BlockValidity::Scripts;
                }
                inner.active.push(hash);
            }
            Self::rebuild_coins(inner);
            Self::purge_confirmed(inner);
        }
    }

    fn purge_confirmed(inner: &mut Inner) {
        let confirmed: HashSet<Hash256> = inner
            .active
            .iter()
            .filter_map(|h| inner.blocks.get(h))
            .flat_map(|b| b.transactions.iter().map(Transaction::txid))
            .collect();
        let spent: HashSet<OutPoint> = inner
            .active
            .iter()
            .filter_map(|h| inner.blocks.get(h))
            .flat_map(|b| b.transactions.iter())
            .flat_map(|tx| tx.inputs.iter().map(|i| i.previous_output))
            .filter(|op| !op.is_null())
            .collect();
        inner.pool.retain(|txid, e| {
            !confirmed.contains(txid)
                && !e.tx.inputs.iter().any(|i| spent.contains(&i.previous_output))
        });
        let mut spends = HashMap::new();
        for (txid, e) in &inner.pool {
            for input in &e.tx.inputs {
                spends.insert(input.previous_output, *txid);
            }
        }
        inner.pool_spends = spends;
    }

    fn ancestor_count(inner: &Inner, txid: &Hash256) -> usize {
        let mut seen = HashSet::new();
        let mut stack = vec![*txid];
        while let Some(t) = stack.pop() {
            let Some(entry) = inner.pool.get(&t) else { continue };
            for input in &entry.tx.inputs {
                let parent = input.previous_output.txid;
                if inner.pool.contains_key(&parent) && seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        seen.len()
    }

    fn info_of(txid: &Hash256, e: &PoolEntry) -> TxMempoolInfo {
        TxMempoolInfo {
            tx: e.tx.clone(),
            txid: *txid,
            time: e.time,
            fee_per_kb: e.fee_per_kb,
            size: e.size,
        }
    }
}

impl ChainIndex for MemoryChain {
    fn lookup(&self, hash: &Hash256) -> Option<BlockIndexEntry> {
        self.inner.read().index.get(hash).cloned()
    }

    fn active_tip(&self) -> BlockIndexEntry {
        let inner = self.inner.read();
        let tip = inner.active[inner.active.len() - 1];
        inner.index[&tip].clone()
    }

    fn active_at(&self, height: u64) -> Option<BlockIndexEntry> {
        let inner = self.inner.read();
        inner
            .active
            .get(height as usize)
            .and_then(|h| inner.index.get(h))
            .cloned()
    }

    fn best_header(&self) -> BlockIndexEntry {
        let inner = self.inner.read();
        inner.index[&inner.best_header].clone()
    }

    fn is_initial_block_download(&self) -> bool {
        let (ibd_override, min_work) = {
            let inner = self.inner.read();
            (inner.ibd_override, inner.min_chain_work)
        };
        if let Some(ibd) = ibd_override {
            return ibd;
        }
        let tip = self.active_tip();
        tip.chain_work < min_work
            || tip.time() + self.max_tip_age.as_secs() < self.clock.now_secs()
    }

    fn min_chain_work(&self) -> u128 {
        self.inner.read().min_chain_work
    }

    fn read_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        let inner = self.inner.read();
        if !inner.index.contains_key(hash) {
            return Err(ChainError::BlockNotFound(hash.to_string()));
        }
        inner
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| ChainError::DataMissing(hash.to_string()))
    }

    fn coins_exist(&self, outpoint: &OutPoint) -> bool {
        self.inner.read().coins.contains(outpoint)
    }

    fn target_spacing(&self) -> Duration {
        self.spacing
    }
}

impl BlockProcessor for MemoryChain {
    fn process_new_headers(&self, headers: &[BlockHeader]) -> Result<BlockIndexEntry, HeaderRejection> {
        let mut inner = self.inner.write();
        let mut last = None;
        for header in headers {
            last = Some(self.accept_header(&mut inner, header)?);
        }
        last.ok_or_else(|| HeaderRejection {
            kind: HeaderRejectKind::Invalid,
            reason: "empty-headers".to_string(),
            severity: 0,
            first_invalid: None,
        })
    }

    fn process_new_block(&self, block: &Block, _force: bool) -> Result<bool, Rejection> {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let entry = self
            .accept_header(&mut inner, &block.header)
            .map_err(|r| Rejection::new(REJECT_INVALID, r.reason, r.severity))?;
        if entry.status.have_data {
            return Ok(false);
        }
        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(Rejection::new(REJECT_INVALID, "bad-txnmrklroot", 100).corrupted());
        }
        if inner.invalid_blocks.contains(&hash) {
            if let Some(e) = inner.index.get_mut(&hash) {
                e.status.failed = true;
            }
            return Err(Rejection::new(REJECT_INVALID, "bad-blk", 100));
        }
        inner.blocks.insert(hash, block.clone());
        if let Some(e) = inner.index.get_mut(&hash) {
            e.status.have_data = true;
            e.status.validity = e.status.validity.max(BlockValidity::Transactions);
        }
        Self::activate_best_chain(&mut inner);
        Ok(true)
    }
}

impl TxMempool for MemoryChain {
    fn accept(
        &self,
        tx: &Transaction,
        bypass_limits: bool,
        absurd_fee: Option<u64>,
    ) -> Result<(), TxAcceptError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let txid = tx.txid();
        if inner.pool.contains_key(&txid) {
            return Err(TxAcceptError::Rejected(Rejection::new(
                REJECT_ALREADY_KNOWN,
                "txn-already-in-mempool",
                0,
            )));
        }
        if tx.is_coinbase() || tx.inputs.is_empty() {
            return Err(TxAcceptError::Rejected(Rejection::new(REJECT_INVALID, "bad-txns-coinbase", 100)));
        }
        let mut missing = false;
        for input in &tx.inputs {
            let op = input.previous_output;
            if inner.pool_spends.contains_key(&op) {
                return Err(TxAcceptError::Rejected(Rejection::new(
                    REJECT_CONFLICT,
                    "txn-mempool-conflict",
                    0,
                )));
            }
            let in_pool = inner
                .pool
                .get(&op.txid)
                .is_some_and(|e| (op.index as usize) < e.tx.outputs.len());
            if !in_pool && !inner.coins.contains(&op) {
                missing = true;
            }
        }
        if missing {
            return Err(TxAcceptError::MissingInputs);
        }
        if let Some(rejection) = inner.tx_rejections.get(&txid) {
            return Err(TxAcceptError::Rejected(rejection.clone()));
        }
        let fee_per_kb = inner.fee_rates.get(&txid).copied().unwrap_or(DEFAULT_FEE_PER_KB);
        if absurd_fee.is_some_and(|max| fee_per_kb > max) {
            return Err(TxAcceptError::Rejected(Rejection::new(REJECT_INTERNAL, "absurdly-high-fee", 0)));
        }
        if !bypass_limits && fee_per_kb < inner.min_fee_per_kb {
            return Err(TxAcceptError::Rejected(Rejection::new(
                REJECT_INSUFFICIENTFEE,
                "mempool min fee not met",
                0,
            )));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        for input in &tx.inputs {
            inner.pool_spends.insert(input.previous_output, txid);
        }
        inner.pool.insert(
            txid,
            PoolEntry {
                tx: tx.clone(),
                time: now,
                fee_per_kb,
                size: tx.serialized_size(),
                seq,
            },
        );
        Ok(())
    }

    fn exists(&self, txid: &Hash256) -> bool {
        self.inner.read().pool.contains_key(txid)
    }

    fn get(&self, txid: &Hash256) -> Option<Transaction> {
        self.inner.read().pool.get(txid).map(|e| e.tx.clone())
    }

    fn info(&self, txid: &Hash256) -> Option<TxMempoolInfo> {
        self.inner.read().pool.get(txid).map(|e| Self::info_of(txid, e))
    }

    fn info_all(&self) -> Vec<TxMempoolInfo> {
        let inner = self.inner.read();
        let mut all: Vec<_> = inner.pool.iter().collect();
        all.sort_by_key(|(_, e)| e.seq);
        all.into_iter().map(|(t, e)| Self::info_of(t, e)).collect()
    }

    fn compare_depth_and_score(&self, a: &Hash256, b: &Hash256) -> Ordering {
        let inner = self.inner.read();
        match (inner.pool.get(a), inner.pool.get(b)) {
            (Some(ea), Some(eb)) => Self::ancestor_count(&inner, a)
                .cmp(&Self::ancestor_count(&inner, b))
                .then(ea.seq.cmp(&eb.seq)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    fn min_fee_per_kb(&self) -> u64 {
        self.inner.read().min_fee_per_kb
    }

    fn add_dsproof(&self, proof: &DoubleSpendProof) -> DsProofOutcome {
        if proof.first == proof.second {
            return DsProofOutcome::Invalid;
        }
        let id = proof.id();
        let mut inner = self.inner.write();
        if inner.pool_spends.contains_key(&proof.outpoint) {
            inner.orphan_dsproofs.remove(&id);
            inner.dsproofs.insert(id, proof.clone());
            DsProofOutcome::Valid
        } else {
            inner.orphan_dsproofs.insert(id, proof.clone());
            DsProofOutcome::MissingTransaction
        }
    }

    fn dsproof_exists(&self, id: &Hash256) -> bool {
        let inner = self.inner.read();
        inner.dsproofs.contains_key(id) || inner.orphan_dsproofs.contains_key(id)
    }

    fn dsproof_get(&self, id: &Hash256) -> Option<DoubleSpendProof> {
        self.inner.read().dsproofs.get(id).cloned()
    }
}
