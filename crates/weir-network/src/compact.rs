//! Compact block relay.
//!
//! A [`CompactBlock`] carries the header, a per-block nonce, 48-bit short ids
//! for most transactions and a few prefilled transactions. The receiver
//! rebuilds the block from its mempool with a [`PartialBlock`], asking only
//! for the transactions it could not match.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use weir_core::constants::MIN_TRANSACTION_SIZE;
use weir_core::traits::TxMempool;
use weir_core::types::{Block, BlockHeader, Hash256, Transaction};

/// Mask selecting the 48 bits kept from a short-id hash.
const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

/// Transaction sent in full inside a compact block.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PrefilledTx {
    /// Position of the transaction in the block.
    pub index: u32,
    pub tx: Transaction,
}

/// Header plus short transaction ids.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    pub short_ids: Vec<u64>,
    pub prefilled: Vec<PrefilledTx>,
}

/// Outcome of filling a partially downloaded block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    /// The peer sent something structurally wrong.
    Invalid,
    /// Reconstruction failed without anyone being at fault, e.g. a short-id collision.
    Failed,
}

/// `getblocktxn` payload: positions of the transactions we are missing.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockTransactionsRequest {
    pub block_hash: Hash256,
    pub indexes: Vec<u32>,
}

/// `blocktxn` payload: the requested transactions, in request order.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockTransactions {
    pub block_hash: Hash256,
    pub txs: Vec<Transaction>,
}

impl BlockTransactions {
    /// Answer `req` from a full block. `None` if an index is out of range.
    pub fn answer(block: &Block, req: &BlockTransactionsRequest) -> Option<Self> {
        let txs = req
            .indexes
            .iter()
            .map(|&i| block.transactions.get(i as usize).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            block_hash: req.block_hash,
            txs,
        })
    }
}

impl CompactBlock {
    /// Compact form of `block`. Only the coinbase is prefilled.
    pub fn from_block(block: &Block, nonce: u64) -> Self {
        let key = short_id_key(&block.header, nonce);
        let mut prefilled = Vec::new();
        let mut short_ids = Vec::with_capacity(block.transactions.len().saturating_sub(1));
        for (i, tx) in block.transactions.iter().enumerate() {
            if i == 0 {
                prefilled.push(PrefilledTx {
                    index: 0,
                    tx: tx.clone(),
                });
            } else {
                short_ids.push(short_id(&key, &tx.txid()));
            }
        }
        Self {
            header: block.header.clone(),
            nonce,
            short_ids,
            prefilled,
        }
    }

    pub fn block_hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn tx_count(&self) -> usize {
        self.short_ids.len() + self.prefilled.len()
    }

    pub fn short_id(&self, txid: &Hash256) -> u64 {
        short_id(&short_id_key(&self.header, self.nonce), txid)
    }
}

fn short_id_key(header: &BlockHeader, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(header.hash().as_bytes());
    hasher.update(nonce.to_le_bytes());
    hasher.finalize().into()
}

fn short_id(key: &[u8; 32], txid: &Hash256) -> u64 {
    let digest = blake3::keyed_hash(key, txid.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word) & SHORT_ID_MASK
}

/// Block under reconstruction from a compact announcement.
#[derive(Debug, Clone)]
pub struct PartialBlock {
    header: BlockHeader,
    slots: Vec<Option<Transaction>>,
    prefilled_count: usize,
    mempool_count: usize,
}

impl PartialBlock {
    /// Fill what we can from the prefilled set, the mempool and `extra`.
    /// A block claiming more transactions than `max_block_size` could hold
    /// is invalid.
    pub fn init(
        cmpct: &CompactBlock,
        mempool: &dyn TxMempool,
        extra: &[Transaction],
        max_block_size: usize,
    ) -> Result<Self, ReadStatus> {
        if cmpct.header.is_null() || (cmpct.short_ids.is_empty() && cmpct.prefilled.is_empty()) {
            return Err(ReadStatus::Invalid);
        }
        let total = cmpct.tx_count();
        if total > max_block_size / MIN_TRANSACTION_SIZE {
            return Err(ReadStatus::Invalid);
        }
        let mut slots: Vec<Option<Transaction>> = vec![None; total];
        for pre in &cmpct.prefilled {
            let idx = pre.index as usize;
            if idx >= total || slots[idx].is_some() {
                return Err(ReadStatus::Invalid);
            }
            slots[idx] = Some(pre.tx.clone());
        }

        // Short ids fill the slots the prefilled set left open, in order.
        let mut by_short_id: HashMap<u64, usize> = HashMap::with_capacity(cmpct.short_ids.len());
        let mut open = slots.iter().enumerate().filter(|(_, s)| s.is_none()).map(|(i, _)| i);
        for sid in &cmpct.short_ids {
            let Some(idx) = open.next() else {
                return Err(ReadStatus::Invalid);
            };
            if by_short_id.insert(*sid, idx).is_some() {
                return Err(ReadStatus::Failed);
            }
        }

        let key = short_id_key(&cmpct.header, cmpct.nonce);
        let mut collided = vec![false; total];
        let mut mempool_count = 0;
        let candidates = mempool
            .info_all()
            .into_iter()
            .map(|info| info.tx)
            .chain(extra.iter().cloned());
        for tx in candidates {
            let txid = tx.txid();
            let Some(&idx) = by_short_id.get(&short_id(&key, &txid)) else {
                continue;
            };
            if collided[idx] {
                continue;
            }
            match &slots[idx] {
                None => {
                    slots[idx] = Some(tx);
                    mempool_count += 1;
                }
                Some(existing) if existing.txid() != txid => {
                    slots[idx] = None;
                    collided[idx] = true;
                    mempool_count -= 1;
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            header: cmpct.header.clone(),
            slots,
            prefilled_count: cmpct.prefilled.len(),
            mempool_count,
        })
    }

    pub fn is_tx_available(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// Positions still missing, in block order.
    pub fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Transactions matched from local sources rather than prefilled.
    pub fn mempool_count(&self) -> usize {
        self.mempool_count
    }

    pub fn prefilled_count(&self) -> usize {
        self.prefilled_count
    }

    /// Complete the block with `missing`, supplied in block order.
    pub fn fill(&self, missing: Vec<Transaction>) -> Result<Block, ReadStatus> {
        let mut supplied = missing.into_iter();
        let mut transactions = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot {
                Some(tx) => transactions.push(tx.clone()),
                None => transactions.push(supplied.next().ok_or(ReadStatus::Invalid)?),
            }
        }
        if supplied.next().is_some() {
            return Err(ReadStatus::Invalid);
        }
        let block = Block {
            header: self.header.clone(),
            transactions,
        };
        // A wrong transaction here most likely means a short-id collision.
        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(ReadStatus::Failed);
        }
        Ok(block)
    }
}
