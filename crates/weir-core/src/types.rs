//! Core protocol types: transactions, headers, blocks and chain-index entries.
//!
//! All numeric fields use u64 per protocol convention. Chain-index entries are
//! plain values; peers refer to them by hash and resolve them through
//! [`ChainIndex`](crate::traits::ChainIndex).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes (double SHA-256)
/// and merkle roots (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The first eight bytes read as a little-endian integer.
    pub fn low_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u64,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u64) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }

    /// Canonical byte form, used as bloom-filter key material.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(self.txid.as_bytes());
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking signature bytes. Empty for coinbase inputs.
    pub signature: Vec<u8>,
    /// Public key bytes. Empty for coinbase inputs.
    pub public_key: Vec<u8>,
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Hash of the recipient's public key.
    pub pubkey_hash: Hash256,
}

/// A transaction transferring value between outputs.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u64,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID.
    ///
    /// BLAKE3 over an explicit little-endian field layout, with every
    /// variable-length field prefixed by its length.
    pub fn txid(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(&input.previous_output.to_bytes());
            hasher.update(&(input.signature.len() as u64).to_le_bytes());
            hasher.update(&input.signature);
            hasher.update(&(input.public_key.len() as u64).to_le_bytes());
            hasher.update(&input.public_key);
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.value.to_le_bytes());
            hasher.update(output.pubkey_hash.as_bytes());
        }
        hasher.update(&self.lock_time.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Serialized size in bytes under the wire encoding.
    pub fn serialized_size(&self) -> usize {
        bincode::encode_to_vec(self, bincode::config::standard()).map_or(usize::MAX, |v| v.len())
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u64,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Difficulty target. Lower is harder.
    pub difficulty_target: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    const HASH_SIZE: usize = 4 * 8 + 2 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Uses an explicit fixed byte layout: version || prev_hash || merkle_root ||
    /// timestamp || difficulty_target || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Work contributed by a block with this header. Always at least 1.
    pub fn work(&self) -> u128 {
        u128::from(u64::MAX / self.difficulty_target.max(1)).max(1)
    }

    /// A header with no content, used as a sentinel by compact-block decoding.
    pub fn is_null(&self) -> bool {
        self.difficulty_target == 0
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// BLAKE3 over the concatenated txids of the block's transactions.
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(self.transactions.iter().map(Transaction::txid))
    }
}

/// Commitment over an ordered list of txids.
pub fn merkle_root(txids: impl IntoIterator<Item = Hash256>) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    for txid in txids {
        hasher.update(txid.as_bytes());
    }
    Hash256(hasher.finalize().into())
}

/// How far validation of an indexed block has progressed.
///
/// Ordered: every level implies the ones before it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BlockValidity {
    #[default]
    Unknown,
    /// Header parsed, proof-of-work and timestamp checked.
    Header,
    /// All ancestors are at least `Header` and the header connects.
    Tree,
    /// Transaction data received and context-free checks passed.
    Transactions,
    /// Outputs do not overspend and the block connects to a fully valid parent.
    Chain,
    /// Scripts verified.
    Scripts,
}

/// Status flags of a chain-index entry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub validity: BlockValidity,
    /// The full block is stored locally.
    pub have_data: bool,
    /// The block or one of its ancestors failed validation.
    pub failed: bool,
}

/// An entry of the external chain index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexEntry {
    /// Hash of the header.
    pub hash: Hash256,
    /// The header itself.
    pub header: BlockHeader,
    /// Height above genesis.
    pub height: u64,
    /// Cumulative work of the chain ending at this block.
    pub chain_work: u128,
    pub status: BlockStatus,
}

impl BlockIndexEntry {
    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    /// Header timestamp in seconds.
    pub fn time(&self) -> u64 {
        self.header.timestamp
    }

    pub fn have_data(&self) -> bool {
        self.status.have_data
    }

    /// Whether the entry reached `level` and is not marked failed.
    pub fn is_valid(&self, level: BlockValidity) -> bool {
        !self.status.failed && self.status.validity >= level
    }
}

/// One spender committed to by a double-spend proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Spender {
    pub tx_version: u64,
    pub lock_time: u64,
    /// Hash committing to the spender's outputs.
    pub outputs_hash: Hash256,
    pub signature: Vec<u8>,
}

/// Proof that two different transactions spend the same output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct DoubleSpendProof {
    pub outpoint: OutPoint,
    pub first: Spender,
    pub second: Spender,
}

impl DoubleSpendProof {
    pub fn id(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.outpoint.to_bytes());
        for s in [&self.first, &self.second] {
            hasher.update(&s.tx_version.to_le_bytes());
            hasher.update(&s.lock_time.to_le_bytes());
            hasher.update(s.outputs_hash.as_bytes());
            hasher.update(&(s.signature.len() as u64).to_le_bytes());
            hasher.update(&s.signature);
        }
        Hash256(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn sample_tx(lock_time: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([7; 32]), 0),
                signature: vec![1; 64],
                public_key: vec![2; 32],
            }],
            outputs: vec![TxOutput {
                value: 50,
                pubkey_hash: Hash256([0xAA; 32]),
            }],
            lock_time,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256([3; 32]),
            timestamp: 1_700_000_000,
            difficulty_target: u64::MAX,
            nonce: 0,
        }
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Changing any field of a transaction changes its txid.
    #[test]
    fn txid_commits_to_fields() {
        let a = sample_tx(0);
        let b = sample_tx(1);
        assert_ne!(a.txid(), b.txid());
        assert_eq!(a.txid(), a.clone().txid());
    }

    /// The null outpoint round-trips through is_null.
    #[test]
    fn null_outpoint() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Hash256::ZERO, 0).is_null());
    }

    /// Header hashes differ when the nonce differs.
    #[test]
    fn header_hash_depends_on_nonce() {
        let h1 = sample_header();
        let mut h2 = sample_header();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    /// The easiest target still contributes positive work.
    #[test]
    fn work_is_positive() {
        let h = sample_header();
        assert_eq!(h.work(), 1);
        let mut harder = sample_header();
        harder.difficulty_target = u64::MAX / 4;
        assert_eq!(harder.work(), 4);
    }

    /// Validity levels are ordered and `failed` masks them.
    #[test]
    fn validity_ordering() {
        assert!(BlockValidity::Scripts > BlockValidity::Chain);
        assert!(BlockValidity::Tree > BlockValidity::Header);
        let mut entry = BlockIndexEntry {
            hash: Hash256::ZERO,
            header: sample_header(),
            height: 0,
            chain_work: 1,
            status: BlockStatus {
                validity: BlockValidity::Chain,
                have_data: true,
                failed: false,
            },
        };
        assert!(entry.is_valid(BlockValidity::Tree));
        assert!(!entry.is_valid(BlockValidity::Scripts));
        entry.status.failed = true;
        assert!(!entry.is_valid(BlockValidity::Header));
    }

    /// Display renders the full hex string.
    #[test]
    fn hash_display_is_hex() {
        let h = Hash256([0xAB; 32]);
        assert_eq!(h.to_string(), "ab".repeat(32));
        assert_eq!(h.low_u64(), u64::from_le_bytes([0xAB; 8]));
    }
}
