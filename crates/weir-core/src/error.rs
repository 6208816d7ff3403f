//! Error types for the Weir sync engine.
use thiserror::Error;

use crate::validation::Rejection;

/// Failures while framing or parsing a wire message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic bytes")] BadMagic,
    #[error("message too large: {size} > {max}")] Oversized { size: usize, max: usize },
    #[error("truncated message")] Truncated,
    #[error("malformed {command} payload: {reason}")] Malformed { command: String, reason: String },
    #[error("encode error: {0}")] Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("block data missing: {0}")] DataMissing(String),
}

/// Outcome of a failed mempool admission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxAcceptError {
    #[error("missing inputs")] MissingInputs,
    #[error("rejected: {0}")] Rejected(Rejection),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")] Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum WeirError {
    #[error(transparent)] Wire(#[from] WireError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("unknown peer: {0}")] UnknownPeer(u64),
    #[error("service stopped")] ServiceStopped,
}
