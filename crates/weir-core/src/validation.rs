//! Typed validation outcomes reported by the external engine.
//!
//! A rejection carries a reject code, a short reason string and a severity.
//! Severity above zero adds to the sending peer's misbehavior score; zero is
//! informational. Codes at or above [`REJECT_INTERNAL`] are never sent back
//! over the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Hash256;

pub const REJECT_MALFORMED: u32 = 0x01;
pub const REJECT_INVALID: u32 = 0x10;
pub const REJECT_OBSOLETE: u32 = 0x11;
pub const REJECT_DUPLICATE: u32 = 0x12;
pub const REJECT_NONSTANDARD: u32 = 0x40;
pub const REJECT_INSUFFICIENTFEE: u32 = 0x42;
pub const REJECT_CHECKPOINT: u32 = 0x43;

/// First code reserved for local use.
pub const REJECT_INTERNAL: u32 = 0x100;
/// The transaction is already known.
pub const REJECT_ALREADY_KNOWN: u32 = 0x101;
/// The transaction conflicts with one already in the pool.
pub const REJECT_CONFLICT: u32 = 0x102;

/// A validation failure as reported by the engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub code: u32,
    pub reason: String,
    /// Misbehavior points the sender earns. Zero means informational.
    pub severity: i32,
    /// The failure may stem from a malleated copy rather than the object itself.
    pub corruption_possible: bool,
}

impl Rejection {
    pub fn new(code: u32, reason: impl Into<String>, severity: i32) -> Self {
        Self {
            code,
            reason: reason.into(),
            severity,
            corruption_possible: false,
        }
    }

    /// Same rejection, flagged as possibly caused by malleation.
    pub fn corrupted(mut self) -> Self {
        self.corruption_possible = true;
        self
    }

    /// Whether the code may be relayed back to the peer in a reject message.
    pub fn is_wire_code(&self) -> bool {
        self.code < REJECT_INTERNAL
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {:#x}, severity {})", self.reason, self.code, self.severity)
    }
}

/// Why a header batch was refused.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderRejectKind {
    /// Failed a consensus check.
    Invalid,
    /// The header is already in the index and marked failed.
    CachedInvalid,
    /// Timestamp too far in the future. May become valid later.
    TimeTooNew,
}

/// Failure returned by [`BlockProcessor::process_new_headers`](crate::traits::BlockProcessor::process_new_headers).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeaderRejection {
    pub kind: HeaderRejectKind,
    pub reason: String,
    pub severity: i32,
    /// The first header of the batch that failed.
    pub first_invalid: Option<Hash256>,
}

impl fmt::Display for HeaderRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} (severity {})", self.kind, self.reason, self.severity)
    }
}

/// Result of checking a double-spend proof against the mempool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DsProofOutcome {
    Valid,
    /// Neither spender is known yet; kept until one arrives.
    MissingTransaction,
    Invalid,
}
