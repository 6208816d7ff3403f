//! Cross-crate test suite for the Weir sync engine.
//!
//! Drives a [`weir_network::PeerManager`] through its public surface only,
//! the way a transport would, and checks the bookkeeping invariants of the
//! peer store, orphan pool and transaction download scheduler under
//! randomized inputs.

pub mod helpers;
