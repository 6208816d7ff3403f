//! # weir-network
//! Peer message processing and block/transaction synchronization.
//!
//! [`PeerManager`] is the synchronous core: the transport feeds it decoded
//! messages and connection events, and it answers through a
//! [`ConnectionManager`]. [`SyncService`] wraps it in a tokio task that
//! owns the periodic timers.

pub mod block_download;
pub mod compact;
pub mod config;
pub mod connman;
pub mod dispatcher;
pub mod eviction;
pub mod filters;
pub mod handshake;
pub mod headers;
pub mod manager;
pub mod misbehavior;
pub mod notifications;
pub mod orphans;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod send_scheduler;
pub mod serve;
pub mod service;
pub mod store;
pub mod tx_download;

#[cfg(test)]
mod harness;

pub use config::PeerManagerConfig;
pub use connman::{ConnectionManager, RecordingConnman};
pub use manager::{PeerManager, RecentBlock};
pub use orphans::OrphanPool;
pub use peer::{ConnectionInfo, ConnectionType, NodeId, PeerPermissions, PeerStats};
pub use protocol::{Inv, InvKind, Message, NetAddress};
pub use service::SyncService;
pub use store::PeerStore;
