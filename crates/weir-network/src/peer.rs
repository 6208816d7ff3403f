//! Per-connection synchronization state.
//!
//! A [`Peer`] holds everything we know about one connection: handshake data,
//! what the peer knows of the chain, its in-flight requests and its relay
//! queues. Chain positions are kept as block hashes and resolved through the
//! chain index when needed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use weir_core::types::Hash256;

use crate::compact::PartialBlock;
use crate::filters::{BloomFilter, RollingSet};
use crate::protocol::{Inv, NetAddress};

/// Stable handle of a connection, assigned by the connection manager.
pub type NodeId = u64;

/// Capacity of the per-peer known-inventory filter.
const KNOWN_INVENTORY_CAPACITY: usize = 50_000;
/// Capacity of the per-peer known-address filter.
const KNOWN_ADDRESS_CAPACITY: usize = 5_000;

/// How a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Inbound,
    /// Automatic outbound full-relay connection.
    Outbound,
    /// Operator-requested outbound connection.
    Manual,
    /// Short-lived outbound probe that only tests reachability.
    Feeler,
    /// Outbound connection opened to fetch addresses, then closed.
    OneShot,
}

impl ConnectionType {
    pub fn is_inbound(self) -> bool {
        self == ConnectionType::Inbound
    }
}

/// Operator-granted privileges of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerPermissions {
    /// Never discouraged for misbehavior.
    pub noban: bool,
    /// May load bloom filters even when we do not offer the service.
    pub bloom_filter: bool,
    /// Relay its transactions even in blocks-only mode.
    pub relay: bool,
    /// Relay its transactions even when they are rejected with severity zero.
    pub force_relay: bool,
    /// May request our mempool.
    pub mempool: bool,
}

/// What the connection manager tells us about a new connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Display name, usually the address as dialed.
    pub name: String,
    pub conn_type: ConnectionType,
    pub permissions: PeerPermissions,
    /// Connection from the local network or loopback.
    pub is_local: bool,
}

/// A block we requested from a peer.
#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub hash: Hash256,
    /// The header was already validated when we asked.
    pub had_valid_header: bool,
    /// Reconstruction state for compact-block downloads.
    pub partial: Option<PartialBlock>,
}

/// Reject to send to a peer once validation of its block completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReject {
    pub code: u8,
    pub reason: String,
    pub hash: Hash256,
}

/// Timer that disconnects outbound peers whose chain stops keeping up with ours.
#[derive(Debug, Clone, Default)]
pub struct ChainSyncTimeout {
    pub timeout: Option<Duration>,
    /// Our tip at the time the timer was set; the peer must reach its work.
    pub work_header: Option<Hash256>,
    pub sent_getheaders: bool,
    /// Exempt from this timer.
    pub protect: bool,
}

/// Transaction announcements and requests for one peer.
#[derive(Debug, Clone, Default)]
pub struct TxDownloadState {
    /// When to consider requesting each announced transaction.
    pub process_queue: BTreeSet<(Duration, Hash256)>,
    pub announced: HashSet<Hash256>,
    /// Outstanding requests and when they were sent.
    pub in_flight: HashMap<Hash256, Duration>,
    pub check_expiry_timer: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PingState {
    /// Nonce of the outstanding ping, zero when none.
    pub nonce_sent: u64,
    pub started: Option<Duration>,
    /// Send a ping on the next pass regardless of the interval.
    pub queued: bool,
    pub last_latency: Option<Duration>,
    pub min_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct AddrRelayState {
    pub known: RollingSet<SocketAddr>,
    pub to_send: Vec<NetAddress>,
    pub next_send: Duration,
    pub next_local_send: Duration,
    /// We asked this peer for addresses and have not had a full answer yet.
    pub getaddr_pending: bool,
    /// We already answered a getaddr from this peer.
    pub answered_getaddr: bool,
    pub wants_addrv2: bool,
}

impl Default for AddrRelayState {
    fn default() -> Self {
        Self {
            known: RollingSet::new(KNOWN_ADDRESS_CAPACITY),
            to_send: Vec::new(),
            next_send: Duration::ZERO,
            next_local_send: Duration::ZERO,
            getaddr_pending: false,
            answered_getaddr: false,
            wants_addrv2: false,
        }
    }
}

/// Relay queues and filters for inventory we announce to the peer.
#[derive(Debug, Clone)]
pub struct InventoryState {
    /// Inventory the peer is known to have.
    pub known: RollingSet<Hash256>,
    /// Transactions waiting for the next trickle.
    pub tx_to_send: BTreeSet<Hash256>,
    /// Block invs to send on the next pass.
    pub blocks_to_send: Vec<Hash256>,
    /// Blocks to announce via headers or inv.
    pub block_hashes_to_announce: Vec<Hash256>,
    /// Double-spend proofs to announce.
    pub dsproofs_to_send: Vec<Hash256>,
    pub next_inv_send: Duration,
    /// Peer asked for our mempool; answer on the next trickle.
    pub send_mempool: bool,
    pub last_mempool_request: Option<Duration>,
    /// Peer wants transaction relay.
    pub relay_txes: bool,
    pub bloom: Option<BloomFilter>,
    /// Peer's fee filter, per 1000 bytes.
    pub fee_filter: u64,
    /// When the peer reaches this block through getdata, announce our tip.
    pub hash_continue: Option<Hash256>,
}

impl Default for InventoryState {
    fn default() -> Self {
        Self {
            known: RollingSet::new(KNOWN_INVENTORY_CAPACITY),
            tx_to_send: BTreeSet::new(),
            blocks_to_send: Vec::new(),
            block_hashes_to_announce: Vec::new(),
            dsproofs_to_send: Vec::new(),
            next_inv_send: Duration::ZERO,
            send_mempool: false,
            last_mempool_request: None,
            relay_txes: false,
            bloom: None,
            fee_filter: 0,
            hash_continue: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeeFilterState {
    pub last_sent: u64,
    pub next_send: Duration,
}

/// Protocol state of one connected peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub name: String,
    pub conn_type: ConnectionType,
    pub permissions: PeerPermissions,
    pub is_local: bool,
    pub connected_at: Duration,

    // Handshake.
    /// Negotiated protocol version, zero until `version` arrives.
    pub version: u32,
    pub services: u64,
    pub start_height: u64,
    pub user_agent: String,
    /// Serves neither full nor limited history.
    pub client: bool,
    /// Serves only recent history.
    pub limited: bool,
    /// `verack` received.
    pub successfully_connected: bool,
    pub sent_verack: bool,
    /// We already asked this peer for addresses.
    pub sent_getaddr: bool,
    pub extversion_expected: bool,
    pub extversion: Option<BTreeMap<u64, Vec<u8>>>,
    pub time_offset: i64,
    /// Disconnection requested; the connection manager tears it down.
    pub disconnect: bool,

    // Misbehavior.
    pub misbehavior: i32,
    pub should_discourage: bool,
    pub rejects: Vec<BlockReject>,

    // Chain knowledge.
    pub best_known_block: Option<Hash256>,
    pub last_unknown_block: Option<Hash256>,
    pub last_common_block: Option<Hash256>,
    pub best_header_sent: Option<Hash256>,

    // Sync.
    pub unconnecting_headers: u32,
    pub sync_started: bool,
    pub headers_sync_timeout: Duration,
    pub stalling_since: Option<Duration>,
    pub blocks_in_flight: VecDeque<QueuedBlock>,
    pub blocks_in_flight_valid_headers: usize,
    pub downloading_since: Duration,
    pub preferred_download: bool,
    pub prefer_headers: bool,
    pub prefer_header_and_ids: bool,
    pub provides_header_and_ids: bool,
    pub supports_desired_cmpct_version: bool,
    pub chain_sync: ChainSyncTimeout,
    pub last_block_announcement: Duration,

    pub tx_download: TxDownloadState,
    pub ping: PingState,
    pub addr_relay: AddrRelayState,
    pub inventory: InventoryState,
    pub fee_filter: FeeFilterState,
    /// Getdata entries waiting to be served.
    pub getdata_queue: VecDeque<Inv>,
}

impl Peer {
    pub fn new(info: &ConnectionInfo, now: Duration) -> Self {
        Self {
            id: info.id,
            addr: info.addr,
            name: info.name.clone(),
            conn_type: info.conn_type,
            permissions: info.permissions,
            is_local: info.is_local,
            connected_at: now,
            version: 0,
            services: 0,
            start_height: 0,
            user_agent: String::new(),
            client: false,
            limited: false,
            successfully_connected: false,
            sent_verack: false,
            sent_getaddr: false,
            extversion_expected: false,
            extversion: None,
            time_offset: 0,
            disconnect: false,
            misbehavior: 0,
            should_discourage: false,
            rejects: Vec::new(),
            best_known_block: None,
            last_unknown_block: None,
            last_common_block: None,
            best_header_sent: None,
            unconnecting_headers: 0,
            sync_started: false,
            headers_sync_timeout: Duration::ZERO,
            stalling_since: None,
            blocks_in_flight: VecDeque::new(),
            blocks_in_flight_valid_headers: 0,
            downloading_since: Duration::ZERO,
            preferred_download: false,
            prefer_headers: false,
            prefer_header_and_ids: false,
            provides_header_and_ids: false,
            supports_desired_cmpct_version: false,
            chain_sync: ChainSyncTimeout::default(),
            last_block_announcement: Duration::ZERO,
            tx_download: TxDownloadState::default(),
            ping: PingState::default(),
            addr_relay: AddrRelayState::default(),
            inventory: InventoryState::default(),
            fee_filter: FeeFilterState::default(),
            getdata_queue: VecDeque::new(),
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.conn_type.is_inbound()
    }

    pub fn is_manual(&self) -> bool {
        self.conn_type == ConnectionType::Manual
    }

    /// Automatic outbound full-relay connection: the only kind we churn.
    pub fn is_outbound_disconnection_candidate(&self) -> bool {
        self.conn_type == ConnectionType::Outbound
    }

    /// Whether this peer is one we prefer to download blocks from.
    pub fn compute_preferred_download(&self) -> bool {
        (!self.is_inbound() || self.permissions.noban)
            && self.conn_type != ConnectionType::OneShot
            && !self.client
    }

    pub fn blocks_in_flight_count(&self) -> usize {
        self.blocks_in_flight.len()
    }

    pub fn has_block_in_flight(&self, hash: &Hash256) -> bool {
        self.blocks_in_flight.iter().any(|q| q.hash == *hash)
    }
}

/// Snapshot of a peer's sync progress for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub misbehavior: i32,
    /// Height of the best block the peer announced, if known.
    pub sync_height: Option<u64>,
    /// Height of the last block we both have, if known.
    pub common_height: Option<u64>,
    pub heights_in_flight: Vec<u64>,
    pub ping: Option<Duration>,
    pub min_ping: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(conn_type: ConnectionType) -> ConnectionInfo {
        ConnectionInfo {
            id: 1,
            addr: "10.0.0.1:8433".parse().unwrap(),
            name: "peer1".into(),
            conn_type,
            permissions: PeerPermissions::default(),
            is_local: false,
        }
    }

    /// Fresh peers start with no chain knowledge and nothing in flight.
    #[test]
    fn new_peer_is_blank() {
        let peer = Peer::new(&info(ConnectionType::Outbound), Duration::from_secs(5));
        assert_eq!(peer.version, 0);
        assert!(peer.best_known_block.is_none());
        assert_eq!(peer.blocks_in_flight_count(), 0);
        assert_eq!(peer.connected_at, Duration::from_secs(5));
    }

    /// Outbound and noban inbound peers are preferred; clients and one-shots are not.
    #[test]
    fn preferred_download_rules() {
        let mut peer = Peer::new(&info(ConnectionType::Outbound), Duration::ZERO);
        assert!(peer.compute_preferred_download());
        peer.client = true;
        assert!(!peer.compute_preferred_download());

        let mut inbound = Peer::new(&info(ConnectionType::Inbound), Duration::ZERO);
        assert!(!inbound.compute_preferred_download());
        inbound.permissions.noban = true;
        assert!(inbound.compute_preferred_download());

        let oneshot = Peer::new(&info(ConnectionType::OneShot), Duration::ZERO);
        assert!(!oneshot.compute_preferred_download());
    }

    /// Only automatic outbound connections are eviction candidates.
    #[test]
    fn disconnection_candidates() {
        assert!(Peer::new(&info(ConnectionType::Outbound), Duration::ZERO).is_outbound_disconnection_candidate());
        assert!(!Peer::new(&info(ConnectionType::Manual), Duration::ZERO).is_outbound_disconnection_candidate());
        assert!(!Peer::new(&info(ConnectionType::Feeler), Duration::ZERO).is_outbound_disconnection_candidate());
    }
}
