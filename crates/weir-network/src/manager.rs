//! The peer manager facade.
//!
//! [`PeerManager`] is what the connection layer talks to: it creates and
//! destroys per-peer state, feeds decoded messages to the handlers and runs
//! the periodic send pass. All cross-peer state lives in one
//! [`ManagerState`] behind a single mutex; the orphan pool and the most
//! recent block have their own locks, always taken after the main one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};
use weir_core::error::{ConfigError, WeirError, WireError};
use weir_core::traits::{BlockProcessor, ChainIndex, Clock, TxMempool};
use weir_core::types::{Block, Hash256};
use weir_core::validation::REJECT_MALFORMED;

use crate::compact::CompactBlock;
use crate::config::PeerManagerConfig;
use crate::connman::ConnectionManager;
use crate::filters::RollingSet;
use crate::orphans::OrphanPool;
use crate::peer::{ConnectionInfo, NodeId, PeerStats};
use crate::protocol::{Message, RejectMessage};
use crate::relay::RelayCache;
use crate::send_scheduler::FeeFilterRounder;
use crate::store::PeerStore;
use crate::tx_download::AlreadyAskedFor;

/// Capacity of the recently-rejected transaction filter.
const RECENT_REJECTS_CAPACITY: usize = 120_000;

/// The last block that passed proof-of-work checks, kept ready for
/// compact announcements and `getblocktxn` answers.
#[derive(Debug, Clone)]
pub struct RecentBlock {
    pub hash: Hash256,
    pub height: u64,
    pub block: Arc<Block>,
    pub compact: Arc<CompactBlock>,
}

/// Cross-peer state guarded by the manager's main lock.
#[derive(Debug)]
pub(crate) struct ManagerState {
    pub(crate) store: PeerStore,
    pub(crate) asked_for: AlreadyAskedFor,
    /// Transactions rejected since `recent_rejects_tip` became the tip.
    pub(crate) recent_rejects: RollingSet<Hash256>,
    pub(crate) recent_rejects_tip: Hash256,
    pub(crate) relay_cache: RelayCache,
    pub(crate) rng: StdRng,
    pub(crate) last_tip_update: Duration,
    pub(crate) stale_tip_check_time: Duration,
    /// Who sent us each block under validation, and whether they may be punished.
    pub(crate) block_sources: HashMap<Hash256, (NodeId, bool)>,
    /// Peers asked to announce new blocks with `cmpctblock`, oldest first.
    pub(crate) high_bandwidth_peers: VecDeque<NodeId>,
    pub(crate) highest_fast_announce: u64,
    pub(crate) fee_rounder: FeeFilterRounder,
    /// Shared trickle timer for inbound peers.
    pub(crate) next_inbound_inv_send: Duration,
    /// Salt for the deterministic choice of address relay targets.
    pub(crate) addr_salt: [u8; 32],
}

impl ManagerState {
    fn new(config: &PeerManagerConfig) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let addr_salt: [u8; 32] = rng.r#gen();
        let fee_rounder = FeeFilterRounder::new(config.min_relay_fee_per_kb);
        Self {
            store: PeerStore::new(),
            asked_for: AlreadyAskedFor::default(),
            recent_rejects: RollingSet::new(RECENT_REJECTS_CAPACITY),
            recent_rejects_tip: Hash256::ZERO,
            relay_cache: RelayCache::default(),
            rng,
            last_tip_update: Duration::ZERO,
            stale_tip_check_time: Duration::ZERO,
            block_sources: HashMap::new(),
            high_bandwidth_peers: VecDeque::new(),
            highest_fast_announce: 0,
            fee_rounder,
            next_inbound_inv_send: Duration::ZERO,
            addr_salt,
        }
    }

    /// A random nonce that is never zero.
    pub(crate) fn nonzero_nonce(&mut self) -> u64 {
        loop {
            let nonce: u64 = self.rng.r#gen();
            if nonce != 0 {
                return nonce;
            }
        }
    }
}

/// Message processing and synchronization engine for a set of peers.
pub struct PeerManager {
    pub(crate) config: PeerManagerConfig,
    pub(crate) chain: Arc<dyn ChainIndex>,
    pub(crate) blocks: Arc<dyn BlockProcessor>,
    pub(crate) mempool: Arc<dyn TxMempool>,
    pub(crate) connman: Arc<dyn ConnectionManager>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) orphans: Mutex<OrphanPool>,
    pub(crate) recent: Mutex<Option<RecentBlock>>,
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PeerManager")
            .field("peers", &st.store.len())
            .field("blocks_in_flight", &st.store.blocks_in_flight_total())
            .field("orphans", &self.orphans.lock().len())
            .finish()
    }
}

impl PeerManager {
    pub fn new(
        config: PeerManagerConfig,
        chain: Arc<dyn ChainIndex>,
        blocks: Arc<dyn BlockProcessor>,
        mempool: Arc<dyn TxMempool>,
        connman: Arc<dyn ConnectionManager>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = ManagerState::new(&config);
        let orphans = OrphanPool::new(config.rng_seed.map(|s| s.wrapping_add(1)));
        Ok(Self {
            config,
            chain,
            blocks,
            mempool,
            connman,
            clock,
            state: Mutex::new(state),
            orphans: Mutex::new(orphans),
            recent: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PeerManagerConfig {
        &self.config
    }

    /// Create state for a new connection. Outbound connections open the
    /// handshake with our `version`.
    pub fn initialize_node(&self, info: &ConnectionInfo) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.store.create(info, now) {
            warn!(peer = info.id, "peer already initialized");
            return;
        }
        info!(peer = info.id, addr = %info.addr, conn_type = ?info.conn_type, "peer connected");
        if !info.conn_type.is_inbound() {
            self.push_version(st, info.id);
        }
    }

    /// Drop all state for a closed connection. Returns whether the address
    /// book should refresh the peer's last-seen time.
    pub fn finalize_node(&self, id: NodeId) -> bool {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(peer) = st.store.destroy(id) else {
            return false;
        };
        st.high_bandwidth_peers.retain(|p| *p != id);
        self.orphans.lock().erase_for_peer(id);
        info!(peer = id, misbehavior = peer.misbehavior, "peer disconnected");
        peer.successfully_connected && peer.misbehavior == 0 && !peer.client
    }

    /// Handle one decoded message from `id`.
    pub fn process_message(&self, id: NodeId, msg: Message) -> Result<(), WeirError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let Some(peer) = st.store.get(id) else {
            return Err(WeirError::UnknownPeer(id));
        };
        if peer.disconnect {
            trace!(peer = id, command = msg.command(), "dropping message from disconnecting peer");
            return Ok(());
        }
        self.process_getdata_queue(st, id);
        trace!(peer = id, command = msg.command(), "received message");
        self.dispatch(st, id, msg);
        self.send_rejects_and_check_discourage(st, id);
        Ok(())
    }

    /// Decode and handle one framed message. Decode failures are handled
    /// here and never returned as errors.
    pub fn process_raw(&self, id: NodeId, data: &[u8]) -> Result<(), WeirError> {
        match Message::decode(data, self.config.magic) {
            Ok(msg) => self.process_message(id, msg),
            Err(err) => {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                if !st.store.contains(id) {
                    return Err(WeirError::UnknownPeer(id));
                }
                match err {
                    WireError::BadMagic | WireError::Oversized { .. } => {
                        warn!(peer = id, %err, "unframeable message");
                        self.disconnect_peer(st, id, "bad framing");
                    }
                    err => {
                        debug!(peer = id, %err, "failed to decode message");
                        if self.config.enable_bip61 {
                            let command = match &err {
                                WireError::Malformed { command, .. } => command.clone(),
                                _ => String::new(),
                            };
                            self.connman.push_message(
                                id,
                                Message::Reject(RejectMessage {
                                    message: command,
                                    code: REJECT_MALFORMED as u8,
                                    reason: "error parsing message".to_string(),
                                    hash: None,
                                }),
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Run the send pass for one peer.
    pub fn send_messages(&self, id: NodeId) -> Result<(), WeirError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.store.contains(id) {
            return Err(WeirError::UnknownPeer(id));
        }
        self.send_messages_to(st, id);
        Ok(())
    }

    /// Run the send pass for every peer.
    pub fn send_messages_all(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        for id in st.store.ids() {
            self.send_messages_to(st, id);
        }
    }

    /// Periodic eviction of extra outbound peers and stale-tip detection.
    pub fn check_stale_tip_and_evict_peers(&self) {
        let mut guard = self.state.lock();
        self.stale_tip_check(&mut guard);
    }

    /// Ask for a ping to `id` on the next send pass.
    pub fn request_ping(&self, id: NodeId) -> Result<(), WeirError> {
        let mut st = self.state.lock();
        let peer = st.store.get_mut(id).ok_or(WeirError::UnknownPeer(id))?;
        peer.ping.queued = true;
        Ok(())
    }

    /// Announce a mempool transaction to every peer that does not know it.
    pub fn relay_transaction(&self, txid: Hash256) {
        let mut guard = self.state.lock();
        self.relay_tx(&mut guard, txid);
    }

    pub fn stats(&self, id: NodeId) -> Option<PeerStats> {
        let st = self.state.lock();
        let peer = st.store.get(id)?;
        let height_of = |hash: Option<Hash256>| hash.and_then(|h| self.chain.lookup(&h)).map(|e| e.height);
        Some(PeerStats {
            misbehavior: peer.misbehavior,
            sync_height: height_of(peer.best_known_block),
            common_height: height_of(peer.last_common_block),
            heights_in_flight: peer
                .blocks_in_flight
                .iter()
                .filter_map(|q| self.chain.lookup(&q.hash))
                .map(|e| e.height)
                .collect(),
            ping: peer.ping.last_latency,
            min_ping: peer.ping.min_latency,
        })
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.state.lock().store.ids()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Blocks in flight across all peers.
    pub fn blocks_in_flight(&self) -> usize {
        self.state.lock().store.blocks_in_flight_total()
    }

    /// The cached most recent block, if any.
    pub fn recent_block(&self) -> Option<RecentBlock> {
        self.recent.lock().clone()
    }

    /// Run `f` against the locked state. Test-only window into internals.
    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Flag the peer for disconnection and tell the connection layer.
    pub(crate) fn disconnect_peer(&self, st: &mut ManagerState, id: NodeId, reason: &str) {
        if let Some(peer) = st.store.get_mut(id) {
            if !peer.disconnect {
                info!(peer = id, name = %peer.name, reason, "disconnecting peer");
            }
            peer.disconnect = true;
        }
        self.connman.disconnect(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use crate::peer::ConnectionType;
    use crate::protocol::VersionMessage;

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Outbound connections open with our version; inbound ones wait.
    #[test]
    fn initialize_sends_version_to_outbound_only() {
        let h = Harness::new();
        h.manager.initialize_node(&Harness::info(1, ConnectionType::Outbound));
        h.manager.initialize_node(&Harness::info(2, ConnectionType::Inbound));
        assert_eq!(h.connman.commands_for(1), vec!["version"]);
        assert!(h.connman.commands_for(2).is_empty());
    }

    /// Messages for unknown peers are an error, not a panic.
    #[test]
    fn unknown_peer_is_error() {
        let h = Harness::new();
        assert!(matches!(
            h.manager.process_message(9, Message::Verack),
            Err(WeirError::UnknownPeer(9))
        ));
        assert!(h.manager.send_messages(9).is_err());
    }

    /// Finalizing a peer clears it and its orphans.
    #[test]
    fn finalize_clears_state() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        assert_eq!(h.manager.peer_count(), 1);
        assert!(h.manager.finalize_node(1));
        assert_eq!(h.manager.peer_count(), 0);
        assert!(!h.manager.finalize_node(1));
    }

    /// Wrong magic disconnects; undecodable payloads get a malformed reject.
    #[test]
    fn raw_decode_failures() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let frame = Message::Verack.encode([9, 9, 9, 9]).unwrap();
        h.manager.process_raw(1, &frame).unwrap();
        assert!(h.connman.is_disconnected(1));

        h.connect(2, ConnectionType::Inbound);
        let mut frame = Message::Ping(1).encode(h.manager.config().magic).unwrap();
        frame.truncate(frame.len() - 1);
        h.manager.process_raw(2, &frame).unwrap();
        assert!(!h.connman.is_disconnected(2));
        let sent = h.connman.take_for(2);
        assert!(matches!(
            sent.as_slice(),
            [Message::Reject(r)] if r.code == REJECT_MALFORMED as u8
        ));
    }

    /// A disconnecting peer's messages are dropped.
    #[test]
    fn disconnecting_peer_is_ignored() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.manager.with_state(|st| st.store.get_mut(1).unwrap().disconnect = true);
        h.manager.process_message(1, Message::Ping(7)).unwrap();
        assert!(h.connman.take_for(1).is_empty());
    }

    /// Stats reflect handshake and ping state.
    #[test]
    fn stats_snapshot() {
        let h = Harness::new();
        h.manager.initialize_node(&Harness::info(1, ConnectionType::Inbound));
        let version = VersionMessage {
            start_height: 0,
            ..Harness::peer_version(1)
        };
        h.manager.process_message(1, Message::Version(version)).unwrap();
        let stats = h.manager.stats(1).unwrap();
        assert_eq!(stats.misbehavior, 0);
        assert!(stats.heights_in_flight.is_empty());
        assert!(stats.ping.is_none());
        assert!(h.manager.stats(2).is_none());
    }
}
