//! Arena of per-peer state plus the cross-peer download bookkeeping.
//!
//! The store owns every [`Peer`] and the global block-in-flight index. Global
//! counters are maintained here so that they always agree with the peers that
//! are present; when the last peer leaves they must all be zero again.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info};
use weir_core::types::Hash256;

use crate::peer::{ConnectionInfo, NodeId, Peer};

#[derive(Debug, Default)]
pub struct PeerStore {
    pub(crate) peers: BTreeMap<NodeId, Peer>,
    /// Block hash to the one peer we are downloading it from.
    pub(crate) blocks_in_flight: HashMap<Hash256, NodeId>,
    /// Peers we started headers sync with.
    pub(crate) sync_started: usize,
    pub(crate) preferred_download: usize,
    /// Peers with at least one in-flight block whose header we had validated.
    pub(crate) peers_with_validated_downloads: usize,
    pub(crate) outbound_peers_with_protect: usize,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert fresh state for a new connection. Returns false if the id is taken.
    pub fn create(&mut self, info: &ConnectionInfo, now: Duration) -> bool {
        if self.peers.contains_key(&info.id) {
            return false;
        }
        self.peers.insert(info.id, Peer::new(info, now));
        true
    }

    /// Remove a peer, retiring its in-flight blocks and its share of the counters.
    pub fn destroy(&mut self, id: NodeId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        if peer.sync_started {
            self.sync_started -= 1;
        }
        for queued in &peer.blocks_in_flight {
            self.blocks_in_flight.remove(&queued.hash);
        }
        self.preferred_download -= usize::from(peer.preferred_download);
        self.peers_with_validated_downloads -= usize::from(peer.blocks_in_flight_valid_headers != 0);
        self.outbound_peers_with_protect -= usize::from(peer.chain_sync.protect);

        if self.peers.is_empty() {
            debug_assert!(self.blocks_in_flight.is_empty(), "blocks in flight without peers");
            debug_assert_eq!(self.sync_started, 0);
            debug_assert_eq!(self.preferred_download, 0);
            debug_assert_eq!(self.peers_with_validated_downloads, 0);
            debug_assert_eq!(self.outbound_peers_with_protect, 0);
        }
        debug!(peer = id, "cleared peer state");
        Some(peer)
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peer ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Peer currently downloading `hash`, if any.
    pub fn in_flight_owner(&self, hash: &Hash256) -> Option<NodeId> {
        self.blocks_in_flight.get(hash).copied()
    }

    pub fn blocks_in_flight_total(&self) -> usize {
        self.blocks_in_flight.len()
    }

    pub fn sync_started_count(&self) -> usize {
        self.sync_started
    }

    pub fn preferred_download_count(&self) -> usize {
        self.preferred_download
    }

    pub fn peers_with_validated_downloads(&self) -> usize {
        self.peers_with_validated_downloads
    }

    pub fn outbound_peers_with_protect(&self) -> usize {
        self.outbound_peers_with_protect
    }

    /// Recompute whether `id` is a preferred download source.
    pub fn update_preferred_download(&mut self, id: NodeId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        self.preferred_download -= usize::from(peer.preferred_download);
        peer.preferred_download = peer.compute_preferred_download();
        self.preferred_download += usize::from(peer.preferred_download);
    }

    pub fn set_sync_started(&mut self, id: NodeId, started: bool) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        if peer.sync_started != started {
            peer.sync_started = started;
            if started {
                self.sync_started += 1;
            } else {
                self.sync_started -= 1;
            }
        }
    }

    pub fn set_protect(&mut self, id: NodeId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        if !peer.chain_sync.protect {
            peer.chain_sync.protect = true;
            self.outbound_peers_with_protect += 1;
        }
    }

    /// Add `howmuch` to the peer's misbehavior score. Returns true when this
    /// call pushed the score across `threshold`.
    pub fn misbehaving(&mut self, id: NodeId, howmuch: i32, threshold: i32, reason: &str) -> bool {
        if howmuch == 0 {
            return false;
        }
        let Some(peer) = self.peers.get_mut(&id) else { return false };
        let before = peer.misbehavior;
        peer.misbehavior += howmuch;
        if peer.misbehavior >= threshold && before < threshold {
            info!(peer = id, name = %peer.name, before, after = peer.misbehavior, reason, "discourage threshold exceeded");
            peer.should_discourage = true;
            true
        } else {
            debug!(peer = id, name = %peer.name, before, after = peer.misbehavior, reason, "misbehaving");
            false
        }
    }

    /// Whether the per-peer in-flight lists agree with the global index.
    pub fn in_flight_consistent(&self) -> bool {
        let listed: usize = self.peers.values().map(Peer::blocks_in_flight_count).sum();
        listed == self.blocks_in_flight.len()
            && self.peers.values().all(|p| {
                p.blocks_in_flight_valid_headers <= p.blocks_in_flight.len()
                    && p.blocks_in_flight
                        .iter()
                        .all(|q| self.blocks_in_flight.get(&q.hash) == Some(&p.id))
            })
    }
}
