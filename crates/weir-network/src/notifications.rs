//! Reactions to validation events.
//!
//! Blocks are handed to the [`BlockProcessor`](weir_core::traits::BlockProcessor)
//! synchronously; the tip before and after tells us which blocks connected
//! and drives the same callbacks a signalling validation engine would. The
//! public wrappers let an engine that does signal drive them directly.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};
use weir_core::constants::{INVALID_CB_NO_BAN_VERSION, MAX_HEADERS_RESULTS};
use weir_core::traits::ChainIndex;
use weir_core::types::{Block, BlockIndexEntry, Hash256};
use weir_core::validation::Rejection;

use crate::compact::CompactBlock;
use crate::headers::MAX_BLOCKS_TO_ANNOUNCE;
use crate::manager::{ManagerState, PeerManager, RecentBlock};
use crate::misbehavior::MAX_REJECT_MESSAGE_LENGTH;
use crate::peer::{BlockReject, NodeId, Peer};
use crate::protocol::{Message, SendCmpct};

/// Peers asked to push new blocks to us as `cmpctblock`.
const MAX_HIGH_BANDWIDTH_PEERS: usize = 3;

/// Whether `peer` is known to have the header of `entry`, either because
/// it announced a descendant or because we sent it.
pub(crate) fn peer_has_header(chain: &dyn ChainIndex, peer: &Peer, entry: &BlockIndexEntry) -> bool {
    let has = |hash: Option<Hash256>| {
        hash.and_then(|h| chain.lookup(&h))
            .and_then(|known| chain.ancestor(&known, entry.height))
            .is_some_and(|a| a.hash == entry.hash)
    };
    has(peer.best_known_block) || has(peer.best_header_sent)
}

impl PeerManager {
    /// Process a block we mined or loaded ourselves. Returns whether it was new.
    pub fn submit_block(&self, block: &Block) -> bool {
        let mut guard = self.state.lock();
        self.process_block(&mut guard, None, block, true)
    }

    pub fn block_connected(&self, block: &Block) {
        let mut guard = self.state.lock();
        self.on_block_connected(&mut guard, block);
    }

    pub fn block_disconnected(&self, block: &Block) {
        self.on_block_disconnected(block.hash(), None);
    }

    pub fn updated_block_tip(&self, new_tip: &BlockIndexEntry, fork: Option<&BlockIndexEntry>, initial_download: bool) {
        let mut guard = self.state.lock();
        self.on_updated_block_tip(&mut guard, new_tip, fork, initial_download);
    }

    pub fn new_pow_valid_block(&self, block: &Block) {
        let mut guard = self.state.lock();
        self.on_new_pow_valid_block(&mut guard, block);
    }

    pub fn block_checked(&self, hash: Hash256, result: Result<(), &Rejection>) {
        let mut guard = self.state.lock();
        self.on_block_checked(&mut guard, hash, result);
    }

    /// Hand `block` to validation and fire the resulting notifications.
    /// `source` is the sending peer and whether it may be punished.
    pub(crate) fn process_block(
        &self,
        st: &mut ManagerState,
        source: Option<(NodeId, bool)>,
        block: &Block,
        force: bool,
    ) -> bool {
        let hash = block.hash();
        if let Some(source) = source {
            st.block_sources.insert(hash, source);
        }
        let old_tip = self.chain.active_tip();
        let ibd_before = self.chain.is_initial_block_download();

        let is_new = match self.blocks.process_new_block(block, force) {
            Ok(is_new) => is_new,
            Err(rejection) => {
                debug!(%hash, %rejection, "block rejected");
                self.on_block_checked(st, hash, Err(&rejection));
                return false;
            }
        };

        if is_new && !ibd_before && block.header.prev_hash == old_tip.hash {
            self.on_new_pow_valid_block(st, block);
        }

        let new_tip = self.chain.active_tip();
        if new_tip.hash == old_tip.hash {
            st.block_sources.remove(&hash);
            return is_new;
        }

        let fork = self.chain.last_common_ancestor(&old_tip, &new_tip);
        let fork_height = fork.as_ref().map_or(0, |f| f.height);
        let mut walk = Some(old_tip.clone());
        while let Some(entry) = walk.filter(|e| e.height > fork_height) {
            self.on_block_disconnected(entry.hash, Some(entry.height));
            walk = self.chain.lookup(&entry.prev_hash());
        }

        let start = fork.as_ref().map_or(0, |f| f.height + 1);
        for height in start..=new_tip.height {
            let Some(entry) = self.chain.ancestor(&new_tip, height) else { continue };
            let connected = if entry.hash == hash {
                block.clone()
            } else {
                match self.chain.read_block(&entry.hash) {
                    Ok(b) => b,
                    Err(err) => {
                        debug!(hash = %entry.hash, %err, "connected block unreadable");
                        continue;
                    }
                }
            };
            self.on_block_checked(st, entry.hash, Ok(()));
            self.on_block_connected(st, &connected);
        }

        let ibd = self.chain.is_initial_block_download();
        self.on_updated_block_tip(st, &new_tip, fork.as_ref(), ibd);
        is_new
    }

    pub(crate) fn on_block_checked(&self, st: &mut ManagerState, hash: Hash256, result: Result<(), &Rejection>) {
        let source = st.block_sources.remove(&hash);
        let Some((id, may_punish)) = source else { return };
        if !st.store.contains(id) {
            return;
        }
        match result {
            Err(rejection) => {
                if rejection.code > 0 && rejection.is_wire_code() {
                    if let (Ok(code), Some(peer)) = (u8::try_from(rejection.code), st.store.get_mut(id)) {
                        peer.rejects.push(BlockReject {
                            code,
                            reason: rejection.reason.chars().take(MAX_REJECT_MESSAGE_LENGTH).collect(),
                            hash,
                        });
                    }
                }
                if may_punish && rejection.severity > 0 {
                    self.misbehaving(st, id, rejection.severity, &rejection.reason);
                }
            }
            Ok(()) => {
                let expected = usize::from(st.store.in_flight_owner(&hash).is_some());
                if !self.chain.is_initial_block_download() && st.store.blocks_in_flight_total() == expected {
                    // The peer just gave us a new block; ask it to push the next one.
                    self.maybe_set_peer_as_announcing_header_and_ids(st, id);
                }
            }
        }
    }

    /// Keep `id` among the few peers pushing us compact blocks, evicting the
    /// least recently useful one if needed.
    fn maybe_set_peer_as_announcing_header_and_ids(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get(id) else { return };
        if !peer.provides_header_and_ids || !peer.supports_desired_cmpct_version {
            return;
        }
        if let Some(pos) = st.high_bandwidth_peers.iter().position(|p| *p == id) {
            st.high_bandwidth_peers.remove(pos);
            st.high_bandwidth_peers.push_back(id);
            return;
        }
        if st.high_bandwidth_peers.len() >= MAX_HIGH_BANDWIDTH_PEERS {
            if let Some(evicted) = st.high_bandwidth_peers.pop_front() {
                debug!(peer = evicted, "no longer asking for high-bandwidth compact blocks");
                self.connman.push_message(
                    evicted,
                    Message::SendCmpct(SendCmpct {
                        announce: false,
                        version: 1,
                    }),
                );
            }
        }
        debug!(peer = id, "asking for high-bandwidth compact blocks");
        self.connman.push_message(
            id,
            Message::SendCmpct(SendCmpct {
                announce: true,
                version: 1,
            }),
        );
        st.high_bandwidth_peers.push_back(id);
    }

    /// A block passed proof-of-work checks on top of our tip: cache it and
    /// push it to high-bandwidth peers before full validation.
    pub(crate) fn on_new_pow_valid_block(&self, st: &mut ManagerState, block: &Block) {
        let hash = block.hash();
        let Some(entry) = self.chain.lookup(&hash) else { return };
        if entry.height <= st.highest_fast_announce {
            return;
        }
        st.highest_fast_announce = entry.height;

        let compact = Arc::new(CompactBlock::from_block(block, st.rng.r#gen()));
        *self.recent.lock() = Some(RecentBlock {
            hash,
            height: entry.height,
            block: Arc::new(block.clone()),
            compact: compact.clone(),
        });

        let Some(parent) = self.chain.lookup(&entry.prev_hash()) else { return };
        for id in st.store.ids() {
            st.store.process_block_availability(&*self.chain, id);
            let Some(peer) = st.store.get_mut(id) else { continue };
            if peer.version < INVALID_CB_NO_BAN_VERSION || peer.disconnect {
                continue;
            }
            if peer.prefer_header_and_ids
                && !peer_has_header(&*self.chain, peer, &entry)
                && peer_has_header(&*self.chain, peer, &parent)
            {
                debug!(peer = id, %hash, height = entry.height, "sending compact block before validation");
                self.connman.push_message(id, Message::CmpctBlock((*compact).clone()));
                peer.best_header_sent = Some(hash);
            }
        }
    }

    pub(crate) fn on_updated_block_tip(
        &self,
        st: &mut ManagerState,
        new_tip: &BlockIndexEntry,
        fork: Option<&BlockIndexEntry>,
        initial_download: bool,
    ) {
        info!(hash = %new_tip.hash, height = new_tip.height, initial_download, "new tip");
        if initial_download {
            return;
        }
        let mut hashes = Vec::new();
        let mut walk = Some(new_tip.clone());
        while let Some(entry) = walk {
            if fork.is_some_and(|f| f.hash == entry.hash) {
                break;
            }
            hashes.push(entry.hash);
            if hashes.len() == MAX_BLOCKS_TO_ANNOUNCE {
                break;
            }
            walk = self.chain.lookup(&entry.prev_hash());
        }
        for peer in st.store.iter_mut() {
            // Peers still far behind will fetch these anyway.
            if new_tip.height + MAX_HEADERS_RESULTS as u64 > peer.start_height {
                peer.inventory.block_hashes_to_announce.extend(hashes.iter().rev());
            }
        }
    }

    pub(crate) fn on_block_connected(&self, st: &mut ManagerState, block: &Block) {
        let erased = self.orphans.lock().erase_for_block(block);
        if erased > 0 {
            debug!(hash = %block.hash(), erased, "erased orphans included or conflicted by block");
        }
        st.last_tip_update = self.clock.now();
    }

    fn on_block_disconnected(&self, hash: Hash256, height: Option<u64>) {
        debug!(%hash, ?height, "block disconnected");
    }
}
