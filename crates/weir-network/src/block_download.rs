//! Block download scheduling.
//!
//! Decides which blocks to fetch from which peer and keeps the global
//! in-flight index in step with each peer's request list. A block is in
//! flight from at most one peer at a time.

use std::time::Duration;

use weir_core::traits::ChainIndex;
use weir_core::types::{BlockIndexEntry, BlockValidity, Hash256};

use crate::peer::{NodeId, QueuedBlock};
use crate::store::PeerStore;

/// Blocks we request from a single peer at once.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;
/// How far past the last common block we are willing to download.
pub const BLOCK_DOWNLOAD_WINDOW: u64 = 1024;
/// Minimum number of ancestors resolved per batch while walking.
const FETCH_BATCH: u64 = 128;

impl PeerStore {
    /// Record that `hash` was requested from `id`.
    ///
    /// If another peer had the block in flight, that request is retired first.
    /// Returns `(true, entry)` for a new request and `(false, entry)` when the
    /// same peer already had it in flight, so callers can attach compact-block
    /// state either way. `None` if the peer is unknown.
    pub fn mark_block_in_flight(
        &mut self,
        id: NodeId,
        hash: Hash256,
        validated_header: bool,
        now: Duration,
    ) -> Option<(bool, &mut QueuedBlock)> {
        if !self.peers.contains_key(&id) {
            return None;
        }
        if self.blocks_in_flight.get(&hash) == Some(&id) {
            let peer = self.peers.get_mut(&id)?;
            let queued = peer.blocks_in_flight.iter_mut().find(|q| q.hash == hash)?;
            return Some((false, queued));
        }

        self.mark_block_received(&hash, now);

        let peer = self.peers.get_mut(&id)?;
        peer.blocks_in_flight.push_back(QueuedBlock {
            hash,
            had_valid_header: validated_header,
            partial: None,
        });
        if peer.blocks_in_flight.len() == 1 {
            peer.downloading_since = now;
        }
        if validated_header {
            peer.blocks_in_flight_valid_headers += 1;
            if peer.blocks_in_flight_valid_headers == 1 {
                self.peers_with_validated_downloads += 1;
            }
        }
        self.blocks_in_flight.insert(hash, id);
        let queued = peer.blocks_in_flight.back_mut()?;
        Some((true, queued))
    }

    /// Retire the in-flight request for `hash`. Returns whether one existed,
    /// which doubles as "did we ask for this block".
    pub fn mark_block_received(&mut self, hash: &Hash256, now: Duration) -> bool {
        let Some(owner) = self.blocks_in_flight.remove(hash) else {
            return false;
        };
        let Some(peer) = self.peers.get_mut(&owner) else {
            debug_assert!(false, "in-flight block owned by unknown peer {owner}");
            return true;
        };
        let Some(pos) = peer.blocks_in_flight.iter().position(|q| q.hash == *hash) else {
            debug_assert!(false, "in-flight index and peer list disagree");
            return true;
        };
        if pos == 0 {
            // Timeouts for the rest of the queue are measured from now.
            peer.downloading_since = peer.downloading_since.max(now);
        }
        if let Some(queued) = peer.blocks_in_flight.remove(pos) {
            if queued.had_valid_header {
                peer.blocks_in_flight_valid_headers -= 1;
                if peer.blocks_in_flight_valid_headers == 0 {
                    self.peers_with_validated_downloads -= 1;
                }
            }
        }
        peer.stalling_since = None;
        true
    }

    /// Resolve the last unknown block the peer announced, if we now know it.
    pub fn process_block_availability(&mut self, chain: &dyn ChainIndex, id: NodeId) {
        let Some(peer) = self.peers.get_mut(&id) else { return };
        let Some(unknown) = peer.last_unknown_block else { return };
        let Some(entry) = chain.lookup(&unknown) else { return };
        if entry.chain_work == 0 {
            return;
        }
        let better = match peer.best_known_block.and_then(|h| chain.lookup(&h)) {
            Some(best) => entry.chain_work >= best.chain_work,
            None => true,
        };
        if better {
            peer.best_known_block = Some(entry.hash);
        }
        peer.last_unknown_block = None;
    }

    /// Note that the peer has `hash`. Unknown hashes are remembered until
    /// their header arrives.
    pub fn update_block_availability(&mut self, chain: &dyn ChainIndex, id: NodeId, hash: Hash256) {
        self.process_block_availability(chain, id);
        let Some(peer) = self.peers.get_mut(&id) else { return };
        match chain.lookup(&hash).filter(|e| e.chain_work > 0) {
            Some(entry) => {
                let better = match peer.best_known_block.and_then(|h| chain.lookup(&h)) {
                    Some(best) => entry.chain_work >= best.chain_work,
                    None => true,
                };
                if better {
                    peer.best_known_block = Some(entry.hash);
                }
            }
            None => peer.last_unknown_block = Some(hash),
        }
    }

    /// Choose up to `count` blocks to request from `id`.
    ///
    /// Also returns the peer blocking progress, when nothing could be chosen
    /// because the next needed block is in flight elsewhere and the window
    /// is exhausted.
    pub fn find_next_blocks_to_download(
        &mut self,
        chain: &dyn ChainIndex,
        id: NodeId,
        count: usize,
    ) -> (Vec<BlockIndexEntry>, Option<NodeId>) {
        let mut blocks = Vec::new();
        if count == 0 {
            return (blocks, None);
        }
        self.process_block_availability(chain, id);

        let Some(peer) = self.peers.get(&id) else {
            return (blocks, None);
        };
        let Some(best_known) = peer.best_known_block.and_then(|h| chain.lookup(&h)) else {
            return (blocks, None);
        };
        let tip = chain.active_tip();
        if best_known.chain_work < tip.chain_work || best_known.chain_work < chain.min_chain_work() {
            return (blocks, None);
        }

        let guess = match peer.last_common_block.and_then(|h| chain.lookup(&h)) {
            Some(entry) => Some(entry),
            None => chain.active_at(best_known.height.min(tip.height)),
        };
        let Some(last_common) = guess.and_then(|g| chain.last_common_ancestor(&g, &best_known)) else {
            return (blocks, None);
        };
        let mut last_common_hash = last_common.hash;
        if last_common.hash == best_known.hash {
            self.set_last_common(id, last_common_hash);
            return (blocks, None);
        }

        let window_end = last_common.height + BLOCK_DOWNLOAD_WINDOW;
        let max_height = best_known.height.min(window_end + 1);
        let mut walk_height = last_common.height;
        let mut waiting_for: Option<NodeId> = None;
        // Only a gap-free prefix may advance the common-block watermark.
        let mut contiguous = true;
        let mut staller = None;

        'walk: while walk_height < max_height {
            let remaining = count.saturating_sub(blocks.len()) as u64;
            let to_fetch = (max_height - walk_height).min(remaining.max(FETCH_BATCH));
            let Some(end) = chain.ancestor(&best_known, walk_height + to_fetch) else {
                break;
            };
            let mut batch = Vec::with_capacity(to_fetch as usize);
            let mut cursor = end;
            loop {
                let prev = cursor.prev_hash();
                let height = cursor.height;
                batch.push(cursor);
                if height <= walk_height + 1 {
                    break;
                }
                let Some(parent) = chain.lookup(&prev) else { break 'walk };
                cursor = parent;
            }
            batch.reverse();
            walk_height += to_fetch;

            for entry in batch {
                if !entry.is_valid(BlockValidity::Tree) {
                    // The peer is on a chain we consider invalid.
                    self.set_last_common(id, last_common_hash);
                    return (Vec::new(), None);
                }
                if entry.have_data() || chain.contains(&entry) {
                    if contiguous {
                        last_common_hash = entry.hash;
                    }
                } else if let Some(owner) = self.blocks_in_flight.get(&entry.hash) {
                    contiguous = false;
                    if waiting_for.is_none() {
                        waiting_for = Some(*owner);
                    }
                } else {
                    contiguous = false;
                    if entry.height > window_end {
                        if blocks.is_empty() && waiting_for != Some(id) {
                            staller = waiting_for;
                        }
                        break 'walk;
                    }
                    blocks.push(entry);
                    if blocks.len() == count {
                        break 'walk;
                    }
                }
            }
        }
        self.set_last_common(id, last_common_hash);
        (blocks, staller)
    }

    fn set_last_common(&mut self, id: NodeId, hash: Hash256) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_common_block = Some(hash);
        }
    }
}
