//! Serving data peers ask for: getdata, getblocks, getheaders, getblocktxn
//! and mempool requests.

use std::time::Duration;

use tracing::{debug, warn};
use weir_core::constants::{MAX_HEADERS_RESULTS, MAX_INV_SZ, MAX_LOCATOR_SZ};
use weir_core::types::{Block, BlockIndexEntry, BlockValidity};

use crate::compact::{BlockTransactions, BlockTransactionsRequest, CompactBlock};
use crate::manager::{ManagerState, PeerManager};
use crate::peer::NodeId;
use crate::protocol::{Inv, InvKind, LocatorRequest, MerkleBlock, Message};

/// Blocks this far behind the tip are only served compact within this depth.
pub const MAX_CMPCTBLOCK_DEPTH: u64 = 5;
/// Deeper `getblocktxn` requests are answered with the full block.
pub const MAX_BLOCKTXN_DEPTH: u64 = 10;
/// Blocks announced per `getblocks` answer.
const MAX_GETBLOCKS_RESULTS: usize = 500;
/// Blocks off the active chain older than this are not served.
const STALE_RELAY_AGE_LIMIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Blocks older than this count against the historical upload budget.
const HISTORICAL_BLOCK_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl PeerManager {
    pub(crate) fn on_getdata(&self, st: &mut ManagerState, id: NodeId, invs: Vec<Inv>) {
        if invs.len() > MAX_INV_SZ {
            self.misbehaving(st, id, 20, "oversized-getdata");
            return;
        }
        debug!(peer = id, count = invs.len(), "received getdata");
        let Some(peer) = st.store.get_mut(id) else { return };
        peer.getdata_queue.extend(invs);
        self.process_getdata_queue(st, id);
    }

    /// Serve queued transaction and proof requests, then at most one block.
    pub(crate) fn process_getdata_queue(&self, st: &mut ManagerState, id: NodeId) {
        let mut not_found = Vec::new();
        loop {
            let Some(peer) = st.store.get_mut(id) else { return };
            if peer.disconnect {
                break;
            }
            let Some(inv) = peer.getdata_queue.front().copied() else { break };
            if inv.is_block_kind() {
                break;
            }
            peer.getdata_queue.pop_front();
            let last_mempool_request = peer.inventory.last_mempool_request;
            match inv.kind {
                InvKind::Tx => {
                    // Pool entries are only revealed to peers that saw them through `mempool`.
                    let tx = st.relay_cache.get(&inv.hash).cloned().or_else(|| {
                        self.mempool
                            .info(&inv.hash)
                            .filter(|info| last_mempool_request.is_some_and(|t| info.time <= t))
                            .map(|info| info.tx)
                    });
                    match tx {
                        Some(tx) => self.connman.push_message(id, Message::Tx(tx)),
                        None => not_found.push(inv),
                    }
                }
                InvKind::DsProof => match self.mempool.dsproof_get(&inv.hash) {
                    Some(proof) => self.connman.push_message(id, Message::DsProof(proof)),
                    None => not_found.push(inv),
                },
                _ => debug!(peer = id, kind = ?inv.kind, "dropping unservable getdata entry"),
            }
        }

        let block_inv = match st.store.get_mut(id) {
            Some(peer) if !peer.disconnect => match peer.getdata_queue.front() {
                Some(inv) if inv.is_block_kind() => peer.getdata_queue.pop_front(),
                _ => None,
            },
            _ => None,
        };
        if let Some(inv) = block_inv {
            self.process_get_block_data(st, id, inv);
        }

        if !not_found.is_empty() {
            // Lets the peer ask someone else without waiting for a timeout.
            self.connman.push_message(id, Message::NotFound(not_found));
        }
    }

    fn process_get_block_data(&self, st: &mut ManagerState, id: NodeId, inv: Inv) {
        let Some(entry) = self.chain.lookup(&inv.hash) else {
            debug!(peer = id, hash = %inv.hash, "getdata for unknown block");
            return;
        };
        if !self.block_request_allowed(&entry) {
            debug!(peer = id, hash = %inv.hash, "ignoring request for old block not on the active chain");
            return;
        }
        let Some(peer) = st.store.get(id) else { return };
        let noban = peer.permissions.noban;
        let best = self.chain.best_header();
        let historical = best.time().saturating_sub(entry.time()) > HISTORICAL_BLOCK_AGE.as_secs();
        if self.connman.outbound_target_reached(true)
            && (historical || inv.kind == InvKind::FilteredBlock)
            && !noban
        {
            debug!(peer = id, "historical block serving limit reached");
            self.disconnect_peer(st, id, "historical upload limit");
            return;
        }
        if !entry.have_data() {
            return;
        }

        let recent = self.recent.lock().clone().filter(|r| r.hash == entry.hash);
        let block: Block = match &recent {
            Some(r) => Block::clone(&r.block),
            None => match self.chain.read_block(&entry.hash) {
                Ok(block) => block,
                Err(err) => {
                    warn!(peer = id, hash = %entry.hash, %err, "cannot load block to serve");
                    return;
                }
            },
        };

        match inv.kind {
            InvKind::Block => self.connman.push_message(id, Message::Block(block)),
            InvKind::FilteredBlock => {
                let Some(peer) = st.store.get_mut(id) else { return };
                let Some(filter) = peer.inventory.bloom.as_mut() else { return };
                let matched: Vec<(u32, _)> = block
                    .transactions
                    .iter()
                    .enumerate()
                    .filter(|(_, tx)| filter.is_relevant_and_update(tx))
                    .map(|(i, tx)| (i as u32, tx.txid()))
                    .collect();
                self.connman.push_message(
                    id,
                    Message::MerkleBlock(MerkleBlock {
                        header: block.header.clone(),
                        total_txs: block.transactions.len() as u32,
                        matched: matched.clone(),
                    }),
                );
                // The peer cannot know whether it has them, so send every match.
                for (index, _) in matched {
                    if let Some(tx) = block.transactions.get(index as usize) {
                        self.connman.push_message(id, Message::Tx(tx.clone()));
                    }
                }
            }
            InvKind::CmpctBlock => {
                let tip = self.chain.active_tip();
                if self.can_direct_fetch() && entry.height + MAX_CMPCTBLOCK_DEPTH >= tip.height {
                    let compact = match recent {
                        Some(r) => CompactBlock::clone(&r.compact),
                        None => CompactBlock::from_block(&block, st.nonzero_nonce()),
                    };
                    self.connman.push_message(id, Message::CmpctBlock(compact));
                } else {
                    self.connman.push_message(id, Message::Block(block));
                }
            }
            _ => {}
        }

        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.inventory.hash_continue == Some(inv.hash) {
            // Bypass the announcement filter so the peer learns it should keep asking.
            let tip = self.chain.active_tip();
            self.connman.push_message(id, Message::Inv(vec![Inv::block(tip.hash)]));
            peer.inventory.hash_continue = None;
        }
    }

    /// Whether a block may be handed out. Active-chain blocks always are;
    /// others only when fully validated and recent, so a node cannot be
    /// fingerprinted by the stale branches it knows.
    pub(crate) fn block_request_allowed(&self, entry: &BlockIndexEntry) -> bool {
        if self.chain.contains(entry) {
            return true;
        }
        let best = self.chain.best_header();
        let limit = STALE_RELAY_AGE_LIMIT.as_secs();
        let spacing = u128::from(self.chain.target_spacing().as_secs().max(1));
        let per_block = best.header.work().max(1);
        let equivalent_time = best.chain_work.saturating_sub(entry.chain_work) / per_block * spacing;
        entry.is_valid(BlockValidity::Scripts)
            && best.time().saturating_sub(entry.time()) < limit
            && equivalent_time < u128::from(limit)
    }

    pub(crate) fn on_getblocks(&self, st: &mut ManagerState, id: NodeId, req: LocatorRequest) {
        if req.locator.len() > MAX_LOCATOR_SZ {
            debug!(peer = id, size = req.locator.len(), "getblocks locator too large");
            self.disconnect_peer(st, id, "oversized locator");
            return;
        }
        let fork = self.chain.find_fork(&req.locator);
        let mut cursor = fork.as_ref().and_then(|f| self.chain.next_in_active(f));
        let mut hashes = Vec::new();
        let mut hash_continue = None;
        while let Some(entry) = cursor {
            if entry.hash == req.hash_stop {
                break;
            }
            hashes.push(entry.hash);
            if hashes.len() == MAX_GETBLOCKS_RESULTS {
                // When the peer fetches this one, tell it to ask for more.
                hash_continue = Some(entry.hash);
                break;
            }
            cursor = self.chain.next_in_active(&entry);
        }
        debug!(
            peer = id,
            from = fork.map(|f| f.height),
            count = hashes.len(),
            "answering getblocks"
        );
        let Some(peer) = st.store.get_mut(id) else { return };
        peer.inventory.blocks_to_send.extend(hashes);
        if hash_continue.is_some() {
            peer.inventory.hash_continue = hash_continue;
        }
    }

    pub(crate) fn on_getheaders(&self, st: &mut ManagerState, id: NodeId, req: LocatorRequest) {
        if req.locator.len() > MAX_LOCATOR_SZ {
            debug!(peer = id, size = req.locator.len(), "getheaders locator too large");
            self.disconnect_peer(st, id, "oversized locator");
            return;
        }
        let Some(peer) = st.store.get(id) else { return };
        if self.chain.is_initial_block_download() && !peer.permissions.noban {
            debug!(peer = id, "ignoring getheaders during initial block download");
            return;
        }

        let mut headers = Vec::new();
        let mut last = None;
        if req.locator.is_empty() {
            let Some(entry) = self.chain.lookup(&req.hash_stop) else { return };
            if !self.block_request_allowed(&entry) {
                debug!(peer = id, hash = %entry.hash, "ignoring getheaders for old block not on the active chain");
                return;
            }
            headers.push(entry.header.clone());
            last = Some(entry.hash);
        } else {
            let fork = self.chain.find_fork(&req.locator);
            let mut cursor = fork.as_ref().and_then(|f| self.chain.next_in_active(f));
            while let Some(entry) = cursor {
                headers.push(entry.header.clone());
                last = Some(entry.hash);
                if headers.len() >= MAX_HEADERS_RESULTS || entry.hash == req.hash_stop {
                    break;
                }
                cursor = self.chain.next_in_active(&entry);
            }
        }

        debug!(peer = id, count = headers.len(), "answering getheaders");
        let Some(peer) = st.store.get_mut(id) else { return };
        // The peer now knows at least this much of our chain.
        peer.best_header_sent = Some(last.unwrap_or_else(|| self.chain.active_tip().hash));
        self.connman.push_message(id, Message::Headers(headers));
    }

    pub(crate) fn on_getblocktxn(&self, st: &mut ManagerState, id: NodeId, req: BlockTransactionsRequest) {
        let recent = self.recent.lock().clone().filter(|r| r.hash == req.block_hash);
        if let Some(recent) = recent {
            self.send_block_transactions(st, id, &recent.block, &req);
            return;
        }

        let Some(entry) = self.chain.lookup(&req.block_hash).filter(BlockIndexEntry::have_data) else {
            debug!(peer = id, hash = %req.block_hash, "getblocktxn for block we do not have");
            return;
        };
        let tip = self.chain.active_tip();
        if entry.height + MAX_BLOCKTXN_DEPTH < tip.height {
            debug!(peer = id, hash = %entry.hash, "serving deep getblocktxn as a full block");
            let Some(peer) = st.store.get_mut(id) else { return };
            peer.getdata_queue.push_back(Inv::new(InvKind::Block, entry.hash));
            self.process_getdata_queue(st, id);
            return;
        }
        match self.chain.read_block(&entry.hash) {
            Ok(block) => self.send_block_transactions(st, id, &block, &req),
            Err(err) => warn!(peer = id, hash = %entry.hash, %err, "cannot load block for getblocktxn"),
        }
    }

    fn send_block_transactions(
        &self,
        st: &mut ManagerState,
        id: NodeId,
        block: &Block,
        req: &BlockTransactionsRequest,
    ) {
        match BlockTransactions::answer(block, req) {
            Some(resp) => self.connman.push_message(id, Message::BlockTxn(resp)),
            None => self.misbehaving(st, id, 100, "out-of-bound-tx-index"),
        }
    }

    pub(crate) fn on_mempool(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get(id) else { return };
        let permissions = peer.permissions;
        if !self.bloom_offered(peer) && !permissions.mempool {
            if !permissions.noban {
                debug!(peer = id, "mempool request without bloom service");
                self.disconnect_peer(st, id, "mempool request without bloom service");
            }
            return;
        }
        if self.connman.outbound_target_reached(false) && !permissions.mempool {
            if !permissions.noban {
                debug!(peer = id, "mempool request with upload target reached");
                self.disconnect_peer(st, id, "upload target reached");
            }
            return;
        }
        if let Some(peer) = st.store.get_mut(id) {
            peer.inventory.send_mempool = true;
        }
    }
}
