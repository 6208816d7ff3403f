//! Header and block announcements.
//!
//! Headers drive block download: a connecting batch updates what the peer
//! is known to have, and when our tip is recent the missing blocks are
//! fetched straight away. Compact blocks are reconstructed from the mempool
//! where possible, asking only for the transactions we lack.

use std::time::Duration;

use tracing::{debug, info};
use weir_core::constants::MAX_HEADERS_RESULTS;
use weir_core::types::{Block, BlockHeader, BlockIndexEntry, BlockValidity, Hash256};
use weir_core::validation::HeaderRejectKind;

use crate::block_download::MAX_BLOCKS_IN_TRANSIT_PER_PEER;
use crate::compact::{BlockTransactions, BlockTransactionsRequest, CompactBlock, PartialBlock, ReadStatus};
use crate::manager::{ManagerState, PeerManager};
use crate::peer::NodeId;
use crate::protocol::{Inv, InvKind, LocatorRequest, Message, SendCmpct};

/// Batches shorter than this that do not connect are treated as announcements.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
/// Every this many unconnecting announcements in a row costs points.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;
/// Outbound peers exempt from the chain-sync timeout.
pub const MAX_OUTBOUND_PEERS_TO_PROTECT: usize = 4;
/// Tip age, in target spacings, up to which announced blocks are fetched directly.
const DIRECT_FETCH_SPACINGS: u32 = 20;

impl PeerManager {
    /// Our tip is recent enough to fetch announced blocks immediately
    /// instead of leaving them to parallel download.
    pub(crate) fn can_direct_fetch(&self) -> bool {
        let tip = self.chain.active_tip();
        Duration::from_secs(tip.time()) + self.chain.target_spacing() * DIRECT_FETCH_SPACINGS > self.clock.now()
    }

    fn push_getheaders(&self, id: NodeId, from: &BlockIndexEntry) {
        self.connman.push_message(
            id,
            Message::GetHeaders(LocatorRequest {
                locator: self.chain.locator(from),
                hash_stop: Hash256::ZERO,
            }),
        );
    }

    pub(crate) fn on_headers(&self, st: &mut ManagerState, id: NodeId, headers: Vec<BlockHeader>) {
        if headers.len() > MAX_HEADERS_RESULTS {
            self.misbehaving(st, id, 20, "too-many-headers");
            return;
        }
        let Some(peer) = st.store.get(id) else { return };
        // Outbound slots are too valuable to spend on peers following a chain we know is invalid.
        let punish = !peer.is_inbound() && !peer.is_manual();
        self.process_headers(st, id, &headers, punish);
    }

    pub(crate) fn process_headers(&self, st: &mut ManagerState, id: NodeId, headers: &[BlockHeader], punish: bool) {
        let (Some(first), Some(last_header)) = (headers.first(), headers.last()) else {
            return;
        };
        let now = self.clock.now();

        if self.chain.lookup(&first.prev_hash).is_none() && headers.len() < MAX_BLOCKS_TO_ANNOUNCE {
            let best_header = self.chain.best_header();
            self.push_getheaders(id, &best_header);
            let last_hash = last_header.hash();
            let Some(peer) = st.store.get_mut(id) else { return };
            peer.unconnecting_headers += 1;
            let streak = peer.unconnecting_headers;
            debug!(
                peer = id,
                first = %first.hash(),
                prev = %first.prev_hash,
                height = best_header.height,
                streak,
                "received unconnecting headers, sending getheaders"
            );
            // Remember the tip so its availability resolves once the gap fills.
            st.store.update_block_availability(&*self.chain, id, last_hash);
            if streak % MAX_UNCONNECTING_HEADERS == 0 {
                self.misbehaving(st, id, 20, "unconnecting-headers");
            }
            return;
        }

        let mut prev: Option<Hash256> = None;
        for header in headers {
            if prev.is_some_and(|p| header.prev_hash != p) {
                self.misbehaving(st, id, 20, "disconnected-header");
                return;
            }
            prev = Some(header.hash());
        }

        let last_hash = last_header.hash();
        let received_new = self.chain.lookup(&last_hash).is_none();

        let last = match self.blocks.process_new_headers(headers) {
            Ok(entry) => entry,
            Err(rejection) => {
                debug!(peer = id, %rejection, "invalid headers");
                if rejection.severity > 0 && rejection.kind != HeaderRejectKind::TimeTooNew {
                    self.misbehaving(st, id, rejection.severity, &rejection.reason);
                }
                let known_invalid = rejection.kind == HeaderRejectKind::CachedInvalid
                    || rejection.first_invalid.and_then(|h| self.chain.lookup(&h)).is_some();
                if punish && known_invalid {
                    self.disconnect_peer(st, id, "headers on a known-invalid chain");
                }
                return;
            }
        };

        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.unconnecting_headers > 0 {
            debug!(peer = id, streak = peer.unconnecting_headers, "resetting unconnecting headers");
        }
        peer.unconnecting_headers = 0;
        st.store.update_block_availability(&*self.chain, id, last.hash);

        let tip = self.chain.active_tip();
        if received_new && last.chain_work > tip.chain_work {
            if let Some(peer) = st.store.get_mut(id) {
                peer.last_block_announcement = now;
            }
        }

        if headers.len() == MAX_HEADERS_RESULTS {
            // The peer probably has more; ask straight away.
            debug!(peer = id, height = last.height, "more headers available, continuing");
            self.push_getheaders(id, &last);
        }

        if self.can_direct_fetch() && last.is_valid(BlockValidity::Tree) && tip.chain_work <= last.chain_work {
            self.direct_fetch(st, id, &last, now);
        }

        let ibd = self.chain.is_initial_block_download();
        let min_work = self.chain.min_chain_work();
        let Some(peer) = st.store.get(id) else { return };
        let best_work = peer
            .best_known_block
            .and_then(|h| self.chain.lookup(&h))
            .map(|e| e.chain_work);
        let candidate = peer.is_outbound_disconnection_candidate();

        if ibd && headers.len() != MAX_HEADERS_RESULTS {
            // No more headers to give and still short of the minimum work.
            if candidate && best_work.is_some_and(|w| w < min_work) {
                info!(peer = id, "outbound peer has insufficient chain work, disconnecting");
                self.disconnect_peer(st, id, "low-work chain during initial sync");
                return;
            }
        }

        let Some(peer) = st.store.get(id) else { return };
        if !peer.disconnect
            && candidate
            && !peer.chain_sync.protect
            && best_work.is_some_and(|w| w >= tip.chain_work)
            && st.store.outbound_peers_with_protect() < MAX_OUTBOUND_PEERS_TO_PROTECT
        {
            debug!(peer = id, "protecting outbound peer from chain-sync eviction");
            st.store.set_protect(id);
        }
    }

    /// Request the blocks between our active chain and `last` that nobody
    /// is fetching yet, oldest first.
    fn direct_fetch(&self, st: &mut ManagerState, id: NodeId, last: &BlockIndexEntry, now: Duration) {
        let mut to_fetch = Vec::new();
        let mut cursor = Some(last.clone());
        let mut connects = false;
        while let Some(entry) = cursor {
            if self.chain.contains(&entry) {
                connects = true;
                break;
            }
            if to_fetch.len() > MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            let prev = entry.prev_hash();
            if !entry.have_data() && !st.store.blocks_in_flight.contains_key(&entry.hash) {
                to_fetch.push(entry);
            }
            cursor = self.chain.lookup(&prev);
        }
        if !connects {
            debug!(peer = id, height = last.height, "large reorg, not direct fetching");
            return;
        }

        let Some(peer) = st.store.get(id) else { return };
        let supports_cmpct = peer.supports_desired_cmpct_version;
        let mut requests = Vec::new();
        for entry in to_fetch.iter().rev() {
            let in_flight = st.store.get(id).map_or(0, |p| p.blocks_in_flight_count());
            if in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
                break;
            }
            st.store.mark_block_in_flight(id, entry.hash, true, now);
            debug!(peer = id, hash = %entry.hash, height = entry.height, "requesting block");
            requests.push(Inv::block(entry.hash));
        }
        if requests.is_empty() {
            return;
        }
        if requests.len() > 1 {
            debug!(peer = id, count = requests.len(), tip = %last.hash, "downloading blocks via headers direct fetch");
        }
        let parent_valid = self
            .chain
            .lookup(&last.prev_hash())
            .is_some_and(|p| p.is_valid(BlockValidity::Chain));
        if requests.len() == 1 && supports_cmpct && st.store.blocks_in_flight_total() == 1 && parent_valid {
            // Most of it is likely in our mempool already.
            requests[0] = Inv::new(InvKind::CmpctBlock, requests[0].hash);
        }
        self.connman.push_message(id, Message::GetData(requests));
    }

    pub(crate) fn on_cmpctblock(&self, st: &mut ManagerState, id: NodeId, cmpct: CompactBlock) {
        let now = self.clock.now();
        let hash = cmpct.block_hash();

        if self.chain.lookup(&cmpct.header.prev_hash).is_none() {
            // Ask for the gap instead of failing the header.
            if !self.chain.is_initial_block_download() {
                let best_header = self.chain.best_header();
                self.push_getheaders(id, &best_header);
            }
            return;
        }

        let received_new = self.chain.lookup(&hash).is_none();
        let entry = match self.blocks.process_new_headers(std::slice::from_ref(&cmpct.header)) {
            Ok(entry) => entry,
            Err(rejection) => {
                debug!(peer = id, %rejection, "invalid header via cmpctblock");
                // Compact blocks may be relayed before full validation; a cached failure is no offence.
                if rejection.severity > 0 && rejection.kind != HeaderRejectKind::CachedInvalid {
                    self.misbehaving(st, id, rejection.severity, &rejection.reason);
                }
                return;
            }
        };

        st.store.update_block_availability(&*self.chain, id, hash);
        let tip = self.chain.active_tip();
        if received_new && entry.chain_work > tip.chain_work {
            if let Some(peer) = st.store.get_mut(id) {
                peer.last_block_announcement = now;
            }
        }

        let owner = st.store.in_flight_owner(&hash);
        let in_flight = owner.is_some();
        let in_flight_from_peer = owner == Some(id);

        if entry.have_data() {
            return;
        }

        if entry.chain_work <= tip.chain_work || entry.is_valid(BlockValidity::Transactions) {
            // Not a tip candidate, the mempool will not help; fetch normally if we asked.
            if in_flight {
                self.connman.push_message(id, Message::GetData(vec![Inv::block(hash)]));
            }
            return;
        }

        if !in_flight && !self.can_direct_fetch() {
            return;
        }

        let mut reconstructed: Option<Block> = None;
        if entry.height <= tip.height + 2 {
            let peer_in_flight = st.store.get(id).map_or(0, |p| p.blocks_in_flight_count());
            if (!in_flight && peer_in_flight < MAX_BLOCKS_IN_TRANSIT_PER_PEER) || in_flight_from_peer {
                let Some((is_new, has_partial)) = st
                    .store
                    .mark_block_in_flight(id, hash, true, now)
                    .map(|(new, queued)| (new, queued.partial.is_some()))
                else {
                    return;
                };
                if !is_new && has_partial {
                    debug!(peer = id, %hash, "compact block already being reconstructed");
                    return;
                }

                let extra = self.orphans.lock().extra_transactions();
                match PartialBlock::init(&cmpct, &*self.mempool, &extra, self.config.max_block_size()) {
                    Ok(partial) => {
                        let missing = partial.missing();
                        attach_partial(st, id, hash, partial);
                        if missing.is_empty() {
                            self.on_blocktxn(
                                st,
                                id,
                                BlockTransactions {
                                    block_hash: hash,
                                    txs: Vec::new(),
                                },
                            );
                        } else {
                            debug!(peer = id, %hash, missing = missing.len(), "requesting missing compact block transactions");
                            self.connman.push_message(
                                id,
                                Message::GetBlockTxn(BlockTransactionsRequest {
                                    block_hash: hash,
                                    indexes: missing,
                                }),
                            );
                        }
                    }
                    Err(ReadStatus::Invalid) => {
                        st.store.mark_block_received(&hash, now);
                        self.misbehaving(st, id, 100, "invalid-cmpctblk");
                    }
                    Err(_) => {
                        // Short-id collision or similar; nobody's fault.
                        self.connman.push_message(id, Message::GetData(vec![Inv::block(hash)]));
                    }
                }
                return;
            }

            // In flight elsewhere or this peer is saturated. Try anyway, without
            // touching the in-flight index; a duplicate submit is harmless.
            let extra = self.orphans.lock().extra_transactions();
            let Ok(partial) = PartialBlock::init(&cmpct, &*self.mempool, &extra, self.config.max_block_size()) else {
                return;
            };
            if !partial.missing().is_empty() {
                return;
            }
            match partial.fill(Vec::new()) {
                Ok(block) => reconstructed = Some(block),
                Err(_) => return,
            }
        } else {
            if in_flight {
                // Too far ahead for the mempool to help.
                self.connman.push_message(id, Message::GetData(vec![Inv::block(hash)]));
                return;
            }
            // An announcement far from our tip is just a header. Compact blocks
            // may be relayed before full validation, so duplicates cost nothing.
            self.process_headers(st, id, std::slice::from_ref(&cmpct.header), false);
            return;
        }

        if let Some(block) = reconstructed {
            debug!(peer = id, %hash, "reconstructed compact block without a round trip");
            self.process_block(st, Some((id, false)), &block, true);
            let validated = self
                .chain
                .lookup(&hash)
                .is_some_and(|e| e.is_valid(BlockValidity::Transactions));
            if validated {
                st.store.mark_block_received(&hash, now);
            }
        }
    }

    pub(crate) fn on_blocktxn(&self, st: &mut ManagerState, id: NodeId, resp: BlockTransactions) {
        let now = self.clock.now();
        let hash = resp.block_hash;
        let partial = if st.store.in_flight_owner(&hash) == Some(id) {
            st.store
                .get(id)
                .and_then(|p| p.blocks_in_flight.iter().find(|q| q.hash == hash))
                .and_then(|q| q.partial.clone())
        } else {
            None
        };
        let Some(partial) = partial else {
            debug!(peer = id, %hash, "ignoring blocktxn for a block we are not reconstructing");
            return;
        };

        match partial.fill(resp.txs) {
            Ok(block) => {
                st.store.mark_block_received(&hash, now);
                // Compact blocks may be relayed before validation, so the sender is not punished.
                self.process_block(st, Some((id, false)), &block, true);
            }
            Err(ReadStatus::Invalid) => {
                st.store.mark_block_received(&hash, now);
                self.misbehaving(st, id, 100, "invalid-cmpctblk-txns");
            }
            Err(_) => {
                debug!(peer = id, %hash, "compact block reconstruction failed, requesting full block");
                self.connman.push_message(id, Message::GetData(vec![Inv::block(hash)]));
            }
        }
    }

    pub(crate) fn on_block(&self, st: &mut ManagerState, id: NodeId, block: Block) {
        let now = self.clock.now();
        let hash = block.hash();
        let Some(peer) = st.store.get(id) else { return };
        let noban = peer.permissions.noban;
        debug!(peer = id, %hash, "received block");
        let requested = st.store.mark_block_received(&hash, now);
        let force = requested || (noban && !self.chain.is_initial_block_download());
        self.process_block(st, Some((id, true)), &block, force);
    }

    pub(crate) fn on_sendheaders(&self, st: &mut ManagerState, id: NodeId) {
        if let Some(peer) = st.store.get_mut(id) {
            peer.prefer_headers = true;
        }
    }

    pub(crate) fn on_sendcmpct(&self, st: &mut ManagerState, id: NodeId, sc: SendCmpct) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if sc.version != 1 {
            debug!(peer = id, version = sc.version, "ignoring unsupported compact block version");
            return;
        }
        peer.provides_header_and_ids = true;
        peer.supports_desired_cmpct_version = true;
        peer.prefer_header_and_ids = sc.announce;
    }
}

fn attach_partial(st: &mut ManagerState, id: NodeId, hash: Hash256, partial: PartialBlock) {
    let queued = st
        .store
        .get_mut(id)
        .and_then(|p| p.blocks_in_flight.iter_mut().find(|q| q.hash == hash));
    if let Some(queued) = queued {
        queued.partial = Some(partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Harness, T0};
    use crate::peer::ConnectionType;
    use weir_core::memory::{make_block, make_chain, make_tx};
    use weir_core::traits::{BlockProcessor, ChainIndex, TxMempool};
    use weir_core::types::OutPoint;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn headers_of(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    fn requested(sent: &[Message]) -> Vec<Inv> {
        sent.iter()
            .filter_map(|m| match m {
                Message::GetData(invs) => Some(invs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn enable_cmpct(h: &Harness, id: NodeId) {
        h.send(
            id,
            Message::SendCmpct(SendCmpct {
                announce: false,
                version: 1,
            }),
        );
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Three connecting headers near a recent tip fetch all three blocks, oldest first.
    #[test]
    fn direct_fetch_oldest_first() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), 3, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        let invs = requested(&h.sent(1));
        let expected: Vec<Inv> = blocks.iter().map(|b| Inv::block(b.hash())).collect();
        assert_eq!(invs, expected);
        assert_eq!(h.manager.blocks_in_flight(), 3);
    }

    /// A single fetched block is asked for compact when the peer supports it.
    #[test]
    fn single_fetch_uses_compact() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        enable_cmpct(&h, 1);
        let blocks = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        assert_eq!(
            requested(&h.sent(1)),
            vec![Inv::new(InvKind::CmpctBlock, blocks[0].hash())]
        );
    }

    /// Unconnecting announcements ask for headers and cost points every tenth time.
    #[test]
    fn unconnecting_headers_streak() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        for i in 0..MAX_UNCONNECTING_HEADERS as u64 {
            let orphan = make_block(Hash256([9; 32]), T0 + i, Vec::new());
            h.send(1, Message::Headers(vec![orphan.header]));
            assert!(matches!(h.sent(1).as_slice(), [Message::GetHeaders(_)]));
        }
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 20);
    }

    /// A batch that is not a chain is rejected with a penalty and nothing is stored.
    #[test]
    fn non_contiguous_batch_rejected() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let blocks = make_chain(h.chain.genesis_hash(), 3, T0 + 1, 1);
        h.send(1, Message::Headers(vec![blocks[0].header.clone(), blocks[2].header.clone()]));
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 20);
        assert!(h.chain.lookup(&blocks[0].hash()).is_none());
    }

    /// Outbound peers serving a header we know is invalid are dropped; inbound ones are not.
    #[test]
    fn known_invalid_header_disconnects_outbound() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.connect(2, ConnectionType::Outbound);
        let bad = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&bad)));
        h.chain.mark_failed(&bad[0].hash());

        h.send(1, Message::Headers(headers_of(&bad)));
        assert!(!h.connman.is_disconnected(1));
        h.send(2, Message::Headers(headers_of(&bad)));
        assert!(h.connman.is_disconnected(2));
    }

    /// Headers from the future are refused without penalty or disconnection.
    #[test]
    fn future_header_not_punished() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let future = make_block(h.chain.genesis_hash(), T0 + 10 * 60 * 60, Vec::new());
        h.send(1, Message::Headers(vec![future.header]));
        assert!(!h.connman.is_disconnected(1));
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 0);
    }

    /// A full batch is followed by a getheaders from its last header.
    #[test]
    fn full_batch_continues() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), MAX_HEADERS_RESULTS, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        let sent = h.sent(1);
        let last = blocks[MAX_HEADERS_RESULTS - 1].hash();
        assert!(matches!(sent.first(), Some(Message::GetHeaders(req)) if req.locator[0] == last));
        // Too far from our chain to fetch directly.
        assert!(requested(&sent).is_empty());
    }

    /// During initial sync, an outbound peer with too little work is dropped.
    #[test]
    fn low_work_outbound_dropped_in_ibd() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.chain.set_initial_block_download(Some(true));
        h.chain.set_min_chain_work(u128::MAX);
        let blocks = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        assert!(h.connman.is_disconnected(1));
    }

    /// Outbound peers at or above our tip get protected from eviction.
    #[test]
    fn caught_up_outbound_protected() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.connect(2, ConnectionType::Inbound);
        let blocks = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        h.send(2, Message::Headers(headers_of(&blocks)));
        let (outbound, inbound) = h.manager.with_state(|st| {
            (
                st.store.get(1).unwrap().chain_sync.protect,
                st.store.get(2).unwrap().chain_sync.protect,
            )
        });
        assert!(outbound);
        assert!(!inbound);
    }

    /// A compact block whose transactions are all in our mempool connects at once.
    #[test]
    fn compact_block_from_mempool() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let op = OutPoint::new(Hash256([3; 32]), 0);
        h.chain.fund(op);
        let tx = make_tx(&[op], 1);
        h.chain.accept(&tx, false, None).unwrap();

        let block = make_block(h.chain.genesis_hash(), T0 + 1, vec![tx]);
        h.send(1, Message::CmpctBlock(CompactBlock::from_block(&block, 11)));
        assert_eq!(h.chain.height(), 1);
        assert_eq!(h.manager.blocks_in_flight(), 0);
    }

    /// A compact block far ahead of our tip is handled as a bare header and
    /// costs its outbound sender nothing.
    #[test]
    fn distant_compact_block_handled_as_header() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), 4, T0 + 1, 1);
        h.chain.process_new_headers(&headers_of(&blocks[..3])).unwrap();

        h.send(1, Message::CmpctBlock(CompactBlock::from_block(&blocks[3], 13)));
        assert!(!h.connman.is_disconnected(1));
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 0);
        let expected: Vec<Inv> = blocks.iter().map(|b| Inv::block(b.hash())).collect();
        assert_eq!(requested(&h.sent(1)), expected);
    }

    /// Missing transactions are requested, and the blocktxn answer completes the block.
    #[test]
    fn compact_block_round_trip() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let op = OutPoint::new(Hash256([4; 32]), 0);
        h.chain.fund(op);
        let tx = make_tx(&[op], 1);
        let block = make_block(h.chain.genesis_hash(), T0 + 1, vec![tx.clone()]);

        h.send(1, Message::CmpctBlock(CompactBlock::from_block(&block, 12)));
        let sent = h.sent(1);
        assert!(matches!(
            sent.as_slice(),
            [Message::GetBlockTxn(req)] if req.block_hash == block.hash() && req.indexes == vec![1]
        ));
        assert_eq!(h.manager.blocks_in_flight(), 1);

        h.send(
            1,
            Message::BlockTxn(BlockTransactions {
                block_hash: block.hash(),
                txs: vec![tx],
            }),
        );
        assert_eq!(h.chain.height(), 1);
        assert_eq!(h.manager.blocks_in_flight(), 0);
    }

    /// Blocktxn we never asked for is ignored.
    #[test]
    fn unsolicited_blocktxn_ignored() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.send(
            1,
            Message::BlockTxn(BlockTransactions {
                block_hash: Hash256([5; 32]),
                txs: Vec::new(),
            }),
        );
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 0);
        assert!(h.sent(1).is_empty());
    }

    /// Requested full blocks are processed and retire their in-flight entry.
    #[test]
    fn requested_block_processed() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), 2, T0 + 1, 1);
        h.send(1, Message::Headers(headers_of(&blocks)));
        h.sent(1);
        for block in &blocks {
            h.send(1, Message::Block(block.clone()));
        }
        assert_eq!(h.chain.height(), 2);
        assert_eq!(h.manager.blocks_in_flight(), 0);
    }

    /// An invalid block costs its sender and is answered with a reject.
    #[test]
    fn invalid_block_punishes_sender() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let block = make_block(h.chain.genesis_hash(), T0 + 1, Vec::new());
        h.chain.reject_block(block.hash());
        h.send(1, Message::Block(block.clone()));
        let sent = h.sent(1);
        assert!(sent.iter().any(|m| matches!(m, Message::Reject(r) if r.message == "block" && r.hash == Some(block.hash()))));
        assert!(h.connman.is_disconnected(1));
    }

    /// Sendcmpct version 1 records the peer's announcement preference.
    #[test]
    fn sendcmpct_sets_preferences() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.send(
            1,
            Message::SendCmpct(SendCmpct {
                announce: true,
                version: 1,
            }),
        );
        h.send(
            1,
            Message::SendCmpct(SendCmpct {
                announce: true,
                version: 2,
            }),
        );
        let (prefers, supports) = h.manager.with_state(|st| {
            let peer = st.store.get(1).unwrap();
            (peer.prefer_header_and_ids, peer.supports_desired_cmpct_version)
        });
        assert!(prefers);
        assert!(supports);
    }
}
