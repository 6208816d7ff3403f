//! The periodic per-peer send pass.
//!
//! Each tick walks one peer through keepalive, address gossip, header sync
//! start, block announcements, inventory trickle, download timeouts, block
//! and transaction requests and the fee filter, in that order. Periodic
//! broadcasts use Poisson-distributed delays so the timing of what we send
//! reveals little about when we learned it.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};
use weir_core::constants::{
    BIP0031_VERSION, FEEFILTER_VERSION, MAX_ADDR_TO_SEND, MAX_INV_SZ, MAX_MONEY,
};
use weir_core::traits::{ChainIndex, Clock, TxMempool};
use weir_core::types::{BlockIndexEntry, Hash256};

use crate::block_download::MAX_BLOCKS_IN_TRANSIT_PER_PEER;
use crate::compact::CompactBlock;
use crate::headers::MAX_BLOCKS_TO_ANNOUNCE;
use crate::manager::{ManagerState, PeerManager};
use crate::notifications::peer_has_header;
use crate::peer::{ConnectionType, NodeId, Peer};
use crate::protocol::{Inv, InvKind, LocatorRequest, Message};
use crate::store::PeerStore;

pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const AVG_ADDRESS_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);
pub const HEADERS_DOWNLOAD_TIMEOUT_BASE: Duration = Duration::from_secs(15 * 60);
pub const HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER: Duration = Duration::from_millis(1);
/// A peer blocking the download window for this long is dropped.
pub const BLOCK_STALLING_TIMEOUT: Duration = Duration::from_secs(2);
/// Block download timeout, in target spacings.
const BLOCK_DOWNLOAD_TIMEOUT_BASE: f64 = 1.0;
/// Extra block download timeout per other peer serving validated blocks.
const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: f64 = 0.5;
pub const MAX_GETDATA_SZ: usize = 1000;
pub const AVG_FEEFILTER_BROADCAST_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const MAX_FEEFILTER_CHANGE_DELAY: Duration = Duration::from_secs(5 * 60);
/// Best header older than this means we are still catching up.
const HEADERS_CATCHING_UP_AGE: u64 = 24 * 60 * 60;

const MAX_FILTER_FEERATE: f64 = 1e7;
const FEE_FILTER_SPACING: f64 = 1.1;

/// Next send time for an event averaging one per `average`.
pub fn poisson_next_send(now: Duration, average: Duration, rng: &mut StdRng) -> Duration {
    let u: f64 = rng.r#gen();
    now + average.mul_f64(-(-u).ln_1p())
}

/// Quantizes fee filters into geometric buckets so the exact mempool
/// minimum does not fingerprint the node.
#[derive(Debug, Clone)]
pub struct FeeFilterRounder {
    buckets: BTreeSet<u64>,
}

impl FeeFilterRounder {
    pub fn new(min_incremental_fee_per_kb: u64) -> Self {
        let mut buckets = BTreeSet::from([0]);
        let mut boundary = (min_incremental_fee_per_kb / 2).max(1) as f64;
        while boundary <= MAX_FILTER_FEERATE {
            buckets.insert(boundary as u64);
            boundary *= FEE_FILTER_SPACING;
        }
        Self { buckets }
    }

    /// Usually the bucket just below `fee`, sometimes the one at or above it.
    pub fn round(&self, fee: u64, rng: &mut StdRng) -> u64 {
        let at_or_above = self.buckets.range(fee..).next().copied();
        let below = self.buckets.range(..fee).next_back().copied();
        match (at_or_above, below) {
            (Some(at), Some(low)) => {
                if rng.gen_range(0..3) != 0 {
                    low
                } else {
                    at
                }
            }
            (Some(at), None) => at,
            (None, Some(low)) => low,
            (None, None) => 0,
        }
    }

    /// The largest bucket, which is what any fee above the table rounds to.
    pub fn max_filter(&self) -> u64 {
        self.buckets.last().copied().unwrap_or(0)
    }
}

/// Whether we would download blocks from `peer`: preferred peers always,
/// anyone else only while we have no preferred peer at all.
fn is_fetch_candidate(store: &PeerStore, peer: &Peer) -> bool {
    peer.preferred_download
        || (store.preferred_download_count() == 0 && !peer.client && peer.conn_type != ConnectionType::OneShot)
}

impl PeerManager {
    pub(crate) fn send_messages_to(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get(id) else { return };
        if !peer.successfully_connected || peer.disconnect {
            return;
        }
        let now = self.clock.now();

        self.process_getdata_queue(st, id);
        self.maybe_send_ping(st, id, now);
        if self.send_rejects_and_check_discourage(st, id) {
            return;
        }

        let ibd = self.chain.is_initial_block_download();
        self.send_addresses(st, id, now, ibd);
        self.maybe_start_headers_sync(st, id, now);
        self.announce_blocks(st, id);
        self.send_inventory(st, id, now);
        if self.check_download_timeouts(st, id, now) {
            return;
        }
        self.consider_eviction(st, id, now);

        let mut getdata = Vec::new();
        self.request_blocks(st, id, now, ibd, &mut getdata);
        self.request_transactions(st, id, now, &mut getdata);
        for chunk in getdata.chunks(MAX_GETDATA_SZ) {
            self.connman.push_message(id, Message::GetData(chunk.to_vec()));
        }

        self.maybe_send_feefilter(st, id, now, ibd);
    }

    fn maybe_send_ping(&self, st: &mut ManagerState, id: NodeId, now: Duration) {
        let Some(peer) = st.store.get(id) else { return };
        let ping = &peer.ping;
        let due = ping.queued || (ping.nonce_sent == 0 && ping.started.is_none_or(|s| s + PING_INTERVAL < now));
        if !due {
            return;
        }
        // Pre-BIP31 peers neither echo a nonce nor answer.
        let nonce = if peer.version > BIP0031_VERSION {
            st.nonzero_nonce()
        } else {
            0
        };
        let Some(peer) = st.store.get_mut(id) else { return };
        peer.ping.queued = false;
        peer.ping.started = Some(now);
        peer.ping.nonce_sent = nonce;
        self.connman.push_message(id, Message::Ping(nonce));
    }

    fn send_addresses(&self, st: &mut ManagerState, id: NodeId, now: Duration, ibd: bool) {
        let Some(peer) = st.store.get(id) else { return };
        if !ibd && peer.addr_relay.next_local_send < now {
            self.advertise_local(st, id);
            let next = poisson_next_send(now, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, &mut st.rng);
            if let Some(peer) = st.store.get_mut(id) {
                peer.addr_relay.next_local_send = next;
            }
        }

        let ManagerState { store, rng, .. } = st;
        let Some(peer) = store.get_mut(id) else { return };
        let relay = &mut peer.addr_relay;
        if relay.next_send >= now {
            return;
        }
        relay.next_send = poisson_next_send(now, AVG_ADDRESS_BROADCAST_INTERVAL, rng);
        let queued = std::mem::take(&mut relay.to_send);
        let mut fresh = Vec::with_capacity(queued.len());
        for addr in queued {
            if !relay.known.contains(&addr.addr) {
                relay.known.insert(addr.addr);
                fresh.push(addr);
            }
        }
        for chunk in fresh.chunks(MAX_ADDR_TO_SEND) {
            let msg = if relay.wants_addrv2 {
                Message::AddrV2(chunk.to_vec())
            } else {
                Message::Addr(chunk.to_vec())
            };
            self.connman.push_message(id, msg);
        }
    }

    /// Ask one good peer for headers, or everyone once we are close to
    /// caught up.
    fn maybe_start_headers_sync(&self, st: &mut ManagerState, id: NodeId, now: Duration) {
        let best_header = self.chain.best_header();
        let Some(peer) = st.store.get(id) else { return };
        if peer.sync_started || peer.client {
            return;
        }
        let fetch = is_fetch_candidate(&st.store, peer);
        let nearly_synced = best_header.time() + HEADERS_CATCHING_UP_AGE > now.as_secs();
        if !((st.store.sync_started_count() == 0 && fetch) || nearly_synced) {
            return;
        }

        let behind = now.as_secs().saturating_sub(best_header.time());
        let spacing = self.chain.target_spacing().as_secs().max(1);
        let expected_headers = u32::try_from(behind / spacing).unwrap_or(u32::MAX);
        let timeout = now + HEADERS_DOWNLOAD_TIMEOUT_BASE + HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER * expected_headers;
        st.store.set_sync_started(id, true);
        if let Some(peer) = st.store.get_mut(id) {
            peer.headers_sync_timeout = timeout;
        }

        // Start one back so the answer is non-empty even if the peer has
        // nothing beyond our best header.
        let from = self.chain.lookup(&best_header.prev_hash()).unwrap_or(best_header);
        debug!(peer = id, height = from.height, "initial getheaders");
        self.connman.push_message(
            id,
            Message::GetHeaders(LocatorRequest {
                locator: self.chain.locator(&from),
                hash_stop: Hash256::ZERO,
            }),
        );
    }

    /// Announce queued blocks as headers or a compact block when the peer
    /// wants that and they connect to what it has; otherwise inv the tip.
    fn announce_blocks(&self, st: &mut ManagerState, id: NodeId) {
        st.store.process_block_availability(&*self.chain, id);
        let recent = self.recent.lock().clone();
        let ManagerState { store, rng, .. } = st;
        let Some(peer) = store.get_mut(id) else { return };
        let to_announce = std::mem::take(&mut peer.inventory.block_hashes_to_announce);
        let Some(&last_hash) = to_announce.last() else { return };

        let mut revert_to_inv = (!peer.prefer_headers
            && (!peer.prefer_header_and_ids || to_announce.len() > 1))
            || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
        let mut headers = Vec::new();
        let mut best: Option<BlockIndexEntry> = None;

        if !revert_to_inv {
            let mut found_start = false;
            for hash in &to_announce {
                let Some(entry) = self.chain.lookup(hash) else {
                    revert_to_inv = true;
                    break;
                };
                if !self.chain.contains(&entry) {
                    // Reorged away since it was queued.
                    revert_to_inv = true;
                    break;
                }
                if best.as_ref().is_some_and(|b| entry.prev_hash() != b.hash) {
                    revert_to_inv = true;
                    break;
                }
                let parent = self.chain.lookup(&entry.prev_hash());
                best = Some(entry.clone());
                if found_start {
                    headers.push(entry.header);
                } else if peer_has_header(&*self.chain, peer, &entry) {
                    continue;
                } else if parent.as_ref().is_none_or(|p| peer_has_header(&*self.chain, peer, p)) {
                    found_start = true;
                    headers.push(entry.header);
                } else {
                    // Nothing we could send would connect.
                    revert_to_inv = true;
                    break;
                }
            }
        }

        if let (false, Some(best)) = (revert_to_inv, best.as_ref()) {
            if headers.len() == 1 && peer.prefer_header_and_ids {
                let compact = match &recent {
                    Some(r) if r.hash == best.hash => Some((*r.compact).clone()),
                    _ => match self.chain.read_block(&best.hash) {
                        Ok(block) => Some(CompactBlock::from_block(&block, rng.r#gen())),
                        Err(err) => {
                            warn!(peer = id, hash = %best.hash, %err, "cannot read block to announce");
                            None
                        }
                    },
                };
                if let Some(compact) = compact {
                    debug!(peer = id, hash = %best.hash, "announcing block with cmpctblock");
                    self.connman.push_message(id, Message::CmpctBlock(compact));
                    peer.best_header_sent = Some(best.hash);
                }
            } else if peer.prefer_headers && !headers.is_empty() {
                debug!(peer = id, count = headers.len(), last = %best.hash, "announcing blocks with headers");
                self.connman.push_message(id, Message::Headers(headers));
                peer.best_header_sent = Some(best.hash);
            } else if !headers.is_empty() {
                revert_to_inv = true;
            }
        }

        if revert_to_inv {
            // The last queued hash was our tip when it was queued.
            let Some(entry) = self.chain.lookup(&last_hash) else { return };
            if !self.chain.contains(&entry) {
                debug!(peer = id, hash = %last_hash, "announcing block not on the active chain");
            }
            if !peer_has_header(&*self.chain, peer, &entry) {
                debug!(peer = id, hash = %last_hash, "announcing block with inv");
                peer.inventory.blocks_to_send.push(last_hash);
            }
        }
    }

    fn send_inventory(&self, st: &mut ManagerState, id: NodeId, now: Duration) {
        let max_broadcast = self.config.max_inventory_broadcasts();
        let interval = self.config.inventory_broadcast_interval;
        let ManagerState {
            store,
            relay_cache,
            rng,
            next_inbound_inv_send,
            ..
        } = st;
        let Some(peer) = store.get_mut(id) else { return };
        let inbound = peer.is_inbound();
        let mut trickle = peer.permissions.noban;
        let inv = &mut peer.inventory;

        let mut out: Vec<Inv> = inv.blocks_to_send.drain(..).map(Inv::block).collect();
        out.extend(inv.dsproofs_to_send.drain(..).map(|h| Inv::new(InvKind::DsProof, h)));

        if interval.is_zero() || inv.next_inv_send < now {
            trickle = true;
            if inbound {
                // One shared schedule, so inbound peers cannot compare timings.
                if *next_inbound_inv_send < now {
                    *next_inbound_inv_send = poisson_next_send(now, interval, rng);
                }
                inv.next_inv_send = *next_inbound_inv_send;
            } else {
                inv.next_inv_send = poisson_next_send(now, interval / 2, rng);
            }
        }

        if trickle && !inv.relay_txes {
            inv.tx_to_send.clear();
        }

        if trickle && inv.send_mempool {
            inv.send_mempool = false;
            for info in self.mempool.info_all() {
                inv.tx_to_send.remove(&info.txid);
                if inv.fee_filter > 0 && info.fee_per_kb < inv.fee_filter {
                    continue;
                }
                if inv.bloom.as_mut().is_some_and(|b| !b.is_relevant_and_update(&info.tx)) {
                    continue;
                }
                inv.known.insert(info.txid);
                out.push(Inv::tx(info.txid));
            }
            inv.last_mempool_request = Some(now);
        }

        if trickle {
            let mut candidates: Vec<Hash256> = inv.tx_to_send.iter().copied().collect();
            candidates.sort_by(|a, b| self.mempool.compare_depth_and_score(a, b));
            let mut relayed = 0;
            for txid in candidates {
                if relayed >= max_broadcast {
                    break;
                }
                inv.tx_to_send.remove(&txid);
                if inv.known.contains(&txid) {
                    continue;
                }
                let Some(info) = self.mempool.info(&txid) else { continue };
                if inv.fee_filter > 0 && info.fee_per_kb < inv.fee_filter {
                    continue;
                }
                if inv.bloom.as_mut().is_some_and(|b| !b.is_relevant_and_update(&info.tx)) {
                    continue;
                }
                out.push(Inv::tx(txid));
                relayed += 1;
                relay_cache.insert(txid, info.tx, now);
                inv.known.insert(txid);
            }
        }

        for chunk in out.chunks(MAX_INV_SZ) {
            self.connman.push_message(id, Message::Inv(chunk.to_vec()));
        }
    }

    /// Stalling, block download and header sync timeouts. Returns true if
    /// the peer is being disconnected.
    fn check_download_timeouts(&self, st: &mut ManagerState, id: NodeId, now: Duration) -> bool {
        let spacing = self.chain.target_spacing();
        let validated_peers = st.store.peers_with_validated_downloads();
        let sync_peers = st.store.sync_started_count();
        let preferred_peers = st.store.preferred_download_count();
        let best_header_time = self.chain.best_header().time();
        let Some(peer) = st.store.get(id) else { return false };

        if peer.stalling_since.is_some_and(|since| since + BLOCK_STALLING_TIMEOUT < now) {
            info!(peer = id, "peer is stalling block download, disconnecting");
            self.disconnect_peer(st, id, "block download stall");
            return true;
        }

        if let Some(front) = peer.blocks_in_flight.front() {
            // Other sources make us less patient with this one.
            let others = validated_peers.saturating_sub(usize::from(peer.blocks_in_flight_valid_headers > 0));
            let timeout =
                spacing.mul_f64(BLOCK_DOWNLOAD_TIMEOUT_BASE + BLOCK_DOWNLOAD_TIMEOUT_PER_PEER * others as f64);
            if now > peer.downloading_since + timeout {
                info!(peer = id, hash = %front.hash, "timeout downloading block, disconnecting");
                self.disconnect_peer(st, id, "block download timeout");
                return true;
            }
        }

        if peer.sync_started && peer.headers_sync_timeout < Duration::MAX {
            if best_header_time + HEADERS_CATCHING_UP_AGE <= now.as_secs() {
                let alternatives = preferred_peers.saturating_sub(usize::from(peer.preferred_download));
                if now > peer.headers_sync_timeout && sync_peers == 1 && alternatives >= 1 {
                    if !peer.permissions.noban {
                        info!(peer = id, "timeout downloading headers, disconnecting");
                        self.disconnect_peer(st, id, "headers sync timeout");
                        return true;
                    }
                    warn!(peer = id, "timeout downloading headers from noban peer, not disconnecting");
                    st.store.set_sync_started(id, false);
                    if let Some(peer) = st.store.get_mut(id) {
                        peer.headers_sync_timeout = Duration::ZERO;
                    }
                }
            } else if let Some(peer) = st.store.get_mut(id) {
                // Caught up once; this timer never fires again.
                peer.headers_sync_timeout = Duration::MAX;
            }
        }
        false
    }

    fn request_blocks(&self, st: &mut ManagerState, id: NodeId, now: Duration, ibd: bool, getdata: &mut Vec<Inv>) {
        let Some(peer) = st.store.get(id) else { return };
        let fetch = is_fetch_candidate(&st.store, peer);
        let in_flight = peer.blocks_in_flight_count();
        if peer.client || !((fetch && !peer.limited) || !ibd) || in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return;
        }

        let (blocks, staller) =
            st.store
                .find_next_blocks_to_download(&*self.chain, id, MAX_BLOCKS_IN_TRANSIT_PER_PEER - in_flight);
        for entry in blocks {
            st.store.mark_block_in_flight(id, entry.hash, true, now);
            debug!(peer = id, hash = %entry.hash, height = entry.height, "requesting block");
            getdata.push(Inv::block(entry.hash));
        }

        let idle = st.store.get(id).is_some_and(|p| p.blocks_in_flight_count() == 0);
        if !idle {
            return;
        }
        if let Some(staller) = staller.and_then(|s| st.store.get_mut(s)) {
            if staller.stalling_since.is_none() {
                staller.stalling_since = Some(now);
                debug!(peer = staller.id, "stall started");
            }
        }
    }

    fn request_transactions(&self, st: &mut ManagerState, id: NodeId, now: Duration, getdata: &mut Vec<Inv>) {
        self.refresh_recent_rejects(st);
        let orphans = self.orphans.lock();
        let ManagerState {
            store,
            asked_for,
            rng,
            recent_rejects,
            ..
        } = st;
        let recent_rejects: &_ = recent_rejects;
        let Some(peer) = store.get_mut(id) else { return };
        let expired = peer.tx_download.expire_stale(rng, now);
        if expired > 0 {
            debug!(peer = id, expired, "dropped unanswered transaction requests");
        }
        let preferred = peer.preferred_download;
        let txids = peer
            .tx_download
            .drain_due(preferred, asked_for, rng, now, |txid| self.have_tx(recent_rejects, &orphans, txid));
        getdata.extend(txids.into_iter().map(Inv::tx));
    }

    fn maybe_send_feefilter(&self, st: &mut ManagerState, id: NodeId, now: Duration, ibd: bool) {
        let Some(peer) = st.store.get(id) else { return };
        if peer.version < FEEFILTER_VERSION || !self.config.enable_feefilter || peer.permissions.force_relay {
            return;
        }
        // While syncing we discard tx announcements; ask peers not to send them.
        let current = if ibd { MAX_MONEY } else { self.mempool.min_fee_per_kb() };
        let ManagerState {
            store,
            fee_rounder,
            rng,
            ..
        } = st;
        let Some(peer) = store.get_mut(id) else { return };
        let filter = &mut peer.fee_filter;
        if !ibd && filter.last_sent == fee_rounder.max_filter() {
            filter.next_send = Duration::ZERO;
        }

        if now > filter.next_send {
            let to_send = fee_rounder.round(current, rng).max(self.config.min_relay_fee_per_kb);
            if to_send != filter.last_sent {
                self.connman.push_message(id, Message::FeeFilter(to_send));
                filter.last_sent = to_send;
            }
            filter.next_send = poisson_next_send(now, AVG_FEEFILTER_BROADCAST_INTERVAL, rng);
        } else if now + MAX_FEEFILTER_CHANGE_DELAY < filter.next_send
            && (current < 3 * filter.last_sent / 4 || current > 4 * filter.last_sent / 3)
        {
            // A big move should not wait for the regular schedule.
            filter.next_send = now + Duration::from_secs(rng.gen_range(0..MAX_FEEFILTER_CHANGE_DELAY.as_secs()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{Harness, T0};
    use rand::SeedableRng;
    use weir_core::memory::{make_chain, make_tx};
    use weir_core::types::OutPoint;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn invs(sent: &[Message]) -> Vec<Inv> {
        sent.iter()
            .filter_map(|m| match m {
                Message::Inv(invs) => Some(invs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
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

    fn has_getheaders(sent: &[Message]) -> bool {
        sent.iter().any(|m| matches!(m, Message::GetHeaders(_)))
    }

    fn pool_tx(h: &Harness, seed: u8) -> Hash256 {
        let op = OutPoint::new(Hash256([seed; 32]), 0);
        h.chain.fund(op);
        let tx = make_tx(&[op], 1);
        h.chain.accept(&tx, false, None).unwrap();
        tx.txid()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Poisson delays average out near the requested interval.
    #[test]
    fn poisson_mean_close_to_average() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Duration::from_secs(1000);
        let average = Duration::from_secs(30);
        let total: f64 = (0..10_000)
            .map(|_| {
                let next = poisson_next_send(now, average, &mut rng);
                assert!(next >= now);
                (next - now).as_secs_f64()
            })
            .sum();
        let mean = total / 10_000.0;
        assert!((27.0..33.0).contains(&mean), "mean {mean}");
    }

    /// Rounded filters come from the bucket table; huge values hit the top bucket.
    #[test]
    fn fee_rounder_buckets() {
        let rounder = FeeFilterRounder::new(1000);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(rounder.round(0, &mut rng), 0);
        assert_eq!(rounder.round(MAX_MONEY, &mut rng), rounder.max_filter());
        assert!(rounder.max_filter() <= MAX_FILTER_FEERATE as u64);
        for _ in 0..100 {
            let rounded = rounder.round(50_000, &mut rng);
            assert!(rounder.buckets.contains(&rounded));
            assert!((45_000..=55_000).contains(&rounded), "rounded {rounded}");
        }
    }

    /// A ping goes out on the first pass and then only on request while unanswered.
    #[test]
    fn ping_schedule() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let first = h.tick(1);
        assert!(first.iter().any(|m| matches!(m, Message::Ping(n) if *n != 0)));
        h.advance(PING_INTERVAL + Duration::from_secs(1));
        assert!(!h.tick(1).iter().any(|m| matches!(m, Message::Ping(_))));
        h.manager.request_ping(1).unwrap();
        assert!(h.tick(1).iter().any(|m| matches!(m, Message::Ping(_))));
    }

    /// Far behind, only one peer is asked for headers.
    #[test]
    fn single_header_sync_peer_while_behind() {
        let h = Harness::new();
        h.advance(Duration::from_secs(2 * 24 * 60 * 60));
        h.connect(1, ConnectionType::Outbound);
        h.connect(2, ConnectionType::Outbound);
        let first = h.tick(1);
        assert!(matches!(
            first.iter().find(|m| matches!(m, Message::GetHeaders(_))),
            Some(Message::GetHeaders(req)) if req.locator == vec![h.chain.genesis_hash()]
        ));
        assert!(!has_getheaders(&h.tick(2)));
    }

    /// Near the present, every peer is asked for headers.
    #[test]
    fn all_peers_sync_when_nearly_caught_up() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.connect(2, ConnectionType::Inbound);
        assert!(has_getheaders(&h.tick(1)));
        assert!(has_getheaders(&h.tick(2)));
    }

    /// The sole header-sync peer times out when others could serve us.
    #[test]
    fn headers_sync_timeout_disconnects() {
        let h = Harness::new();
        h.advance(Duration::from_secs(2 * 24 * 60 * 60));
        h.connect(1, ConnectionType::Outbound);
        h.connect(2, ConnectionType::Outbound);
        h.tick(1);
        h.advance(HEADERS_DOWNLOAD_TIMEOUT_BASE + Duration::from_secs(5));
        h.tick(1);
        assert!(h.connman.is_disconnected(1));
    }

    /// New blocks go out as headers to peers that asked for them and can connect them.
    #[test]
    fn announces_with_headers() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.send(1, Message::SendHeaders);
        let genesis = h.chain.genesis_hash();
        h.manager
            .with_state(|st| st.store.get_mut(1).unwrap().best_known_block = Some(genesis));
        h.tick(1);

        let block = h.mine(1).remove(0);
        h.manager.updated_block_tip(&h.chain.active_tip(), h.chain.lookup(&genesis).as_ref(), false);
        let sent = h.tick(1);
        assert!(sent.contains(&Message::Headers(vec![block.header.clone()])));
        assert!(invs(&sent).is_empty());
    }

    /// Without a known parent, or without sendheaders, the tip goes out as an inv.
    #[test]
    fn falls_back_to_inv() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.connect(2, ConnectionType::Inbound);
        h.send(1, Message::SendHeaders);
        h.tick(1);
        h.tick(2);

        let block = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1).remove(0);
        h.manager.submit_block(&block);
        assert_eq!(invs(&h.tick(1)), vec![Inv::block(block.hash())]);
        assert_eq!(invs(&h.tick(2)), vec![Inv::block(block.hash())]);
    }

    /// A high-bandwidth peer gets the new block once, as a cmpctblock.
    #[test]
    fn compact_announcement_not_repeated() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.send(
            1,
            Message::SendCmpct(crate::protocol::SendCmpct {
                announce: true,
                version: 1,
            }),
        );
        let genesis = h.chain.genesis_hash();
        h.manager
            .with_state(|st| st.store.get_mut(1).unwrap().best_known_block = Some(genesis));
        h.tick(1);

        let block = make_chain(genesis, 1, T0 + 1, 1).remove(0);
        h.manager.submit_block(&block);
        let mut sent = h.sent(1);
        sent.extend(h.tick(1));
        let compacts = sent.iter().filter(|m| matches!(m, Message::CmpctBlock(_))).count();
        assert_eq!(compacts, 1);
        assert!(invs(&sent).is_empty());
    }

    /// Transactions trickle parents first and land in the relay cache.
    #[test]
    fn trickle_orders_and_caches() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.tick(1);

        let parent_id = pool_tx(&h, 1);
        let parent = h.chain.get(&parent_id).unwrap();
        let child = make_tx(&[OutPoint::new(parent.txid(), 0)], 1);
        h.chain.accept(&child, false, None).unwrap();

        h.manager.relay_transaction(child.txid());
        h.manager.relay_transaction(parent_id);
        h.advance(Duration::from_secs(60));
        let sent = invs(&h.tick(1));
        assert_eq!(sent, vec![Inv::tx(parent_id), Inv::tx(child.txid())]);
        let cached = h.manager.with_state(|st| st.relay_cache.get(&parent_id).is_some());
        assert!(cached);

        // Known now; not announced again.
        h.manager.relay_transaction(parent_id);
        h.advance(Duration::from_secs(60));
        assert!(invs(&h.tick(1)).is_empty());
    }

    /// The peer's fee filter holds back cheaper transactions.
    #[test]
    fn trickle_honors_fee_filter() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.tick(1);
        h.send(1, Message::FeeFilter(5000));

        let cheap = pool_tx(&h, 2);
        let op = OutPoint::new(Hash256([3; 32]), 0);
        h.chain.fund(op);
        let rich_tx = make_tx(&[op], 1);
        h.chain.set_fee_rate(rich_tx.txid(), 9000);
        h.chain.accept(&rich_tx, false, None).unwrap();

        h.manager.relay_transaction(cheap);
        h.manager.relay_transaction(rich_tx.txid());
        h.advance(Duration::from_secs(60));
        assert_eq!(invs(&h.tick(1)), vec![Inv::tx(rich_tx.txid())]);
    }

    /// A mempool request is answered on the next trickle.
    #[test]
    fn mempool_request_answered() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let txid = pool_tx(&h, 4);
        h.send(1, Message::Mempool);
        let sent = invs(&h.tick(1));
        assert_eq!(sent, vec![Inv::tx(txid)]);
        let requested_at = h.manager.with_state(|st| st.store.get(1).unwrap().inventory.last_mempool_request);
        assert_eq!(requested_at, Some(h.clock.now()));
    }

    /// Queued addresses go out once; the peer is then known to have them.
    #[test]
    fn addresses_flushed_once() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.tick(1);
        let addr = crate::protocol::NetAddress::new("8.8.8.8:8433".parse().unwrap(), 1, T0);
        h.manager.with_state(|st| {
            let peer = st.store.get_mut(1).unwrap();
            peer.addr_relay.to_send.push(addr);
            peer.addr_relay.to_send.push(addr);
        });
        h.advance(Duration::from_secs(60 * 60));
        let sent = h.tick(1);
        assert!(sent.contains(&Message::Addr(vec![addr])));

        h.manager
            .with_state(|st| st.store.get_mut(1).unwrap().addr_relay.to_send.push(addr));
        h.advance(Duration::from_secs(60 * 60));
        assert!(!h.tick(1).iter().any(|m| matches!(m, Message::Addr(_))));
    }

    /// Behind the tip, announced blocks are fetched by the download scheduler.
    #[test]
    fn requests_blocks_from_best_peer() {
        let h = Harness::new();
        h.advance(Duration::from_secs(24 * 60 * 60 + 1));
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), 3, T0 + 1, 1);
        let headers = blocks.iter().map(|b| b.header.clone()).collect();
        h.send(1, Message::Headers(headers));
        assert!(requested(&h.sent(1)).is_empty(), "tip too old for direct fetch");

        let expected: Vec<Inv> = blocks.iter().map(|b| Inv::block(b.hash())).collect();
        assert_eq!(requested(&h.tick(1)), expected);
        assert_eq!(h.manager.blocks_in_flight(), 3);
    }

    /// A block not delivered within one spacing costs the connection.
    #[test]
    fn block_download_timeout() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let blocks = make_chain(h.chain.genesis_hash(), 1, T0 + 1, 1);
        h.send(1, Message::Headers(vec![blocks[0].header.clone()]));
        assert_eq!(h.manager.blocks_in_flight(), 1);
        h.tick(1);
        assert!(!h.connman.is_disconnected(1));

        h.advance(h.chain.target_spacing() + Duration::from_secs(1));
        h.tick(1);
        assert!(h.connman.is_disconnected(1));
    }

    /// Two peers announcing the same transaction get one request between them.
    #[test]
    fn tx_requested_once_across_peers() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        h.connect(2, ConnectionType::Outbound);
        let txid = Hash256([42; 32]);
        h.send(1, Message::Inv(vec![Inv::tx(txid)]));
        h.send(2, Message::Inv(vec![Inv::tx(txid)]));
        assert_eq!(requested(&h.tick(1)), vec![Inv::tx(txid)]);
        assert!(requested(&h.tick(2)).is_empty());

        h.advance(crate::tx_download::GETDATA_TX_INTERVAL + crate::tx_download::MAX_GETDATA_RANDOM_DELAY);
        assert_eq!(requested(&h.tick(2)), vec![Inv::tx(txid)]);
    }

    /// Our fee filter goes out on the first pass and never below the relay minimum.
    #[test]
    fn feefilter_sent() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Outbound);
        let sent = h.tick(1);
        let fee = sent
            .iter()
            .find_map(|m| match m {
                Message::FeeFilter(fee) => Some(*fee),
                _ => None,
            })
            .unwrap();
        assert!((1000..=1100).contains(&fee), "fee {fee}");
        assert!(!h.tick(1).iter().any(|m| matches!(m, Message::FeeFilter(_))));
    }
}
