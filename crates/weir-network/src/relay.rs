//! Transaction, address and double-spend-proof relay.
//!
//! Incoming transactions are validated against the mempool; those with
//! missing parents wait in the orphan pool until a parent arrives. Accepted
//! transactions are queued on every peer's trickle set. Addresses are
//! forwarded to a small, deterministic-per-day subset of peers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, info};
use weir_core::constants::{
    MAX_ADDR_TO_SEND, MAX_INV_SZ, MAX_SCRIPT_ELEMENT_SIZE, NODE_NETWORK, NODE_NETWORK_LIMITED, money_range,
};
use weir_core::error::TxAcceptError;
use weir_core::types::{DoubleSpendProof, Hash256, OutPoint, Transaction};
use weir_core::validation::{DsProofOutcome, Rejection};

use crate::block_download::MAX_BLOCKS_IN_TRANSIT_PER_PEER;
use crate::filters::{BloomFilter, RollingSet};
use crate::manager::{ManagerState, PeerManager};
use crate::orphans::OrphanPool;
use crate::peer::{AddrRelayState, ConnectionType, NodeId};
use crate::protocol::{Inv, InvKind, LocatorRequest, Message, NetAddress};
use crate::tx_download::MAX_PEER_TX_IN_FLIGHT;

/// How long relayed transactions stay servable after they leave the mempool.
pub const RELAY_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Percentage of the address book a single getaddr answer may reveal.
pub const MAX_PCT_ADDR_TO_SEND: usize = 23;
/// Rejected orphans from one peer tolerated in a single worklist pass. Once a
/// peer exceeds it, the rest of its orphans wait for a later parent.
pub const MAX_NON_STANDARD_ORPHANS_PER_PEER: usize = 5;
/// Rejected transactions at least this large are not kept for compact block
/// reconstruction.
pub const MAX_EXTRA_TX_SIZE: usize = 100_000;
/// Addresses younger than this are relayed onwards.
const ADDR_RELAY_MAX_AGE: u64 = 10 * 60;
/// Timestamp given to addresses that arrive with a nonsensical one.
const ADDR_DEFAULT_AGE: u64 = 5 * 24 * 60 * 60;

/// Transactions we announced, kept servable for a while even if they leave
/// the mempool.
#[derive(Debug, Default)]
pub struct RelayCache {
    txs: HashMap<Hash256, Transaction>,
    expiry: VecDeque<(Duration, Hash256)>,
}

impl RelayCache {
    pub fn insert(&mut self, txid: Hash256, tx: Transaction, now: Duration) {
        self.expire(now);
        if self.txs.insert(txid, tx).is_none() {
            self.expiry.push_back((now + RELAY_CACHE_TTL, txid));
        }
    }

    fn expire(&mut self, now: Duration) {
        while let Some(&(at, txid)) = self.expiry.front() {
            if at >= now {
                break;
            }
            self.expiry.pop_front();
            self.txs.remove(&txid);
        }
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.txs.get(txid)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

impl AddrRelayState {
    /// Queue an address for the next `addr` message unless the peer already
    /// knows it. A full queue overwrites a random entry.
    pub fn push(&mut self, addr: NetAddress, rng: &mut StdRng) {
        if self.known.contains(&addr.addr) {
            return;
        }
        if self.to_send.len() >= MAX_ADDR_TO_SEND {
            let slot = rng.gen_range(0..self.to_send.len());
            self.to_send[slot] = addr;
        } else {
            self.to_send.push(addr);
        }
    }
}

impl PeerManager {
    /// Clear the reject filter when the tip moved; rejected transactions may
    /// be valid on the new tip.
    pub(crate) fn refresh_recent_rejects(&self, st: &mut ManagerState) {
        let tip = self.chain.active_tip().hash;
        if tip != st.recent_rejects_tip {
            st.recent_rejects.reset();
            st.recent_rejects_tip = tip;
        }
    }

    /// Whether we already have, or recently refused, transaction `txid`.
    pub(crate) fn have_tx(
        &self,
        recent_rejects: &RollingSet<Hash256>,
        orphans: &OrphanPool,
        txid: &Hash256,
    ) -> bool {
        recent_rejects.contains(txid)
            || orphans.contains(txid)
            || self.mempool.exists(txid)
            || self.chain.coins_exist(&OutPoint::new(*txid, 0))
            || self.chain.coins_exist(&OutPoint::new(*txid, 1))
    }

    pub(crate) fn on_inv(&self, st: &mut ManagerState, id: NodeId, invs: Vec<Inv>) {
        if invs.len() > MAX_INV_SZ {
            self.misbehaving(st, id, 20, "oversized-inv");
            return;
        }
        let now = self.clock.now();
        let ibd = self.chain.is_initial_block_download();
        let Some(peer) = st.store.get(id) else { return };
        let blocks_only = self.config.blocks_only && !peer.permissions.relay;
        let preferred = peer.preferred_download;
        self.refresh_recent_rejects(st);

        let orphans = self.orphans.lock();
        let mut best_block = None;
        let mut getdata = Vec::new();
        for inv in invs {
            match inv.kind {
                InvKind::Block => {
                    let have = self.chain.lookup(&inv.hash).is_some();
                    trace_inv(id, &inv, have);
                    st.store.update_block_availability(&*self.chain, id, inv.hash);
                    if !have && !st.store.blocks_in_flight.contains_key(&inv.hash) {
                        // Ask for headers; blocks are fetched once they connect.
                        best_block = Some(inv.hash);
                    }
                }
                InvKind::Tx => {
                    let have = self.have_tx(&st.recent_rejects, &orphans, &inv.hash);
                    trace_inv(id, &inv, have);
                    let Some(peer) = st.store.get_mut(id) else { return };
                    peer.inventory.known.insert(inv.hash);
                    if blocks_only {
                        debug!(peer = id, txid = %inv.hash, "transaction inv in blocks-only mode");
                    } else if !have && !ibd {
                        peer.tx_download
                            .request_tx(inv.hash, preferred, &st.asked_for, &mut st.rng, now);
                    }
                }
                InvKind::DsProof => {
                    let have = self.mempool.dsproof_exists(&inv.hash);
                    trace_inv(id, &inv, have);
                    let Some(peer) = st.store.get_mut(id) else { return };
                    peer.inventory.known.insert(inv.hash);
                    if !have && !ibd && !blocks_only {
                        getdata.push(inv);
                    }
                }
                _ => debug!(peer = id, kind = ?inv.kind, "ignoring unexpected inv kind"),
            }
        }
        drop(orphans);

        if let Some(hash) = best_block {
            let best_header = self.chain.best_header();
            debug!(peer = id, %hash, height = best_header.height, "getheaders for announced block");
            self.connman.push_message(
                id,
                Message::GetHeaders(LocatorRequest {
                    locator: self.chain.locator(&best_header),
                    hash_stop: hash,
                }),
            );
        }
        if !getdata.is_empty() {
            self.connman.push_message(id, Message::GetData(getdata));
        }
    }

    pub(crate) fn on_tx(&self, st: &mut ManagerState, id: NodeId, tx: Transaction) {
        let now = self.clock.now();
        let Some(peer) = st.store.get_mut(id) else { return };
        if self.config.blocks_only && !peer.permissions.relay {
            debug!(peer = id, "transaction sent in violation of blocks-only mode");
            return;
        }
        let txid = tx.txid();
        peer.inventory.known.insert(txid);
        peer.tx_download.forget(&txid);
        let permissions = peer.permissions;
        let preferred = peer.preferred_download;
        st.asked_for.erase(&txid);
        self.refresh_recent_rejects(st);

        let mut orphans = self.orphans.lock();
        let result = if self.have_tx(&st.recent_rejects, &orphans, &txid) {
            None
        } else {
            Some(self.mempool.accept(&tx, false, None))
        };

        let rejection = match result {
            Some(Ok(())) => {
                debug!(peer = id, %txid, "accepted transaction");
                self.relay_tx(st, txid);
                self.process_orphans(st, &mut orphans, &tx);
                return;
            }
            Some(Err(TxAcceptError::MissingInputs)) => {
                self.store_orphan(st, &mut orphans, id, &tx, preferred, now);
                return;
            }
            Some(Err(TxAcceptError::Rejected(rejection))) => Some(rejection),
            None => None,
        };

        if let Some(rejection) = &rejection {
            if !rejection.corruption_possible {
                st.recent_rejects.insert(txid);
                if tx.serialized_size() < MAX_EXTRA_TX_SIZE {
                    orphans.remember_extra(tx.clone());
                }
            }
        }
        drop(orphans);

        if permissions.force_relay && rejection.as_ref().is_none_or(|r| r.severity == 0) {
            if self.mempool.exists(&txid) {
                info!(peer = id, %txid, "force relaying transaction from privileged peer");
                self.relay_tx(st, txid);
            } else {
                info!(peer = id, %txid, "not relaying non-mempool transaction from privileged peer");
            }
        }

        if let Some(rejection) = rejection {
            debug!(peer = id, %txid, %rejection, "rejected transaction");
            self.push_reject(id, "tx", rejection.code, &rejection.reason, Some(txid));
            if rejection.severity > 0 {
                self.misbehaving(st, id, rejection.severity, &rejection.reason);
            }
        }
    }

    fn store_orphan(
        &self,
        st: &mut ManagerState,
        orphans: &mut OrphanPool,
        id: NodeId,
        tx: &Transaction,
        preferred: bool,
        now: Duration,
    ) {
        let txid = tx.txid();
        let rejected_parent = tx
            .inputs
            .iter()
            .any(|input| st.recent_rejects.contains(&input.previous_output.txid));
        if rejected_parent {
            debug!(peer = id, %txid, "not keeping orphan with rejected parents");
            st.recent_rejects.insert(txid);
            return;
        }

        let Some(peer) = st.store.get_mut(id) else { return };
        for input in &tx.inputs {
            let parent = input.previous_output.txid;
            peer.inventory.known.insert(parent);
            if !self.have_tx(&st.recent_rejects, orphans, &parent) {
                peer.tx_download
                    .request_tx(parent, preferred, &st.asked_for, &mut st.rng, now);
            }
        }
        orphans.add(tx, id, now);
        let evicted = orphans.limit(self.config.max_orphan_txs, now);
        if evicted > 0 {
            debug!(evicted, "orphan pool overflow");
        }
    }

    /// Retry orphans that spend outputs of `parent`, and transitively of
    /// whatever that admits.
    fn process_orphans(&self, st: &mut ManagerState, orphans: &mut OrphanPool, parent: &Transaction) {
        let parent_id = parent.txid();
        let mut work: VecDeque<OutPoint> = (0..parent.outputs.len())
            .map(|i| OutPoint::new(parent_id, i as u64))
            .collect();
        let mut rejected: BTreeMap<NodeId, usize> = BTreeMap::new();

        while let Some(outpoint) = work.pop_front() {
            for orphan_id in orphans.spenders_of(&outpoint) {
                let Some((orphan, from_peer)) = orphans.get(&orphan_id).map(|(tx, p)| (tx.clone(), p)) else {
                    continue;
                };
                if rejected.get(&from_peer).is_some_and(|n| *n > MAX_NON_STANDARD_ORPHANS_PER_PEER) {
                    continue;
                }
                match self.mempool.accept(&orphan, false, None) {
                    Ok(()) => {
                        debug!(txid = %orphan_id, "accepted orphan transaction");
                        self.relay_tx(st, orphan_id);
                        work.extend((0..orphan.outputs.len()).map(|i| OutPoint::new(orphan_id, i as u64)));
                        orphans.erase(&orphan_id);
                    }
                    Err(TxAcceptError::MissingInputs) => {}
                    Err(TxAcceptError::Rejected(rejection)) => {
                        *rejected.entry(from_peer).or_default() += 1;
                        self.reject_orphan(st, orphans, orphan_id, from_peer, &rejection);
                    }
                }
            }
        }
    }

    fn reject_orphan(
        &self,
        st: &mut ManagerState,
        orphans: &mut OrphanPool,
        orphan_id: Hash256,
        from_peer: NodeId,
        rejection: &Rejection,
    ) {
        if rejection.severity > 0 {
            self.misbehaving(st, from_peer, rejection.severity, "invalid-orphan-tx");
        }
        debug!(txid = %orphan_id, peer = from_peer, %rejection, "removed invalid orphan");
        orphans.erase(&orphan_id);
        if !rejection.corruption_possible {
            st.recent_rejects.insert(orphan_id);
        }
    }

    /// Queue `txid` on the trickle set of every peer that does not know it.
    pub(crate) fn relay_tx(&self, st: &mut ManagerState, txid: Hash256) {
        for peer in st.store.iter_mut() {
            if !peer.disconnect && !peer.inventory.known.contains(&txid) {
                peer.inventory.tx_to_send.insert(txid);
            }
        }
    }

    /// Queue our routable address for `id`, stamped now.
    pub(crate) fn advertise_local(&self, st: &mut ManagerState, id: NodeId) {
        let Some(mut local) = self.connman.local_address().filter(NetAddress::is_routable) else {
            return;
        };
        local.time = self.clock.now_secs();
        if let Some(peer) = st.store.get_mut(id) {
            peer.addr_relay.push(local, &mut st.rng);
        }
    }

    pub(crate) fn on_addr(&self, st: &mut ManagerState, id: NodeId, addrs: Vec<NetAddress>, v2: bool) {
        if addrs.len() > MAX_ADDR_TO_SEND {
            self.misbehaving(st, id, 20, if v2 { "oversized-addrv2" } else { "oversized-addr" });
            return;
        }
        let now = self.clock.now_secs();
        let Some(peer) = st.store.get_mut(id) else { return };
        let source = peer.addr;
        let solicited = peer.addr_relay.getaddr_pending;
        let batch = addrs.len();

        let mut accepted = Vec::with_capacity(batch);
        let mut to_relay = Vec::new();
        for mut addr in addrs {
            if addr.services & (NODE_NETWORK | NODE_NETWORK_LIMITED) == 0 {
                continue;
            }
            if addr.time <= 100_000_000 || addr.time > now + ADDR_RELAY_MAX_AGE {
                addr.time = now.saturating_sub(ADDR_DEFAULT_AGE);
            }
            peer.addr_relay.known.insert(addr.addr);
            let reachable = self.connman.is_reachable(&addr.addr);
            if addr.time > now.saturating_sub(ADDR_RELAY_MAX_AGE) && !solicited && batch <= 10 && addr.is_routable() {
                to_relay.push((addr, reachable));
            }
            if reachable {
                accepted.push(addr);
            }
        }
        if batch < MAX_ADDR_TO_SEND {
            peer.addr_relay.getaddr_pending = false;
        }
        let one_shot = peer.conn_type == ConnectionType::OneShot;

        for (addr, reachable) in to_relay {
            self.relay_address(st, id, addr, reachable);
        }
        debug!(peer = id, received = batch, accepted = accepted.len(), "received addresses");
        self.connman.add_addresses(&accepted, &source);
        if one_shot {
            self.disconnect_peer(st, id, "one-shot address fetch done");
        }
    }

    /// Forward `addr` to one or two peers, chosen by a keyed hash that stays
    /// stable for a day so repeats reach the same peers.
    fn relay_address(&self, st: &mut ManagerState, source: NodeId, addr: NetAddress, reachable: bool) {
        let relay_count = if reachable { 2 } else { 1 };
        let day = self.clock.now_secs() / (24 * 60 * 60);
        let addr_key = addr.addr.to_string();

        let mut ranked: Vec<(u64, NodeId)> = st
            .store
            .iter()
            .filter(|p| p.id != source && p.successfully_connected && !p.disconnect)
            .map(|p| {
                let mut hasher = blake3::Hasher::new_keyed(&st.addr_salt);
                hasher.update(addr_key.as_bytes());
                hasher.update(&day.to_le_bytes());
                hasher.update(&p.id.to_le_bytes());
                let digest = hasher.finalize();
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest.as_bytes()[..8]);
                (u64::from_le_bytes(word), p.id)
            })
            .collect();
        ranked.sort_unstable_by(|a, b| b.cmp(a));

        for (_, target) in ranked.into_iter().take(relay_count) {
            if let Some(peer) = st.store.get_mut(target) {
                peer.addr_relay.push(addr, &mut st.rng);
            }
        }
    }

    pub(crate) fn on_getaddr(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get_mut(id) else { return };
        // Only answer inbound peers, so outbound ones cannot fingerprint us.
        if !peer.is_inbound() {
            debug!(peer = id, "ignoring getaddr from outbound connection");
            return;
        }
        if peer.addr_relay.answered_getaddr {
            debug!(peer = id, "ignoring repeated getaddr");
            return;
        }
        peer.addr_relay.answered_getaddr = true;
        peer.addr_relay.to_send.clear();
        for addr in self.connman.get_addresses(MAX_PCT_ADDR_TO_SEND, MAX_ADDR_TO_SEND) {
            peer.addr_relay.push(addr, &mut st.rng);
        }
    }

    pub(crate) fn on_dsproof(&self, st: &mut ManagerState, id: NodeId, proof: DoubleSpendProof) {
        let proof_id = proof.id();
        let Some(peer) = st.store.get_mut(id) else { return };
        peer.inventory.known.insert(proof_id);
        peer.tx_download.forget(&proof_id);
        let noban = peer.permissions.noban;
        match self.mempool.add_dsproof(&proof) {
            DsProofOutcome::Valid => {
                debug!(peer = id, %proof_id, "relaying double-spend proof");
                for other in st.store.iter_mut() {
                    if !other.inventory.known.contains(&proof_id)
                        && !other.inventory.dsproofs_to_send.contains(&proof_id)
                    {
                        other.inventory.dsproofs_to_send.push(proof_id);
                    }
                }
            }
            DsProofOutcome::MissingTransaction => {
                debug!(peer = id, %proof_id, "double-spend proof for unknown transaction");
            }
            DsProofOutcome::Invalid => {
                debug!(peer = id, %proof_id, "invalid double-spend proof");
                if !noban {
                    self.misbehaving(st, id, 10, "invalid-dsproof");
                }
            }
        }
    }

    pub(crate) fn on_notfound(&self, st: &mut ManagerState, id: NodeId, invs: Vec<Inv>) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if invs.len() > MAX_PEER_TX_IN_FLIGHT + MAX_BLOCKS_IN_TRANSIT_PER_PEER {
            return;
        }
        for inv in invs {
            if matches!(inv.kind, InvKind::Tx | InvKind::DsProof)
                && peer.tx_download.in_flight.contains_key(&inv.hash)
            {
                // Other peers may still be asked; leave the global request time alone.
                peer.tx_download.forget(&inv.hash);
            }
        }
    }

    pub(crate) fn on_feefilter(&self, st: &mut ManagerState, id: NodeId, fee: u64) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if money_range(fee) {
            peer.inventory.fee_filter = fee;
            debug!(peer = id, fee, "received fee filter");
        }
    }

    pub(crate) fn on_filterload(&self, st: &mut ManagerState, id: NodeId, filter: BloomFilter) {
        if !filter.is_within_size_constraints() {
            self.misbehaving(st, id, 100, "oversized-bloom-filter");
            return;
        }
        let Some(peer) = st.store.get_mut(id) else { return };
        peer.inventory.bloom = Some(filter);
        peer.inventory.relay_txes = true;
    }

    pub(crate) fn on_filteradd(&self, st: &mut ManagerState, id: NodeId, data: Vec<u8>) {
        let Some(peer) = st.store.get_mut(id) else { return };
        // Larger items could never match a script element anyway.
        let bad = data.len() > MAX_SCRIPT_ELEMENT_SIZE
            || match peer.inventory.bloom.as_mut() {
                Some(filter) => {
                    filter.insert(&data);
                    false
                }
                None => true,
            };
        if bad {
            self.misbehaving(st, id, 100, "invalid-filteradd");
        }
    }

    pub(crate) fn on_filterclear(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get(id) else { return };
        let offered = self.bloom_offered(peer);
        let Some(peer) = st.store.get_mut(id) else { return };
        if offered {
            peer.inventory.bloom = None;
        }
        peer.inventory.relay_txes = true;
    }
}

fn trace_inv(id: NodeId, inv: &Inv, have: bool) {
    tracing::trace!(peer = id, kind = ?inv.kind, hash = %inv.hash, have, "got inv");
}
