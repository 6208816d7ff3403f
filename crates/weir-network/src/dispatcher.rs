//! Routing of decoded messages to their handlers.

use tracing::debug;
use weir_core::constants::{BIP0031_VERSION, NO_BLOOM_VERSION};

use crate::manager::{ManagerState, PeerManager};
use crate::peer::{NodeId, Peer};
use crate::protocol::{Message, RejectMessage};

impl PeerManager {
    /// Whether `peer` may use bloom filters with us.
    pub(crate) fn bloom_offered(&self, peer: &Peer) -> bool {
        self.config.enable_bloom_filters || peer.permissions.bloom_filter
    }

    pub(crate) fn dispatch(&self, st: &mut ManagerState, id: NodeId, msg: Message) {
        let Some(peer) = st.store.get(id) else { return };
        let version = peer.version;
        let connected = peer.successfully_connected;
        let bloom = self.bloom_offered(peer);

        match msg {
            Message::Version(v) => self.on_version(st, id, v),
            msg if version == 0 => {
                debug!(peer = id, command = msg.command(), "message before version");
                self.misbehaving(st, id, 10, "missing-version");
            }
            Message::ExtVersion(map) => self.on_extversion(st, id, map),
            Message::Verack => self.on_verack(st, id),
            Message::SendAddrV2 => self.on_sendaddrv2(st, id),
            msg if !connected => {
                debug!(peer = id, command = msg.command(), "ignoring message before verack");
            }
            Message::FilterLoad(_) | Message::FilterAdd(_) if !bloom => {
                if version >= NO_BLOOM_VERSION {
                    self.misbehaving(st, id, 100, "no-bloom-version");
                } else {
                    self.disconnect_peer(st, id, "bloom filter not offered");
                }
            }
            Message::Addr(addrs) => self.on_addr(st, id, addrs, false),
            Message::AddrV2(addrs) => self.on_addr(st, id, addrs, true),
            Message::GetAddr => self.on_getaddr(st, id),
            Message::Inv(invs) => self.on_inv(st, id, invs),
            Message::GetData(invs) => self.on_getdata(st, id, invs),
            Message::NotFound(invs) => self.on_notfound(st, id, invs),
            Message::GetBlocks(req) => self.on_getblocks(st, id, req),
            Message::GetHeaders(req) => self.on_getheaders(st, id, req),
            Message::Headers(headers) => self.on_headers(st, id, headers),
            Message::Block(block) => self.on_block(st, id, block),
            Message::Tx(tx) => self.on_tx(st, id, tx),
            Message::SendHeaders => self.on_sendheaders(st, id),
            Message::SendCmpct(sc) => self.on_sendcmpct(st, id, sc),
            Message::CmpctBlock(cmpct) => self.on_cmpctblock(st, id, cmpct),
            Message::GetBlockTxn(req) => self.on_getblocktxn(st, id, req),
            Message::BlockTxn(resp) => self.on_blocktxn(st, id, resp),
            Message::Mempool => self.on_mempool(st, id),
            Message::Ping(nonce) => self.on_ping(st, id, nonce),
            Message::Pong(nonce) => self.on_pong(st, id, nonce),
            Message::FeeFilter(fee) => self.on_feefilter(st, id, fee),
            Message::FilterLoad(filter) => self.on_filterload(st, id, filter),
            Message::FilterAdd(data) => self.on_filteradd(st, id, data),
            Message::FilterClear => self.on_filterclear(st, id),
            Message::DsProof(proof) => self.on_dsproof(st, id, proof),
            Message::Reject(reject) => on_reject(id, &reject),
            Message::MerkleBlock(_) => debug!(peer = id, "ignoring unsolicited merkleblock"),
            Message::Unknown(command) => debug!(peer = id, %command, "ignoring unknown message"),
        }
    }

    fn on_ping(&self, st: &mut ManagerState, id: NodeId, nonce: u64) {
        let Some(peer) = st.store.get(id) else { return };
        // Before BIP31 pings carried no nonce and wanted no answer.
        if peer.version > BIP0031_VERSION {
            self.connman.push_message(id, Message::Pong(nonce));
        }
    }

    fn on_pong(&self, st: &mut ManagerState, id: NodeId, nonce: u64) {
        let now = self.clock.now();
        let Some(peer) = st.store.get_mut(id) else { return };
        let ping = &mut peer.ping;
        if ping.nonce_sent == 0 {
            debug!(peer = id, nonce, "unsolicited pong");
            return;
        }
        if nonce == ping.nonce_sent {
            let Some(started) = ping.started else {
                debug!(peer = id, "pong without ping start time");
                ping.nonce_sent = 0;
                return;
            };
            let latency = now.saturating_sub(started);
            ping.last_latency = Some(latency);
            ping.min_latency = Some(ping.min_latency.map_or(latency, |m| m.min(latency)));
            ping.nonce_sent = 0;
        } else if nonce == 0 {
            // A zero nonce cancels the outstanding ping.
            debug!(peer = id, "pong with zero nonce");
            ping.nonce_sent = 0;
        } else {
            debug!(peer = id, expected = ping.nonce_sent, got = nonce, "pong nonce mismatch");
        }
    }
}

fn on_reject(id: NodeId, reject: &RejectMessage) {
    debug!(
        peer = id,
        message = %reject.message,
        code = reject.code,
        reason = %reject.reason,
        hash = ?reject.hash,
        "received reject"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerManagerConfig;
    use crate::filters::BloomFilter;
    use crate::harness::Harness;
    use crate::peer::ConnectionType;
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Anything but version first costs ten points.
    #[test]
    fn message_before_version_penalized() {
        let h = Harness::new();
        h.manager.initialize_node(&Harness::info(1, ConnectionType::Inbound));
        h.send(1, Message::Ping(1));
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 10);
        assert!(h.sent(1).is_empty());
    }

    /// Between version and verack, ordinary messages are dropped.
    #[test]
    fn message_before_verack_ignored() {
        let h = Harness::new();
        h.manager.initialize_node(&Harness::info(1, ConnectionType::Inbound));
        h.send(1, Message::Version(Harness::peer_version(1)));
        h.sent(1);
        h.send(1, Message::Ping(1));
        assert!(h.sent(1).is_empty());
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 0);
    }

    /// Pings are answered with the same nonce.
    #[test]
    fn ping_answered() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.send(1, Message::Ping(77));
        assert_eq!(h.sent(1), vec![Message::Pong(77)]);
    }

    /// A matching pong records latency; mismatches leave the ping open.
    #[test]
    fn pong_measures_latency() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let sent = h.tick(1);
        let nonce = sent
            .iter()
            .find_map(|m| match m {
                Message::Ping(n) => Some(*n),
                _ => None,
            })
            .unwrap();
        h.advance(Duration::from_millis(250));
        h.send(1, Message::Pong(nonce.wrapping_add(1)));
        assert!(h.manager.stats(1).unwrap().ping.is_none());
        h.send(1, Message::Pong(nonce));
        let stats = h.manager.stats(1).unwrap();
        assert_eq!(stats.ping, Some(Duration::from_millis(250)));
        assert_eq!(stats.min_ping, Some(Duration::from_millis(250)));
    }

    /// Bloom messages without the service are punished on modern versions.
    #[test]
    fn filterload_without_bloom_service() {
        let config = PeerManagerConfig {
            enable_bloom_filters: false,
            ..PeerManagerConfig::regtest()
        };
        let h = Harness::with_config(config);
        h.connect(1, ConnectionType::Inbound);
        h.send(1, Message::FilterLoad(BloomFilter::new(10, 0.01, 0, 0)));
        assert!(h.connman.is_disconnected(1));
        assert_eq!(h.connman.discouraged().len(), 1);
    }

    /// Unknown commands are ignored without penalty.
    #[test]
    fn unknown_command_ignored() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.send(1, Message::Unknown("xyzzy".to_string()));
        assert!(h.sent(1).is_empty());
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 0);
    }
}
