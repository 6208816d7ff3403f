//! Connection handshake: `version`, `extversion`, `verack` and `sendaddrv2`.
//!
//! Outbound connections send `version` first. Each side answers the other's
//! `version` with `verack`, or with `extversion` when both advertise the
//! extended handshake. Feature negotiation messages (`sendaddrv2`) must
//! arrive before `verack`.

use std::collections::BTreeMap;

use tracing::{debug, info};
use weir_core::constants::{
    FEATURE_NEGOTIATION_BEFORE_VERACK_VERSION, MIN_PEER_PROTO_VERSION, NODE_EXTVERSION,
    NODE_NETWORK, NODE_NETWORK_LIMITED, PROTOCOL_VERSION, SENDHEADERS_VERSION,
    SHORT_IDS_BLOCKS_VERSION,
};
use weir_core::validation::{REJECT_DUPLICATE, REJECT_NONSTANDARD, REJECT_OBSOLETE};

use crate::manager::{ManagerState, PeerManager};
use crate::peer::{ConnectionType, NodeId};
use crate::protocol::{Message, SendCmpct, VersionMessage};

/// Longest user agent we keep.
pub const MAX_SUBVERSION_LENGTH: usize = 256;
/// Extended-version key carrying the protocol version.
pub const EXTVERSION_KEY_VERSION: u64 = 0;
/// Version of the extended handshake we speak.
pub const EXTVERSION_VERSION: u64 = 1;

/// Whether `services` include what we need from an outbound peer. Limited
/// peers are enough once we are out of initial block download.
pub fn has_desirable_services(services: u64, ibd: bool) -> bool {
    let desirable = if services & NODE_NETWORK_LIMITED != 0 && !ibd {
        NODE_NETWORK_LIMITED
    } else {
        NODE_NETWORK
    };
    services & desirable == desirable
}

impl PeerManager {
    pub(crate) fn push_version(&self, st: &mut ManagerState, id: NodeId) {
        let nonce = st.nonzero_nonce();
        let Some(peer) = st.store.get(id) else { return };
        let tip = self.chain.active_tip();
        let msg = VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.config.local_services(),
            timestamp: self.clock.now_secs(),
            addr_recv: Some(peer.addr),
            addr_from: self.connman.local_address().map(|a| a.addr),
            nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: tip.height,
            relay: !self.config.blocks_only,
        };
        debug!(peer = id, version = PROTOCOL_VERSION, start_height = tip.height, "send version");
        self.connman.push_message(id, Message::Version(msg));
    }

    pub(crate) fn on_version(&self, st: &mut ManagerState, id: NodeId, v: VersionMessage) {
        let now = self.clock.now_secs();
        let ibd = self.chain.is_initial_block_download();
        let Some(peer) = st.store.get(id) else { return };
        if peer.version != 0 {
            self.push_reject(id, "version", REJECT_DUPLICATE, "Duplicate version message", None);
            self.misbehaving(st, id, 1, "multiple-version");
            return;
        }
        let conn_type = peer.conn_type;
        let is_inbound = peer.is_inbound();
        let addr = peer.addr;

        if matches!(conn_type, ConnectionType::Outbound | ConnectionType::OneShot)
            && !has_desirable_services(v.services, ibd)
        {
            debug!(peer = id, services = v.services, "peer does not offer the expected services");
            let reason = format!("Expected to offer services {NODE_NETWORK:08x}");
            self.push_reject(id, "version", REJECT_NONSTANDARD, &reason, None);
            self.disconnect_peer(st, id, "missing services");
            return;
        }
        if v.version < MIN_PEER_PROTO_VERSION {
            debug!(peer = id, version = v.version, "peer uses obsolete version");
            let reason = format!("Version must be {MIN_PEER_PROTO_VERSION} or greater");
            self.push_reject(id, "version", REJECT_OBSOLETE, &reason, None);
            self.disconnect_peer(st, id, "obsolete version");
            return;
        }
        if is_inbound && !self.connman.check_incoming_nonce(v.nonce) {
            info!(peer = id, %addr, "connected to self, disconnecting");
            self.disconnect_peer(st, id, "self connection");
            return;
        }

        let Some(peer) = st.store.get_mut(id) else { return };
        peer.version = v.version.min(PROTOCOL_VERSION);
        peer.services = v.services;
        peer.start_height = v.start_height;
        peer.user_agent = v.user_agent.chars().take(MAX_SUBVERSION_LENGTH).collect();
        peer.inventory.relay_txes = v.relay;
        peer.client = v.services & NODE_NETWORK == 0;
        peer.limited = peer.client && v.services & NODE_NETWORK_LIMITED != 0;
        peer.time_offset = v.timestamp as i64 - now as i64;
        let wants_extversion = self.config.enable_extversion && v.services & NODE_EXTVERSION != 0;
        peer.extversion_expected = wants_extversion;
        st.store.update_preferred_download(id);

        if is_inbound {
            self.push_version(st, id);
        }
        if wants_extversion {
            let local = BTreeMap::from([(EXTVERSION_KEY_VERSION, EXTVERSION_VERSION.to_le_bytes().to_vec())]);
            self.connman.push_message(id, Message::ExtVersion(local));
        } else {
            self.push_verack(st, id);
        }

        if !is_inbound {
            if !ibd {
                self.advertise_local(st, id);
            }
            self.maybe_send_getaddr(st, id);
            self.connman.mark_address_good(&addr);
        }

        info!(
            peer = id,
            version = v.version,
            user_agent = %v.user_agent,
            start_height = v.start_height,
            inbound = is_inbound,
            "received version"
        );

        if conn_type == ConnectionType::Feeler {
            self.disconnect_peer(st, id, "feeler connection completed");
        }
    }

    pub(crate) fn on_extversion(&self, st: &mut ManagerState, id: NodeId, map: BTreeMap<u64, Vec<u8>>) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.successfully_connected || peer.extversion.is_some() {
            self.disconnect_peer(st, id, "unexpected extversion");
            return;
        }
        if !peer.extversion_expected {
            debug!(peer = id, "ignoring extversion we did not negotiate");
            return;
        }
        debug!(peer = id, entries = map.len(), "received extversion");
        peer.extversion = Some(map);
        peer.extversion_expected = false;
        self.push_verack(st, id);
        self.maybe_send_getaddr(st, id);
    }

    pub(crate) fn on_verack(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.successfully_connected {
            debug!(peer = id, "ignoring duplicate verack");
            return;
        }
        if peer.extversion_expected {
            // The peer went straight to verack; finish with the plain handshake.
            peer.extversion_expected = false;
            self.push_verack(st, id);
            self.maybe_send_getaddr(st, id);
        }
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.version >= SENDHEADERS_VERSION {
            self.connman.push_message(id, Message::SendHeaders);
        }
        if peer.version >= SHORT_IDS_BLOCKS_VERSION {
            self.connman.push_message(
                id,
                Message::SendCmpct(SendCmpct {
                    announce: false,
                    version: 1,
                }),
            );
        }
        peer.successfully_connected = true;
        debug!(peer = id, "handshake complete");
    }

    pub(crate) fn on_sendaddrv2(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.successfully_connected {
            self.disconnect_peer(st, id, "sendaddrv2 after verack");
            return;
        }
        peer.addr_relay.wants_addrv2 = true;
    }

    fn push_verack(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.sent_verack {
            return;
        }
        if peer.version >= FEATURE_NEGOTIATION_BEFORE_VERACK_VERSION {
            self.connman.push_message(id, Message::SendAddrV2);
        }
        self.connman.push_message(id, Message::Verack);
        peer.sent_verack = true;
    }

    /// Ask an outbound peer for addresses, once, after our verack went out.
    fn maybe_send_getaddr(&self, st: &mut ManagerState, id: NodeId) {
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.is_inbound()
            || peer.conn_type == ConnectionType::Feeler
            || !peer.sent_verack
            || peer.sent_getaddr
        {
            return;
        }
        peer.sent_getaddr = true;
        peer.addr_relay.getaddr_pending = true;
        self.connman.push_message(id, Message::GetAddr);
    }
}
