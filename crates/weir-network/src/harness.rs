//! In-process fixture shared by the handler tests: a peer manager over an
//! in-memory chain, a recording connection manager and a mock clock.

use std::sync::Arc;
use std::time::Duration;

use weir_core::constants::{NODE_NETWORK, PROTOCOL_VERSION};
use weir_core::memory::{MemoryChain, MockClock};
use weir_core::types::Block;

use crate::config::PeerManagerConfig;
use crate::connman::RecordingConnman;
use crate::manager::PeerManager;
use crate::peer::{ConnectionInfo, ConnectionType, NodeId, PeerPermissions};
use crate::protocol::{Message, VersionMessage};

/// Start of mock time, in seconds.
pub(crate) const T0: u64 = 1_700_000_000;

pub(crate) struct Harness {
    pub clock: Arc<MockClock>,
    pub chain: Arc<MemoryChain>,
    pub connman: Arc<RecordingConnman>,
    pub manager: PeerManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PeerManagerConfig::regtest())
    }

    pub fn with_config(config: PeerManagerConfig) -> Self {
        let clock = Arc::new(MockClock::at_secs(T0));
        let chain = Arc::new(MemoryChain::new(clock.clone()));
        let connman = Arc::new(RecordingConnman::new());
        let manager = PeerManager::new(
            config,
            chain.clone(),
            chain.clone(),
            chain.clone(),
            connman.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            clock,
            chain,
            connman,
            manager,
        }
    }

    pub fn info(id: NodeId, conn_type: ConnectionType) -> ConnectionInfo {
        ConnectionInfo {
            id,
            addr: format!("10.0.0.{id}:8433").parse().unwrap(),
            name: format!("peer{id}"),
            conn_type,
            permissions: PeerPermissions::default(),
            is_local: false,
        }
    }

    /// The version message a well-behaved full node would send us.
    pub fn peer_version(id: NodeId) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: T0,
            addr_recv: None,
            addr_from: None,
            nonce: 0xabc0_0000 + id,
            user_agent: "/test:1.0/".to_string(),
            start_height: 0,
            relay: true,
        }
    }

    /// Complete the handshake with a default peer and drop what it produced.
    pub fn connect(&self, id: NodeId, conn_type: ConnectionType) {
        self.connect_with(Self::info(id, conn_type), Self::peer_version(id));
    }

    pub fn connect_with(&self, info: ConnectionInfo, version: VersionMessage) {
        let id = info.id;
        self.manager.initialize_node(&info);
        self.send(id, Message::Version(version));
        self.send(id, Message::Verack);
        self.connman.take_for(id);
    }

    pub fn send(&self, id: NodeId, msg: Message) {
        self.manager.process_message(id, msg).unwrap();
    }

    /// Drain what was queued for `id`.
    pub fn sent(&self, id: NodeId) -> Vec<Message> {
        self.connman.take_for(id)
    }

    /// Run one send pass for `id` and drain its output.
    pub fn tick(&self, id: NodeId) -> Vec<Message> {
        self.manager.send_messages(id).unwrap();
        self.connman.take_for(id)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Mine `count` blocks straight into the chain, bypassing the manager.
    pub fn mine(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.chain.mine_block(Vec::new())).collect()
    }
}
