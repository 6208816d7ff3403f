//! Shared fixtures for the property and scenario tests.

use std::sync::Arc;
use std::time::Duration;

use weir_core::constants::{NODE_NETWORK, PROTOCOL_VERSION};
use weir_core::memory::{MemoryChain, MockClock};
use weir_core::types::{BlockHeader, Hash256, OutPoint, Transaction};
use weir_network::protocol::VersionMessage;
use weir_network::{
    ConnectionInfo, ConnectionType, Inv, Message, NodeId, PeerManager, PeerManagerConfig, PeerPermissions,
    RecordingConnman,
};

/// Start of mock time, in seconds.
pub const T0: u64 = 1_700_000_000;

/// A peer manager over an in-memory chain, a recording connection manager
/// and a mock clock.
pub struct TestNode {
    pub clock: Arc<MockClock>,
    pub chain: Arc<MemoryChain>,
    pub connman: Arc<RecordingConnman>,
    pub manager: PeerManager,
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNode {
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
        .expect("regtest config is valid");
        Self {
            clock,
            chain,
            connman,
            manager,
        }
    }

    /// Complete the handshake with peer `id` and drop what it produced.
    pub fn connect(&self, id: NodeId, conn_type: ConnectionType) {
        let info = peer_info(id, conn_type);
        self.manager.initialize_node(&info);
        self.send(id, Message::Version(peer_version(id)));
        self.send(id, Message::Verack);
        self.connman.take_for(id);
    }

    pub fn send(&self, id: NodeId, msg: Message) {
        self.manager.process_message(id, msg).expect("peer is connected");
    }

    /// Drain what was queued for `id`.
    pub fn sent(&self, id: NodeId) -> Vec<Message> {
        self.connman.take_for(id)
    }

    /// Run one send pass for `id` and drain its output.
    pub fn tick(&self, id: NodeId) -> Vec<Message> {
        self.manager.send_messages(id).expect("peer is connected");
        self.connman.take_for(id)
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn misbehavior(&self, id: NodeId) -> i32 {
        self.manager.stats(id).map_or(0, |s| s.misbehavior)
    }

    /// A transaction spending a freshly funded coin tagged by `seed`.
    pub fn funded_tx(&self, seed: u8) -> Transaction {
        let op = OutPoint::new(Hash256([seed; 32]), 0);
        self.chain.fund(op);
        weir_core::memory::make_tx(&[op], 2)
    }
}

pub fn peer_info(id: NodeId, conn_type: ConnectionType) -> ConnectionInfo {
    ConnectionInfo {
        id,
        addr: format!("10.0.0.{id}:8433").parse().expect("valid socket address"),
        name: format!("peer{id}"),
        conn_type,
        permissions: PeerPermissions::default(),
        is_local: false,
    }
}

/// The version message a well-behaved full node would send.
pub fn peer_version(id: NodeId) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: NODE_NETWORK,
        timestamp: T0,
        addr_recv: None,
        addr_from: None,
        nonce: 0x5eed_0000 + id,
        user_agent: "/weir-tests:1.0/".to_string(),
        start_height: 0,
        relay: true,
    }
}

pub fn headers_of(blocks: &[weir_core::types::Block]) -> Vec<BlockHeader> {
    blocks.iter().map(|b| b.header.clone()).collect()
}

/// Every inv requested through `getdata` in `sent`.
pub fn requested(sent: &[Message]) -> Vec<Inv> {
    sent.iter()
        .filter_map(|m| match m {
            Message::GetData(invs) => Some(invs.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Every hash announced through `inv` in `sent`.
pub fn announced(sent: &[Message]) -> Vec<Hash256> {
    sent.iter()
        .filter_map(|m| match m {
            Message::Inv(invs) => Some(invs.iter().map(|i| i.hash).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}
