//! Interface to the connection layer.
//!
//! The peer manager never touches sockets. It queues messages, requests
//! disconnects and consults the address book through [`ConnectionManager`];
//! the transport drains the queues asynchronously.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::peer::NodeId;
use crate::protocol::{Message, NetAddress};

/// Services the peer manager consumes from the connection layer.
pub trait ConnectionManager: Send + Sync {
    /// Queue a message for delivery to `peer`.
    fn push_message(&self, peer: NodeId, message: Message);

    /// Tear the connection down.
    fn disconnect(&self, peer: NodeId);

    /// Refuse future connections from this address for a while.
    fn discourage(&self, addr: &SocketAddr);

    /// Whether an extra outbound connection attempt would be worthwhile.
    fn set_try_new_outbound(&self, try_new: bool);

    /// Outbound full-relay connections beyond the target count.
    fn extra_outbound_count(&self) -> usize;

    /// Whether the upload budget is spent. With `historical`, whether the
    /// budget for serving old blocks is spent.
    fn outbound_target_reached(&self, historical: bool) -> bool;

    /// False if `nonce` is one of our own outbound version nonces.
    fn check_incoming_nonce(&self, nonce: u64) -> bool;

    fn add_addresses(&self, addrs: &[NetAddress], source: &SocketAddr);

    /// Up to `max` addresses, at most `max_pct` percent of the book.
    fn get_addresses(&self, max_pct: usize, max: usize) -> Vec<NetAddress>;

    fn mark_address_good(&self, addr: &SocketAddr);

    /// Our advertised address, if we have a routable one.
    fn local_address(&self) -> Option<NetAddress>;

    fn is_reachable(&self, addr: &SocketAddr) -> bool;
}

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<(NodeId, Message)>,
    disconnected: HashSet<NodeId>,
    discouraged: Vec<SocketAddr>,
    try_new_outbound: bool,
    extra_outbound: usize,
    outbound_target: bool,
    historical_target: bool,
    own_nonces: HashSet<u64>,
    book: BTreeMap<SocketAddr, NetAddress>,
    good: Vec<SocketAddr>,
    local: Option<NetAddress>,
}

/// [`ConnectionManager`] that records every call. Used by tests and by
/// in-process harnesses.
#[derive(Debug, Default)]
pub struct RecordingConnman {
    inner: Mutex<Recorded>,
}

impl RecordingConnman {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all queued messages.
    pub fn take_sent(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    /// Drain the messages queued for `peer`, leaving the rest.
    pub fn take_for(&self, peer: NodeId) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.sent)
            .into_iter()
            .partition(|(id, _)| *id == peer);
        inner.sent = rest;
        mine.into_iter().map(|(_, m)| m).collect()
    }

    /// Commands of the messages queued for `peer`, without draining.
    pub fn commands_for(&self, peer: NodeId) -> Vec<String> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| *id == peer)
            .map(|(_, m)| m.command().to_string())
            .collect()
    }

    pub fn is_disconnected(&self, peer: NodeId) -> bool {
        self.inner.lock().disconnected.contains(&peer)
    }

    pub fn discouraged(&self) -> Vec<SocketAddr> {
        self.inner.lock().discouraged.clone()
    }

    pub fn try_new_outbound(&self) -> bool {
        self.inner.lock().try_new_outbound
    }

    pub fn set_extra_outbound(&self, count: usize) {
        self.inner.lock().extra_outbound = count;
    }

    pub fn set_outbound_target_reached(&self, reached: bool, historical: bool) {
        let mut inner = self.inner.lock();
        inner.outbound_target = reached;
        inner.historical_target = historical;
    }

    pub fn add_own_nonce(&self, nonce: u64) {
        self.inner.lock().own_nonces.insert(nonce);
    }

    pub fn set_local_address(&self, addr: Option<NetAddress>) {
        self.inner.lock().local = addr;
    }

    pub fn known_addresses(&self) -> usize {
        self.inner.lock().book.len()
    }

    pub fn good_addresses(&self) -> Vec<SocketAddr> {
        self.inner.lock().good.clone()
    }
}

impl ConnectionManager for RecordingConnman {
    fn push_message(&self, peer: NodeId, message: Message) {
        let mut inner = self.inner.lock();
        if let Message::Version(v) = &message {
            inner.own_nonces.insert(v.nonce);
        }
        inner.sent.push((peer, message));
    }

    fn disconnect(&self, peer: NodeId) {
        self.inner.lock().disconnected.insert(peer);
    }

    fn discourage(&self, addr: &SocketAddr) {
        self.inner.lock().discouraged.push(*addr);
    }

    fn set_try_new_outbound(&self, try_new: bool) {
        self.inner.lock().try_new_outbound = try_new;
    }

    fn extra_outbound_count(&self) -> usize {
        self.inner.lock().extra_outbound
    }

    fn outbound_target_reached(&self, historical: bool) -> bool {
        let inner = self.inner.lock();
        if historical { inner.historical_target } else { inner.outbound_target }
    }

    fn check_incoming_nonce(&self, nonce: u64) -> bool {
        !self.inner.lock().own_nonces.contains(&nonce)
    }

    fn add_addresses(&self, addrs: &[NetAddress], _source: &SocketAddr) {
        let mut inner = self.inner.lock();
        for addr in addrs {
            inner.book.insert(addr.addr, *addr);
        }
    }

    fn get_addresses(&self, max_pct: usize, max: usize) -> Vec<NetAddress> {
        let inner = self.inner.lock();
        let cap = (inner.book.len() * max_pct / 100).min(max);
        inner.book.values().take(cap).copied().collect()
    }

    fn mark_address_good(&self, addr: &SocketAddr) {
        self.inner.lock().good.push(*addr);
    }

    fn local_address(&self) -> Option<NetAddress> {
        self.inner.lock().local
    }

    fn is_reachable(&self, _addr: &SocketAddr) -> bool {
        true
    }
}
