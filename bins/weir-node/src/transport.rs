//! Plain TCP transport.
//!
//! Every frame is a 4-byte little-endian length followed by an encoded
//! [`Message`] (magic bytes plus bincode payload). [`TcpConnman`] is the
//! [`ConnectionManager`] the peer manager talks to; each connection runs a
//! reader loop feeding the [`SyncService`] and a writer task draining the
//! peer's outbound queue.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use weir_core::constants::MAX_PROTOCOL_MESSAGE_LENGTH;
use weir_network::{
    ConnectionInfo, ConnectionManager, ConnectionType, Message, NetAddress, NodeId, PeerPermissions, SyncService,
};

/// Size of the address book we keep in memory.
const MAX_ADDRESS_BOOK: usize = 10_000;
/// Outbound version nonces remembered for self-connection checks.
const MAX_OWN_NONCES: usize = 1_000;

struct PeerLink {
    addr: SocketAddr,
    outbound: bool,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<Notify>,
}

#[derive(Default)]
struct Book {
    addresses: HashMap<SocketAddr, NetAddress>,
    good: HashSet<SocketAddr>,
    discouraged: HashSet<std::net::IpAddr>,
}

/// Socket-backed [`ConnectionManager`].
pub struct TcpConnman {
    magic: [u8; 4],
    target_outbound: usize,
    next_id: AtomicU64,
    links: Mutex<HashMap<NodeId, PeerLink>>,
    book: Mutex<Book>,
    own_nonces: Mutex<Vec<u64>>,
    try_new_outbound: AtomicBool,
    local: Option<NetAddress>,
}

impl std::fmt::Debug for TcpConnman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnman")
            .field("peers", &self.links.lock().len())
            .field("addresses", &self.book.lock().addresses.len())
            .field("try_new_outbound", &self.try_new_outbound.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpConnman {
    pub fn new(magic: [u8; 4], target_outbound: usize, local: Option<NetAddress>) -> Self {
        Self {
            magic,
            target_outbound,
            next_id: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            book: Mutex::new(Book::default()),
            own_nonces: Mutex::new(Vec::new()),
            try_new_outbound: AtomicBool::new(false),
            local,
        }
    }

    pub fn wants_extra_outbound(&self) -> bool {
        self.try_new_outbound.load(Ordering::Relaxed)
    }

    pub fn is_discouraged(&self, addr: &SocketAddr) -> bool {
        self.book.lock().discouraged.contains(&addr.ip())
    }

    /// A known address we are not connected to.
    pub fn pick_address(&self) -> Option<SocketAddr> {
        let connected: HashSet<SocketAddr> = self.links.lock().values().map(|l| l.addr).collect();
        let book = self.book.lock();
        book.addresses
            .keys()
            .find(|a| !connected.contains(a) && !book.discouraged.contains(&a.ip()))
            .copied()
    }

    fn register(&self, addr: SocketAddr, outbound: bool) -> (NodeId, mpsc::UnboundedReceiver<Vec<u8>>, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (frames, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Notify::new());
        self.links.lock().insert(
            id,
            PeerLink {
                addr,
                outbound,
                frames,
                closed: closed.clone(),
            },
        );
        (id, rx, closed)
    }

    fn unregister(&self, id: NodeId) {
        self.links.lock().remove(&id);
    }
}

impl ConnectionManager for TcpConnman {
    fn push_message(&self, peer: NodeId, message: Message) {
        if let Message::Version(v) = &message {
            let mut nonces = self.own_nonces.lock();
            if nonces.len() >= MAX_OWN_NONCES {
                nonces.remove(0);
            }
            nonces.push(v.nonce);
        }
        let frame = match message.encode(self.magic) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer, command = message.command(), %err, "cannot encode message");
                return;
            }
        };
        if let Some(link) = self.links.lock().get(&peer) {
            // A closed queue means the writer is gone; the reader notices too.
            let _ = link.frames.send(frame);
        }
    }

    fn disconnect(&self, peer: NodeId) {
        if let Some(link) = self.links.lock().get(&peer) {
            link.closed.notify_one();
        }
    }

    fn discourage(&self, addr: &SocketAddr) {
        info!(%addr, "discouraging address");
        let mut book = self.book.lock();
        book.discouraged.insert(addr.ip());
        book.addresses.remove(addr);
    }

    fn set_try_new_outbound(&self, try_new: bool) {
        self.try_new_outbound.store(try_new, Ordering::Relaxed);
    }

    fn extra_outbound_count(&self) -> usize {
        let outbound = self.links.lock().values().filter(|l| l.outbound).count();
        outbound.saturating_sub(self.target_outbound)
    }

    fn outbound_target_reached(&self, _historical: bool) -> bool {
        false
    }

    fn check_incoming_nonce(&self, nonce: u64) -> bool {
        !self.own_nonces.lock().contains(&nonce)
    }

    fn add_addresses(&self, addrs: &[NetAddress], source: &SocketAddr) {
        let mut book = self.book.lock();
        for addr in addrs {
            if book.addresses.len() >= MAX_ADDRESS_BOOK {
                break;
            }
            book.addresses.insert(addr.addr, *addr);
        }
        debug!(%source, count = addrs.len(), known = book.addresses.len(), "addresses added");
    }

    fn get_addresses(&self, max_pct: usize, max: usize) -> Vec<NetAddress> {
        let book = self.book.lock();
        let cap = (book.addresses.len() * max_pct / 100).min(max);
        book.addresses.values().take(cap).copied().collect()
    }

    fn mark_address_good(&self, addr: &SocketAddr) {
        self.book.lock().good.insert(*addr);
    }

    fn local_address(&self) -> Option<NetAddress> {
        self.local
    }

    fn is_reachable(&self, addr: &SocketAddr) -> bool {
        addr.is_ipv4() || addr.is_ipv6()
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PROTOCOL_MESSAGE_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_PROTOCOL_MESSAGE_LENGTH}"),
        ));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frames(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        let Ok(len) = u32::try_from(frame.len()) else { continue };
        let written = async {
            writer.write_u32_le(len).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(err) = written.await {
            debug!(%err, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Drive one connection until either side closes it.
pub async fn run_connection(
    stream: TcpStream,
    conn_type: ConnectionType,
    connman: Arc<TcpConnman>,
    service: Arc<SyncService>,
) {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            debug!(%err, "connection without peer address");
            return;
        }
    };
    if connman.is_discouraged(&addr) && conn_type.is_inbound() {
        debug!(%addr, "refusing discouraged address");
        return;
    }
    let (mut reader, writer) = stream.into_split();
    let (id, frames, closed) = connman.register(addr, !conn_type.is_inbound());
    let info = ConnectionInfo {
        id,
        addr,
        name: addr.to_string(),
        conn_type,
        permissions: PeerPermissions::default(),
        is_local: addr.ip().is_loopback(),
    };
    if service.peer_connected(info).is_err() {
        connman.unregister(id);
        return;
    }
    let writer_task = tokio::spawn(write_frames(writer, frames));

    loop {
        tokio::select! {
            _ = closed.notified() => {
                debug!(peer = id, "closing on request");
                break;
            }
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(data) => {
                        if service.deliver_raw(id, data).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(peer = id, %err, "connection closed");
                        break;
                    }
                }
            }
        }
    }

    connman.unregister(id);
    writer_task.abort();
    let _ = service.peer_disconnected(id);
}

/// Accept inbound connections forever.
pub async fn accept_loop(listener: TcpListener, connman: Arc<TcpConnman>, service: Arc<SyncService>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "inbound connection");
                tokio::spawn(run_connection(stream, ConnectionType::Inbound, connman.clone(), service.clone()));
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}

/// Dial `addr` as an outbound peer.
pub async fn dial(addr: SocketAddr, conn_type: ConnectionType, connman: Arc<TcpConnman>, service: Arc<SyncService>) {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            info!(%addr, "connected");
            run_connection(stream, conn_type, connman, service).await;
        }
        Err(err) => debug!(%addr, %err, "dial failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn connman() -> TcpConnman {
        TcpConnman::new(*b"WREG", 2, None)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Our own version nonces are recognized on the way back in.
    #[test]
    fn own_nonce_detected() {
        let connman = connman();
        let version = weir_network::protocol::VersionMessage {
            version: weir_core::constants::PROTOCOL_VERSION,
            services: 1,
            timestamp: 0,
            addr_recv: None,
            addr_from: None,
            nonce: 77,
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        };
        connman.push_message(1, Message::Version(version));
        assert!(!connman.check_incoming_nonce(77));
        assert!(connman.check_incoming_nonce(78));
    }

    /// Only outbound links beyond the target count as extra.
    #[test]
    fn extra_outbound_counts_outbound_only() {
        let connman = connman();
        for port in 0..3 {
            connman.register(addr(&format!("10.0.0.1:{}", 9000 + port)), true);
        }
        connman.register(addr("10.0.0.9:9000"), false);
        assert_eq!(connman.extra_outbound_count(), 1);
    }

    /// Discouraged addresses leave the book and are never picked.
    #[test]
    fn discouraged_not_picked() {
        let connman = connman();
        let bad = NetAddress::new(addr("8.8.8.8:8433"), 1, 0);
        let source = addr("10.0.0.1:8433");
        connman.add_addresses(&[bad], &source);
        assert_eq!(connman.pick_address(), Some(bad.addr));
        connman.discourage(&bad.addr);
        assert!(connman.is_discouraged(&bad.addr));
        assert_eq!(connman.pick_address(), None);
    }

    /// Frames written by one side are read back intact by the other.
    #[tokio::test]
    async fn frames_cross_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_, writer) = client.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let frame = Message::Ping(9).encode(*b"WREG").unwrap();
        tx.send(frame.clone()).unwrap();
        drop(tx);
        writer_task.await.unwrap();

        let (mut reader, _) = server.into_split();
        let got = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, frame);
        assert_eq!(Message::decode(&got, *b"WREG").unwrap(), Message::Ping(9));
    }
}
