//! Async driver around [`PeerManager`].
//!
//! Uses a command-channel architecture: the [`SyncService`] handle sends
//! commands over an unbounded mpsc channel to a background tokio task that
//! owns the timers. Commands are applied in arrival order; the send pass
//! runs for every peer on each tick and the stale-tip check on its own
//! slower interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use weir_core::error::WeirError;

use crate::manager::PeerManager;
use crate::peer::{ConnectionInfo, NodeId};
use crate::protocol::Message;

/// Commands sent from [`SyncService`] to the driver task.
#[derive(Debug)]
enum Command {
    PeerConnected(ConnectionInfo),
    /// An already decoded message.
    Message { peer: NodeId, msg: Message },
    /// A framed message straight off the wire.
    Raw { peer: NodeId, data: Vec<u8> },
    PeerDisconnected(NodeId),
    Shutdown,
}

/// Shared atomic state between the handle and the driver task.
#[derive(Debug)]
struct SharedState {
    running: AtomicBool,
    /// Messages handed to the manager so far.
    processed: AtomicU64,
}

/// Handle to a running synchronization driver.
///
/// Created via [`SyncService::start`], which spawns the driver onto the
/// current tokio runtime.
pub struct SyncService {
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
    manager: Arc<PeerManager>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("peers", &self.manager.peer_count())
            .field("processed", &self.state.processed.load(Ordering::Relaxed))
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncService {
    /// Spawn the driver task. Must be called from within a tokio runtime.
    pub fn start(manager: Arc<PeerManager>) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SharedState {
            running: AtomicBool::new(true),
            processed: AtomicU64::new(0),
        });
        let handle = tokio::spawn(drive(manager.clone(), command_rx, state.clone()));
        info!(
            tick_ms = manager.config().tick_interval.as_millis() as u64,
            "sync service started"
        );
        (
            Self {
                command_tx,
                state,
                manager,
            },
            handle,
        )
    }

    pub fn manager(&self) -> &Arc<PeerManager> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    /// Messages processed by the driver so far.
    pub fn processed(&self) -> u64 {
        self.state.processed.load(Ordering::Relaxed)
    }

    fn send(&self, cmd: Command) -> Result<(), WeirError> {
        self.command_tx.send(cmd).map_err(|_| WeirError::ServiceStopped)
    }

    pub fn peer_connected(&self, info: ConnectionInfo) -> Result<(), WeirError> {
        self.send(Command::PeerConnected(info))
    }

    pub fn deliver(&self, peer: NodeId, msg: Message) -> Result<(), WeirError> {
        self.send(Command::Message { peer, msg })
    }

    pub fn deliver_raw(&self, peer: NodeId, data: Vec<u8>) -> Result<(), WeirError> {
        self.send(Command::Raw { peer, data })
    }

    pub fn peer_disconnected(&self, peer: NodeId) -> Result<(), WeirError> {
        self.send(Command::PeerDisconnected(peer))
    }

    /// Ask the driver to stop after the commands already queued.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

async fn drive(manager: Arc<PeerManager>, mut command_rx: mpsc::UnboundedReceiver<Command>, state: Arc<SharedState>) {
    let mut tick = interval(manager.config().tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut eviction = interval(manager.config().eviction_check_interval);
    eviction.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::PeerConnected(info)) => manager.initialize_node(&info),
                    Some(Command::Message { peer, msg }) => {
                        state.processed.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = manager.process_message(peer, msg) {
                            debug!(peer, %err, "message not processed");
                        }
                    }
                    Some(Command::Raw { peer, data }) => {
                        state.processed.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = manager.process_raw(peer, &data) {
                            debug!(peer, %err, "raw message not processed");
                        }
                    }
                    Some(Command::PeerDisconnected(peer)) => {
                        let mark_good = manager.finalize_node(peer);
                        debug!(peer, mark_good, "peer state released");
                    }
                    Some(Command::Shutdown) | None => {
                        info!("shutting down sync service");
                        state.running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
            _ = tick.tick() => manager.send_messages_all(),
            _ = eviction.tick() => manager.check_stale_tip_and_evict_peers(),
        }
    }

    if manager.peer_count() > 0 {
        warn!(peers = manager.peer_count(), "sync service stopped with peers attached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use weir_core::memory::{MemoryChain, MockClock};

    use crate::config::PeerManagerConfig;
    use crate::connman::RecordingConnman;
    use crate::harness::{Harness, T0};
    use crate::peer::ConnectionType;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn service() -> (SyncService, JoinHandle<()>, Arc<RecordingConnman>) {
        let clock = Arc::new(MockClock::at_secs(T0));
        let chain = Arc::new(MemoryChain::new(clock.clone()));
        let connman = Arc::new(RecordingConnman::new());
        let config = PeerManagerConfig {
            tick_interval: Duration::from_millis(10),
            ..PeerManagerConfig::regtest()
        };
        let manager = PeerManager::new(config, chain.clone(), chain.clone(), chain, connman.clone(), clock).unwrap();
        let (service, handle) = SyncService::start(Arc::new(manager));
        (service, handle, connman)
    }

    fn handshake(service: &SyncService, id: NodeId) {
        service.peer_connected(Harness::info(id, ConnectionType::Inbound)).unwrap();
        service.deliver(id, Message::Version(Harness::peer_version(id))).unwrap();
        service.deliver(id, Message::Verack).unwrap();
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Commands are applied in order before shutdown completes.
    #[tokio::test]
    async fn processes_commands_in_order() {
        let (service, handle, connman) = service();
        handshake(&service, 1);
        service.shutdown();
        handle.await.unwrap();

        assert!(!service.is_running());
        assert_eq!(service.processed(), 2);
        assert_eq!(service.manager().peer_count(), 1);
        let commands = connman.commands_for(1);
        assert_eq!(commands.first().map(String::as_str), Some("version"));
        assert!(commands.iter().any(|c| c == "verack"));
    }

    /// The periodic send pass reaches connected peers.
    #[tokio::test]
    async fn tick_runs_send_pass() {
        let (service, handle, connman) = service();
        handshake(&service, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        service.shutdown();
        handle.await.unwrap();
        assert!(connman.take_for(1).iter().any(|m| matches!(m, Message::Ping(_))));
    }

    /// Disconnects release peer state; commands after shutdown fail.
    #[tokio::test]
    async fn disconnect_and_stop() {
        let (service, handle, _connman) = service();
        handshake(&service, 1);
        service.peer_disconnected(1).unwrap();
        service.shutdown();
        handle.await.unwrap();

        assert_eq!(service.manager().peer_count(), 0);
        assert!(matches!(service.deliver(1, Message::Verack), Err(WeirError::ServiceStopped)));
    }

    /// Undecodable frames are absorbed by the manager, not the driver.
    #[tokio::test]
    async fn garbage_frame_tolerated() {
        let (service, handle, _connman) = service();
        handshake(&service, 1);
        service.deliver_raw(1, vec![0xde, 0xad]).unwrap();
        service.shutdown();
        handle.await.unwrap();
        assert_eq!(service.processed(), 3);
        assert_eq!(service.manager().peer_count(), 1);
        assert!(format!("{service:?}").contains("running: false"));
    }
}
