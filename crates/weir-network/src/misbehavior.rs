//! Misbehavior scoring, reject messages and discouragement.

use tracing::warn;
use weir_core::types::Hash256;

use crate::manager::{ManagerState, PeerManager};
use crate::peer::NodeId;
use crate::protocol::{Message, RejectMessage};

/// Longest reason string we put in a reject message.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;

impl PeerManager {
    /// Penalize `id`. Crossing the threshold flags it for discouragement,
    /// which happens at the end of the current message.
    pub(crate) fn misbehaving(&self, st: &mut ManagerState, id: NodeId, howmuch: i32, reason: &str) {
        st.store.misbehaving(id, howmuch, self.config.ban_threshold, reason);
    }

    /// Send a reject if they are enabled and `code` may go on the wire.
    pub(crate) fn push_reject(
        &self,
        id: NodeId,
        message: &str,
        code: u32,
        reason: &str,
        hash: Option<Hash256>,
    ) {
        if !self.config.enable_bip61 || code == 0 {
            return;
        }
        let Ok(code) = u8::try_from(code) else { return };
        self.connman.push_message(
            id,
            Message::Reject(RejectMessage {
                message: message.to_string(),
                code,
                reason: reason.chars().take(MAX_REJECT_MESSAGE_LENGTH).collect(),
                hash,
            }),
        );
    }

    /// Flush queued block rejects, then act on a pending discourage flag.
    /// Returns true if a flag was handled, even when the peer was spared.
    pub(crate) fn send_rejects_and_check_discourage(&self, st: &mut ManagerState, id: NodeId) -> bool {
        let Some(peer) = st.store.get_mut(id) else { return false };
        let rejects = std::mem::take(&mut peer.rejects);
        if self.config.enable_bip61 {
            for reject in rejects {
                self.connman.push_message(
                    id,
                    Message::Reject(RejectMessage {
                        message: "block".to_string(),
                        code: reject.code,
                        reason: reject.reason,
                        hash: Some(reject.hash),
                    }),
                );
            }
        }

        if !peer.should_discourage {
            return false;
        }
        peer.should_discourage = false;
        if peer.permissions.noban {
            warn!(peer = id, name = %peer.name, "not punishing noban peer");
            return true;
        }
        if peer.is_manual() {
            warn!(peer = id, name = %peer.name, "not punishing manually connected peer");
            return true;
        }
        let addr = peer.addr;
        if peer.is_local {
            // Discouraging a local address would lock out everything behind it.
            warn!(peer = id, name = %peer.name, "not discouraging local peer");
        } else {
            self.connman.discourage(&addr);
        }
        self.disconnect_peer(st, id, "misbehavior threshold reached");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use crate::peer::{BlockReject, ConnectionType, PeerPermissions};
    use weir_core::validation::{REJECT_INTERNAL, REJECT_INVALID};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn score(h: &Harness, id: NodeId, howmuch: i32) -> bool {
        h.manager.with_state(|st| {
            h.manager.misbehaving(st, id, howmuch, "test");
            h.manager.send_rejects_and_check_discourage(st, id)
        })
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Scores below the threshold only accumulate.
    #[test]
    fn below_threshold_keeps_peer() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        assert!(!score(&h, 1, 99));
        assert!(!h.connman.is_disconnected(1));
        assert_eq!(h.manager.stats(1).unwrap().misbehavior, 99);
    }

    /// Crossing the threshold discourages the address and disconnects.
    #[test]
    fn threshold_discourages() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        assert!(score(&h, 1, 100));
        assert!(h.connman.is_disconnected(1));
        assert_eq!(h.connman.discouraged(), vec![Harness::info(1, ConnectionType::Inbound).addr]);
    }

    /// Noban and manual peers keep their connection, but the flag still counts as handled.
    #[test]
    fn privileged_peers_are_spared() {
        let h = Harness::new();
        let mut info = Harness::info(1, ConnectionType::Inbound);
        info.permissions = PeerPermissions {
            noban: true,
            ..PeerPermissions::default()
        };
        h.connect_with(info, Harness::peer_version(1));
        h.connect(2, ConnectionType::Manual);
        assert!(score(&h, 1, 100));
        assert!(score(&h, 2, 100));
        assert!(!h.connman.is_disconnected(1));
        assert!(!h.connman.is_disconnected(2));
        assert!(h.connman.discouraged().is_empty());
    }

    /// A handled flag is cleared, so the next check reports nothing.
    #[test]
    fn discourage_flag_handled_once() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Manual);
        assert!(score(&h, 1, 100));
        let again = h.manager.with_state(|st| h.manager.send_rejects_and_check_discourage(st, 1));
        assert!(!again);
        assert!(!h.connman.is_disconnected(1));
    }

    /// Local peers are disconnected but their address is not discouraged.
    #[test]
    fn local_peer_disconnected_only() {
        let h = Harness::new();
        let mut info = Harness::info(1, ConnectionType::Inbound);
        info.is_local = true;
        h.connect_with(info, Harness::peer_version(1));
        assert!(score(&h, 1, 100));
        assert!(h.connman.is_disconnected(1));
        assert!(h.connman.discouraged().is_empty());
    }

    /// Queued block rejects go out with the block command.
    #[test]
    fn queued_rejects_are_flushed() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        let hash = Hash256([4; 32]);
        h.manager.with_state(|st| {
            st.store.get_mut(1).unwrap().rejects.push(BlockReject {
                code: REJECT_INVALID as u8,
                reason: "bad-blk".to_string(),
                hash,
            });
            h.manager.send_rejects_and_check_discourage(st, 1);
        });
        let sent = h.sent(1);
        assert!(matches!(
            sent.as_slice(),
            [Message::Reject(r)] if r.message == "block" && r.hash == Some(hash)
        ));
    }

    /// Internal codes never reach the wire.
    #[test]
    fn internal_codes_not_sent() {
        let h = Harness::new();
        h.connect(1, ConnectionType::Inbound);
        h.manager.push_reject(1, "tx", REJECT_INTERNAL, "internal", None);
        assert!(h.sent(1).is_empty());
        h.manager.push_reject(1, "tx", REJECT_INVALID, &"x".repeat(300), None);
        let sent = h.sent(1);
        assert!(matches!(
            sent.as_slice(),
            [Message::Reject(r)] if r.reason.len() == MAX_REJECT_MESSAGE_LENGTH
        ));
    }
}
