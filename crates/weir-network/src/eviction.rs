//! Outbound peer rotation.
//!
//! Outbound slots are scarce, so peers that cannot show us a chain as good
//! as ours are eventually replaced, and when our tip looks stale the
//! connection manager is told to try an extra outbound peer.

use std::time::Duration;

use tracing::{debug, info};
use weir_core::types::Hash256;

use crate::manager::{ManagerState, PeerManager};
use crate::peer::NodeId;
use crate::protocol::{LocatorRequest, Message};

/// How long an outbound peer has to reach our tip's work.
pub const CHAIN_SYNC_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Grace period for the final `getheaders` before disconnecting.
pub const HEADERS_RESPONSE_TIME: Duration = Duration::from_secs(2 * 60);
/// Extra outbound peers younger than this are never evicted.
pub const MINIMUM_CONNECT_TIME: Duration = Duration::from_secs(30);
/// Interval between stale-tip checks.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Target spacings without a new tip after which it may be stale.
const STALE_TIP_SPACINGS: u32 = 3;

impl PeerManager {
    /// Start, clear or act on the chain-sync timer of an outbound peer.
    pub(crate) fn consider_eviction(&self, st: &mut ManagerState, id: NodeId, now: Duration) {
        let tip = self.chain.active_tip();
        let Some(peer) = st.store.get_mut(id) else { return };
        if peer.chain_sync.protect || !peer.is_outbound_disconnection_candidate() || !peer.sync_started {
            return;
        }
        let best_known = peer.best_known_block.and_then(|h| self.chain.lookup(&h));
        let sync = &mut peer.chain_sync;

        if best_known.as_ref().is_some_and(|b| b.chain_work >= tip.chain_work) {
            if sync.timeout.is_some() {
                sync.timeout = None;
                sync.work_header = None;
                sync.sent_getheaders = false;
            }
            return;
        }

        let caught_up_to_mark = sync
            .work_header
            .and_then(|h| self.chain.lookup(&h))
            .zip(best_known.as_ref())
            .is_some_and(|(mark, best)| best.chain_work >= mark.chain_work);
        let timeout = sync.timeout;
        match timeout {
            None => {
                sync.timeout = Some(now + CHAIN_SYNC_TIMEOUT);
                sync.work_header = Some(tip.hash);
                sync.sent_getheaders = false;
            }
            Some(_) if caught_up_to_mark => {
                // Progress, but the goal moved on; start over against the new tip.
                sync.timeout = Some(now + CHAIN_SYNC_TIMEOUT);
                sync.work_header = Some(tip.hash);
                sync.sent_getheaders = false;
            }
            Some(timeout) if now > timeout => {
                if sync.sent_getheaders {
                    let best = best_known.map_or_else(|| "<none>".to_string(), |b| b.hash.to_string());
                    info!(peer = id, best_known = %best, "outbound peer has an old chain, disconnecting");
                    self.disconnect_peer(st, id, "chain-sync timeout");
                    return;
                }
                let Some(mark) = sync.work_header.and_then(|h| self.chain.lookup(&h)) else { return };
                debug!(peer = id, work_header = %mark.hash, "sending getheaders to verify chain work");
                sync.sent_getheaders = true;
                sync.timeout = Some(now + HEADERS_RESPONSE_TIME);
                let from = self.chain.lookup(&mark.prev_hash()).unwrap_or(mark);
                self.connman.push_message(
                    id,
                    Message::GetHeaders(LocatorRequest {
                        locator: self.chain.locator(&from),
                        hash_stop: Hash256::ZERO,
                    }),
                );
            }
            Some(_) => {}
        }
    }

    /// With more outbound peers than the target, drop the one that
    /// announced a new block least recently.
    pub(crate) fn evict_extra_outbound_peers(&self, st: &mut ManagerState, now: Duration) {
        if self.connman.extra_outbound_count() == 0 {
            return;
        }
        let worst = st
            .store
            .iter()
            .filter(|p| p.is_outbound_disconnection_candidate() && !p.disconnect && !p.chain_sync.protect)
            // Oldest announcement first, youngest connection on ties.
            .min_by(|a, b| {
                a.last_block_announcement
                    .cmp(&b.last_block_announcement)
                    .then(b.id.cmp(&a.id))
            })
            .map(|p| (p.id, p.connected_at, p.blocks_in_flight_count()));
        let Some((id, connected_at, in_flight)) = worst else { return };

        if now.saturating_sub(connected_at) > MINIMUM_CONNECT_TIME && in_flight == 0 {
            info!(peer = id, "disconnecting extra outbound peer");
            self.disconnect_peer(st, id, "extra outbound peer");
            // The extra connection did its job; no more until the tip looks stale again.
            self.connman.set_try_new_outbound(false);
        } else {
            debug!(peer = id, in_flight, "keeping outbound peer for now");
        }
    }

    /// No new tip for a while and nothing in flight.
    pub(crate) fn tip_may_be_stale(&self, st: &mut ManagerState) -> bool {
        let now = self.clock.now();
        if st.last_tip_update.is_zero() {
            st.last_tip_update = now;
        }
        st.last_tip_update + self.chain.target_spacing() * STALE_TIP_SPACINGS < now
            && st.store.blocks_in_flight_total() == 0
    }

    pub(crate) fn stale_tip_check(&self, st: &mut ManagerState) {
        let now = self.clock.now();
        self.evict_extra_outbound_peers(st, now);
        if now <= st.stale_tip_check_time {
            return;
        }
        if self.tip_may_be_stale(st) {
            let since = now.saturating_sub(st.last_tip_update).as_secs();
            info!(seconds = since, "potential stale tip detected, will try an extra outbound peer");
            self.connman.set_try_new_outbound(true);
        } else {
            self.connman.set_try_new_outbound(false);
        }
        st.stale_tip_check_time = now + STALE_CHECK_INTERVAL;
    }
}
