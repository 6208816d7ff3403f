//! Transaction request scheduling.
//!
//! Announced transactions move through a per-peer time-ordered queue. When
//! an entry falls due we either request it, or, if another peer was asked
//! recently, push it back until that request would have timed out. A single
//! [`AlreadyAskedFor`] map shared by all peers records the last request time
//! of each transaction so at most one getdata per id is outstanding.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::trace;
use weir_core::types::Hash256;

use crate::peer::TxDownloadState;

/// Outstanding transaction requests per peer.
pub const MAX_PEER_TX_IN_FLIGHT: usize = 100;
/// Announcements we track per peer before ignoring new ones.
pub const MAX_PEER_TX_ANNOUNCEMENTS: usize = 100_000;
/// Extra delay before requesting from peers that are not preferred downloads.
pub const INBOUND_PEER_TX_DELAY: Duration = Duration::from_secs(2);
/// How long to wait for one peer before asking another for the same transaction.
pub const GETDATA_TX_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_GETDATA_RANDOM_DELAY: Duration = Duration::from_secs(2);
/// Requests older than this are dropped from the peer's tracking.
pub const TX_EXPIRY_INTERVAL: Duration = Duration::from_secs(600);
const ALREADY_ASKED_FOR_CAPACITY: usize = 50_000;

/// When each transaction was last requested from any peer.
///
/// Bounded; once full, the entry with the oldest request time is evicted.
#[derive(Debug, Clone)]
pub struct AlreadyAskedFor {
    capacity: usize,
    times: HashMap<Hash256, Duration>,
    by_time: BTreeSet<(Duration, Hash256)>,
}

impl Default for AlreadyAskedFor {
    fn default() -> Self {
        Self::new(ALREADY_ASKED_FOR_CAPACITY)
    }
}

impl AlreadyAskedFor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            times: HashMap::new(),
            by_time: BTreeSet::new(),
        }
    }

    pub fn get(&self, txid: &Hash256) -> Option<Duration> {
        self.times.get(txid).copied()
    }

    pub fn update(&mut self, txid: Hash256, at: Duration) {
        if let Some(old) = self.times.insert(txid, at) {
            self.by_time.remove(&(old, txid));
        }
        self.by_time.insert((at, txid));
        while self.times.len() > self.capacity {
            let Some(oldest) = self.by_time.pop_first() else { break };
            self.times.remove(&oldest.1);
        }
    }

    pub fn erase(&mut self, txid: &Hash256) {
        if let Some(old) = self.times.remove(txid) {
            self.by_time.remove(&(old, *txid));
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

fn random_delay(rng: &mut StdRng, max: Duration) -> Duration {
    let micros = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
    if micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rng.gen_range(0..micros))
}

/// Earliest time to consider requesting `txid`.
fn get_data_time(
    txid: &Hash256,
    now: Duration,
    inbound_delay: bool,
    asked: &AlreadyAskedFor,
    rng: &mut StdRng,
) -> Duration {
    let base = match asked.get(txid) {
        None => now,
        Some(last) => last + GETDATA_TX_INTERVAL + random_delay(rng, MAX_GETDATA_RANDOM_DELAY),
    };
    if inbound_delay {
        base + INBOUND_PEER_TX_DELAY
    } else {
        base
    }
}

impl TxDownloadState {
    /// Record an announcement of `txid`. Repeats and announcements past the
    /// per-peer cap are ignored.
    pub fn request_tx(
        &mut self,
        txid: Hash256,
        preferred: bool,
        asked: &AlreadyAskedFor,
        rng: &mut StdRng,
        now: Duration,
    ) {
        if self.announced.len() >= MAX_PEER_TX_ANNOUNCEMENTS
            || self.process_queue.len() >= MAX_PEER_TX_ANNOUNCEMENTS
            || self.announced.contains(&txid)
        {
            return;
        }
        self.announced.insert(txid);
        let at = get_data_time(&txid, now, !preferred, asked, rng);
        self.process_queue.insert((at, txid));
    }

    /// Pop due announcements and return the ids to request now.
    ///
    /// `already_have` reports transactions we no longer need. Ids requested
    /// from another peer within [`GETDATA_TX_INTERVAL`] are rescheduled.
    pub fn drain_due(
        &mut self,
        preferred: bool,
        asked: &mut AlreadyAskedFor,
        rng: &mut StdRng,
        now: Duration,
        already_have: impl Fn(&Hash256) -> bool,
    ) -> Vec<Hash256> {
        let mut to_request = Vec::new();
        while self.in_flight.len() < MAX_PEER_TX_IN_FLIGHT {
            let Some(&(at, txid)) = self.process_queue.first() else { break };
            if at > now {
                break;
            }
            self.process_queue.pop_first();
            if already_have(&txid) {
                self.announced.remove(&txid);
                continue;
            }
            let stale = asked.get(&txid).is_none_or(|last| last + GETDATA_TX_INTERVAL <= now);
            if stale {
                trace!(%txid, "requesting transaction");
                asked.update(txid, now);
                self.in_flight.insert(txid, now);
                to_request.push(txid);
            } else {
                let next = get_data_time(&txid, now, !preferred, asked, rng);
                self.process_queue.insert((next, txid));
            }
        }
        to_request
    }

    /// Drop requests that went unanswered for [`TX_EXPIRY_INTERVAL`] so the
    /// transaction can be fetched elsewhere. Runs at a randomized cadence.
    pub fn expire_stale(&mut self, rng: &mut StdRng, now: Duration) -> usize {
        if self.check_expiry_timer > now {
            return 0;
        }
        let expired: Vec<Hash256> = self
            .in_flight
            .iter()
            .filter(|(_, sent)| **sent + TX_EXPIRY_INTERVAL <= now)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &expired {
            self.in_flight.remove(txid);
            self.announced.remove(txid);
        }
        self.check_expiry_timer = now + TX_EXPIRY_INTERVAL / 2 + random_delay(rng, TX_EXPIRY_INTERVAL);
        expired.len()
    }

    /// Forget `txid` after it arrived or the peer said it was not found.
    /// Returns whether it was in flight.
    pub fn forget(&mut self, txid: &Hash256) -> bool {
        self.announced.remove(txid);
        self.in_flight.remove(txid).is_some()
    }
}
