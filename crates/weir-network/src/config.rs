//! Configuration for the peer manager and its driver.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use weir_core::constants::{NODE_BLOOM, NODE_EXTVERSION, NODE_NETWORK, NetworkType};
use weir_core::error::ConfigError;

/// Default cap on the orphan transaction pool.
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;
/// Default misbehavior score at which a peer is discouraged.
pub const DEFAULT_BANSCORE_THRESHOLD: i32 = 100;
/// Default minimum relay fee rate, per 1000 bytes.
pub const DEFAULT_MIN_RELAY_FEE_PER_KB: u64 = 1000;
/// Average delay between trickled inventory announcements to inbound peers.
pub const INVENTORY_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
/// Transactions announced per broadcast, per megabyte of block size.
pub const INVENTORY_BROADCAST_MAX_PER_MB: u64 = 7 * INVENTORY_BROADCAST_INTERVAL.as_secs();

/// Configuration for a [`PeerManager`](crate::manager::PeerManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerManagerConfig {
    /// Magic bytes framing every wire message.
    pub magic: [u8; 4],
    /// User agent advertised in our version message.
    pub user_agent: String,
    /// Maximum number of orphan transactions kept.
    pub max_orphan_txs: usize,
    /// Misbehavior score at which a peer gets discouraged.
    pub ban_threshold: i32,
    /// Send reject messages to peers.
    pub enable_bip61: bool,
    /// Offer bloom-filtered connections.
    pub enable_bloom_filters: bool,
    /// Do not relay or request transactions.
    pub blocks_only: bool,
    /// Broadcast our fee filter to peers.
    pub enable_feefilter: bool,
    /// Negotiate the extended version handshake with peers that offer it.
    #[serde(default)]
    pub enable_extversion: bool,
    /// Minimum relay fee rate, per 1000 bytes.
    pub min_relay_fee_per_kb: u64,
    /// Maximum block size in megabytes; bounds transactions trickled per announcement.
    pub max_block_size_mb: u64,
    /// Average trickle interval for transaction inventory. Zero disables the delay.
    pub inventory_broadcast_interval: Duration,
    /// How often the driver runs the per-peer send pass.
    pub tick_interval: Duration,
    /// How often the driver runs stale-tip detection and extra-peer eviction.
    pub eviction_check_interval: Duration,
    /// Seed for all randomized delays. `None` draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            magic: NetworkType::Mainnet.magic_bytes(),
            user_agent: format!("/weir:{}/", env!("CARGO_PKG_VERSION")),
            max_orphan_txs: DEFAULT_MAX_ORPHAN_TRANSACTIONS,
            ban_threshold: DEFAULT_BANSCORE_THRESHOLD,
            enable_bip61: true,
            enable_bloom_filters: false,
            blocks_only: false,
            enable_feefilter: true,
            enable_extversion: false,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            max_block_size_mb: 32,
            inventory_broadcast_interval: INVENTORY_BROADCAST_INTERVAL,
            tick_interval: Duration::from_millis(100),
            eviction_check_interval: Duration::from_secs(45),
            rng_seed: None,
        }
    }
}

impl PeerManagerConfig {
    /// Preset for a given network; only the magic bytes differ.
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            magic: network.magic_bytes(),
            ..Self::default()
        }
    }

    /// Preset for local testing: regtest magic, bloom filters on, deterministic randomness.
    pub fn regtest() -> Self {
        Self {
            magic: NetworkType::Regtest.magic_bytes(),
            enable_bloom_filters: true,
            rng_seed: Some(0x5eed),
            ..Self::default()
        }
    }

    /// Service bits we advertise.
    pub fn local_services(&self) -> u64 {
        let mut services = NODE_NETWORK;
        if self.enable_bloom_filters {
            services |= NODE_BLOOM;
        }
        if self.enable_extversion {
            services |= NODE_EXTVERSION;
        }
        services
    }

    /// Largest block we accept, in bytes.
    pub fn max_block_size(&self) -> usize {
        (self.max_block_size_mb as usize).saturating_mul(1_000_000)
    }

    /// Upper bound on transactions announced per trickle.
    pub fn max_inventory_broadcasts(&self) -> usize {
        (INVENTORY_BROADCAST_MAX_PER_MB * self.max_block_size_mb) as usize
    }

    /// Reject settings that would stall or break the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ban_threshold <= 0 {
            return Err(ConfigError::Invalid {
                field: "ban_threshold",
                reason: format!("must be positive, got {}", self.ban_threshold),
            });
        }
        if self.max_block_size_mb == 0 {
            return Err(ConfigError::Invalid {
                field: "max_block_size_mb",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tick_interval.is_zero() || self.eviction_check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "tick_interval",
                reason: "driver intervals must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = PeerManagerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_orphan_txs, DEFAULT_MAX_ORPHAN_TRANSACTIONS);
        assert_eq!(cfg.magic, NetworkType::Mainnet.magic_bytes());
    }

    #[test]
    fn bloom_flag_controls_services() {
        let mut cfg = PeerManagerConfig::default();
        assert_eq!(cfg.local_services() & NODE_BLOOM, 0);
        cfg.enable_bloom_filters = true;
        assert_ne!(cfg.local_services() & NODE_BLOOM, 0);
    }

    #[test]
    fn extversion_flag_controls_services() {
        let cfg = PeerManagerConfig {
            enable_extversion: true,
            ..PeerManagerConfig::default()
        };
        assert_ne!(cfg.local_services() & NODE_EXTVERSION, 0);
        assert_eq!(PeerManagerConfig::default().local_services() & NODE_EXTVERSION, 0);
    }

    #[test]
    fn zero_ban_threshold_rejected() {
        let cfg = PeerManagerConfig {
            ban_threshold: 0,
            ..PeerManagerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "ban_threshold", .. })
        ));
    }

    #[test]
    fn regtest_is_deterministic() {
        let cfg = PeerManagerConfig::regtest();
        assert!(cfg.rng_seed.is_some());
        assert_eq!(cfg.magic, NetworkType::Regtest.magic_bytes());
    }

    #[test]
    fn broadcast_cap_scales_with_block_size() {
        let cfg = PeerManagerConfig::default();
        assert_eq!(cfg.max_inventory_broadcasts(), 35 * 32);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = PeerManagerConfig::regtest();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PeerManagerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
