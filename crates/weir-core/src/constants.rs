//! Protocol constants: versions, service bits and wire ceilings.

/// Base units per coin.
pub const COIN: u64 = 100_000_000;

/// Largest amount any single value may carry.
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Whether `value` is a sane amount.
pub fn money_range(value: u64) -> bool {
    value <= MAX_MONEY
}

/// Network type: Mainnet, Testnet, or Regtest.
///
/// Controls magic bytes, default ports, data directory suffix and block spacing.
///
/// # Examples
///
/// ```
/// use weir_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.magic_bytes(), *b"WEIR");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    /// Local regression-test network with instant blocks.
    Regtest,
}

impl NetworkType {
    /// Four-byte network identifier prepended to every P2P message.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => *b"WEIR",
            Self::Testnet => *b"WTST",
            Self::Regtest => *b"WREG",
        }
    }

    /// Default TCP port for P2P connections.
    ///
    /// ```
    /// use weir_core::constants::NetworkType;
    /// assert_eq!(NetworkType::Mainnet.default_p2p_port(), 8433);
    /// ```
    pub fn default_p2p_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8433,
            Self::Testnet => 18433,
            Self::Regtest => 18544,
        }
    }

    /// Subdirectory name appended to the base data directory path.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }

    /// Expected seconds between blocks.
    pub fn target_spacing_secs(&self) -> u64 {
        match self {
            Self::Regtest => 60,
            _ => TARGET_SPACING_SECS,
        }
    }
}

/// Mainnet magic bytes.
pub const MAGIC_BYTES: [u8; 4] = *b"WEIR";

/// Default expected seconds between blocks.
pub const TARGET_SPACING_SECS: u64 = 600;

// ---- Protocol versions ----

/// Protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 70016;
/// Initial version used before negotiation completes.
pub const INIT_PROTO_VERSION: u32 = 209;
/// Peers below this are disconnected.
pub const MIN_PEER_PROTO_VERSION: u32 = 31800;
/// `pong` replies to `ping` nonces start here.
pub const BIP0031_VERSION: u32 = 60000;
/// Peers at or above this must not send bloom messages unless we advertise bloom service.
pub const NO_BLOOM_VERSION: u32 = 70011;
/// `sendheaders` starts here.
pub const SENDHEADERS_VERSION: u32 = 70012;
/// `feefilter` starts here.
pub const FEEFILTER_VERSION: u32 = 70013;
/// Compact blocks start here.
pub const SHORT_IDS_BLOCKS_VERSION: u32 = 70014;
/// Peers here are not punished for invalid compact blocks, so we may push them unsolicited.
pub const INVALID_CB_NO_BAN_VERSION: u32 = 70015;
/// `sendaddrv2` is negotiated before `verack` from here on.
pub const FEATURE_NEGOTIATION_BEFORE_VERACK_VERSION: u32 = 70016;

// ---- Service bits ----

/// Serves the full block chain.
pub const NODE_NETWORK: u64 = 1;
/// Supports bloom-filtered connections.
pub const NODE_BLOOM: u64 = 1 << 2;
/// Serves only the most recent blocks.
pub const NODE_NETWORK_LIMITED: u64 = 1 << 10;
/// Understands the extended version handshake.
pub const NODE_EXTVERSION: u64 = 1 << 11;

// ---- Size ceilings ----

/// Largest accepted wire message.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;
/// Maximum entries in an inv, getdata or notfound message.
pub const MAX_INV_SZ: usize = 50_000;
/// Maximum entries in an addr message.
pub const MAX_ADDR_TO_SEND: usize = 1000;
/// Maximum headers in one headers message.
pub const MAX_HEADERS_RESULTS: usize = 2000;
/// Maximum hashes in a block locator.
pub const MAX_LOCATOR_SZ: usize = 101;
/// Largest transaction kept in the orphan pool.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
/// Smallest serialized transaction a block can hold.
pub const MIN_TRANSACTION_SIZE: usize = 100;
/// Largest element accepted by `filteradd`.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum serialized size of an extended version payload.
pub const MAX_EXTVERSION_MESSAGE_SIZE: usize = 100_000;
/// Maximum entries in an extended version payload.
pub const MAX_EXTVERSION_ENTRIES: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_differ_per_network() {
        assert_eq!(NetworkType::Mainnet.magic_bytes(), MAGIC_BYTES);
        assert_ne!(NetworkType::Testnet.magic_bytes(), MAGIC_BYTES);
        assert_ne!(NetworkType::Regtest.magic_bytes(), NetworkType::Testnet.magic_bytes());
    }

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
    }

    #[test]
    fn version_gates_are_ordered() {
        assert!(MIN_PEER_PROTO_VERSION < BIP0031_VERSION);
        assert!(SENDHEADERS_VERSION < FEEFILTER_VERSION);
        assert!(SHORT_IDS_BLOCKS_VERSION < INVALID_CB_NO_BAN_VERSION);
        assert!(INVALID_CB_NO_BAN_VERSION <= PROTOCOL_VERSION);
    }
}
