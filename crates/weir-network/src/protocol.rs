//! Wire messages for the Weir P2P protocol.
//!
//! Every message travels as `magic || bincode(command, payload)`. The command
//! string selects the payload type; unknown commands decode to
//! [`Message::Unknown`] so the dispatcher can ignore them without treating
//! them as malformed. Per-message element ceilings are policy and enforced by
//! the handlers, not here.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use weir_core::constants::MAX_PROTOCOL_MESSAGE_LENGTH;
use weir_core::constants::{MAX_EXTVERSION_ENTRIES, MAX_EXTVERSION_MESSAGE_SIZE};
use weir_core::error::WireError;
use weir_core::types::{Block, BlockHeader, DoubleSpendProof, Hash256, Transaction};

use crate::compact::{BlockTransactions, BlockTransactionsRequest, CompactBlock};
use crate::filters::BloomFilter;

/// Command string of the double-spend proof message.
pub const DSPROOF_COMMAND: &str = "dsproof-beta";

/// Kind of object an inventory entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub enum InvKind {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CmpctBlock,
    DsProof,
}

/// One inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn new(kind: InvKind, hash: Hash256) -> Self {
        Self { kind, hash }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self::new(InvKind::Tx, hash)
    }

    pub fn block(hash: Hash256) -> Self {
        Self::new(InvKind::Block, hash)
    }

    /// Block-like kinds, including filtered and compact requests.
    pub fn is_block_kind(&self) -> bool {
        matches!(self.kind, InvKind::Block | InvKind::FilteredBlock | InvKind::CmpctBlock)
    }
}

/// Address record carried by `addr` and `addrv2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct NetAddress {
    pub addr: SocketAddr,
    pub services: u64,
    /// Last time the address was seen, in seconds since the epoch.
    pub time: u64,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: u64, time: u64) -> Self {
        Self {
            addr,
            services,
            time,
        }
    }

    /// Globally reachable address with a usable port.
    pub fn is_routable(&self) -> bool {
        if self.addr.port() == 0 {
            return false;
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_unspecified()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_documentation())
            }
            IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast()),
        }
    }
}

/// `version` payload.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    /// Sender's clock, in seconds since the epoch.
    pub timestamp: u64,
    /// How the sender sees our address.
    pub addr_recv: Option<SocketAddr>,
    pub addr_from: Option<SocketAddr>,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: u64,
    /// Whether the sender wants transaction relay before loading a filter.
    pub relay: bool,
}

/// `getblocks` / `getheaders` payload.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct LocatorRequest {
    pub locator: Vec<Hash256>,
    /// Stop after this hash. Zero means "as many as allowed".
    pub hash_stop: Hash256,
}

/// `sendcmpct` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SendCmpct {
    /// Announce new blocks with `cmpctblock` directly.
    pub announce: bool,
    pub version: u64,
}

/// `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RejectMessage {
    /// Command of the rejected message.
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub hash: Option<Hash256>,
}

/// `merkleblock` payload: a header plus the matched transaction ids, in
/// block order, for peers with a bloom filter loaded.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_txs: u32,
    pub matched: Vec<(u32, Hash256)>,
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    ExtVersion(BTreeMap<u64, Vec<u8>>),
    SendAddrV2,
    Addr(Vec<NetAddress>),
    AddrV2(Vec<NetAddress>),
    GetAddr,
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    NotFound(Vec<Inv>),
    GetBlocks(LocatorRequest),
    GetHeaders(LocatorRequest),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    MerkleBlock(MerkleBlock),
    SendHeaders,
    SendCmpct(SendCmpct),
    CmpctBlock(CompactBlock),
    GetBlockTxn(BlockTransactionsRequest),
    BlockTxn(BlockTransactions),
    Mempool,
    Ping(u64),
    Pong(u64),
    FeeFilter(u64),
    FilterLoad(BloomFilter),
    FilterAdd(Vec<u8>),
    FilterClear,
    Reject(RejectMessage),
    DsProof(DoubleSpendProof),
    /// A command we do not understand; ignored.
    Unknown(String),
}

#[derive(bincode::Encode, bincode::Decode)]
struct Envelope {
    command: String,
    payload: Vec<u8>,
}

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_PROTOCOL_MESSAGE_LENGTH>()
}

fn to_payload<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::encode_to_vec(value, wire_config()).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_payload<T: bincode::Decode<()>>(command: &str, payload: &[u8]) -> Result<T, WireError> {
    let (value, read): (T, usize) = bincode::decode_from_slice(payload, wire_config())
        .map_err(|e| WireError::Malformed {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
    if read != payload.len() {
        return Err(WireError::Malformed {
            command: command.to_string(),
            reason: format!("{} trailing bytes", payload.len() - read),
        });
    }
    Ok(value)
}

impl Message {
    /// Wire command string.
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::ExtVersion(_) => "extversion",
            Message::SendAddrV2 => "sendaddrv2",
            Message::Addr(_) => "addr",
            Message::AddrV2(_) => "addrv2",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks(_) => "getblocks",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::MerkleBlock(_) => "merkleblock",
            Message::SendHeaders => "sendheaders",
            Message::SendCmpct(_) => "sendcmpct",
            Message::CmpctBlock(_) => "cmpctblock",
            Message::GetBlockTxn(_) => "getblocktxn",
            Message::BlockTxn(_) => "blocktxn",
            Message::Mempool => "mempool",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::FeeFilter(_) => "feefilter",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::Reject(_) => "reject",
            Message::DsProof(_) => DSPROOF_COMMAND,
            Message::Unknown(command) => command.as_str(),
        }
    }

    fn payload(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Message::Verack
            | Message::SendAddrV2
            | Message::GetAddr
            | Message::SendHeaders
            | Message::Mempool
            | Message::FilterClear
            | Message::Unknown(_) => Ok(Vec::new()),
            Message::Version(v) => to_payload(v),
            Message::ExtVersion(map) => to_payload(map),
            Message::Addr(addrs) | Message::AddrV2(addrs) => to_payload(addrs),
            Message::Inv(inv) | Message::GetData(inv) | Message::NotFound(inv) => to_payload(inv),
            Message::GetBlocks(req) | Message::GetHeaders(req) => to_payload(req),
            Message::Headers(headers) => to_payload(headers),
            Message::Block(block) => to_payload(block),
            Message::Tx(tx) => to_payload(tx),
            Message::MerkleBlock(mb) => to_payload(mb),
            Message::SendCmpct(sc) => to_payload(sc),
            Message::CmpctBlock(cb) => to_payload(cb),
            Message::GetBlockTxn(req) => to_payload(req),
            Message::BlockTxn(resp) => to_payload(resp),
            Message::Ping(nonce) | Message::Pong(nonce) => to_payload(nonce),
            Message::FeeFilter(rate) => to_payload(rate),
            Message::FilterLoad(filter) => to_payload(filter),
            Message::FilterAdd(data) => to_payload(data),
            Message::Reject(reject) => to_payload(reject),
            Message::DsProof(proof) => to_payload(proof),
        }
    }

    /// Encode as `magic || bincode(command, payload)`.
    pub fn encode(&self, magic: [u8; 4]) -> Result<Vec<u8>, WireError> {
        let envelope = Envelope {
            command: self.command().to_string(),
            payload: self.payload()?,
        };
        let body = to_payload(&envelope)?;
        let size = magic.len() + body.len();
        if size > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(WireError::Oversized {
                size,
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&magic);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a framed message, checking size and magic first.
    pub fn decode(data: &[u8], magic: [u8; 4]) -> Result<Message, WireError> {
        if data.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(WireError::Oversized {
                size: data.len(),
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }
        if data.len() < magic.len() {
            return Err(WireError::Truncated);
        }
        if data[..magic.len()] != magic {
            return Err(WireError::BadMagic);
        }
        let envelope: Envelope = from_payload("envelope", &data[magic.len()..])?;
        Self::from_parts(&envelope.command, &envelope.payload)
    }

    fn from_parts(command: &str, p: &[u8]) -> Result<Message, WireError> {
        let msg = match command {
            "version" => Message::Version(from_payload(command, p)?),
            "verack" => Message::Verack,
            "extversion" => {
                if p.len() > MAX_EXTVERSION_MESSAGE_SIZE {
                    return Err(WireError::Malformed {
                        command: command.to_string(),
                        reason: format!("payload of {} bytes", p.len()),
                    });
                }
                let map: BTreeMap<u64, Vec<u8>> = from_payload(command, p)?;
                if map.len() > MAX_EXTVERSION_ENTRIES {
                    return Err(WireError::Malformed {
                        command: command.to_string(),
                        reason: format!("{} entries", map.len()),
                    });
                }
                Message::ExtVersion(map)
            }
            "sendaddrv2" => Message::SendAddrV2,
            "addr" => Message::Addr(from_payload(command, p)?),
            "addrv2" => Message::AddrV2(from_payload(command, p)?),
            "getaddr" => Message::GetAddr,
            "inv" => Message::Inv(from_payload(command, p)?),
            "getdata" => Message::GetData(from_payload(command, p)?),
            "notfound" => Message::NotFound(from_payload(command, p)?),
            "getblocks" => Message::GetBlocks(from_payload(command, p)?),
            "getheaders" => Message::GetHeaders(from_payload(command, p)?),
            "headers" => Message::Headers(from_payload(command, p)?),
            "block" => Message::Block(from_payload(command, p)?),
            "tx" => Message::Tx(from_payload(command, p)?),
            "merkleblock" => Message::MerkleBlock(from_payload(command, p)?),
            "sendheaders" => Message::SendHeaders,
            "sendcmpct" => Message::SendCmpct(from_payload(command, p)?),
            "cmpctblock" => Message::CmpctBlock(from_payload(command, p)?),
            "getblocktxn" => Message::GetBlockTxn(from_payload(command, p)?),
            "blocktxn" => Message::BlockTxn(from_payload(command, p)?),
            "mempool" => Message::Mempool,
            "ping" => Message::Ping(from_payload(command, p)?),
            "pong" => Message::Pong(from_payload(command, p)?),
            "feefilter" => Message::FeeFilter(from_payload(command, p)?),
            "filterload" => Message::FilterLoad(from_payload(command, p)?),
            "filteradd" => Message::FilterAdd(from_payload(command, p)?),
            "filterclear" => Message::FilterClear,
            "reject" => Message::Reject(from_payload(command, p)?),
            DSPROOF_COMMAND => Message::DsProof(from_payload(command, p)?),
            other => Message::Unknown(other.to_string()),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::constants::MAGIC_BYTES;
    use weir_core::memory::make_block;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn roundtrip(msg: Message) -> Message {
        let bytes = msg.encode(MAGIC_BYTES).unwrap();
        Message::decode(&bytes, MAGIC_BYTES).unwrap()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Payload-carrying and empty messages survive encoding.
    #[test]
    fn messages_roundtrip() {
        let block = make_block(Hash256::ZERO, 1_700_000_000, Vec::new());
        let samples = vec![
            Message::Verack,
            Message::Ping(7),
            Message::Headers(vec![block.header.clone()]),
            Message::Block(block.clone()),
            Message::Inv(vec![Inv::block(block.hash()), Inv::tx(Hash256([1; 32]))]),
            Message::GetHeaders(LocatorRequest {
                locator: vec![block.hash()],
                hash_stop: Hash256::ZERO,
            }),
        ];
        for msg in samples {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    /// Frames with foreign magic are refused before decoding.
    #[test]
    fn wrong_magic_rejected() {
        let bytes = Message::Verack.encode(*b"XXXX").unwrap();
        assert_eq!(Message::decode(&bytes, MAGIC_BYTES), Err(WireError::BadMagic));
    }

    /// Frames shorter than the magic are truncated.
    #[test]
    fn short_frame_truncated() {
        assert_eq!(Message::decode(b"WE", MAGIC_BYTES), Err(WireError::Truncated));
    }

    /// Unknown commands decode to the ignore arm.
    #[test]
    fn unknown_command_is_not_an_error() {
        let bytes = Message::Unknown("xyzzy".into()).encode(MAGIC_BYTES).unwrap();
        assert_eq!(
            Message::decode(&bytes, MAGIC_BYTES).unwrap(),
            Message::Unknown("xyzzy".into())
        );
    }

    /// A payload that does not parse for its command is malformed.
    #[test]
    fn bad_payload_is_malformed() {
        let envelope = Envelope {
            command: "headers".into(),
            payload: vec![0xff, 0xff, 0xff],
        };
        let mut bytes = MAGIC_BYTES.to_vec();
        bytes.extend(to_payload(&envelope).unwrap());
        assert!(matches!(
            Message::decode(&bytes, MAGIC_BYTES),
            Err(WireError::Malformed { command, .. }) if command == "headers"
        ));
    }

    /// Extended version maps above the entry ceiling are malformed.
    #[test]
    fn extversion_entry_limit() {
        let map: BTreeMap<u64, Vec<u8>> = (0..=MAX_EXTVERSION_ENTRIES as u64).map(|k| (k, vec![])).collect();
        let bytes = Message::ExtVersion(map).encode(MAGIC_BYTES).unwrap();
        assert!(matches!(
            Message::decode(&bytes, MAGIC_BYTES),
            Err(WireError::Malformed { .. })
        ));
    }

    /// Routability excludes private and loopback ranges.
    #[test]
    fn routable_addresses() {
        let public = NetAddress::new("8.8.8.8:8433".parse().unwrap(), 1, 0);
        let private = NetAddress::new("192.168.1.2:8433".parse().unwrap(), 1, 0);
        let local = NetAddress::new("127.0.0.1:8433".parse().unwrap(), 1, 0);
        assert!(public.is_routable());
        assert!(!private.is_routable());
        assert!(!local.is_routable());
    }

    /// The double-spend proof uses its own command string.
    #[test]
    fn dsproof_command_string() {
        assert_eq!(Message::Unknown(DSPROOF_COMMAND.into()).command(), "dsproof-beta");
    }
}
