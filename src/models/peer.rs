use serde::Deserialize;
use serde::Serialize;

use super::blockchain::Block;
use super::blockchain::BlockHeader;
use super::blockchain::Sha256dHash;
use super::blockchain::Transaction;

/// Bitcoin mainnet message-start magic.
pub const MAINNET_MAGIC: u32 = 0xD9B4_BEF9;

/// Service bit advertised so other relay nodes will talk to us.
pub const NODE_NETWORK: u64 = 1;

/// Substring that marks a peer as another relay node speaking the compact
/// relay protocol; used only to pick the source tag for the relay log.
pub const RELAY_PROTOCOL_MARKER: &str = "RelayNodeProtocol";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subversion advertised on listen sockets and trusted-peer dials.
pub fn own_subversion() -> String {
    format!("/relay-wire:{VERSION}:RelayNode:{VERSION}/")
}

/// Subversion for operator-added outbound Bitcoin P2P connections.
pub fn outbound_p2p_subversion() -> String {
    format!("/relay-wire:{VERSION}:RelayNode:{VERSION}:OutboundRelayNode - bitcoin-peering@mattcorallo.com/")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryKind {
    Block,
    Transaction,
}

/// A (kind, hash) announcement of an available object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub kind: InventoryKind,
    pub hash: Sha256dHash,
}

impl InventoryItem {
    pub fn block(hash: Sha256dHash) -> Self {
        Self {
            kind: InventoryKind::Block,
            hash,
        }
    }

    pub fn transaction(hash: Sha256dHash) -> Self {
        Self {
            kind: InventoryKind::Transaction,
            hash,
        }
    }
}

/// Payload of the version message both sides exchange when a connection is
/// established.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeData {
    pub network_magic: u32,
    pub services: u64,
    pub subversion: String,
    pub best_height: u64,
    pub timestamp: u64,
    pub nonce: u64,
}

impl HandshakeData {
    pub fn new(subversion: String) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            network_magic: MAINNET_MAGIC,
            services: NODE_NETWORK,
            subversion,
            // Fudged so that other relay nodes accept the connection.
            best_height: 1,
            timestamp,
            nonce: rand::random(),
        }
    }
}

/// Block-locator request for a headers-only chain download. A zero stop hash
/// means "no upper bound".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHeadersRequest {
    pub locator_hashes: Vec<Sha256dHash>,
    pub stop_hash: Sha256dHash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    Version(Box<HandshakeData>),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    Block(Box<Block>),
    Transaction(Box<Transaction>),
    GetHeaders(GetHeadersRequest),
    Headers(Vec<BlockHeader>),
    Ping(u64),
    Pong(u64),
}

impl PeerMessage {
    pub fn get_type(&self) -> &'static str {
        match self {
            PeerMessage::Version(_) => "version",
            PeerMessage::Inv(_) => "inv",
            PeerMessage::GetData(_) => "getdata",
            PeerMessage::Block(_) => "block",
            PeerMessage::Transaction(_) => "tx",
            PeerMessage::GetHeaders(_) => "getheaders",
            PeerMessage::Headers(_) => "headers",
            PeerMessage::Ping(_) => "ping",
            PeerMessage::Pong(_) => "pong",
        }
    }
}

/// The two object kinds that flow through pools and peer groups. Gives the
/// generic plumbing a uniform way to derive an inventory item and a wire
/// message from an object.
pub trait RelayObject: Clone + Send + Sync + 'static {
    fn inventory_kind() -> InventoryKind;
    fn hash(&self) -> Sha256dHash;
    fn to_peer_message(&self) -> PeerMessage;

    fn inventory_item(&self) -> InventoryItem {
        InventoryItem {
            kind: Self::inventory_kind(),
            hash: self.hash(),
        }
    }
}

impl RelayObject for Block {
    fn inventory_kind() -> InventoryKind {
        InventoryKind::Block
    }

    fn hash(&self) -> Sha256dHash {
        Block::hash(self)
    }

    fn to_peer_message(&self) -> PeerMessage {
        PeerMessage::Block(Box::new(self.clone()))
    }
}

impl RelayObject for Transaction {
    fn inventory_kind() -> InventoryKind {
        InventoryKind::Transaction
    }

    fn hash(&self) -> Sha256dHash {
        Transaction::hash(self)
    }

    fn to_peer_message(&self) -> PeerMessage {
        PeerMessage::Transaction(Box::new(self.clone()))
    }
}
