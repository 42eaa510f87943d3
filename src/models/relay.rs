use serde::Deserialize;
use serde::Serialize;

use super::blockchain::Block;
use super::blockchain::BlockHeader;
use super::blockchain::Transaction;

/// Messages of the compact side channel spoken between cooperating relay
/// nodes. The channel's real framing is owned by the relay-protocol codec;
/// this enum is the interface the engine reacts to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Subversion of the sending relay node.
    Version(String),
    BlockHeader(BlockHeader),
    Block(Box<Block>),
    Transaction(Box<Transaction>),
    /// Free-form propagation statistics, newline separated.
    Stats(String),
}

impl RelayMessage {
    pub fn get_type(&self) -> &'static str {
        match self {
            RelayMessage::Version(_) => "version",
            RelayMessage::BlockHeader(_) => "block header",
            RelayMessage::Block(_) => "block",
            RelayMessage::Transaction(_) => "tx",
            RelayMessage::Stats(_) => "stats",
        }
    }
}
