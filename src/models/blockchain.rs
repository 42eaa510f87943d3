use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

pub const SHA256D_DIGEST_SIZE_IN_BYTES: usize = 32;

/// A double-SHA256 digest, the hash family used for block and transaction
/// identifiers on the Bitcoin wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha256dHash([u8; SHA256D_DIGEST_SIZE_IN_BYTES]);

impl Sha256dHash {
    pub fn new(bytes: [u8; SHA256D_DIGEST_SIZE_IN_BYTES]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes with two rounds of SHA256.
    pub fn of(data: &[u8]) -> Self {
        let first = Sha256::digest(data);
        let second = Sha256::digest(first);
        Self(second.into())
    }

    pub fn as_bytes(&self) -> &[u8; SHA256D_DIGEST_SIZE_IN_BYTES] {
        &self.0
    }
}

impl fmt::Display for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Sha256dHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256dHash({})", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Sha256dHash,
    pub merkle_root: Sha256dHash,
    pub timestamp: u32,
    pub difficulty_target: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// The block identifier: double-SHA256 over the serialized header.
    pub fn hash(&self) -> Sha256dHash {
        let bytes = bincode::serialize(self).expect("header serialization is infallible");
        Sha256dHash::of(&bytes)
    }

    /// The header this node's chain view is anchored on.
    pub fn genesis() -> Self {
        Self {
            version: 1,
            prev_block_hash: Sha256dHash::default(),
            merkle_root: Sha256dHash::default(),
            timestamp: 1_231_006_505,
            difficulty_target: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Sha256dHash {
        self.header.hash()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_output: Sha256dHash,
    pub previous_output_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// 21 million coins, in satoshis.
const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransactionVerificationError {
    #[error("transaction had no inputs or no outputs")]
    NoInputsOrOutputs,
    #[error("transaction spends the same output twice")]
    DuplicateInput,
    #[error("transaction output total out of range")]
    OutputValueOutOfRange,
}

impl Transaction {
    pub fn hash(&self) -> Sha256dHash {
        let bytes = bincode::serialize(self).expect("transaction serialization is infallible");
        Sha256dHash::of(&bytes)
    }

    /// Structural well-formedness check. No script or consensus validation
    /// happens here; anything deeper is the validators' job.
    pub fn verify(&self) -> Result<(), TransactionVerificationError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(TransactionVerificationError::NoInputsOrOutputs);
        }

        let mut spent = std::collections::HashSet::new();
        for input in &self.inputs {
            if !spent.insert((input.previous_output, input.previous_output_index)) {
                return Err(TransactionVerificationError::DuplicateInput);
            }
        }

        let mut total: u64 = 0;
        for output in &self.outputs {
            if output.value > MAX_MONEY {
                return Err(TransactionVerificationError::OutputValueOutOfRange);
            }
            total = total.saturating_add(output.value);
        }
        if total > MAX_MONEY {
            return Err(TransactionVerificationError::OutputValueOutOfRange);
        }

        Ok(())
    }
}
