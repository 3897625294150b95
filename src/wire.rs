//! Canonical wire encoding.
//!
//! Blocks, transactions, and gossip envelopes travel as JSON records with
//! short field tags. Byte fields are hex encoded and empty lists are left
//! out entirely. The same encoding is what block hashes and transaction
//! signatures are computed over, so it must stay deterministic: fields are
//! always written in declaration order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Block, PowBlock, Transaction};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed input: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message id: {0}")]
    UnknownMessage(u32),
}

/// Gossip message kinds carried in an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Transaction = 1,
    Block = 2,
}

impl MessageKind {
    pub fn id(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = WireError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(MessageKind::Transaction),
            2 => Ok(MessageKind::Block),
            other => Err(WireError::UnknownMessage(other)),
        }
    }
}

/// The `{id, data}` record posted to `/newmsg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u32,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: Vec<u8>) -> Self {
        Envelope {
            id: kind.id(),
            data,
        }
    }

    pub fn transaction(tx: &Transaction) -> Result<Self, WireError> {
        Ok(Envelope::new(MessageKind::Transaction, encode_transaction(tx)?))
    }

    pub fn block(block: &Block) -> Result<Self, WireError> {
        Ok(Envelope::new(MessageKind::Block, encode_block(block)?))
    }

    pub fn kind(&self) -> Result<MessageKind, WireError> {
        MessageKind::try_from(self.id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Candidate block as received from a peer, with or without a
/// proof-of-work wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BlockPayload {
    Pow(PowBlock),
    Plain(Block),
}

impl BlockPayload {
    pub fn into_parts(self) -> (Option<u64>, Block) {
        match self {
            BlockPayload::Pow(pow) => (Some(pow.nonce), pow.block),
            BlockPayload::Plain(block) => (None, block),
        }
    }
}

pub fn encode_block(block: &Block) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(block)?)
}

pub fn decode_block(data: &[u8]) -> Result<Block, WireError> {
    Ok(serde_json::from_slice(data)?)
}

pub fn decode_block_payload(data: &[u8]) -> Result<BlockPayload, WireError> {
    Ok(serde_json::from_slice(data)?)
}

pub fn encode_transaction(tx: &Transaction) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(tx)?)
}

pub fn decode_transaction(data: &[u8]) -> Result<Transaction, WireError> {
    Ok(serde_json::from_slice(data)?)
}

/// Encode the transaction list stored inside a block.
pub fn encode_transactions(txs: &[Transaction]) -> Result<Vec<u8>, WireError> {
    if txs.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::to_vec(txs)?)
}

/// Decode a block's transaction list. An empty byte string is an empty list.
pub fn decode_transactions(data: &[u8]) -> Result<Vec<Transaction>, WireError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(data)?)
}

pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::Hash;

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut hash = [0u8; 32];
        hex::decode_to_slice(s, &mut hash).map_err(serde::de::Error::custom)?;
        Ok(hash)
    }
}

pub mod hex_opt_hash {
    use serde::{Deserializer, Serializer};

    use crate::types::Hash;

    pub fn serialize<S: Serializer>(hash: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error> {
        match hash {
            Some(hash) => super::hex_hash::serialize(hash, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Hash>, D::Error> {
        super::hex_hash::deserialize(deserializer).map(Some)
    }
}
