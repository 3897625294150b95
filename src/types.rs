//! Core type definitions for the Dexm node.
//!
//! This module contains the ledger data model: blocks, transactions, the
//! proof-of-work wrapper, per-address balance records, and the cryptographic
//! helpers used to hash blocks and verify transaction signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::wire;

/// 256-bit content digest used for block identity and chain links.
pub type Hash = [u8; 32];

/// The all-zero hash stands in for the blanked hash field while hashing.
pub const ZERO_HASH: Hash = [0; 32];

/// Version tag written into every serialized block.
pub const BLOCK_VERSION: u16 = 1;

/// Prefix shared by every derived wallet address.
pub const ADDRESS_PREFIX: &str = "Dexm";

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error: {0}")]
    HashConversionError(String),
    #[error("Invalid public key")]
    InvalidPublicKey,
}

/// Format a 32-byte hash as a hexadecimal string.
pub fn format_hex(bytes: &Hash) -> String {
    hex::encode(bytes)
}

fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Derive the wallet address for a sender's public key bytes.
///
/// The address is the prefix, the first 20 bytes of the key digest, and a
/// 4-byte checksum taken from the digest of that digest, all hex encoded.
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let digest = sha256(public_key);
    let checksum = sha256(&digest);
    format!(
        "{}{}{}",
        ADDRESS_PREFIX,
        hex::encode(&digest[..20]),
        hex::encode(&checksum[..4])
    )
}

/// A block in the chain.
///
/// Transaction and contract lists are carried as opaque encoded bytes; the
/// transaction list is decoded only when the block is applied to balances.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "v")]
    pub version: u16,
    /// Sequential block number starting from 0 (genesis)
    #[serde(rename = "i")]
    pub index: u64,
    /// Unix timestamp in seconds
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Content hash of this block, computed with this field blanked
    #[serde(rename = "h", with = "wire::hex_hash")]
    pub hash: Hash,
    /// Content hash of the previous block; absent for genesis
    #[serde(
        rename = "p",
        default,
        skip_serializing_if = "Option::is_none",
        with = "wire::hex_opt_hash"
    )]
    pub previous_hash: Option<Hash>,
    #[serde(
        rename = "tx",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "wire::hex_bytes"
    )]
    pub transaction_list: Vec<u8>,
    #[serde(
        rename = "c",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "wire::hex_bytes"
    )]
    pub contract_list: Vec<u8>,
    /// Address credited with the block reward and collected gas
    #[serde(rename = "m")]
    pub miner: String,
}

impl Block {
    /// Calculate the SHA-256 content hash of the block.
    ///
    /// The digest covers the canonical serialization of the block with its
    /// hash field blanked, so it is both the block's identity and the value
    /// the next block links to.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn content_hash(&self) -> Result<Hash, CryptoError> {
        let mut blanked = self.clone();
        blanked.hash = ZERO_HASH;
        let encoded = wire::encode_block(&blanked)
            .map_err(|e| CryptoError::HashConversionError(e.to_string()))?;
        Ok(sha256(&encoded))
    }

    /// Fill in the hash field from the block contents.
    pub fn seal(mut self) -> Result<Self, CryptoError> {
        self.hash = self.content_hash()?;
        Ok(self)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

/// A block wrapped with the proof-of-work nonce its miner found.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PowBlock {
    #[serde(rename = "n")]
    pub nonce: u64,
    #[serde(rename = "b")]
    pub block: Block,
}

/// Two-part transaction signature.
///
/// The halves are the `R` and `S` components of an ed25519 signature. An
/// unsigned transaction carries two empty parts.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TransactionSignature {
    #[serde(rename = "r", with = "wire::hex_bytes")]
    pub r: Vec<u8>,
    #[serde(rename = "s", with = "wire::hex_bytes")]
    pub s: Vec<u8>,
}

impl TransactionSignature {
    pub fn is_empty(&self) -> bool {
        self.r.is_empty() && self.s.is_empty()
    }

    fn to_signature(&self) -> Option<Signature> {
        if self.r.len() != 32 || self.s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        Some(Signature::from_bytes(&bytes))
    }
}

impl From<Signature> for TransactionSignature {
    fn from(sig: Signature) -> Self {
        TransactionSignature {
            r: sig.r_bytes().to_vec(),
            s: sig.s_bytes().to_vec(),
        }
    }
}

/// A signed value transfer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender's public key bytes
    #[serde(rename = "s", with = "wire::hex_bytes")]
    pub sender: Vec<u8>,
    #[serde(rename = "r")]
    pub recipient: String,
    #[serde(rename = "a")]
    pub amount: u64,
    #[serde(rename = "g")]
    pub gas: u64,
    /// Sender's nonce after this transaction
    #[serde(rename = "n")]
    pub nonce: u64,
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(rename = "rs", default)]
    pub signature: TransactionSignature,
}

impl Transaction {
    /// Build an unsigned transaction from the given sender key.
    pub fn new(
        sender: &VerifyingKey,
        recipient: impl Into<String>,
        amount: u64,
        gas: u64,
        nonce: u64,
        timestamp: i64,
    ) -> Self {
        Transaction {
            sender: sender.to_bytes().to_vec(),
            recipient: recipient.into(),
            amount,
            gas,
            nonce,
            timestamp,
            signature: TransactionSignature::default(),
        }
    }

    /// Address derived from the embedded sender key.
    pub fn sender_address(&self) -> String {
        address_from_public_key(&self.sender)
    }

    /// Canonical bytes covered by the signature: the transaction with its
    /// signature field cleared.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut unsigned = self.clone();
        unsigned.signature = TransactionSignature::default();
        wire::encode_transaction(&unsigned)
            .map_err(|e| CryptoError::HashConversionError(e.to_string()))
    }

    /// Identifier of the signed transaction.
    pub fn hash(&self) -> Result<Hash, CryptoError> {
        let encoded = wire::encode_transaction(self)
            .map_err(|e| CryptoError::HashConversionError(e.to_string()))?;
        Ok(sha256(&encoded))
    }

    /// Sign the transaction with a private key.
    ///
    /// The sender field is overwritten with the key's public half so the
    /// signature always matches the embedded key material.
    pub fn sign(&mut self, private_key: &SigningKey) -> Result<(), CryptoError> {
        self.sender = private_key.verifying_key().to_bytes().to_vec();
        let message = self.signing_bytes()?;
        self.signature = TransactionSignature::from(private_key.sign(&message));
        Ok(())
    }

    /// Verify the transaction's signature against the embedded sender key.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Signature is valid
    /// * `Ok(false)` - Signature is missing, malformed, or does not match
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` if the sender key bytes cannot
    /// be decoded.
    pub fn verify_signature(&self) -> Result<bool, CryptoError> {
        let key_bytes: [u8; 32] = self
            .sender
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let public_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;

        let Some(signature) = self.signature.to_signature() else {
            return Ok(false);
        };
        let message = self.signing_bytes()?;
        Ok(public_key.verify(&message, &signature).is_ok())
    }
}

/// Balance, nonce, and burn total tracked per address.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct WalletBalanceRecord {
    pub balance: u64,
    pub nonce: u64,
    pub burn: u64,
}
