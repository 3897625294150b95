//! Wallet files used by the command line.
//!
//! A wallet file holds an ed25519 secret key plus the sender nonce last
//! used, so consecutive transactions from the same file get increasing
//! nonces.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{address_from_public_key, CryptoError, Transaction, WalletBalanceRecord};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Failed to access wallet {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid wallet {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid secret key in wallet")]
    InvalidKey,
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletFile {
    pub address: String,
    /// Hex encoded 32-byte ed25519 secret key.
    pub secret_key: String,
    pub nonce: u64,
    /// Last balance seen in a local ledger; informational only.
    #[serde(default)]
    pub balance: u64,
}

impl WalletFile {
    pub fn generate() -> Self {
        Self::from_key(&SigningKey::generate(&mut OsRng))
    }

    pub fn from_key(key: &SigningKey) -> Self {
        WalletFile {
            address: address_from_public_key(key.verifying_key().as_bytes()),
            secret_key: hex::encode(key.to_bytes()),
            nonce: 0,
            balance: 0,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| WalletError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| WalletError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalletError> {
        let path = path.as_ref();
        let encoded = serde_json::to_vec_pretty(self).map_err(|source| WalletError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, encoded).map_err(|source| WalletError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn signing_key(&self) -> Result<SigningKey, WalletError> {
        let mut secret = [0u8; 32];
        hex::decode_to_slice(&self.secret_key, &mut secret).map_err(|_| WalletError::InvalidKey)?;
        Ok(SigningKey::from_bytes(&secret))
    }

    /// Sign a transfer with the next nonce. The caller saves the file
    /// afterwards so the nonce is not reused.
    pub fn new_transaction(
        &mut self,
        recipient: &str,
        amount: u64,
        gas: u64,
        timestamp: i64,
    ) -> Result<Transaction, WalletError> {
        let key = self.signing_key()?;
        let nonce = self.nonce + 1;
        let mut tx = Transaction::new(&key.verifying_key(), recipient, amount, gas, nonce, timestamp);
        tx.sign(&key)?;
        self.nonce = nonce;
        Ok(tx)
    }

    /// Copy balance and nonce from a ledger record.
    pub fn sync_from(&mut self, record: &WalletBalanceRecord) {
        self.balance = record.balance;
        self.nonce = record.nonce;
    }
}
