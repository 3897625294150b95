//! Stateless checks applied to transactions and candidate blocks.

use thiserror::Error;

use crate::types::{Block, CryptoError, Hash, Transaction, WalletBalanceRecord};

/// Gas may be at most this fraction (1/N) of the transferred amount.
pub const GAS_CAP_DIVISOR: u64 = 100;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid signature")]
    SignatureInvalid,
    #[error("Gas {gas} exceeds cap {cap}")]
    GasCapExceeded { gas: u64, cap: u64 },
    #[error("transaction is invalid: {address} holds {available}, needs {needed}")]
    InsufficientFunds {
        address: String,
        needed: u64,
        available: u64,
    },
    #[error("Invalid block index: expected {expected}, got {got}")]
    IndexMismatch { expected: u64, got: u64 },
    #[error("Invalid previous hash: expected {expected}, got {got}")]
    PreviousHashMismatch { expected: String, got: String },
    #[error("Invalid block hash: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Verify a transaction's signature against its embedded sender key.
///
/// Returns an error only when the key material itself is malformed.
pub fn verify_transaction_signature(tx: &Transaction) -> Result<bool, CryptoError> {
    tx.verify_signature()
}

pub fn gas_cap(amount: u64) -> u64 {
    amount / GAS_CAP_DIVISOR
}

pub fn check_gas_cap(tx: &Transaction) -> Result<(), ValidationError> {
    let cap = gas_cap(tx.amount);
    if tx.gas > cap {
        return Err(ValidationError::GasCapExceeded { gas: tx.gas, cap });
    }
    Ok(())
}

/// Total a sender must hold to cover the transfer and its gas.
pub fn required_funds(tx: &Transaction) -> Option<u64> {
    tx.amount.checked_add(tx.gas)
}

pub fn check_funds(
    tx: &Transaction,
    sender: &str,
    record: &WalletBalanceRecord,
) -> Result<u64, ValidationError> {
    match required_funds(tx) {
        Some(needed) if record.balance >= needed => Ok(needed),
        needed => Err(ValidationError::InsufficientFunds {
            address: sender.to_string(),
            needed: needed.unwrap_or(u64::MAX),
            available: record.balance,
        }),
    }
}

/// Check that `candidate` extends a chain of `current_length` blocks whose
/// last block hashes to `previous_hash`.
///
/// Proof-of-work and the embedded transactions are not looked at here.
pub fn check_linkage(
    candidate: &Block,
    current_length: u64,
    previous_hash: &Hash,
) -> Result<(), ValidationError> {
    if candidate.index != current_length {
        return Err(ValidationError::IndexMismatch {
            expected: current_length,
            got: candidate.index,
        });
    }

    if candidate.previous_hash.as_ref() != Some(previous_hash) {
        return Err(ValidationError::PreviousHashMismatch {
            expected: hex::encode(previous_hash),
            got: candidate.previous_hash.map(hex::encode).unwrap_or_default(),
        });
    }

    let calculated = candidate.content_hash()?;
    if calculated != candidate.hash {
        return Err(ValidationError::HashMismatch {
            expected: hex::encode(calculated),
            got: hex::encode(candidate.hash),
        });
    }
    Ok(())
}
