use std::collections::HashSet;

use crate::types::{CryptoError, Hash, Transaction};

/// Most transactions a pool holds before new arrivals are refused.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Signature-checked transactions waiting to be mined, in arrival order.
#[derive(Debug)]
pub struct Mempool {
    pending: Vec<(Hash, Transaction)>,
    known: HashSet<Hash>,
    capacity: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Mempool {
            pending: Vec::new(),
            known: HashSet::new(),
            capacity,
        }
    }

    /// Queue a transaction. Returns false if it is already pending or the
    /// pool is full.
    pub fn insert(&mut self, tx: Transaction) -> Result<bool, CryptoError> {
        let hash = tx.hash()?;
        if self.known.contains(&hash) || self.pending.len() >= self.capacity {
            return Ok(false);
        }
        self.known.insert(hash);
        self.pending.push((hash, tx));
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending transaction, oldest first.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.known.clear();
        self.pending.drain(..).map(|(_, tx)| tx).collect()
    }

    /// Drop transactions that a block has already included.
    pub fn remove_included(&mut self, included: &[Transaction]) {
        let hashes: HashSet<Hash> = included.iter().filter_map(|tx| tx.hash().ok()).collect();
        self.pending.retain(|(hash, _)| !hashes.contains(hash));
        self.known.retain(|hash| !hashes.contains(hash));
    }
}
