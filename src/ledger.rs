use rand::rngs::OsRng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consensus::{self, BurnPolicy, ConsensusError};
use crate::storage::{BalanceStore, BlockStore, StorageError, BALANCES_DB, BLOCKCHAIN_DB};
use crate::types::{format_hex, Block, CryptoError, Transaction, WalletBalanceRecord, BLOCK_VERSION, ZERO_HASH};
use crate::validation::{self, ValidationError};
use crate::wire::{self, WireError};

/// Payload carried by every node's genesis block.
pub const GENESIS_PAYLOAD: &[u8] = b"Dexm genesis: value is what the network agrees to remember";
pub const GENESIS_MINER: &str = "Dexm00000000000000000000000000000000000000000000genesis";
pub const BURN_ADDRESS: &str = "Dexm000000000000000000000000000000000000000000000000burn";
pub const DEFAULT_USD_PRICE: u64 = 5;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Wire error: {0}")]
    WireError(#[from] WireError),
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),
    #[error("Block {0} not found")]
    NotFound(u64),
    #[error("Balance overflow for {0}")]
    BalanceOverflow(String),
}

/// Chain-wide parameters every node must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerParams {
    pub genesis_miner: String,
    pub burn_address: String,
    pub burn_policy: BurnPolicy,
    /// Oracle price used for the block reward.
    pub usd_price: u64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            genesis_miner: GENESIS_MINER.to_string(),
            burn_address: BURN_ADDRESS.to_string(),
            burn_policy: BurnPolicy::default(),
            usd_price: DEFAULT_USD_PRICE,
        }
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Block ledger plus the balance state derived from it.
///
/// Appends are serialized by one lock and balance application by another,
/// so compound read-modify-write updates of a balance record never
/// interleave. Lock order is always append before apply.
pub struct Ledger {
    blocks: BlockStore,
    balances: BalanceStore,
    params: LedgerParams,
    append_lock: Mutex<()>,
    apply_lock: Mutex<()>,
}

impl Ledger {
    /// Open (or create) the ledger stores under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, params: LedgerParams) -> Result<Self, LedgerError> {
        let dir = data_dir.as_ref();
        Self::new(
            BlockStore::open(dir.join(BLOCKCHAIN_DB))?,
            BalanceStore::open(dir.join(BALANCES_DB))?,
            params,
        )
    }

    /// Wrap existing stores. An empty block store is seeded with genesis and
    /// balances are rebuilt; a chain with no balance records is rebuilt too.
    pub fn new(
        blocks: BlockStore,
        balances: BalanceStore,
        params: LedgerParams,
    ) -> Result<Self, LedgerError> {
        let ledger = Ledger {
            blocks,
            balances,
            params,
            append_lock: Mutex::new(()),
            apply_lock: Mutex::new(()),
        };

        if ledger.blocks.is_empty()? {
            let genesis = Self::genesis_block(&ledger.params.genesis_miner)?;
            ledger.blocks.append(0, &wire::encode_block(&genesis)?)?;
            info!(hash = %format_hex(&genesis.hash), "Chain initialized with genesis block");
            ledger.generate_balance_db()?;
        } else if ledger.balances.entries()?.is_empty() {
            info!("Balance store is empty, replaying chain");
            ledger.generate_balance_db()?;
        }
        Ok(ledger)
    }

    /// The fixed genesis block. Its timestamp is zero so that every node
    /// derives the same hash.
    pub fn genesis_block(miner: &str) -> Result<Block, LedgerError> {
        let genesis = Block {
            version: BLOCK_VERSION,
            index: 0,
            timestamp: 0,
            hash: ZERO_HASH,
            previous_hash: None,
            transaction_list: GENESIS_PAYLOAD.to_vec(),
            contract_list: Vec::new(),
            miner: miner.to_string(),
        };
        Ok(genesis.seal()?)
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    /// Current block count.
    pub fn length(&self) -> Result<u64, LedgerError> {
        Ok(self.blocks.len()?)
    }

    /// Canonical serialized block at `index`, exactly as stored.
    pub fn get_block_bytes(&self, index: u64) -> Result<Vec<u8>, LedgerError> {
        self.blocks.get(index)?.ok_or(LedgerError::NotFound(index))
    }

    pub fn get_block(&self, index: u64) -> Result<Block, LedgerError> {
        Ok(wire::decode_block(&self.get_block_bytes(index)?)?)
    }

    pub fn last_block(&self) -> Result<Block, LedgerError> {
        let length = self.length()?;
        let last = length.checked_sub(1).ok_or(LedgerError::NotFound(0))?;
        self.get_block(last)
    }

    /// Build and persist the next block. No validation is performed;
    /// callers must validate the lists first.
    pub fn append_block(
        &self,
        transaction_list: Vec<u8>,
        contract_list: Vec<u8>,
        miner: &str,
    ) -> Result<Block, LedgerError> {
        let _guard = lock(&self.append_lock);
        self.append_block_locked(transaction_list, contract_list, miner)
    }

    fn append_block_locked(
        &self,
        transaction_list: Vec<u8>,
        contract_list: Vec<u8>,
        miner: &str,
    ) -> Result<Block, LedgerError> {
        let last = self.last_block()?;
        let block = Block {
            version: BLOCK_VERSION,
            index: last.index + 1,
            timestamp: unix_now(),
            hash: ZERO_HASH,
            previous_hash: Some(last.content_hash()?),
            transaction_list,
            contract_list,
            miner: miner.to_string(),
        }
        .seal()?;

        self.blocks.append(block.index, &wire::encode_block(&block)?)?;
        debug!(index = block.index, hash = %format_hex(&block.hash), "appended block");
        Ok(block)
    }

    /// Append a block built from `transactions` and apply it to balances.
    pub fn commit_block(
        &self,
        transactions: &[Transaction],
        contract_list: Vec<u8>,
        miner: &str,
    ) -> Result<Block, LedgerError> {
        let _guard = lock(&self.append_lock);
        let block =
            self.append_block_locked(wire::encode_transactions(transactions)?, contract_list, miner)?;
        self.process_block(&block)?;
        Ok(block)
    }

    /// Check that `candidate` is the next block of this chain: its index is
    /// the current length, it links to the hash of the last block, and its
    /// own hash matches its contents.
    ///
    /// Proof-of-work and the embedded transactions are not checked here.
    pub fn verify_new_block_validity(&self, candidate: &Block) -> Result<bool, LedgerError> {
        let length = self.length()?;
        let Some(last) = length.checked_sub(1) else {
            return Ok(false);
        };
        let previous_hash = self.get_block(last)?.content_hash()?;

        match validation::check_linkage(candidate, length, &previous_hash) {
            Ok(()) => Ok(true),
            Err(ValidationError::CryptoError(e)) => Err(e.into()),
            Err(reason) => {
                debug!(index = candidate.index, %reason, "rejected candidate block");
                Ok(false)
            }
        }
    }

    /// Validate a peer's block, persist it unchanged, and apply it.
    ///
    /// Returns `Ok(false)` when the block does not extend this chain. A
    /// block that links correctly but fails balance application stays in
    /// the chain; the error is returned.
    pub fn accept_block(&self, candidate: &Block) -> Result<bool, LedgerError> {
        let _guard = lock(&self.append_lock);
        if !self.verify_new_block_validity(candidate)? {
            return Ok(false);
        }
        self.blocks
            .append(candidate.index, &wire::encode_block(candidate)?)?;
        info!(index = candidate.index, hash = %format_hex(&candidate.hash), "accepted block");
        self.process_block(candidate)?;
        Ok(true)
    }

    /// Apply a block to the balance store.
    ///
    /// Transactions are applied in list order. The first invalid one aborts
    /// the rest of the block; anything already applied stays applied. The
    /// miner is credited with the reward and collected gas afterwards. The
    /// genesis block carries no transactions but still pays its miner.
    pub fn process_block(&self, block: &Block) -> Result<(), LedgerError> {
        let _guard = lock(&self.apply_lock);
        self.process_block_locked(block)
    }

    fn process_block_locked(&self, block: &Block) -> Result<(), LedgerError> {
        let mut total_gas: u64 = 0;

        if !block.is_genesis() {
            let transactions = wire::decode_transactions(&block.transaction_list)?;
            for tx in &transactions {
                let gas = self.apply_transaction(tx).map_err(|e| {
                    warn!(index = block.index, error = %e, "aborting block processing");
                    e
                })?;
                total_gas = total_gas
                    .checked_add(gas)
                    .ok_or_else(|| LedgerError::BalanceOverflow(block.miner.clone()))?;
            }
        }

        let reward = consensus::reward(self.params.usd_price)?;
        let mut miner = self.balances.get_or_default(&block.miner)?;
        miner.balance = miner
            .balance
            .checked_add(reward)
            .and_then(|b| b.checked_add(total_gas))
            .ok_or_else(|| LedgerError::BalanceOverflow(block.miner.clone()))?;
        self.balances.put(&block.miner, &miner)?;
        Ok(())
    }

    /// Apply one transaction and return the gas it pays.
    fn apply_transaction(&self, tx: &Transaction) -> Result<u64, LedgerError> {
        if !validation::verify_transaction_signature(tx)? {
            return Err(ValidationError::SignatureInvalid.into());
        }
        validation::check_gas_cap(tx)?;

        let sender = tx.sender_address();
        let mut record = self.balances.get_or_default(&sender)?;
        let debit = validation::check_funds(tx, &sender, &record)?;
        record.balance -= debit;
        record.nonce += 1;

        if self.burns_to_sender(tx) {
            record.burn = record
                .burn
                .checked_add(tx.amount)
                .ok_or_else(|| LedgerError::BalanceOverflow(sender.clone()))?;
            self.balances.put(&sender, &record)?;
        } else {
            self.balances.put(&sender, &record)?;
            // Recipient nonce and burn are untouched
            let mut recipient = self.balances.get_or_default(&tx.recipient)?;
            recipient.balance = recipient
                .balance
                .checked_add(tx.amount)
                .ok_or_else(|| LedgerError::BalanceOverflow(tx.recipient.clone()))?;
            self.balances.put(&tx.recipient, &recipient)?;
        }
        Ok(tx.gas)
    }

    fn burns_to_sender(&self, tx: &Transaction) -> bool {
        tx.recipient == self.params.burn_address
            && self.params.burn_policy == BurnPolicy::CreditSender
    }

    /// Rebuild the balance store from scratch by replaying every block.
    ///
    /// A block that fails processing keeps whatever it applied before the
    /// failure, as it did when first accepted, and replay moves on to the
    /// next block so rebuilt balances match the live ones.
    pub fn generate_balance_db(&self) -> Result<(), LedgerError> {
        let _guard = lock(&self.apply_lock);
        self.balances.clear()?;
        let length = self.length()?;
        let mut failed = 0usize;
        for index in 0..length {
            let block = self.get_block(index)?;
            if let Err(e) = self.process_block_locked(&block) {
                warn!(index, error = %e, "block failed during balance replay");
                failed += 1;
            }
        }
        self.balances.flush()?;
        info!(blocks = length, failed, "balance store rebuilt");
        Ok(())
    }

    pub fn get_balance(&self, address: &str) -> Result<WalletBalanceRecord, LedgerError> {
        Ok(self.balances.get_or_default(address)?)
    }

    /// Choose `n` distinct addresses weighted by their burn totals.
    pub fn get_pob_wallets(&self, n: usize) -> Result<Vec<String>, LedgerError> {
        let burns: Vec<(String, u64)> = self
            .balances
            .entries()?
            .into_iter()
            .map(|(address, record)| (address, record.burn))
            .collect();
        Ok(consensus::select_pob_wallets(&burns, n, &mut OsRng)?)
    }

    /// Dry-run `candidates` against current balances and keep those that
    /// would apply cleanly, in order.
    ///
    /// Each kept transaction must carry the sender's next nonce, so a
    /// transfer that is already on chain is never assembled again.
    pub fn select_applicable(
        &self,
        candidates: &[Transaction],
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut overlay: HashMap<String, WalletBalanceRecord> = HashMap::new();
        let mut accepted = Vec::new();

        for tx in candidates {
            match validation::verify_transaction_signature(tx) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    debug!("dropping transaction with invalid signature");
                    continue;
                }
            }
            if validation::check_gas_cap(tx).is_err() {
                continue;
            }

            let sender = tx.sender_address();
            let mut record = match overlay.get(&sender) {
                Some(record) => *record,
                None => self.balances.get_or_default(&sender)?,
            };
            if tx.nonce != record.nonce + 1 {
                debug!(
                    %sender,
                    nonce = tx.nonce,
                    expected = record.nonce + 1,
                    "dropping out-of-order or replayed transaction"
                );
                continue;
            }
            let Ok(debit) = validation::check_funds(tx, &sender, &record) else {
                debug!(%sender, "dropping transaction with insufficient funds");
                continue;
            };
            record.balance -= debit;
            record.nonce += 1;

            if self.burns_to_sender(tx) {
                record.burn = record.burn.saturating_add(tx.amount);
                overlay.insert(sender, record);
            } else {
                overlay.insert(sender, record);
                let mut recipient = match overlay.get(&tx.recipient) {
                    Some(record) => *record,
                    None => self.balances.get_or_default(&tx.recipient)?,
                };
                recipient.balance = recipient.balance.saturating_add(tx.amount);
                overlay.insert(tx.recipient.clone(), recipient);
            }
            accepted.push(tx.clone());
        }
        Ok(accepted)
    }
}
