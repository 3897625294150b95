use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::types::WalletBalanceRecord;

pub const BLOCKCHAIN_DB: &str = "blockchain.db";
pub const BALANCES_DB: &str = "balances.db";
pub const PEERS_DB: &str = "ips.db";

const LEN_KEY: &[u8] = b"len";
const BLOCK_PREFIX: u8 = b'b';

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("Corrupt entry: {0}")]
    Corrupt(String),
}

fn open_db(path: &Path) -> Result<Db, StorageError> {
    Ok(sled::open(path)?)
}

fn temporary_db() -> Result<Db, StorageError> {
    Ok(sled::Config::new().temporary(true).open()?)
}

fn block_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = BLOCK_PREFIX;
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("{what} is {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Append-only block ledger keyed by index, with an explicit length counter.
///
/// Blocks are stored as their canonical wire bytes so `/getblock` can serve
/// them without re-encoding.
#[derive(Clone)]
pub struct BlockStore {
    db: Db,
}

impl BlockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: open_db(path.as_ref())?,
        })
    }

    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self { db: temporary_db()? })
    }

    /// Number of blocks persisted so far.
    pub fn len(&self) -> Result<u64, StorageError> {
        match self.db.get(LEN_KEY)? {
            Some(raw) => decode_u64(&raw, "length counter"),
            None => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(block_key(index))?.map(|v| v.to_vec()))
    }

    /// Persist a block and bump the length counter in one batch.
    pub fn append(&self, index: u64, encoded: &[u8]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        batch.insert(block_key(index).to_vec(), encoded);
        batch.insert(LEN_KEY, (index + 1).to_be_bytes().to_vec());
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}

/// Address to `{balance, nonce, burn}` map.
#[derive(Clone)]
pub struct BalanceStore {
    db: Db,
}

impl BalanceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: open_db(path.as_ref())?,
        })
    }

    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self { db: temporary_db()? })
    }

    pub fn get(&self, address: &str) -> Result<Option<WalletBalanceRecord>, StorageError> {
        let encoded = self.db.get(address.as_bytes())?;
        Ok(encoded.map(|e| bincode::deserialize(&e)).transpose()?)
    }

    /// Record for `address`, or an empty one if it has never been touched.
    pub fn get_or_default(&self, address: &str) -> Result<WalletBalanceRecord, StorageError> {
        Ok(self.get(address)?.unwrap_or_default())
    }

    pub fn put(&self, address: &str, record: &WalletBalanceRecord) -> Result<(), StorageError> {
        let encoded = bincode::serialize(record)?;
        self.db.insert(address.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.clear()?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<(String, WalletBalanceRecord)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, encoded) = item?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|_| StorageError::Corrupt("non-utf8 address".to_string()))?;
            entries.push((address, bincode::deserialize(&encoded)?));
        }
        Ok(entries)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Peer address to last-seen unix timestamp, stored as 8 little-endian bytes.
#[derive(Clone)]
pub struct PeerStore {
    db: Db,
}

impl PeerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: open_db(path.as_ref())?,
        })
    }

    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self { db: temporary_db()? })
    }

    pub fn upsert(&self, address: &str, timestamp: i64) -> Result<(), StorageError> {
        self.db.insert(address.as_bytes(), timestamp.to_le_bytes().to_vec())?;
        Ok(())
    }

    /// Insert only if the address is unknown. Returns whether it was inserted.
    pub fn insert_if_absent(&self, address: &str, timestamp: i64) -> Result<bool, StorageError> {
        let swapped = self.db.compare_and_swap(
            address.as_bytes(),
            None as Option<&[u8]>,
            Some(&timestamp.to_le_bytes()[..]),
        )?;
        Ok(swapped.is_ok())
    }

    pub fn get(&self, address: &str) -> Result<Option<i64>, StorageError> {
        self.db
            .get(address.as_bytes())?
            .map(|raw| Self::decode_timestamp(&raw))
            .transpose()
    }

    pub fn remove(&self, address: &str) -> Result<(), StorageError> {
        self.db.remove(address.as_bytes())?;
        Ok(())
    }

    pub fn entries(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let mut entries = BTreeMap::new();
        for item in self.db.iter() {
            let (key, raw) = item?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|_| StorageError::Corrupt("non-utf8 peer address".to_string()))?;
            entries.insert(address, Self::decode_timestamp(&raw)?);
        }
        Ok(entries)
    }

    fn decode_timestamp(raw: &[u8]) -> Result<i64, StorageError> {
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| StorageError::Corrupt(format!("peer timestamp is {} bytes", raw.len())))?;
        Ok(i64::from_le_bytes(bytes))
    }
}

/// The three independent stores a node persists. There are no transactions
/// spanning more than one of them.
#[derive(Clone)]
pub struct Stores {
    pub blocks: BlockStore,
    pub balances: BalanceStore,
    pub peers: PeerStore,
}

impl Stores {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref();
        Ok(Self {
            blocks: BlockStore::open(dir.join(BLOCKCHAIN_DB))?,
            balances: BalanceStore::open(dir.join(BALANCES_DB))?,
            peers: PeerStore::open(dir.join(PEERS_DB))?,
        })
    }

    pub fn temporary() -> Result<Self, StorageError> {
        Ok(Self {
            blocks: BlockStore::temporary()?,
            balances: BalanceStore::temporary()?,
            peers: PeerStore::temporary()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_counter_tracks_appends() {
        let store = BlockStore::temporary().unwrap();
        assert!(store.is_empty().unwrap());

        store.append(0, b"genesis").unwrap();
        store.append(1, b"next").unwrap();
        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.get(1).unwrap().as_deref(), Some(&b"next"[..]));
        assert_eq!(store.get(2).unwrap(), None);
    }

    #[test]
    fn balances_default_to_zero_and_clear() {
        let store = BalanceStore::temporary().unwrap();
        assert_eq!(
            store.get_or_default("Dexmnobody").unwrap(),
            WalletBalanceRecord::default()
        );

        let record = WalletBalanceRecord {
            balance: 10,
            nonce: 2,
            burn: 3,
        };
        store.put("Dexma", &record).unwrap();
        assert_eq!(store.get("Dexma").unwrap(), Some(record));
        assert_eq!(store.entries().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn peer_timestamps_are_little_endian() {
        let store = PeerStore::temporary().unwrap();
        store.upsert("10.0.0.1", 1_700_000_000).unwrap();
        let raw = store.db.get("10.0.0.1").unwrap().unwrap();
        assert_eq!(raw.as_ref(), &1_700_000_000i64.to_le_bytes());

        assert!(!store.insert_if_absent("10.0.0.1", 5).unwrap());
        assert!(store.insert_if_absent("10.0.0.2", 5).unwrap());
        assert_eq!(store.get("10.0.0.1").unwrap(), Some(1_700_000_000));
        assert_eq!(store.entries().unwrap().len(), 2);

        store.remove("10.0.0.2").unwrap();
        assert_eq!(store.get("10.0.0.2").unwrap(), None);
    }
}
