//! Node configuration.
//!
//! Settings load from an optional JSON file; every field has a default so a
//! partial file (or none at all) is enough to start a node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consensus::BurnPolicy;
use crate::ledger::{LedgerParams, BURN_ADDRESS, DEFAULT_USD_PRICE, GENESIS_MINER};

/// Port every node serves the sync endpoints on.
pub const DEFAULT_PORT: u16 = 3141;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Address the sync server binds to.
    pub listen_addr: SocketAddr,
    /// Port appended to peer addresses that do not carry one.
    pub peer_port: u16,
    pub bootstrap_peers: Vec<String>,
    /// Address credited for blocks this node mines.
    pub miner_address: Option<String>,
    pub genesis_miner: String,
    pub burn_address: String,
    pub burn_policy: BurnPolicy,
    pub usd_price: u64,
    pub peer_expiry_secs: u64,
    pub sweep_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dexm_data"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peer_port: DEFAULT_PORT,
            bootstrap_peers: Vec::new(),
            miner_address: None,
            genesis_miner: GENESIS_MINER.to_string(),
            burn_address: BURN_ADDRESS.to_string(),
            burn_policy: BurnPolicy::default(),
            usd_price: DEFAULT_USD_PRICE,
            peer_expiry_secs: 60,
            sweep_interval_secs: 1,
            discovery_interval_secs: 300,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn ledger_params(&self) -> LedgerParams {
        LedgerParams {
            genesis_miner: self.genesis_miner.clone(),
            burn_address: self.burn_address.clone(),
            burn_policy: self.burn_policy,
            usd_price: self.usd_price,
        }
    }

    pub fn peer_expiry(&self) -> Duration {
        Duration::from_secs(self.peer_expiry_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
