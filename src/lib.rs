// src/lib.rs

pub mod types;
pub mod wire;
pub mod storage;
pub mod validation;
pub mod ledger;
pub mod consensus;
pub mod peers;
pub mod mempool;
pub mod sync;
pub mod server;
pub mod node;
pub mod config;
pub mod wallet;
