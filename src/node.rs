//! The running node: ledger, peer registry, mempool, and the background
//! loops and HTTP server that tie them to the network.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::consensus::{ProofOfWork, UncheckedWork};
use crate::ledger::{Ledger, LedgerError};
use crate::mempool::Mempool;
use crate::peers::{self, PeerRegistry};
use crate::server;
use crate::storage::{StorageError, Stores};
use crate::sync::{self, BroadcastReport, HttpSync, SyncError, SyncLayer};
use crate::types::{format_hex, Block, CryptoError, Transaction, WalletBalanceRecord};
use crate::validation;
use crate::wire::{self, Envelope, MessageKind, WireError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Sync error: {0}")]
    SyncError(#[from] SyncError),
    #[error("Wire error: {0}")]
    WireError(#[from] WireError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Transaction signature is invalid")]
    InvalidSignature,
    #[error("Block {index} does not extend the local chain")]
    BlockRejected { index: u64 },
    #[error("Block {index} failed the proof-of-work check")]
    ProofOfWorkRejected { index: u64 },
    #[error("No miner address configured")]
    MissingMinerAddress,
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
    #[error("Node already started")]
    AlreadyStarted,
}

pub struct Node {
    config: NodeConfig,
    ledger: Arc<Ledger>,
    peers: Arc<PeerRegistry>,
    sync: Arc<dyn SyncLayer>,
    pow: Arc<dyn ProofOfWork>,
    mempool: Mutex<Mempool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Node {
    /// Open the node's stores under `config.data_dir`, seed the bootstrap
    /// peers, and wire up the HTTP sync client.
    pub fn init(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let stores = Stores::open(&config.data_dir)?;
        let sync = HttpSync::new(
            config.connect_timeout(),
            config.request_timeout(),
            config.peer_port,
        )?;
        Self::with_parts(config, stores, Arc::new(sync), Arc::new(UncheckedWork))
    }

    pub fn with_parts(
        config: NodeConfig,
        stores: Stores,
        sync: Arc<dyn SyncLayer>,
        pow: Arc<dyn ProofOfWork>,
    ) -> Result<Arc<Self>, NodeError> {
        let ledger = Ledger::new(stores.blocks, stores.balances, config.ledger_params())?;
        let peers = PeerRegistry::new(stores.peers, config.peer_expiry());
        for peer in &config.bootstrap_peers {
            peers.add_peer(peer)?;
        }
        let (shutdown, _) = watch::channel(false);

        info!(
            data_dir = %config.data_dir.display(),
            length = ledger.length()?,
            bootstrap_peers = config.bootstrap_peers.len(),
            "node initialized"
        );
        Ok(Arc::new(Node {
            config,
            ledger: Arc::new(ledger),
            peers: Arc::new(peers),
            sync,
            pow,
            mempool: Mutex::new(Mempool::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn pending_transactions(&self) -> usize {
        lock(&self.mempool).len()
    }

    /// Serve the sync endpoints and start the expiry sweep and discovery
    /// loops. Returns the bound address.
    pub fn start(self: &Arc<Self>) -> Result<SocketAddr, NodeError> {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return Err(NodeError::AlreadyStarted);
        }

        let mut stop = self.shutdown.subscribe();
        let signal = async move {
            while stop.changed().await.is_ok() {
                if *stop.borrow() {
                    break;
                }
            }
        };
        let (addr, serving) = warp::serve(server::routes(Arc::clone(self)))
            .try_bind_with_graceful_shutdown(self.config.listen_addr, signal)
            .map_err(|e| NodeError::Bind {
                addr: self.config.listen_addr,
                reason: e.to_string(),
            })?;

        tasks.push(tokio::spawn(serving));
        tasks.push(tokio::spawn(peers::run_expiry_sweep(
            Arc::clone(&self.peers),
            self.config.sweep_interval(),
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(sync::run_discovery(
            Arc::clone(&self.sync),
            Arc::clone(&self.peers),
            Arc::clone(&self.ledger),
            self.config.discovery_interval(),
            self.shutdown.subscribe(),
        )));

        info!(%addr, "node listening");
        Ok(addr)
    }

    /// Stop the server and background loops and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task ended abnormally");
            }
        }
        info!("node stopped");
    }

    /// Handle a `/newmsg` body. On success the envelope is returned so the
    /// caller can relay it.
    pub fn handle_message(&self, body: &[u8]) -> Result<Envelope, NodeError> {
        let envelope = Envelope::from_bytes(body)?;
        match envelope.kind()? {
            MessageKind::Transaction => {
                let tx = wire::decode_transaction(&envelope.data)?;
                self.queue_transaction(tx)?;
            }
            MessageKind::Block => {
                let (nonce, block) = wire::decode_block_payload(&envelope.data)?.into_parts();
                self.receive_block(nonce, &block)?;
            }
        }
        Ok(envelope)
    }

    /// Check a transaction's signature and, on a mining node, queue it.
    /// Nodes without a miner address only relay.
    fn queue_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        if !validation::verify_transaction_signature(&tx)? {
            return Err(NodeError::InvalidSignature);
        }
        if self.config.miner_address.is_none() {
            return Ok(());
        }
        let sender = tx.sender_address();
        if lock(&self.mempool).insert(tx)? {
            debug!(%sender, "queued transaction");
        } else {
            debug!(%sender, "transaction already pending or pool full");
        }
        Ok(())
    }

    fn receive_block(&self, nonce: Option<u64>, block: &Block) -> Result<(), NodeError> {
        if !self.pow.verify(nonce, block) {
            return Err(NodeError::ProofOfWorkRejected { index: block.index });
        }
        if !self.ledger.accept_block(block)? {
            return Err(NodeError::BlockRejected { index: block.index });
        }
        if let Ok(included) = wire::decode_transactions(&block.transaction_list) {
            lock(&self.mempool).remove_included(&included);
        }
        Ok(())
    }

    /// Relay `envelope` to every known peer in the background.
    pub fn broadcast(&self, envelope: Envelope) -> JoinHandle<BroadcastReport> {
        let peers = self.peers.addresses().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read peer registry");
            Vec::new()
        });
        tokio::spawn(sync::broadcast_message(Arc::clone(&self.sync), peers, envelope))
    }

    /// Queue a locally created transaction and gossip it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<JoinHandle<BroadcastReport>, NodeError> {
        let envelope = Envelope::transaction(&tx)?;
        self.queue_transaction(tx)?;
        Ok(self.broadcast(envelope))
    }

    /// Put every pending transaction that still applies into a new block,
    /// apply it, and gossip it.
    pub fn mine_block(&self) -> Result<(Block, JoinHandle<BroadcastReport>), NodeError> {
        let miner = self
            .config
            .miner_address
            .as_deref()
            .ok_or(NodeError::MissingMinerAddress)?;

        let pending = lock(&self.mempool).drain();
        let applicable = self.ledger.select_applicable(&pending)?;
        if applicable.len() < pending.len() {
            info!(dropped = pending.len() - applicable.len(), "dropped inapplicable transactions");
        }

        let block = self.ledger.commit_block(&applicable, Vec::new(), miner)?;
        info!(
            index = block.index,
            hash = %format_hex(&block.hash),
            transactions = applicable.len(),
            "mined block"
        );
        let relay = self.broadcast(Envelope::block(&block)?);
        Ok((block, relay))
    }

    pub fn balance(&self, address: &str) -> Result<WalletBalanceRecord, NodeError> {
        Ok(self.ledger.get_balance(address)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoopSync;
    use crate::types::address_from_public_key;
    use ed25519_dalek::SigningKey;

    fn funded_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    struct RejectAll;

    impl ProofOfWork for RejectAll {
        fn verify(&self, _nonce: Option<u64>, _block: &Block) -> bool {
            false
        }
    }

    fn node_with(pow: Arc<dyn ProofOfWork>) -> Arc<Node> {
        let key = funded_key();
        let config = NodeConfig {
            genesis_miner: address_from_public_key(key.verifying_key().as_bytes()),
            miner_address: Some("Dexmminer".to_string()),
            usd_price: 1,
            ..NodeConfig::default()
        };
        Node::with_parts(config, Stores::temporary().unwrap(), Arc::new(NoopSync), pow).unwrap()
    }

    fn node() -> Arc<Node> {
        node_with(Arc::new(UncheckedWork))
    }

    fn signed(amount: u64, nonce: u64) -> Transaction {
        let key = funded_key();
        let mut tx = Transaction::new(&key.verifying_key(), "Dexmrecipient", amount, 0, nonce, 1);
        tx.sign(&key).unwrap();
        tx
    }

    #[tokio::test]
    async fn gossiped_transactions_wait_for_a_block() {
        let node = node();
        let body = Envelope::transaction(&signed(40, 1)).unwrap().to_bytes().unwrap();

        node.handle_message(&body).unwrap();
        assert_eq!(node.pending_transactions(), 1);
        assert_eq!(node.balance("Dexmrecipient").unwrap().balance, 0);

        let (block, _) = node.mine_block().unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(node.pending_transactions(), 0);
        assert_eq!(node.balance("Dexmrecipient").unwrap().balance, 40);
    }

    #[tokio::test]
    async fn forged_transactions_and_garbage_are_rejected() {
        let node = node();
        let mut forged = signed(40, 1);
        forged.amount = 41;
        let body = Envelope::transaction(&forged).unwrap().to_bytes().unwrap();
        assert!(matches!(node.handle_message(&body), Err(NodeError::InvalidSignature)));
        assert!(matches!(node.handle_message(b"{"), Err(NodeError::WireError(_))));
        assert!(matches!(
            node.handle_message(br#"{"id":9,"data":""}"#),
            Err(NodeError::WireError(WireError::UnknownMessage(9)))
        ));
        assert_eq!(node.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn peer_blocks_are_accepted_once() {
        let producer = node();
        let follower = node();
        follower
            .handle_message(&Envelope::transaction(&signed(25, 1)).unwrap().to_bytes().unwrap())
            .unwrap();

        producer.submit_transaction(signed(25, 1)).unwrap().await.unwrap();
        let (block, _) = producer.mine_block().unwrap();
        let body = Envelope::block(&block).unwrap().to_bytes().unwrap();

        follower.handle_message(&body).unwrap();
        assert_eq!(follower.ledger().length().unwrap(), 2);
        assert_eq!(follower.pending_transactions(), 0);
        assert_eq!(
            follower.balance("Dexmrecipient").unwrap(),
            producer.balance("Dexmrecipient").unwrap()
        );

        assert!(matches!(
            follower.handle_message(&body),
            Err(NodeError::BlockRejected { index: 1 })
        ));
    }

    #[tokio::test]
    async fn proof_of_work_hook_can_veto_blocks() {
        let producer = node();
        let follower = node_with(Arc::new(RejectAll));
        let (block, _) = producer.mine_block().unwrap();

        let wrapped = serde_json::to_vec(&crate::types::PowBlock { nonce: 7, block }).unwrap();
        let body = Envelope::new(MessageKind::Block, wrapped).to_bytes().unwrap();
        assert!(matches!(
            follower.handle_message(&body),
            Err(NodeError::ProofOfWorkRejected { index: 1 })
        ));
        assert_eq!(follower.ledger().length().unwrap(), 1);
    }

    #[tokio::test]
    async fn returning_envelope_is_not_mined_twice() {
        let node = node();
        let body = Envelope::transaction(&signed(100, 1)).unwrap().to_bytes().unwrap();

        node.handle_message(&body).unwrap();
        node.mine_block().unwrap();
        node.handle_message(&body).unwrap();
        let (block, _) = node.mine_block().unwrap();

        assert!(wire::decode_transactions(&block.transaction_list)
            .unwrap()
            .is_empty());
        let sender = address_from_public_key(funded_key().verifying_key().as_bytes());
        assert_eq!(node.balance(&sender).unwrap().nonce, 1);
        assert_eq!(node.balance(&sender).unwrap().balance, 900);
        assert_eq!(node.balance("Dexmrecipient").unwrap().balance, 100);
    }

    #[tokio::test]
    async fn relay_only_nodes_keep_no_pending_transactions() {
        let node = Node::with_parts(
            NodeConfig::default(),
            Stores::temporary().unwrap(),
            Arc::new(NoopSync),
            Arc::new(UncheckedWork),
        )
        .unwrap();
        let body = Envelope::transaction(&signed(10, 1)).unwrap().to_bytes().unwrap();

        let relayed = node.handle_message(&body).unwrap();
        assert_eq!(relayed.to_bytes().unwrap(), body);
        assert_eq!(node.pending_transactions(), 0);

        let mut forged = signed(10, 1);
        forged.amount = 11;
        let body = Envelope::transaction(&forged).unwrap().to_bytes().unwrap();
        assert!(matches!(node.handle_message(&body), Err(NodeError::InvalidSignature)));
    }

    #[tokio::test]
    async fn mining_requires_a_miner_address() {
        let config = NodeConfig::default();
        let node = Node::with_parts(
            config,
            Stores::temporary().unwrap(),
            Arc::new(NoopSync),
            Arc::new(UncheckedWork),
        )
        .unwrap();
        assert!(matches!(node.mine_block(), Err(NodeError::MissingMinerAddress)));
    }
}
