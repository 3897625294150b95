use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::ledger::{Ledger, LedgerError};
use crate::peers::{is_peer_address, PeerRegistry};
use crate::storage::StorageError;
use crate::types::Block;
use crate::wire::{self, Envelope, WireError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    NetworkError(reqwest::Error),
    #[error("Connection timeout")]
    ConnectionTimeout,
    #[error("Peer {peer} answered {status}: {body}")]
    PeerRejected {
        peer: String,
        status: u16,
        body: String,
    },
    #[error("Invalid response from {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
    #[error("Wire error: {0}")]
    WireError(#[from] WireError),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Synchronization is not available on this layer")]
    Unsupported,
}

fn network_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::ConnectionTimeout
    } else {
        SyncError::NetworkError(e)
    }
}

/// Client side of the four sync endpoints.
#[async_trait]
pub trait SyncLayer: Send + Sync {
    /// Fetch a peer's registry (`GET /getaddr`).
    async fn get_addr(&self, peer: &str) -> Result<BTreeMap<String, i64>, SyncError>;

    /// Fetch a peer's chain length (`GET /getlen`).
    async fn get_len(&self, peer: &str) -> Result<u64, SyncError>;

    /// Fetch one block from a peer (`GET /getblock?index=N`).
    async fn get_block(&self, peer: &str, index: u64) -> Result<Block, SyncError>;

    /// Deliver a gossip envelope (`POST /newmsg`).
    async fn post_message(&self, peer: &str, envelope: &Envelope) -> Result<(), SyncError>;
}

/// Base URL for a registry entry. Bare hosts get the network port.
pub fn peer_base_url(peer: &str, default_port: u16) -> String {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return format!("http://{addr}");
    }
    if let Ok(ip) = peer.parse::<IpAddr>() {
        return format!("http://{}", SocketAddr::new(ip, default_port));
    }
    if peer.contains(':') {
        format!("http://{peer}")
    } else {
        format!("http://{peer}:{default_port}")
    }
}

/// HTTP implementation with bounded connect and request timeouts.
#[derive(Clone)]
pub struct HttpSync {
    client: reqwest::Client,
    default_port: u16,
}

impl HttpSync {
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        default_port: u16,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(SyncError::NetworkError)?;
        Ok(Self {
            client,
            default_port,
        })
    }

    fn url(&self, peer: &str, path: &str) -> String {
        format!("{}{}", peer_base_url(peer, self.default_port), path)
    }

    async fn read_ok(&self, peer: &str, response: reqwest::Response) -> Result<Vec<u8>, SyncError> {
        let status = response.status();
        let body = response.bytes().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(SyncError::PeerRejected {
                peer: peer.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn get(&self, peer: &str, path: &str) -> Result<Vec<u8>, SyncError> {
        let response = self
            .client
            .get(self.url(peer, path))
            .send()
            .await
            .map_err(network_error)?;
        self.read_ok(peer, response).await
    }
}

#[async_trait]
impl SyncLayer for HttpSync {
    async fn get_addr(&self, peer: &str) -> Result<BTreeMap<String, i64>, SyncError> {
        let body = self.get(peer, "/getaddr").await?;
        serde_json::from_slice(&body).map_err(|e| SyncError::InvalidResponse {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_len(&self, peer: &str) -> Result<u64, SyncError> {
        let body = self.get(peer, "/getlen").await?;
        let text = String::from_utf8_lossy(&body);
        text.trim()
            .parse::<u64>()
            .map_err(|e| SyncError::InvalidResponse {
                peer: peer.to_string(),
                reason: format!("bad length {text:?}: {e}"),
            })
    }

    async fn get_block(&self, peer: &str, index: u64) -> Result<Block, SyncError> {
        let body = self.get(peer, &format!("/getblock?index={index}")).await?;
        Ok(wire::decode_block(&body)?)
    }

    async fn post_message(&self, peer: &str, envelope: &Envelope) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.url(peer, "/newmsg"))
            .header("content-type", "application/json")
            .body(envelope.to_bytes()?)
            .send()
            .await
            .map_err(network_error)?;
        self.read_ok(peer, response).await?;
        Ok(())
    }
}

/// Sync layer that talks to nobody.
#[derive(Debug, Clone, Default)]
pub struct NoopSync;

#[async_trait]
impl SyncLayer for NoopSync {
    async fn get_addr(&self, _peer: &str) -> Result<BTreeMap<String, i64>, SyncError> {
        Ok(BTreeMap::new())
    }

    async fn get_len(&self, _peer: &str) -> Result<u64, SyncError> {
        Err(SyncError::Unsupported)
    }

    async fn get_block(&self, _peer: &str, _index: u64) -> Result<Block, SyncError> {
        Err(SyncError::Unsupported)
    }

    async fn post_message(&self, _peer: &str, _envelope: &Envelope) -> Result<(), SyncError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Post `envelope` to every peer concurrently. Best effort: failures are
/// logged and counted, never retried.
pub async fn broadcast_message(
    sync: Arc<dyn SyncLayer>,
    peers: Vec<String>,
    envelope: Envelope,
) -> BroadcastReport {
    let envelope = Arc::new(envelope);
    let mut deliveries = JoinSet::new();
    for peer in peers {
        let sync = Arc::clone(&sync);
        let envelope = Arc::clone(&envelope);
        deliveries.spawn(async move {
            let result = sync.post_message(&peer, &envelope).await;
            (peer, result)
        });
    }

    let mut report = BroadcastReport::default();
    while let Some(joined) = deliveries.join_next().await {
        match joined {
            Ok((_, Ok(()))) => report.delivered += 1,
            Ok((peer, Err(e))) => {
                debug!(%peer, error = %e, "broadcast delivery failed");
                report.failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "broadcast task failed");
                report.failed += 1;
            }
        }
    }
    debug!(
        id = envelope.id,
        delivered = report.delivered,
        failed = report.failed,
        "broadcast finished"
    );
    report
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub checked: usize,
    pub reachable: usize,
    pub discovered: Vec<String>,
    /// Newly discovered peers claiming more blocks than we hold.
    pub longer_chains: Vec<(String, u64)>,
}

/// Ask every known peer for its registry and merge what it knows.
///
/// Each newly learned peer is asked for its chain length; a longer chain is
/// only logged; nothing is fetched.
pub async fn discover_peers(
    sync: Arc<dyn SyncLayer>,
    registry: &PeerRegistry,
    ledger: Arc<Ledger>,
) -> Result<DiscoveryReport, SyncError> {
    let mut report = DiscoveryReport::default();
    let mut lookups = JoinSet::new();

    for peer in registry.addresses()? {
        report.checked += 1;
        let remote = match sync.get_addr(&peer).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(%peer, error = %e, "peer discovery request failed");
                continue;
            }
        };
        report.reachable += 1;
        registry.touch(&peer);

        for (address, seen) in remote {
            if !is_peer_address(&address) {
                continue;
            }
            match registry.merge(&address, seen) {
                Ok(true) => {
                    report.discovered.push(address.clone());
                    lookups.spawn(fetch_peer_length(Arc::clone(&sync), address, Arc::clone(&ledger)));
                }
                Ok(false) => {}
                Err(e) => warn!(peer = %address, error = %e, "failed to record discovered peer"),
            }
        }
    }

    while let Some(joined) = lookups.join_next().await {
        if let Ok(Some(longer)) = joined {
            report.longer_chains.push(longer);
        }
    }
    Ok(report)
}

async fn fetch_peer_length(
    sync: Arc<dyn SyncLayer>,
    peer: String,
    ledger: Arc<Ledger>,
) -> Option<(String, u64)> {
    let theirs = match sync.get_len(&peer).await {
        Ok(len) => len,
        Err(e) => {
            debug!(%peer, error = %e, "chain length request failed");
            return None;
        }
    };
    let ours = match ledger.length() {
        Ok(len) => len,
        Err(e) => {
            warn!(error = %e, "failed to read local chain length");
            return None;
        }
    };
    if theirs > ours {
        info!(%peer, theirs, ours, behind = theirs - ours, "found peer with longer chain");
        return Some((peer, theirs));
    }
    None
}

/// Run discovery now and then every `interval` until shutdown.
pub async fn run_discovery(
    sync: Arc<dyn SyncLayer>,
    registry: Arc<PeerRegistry>,
    ledger: Arc<Ledger>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match discover_peers(Arc::clone(&sync), &registry, Arc::clone(&ledger)).await {
                    Ok(report) => debug!(
                        checked = report.checked,
                        reachable = report.reachable,
                        discovered = report.discovered.len(),
                        "discovery round finished"
                    ),
                    Err(e) => warn!(error = %e, "discovery round failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("peer discovery stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerParams;
    use crate::peers::DEFAULT_EXPIRY;
    use crate::storage::{BalanceStore, BlockStore, PeerStore};
    use std::sync::Mutex;

    /// In-memory network: each peer has a registry, a length, and an inbox.
    #[derive(Default)]
    struct FakeNetwork {
        registries: BTreeMap<String, BTreeMap<String, i64>>,
        lengths: BTreeMap<String, u64>,
        inbox: Mutex<Vec<(String, Envelope)>>,
    }

    #[async_trait]
    impl SyncLayer for FakeNetwork {
        async fn get_addr(&self, peer: &str) -> Result<BTreeMap<String, i64>, SyncError> {
            self.registries
                .get(peer)
                .cloned()
                .ok_or(SyncError::ConnectionTimeout)
        }

        async fn get_len(&self, peer: &str) -> Result<u64, SyncError> {
            self.lengths
                .get(peer)
                .copied()
                .ok_or(SyncError::ConnectionTimeout)
        }

        async fn get_block(&self, _peer: &str, _index: u64) -> Result<Block, SyncError> {
            Err(SyncError::Unsupported)
        }

        async fn post_message(&self, peer: &str, envelope: &Envelope) -> Result<(), SyncError> {
            if !self.registries.contains_key(peer) {
                return Err(SyncError::ConnectionTimeout);
            }
            self.inbox
                .lock()
                .unwrap()
                .push((peer.to_string(), envelope.clone()));
            Ok(())
        }
    }

    fn ledger() -> Arc<Ledger> {
        Arc::new(
            Ledger::new(
                BlockStore::temporary().unwrap(),
                BalanceStore::temporary().unwrap(),
                LedgerParams::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn base_urls_append_the_network_port_to_bare_hosts() {
        assert_eq!(peer_base_url("10.0.0.1", 3141), "http://10.0.0.1:3141");
        assert_eq!(peer_base_url("10.0.0.1:8080", 3141), "http://10.0.0.1:8080");
        assert_eq!(peer_base_url("2001:db8::2", 3141), "http://[2001:db8::2]:3141");
        assert_eq!(peer_base_url("seed.example", 3141), "http://seed.example:3141");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_reachable_peer() {
        let mut network = FakeNetwork::default();
        network.registries.insert("10.0.0.1".into(), BTreeMap::new());
        network.registries.insert("10.0.0.2".into(), BTreeMap::new());
        let network = Arc::new(network);

        let envelope = Envelope::new(wire::MessageKind::Transaction, vec![1, 2, 3]);
        let report = broadcast_message(
            network.clone(),
            vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()],
            envelope.clone(),
        )
        .await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        let inbox = network.inbox.lock().unwrap();
        assert_eq!(inbox.len(), 2);
        assert!(inbox.iter().all(|(_, e)| *e == envelope));
    }

    #[tokio::test]
    async fn discovery_merges_new_peers_and_reports_longer_chains() {
        let now = crate::ledger::unix_now();
        let mut network = FakeNetwork::default();
        network.registries.insert(
            "10.0.0.1".into(),
            BTreeMap::from([
                ("10.0.0.2".to_string(), now),
                ("10.0.0.3".to_string(), now),
                ("not-an-ip".to_string(), now),
            ]),
        );
        network.lengths.insert("10.0.0.2".into(), 5);
        network.lengths.insert("10.0.0.3".into(), 1);

        let registry = PeerRegistry::new(PeerStore::temporary().unwrap(), DEFAULT_EXPIRY);
        registry.add_peer("10.0.0.1").unwrap();
        registry.add_peer("10.0.0.9").unwrap();

        let report = discover_peers(Arc::new(network), &registry, ledger())
            .await
            .unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.reachable, 1);
        assert_eq!(report.discovered, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);
        assert_eq!(report.longer_chains, vec![("10.0.0.2".to_string(), 5)]);
        assert!(registry.contains("10.0.0.3").unwrap());
        assert!(!registry.contains("not-an-ip").unwrap());
        // Unreachable peers stay until the sweep removes them
        assert!(registry.contains("10.0.0.9").unwrap());
    }
}
