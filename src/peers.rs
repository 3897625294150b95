//! Peer registry: known peer addresses and when they were last seen.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ledger::unix_now;
use crate::storage::{PeerStore, StorageError};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Host part of an inbound remote address, if it may be registered.
///
/// Ports are dropped since inbound connections come from ephemeral ports.
/// Loopback and empty addresses are refused.
pub fn registrable_host(remote: &str) -> Option<IpAddr> {
    let remote = remote.trim();
    if remote.is_empty() {
        return None;
    }
    let ip = match remote.parse::<SocketAddr>() {
        Ok(addr) => addr.ip(),
        Err(_) => remote.parse::<IpAddr>().ok()?,
    };
    if ip.is_loopback() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}

/// Whether a registry key names a dialable address (`ip` or `ip:port`).
pub fn is_peer_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok() || address.parse::<SocketAddr>().is_ok()
}

pub struct PeerRegistry {
    store: PeerStore,
    expiry: Duration,
}

impl PeerRegistry {
    pub fn new(store: PeerStore, expiry: Duration) -> Self {
        Self { store, expiry }
    }

    /// Record contact from `remote`. Returns whether an entry was written.
    ///
    /// Storage failures are logged and swallowed.
    pub fn update_timestamp(&self, remote: &str) -> bool {
        let Some(ip) = registrable_host(remote) else {
            return false;
        };
        match self.store.upsert(&ip.to_string(), unix_now()) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %ip, error = %e, "failed to record peer");
                false
            }
        }
    }

    /// Register a peer address as given, e.g. a configured bootstrap peer.
    pub fn add_peer(&self, address: &str) -> Result<(), StorageError> {
        self.store.upsert(address, unix_now())
    }

    /// Refresh the timestamp of an address we just reached.
    pub fn touch(&self, address: &str) {
        if let Err(e) = self.store.upsert(address, unix_now()) {
            warn!(peer = %address, error = %e, "failed to refresh peer");
        }
    }

    /// Insert a peer learned from someone else's registry, keeping our own
    /// entry if we already know it. Returns whether it was new.
    ///
    /// Timestamps from the future are clamped to now so the entry still
    /// expires.
    pub fn merge(&self, address: &str, timestamp: i64) -> Result<bool, StorageError> {
        self.store.insert_if_absent(address, timestamp.min(unix_now()))
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        self.store.entries()
    }

    pub fn addresses(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.snapshot()?.into_keys().collect())
    }

    pub fn contains(&self, address: &str) -> Result<bool, StorageError> {
        Ok(self.store.get(address)?.is_some())
    }

    /// Delete every entry last seen before `now - expiry`. Returns how many
    /// entries were removed.
    pub fn sweep(&self, now: i64) -> Result<usize, StorageError> {
        let cutoff = now.saturating_sub(self.expiry.as_secs() as i64);
        let mut removed = 0;
        for (address, seen) in self.store.entries()? {
            if seen < cutoff {
                self.store.remove(&address)?;
                debug!(peer = %address, "expired peer");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Sweep expired peers every `interval` until `shutdown` flips to true.
pub async fn run_expiry_sweep(
    registry: Arc<PeerRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = registry.sweep(unix_now()) {
                    warn!(error = %e, "peer sweep failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("peer expiry sweep stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new(PeerStore::temporary().unwrap(), DEFAULT_EXPIRY)
    }

    #[test]
    fn inbound_addresses_lose_their_port() {
        let registry = registry();
        assert!(registry.update_timestamp("203.0.113.7:51234"));
        assert!(registry.update_timestamp("[2001:db8::1]:443"));
        assert_eq!(
            registry.addresses().unwrap(),
            vec!["2001:db8::1".to_string(), "203.0.113.7".to_string()]
        );
    }

    #[test]
    fn loopback_and_empty_addresses_are_refused() {
        let registry = registry();
        assert!(!registry.update_timestamp("127.0.0.1:3141"));
        assert!(!registry.update_timestamp("[::1]:3141"));
        assert!(!registry.update_timestamp(""));
        assert!(!registry.update_timestamp("not an address"));
        assert!(registry.snapshot().unwrap().is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_peers() {
        let registry = registry();
        let now = unix_now();
        registry.merge("198.51.100.1", now - 61).unwrap();
        registry.merge("198.51.100.2", now - 30).unwrap();
        registry.add_peer("198.51.100.3").unwrap();

        assert_eq!(registry.sweep(now).unwrap(), 1);
        assert!(!registry.contains("198.51.100.1").unwrap());
        assert!(registry.contains("198.51.100.2").unwrap());
        assert!(registry.contains("198.51.100.3").unwrap());
    }

    #[test]
    fn merge_keeps_known_entries() {
        let registry = registry();
        registry.add_peer("198.51.100.9").unwrap();
        assert!(!registry.merge("198.51.100.9", 1).unwrap());
        assert!(registry.snapshot().unwrap()["198.51.100.9"] > 1);
        assert!(registry.merge("198.51.100.10", 1).unwrap());
    }

    #[test]
    fn future_timestamps_are_clamped_and_still_expire() {
        let registry = registry();
        let now = unix_now();
        assert!(registry.merge("198.51.100.30", i64::MAX).unwrap());
        let seen = registry.snapshot().unwrap()["198.51.100.30"];
        assert!(seen <= unix_now());
        assert!(seen >= now);

        assert_eq!(registry.sweep(unix_now() + 120).unwrap(), 1);
        assert!(!registry.contains("198.51.100.30").unwrap());
    }

    #[test]
    fn peer_address_shapes() {
        assert!(is_peer_address("10.1.2.3"));
        assert!(is_peer_address("10.1.2.3:3141"));
        assert!(is_peer_address("::1"));
        assert!(!is_peer_address("example.com"));
        assert!(!is_peer_address(""));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_expires_stale_peers_and_stops_on_shutdown() {
        let registry = Arc::new(registry());
        registry.merge("192.0.2.1", unix_now() - 600).unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_expiry_sweep(
            Arc::clone(&registry),
            DEFAULT_SWEEP_INTERVAL,
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!registry.contains("192.0.2.1").unwrap());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
