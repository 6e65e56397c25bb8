//! Network map propagation
//!
//! The account manager signals "account changed" through [`PeerUpdateSink`].
//! [`NetworkMapPropagator`] drains those signals in the background, recomputes
//! the maps of the account's connected peers and pushes them through the
//! per-peer channels held by [`PeersUpdateManager`].

use crate::network_map::{AccountState, NetworkMap};
use dashmap::DashMap;
use meshplane_common::{Database, LockingStrength, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives "this account's peers need fresh maps" notifications
pub trait PeerUpdateSink: Send + Sync {
    fn update_account_peers(&self, account_id: &str);
}

/// Open update channels of connected peers
pub struct PeersUpdateManager {
    channels: DashMap<String, mpsc::Sender<NetworkMap>>,
    capacity: usize,
}

impl PeersUpdateManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a channel for a peer session, replacing any previous one
    pub fn create_channel(&self, peer_id: &str) -> mpsc::Receiver<NetworkMap> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.channels.insert(peer_id.to_string(), tx).is_some() {
            debug!("Replaced update channel of peer {}", peer_id);
        }
        rx
    }

    pub fn close_channel(&self, peer_id: &str) {
        if self.channels.remove(peer_id).is_some() {
            debug!("Closed update channel of peer {}", peer_id);
        }
    }

    pub fn has_channel(&self, peer_id: &str) -> bool {
        self.channels.contains_key(peer_id)
    }

    /// Queue a map for a peer. Returns whether it was queued.
    pub fn send_update(&self, peer_id: &str, map: NetworkMap) -> bool {
        let Some(tx) = self.channels.get(peer_id).map(|c| c.value().clone()) else {
            return false;
        };

        match tx.try_send(map) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Update channel of peer {} is full, dropping update", peer_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Update channel of peer {} is closed, removing it", peer_id);
                self.channels.remove(peer_id);
                false
            }
        }
    }
}

/// Cloneable handle feeding the propagator
#[derive(Clone)]
pub struct PropagatorHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl PeerUpdateSink for PropagatorHandle {
    fn update_account_peers(&self, account_id: &str) {
        if self.tx.send(account_id.to_string()).is_err() {
            warn!("Propagator stopped, dropping update for account {}", account_id);
        }
    }
}

/// Background worker pushing fresh network maps to connected peers
pub struct NetworkMapPropagator {
    db: Database,
    peers: Arc<PeersUpdateManager>,
    dns_domain: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl NetworkMapPropagator {
    pub fn new(db: Database, peers: Arc<PeersUpdateManager>, dns_domain: impl Into<String>) -> (Self, PropagatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let propagator = Self {
            db,
            peers,
            dns_domain: dns_domain.into(),
            rx,
        };
        (propagator, PropagatorHandle { tx })
    }

    /// Run until cancelled or until every handle is dropped
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Network map propagator started");

        loop {
            let account_id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(account_id) => account_id,
                    None => break,
                },
            };

            // Coalesce a burst of notifications into one push per account
            let mut pending = BTreeSet::from([account_id]);
            while let Ok(account_id) = self.rx.try_recv() {
                pending.insert(account_id);
            }

            for account_id in pending {
                match self.push_account(&account_id) {
                    Ok(sent) => debug!("Pushed {} network maps for account {}", sent, account_id),
                    Err(e) => warn!("Failed to update peers of account {}: {}", account_id, e),
                }
            }
        }

        info!("Network map propagator stopped");
    }

    /// Send fresh maps to every connected peer of the account
    pub fn push_account(&self, account_id: &str) -> Result<usize> {
        let state = self
            .db
            .read(|tx| AccountState::load(tx, LockingStrength::Share, account_id))?;

        let mut sent = 0;
        for peer in state.peers.iter().filter(|p| self.peers.has_channel(&p.id)) {
            let map = state.network_map(&peer.id, &self.dns_domain)?;
            if self.peers.send_update(&peer.id, map) {
                sent += 1;
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::StoreActivitySink;
    use crate::manager::AccountManager;
    use meshplane_common::{Group, GroupIssued};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_channel_drops_update() {
        let fx = crate::testing::Fixture::new().await;
        let p1 = fx.add_peer("alpha", 2).await;
        let state = fx
            .db
            .read(|tx| AccountState::load(tx, LockingStrength::Share, crate::testing::Fixture::ACCOUNT))
            .unwrap();
        let map = state.network_map(&p1, "").unwrap();

        let peers = PeersUpdateManager::new(1);
        let mut rx = peers.create_channel(&p1);
        assert!(peers.send_update(&p1, map.clone()));
        assert!(!peers.send_update(&p1, map.clone()));
        assert!(rx.recv().await.is_some());

        drop(rx);
        assert!(!peers.send_update(&p1, map));
        assert!(!peers.has_channel(&p1));
        assert!(!peers.send_update("unknown", state.network_map(&p1, "").unwrap()));
    }

    #[tokio::test]
    async fn test_propagator_pushes_after_commit() {
        let db = meshplane_common::Database::open_memory().unwrap();
        let peers = Arc::new(PeersUpdateManager::new(16));
        let (propagator, handle) = NetworkMapPropagator::new(db.clone(), peers.clone(), "mesh.test");
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(propagator.run(shutdown.clone()));

        let manager = AccountManager::new(
            db.clone(),
            Arc::new(StoreActivitySink::new(db.clone())),
            Arc::new(handle),
            "mesh.test",
        );
        manager.create_account("acc", "admin", "example.com").await.unwrap();
        let a = manager
            .add_peer("acc", None, meshplane_common::Peer::new("alpha", "ka", Ipv4Addr::new(100, 64, 0, 2)))
            .await
            .unwrap();

        let mut rx = peers.create_channel(&a.id);
        let b = manager
            .add_peer("acc", None, meshplane_common::Peer::new("beta", "kb", Ipv4Addr::new(100, 64, 0, 3)))
            .await
            .unwrap();

        // The first add may or may not have been pushed yet; wait for the latest serial
        let expected = manager.get_account("acc").unwrap().network_serial;
        let map = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let map = rx.recv().await.unwrap();
                if map.serial == expected {
                    break map;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(map.peer.id, a.id);
        assert_eq!(map.remote_peers.len(), 1);
        assert_eq!(map.remote_peers[0].id, b.id);

        // Unreferenced group: nothing is pushed
        manager
            .save_group("acc", "admin", Group::new("misc", GroupIssued::Api, vec![a.id.clone()]))
            .await
            .unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(nothing.is_err());

        shutdown.cancel();
        worker.await.unwrap();
    }
}
