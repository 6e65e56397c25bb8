//! Peer registration and removal

use crate::manager::AccountManager;
use meshplane_common::types::*;
use meshplane_common::{Activity, Error, LockingStrength, Result};
use tracing::info;

impl AccountManager {
    /// Register a peer in the account.
    ///
    /// The peer joins the ALL group and, when enrolled with a setup key, the
    /// key's auto-groups.
    pub async fn add_peer(&self, account_id: &str, setup_key_id: Option<&str>, mut peer: Peer) -> Result<Peer> {
        let guard = self.lock_account(account_id).await;
        let dns_domain = self.dns_domain().to_string();

        let peer = self.commit(guard, |tx, mutation| {
            let account = tx.get_account(LockingStrength::Share, account_id)?;
            if !account.network.contains(peer.ip) {
                return Err(Error::InvalidArgument(format!(
                    "peer IP {} is outside the account network {}",
                    peer.ip, account.network
                )));
            }

            for existing in tx.get_account_peers(LockingStrength::Update, account_id)? {
                if existing.ip == peer.ip {
                    return Err(Error::already_exists("peer with IP", peer.ip.to_string()));
                }
                if existing.key == peer.key {
                    return Err(Error::already_exists("peer with key", peer.key.clone()));
                }
            }

            let mut group_ids = vec![tx
                .get_group_by_name(LockingStrength::Update, account_id, GROUP_ALL_NAME)?
                .id];

            let initiator = match setup_key_id {
                Some(key_id) => {
                    let key = tx.get_setup_key_by_id(LockingStrength::Share, account_id, key_id)?;
                    if key.revoked {
                        return Err(Error::PermissionDenied(format!("setup key {} is revoked", key.name)));
                    }
                    group_ids.extend(key.auto_groups);
                    key_id.to_string()
                }
                None => SYSTEM_INITIATOR.to_string(),
            };

            if peer.id.is_empty() {
                peer.id = new_id();
            }
            peer.account_id = account_id.to_string();
            tx.save_peer(LockingStrength::Update, &peer)?;

            for group_id in &group_ids {
                let mut group = tx.get_group_by_id(LockingStrength::Update, account_id, group_id)?;
                if group.add_peer(&peer.id) {
                    tx.save_group(LockingStrength::Update, &group)?;
                }
            }

            mutation.record(
                &initiator,
                &peer.id,
                Activity::PeerAdded {
                    name: peer.name.clone(),
                    ip: peer.ip.to_string(),
                    fqdn: peer.fqdn(&dns_domain),
                },
            );
            mutation.mark_impactful();
            Ok(peer)
        })?;

        info!("Added peer {} ({}) to account {}", peer.name, peer.ip, account_id);
        Ok(peer)
    }

    /// Remove a peer from every group and delete it
    pub async fn delete_peer(&self, account_id: &str, user_id: &str, peer_id: &str) -> Result<()> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;
        let dns_domain = self.dns_domain().to_string();

        self.commit(guard, |tx, mutation| {
            let peer = tx.get_peer_by_id(LockingStrength::Update, account_id, peer_id)?;

            for mut group in tx.get_peer_groups(LockingStrength::Update, account_id, peer_id)? {
                group.remove_peer(peer_id);
                tx.save_group(LockingStrength::Update, &group)?;
            }
            tx.delete_peer(LockingStrength::Update, account_id, peer_id)?;

            mutation.record(
                user_id,
                peer_id,
                Activity::PeerRemoved {
                    name: peer.name.clone(),
                    ip: peer.ip.to_string(),
                    fqdn: peer.fqdn(&dns_domain),
                },
            );
            mutation.mark_impactful();
            Ok(())
        })?;

        info!("Deleted peer {} from account {}", peer_id, account_id);
        Ok(())
    }

    /// Groups listing the peer
    pub fn get_peer_groups(&self, account_id: &str, peer_id: &str) -> Result<Vec<Group>> {
        self.db
            .read(|tx| tx.get_peer_groups(LockingStrength::Share, account_id, peer_id))
    }

    pub fn get_account_peers(&self, account_id: &str, user_id: &str) -> Result<Vec<Peer>> {
        self.db.read(|tx| {
            crate::permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_peers(LockingStrength::Share, account_id)
        })
    }
}
