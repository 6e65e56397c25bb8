//! Group registry operations

use crate::linkage::{self, GroupReferences};
use crate::locks::AccountGuard;
use crate::manager::{difference, AccountManager, Mutation, PendingEffects};
use crate::permissions;
use meshplane_common::types::*;
use meshplane_common::{Activity, Error, LockingStrength, Result, Store};
use tracing::{debug, info};

/// Per-ID result of a multi-group deletion
#[derive(Debug, Default)]
pub struct DeleteGroupsOutcome {
    pub results: Vec<(String, Result<()>)>,
}

impl DeleteGroupsOutcome {
    /// IDs that were deleted
    pub fn deleted(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Combined error of every failed ID, if any failed
    pub fn into_error(self) -> Option<Error> {
        Error::join(self.results.into_iter().filter_map(|(_, r)| r.err()).collect())
    }
}

impl AccountManager {
    pub fn get_group(&self, account_id: &str, group_id: &str, user_id: &str) -> Result<Group> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_group_by_id(LockingStrength::Share, account_id, group_id)
        })
    }

    pub fn get_all_groups(&self, account_id: &str, user_id: &str) -> Result<Vec<Group>> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_groups(LockingStrength::Share, account_id)
        })
    }

    /// Look a group up by name. When several share it the largest one wins.
    pub fn get_group_by_name(&self, account_id: &str, name: &str) -> Result<Group> {
        self.db
            .read(|tx| tx.get_group_by_name(LockingStrength::Share, account_id, name))
    }

    /// Create or update one group
    pub async fn save_group(&self, account_id: &str, user_id: &str, group: Group) -> Result<Group> {
        let mut saved = self.save_groups(account_id, user_id, vec![group]).await?;
        saved
            .pop()
            .ok_or_else(|| Error::Internal("no group saved".to_string()))
    }

    /// Create or update several groups in one transaction
    pub async fn save_groups(&self, account_id: &str, user_id: &str, groups: Vec<Group>) -> Result<Vec<Group>> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;
        let result = self.save_groups_locked(&guard, user_id, groups);
        drop(guard);
        let (saved, effects) = result?;
        effects.release();
        Ok(saved)
    }

    /// Like [`save_groups`](Self::save_groups) for a caller already holding
    /// the account lock. The requester must have been authorized. The caller
    /// releases the returned effects after dropping the guard.
    pub fn save_groups_locked(
        &self,
        guard: &AccountGuard,
        user_id: &str,
        groups: Vec<Group>,
    ) -> Result<(Vec<Group>, PendingEffects)> {
        let dns_domain = self.dns_domain().to_string();

        let (saved, effects) = self.commit_locked(guard, |tx, mutation| {
            let account_id = mutation.account_id().to_string();
            let mut to_save: Vec<Group> = Vec::with_capacity(groups.len());

            for mut group in groups {
                validate_new_group(tx, &account_id, &mut group, &to_save)?;
                group.account_id = account_id.clone();
                prepare_group_events(tx, mutation, user_id, &group, &dns_domain)?;
                to_save.push(group);
            }

            mutation.touch_groups(to_save.iter().map(|g| g.id.clone()));
            tx.save_groups(LockingStrength::Update, &to_save)?;
            Ok(to_save)
        })?;

        for group in &saved {
            debug!("Saved group {} ({}) in account {}", group.name, group.id, guard.account_id());
        }
        Ok((saved, effects))
    }

    pub async fn delete_group(&self, account_id: &str, user_id: &str, group_id: &str) -> Result<()> {
        let outcome = self
            .delete_groups(account_id, user_id, &[group_id.to_string()])
            .await?;
        match outcome.into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Delete every group that can be deleted.
    ///
    /// Each ID is validated on its own. Valid IDs are removed in one
    /// transaction; failures are reported per ID and do not stop the others.
    pub async fn delete_groups(&self, account_id: &str, user_id: &str, group_ids: &[String]) -> Result<DeleteGroupsOutcome> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        let mut ids: Vec<String> = Vec::with_capacity(group_ids.len());
        for id in group_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        let outcome = self.commit(guard, |tx, mutation| {
            let requester = permissions::account_user(tx, account_id, user_id)?;
            let refs = GroupReferences::load(tx, account_id)?;

            let mut outcome = DeleteGroupsOutcome::default();
            let mut deletable = Vec::new();

            for group_id in ids {
                let group = match tx.get_group_by_id(LockingStrength::Update, account_id, &group_id) {
                    Ok(group) => group,
                    Err(e) if e.is_not_found() => {
                        outcome.results.push((group_id, Err(e)));
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                match linkage::validate_delete_group(&refs, &group, &requester) {
                    Ok(()) => {
                        mutation.record(user_id, &group.id, Activity::GroupDeleted { name: group.name.clone() });
                        deletable.push(group.id.clone());
                        outcome.results.push((group_id, Ok(())));
                    }
                    Err(e) => {
                        debug!("Group {} can not be deleted: {}", group_id, e);
                        outcome.results.push((group_id, Err(e)));
                    }
                }
            }

            mutation.touch_groups(deletable.iter().cloned());
            tx.delete_groups(LockingStrength::Update, account_id, &deletable)?;
            Ok(outcome)
        })?;

        info!(
            "Deleted {} of {} groups in account {}",
            outcome.deleted().len(),
            outcome.results.len(),
            account_id
        );
        Ok(outcome)
    }

    /// Add a peer to a group. Adding a member again changes nothing.
    pub async fn group_add_peer(&self, account_id: &str, group_id: &str, peer_id: &str) -> Result<()> {
        let guard = self.lock_account(account_id).await;
        self.update_group_membership(guard, group_id, peer_id, true)
    }

    /// Remove a peer from a group. Removing a non-member changes nothing.
    pub async fn group_delete_peer(&self, account_id: &str, group_id: &str, peer_id: &str) -> Result<()> {
        let guard = self.lock_account(account_id).await;
        self.update_group_membership(guard, group_id, peer_id, false)
    }

    fn update_group_membership(&self, guard: AccountGuard, group_id: &str, peer_id: &str, add: bool) -> Result<()> {
        let dns_domain = self.dns_domain().to_string();

        self.commit(guard, |tx, mutation| {
            let account_id = mutation.account_id().to_string();
            let mut group = tx.get_group_by_id(LockingStrength::Update, &account_id, group_id)?;

            let changed = if add {
                group.add_peer(peer_id)
            } else {
                group.remove_peer(peer_id)
            };
            if !changed {
                return Ok(());
            }

            let peer = tx.get_peer_by_id(LockingStrength::Share, &account_id, peer_id)?;
            let (group_name, group_id) = (group.name.clone(), group.id.clone());
            let (peer_ip, peer_fqdn) = (peer.ip.to_string(), peer.fqdn(&dns_domain));
            let activity = if add {
                Activity::GroupAddedToPeer { group: group_name, group_id, peer_ip, peer_fqdn }
            } else {
                Activity::GroupRemovedFromPeer { group: group_name, group_id, peer_ip, peer_fqdn }
            };
            mutation.record(SYSTEM_INITIATOR, &peer.id, activity);

            mutation.touch_groups([group.id.clone()]);
            tx.save_group(LockingStrength::Update, &group)
        })
    }
}

/// Check a group about to be saved, assigning an ID to new API groups
fn validate_new_group(store: &dyn Store, account_id: &str, group: &mut Group, pending: &[Group]) -> Result<()> {
    if group.name.trim().is_empty() {
        return Err(Error::InvalidArgument("group name should not be empty".to_string()));
    }

    let name_changed = if group.id.is_empty() {
        if group.issued != GroupIssued::Api {
            return Err(Error::InvalidArgument(format!("{} group without ID set", group.issued)));
        }
        group.id = new_id();
        true
    } else {
        match store.get_group_by_id(LockingStrength::Update, account_id, &group.id) {
            Ok(existing) if existing.is_group_all() && existing.name != group.name => {
                return Err(Error::InvalidArgument("updating group ALL is not allowed".to_string()));
            }
            Ok(existing) => existing.name != group.name,
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(e),
        }
    };

    if name_changed && group.is_group_all() && group.issued != GroupIssued::Api {
        return Err(Error::InvalidArgument(format!("group name \"{}\" is reserved", GROUP_ALL_NAME)));
    }

    if name_changed && group.issued == GroupIssued::Api {
        // Stored groups are shadowed by their pending versions in the same batch
        let stored = store.get_account_groups(LockingStrength::Share, account_id)?;
        let taken = stored
            .iter()
            .filter(|g| !pending.iter().any(|p| p.id == g.id))
            .chain(pending.iter())
            .any(|g| g.id != group.id && g.issued == GroupIssued::Api && g.name == group.name);
        if taken {
            return Err(Error::AlreadyExists {
                kind: "group with name".to_string(),
                id: group.name.clone(),
            });
        }
    }

    for (i, peer_id) in group.peers.iter().enumerate() {
        if group.peers[..i].contains(peer_id) {
            return Err(Error::InvalidArgument(format!("duplicate peer ID \"{}\" in group", peer_id)));
        }
        match store.get_peer_by_id(LockingStrength::Share, account_id, peer_id) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::InvalidArgument(format!("peer with ID \"{}\" not found", peer_id)));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Queue the creation and membership events of one saved group
fn prepare_group_events(
    store: &dyn Store,
    mutation: &mut Mutation,
    user_id: &str,
    group: &Group,
    dns_domain: &str,
) -> Result<()> {
    let (added, removed) = match store.get_group_by_id(LockingStrength::Share, &group.account_id, &group.id) {
        Ok(old) => (difference(&group.peers, &old.peers), difference(&old.peers, &group.peers)),
        Err(e) if e.is_not_found() => {
            mutation.record(user_id, &group.id, Activity::GroupCreated { name: group.name.clone() });
            (group.peers.clone(), Vec::new())
        }
        Err(e) => return Err(e),
    };

    let modified: Vec<String> = added.iter().chain(removed.iter()).cloned().collect();
    let peers = store.get_peers_by_ids(LockingStrength::Share, &group.account_id, &modified)?;

    for (peer_ids, is_add) in [(&added, true), (&removed, false)] {
        for peer_id in peer_ids {
            let Some(peer) = peers.get(peer_id) else {
                debug!("Skipping event for missing peer {} of group {}", peer_id, group.id);
                continue;
            };
            let (group_name, group_id) = (group.name.clone(), group.id.clone());
            let (peer_ip, peer_fqdn) = (peer.ip.to_string(), peer.fqdn(dns_domain));
            let activity = if is_add {
                Activity::GroupAddedToPeer { group: group_name, group_id, peer_ip, peer_fqdn }
            } else {
                Activity::GroupRemovedFromPeer { group: group_name, group_id, peer_ip, peer_fqdn }
            };
            mutation.record(user_id, &peer.id, activity);
        }
    }

    Ok(())
}
