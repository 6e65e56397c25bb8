//! Account manager
//!
//! Every mutating operation goes through [`AccountManager::commit`]: it runs
//! under the account's write lock, inside one store transaction together with
//! the impact check and the network serial bump. Activity events and the peer
//! update trigger are released only after the transaction commits and the
//! lock is dropped.

use crate::activity::ActivitySink;
use crate::linkage;
use crate::locks::{AccountGuard, AccountLocks};
use crate::permissions;
use crate::propagation::PeerUpdateSink;
use meshplane_common::types::*;
use meshplane_common::{Activity, ActivityEvent, Database, Error, LockingStrength, Result, Store};
use std::sync::Arc;
use tracing::{debug, info};

/// Side effects collected while a mutation runs inside its transaction
pub struct Mutation {
    account_id: String,
    events: Vec<ActivityEvent>,
    touched_groups: Vec<String>,
    impactful: bool,
}

impl Mutation {
    fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            events: Vec::new(),
            touched_groups: Vec::new(),
            impactful: false,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Queue an event for after commit
    pub fn record(&mut self, initiator_id: &str, target_id: &str, activity: Activity) {
        self.events
            .push(ActivityEvent::new(initiator_id, target_id, &self.account_id, activity));
    }

    /// Groups whose membership or settings changed; checked against the
    /// impact predicate before commit.
    pub fn touch_groups<I, S>(&mut self, group_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in group_ids {
            let id = id.into();
            if !self.touched_groups.contains(&id) {
                self.touched_groups.push(id);
            }
        }
    }

    /// The change alters connectivity regardless of touched groups
    pub fn mark_impactful(&mut self) {
        self.impactful = true;
    }

    pub fn events(&self) -> &[ActivityEvent] {
        &self.events
    }
}

/// Events and the peer update trigger of a committed mutation
#[must_use = "committed side effects are lost unless released"]
pub struct PendingEffects {
    account_id: String,
    events: Vec<ActivityEvent>,
    impactful: bool,
    activity: Arc<dyn ActivitySink>,
    peer_updates: Arc<dyn PeerUpdateSink>,
}

impl PendingEffects {
    /// Store the events, then notify peers if connectivity changed.
    /// Call after the account lock is released.
    pub fn release(self) {
        for event in self.events {
            self.activity.store_event(event);
        }
        if self.impactful {
            self.peer_updates.update_account_peers(&self.account_id);
        }
    }
}

/// Coordinates all state changes of all accounts
#[derive(Clone)]
pub struct AccountManager {
    pub(crate) db: Database,
    locks: Arc<AccountLocks>,
    activity: Arc<dyn ActivitySink>,
    peer_updates: Arc<dyn PeerUpdateSink>,
    dns_domain: String,
}

impl AccountManager {
    pub fn new(
        db: Database,
        activity: Arc<dyn ActivitySink>,
        peer_updates: Arc<dyn PeerUpdateSink>,
        dns_domain: impl Into<String>,
    ) -> Self {
        Self {
            db,
            locks: Arc::new(AccountLocks::new()),
            activity,
            peer_updates,
            dns_domain: dns_domain.into(),
        }
    }

    pub fn dns_domain(&self) -> &str {
        &self.dns_domain
    }

    /// Take the account's write lock for a sequence of `*_locked` calls
    pub async fn lock_account(&self, account_id: &str) -> AccountGuard {
        self.locks.acquire(account_id).await
    }

    /// Take the account's write lock if it is free
    pub fn try_lock_account(&self, account_id: &str) -> Option<AccountGuard> {
        self.locks.try_acquire(account_id)
    }

    /// Resolve a requester allowed to manage the account
    pub(crate) fn authorize(&self, account_id: &str, user_id: &str) -> Result<User> {
        self.db
            .read(|tx| permissions::check_account_admin(tx, account_id, user_id))
    }

    /// Apply `f` as one atomic change to the guarded account.
    ///
    /// The guard is released as soon as the transaction ends. Queued events
    /// are stored and peers are notified after that, and only on success.
    pub(crate) fn commit<T>(
        &self,
        guard: AccountGuard,
        f: impl FnOnce(&dyn Store, &mut Mutation) -> Result<T>,
    ) -> Result<T> {
        let result = self.commit_locked(&guard, f);
        drop(guard);
        let (value, effects) = result?;
        effects.release();
        Ok(value)
    }

    /// Like [`commit`](Self::commit) for a caller that keeps holding the
    /// lock. The returned effects must be released once the guard is dropped.
    pub(crate) fn commit_locked<T>(
        &self,
        guard: &AccountGuard,
        f: impl FnOnce(&dyn Store, &mut Mutation) -> Result<T>,
    ) -> Result<(T, PendingEffects)> {
        let account_id = guard.account_id();
        let mut mutation = Mutation::new(account_id);

        let (value, impactful) = self.db.execute_in_transaction(|tx| {
            let value = f(tx, &mut mutation)?;

            let impactful = mutation.impactful
                || linkage::are_group_changes_affect_peers(tx, account_id, &mutation.touched_groups)?;
            if impactful {
                tx.increment_network_serial(LockingStrength::Update, account_id)?;
            }
            Ok((value, impactful))
        })?;

        debug!(
            "Committed mutation on account {} ({} events, impactful: {})",
            account_id,
            mutation.events.len(),
            impactful
        );

        let effects = PendingEffects {
            account_id: mutation.account_id,
            events: mutation.events,
            impactful,
            activity: self.activity.clone(),
            peer_updates: self.peer_updates.clone(),
        };
        Ok((value, effects))
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Create an account with its ALL group, a default allow-all policy and
    /// an admin owner.
    pub async fn create_account(&self, account_id: &str, owner_id: &str, domain: &str) -> Result<Account> {
        let guard = self.lock_account(account_id).await;

        let account = self.commit(guard, |tx, _| {
            if tx.account_exists(LockingStrength::Update, account_id)? {
                return Err(Error::already_exists("account", account_id));
            }

            let account = Account::new(account_id.to_string(), owner_id.to_string(), domain.to_string());
            tx.save_account(LockingStrength::Update, &account)?;

            let mut all = Group::new(GROUP_ALL_NAME, GroupIssued::Api, Vec::new());
            all.id = new_id();
            all.account_id = account_id.to_string();
            tx.save_group(LockingStrength::Update, &all)?;

            tx.save_policy(
                LockingStrength::Update,
                &Policy {
                    id: new_id(),
                    account_id: account_id.to_string(),
                    name: "Default".to_string(),
                    description: "This is a default rule that allows connections between all the resources"
                        .to_string(),
                    enabled: true,
                    rules: vec![PolicyRule::accept(
                        "Default",
                        vec![all.id.clone()],
                        vec![all.id.clone()],
                    )],
                },
            )?;

            tx.save_user(LockingStrength::Update, &User::new(owner_id, account_id, UserRole::Admin))?;
            Ok(account)
        })?;

        info!("Created account {} owned by {}", account_id, owner_id);
        Ok(account)
    }

    pub fn get_account(&self, account_id: &str) -> Result<Account> {
        self.db
            .read(|tx| tx.get_account(LockingStrength::Share, account_id))
    }

    /// Recorded activity of the account, oldest first
    pub fn get_account_events(&self, account_id: &str, user_id: &str) -> Result<Vec<ActivityEvent>> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_events(LockingStrength::Share, account_id)
        })
    }
}

/// Fail with `InvalidArgument` unless every group ID resolves in the account
pub(crate) fn ensure_groups_exist(store: &dyn Store, account_id: &str, group_ids: &[String]) -> Result<()> {
    for group_id in group_ids {
        match store.get_group_by_id(LockingStrength::Share, account_id, group_id) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::InvalidArgument(format!("group {} not found", group_id)));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Whether any of the groups currently has members
pub(crate) fn any_group_has_peers(store: &dyn Store, account_id: &str, group_ids: &[String]) -> Result<bool> {
    if group_ids.is_empty() {
        return Ok(false);
    }
    let groups = store.get_account_groups(LockingStrength::Share, account_id)?;
    Ok(crate::acl::any_group_has_peers(&groups, group_ids))
}

/// Elements of `a` missing from `b`, in `a`'s order
pub(crate) fn difference(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|x| !b.contains(x)).cloned().collect()
}
