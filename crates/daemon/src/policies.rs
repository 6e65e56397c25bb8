//! Access policy management

use crate::manager::{any_group_has_peers, ensure_groups_exist, AccountManager};
use crate::permissions;
use meshplane_common::types::*;
use meshplane_common::{Activity, Error, LockingStrength, Result};
use tracing::info;

impl AccountManager {
    /// Create or update a policy
    pub async fn save_policy(&self, account_id: &str, user_id: &str, mut policy: Policy) -> Result<Policy> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        let policy = self.commit(guard, |tx, mutation| {
            let existing = if policy.id.is_empty() {
                policy.id = new_id();
                None
            } else {
                match tx.get_policy_by_id(LockingStrength::Update, account_id, &policy.id) {
                    Ok(existing) => Some(existing),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                }
            };

            if policy.name.trim().is_empty() {
                return Err(Error::InvalidArgument("policy name should not be empty".to_string()));
            }
            for rule in policy.rules.iter_mut() {
                if rule.id.is_empty() {
                    rule.id = new_id();
                }
            }
            ensure_groups_exist(tx, account_id, &policy.rule_groups())?;

            policy.account_id = account_id.to_string();
            tx.save_policy(LockingStrength::Update, &policy)?;

            let mut groups = policy.rule_groups();
            let mut enabled = policy.enabled;
            if let Some(old) = &existing {
                groups.extend(old.rule_groups());
                enabled |= old.enabled;
            }
            if enabled && any_group_has_peers(tx, account_id, &groups)? {
                mutation.mark_impactful();
            }

            let activity = match existing {
                Some(_) => Activity::PolicyUpdated { name: policy.name.clone() },
                None => Activity::PolicyAdded { name: policy.name.clone() },
            };
            mutation.record(user_id, &policy.id, activity);
            Ok(policy)
        })?;

        info!("Saved policy {} ({}) in account {}", policy.name, policy.id, account_id);
        Ok(policy)
    }

    pub async fn delete_policy(&self, account_id: &str, user_id: &str, policy_id: &str) -> Result<()> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            let policy = tx.get_policy_by_id(LockingStrength::Update, account_id, policy_id)?;
            tx.delete_policy(LockingStrength::Update, account_id, policy_id)?;

            if policy.enabled && any_group_has_peers(tx, account_id, &policy.rule_groups())? {
                mutation.mark_impactful();
            }
            mutation.record(user_id, policy_id, Activity::PolicyRemoved { name: policy.name });
            Ok(())
        })
    }

    pub fn get_policy(&self, account_id: &str, user_id: &str, policy_id: &str) -> Result<Policy> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_policy_by_id(LockingStrength::Share, account_id, policy_id)
        })
    }

    pub fn get_all_policies(&self, account_id: &str, user_id: &str) -> Result<Vec<Policy>> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_policies(LockingStrength::Share, account_id)
        })
    }
}
