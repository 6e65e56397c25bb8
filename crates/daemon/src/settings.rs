//! DNS, account settings, setup keys and user auto-groups

use crate::manager::{any_group_has_peers, difference, ensure_groups_exist, AccountManager};
use crate::permissions;
use meshplane_common::types::*;
use meshplane_common::{Activity, Error, LockingStrength, Result};
use tracing::info;

impl AccountManager {
    // ========================================================================
    // Name server groups
    // ========================================================================

    pub async fn save_name_server_group(
        &self,
        account_id: &str,
        user_id: &str,
        mut ns_group: NameServerGroup,
    ) -> Result<NameServerGroup> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            if ns_group.name.trim().is_empty() {
                return Err(Error::InvalidArgument("name server group name should not be empty".to_string()));
            }
            if ns_group.groups.is_empty() {
                return Err(Error::InvalidArgument(
                    "name server group should have at least one distribution group".to_string(),
                ));
            }
            ensure_groups_exist(tx, account_id, &ns_group.groups)?;

            let existing = if ns_group.id.is_empty() {
                ns_group.id = new_id();
                None
            } else {
                match tx.get_name_server_group_by_id(LockingStrength::Update, account_id, &ns_group.id) {
                    Ok(existing) => Some(existing),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                }
            };

            ns_group.account_id = account_id.to_string();
            tx.save_name_server_group(LockingStrength::Update, &ns_group)?;

            let mut groups = ns_group.groups.clone();
            if let Some(old) = &existing {
                groups.extend(old.groups.iter().cloned());
            }
            if any_group_has_peers(tx, account_id, &groups)? {
                mutation.mark_impactful();
            }

            let activity = match existing {
                Some(_) => Activity::NameserverGroupUpdated { name: ns_group.name.clone() },
                None => Activity::NameserverGroupCreated { name: ns_group.name.clone() },
            };
            mutation.record(user_id, &ns_group.id, activity);
            Ok(ns_group)
        })
    }

    pub async fn delete_name_server_group(&self, account_id: &str, user_id: &str, ns_group_id: &str) -> Result<()> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            let ns_group = tx.get_name_server_group_by_id(LockingStrength::Update, account_id, ns_group_id)?;
            tx.delete_name_server_group(LockingStrength::Update, account_id, ns_group_id)?;

            if any_group_has_peers(tx, account_id, &ns_group.groups)? {
                mutation.mark_impactful();
            }
            mutation.record(user_id, ns_group_id, Activity::NameserverGroupDeleted { name: ns_group.name });
            Ok(())
        })
    }

    // ========================================================================
    // DNS settings
    // ========================================================================

    pub fn get_dns_settings(&self, account_id: &str, user_id: &str) -> Result<DnsSettings> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_dns_settings(LockingStrength::Share, account_id)
        })
    }

    /// Replace the DNS management exceptions.
    ///
    /// Only groups entering or leaving the list are considered; the change is
    /// impactful when any of them has members.
    pub async fn save_dns_settings(&self, account_id: &str, user_id: &str, settings: DnsSettings) -> Result<()> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            ensure_groups_exist(tx, account_id, &settings.disabled_management_groups)?;

            let old = tx.get_account_dns_settings(LockingStrength::Update, account_id)?;
            let added = difference(&settings.disabled_management_groups, &old.disabled_management_groups);
            let removed = difference(&old.disabled_management_groups, &settings.disabled_management_groups);

            tx.save_dns_settings(LockingStrength::Update, account_id, &settings)?;

            for group_id in &added {
                let group = tx.get_group_by_id(LockingStrength::Share, account_id, group_id)?;
                mutation.record(
                    user_id,
                    group_id,
                    Activity::GroupAddedToDisabledManagementGroups {
                        group: group.name,
                        group_id: group.id,
                    },
                );
            }
            for group_id in &removed {
                // A removed group may have been deleted since; record it by ID
                let name = match tx.get_group_by_id(LockingStrength::Share, account_id, group_id) {
                    Ok(group) => group.name,
                    Err(e) if e.is_not_found() => group_id.clone(),
                    Err(e) => return Err(e),
                };
                mutation.record(
                    user_id,
                    group_id,
                    Activity::GroupRemovedFromDisabledManagementGroups {
                        group: name,
                        group_id: group_id.clone(),
                    },
                );
            }

            let changed: Vec<String> = added.into_iter().chain(removed).collect();
            if any_group_has_peers(tx, account_id, &changed)? {
                mutation.mark_impactful();
            }
            Ok(())
        })
    }

    // ========================================================================
    // Account settings
    // ========================================================================

    pub async fn update_account_settings(&self, account_id: &str, user_id: &str, settings: Settings) -> Result<Settings> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            ensure_groups_exist(tx, account_id, settings.integrated_validator_groups())?;

            let old = tx.get_account_settings(LockingStrength::Update, account_id)?;
            tx.save_account_settings(LockingStrength::Update, account_id, &settings)?;

            let old_approval = old.extra.as_ref().is_some_and(|e| e.peer_approval_enabled);
            let new_approval = settings.extra.as_ref().is_some_and(|e| e.peer_approval_enabled);

            let mut changed = difference(settings.integrated_validator_groups(), old.integrated_validator_groups());
            changed.extend(difference(old.integrated_validator_groups(), settings.integrated_validator_groups()));

            if old_approval != new_approval || any_group_has_peers(tx, account_id, &changed)? {
                mutation.mark_impactful();
            }

            mutation.record(user_id, account_id, Activity::AccountSettingsUpdated);
            Ok(settings)
        })
    }

    // ========================================================================
    // Setup keys and users
    // ========================================================================

    /// Create or update a setup key. Auto-groups only affect future peers.
    pub async fn save_setup_key(&self, account_id: &str, user_id: &str, mut key: SetupKey) -> Result<SetupKey> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        let key = self.commit(guard, |tx, mutation| {
            ensure_groups_exist(tx, account_id, &key.auto_groups)?;
            if key.id.is_empty() {
                key.id = new_id();
            }
            key.account_id = account_id.to_string();
            tx.save_setup_key(LockingStrength::Update, &key)?;

            mutation.record(user_id, &key.id, Activity::SetupKeySaved { name: key.name.clone() });
            Ok(key)
        })?;

        info!("Saved setup key {} in account {}", key.name, account_id);
        Ok(key)
    }

    pub fn get_setup_keys(&self, account_id: &str, user_id: &str) -> Result<Vec<SetupKey>> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_account_setup_keys(LockingStrength::Share, account_id)
        })
    }

    /// Replace the auto-groups of a user of the account
    pub async fn save_user_auto_groups(
        &self,
        account_id: &str,
        user_id: &str,
        target_user_id: &str,
        groups: Vec<String>,
    ) -> Result<User> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            let mut target = permissions::account_user(tx, account_id, target_user_id)?;
            ensure_groups_exist(tx, account_id, &groups)?;

            target.auto_groups = groups;
            tx.save_user(LockingStrength::Update, &target)?;

            mutation.record(
                user_id,
                target_user_id,
                Activity::UserGroupsUpdated {
                    user_id: target_user_id.to_string(),
                    groups: target.auto_groups.clone(),
                },
            );
            Ok(target)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use meshplane_common::ErrorKind;

    fn ns_group(name: &str, groups: Vec<String>) -> NameServerGroup {
        NameServerGroup {
            id: String::new(),
            account_id: String::new(),
            name: name.to_string(),
            description: String::new(),
            nameservers: vec![NameServer {
                ip: "1.1.1.1".parse().unwrap(),
                port: 53,
            }],
            groups,
            domains: Vec::new(),
            primary: true,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_name_server_group_lifecycle() {
        let fx = Fixture::new().await;
        let p1 = fx.add_peer("alpha", 2).await;
        let corp = fx.create_group("corp", &[&p1]).await;
        let serial = fx.serial();

        let saved = fx
            .manager
            .save_name_server_group(Fixture::ACCOUNT, Fixture::ADMIN, ns_group("corp-dns", vec![corp.clone()]))
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial + 1);

        let err = fx
            .manager
            .delete_group(Fixture::ACCOUNT, Fixture::ADMIN, &corp)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "group has been linked to name server groups: corp-dns");

        // Membership changes of a DNS-distributed group reach peers
        fx.manager.group_delete_peer(Fixture::ACCOUNT, &corp, &p1).await.unwrap();
        assert_eq!(fx.serial(), serial + 2);

        fx.manager
            .delete_name_server_group(Fixture::ACCOUNT, Fixture::ADMIN, &saved.id)
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial + 2);
        assert_eq!(fx.events().pop().unwrap().activity.code(), "nameserver.group.delete");
    }

    #[tokio::test]
    async fn test_dns_settings_diff() {
        let fx = Fixture::new().await;
        let p1 = fx.add_peer("alpha", 2).await;
        let a = fx.create_group("a", &[&p1]).await;
        let b = fx.create_group("b", &[]).await;
        let serial = fx.serial();

        fx.manager
            .save_dns_settings(
                Fixture::ACCOUNT,
                Fixture::ADMIN,
                DnsSettings {
                    disabled_management_groups: vec![b.clone()],
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial);

        fx.manager
            .save_dns_settings(
                Fixture::ACCOUNT,
                Fixture::ADMIN,
                DnsSettings {
                    disabled_management_groups: vec![a.clone()],
                },
            )
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial + 1);

        let events = fx.events();
        let tail: Vec<_> = events[events.len() - 2..]
            .iter()
            .map(|e| (e.activity.code(), e.target_id.clone()))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("dns.setting.disabled.management.group.add", a.clone()),
                ("dns.setting.disabled.management.group.delete", b.clone()),
            ]
        );

        let settings = fx.manager.get_dns_settings(Fixture::ACCOUNT, Fixture::ADMIN).unwrap();
        assert_eq!(settings.disabled_management_groups, vec![a]);

        let err = fx
            .manager
            .save_dns_settings(
                Fixture::ACCOUNT,
                Fixture::ADMIN,
                DnsSettings {
                    disabled_management_groups: vec!["ghost".into()],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_account_settings() {
        let fx = Fixture::new().await;
        let validators = fx.create_group("validators", &[]).await;
        let serial = fx.serial();

        let settings = Settings {
            peer_login_expiration_enabled: true,
            extra: Some(ExtraSettings {
                peer_approval_enabled: false,
                integrated_validator_groups: vec![validators.clone()],
            }),
        };
        fx.manager
            .update_account_settings(Fixture::ACCOUNT, Fixture::ADMIN, settings.clone())
            .await
            .unwrap();

        assert_eq!(fx.serial(), serial);
        assert_eq!(fx.manager.get_account(Fixture::ACCOUNT).unwrap().settings, settings);
        assert_eq!(fx.events().pop().unwrap().activity, Activity::AccountSettingsUpdated);

        let err = fx
            .manager
            .delete_group(Fixture::ACCOUNT, Fixture::ADMIN, &validators)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "group has been linked to integrated validator: validators");
    }

    #[tokio::test]
    async fn test_auto_groups_are_not_impactful() {
        let fx = Fixture::new().await;
        let p1 = fx.add_peer("alpha", 2).await;
        let eng = fx.create_group("eng", &[&p1]).await;
        let serial = fx.serial();

        let user = fx
            .manager
            .save_user_auto_groups(Fixture::ACCOUNT, Fixture::ADMIN, Fixture::USER, vec![eng.clone()])
            .await
            .unwrap();
        assert_eq!(user.auto_groups, vec![eng.clone()]);

        let key = fx
            .manager
            .save_setup_key(
                Fixture::ACCOUNT,
                Fixture::ADMIN,
                SetupKey {
                    id: String::new(),
                    account_id: String::new(),
                    name: "servers".into(),
                    auto_groups: vec![eng.clone()],
                    revoked: false,
                },
            )
            .await
            .unwrap();
        assert!(!key.id.is_empty());
        assert_eq!(fx.manager.get_setup_keys(Fixture::ACCOUNT, Fixture::ADMIN).unwrap().len(), 1);
        assert_eq!(fx.serial(), serial);

        // Setup keys are checked before users
        let err = fx
            .manager
            .delete_group(Fixture::ACCOUNT, Fixture::ADMIN, &eng)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "group has been linked to setup key: servers");

        let err = fx
            .manager
            .save_user_auto_groups(Fixture::ACCOUNT, Fixture::ADMIN, "nobody", Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
