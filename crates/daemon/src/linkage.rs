//! Group reference checks.
//!
//! A group may be referenced by policies, routes, name server groups, setup
//! keys, users and account settings. These checks decide whether a group can
//! be deleted and whether changing it can alter any peer's network map.

use crate::acl;
use meshplane_common::types::*;
use meshplane_common::{Error, GroupIssued, LockingStrength, Result, Store};

/// Everything in an account that can point at a group
pub struct GroupReferences {
    pub routes: Vec<Route>,
    pub ns_groups: Vec<NameServerGroup>,
    pub policies: Vec<Policy>,
    pub setup_keys: Vec<SetupKey>,
    pub users: Vec<User>,
    pub settings: Settings,
    pub dns_settings: DnsSettings,
}

impl GroupReferences {
    pub fn load(store: &dyn Store, account_id: &str) -> Result<Self> {
        let account = store.get_account(LockingStrength::Share, account_id)?;
        Ok(Self {
            routes: store.get_account_routes(LockingStrength::Share, account_id)?,
            ns_groups: store.get_account_name_server_groups(LockingStrength::Share, account_id)?,
            policies: store.get_account_policies(LockingStrength::Share, account_id)?,
            setup_keys: store.get_account_setup_keys(LockingStrength::Share, account_id)?,
            users: store.get_account_users(LockingStrength::Share, account_id)?,
            settings: account.settings,
            dns_settings: account.dns_settings,
        })
    }

    pub fn linked_route(&self, group_id: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.references_group(group_id))
    }

    pub fn linked_name_server_group(&self, group_id: &str) -> Option<&NameServerGroup> {
        self.ns_groups.iter().find(|ns| ns.groups.iter().any(|g| g == group_id))
    }

    pub fn linked_policy(&self, group_id: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.references_group(group_id))
    }

    pub fn linked_setup_key(&self, group_id: &str) -> Option<&SetupKey> {
        self.setup_keys
            .iter()
            .find(|k| k.auto_groups.iter().any(|g| g == group_id))
    }

    pub fn linked_user(&self, group_id: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|u| u.auto_groups.iter().any(|g| g == group_id))
    }

    /// Settings lists that name the group
    pub fn linked_settings(&self, group: &Group) -> Option<Error> {
        if self.dns_settings.disabled_management_groups.contains(&group.id) {
            return Some(Error::group_linked("disabled DNS management groups", &group.name));
        }
        if self.settings.integrated_validator_groups().contains(&group.id) {
            return Some(Error::group_linked("integrated validator", &group.name));
        }
        None
    }

    /// First reference that blocks deleting `group`, if any
    pub fn link_error(&self, group: &Group) -> Option<Error> {
        if let Some(route) = self.linked_route(&group.id) {
            return Some(Error::group_linked("route", &route.net_id));
        }
        if let Some(ns) = self.linked_name_server_group(&group.id) {
            return Some(Error::group_linked("name server groups", &ns.name));
        }
        if let Some(policy) = self.linked_policy(&group.id) {
            return Some(Error::group_linked("policy", &policy.name));
        }
        if let Some(key) = self.linked_setup_key(&group.id) {
            return Some(Error::group_linked("setup key", &key.name));
        }
        if let Some(user) = self.linked_user(&group.id) {
            return Some(Error::group_linked("user", &user.id));
        }
        self.linked_settings(group)
    }

    /// Whether changes to `group_ids` reach any peer's network map
    pub fn affects_peers(&self, group_ids: &[String]) -> bool {
        acl::groups_affect_connectivity(
            group_ids,
            &self.policies,
            &self.routes,
            &self.ns_groups,
            &self.dns_settings,
        )
    }
}

/// Check whether `requester` may delete `group`
pub fn validate_delete_group(refs: &GroupReferences, group: &Group, requester: &User) -> Result<()> {
    if group.issued == GroupIssued::Integration && !(requester.is_admin() && requester.is_service_user) {
        return Err(Error::PermissionDenied(
            "only service users with admin power can delete integration group".to_string(),
        ));
    }

    if group.is_group_all() {
        return Err(Error::InvalidArgument("deleting group ALL is not allowed".to_string()));
    }

    match refs.link_error(group) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Whether changing the membership of `group_ids` alters any peer's network map
pub fn are_group_changes_affect_peers(store: &dyn Store, account_id: &str, group_ids: &[String]) -> Result<bool> {
    if group_ids.is_empty() {
        return Ok(false);
    }
    Ok(GroupReferences::load(store, account_id)?.affects_peers(group_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{Account, Database, ErrorKind, UserRole};

    fn group(id: &str, name: &str, issued: GroupIssued) -> Group {
        let mut group = Group::new(name, issued, Vec::new());
        group.id = id.into();
        group.account_id = "acc".into();
        group
    }

    fn empty_refs() -> GroupReferences {
        GroupReferences {
            routes: Vec::new(),
            ns_groups: Vec::new(),
            policies: Vec::new(),
            setup_keys: Vec::new(),
            users: Vec::new(),
            settings: Settings::default(),
            dns_settings: DnsSettings::default(),
        }
    }

    fn admin() -> User {
        User::new("admin", "acc", UserRole::Admin)
    }

    #[test]
    fn test_unlinked_group_deletable() {
        let refs = empty_refs();
        assert!(validate_delete_group(&refs, &group("g", "misc", GroupIssued::Api), &admin()).is_ok());
    }

    #[test]
    fn test_group_all_not_deletable() {
        let refs = empty_refs();
        let err = validate_delete_group(&refs, &group("g", GROUP_ALL_NAME, GroupIssued::Api), &admin()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_integration_group_requires_admin_service_user() {
        let refs = empty_refs();
        let g = group("g", "idp", GroupIssued::Integration);

        let err = validate_delete_group(&refs, &g, &admin()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let mut svc = admin();
        svc.is_service_user = true;
        assert!(validate_delete_group(&refs, &g, &svc).is_ok());
    }

    #[test]
    fn test_link_kinds() {
        let g = group("g", "eng", GroupIssued::Api);

        let mut refs = empty_refs();
        refs.users.push(User {
            auto_groups: vec!["g".into()],
            ..User::new("bob", "acc", UserRole::User)
        });
        assert_eq!(
            validate_delete_group(&refs, &g, &admin()).unwrap_err().to_string(),
            "group has been linked to user: bob"
        );

        refs.setup_keys.push(SetupKey {
            id: "k".into(),
            account_id: "acc".into(),
            name: "laptops".into(),
            auto_groups: vec!["g".into()],
            revoked: false,
        });
        assert_eq!(
            validate_delete_group(&refs, &g, &admin()).unwrap_err().to_string(),
            "group has been linked to setup key: laptops"
        );

        let mut refs = empty_refs();
        refs.dns_settings.disabled_management_groups.push("g".into());
        assert_eq!(
            validate_delete_group(&refs, &g, &admin()).unwrap_err().to_string(),
            "group has been linked to disabled DNS management groups: eng"
        );

        let mut refs = empty_refs();
        refs.settings.extra = Some(ExtraSettings {
            peer_approval_enabled: true,
            integrated_validator_groups: vec!["g".into()],
        });
        assert_eq!(
            validate_delete_group(&refs, &g, &admin()).unwrap_err().kind(),
            ErrorKind::GroupLinked
        );
    }

    #[test]
    fn test_affects_peers_from_store() {
        let db = Database::open_memory().unwrap();
        db.execute_in_transaction(|tx| {
            tx.save_account(
                LockingStrength::Update,
                &Account::new("acc".into(), "owner".into(), "example.com".into()),
            )?;
            tx.save_policy(
                LockingStrength::Update,
                &Policy {
                    id: "p".into(),
                    account_id: "acc".into(),
                    name: "eng-to-srv".into(),
                    description: String::new(),
                    enabled: true,
                    rules: vec![PolicyRule::accept("r", vec!["eng".into()], vec!["srv".into()])],
                },
            )
        })
        .unwrap();

        db.read(|tx| {
            assert!(are_group_changes_affect_peers(tx, "acc", &["eng".to_string()])?);
            assert!(!are_group_changes_affect_peers(tx, "acc", &["misc".to_string()])?);
            assert!(!are_group_changes_affect_peers(tx, "acc", &[])?);
            Ok(())
        })
        .unwrap();
    }
}
