//! Network route management

use crate::manager::{any_group_has_peers, ensure_groups_exist, AccountManager};
use crate::permissions;
use meshplane_common::types::*;
use meshplane_common::{Activity, Error, LockingStrength, Result, Store};
use tracing::info;

impl AccountManager {
    /// Create or update a route
    pub async fn save_route(&self, account_id: &str, user_id: &str, mut route: Route) -> Result<Route> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        let route = self.commit(guard, |tx, mutation| {
            validate_route(tx, account_id, &route)?;

            let existing = if route.id.is_empty() {
                route.id = new_id();
                None
            } else {
                match tx.get_route_by_id(LockingStrength::Update, account_id, &route.id) {
                    Ok(existing) => Some(existing),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                }
            };

            route.account_id = account_id.to_string();
            tx.save_route(LockingStrength::Update, &route)?;

            let mut impactful = route_affects_peers(tx, account_id, &route)?;
            if let Some(old) = &existing {
                impactful = impactful || route_affects_peers(tx, account_id, old)?;
            }
            if impactful {
                mutation.mark_impactful();
            }

            let activity = match existing {
                Some(_) => Activity::RouteUpdated { name: route.net_id.clone() },
                None => Activity::RouteCreated { name: route.net_id.clone() },
            };
            mutation.record(user_id, &route.id, activity);
            Ok(route)
        })?;

        info!("Saved route {} ({}) in account {}", route.net_id, route.network, account_id);
        Ok(route)
    }

    pub async fn delete_route(&self, account_id: &str, user_id: &str, route_id: &str) -> Result<()> {
        self.authorize(account_id, user_id)?;
        let guard = self.lock_account(account_id).await;

        self.commit(guard, |tx, mutation| {
            let route = tx.get_route_by_id(LockingStrength::Update, account_id, route_id)?;
            tx.delete_route(LockingStrength::Update, account_id, route_id)?;

            if route_affects_peers(tx, account_id, &route)? {
                mutation.mark_impactful();
            }
            mutation.record(user_id, route_id, Activity::RouteRemoved { name: route.net_id });
            Ok(())
        })
    }

    pub fn get_route(&self, account_id: &str, user_id: &str, route_id: &str) -> Result<Route> {
        self.db.read(|tx| {
            permissions::check_account_admin(tx, account_id, user_id)?;
            tx.get_route_by_id(LockingStrength::Share, account_id, route_id)
        })
    }
}

fn validate_route(store: &dyn Store, account_id: &str, route: &Route) -> Result<()> {
    if route.net_id.trim().is_empty() {
        return Err(Error::InvalidArgument("route network identifier should not be empty".to_string()));
    }
    match (&route.peer, route.peer_groups.is_empty()) {
        (Some(_), false) => {
            return Err(Error::InvalidArgument(
                "peer with peer_groups can't be provided at the same time".to_string(),
            ))
        }
        (None, true) => {
            return Err(Error::InvalidArgument(
                "either peer or peer_groups should be provided".to_string(),
            ))
        }
        _ => {}
    }
    if route.groups.is_empty() {
        return Err(Error::InvalidArgument("route should have at least one distribution group".to_string()));
    }

    if let Some(peer_id) = &route.peer {
        match store.get_peer_by_id(LockingStrength::Share, account_id, peer_id) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::InvalidArgument(format!("peer with ID {} not found", peer_id)));
            }
            Err(e) => return Err(e),
        }
    }

    ensure_groups_exist(store, account_id, &route.groups)?;
    ensure_groups_exist(store, account_id, &route.peer_groups)
}

/// A route matters once it has a routing peer or any populated group
fn route_affects_peers(store: &dyn Store, account_id: &str, route: &Route) -> Result<bool> {
    if route.peer.is_some() {
        return Ok(true);
    }
    if any_group_has_peers(store, account_id, &route.groups)? {
        return Ok(true);
    }
    any_group_has_peers(store, account_id, &route.peer_groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use meshplane_common::ErrorKind;

    fn route(net_id: &str, peer_groups: Vec<String>, groups: Vec<String>) -> Route {
        Route {
            id: String::new(),
            account_id: String::new(),
            net_id: net_id.to_string(),
            description: String::new(),
            network: "192.168.10.0/24".parse::<ipnetwork::IpNetwork>().unwrap(),
            peer: None,
            peer_groups,
            groups,
            enabled: true,
            metric: 9999,
            masquerade: false,
        }
    }

    #[tokio::test]
    async fn test_route_lifecycle() {
        let fx = Fixture::new().await;
        let router = fx.add_peer("router", 2).await;
        let routers = fx.create_group("routers", &[&router]).await;
        let office = fx.create_group("office", &[]).await;
        let serial = fx.serial();

        let saved = fx
            .manager
            .save_route(Fixture::ACCOUNT, Fixture::ADMIN, route("office-lan", vec![routers.clone()], vec![office.clone()]))
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial + 1);
        assert_eq!(fx.events().pop().unwrap().activity, Activity::RouteCreated { name: "office-lan".into() });

        // Both route groups are now linked
        let err = fx
            .manager
            .delete_group(Fixture::ACCOUNT, Fixture::ADMIN, &office)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "group has been linked to route: office-lan");

        fx.manager
            .delete_route(Fixture::ACCOUNT, Fixture::ADMIN, &saved.id)
            .await
            .unwrap();
        assert_eq!(fx.serial(), serial + 2);
        fx.manager
            .delete_group(Fixture::ACCOUNT, Fixture::ADMIN, &office)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_route_validation() {
        let fx = Fixture::new().await;
        let office = fx.create_group("office", &[]).await;

        let cases = vec![
            route("", vec![office.clone()], vec![office.clone()]),
            route("lan", Vec::new(), vec![office.clone()]),
            route("lan", vec![office.clone()], Vec::new()),
            route("lan", vec!["ghost".into()], vec![office.clone()]),
            Route {
                peer: Some("ghost-peer".into()),
                ..route("lan", Vec::new(), vec![office.clone()])
            },
        ];

        for case in cases {
            let err = fx
                .manager
                .save_route(Fixture::ACCOUNT, Fixture::ADMIN, case)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }
}
