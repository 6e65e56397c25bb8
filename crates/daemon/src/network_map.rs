//! Per-peer network map computation

use crate::acl::{AclEvaluator, FirewallRule};
use meshplane_common::types::*;
use meshplane_common::{Error, LockingStrength, Result, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// A peer as seen by another peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub id: String,
    pub name: String,
    pub key: String,
    pub ip: Ipv4Addr,
    pub fqdn: String,
}

/// DNS configuration delivered to a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// False when the peer sits in a DNS-management-disabled group
    pub service_enabled: bool,
    pub name_server_groups: Vec<NameServerGroup>,
}

/// Everything a peer needs to configure its tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    pub peer: Peer,
    pub remote_peers: Vec<RemotePeer>,
    pub firewall_rules: Vec<FirewallRule>,
    pub routes: Vec<Route>,
    pub dns: DnsConfig,
}

/// Snapshot of an account's connectivity-relevant state
pub struct AccountState {
    pub account: Account,
    pub peers: Vec<Peer>,
    pub groups: Vec<Group>,
    pub policies: Vec<Policy>,
    pub routes: Vec<Route>,
    pub ns_groups: Vec<NameServerGroup>,
}

impl AccountState {
    pub fn load(store: &dyn Store, strength: LockingStrength, account_id: &str) -> Result<Self> {
        Ok(Self {
            account: store.get_account(strength, account_id)?,
            peers: store.get_account_peers(strength, account_id)?,
            groups: store.get_account_groups(strength, account_id)?,
            policies: store.get_account_policies(strength, account_id)?,
            routes: store.get_account_routes(strength, account_id)?,
            ns_groups: store.get_account_name_server_groups(strength, account_id)?,
        })
    }

    fn peer_group_ids(&self, peer_id: &str) -> HashSet<&str> {
        self.groups
            .iter()
            .filter(|g| g.contains(peer_id))
            .map(|g| g.id.as_str())
            .collect()
    }

    /// Compute the network map of one peer
    pub fn network_map(&self, peer_id: &str, dns_domain: &str) -> Result<NetworkMap> {
        let peer = self
            .peers
            .iter()
            .find(|p| p.id == peer_id)
            .ok_or_else(|| Error::not_found("peer", peer_id))?;
        let member_of = self.peer_group_ids(peer_id);
        let in_any = |ids: &[String]| ids.iter().any(|id| member_of.contains(id.as_str()));

        let acl = AclEvaluator::new(&self.policies, &self.groups);
        let (remote_ids, firewall_rules) = acl.connections(peer_id, &self.peers);
        let remote_peers = self
            .peers
            .iter()
            .filter(|p| remote_ids.contains(&p.id))
            .map(|p| RemotePeer {
                id: p.id.clone(),
                name: p.name.clone(),
                key: p.key.clone(),
                ip: p.ip,
                fqdn: p.fqdn(dns_domain),
            })
            .collect();

        // The routing peer does not receive its own routes
        let routes = self
            .routes
            .iter()
            .filter(|r| r.enabled && in_any(&r.groups))
            .filter(|r| r.peer.as_deref() != Some(peer_id) && !in_any(&r.peer_groups))
            .cloned()
            .collect();

        let dns = DnsConfig {
            service_enabled: !in_any(&self.account.dns_settings.disabled_management_groups),
            name_server_groups: self
                .ns_groups
                .iter()
                .filter(|ns| ns.enabled && in_any(&ns.groups))
                .cloned()
                .collect(),
        };

        Ok(NetworkMap {
            serial: self.account.network_serial,
            peer: peer.clone(),
            remote_peers,
            firewall_rules,
            routes,
            dns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn test_default_policy_connects_everyone() {
        let fx = Fixture::new().await;
        let a = fx.add_peer("laptop", 2).await;
        let b = fx.add_peer("server", 3).await;

        let state = fx
            .db
            .read(|tx| AccountState::load(tx, LockingStrength::Share, Fixture::ACCOUNT))
            .unwrap();
        let map = state.network_map(&a, "mesh.test").unwrap();

        assert_eq!(map.serial, state.account.network_serial);
        assert_eq!(map.remote_peers.len(), 1);
        assert_eq!(map.remote_peers[0].id, b);
        assert_eq!(map.remote_peers[0].fqdn, "server.mesh.test");
        assert!(map.dns.service_enabled);
    }

    #[tokio::test]
    async fn test_routes_and_dns_follow_groups() {
        let fx = Fixture::new().await;
        let a = fx.add_peer("laptop", 2).await;
        let router = fx.add_peer("router", 3).await;
        let office = fx.create_group("office", &[&a]).await;
        let routers = fx.create_group("routers", &[&router]).await;
        let nodns = fx.create_group("nodns", &[&a]).await;

        fx.db
            .execute_in_transaction(|tx| {
                tx.save_route(
                    LockingStrength::Update,
                    &Route {
                        id: "r1".into(),
                        account_id: Fixture::ACCOUNT.into(),
                        net_id: "office-lan".into(),
                        description: String::new(),
                        network: "10.1.0.0/16".parse::<ipnetwork::IpNetwork>().unwrap(),
                        peer: None,
                        peer_groups: vec![routers.clone()],
                        groups: vec![office.clone(), routers.clone()],
                        enabled: true,
                        metric: 100,
                        masquerade: true,
                    },
                )?;
                tx.save_dns_settings(
                    LockingStrength::Update,
                    Fixture::ACCOUNT,
                    &DnsSettings {
                        disabled_management_groups: vec![nodns.clone()],
                    },
                )
            })
            .unwrap();

        let state = fx
            .db
            .read(|tx| AccountState::load(tx, LockingStrength::Share, Fixture::ACCOUNT))
            .unwrap();

        let map = state.network_map(&a, "").unwrap();
        assert_eq!(map.routes.len(), 1);
        assert!(!map.dns.service_enabled);

        let map = state.network_map(&router, "").unwrap();
        assert!(map.routes.is_empty());
        assert!(map.dns.service_enabled);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let fx = Fixture::new().await;
        let state = fx
            .db
            .read(|tx| AccountState::load(tx, LockingStrength::Share, Fixture::ACCOUNT))
            .unwrap();
        assert!(state.network_map("ghost", "").unwrap_err().is_not_found());
    }
}
