//! Policy evaluation.
//!
//! Pure functions over an account's policies and group membership: who can
//! reach whom, which firewall rules a peer receives, and whether touching a
//! set of groups can change any of that.

use meshplane_common::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Traffic direction relative to the peer receiving the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Firewall rule forwarded to the data plane. Protocol and ports are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirewallRule {
    pub peer_ip: String,
    pub direction: Direction,
    pub action: String,
    pub protocol: String,
    pub port: String,
}

/// Evaluates reachability for one account snapshot
pub struct AclEvaluator<'a> {
    policies: &'a [Policy],
    groups: HashMap<&'a str, &'a Group>,
}

impl<'a> AclEvaluator<'a> {
    pub fn new(policies: &'a [Policy], groups: &'a [Group]) -> Self {
        Self {
            policies,
            groups: groups.iter().map(|g| (g.id.as_str(), g)).collect(),
        }
    }

    fn in_any(&self, group_ids: &[String], peer_id: &str) -> bool {
        group_ids
            .iter()
            .any(|id| self.groups.get(id.as_str()).is_some_and(|g| g.contains(peer_id)))
    }

    fn members(&self, group_ids: &[String]) -> BTreeSet<&'a str> {
        group_ids
            .iter()
            .filter_map(|id| self.groups.get(id.as_str()))
            .flat_map(|g| g.peers.iter().map(String::as_str))
            .collect()
    }

    fn active_rules(&self) -> impl Iterator<Item = &'a PolicyRule> + '_ {
        self.policies
            .iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.rules.iter())
            .filter(|r| r.enabled)
    }

    /// Whether `from` may open connections to `to`
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        if from == to {
            return false;
        }
        self.active_rules()
            .filter(|r| r.action == PolicyAction::Accept)
            .any(|r| {
                (self.in_any(&r.sources, from) && self.in_any(&r.destinations, to))
                    || (r.bidirectional && self.in_any(&r.sources, to) && self.in_any(&r.destinations, from))
            })
    }

    /// Peers that must appear in `peer_id`'s network map, with the firewall
    /// rules governing traffic to and from them.
    pub fn connections(&self, peer_id: &str, peers: &[Peer]) -> (Vec<String>, Vec<FirewallRule>) {
        let ips: HashMap<&str, String> = peers.iter().map(|p| (p.id.as_str(), p.ip.to_string())).collect();

        let mut remote = BTreeSet::new();
        let mut rules = BTreeSet::new();

        for rule in self.active_rules() {
            let as_source = self.in_any(&rule.sources, peer_id);
            let as_destination = self.in_any(&rule.destinations, peer_id);

            let mut add = |others: BTreeSet<&'a str>, direction: Direction| {
                for other in others {
                    if other == peer_id {
                        continue;
                    }
                    let Some(ip) = ips.get(other) else { continue };
                    if rule.action == PolicyAction::Accept {
                        remote.insert(other.to_string());
                    }
                    rules.extend(firewall_rules(rule, ip, direction));
                }
            };

            if as_source {
                add(self.members(&rule.destinations), Direction::Out);
                if rule.bidirectional {
                    add(self.members(&rule.destinations), Direction::In);
                }
            }
            if as_destination {
                add(self.members(&rule.sources), Direction::In);
                if rule.bidirectional {
                    add(self.members(&rule.sources), Direction::Out);
                }
            }
        }

        (remote.into_iter().collect(), rules.into_iter().collect())
    }
}

fn firewall_rules(rule: &PolicyRule, peer_ip: &str, direction: Direction) -> Vec<FirewallRule> {
    let action = match rule.action {
        PolicyAction::Accept => "accept",
        PolicyAction::Drop => "drop",
    };
    let base = FirewallRule {
        peer_ip: peer_ip.to_string(),
        direction,
        action: action.to_string(),
        protocol: rule.protocol.to_string(),
        port: String::new(),
    };

    if rule.ports.is_empty() {
        return vec![base];
    }
    rule.ports
        .iter()
        .map(|port| FirewallRule {
            port: port.clone(),
            ..base.clone()
        })
        .collect()
}

/// Whether changing the membership of `group_ids` can alter any peer's
/// network map.
///
/// Conservative: a group counts as connectivity-relevant when an enabled rule
/// of an enabled policy names it, when it is listed in the DNS management
/// exceptions, when any name server group distributes to it, or when any route
/// (enabled or not) distributes to or is advertised by it.
pub fn groups_affect_connectivity(
    group_ids: &[String],
    policies: &[Policy],
    routes: &[Route],
    ns_groups: &[NameServerGroup],
    dns_settings: &DnsSettings,
) -> bool {
    group_ids.iter().any(|group_id| {
        dns_settings.disabled_management_groups.contains(group_id)
            || ns_groups.iter().any(|ns| ns.groups.contains(group_id))
            || routes.iter().any(|r| r.references_group(group_id))
            || policies
                .iter()
                .filter(|p| p.enabled)
                .flat_map(|p| p.rules.iter())
                .any(|r| r.enabled && r.references_group(group_id))
    })
}

/// Whether any of `group_ids` currently has members
pub fn any_group_has_peers(groups: &[Group], group_ids: &[String]) -> bool {
    group_ids
        .iter()
        .any(|id| groups.iter().any(|g| &g.id == id && g.has_peers()))
}
