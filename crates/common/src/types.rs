//! Core types for meshplane

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Name of the distinguished group every peer belongs to
pub const GROUP_ALL_NAME: &str = "All";

/// Initiator recorded for changes not attributed to a user
pub const SYSTEM_INITIATOR: &str = "sys";

/// Default overlay network assigned to new accounts
pub const DEFAULT_ACCOUNT_NETWORK: &str = "100.64.0.0/10";

/// Generate a new unique entity identifier
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Account
// ============================================================================

/// Tenant root record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub created_by: String,
    pub domain: String,
    pub network: Ipv4Network,
    /// Version of the account's effective network configuration
    #[serde(default)]
    pub network_serial: u64,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub dns_settings: DnsSettings,
    pub created_at: i64,
}

impl Account {
    pub fn new(id: String, created_by: String, domain: String) -> Self {
        Self {
            id,
            created_by,
            domain,
            network: DEFAULT_ACCOUNT_NETWORK
                .parse()
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(100, 64, 0, 0))),
            network_serial: 0,
            settings: Settings::default(),
            dns_settings: DnsSettings::default(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Account-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub peer_login_expiration_enabled: bool,
    #[serde(default)]
    pub extra: Option<ExtraSettings>,
}

impl Settings {
    pub fn integrated_validator_groups(&self) -> &[String] {
        self.extra
            .as_ref()
            .map(|e| e.integrated_validator_groups.as_slice())
            .unwrap_or_default()
    }
}

/// Settings owned by integrations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraSettings {
    #[serde(default)]
    pub peer_approval_enabled: bool,
    #[serde(default)]
    pub integrated_validator_groups: Vec<String>,
}

/// DNS management settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Groups whose peers do not receive managed DNS configuration
    #[serde(default)]
    pub disabled_management_groups: Vec<String>,
}

// ============================================================================
// Peer
// ============================================================================

/// Peer connectivity status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub last_seen: i64,
}

/// A machine enrolled in an account's mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub account_id: String,
    /// WireGuard public key
    pub key: String,
    pub name: String,
    pub dns_label: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub status: PeerStatus,
    pub created_at: i64,
}

impl Peer {
    pub fn new(name: &str, key: &str, ip: Ipv4Addr) -> Self {
        Self {
            id: new_id(),
            account_id: String::new(),
            key: key.to_string(),
            name: name.to_string(),
            dns_label: name.to_lowercase().replace(' ', "-"),
            ip,
            status: PeerStatus::default(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Fully qualified name under the management DNS domain
    pub fn fqdn(&self, dns_domain: &str) -> String {
        if dns_domain.is_empty() {
            self.dns_label.clone()
        } else {
            format!("{}.{}", self.dns_label, dns_domain)
        }
    }
}

// ============================================================================
// Group
// ============================================================================

/// Origin of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupIssued {
    Api,
    Integration,
    Jwt,
}

impl Default for GroupIssued {
    fn default() -> Self {
        Self::Api
    }
}

impl std::fmt::Display for GroupIssued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Integration => write!(f, "integration"),
            Self::Jwt => write!(f, "jwt"),
        }
    }
}

/// Named set of peers used as a policy, route and DNS selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub issued: GroupIssued,
    /// Member peer IDs, in insertion order
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Group {
    pub fn new(name: &str, issued: GroupIssued, peers: Vec<String>) -> Self {
        Self {
            id: String::new(),
            account_id: String::new(),
            name: name.to_string(),
            issued,
            peers,
        }
    }

    /// Add a peer. Returns false if it was already a member.
    pub fn add_peer(&mut self, peer_id: &str) -> bool {
        if self.peers.iter().any(|p| p == peer_id) {
            return false;
        }
        self.peers.push(peer_id.to_string());
        true
    }

    /// Remove a peer. Returns false if it was not a member.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer_id);
        self.peers.len() != before
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p == peer_id)
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn is_group_all(&self) -> bool {
        self.name == GROUP_ALL_NAME
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Accept,
    Drop,
}

impl Default for PolicyAction {
    fn default() -> Self {
        Self::Accept
    }
}

/// Traffic protocol matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::All
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::All => write!(f, "all"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub action: PolicyAction,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub protocol: Protocol,
    /// Port or port range specs, forwarded to the data plane untouched
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl PolicyRule {
    pub fn accept(name: &str, sources: Vec<String>, destinations: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            enabled: true,
            action: PolicyAction::Accept,
            bidirectional: true,
            protocol: Protocol::All,
            ports: Vec::new(),
            sources,
            destinations,
        }
    }

    pub fn references_group(&self, group_id: &str) -> bool {
        self.sources.iter().any(|g| g == group_id) || self.destinations.iter().any(|g| g == group_id)
    }

    pub fn group_ids(&self) -> impl Iterator<Item = &String> {
        self.sources.iter().chain(self.destinations.iter())
    }
}

/// Access-control statement over group sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    pub fn references_group(&self, group_id: &str) -> bool {
        self.rules.iter().any(|r| r.references_group(group_id))
    }

    /// Groups referenced by any rule, enabled or not
    pub fn rule_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for rule in &self.rules {
            for group in rule.group_ids() {
                if !groups.contains(group) {
                    groups.push(group.clone());
                }
            }
        }
        groups
    }
}

// ============================================================================
// Route
// ============================================================================

/// Network route advertised into the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub net_id: String,
    #[serde(default)]
    pub description: String,
    pub network: IpNetwork,
    /// Single routing peer, exclusive with `peer_groups`
    #[serde(default)]
    pub peer: Option<String>,
    /// Groups whose peers act as routers
    #[serde(default)]
    pub peer_groups: Vec<String>,
    /// Distribution groups receiving the route
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metric: u32,
    #[serde(default)]
    pub masquerade: bool,
}

impl Route {
    pub fn references_group(&self, group_id: &str) -> bool {
        self.groups.iter().any(|g| g == group_id) || self.peer_groups.iter().any(|g| g == group_id)
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub ip: IpAddr,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

/// Upstream resolvers distributed to a set of groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServerGroup {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nameservers: Vec<NameServer>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ============================================================================
// Setup keys and users
// ============================================================================

/// Enrollment key; peers registered with it join its auto-groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupKey {
    pub id: String,
    #[serde(default)]
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub auto_groups: Vec<String>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub is_service_user: bool,
    /// Groups assigned to peers this user enrolls
    #[serde(default)]
    pub auto_groups: Vec<String>,
}

impl User {
    pub fn new(id: &str, account_id: &str, role: UserRole) -> Self {
        Self {
            id: id.to_string(),
            account_id: account_id.to_string(),
            role,
            is_service_user: false,
            auto_groups: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Regular users are neither admins nor service users
    pub fn is_regular_user(&self) -> bool {
        !self.is_admin() && !self.is_service_user
    }
}

fn default_true() -> bool {
    true
}

fn default_dns_port() -> u16 {
    53
}
