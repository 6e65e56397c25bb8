//! Activity (audit) records.
//!
//! Every event kind carries its own fixed set of fields, so consumers never
//! need to dig through an open metadata map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened, with the metadata recorded for that kind of change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    // --- Groups ---
    GroupCreated {
        name: String,
    },
    GroupDeleted {
        name: String,
    },
    GroupAddedToPeer {
        group: String,
        group_id: String,
        peer_ip: String,
        peer_fqdn: String,
    },
    GroupRemovedFromPeer {
        group: String,
        group_id: String,
        peer_ip: String,
        peer_fqdn: String,
    },

    // --- Peers ---
    PeerAdded {
        name: String,
        ip: String,
        fqdn: String,
    },
    PeerRemoved {
        name: String,
        ip: String,
        fqdn: String,
    },

    // --- Policies ---
    PolicyAdded {
        name: String,
    },
    PolicyUpdated {
        name: String,
    },
    PolicyRemoved {
        name: String,
    },

    // --- Routes ---
    RouteCreated {
        name: String,
    },
    RouteUpdated {
        name: String,
    },
    RouteRemoved {
        name: String,
    },

    // --- DNS ---
    NameserverGroupCreated {
        name: String,
    },
    NameserverGroupUpdated {
        name: String,
    },
    NameserverGroupDeleted {
        name: String,
    },
    GroupAddedToDisabledManagementGroups {
        group: String,
        group_id: String,
    },
    GroupRemovedFromDisabledManagementGroups {
        group: String,
        group_id: String,
    },

    // --- Settings, keys and users ---
    AccountSettingsUpdated,
    SetupKeySaved {
        name: String,
    },
    UserGroupsUpdated {
        user_id: String,
        groups: Vec<String>,
    },
}

impl Activity {
    /// Stable label for the event kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::GroupCreated { .. } => "group.add",
            Self::GroupDeleted { .. } => "group.delete",
            Self::GroupAddedToPeer { .. } => "peer.group.add",
            Self::GroupRemovedFromPeer { .. } => "peer.group.delete",
            Self::PeerAdded { .. } => "peer.add",
            Self::PeerRemoved { .. } => "peer.delete",
            Self::PolicyAdded { .. } => "policy.add",
            Self::PolicyUpdated { .. } => "policy.update",
            Self::PolicyRemoved { .. } => "policy.delete",
            Self::RouteCreated { .. } => "route.add",
            Self::RouteUpdated { .. } => "route.update",
            Self::RouteRemoved { .. } => "route.delete",
            Self::NameserverGroupCreated { .. } => "nameserver.group.add",
            Self::NameserverGroupUpdated { .. } => "nameserver.group.update",
            Self::NameserverGroupDeleted { .. } => "nameserver.group.delete",
            Self::GroupAddedToDisabledManagementGroups { .. } => "dns.setting.disabled.management.group.add",
            Self::GroupRemovedFromDisabledManagementGroups { .. } => {
                "dns.setting.disabled.management.group.delete"
            }
            Self::AccountSettingsUpdated => "account.settings.update",
            Self::SetupKeySaved { .. } => "setupkey.save",
            Self::UserGroupsUpdated { .. } => "user.group.update",
        }
    }
}

/// A recorded change, attributed to an initiator and a target entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub initiator_id: String,
    pub target_id: String,
    pub account_id: String,
    pub activity: Activity,
}

impl ActivityEvent {
    pub fn new(initiator_id: &str, target_id: &str, account_id: &str, activity: Activity) -> Self {
        Self {
            timestamp: Utc::now(),
            initiator_id: initiator_id.to_string(),
            target_id: target_id.to_string(),
            account_id: account_id.to_string(),
            activity,
        }
    }
}
