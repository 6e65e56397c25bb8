//! meshplane management daemon
//!
//! Applies account mutations under per-account locks, decides which of them
//! change peer connectivity, and pushes fresh network maps to connected peers.

pub mod acl;
pub mod activity;
pub mod config;
pub mod groups;
pub mod linkage;
pub mod locks;
pub mod manager;
pub mod network_map;
pub mod peers;
pub mod permissions;
pub mod policies;
pub mod propagation;
pub mod routes;
pub mod settings;

#[cfg(test)]
mod testing;

pub use activity::{ActivitySink, StoreActivitySink};
pub use config::ManagementConfig;
pub use groups::DeleteGroupsOutcome;
pub use locks::{AccountGuard, AccountLocks};
pub use manager::{AccountManager, Mutation, PendingEffects};
pub use network_map::NetworkMap;
pub use propagation::{NetworkMapPropagator, PeerUpdateSink, PeersUpdateManager, PropagatorHandle};
