//! Shared test fixture

use crate::activity::StoreActivitySink;
use crate::manager::AccountManager;
use crate::propagation::PeerUpdateSink;
use meshplane_common::types::*;
use meshplane_common::{ActivityEvent, Database, LockingStrength};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Records every propagation request
#[derive(Default)]
pub struct RecordingPeerUpdateSink {
    calls: Mutex<Vec<String>>,
}

impl RecordingPeerUpdateSink {
    pub fn count(&self, account_id: &str) -> usize {
        self.calls.lock().iter().filter(|a| *a == account_id).count()
    }
}

impl PeerUpdateSink for RecordingPeerUpdateSink {
    fn update_account_peers(&self, account_id: &str) {
        self.calls.lock().push(account_id.to_string());
    }
}

/// In-memory account with an admin, a regular user and an admin service user
pub struct Fixture {
    pub db: Database,
    pub manager: AccountManager,
    pub updates: Arc<RecordingPeerUpdateSink>,
}

impl Fixture {
    pub const ACCOUNT: &'static str = "acc";
    pub const ADMIN: &'static str = "admin";
    pub const USER: &'static str = "alice";
    pub const SERVICE: &'static str = "svc";

    pub async fn new() -> Self {
        let db = Database::open_memory().unwrap();
        let updates = Arc::new(RecordingPeerUpdateSink::default());
        let manager = AccountManager::new(
            db.clone(),
            Arc::new(StoreActivitySink::new(db.clone())),
            updates.clone(),
            "mesh.test",
        );

        manager
            .create_account(Self::ACCOUNT, Self::ADMIN, "example.com")
            .await
            .unwrap();

        db.execute_in_transaction(|tx| {
            tx.save_user(LockingStrength::Update, &User::new(Self::USER, Self::ACCOUNT, UserRole::User))?;
            let mut service = User::new(Self::SERVICE, Self::ACCOUNT, UserRole::Admin);
            service.is_service_user = true;
            tx.save_user(LockingStrength::Update, &service)
        })
        .unwrap();

        Self { db, manager, updates }
    }

    /// Register a peer at 100.64.0.`last_octet`, returning its ID
    pub async fn add_peer(&self, name: &str, last_octet: u8) -> String {
        let peer = Peer::new(name, &format!("key-{}", name), Ipv4Addr::new(100, 64, 0, last_octet));
        self.manager
            .add_peer(Self::ACCOUNT, None, peer)
            .await
            .unwrap()
            .id
    }

    /// Create an API group, returning its ID
    pub async fn create_group(&self, name: &str, peers: &[&String]) -> String {
        let group = Group::new(name, GroupIssued::Api, peers.iter().map(|p| p.to_string()).collect());
        self.manager
            .save_group(Self::ACCOUNT, Self::ADMIN, group)
            .await
            .unwrap()
            .id
    }

    /// Reference the group from an enabled policy named `<group>-policy`
    pub async fn link_to_policy(&self, group_id: &str) {
        let group = self
            .manager
            .get_group(Self::ACCOUNT, group_id, Self::ADMIN)
            .unwrap();
        let policy = Policy {
            id: String::new(),
            account_id: String::new(),
            name: format!("{}-policy", group.name),
            description: String::new(),
            enabled: true,
            rules: vec![PolicyRule::accept(
                &group.name,
                vec![group_id.to_string()],
                vec![group_id.to_string()],
            )],
        };
        self.manager
            .save_policy(Self::ACCOUNT, Self::ADMIN, policy)
            .await
            .unwrap();
    }

    pub fn serial(&self) -> u64 {
        self.manager
            .get_account(Self::ACCOUNT)
            .unwrap()
            .network_serial
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.db
            .read(|tx| tx.get_account_events(LockingStrength::Share, Self::ACCOUNT))
            .unwrap()
    }
}
