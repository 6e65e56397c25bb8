//! Activity sink
//!
//! Receives events only after the mutation that produced them has committed.

use meshplane_common::{ActivityEvent, Database};
use tracing::{debug, warn};

/// Destination for committed activity events
pub trait ActivitySink: Send + Sync {
    fn store_event(&self, event: ActivityEvent);
}

/// Persists events to the `events` table of the entity store.
///
/// A failed write is logged; the mutation it belongs to has already committed.
pub struct StoreActivitySink {
    db: Database,
}

impl StoreActivitySink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl ActivitySink for StoreActivitySink {
    fn store_event(&self, event: ActivityEvent) {
        let code = event.activity.code();
        match self.db.execute_in_transaction(|tx| tx.save_event(&event)) {
            Ok(()) => debug!(
                "Stored event {} on {} for account {}",
                code, event.target_id, event.account_id
            ),
            Err(e) => warn!(
                "Failed to store event {} for account {}: {}",
                code, event.account_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{Account, Activity, LockingStrength};

    #[test]
    fn test_events_persisted_in_order() {
        let db = Database::open_memory().unwrap();
        db.execute_in_transaction(|tx| {
            tx.save_account(
                LockingStrength::Update,
                &Account::new("acc".into(), "owner".into(), "example.com".into()),
            )
        })
        .unwrap();

        let sink = StoreActivitySink::new(db.clone());
        sink.store_event(ActivityEvent::new(
            "owner",
            "g1",
            "acc",
            Activity::GroupCreated { name: "eng".into() },
        ));
        sink.store_event(ActivityEvent::new(
            "owner",
            "g1",
            "acc",
            Activity::GroupDeleted { name: "eng".into() },
        ));

        let events = db
            .read(|tx| tx.get_account_events(LockingStrength::Share, "acc"))
            .unwrap();
        let codes: Vec<_> = events.iter().map(|e| e.activity.code()).collect();
        assert_eq!(codes, vec!["group.add", "group.delete"]);
    }
}
