//! Per-account write locks.
//!
//! One async mutex per account ID, created on first use and kept for the life
//! of the process. Mutations on different accounts never contend.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Registry of account locks
#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an account.
    ///
    /// Dropping the returned future before it resolves leaves the lock untouched.
    pub async fn acquire(&self, account_id: &str) -> AccountGuard {
        let start = Instant::now();

        // Clone the handle out so the map shard is not held across the await
        let lock = self
            .locks
            .entry(account_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;

        debug!(
            "Acquired write lock for account {} in {:?}",
            account_id,
            start.elapsed()
        );

        AccountGuard {
            account_id: account_id.to_string(),
            _guard: guard,
        }
    }

    /// Take the account's lock only if nobody holds it
    pub fn try_acquire(&self, account_id: &str) -> Option<AccountGuard> {
        let lock = self
            .locks
            .entry(account_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(AccountGuard {
            account_id: account_id.to_string(),
            _guard: guard,
        })
    }

    /// Number of accounts that have been locked at least once
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Proof of exclusive access to one account; released on drop
pub struct AccountGuard {
    account_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl std::fmt::Debug for AccountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountGuard")
            .field("account_id", &self.account_id)
            .finish()
    }
}
