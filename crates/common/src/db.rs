//! SQLite entity store for meshplane
//!
//! Entities are stored as JSON documents keyed by `(account_id, id)`. All
//! access goes through a transaction: [`Database::execute_in_transaction`]
//! opens an immediate (write) transaction, [`Database::read`] a deferred one.

use crate::activity::ActivityEvent;
use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Read intent passed to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrength {
    /// Shared read; concurrent readers allowed
    Share,
    /// Read with intent to write; only valid inside a write transaction
    Update,
}

/// Entity store contract used by the account manager.
///
/// Every method observes the isolation of the transaction it was handed in.
pub trait Store {
    // Accounts
    fn account_exists(&self, strength: LockingStrength, account_id: &str) -> Result<bool>;
    fn get_account(&self, strength: LockingStrength, account_id: &str) -> Result<Account>;
    fn save_account(&self, strength: LockingStrength, account: &Account) -> Result<()>;
    fn get_account_settings(&self, strength: LockingStrength, account_id: &str) -> Result<Settings>;
    fn save_account_settings(&self, strength: LockingStrength, account_id: &str, settings: &Settings) -> Result<()>;
    fn get_account_dns_settings(&self, strength: LockingStrength, account_id: &str) -> Result<DnsSettings>;
    fn save_dns_settings(&self, strength: LockingStrength, account_id: &str, settings: &DnsSettings) -> Result<()>;
    fn increment_network_serial(&self, strength: LockingStrength, account_id: &str) -> Result<()>;

    // Users
    fn get_user_by_user_id(&self, strength: LockingStrength, user_id: &str) -> Result<User>;
    fn get_account_users(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<User>>;
    fn save_user(&self, strength: LockingStrength, user: &User) -> Result<()>;

    // Peers
    fn get_peer_by_id(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<Peer>;
    fn get_peers_by_ids(
        &self,
        strength: LockingStrength,
        account_id: &str,
        peer_ids: &[String],
    ) -> Result<HashMap<String, Peer>>;
    fn get_account_peers(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Peer>>;
    fn save_peer(&self, strength: LockingStrength, peer: &Peer) -> Result<()>;
    fn delete_peer(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<()>;

    // Groups
    fn get_group_by_id(&self, strength: LockingStrength, account_id: &str, group_id: &str) -> Result<Group>;
    fn get_group_by_name(&self, strength: LockingStrength, account_id: &str, name: &str) -> Result<Group>;
    fn get_account_groups(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Group>>;
    fn get_peer_groups(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<Vec<Group>>;
    fn save_group(&self, strength: LockingStrength, group: &Group) -> Result<()>;
    fn save_groups(&self, strength: LockingStrength, groups: &[Group]) -> Result<()>;
    fn delete_groups(&self, strength: LockingStrength, account_id: &str, group_ids: &[String]) -> Result<()>;

    // Policies
    fn get_policy_by_id(&self, strength: LockingStrength, account_id: &str, policy_id: &str) -> Result<Policy>;
    fn get_account_policies(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Policy>>;
    fn save_policy(&self, strength: LockingStrength, policy: &Policy) -> Result<()>;
    fn delete_policy(&self, strength: LockingStrength, account_id: &str, policy_id: &str) -> Result<()>;

    // Routes
    fn get_route_by_id(&self, strength: LockingStrength, account_id: &str, route_id: &str) -> Result<Route>;
    fn get_account_routes(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Route>>;
    fn save_route(&self, strength: LockingStrength, route: &Route) -> Result<()>;
    fn delete_route(&self, strength: LockingStrength, account_id: &str, route_id: &str) -> Result<()>;

    // Name server groups
    fn get_name_server_group_by_id(
        &self,
        strength: LockingStrength,
        account_id: &str,
        ns_group_id: &str,
    ) -> Result<NameServerGroup>;
    fn get_account_name_server_groups(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<NameServerGroup>>;
    fn save_name_server_group(&self, strength: LockingStrength, ns_group: &NameServerGroup) -> Result<()>;
    fn delete_name_server_group(&self, strength: LockingStrength, account_id: &str, ns_group_id: &str) -> Result<()>;

    // Setup keys
    fn get_setup_key_by_id(&self, strength: LockingStrength, account_id: &str, key_id: &str) -> Result<SetupKey>;
    fn get_account_setup_keys(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<SetupKey>>;
    fn save_setup_key(&self, strength: LockingStrength, key: &SetupKey) -> Result<()>;

    // Activity
    fn save_event(&self, event: &ActivityEvent) -> Result<()>;
    fn get_account_events(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<ActivityEvent>>;
}

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(busy_timeout)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Accounts; the serial lives in its own column so it can be bumped atomically
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                network_serial INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_account ON users(account_id);

            CREATE TABLE IF NOT EXISTS peers (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE TABLE IF NOT EXISTS access_groups (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_groups_name ON access_groups(account_id, name);

            CREATE TABLE IF NOT EXISTS policies (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE TABLE IF NOT EXISTS routes (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE TABLE IF NOT EXISTS name_server_groups (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE TABLE IF NOT EXISTS setup_keys (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            -- Activity log, append only
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_account ON events(account_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside a write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn execute_in_transaction<T>(&self, f: impl FnOnce(&dyn Store) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Immediate, true, f)
    }

    /// Run `f` inside a read-only transaction
    pub fn read<T>(&self, f: impl FnOnce(&dyn Store) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Deferred, false, f)
    }

    fn run<T>(
        &self,
        behavior: TransactionBehavior,
        writable: bool,
        f: impl FnOnce(&dyn Store) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(behavior)?;

        let value = {
            let store = StoreTx { conn: &tx, writable };
            f(&store)?
        };

        tx.commit()?;
        Ok(value)
    }
}

/// Store view over an open transaction
struct StoreTx<'a> {
    conn: &'a Connection,
    writable: bool,
}

impl StoreTx<'_> {
    fn check_strength(&self, strength: LockingStrength) -> Result<()> {
        if strength == LockingStrength::Update && !self.writable {
            return Err(Error::Internal(
                "update locking strength requires a write transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_strength(LockingStrength::Update)
    }

    // ========================================================================
    // Generic entity operations
    // ========================================================================

    fn find_entity<T: DeserializeOwned>(&self, table: &str, account_id: &str, id: &str) -> Result<Option<T>> {
        let data: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT data FROM {} WHERE account_id = ?1 AND id = ?2", table),
                params![account_id, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn get_entity<T: DeserializeOwned>(&self, table: &str, kind: &str, account_id: &str, id: &str) -> Result<T> {
        self.find_entity(table, account_id, id)?
            .ok_or_else(|| Error::not_found(kind, id))
    }

    fn query_entities<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(serde_json::from_str(&row?)?);
        }
        Ok(results)
    }

    /// List an account's entities in insertion order
    fn list_entities<T: DeserializeOwned>(&self, table: &str, account_id: &str) -> Result<Vec<T>> {
        self.query_entities(
            &format!("SELECT data FROM {} WHERE account_id = ?1 ORDER BY rowid", table),
            params![account_id],
        )
    }

    fn upsert_entity<T: Serialize>(&self, table: &str, account_id: &str, id: &str, name: &str, entity: &T) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (account_id, id, name, data) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, id) DO UPDATE SET name = excluded.name, data = excluded.data",
                table
            ),
            params![account_id, id, name, serde_json::to_string(entity)?],
        )?;

        debug!("Saved {} {} in account {}", table, id, account_id);
        Ok(())
    }

    fn delete_entity(&self, table: &str, kind: &str, account_id: &str, id: &str) -> Result<()> {
        let rows = self.conn.execute(
            &format!("DELETE FROM {} WHERE account_id = ?1 AND id = ?2", table),
            params![account_id, id],
        )?;

        if rows == 0 {
            return Err(Error::not_found(kind, id));
        }

        debug!("Deleted {} {} in account {}", table, id, account_id);
        Ok(())
    }
}

impl Store for StoreTx<'_> {
    // ========================================================================
    // Accounts
    // ========================================================================

    fn account_exists(&self, strength: LockingStrength, account_id: &str) -> Result<bool> {
        self.check_strength(strength)?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_account(&self, strength: LockingStrength, account_id: &str) -> Result<Account> {
        self.check_strength(strength)?;
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT data, network_serial FROM accounts WHERE id = ?1",
                params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (data, serial) = row.ok_or_else(|| Error::not_found("account", account_id))?;
        let mut account: Account = serde_json::from_str(&data)?;
        account.network_serial = serial as u64;
        Ok(account)
    }

    /// Insert or update the account document. The serial is only written on
    /// insert; afterwards it moves exclusively through `increment_network_serial`.
    fn save_account(&self, strength: LockingStrength, account: &Account) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.conn.execute(
            "INSERT INTO accounts (id, network_serial, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![
                account.id,
                account.network_serial as i64,
                serde_json::to_string(account)?
            ],
        )?;
        Ok(())
    }

    fn get_account_settings(&self, strength: LockingStrength, account_id: &str) -> Result<Settings> {
        Ok(self.get_account(strength, account_id)?.settings)
    }

    fn save_account_settings(&self, strength: LockingStrength, account_id: &str, settings: &Settings) -> Result<()> {
        let mut account = self.get_account(strength, account_id)?;
        account.settings = settings.clone();
        self.save_account(strength, &account)
    }

    fn get_account_dns_settings(&self, strength: LockingStrength, account_id: &str) -> Result<DnsSettings> {
        Ok(self.get_account(strength, account_id)?.dns_settings)
    }

    fn save_dns_settings(&self, strength: LockingStrength, account_id: &str, settings: &DnsSettings) -> Result<()> {
        let mut account = self.get_account(strength, account_id)?;
        account.dns_settings = settings.clone();
        self.save_account(strength, &account)
    }

    fn increment_network_serial(&self, strength: LockingStrength, account_id: &str) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        let rows = self.conn.execute(
            "UPDATE accounts SET network_serial = network_serial + 1 WHERE id = ?1",
            params![account_id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("account", account_id));
        }
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    fn get_user_by_user_id(&self, strength: LockingStrength, user_id: &str) -> Result<User> {
        self.check_strength(strength)?;
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM users WHERE id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(Error::not_found("user", user_id)),
        }
    }

    fn get_account_users(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<User>> {
        self.check_strength(strength)?;
        self.list_entities("users", account_id)
    }

    fn save_user(&self, strength: LockingStrength, user: &User) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.conn.execute(
            "INSERT INTO users (id, account_id, name, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET account_id = excluded.account_id, data = excluded.data",
            params![user.id, user.account_id, user.id, serde_json::to_string(user)?],
        )?;
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    fn get_peer_by_id(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<Peer> {
        self.check_strength(strength)?;
        self.get_entity("peers", "peer", account_id, peer_id)
    }

    fn get_peers_by_ids(
        &self,
        strength: LockingStrength,
        account_id: &str,
        peer_ids: &[String],
    ) -> Result<HashMap<String, Peer>> {
        self.check_strength(strength)?;
        let mut peers = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            if let Some(peer) = self.find_entity::<Peer>("peers", account_id, peer_id)? {
                peers.insert(peer.id.clone(), peer);
            }
        }
        Ok(peers)
    }

    fn get_account_peers(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Peer>> {
        self.check_strength(strength)?;
        self.list_entities("peers", account_id)
    }

    fn save_peer(&self, strength: LockingStrength, peer: &Peer) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity("peers", &peer.account_id, &peer.id, &peer.name, peer)
    }

    fn delete_peer(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.delete_entity("peers", "peer", account_id, peer_id)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    fn get_group_by_id(&self, strength: LockingStrength, account_id: &str, group_id: &str) -> Result<Group> {
        self.check_strength(strength)?;
        self.get_entity("access_groups", "group", account_id, group_id)
    }

    /// Several groups may share a name (IdP-issued ones are not deduplicated);
    /// the one with the most peers wins.
    fn get_group_by_name(&self, strength: LockingStrength, account_id: &str, name: &str) -> Result<Group> {
        self.check_strength(strength)?;
        let groups: Vec<Group> = self.query_entities(
            "SELECT data FROM access_groups WHERE account_id = ?1 AND name = ?2 ORDER BY rowid",
            params![account_id, name],
        )?;

        groups
            .into_iter()
            .fold(None, |best: Option<Group>, group| match best {
                Some(b) if b.peers.len() >= group.peers.len() => Some(b),
                _ => Some(group),
            })
            .ok_or_else(|| Error::not_found("group", name))
    }

    fn get_account_groups(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Group>> {
        self.check_strength(strength)?;
        self.list_entities("access_groups", account_id)
    }

    fn get_peer_groups(&self, strength: LockingStrength, account_id: &str, peer_id: &str) -> Result<Vec<Group>> {
        Ok(self
            .get_account_groups(strength, account_id)?
            .into_iter()
            .filter(|g| g.contains(peer_id))
            .collect())
    }

    fn save_group(&self, strength: LockingStrength, group: &Group) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity("access_groups", &group.account_id, &group.id, &group.name, group)
    }

    fn save_groups(&self, strength: LockingStrength, groups: &[Group]) -> Result<()> {
        for group in groups {
            self.save_group(strength, group)?;
        }
        Ok(())
    }

    fn delete_groups(&self, strength: LockingStrength, account_id: &str, group_ids: &[String]) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        for group_id in group_ids {
            self.delete_entity("access_groups", "group", account_id, group_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Policies
    // ========================================================================

    fn get_policy_by_id(&self, strength: LockingStrength, account_id: &str, policy_id: &str) -> Result<Policy> {
        self.check_strength(strength)?;
        self.get_entity("policies", "policy", account_id, policy_id)
    }

    fn get_account_policies(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Policy>> {
        self.check_strength(strength)?;
        self.list_entities("policies", account_id)
    }

    fn save_policy(&self, strength: LockingStrength, policy: &Policy) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity("policies", &policy.account_id, &policy.id, &policy.name, policy)
    }

    fn delete_policy(&self, strength: LockingStrength, account_id: &str, policy_id: &str) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.delete_entity("policies", "policy", account_id, policy_id)
    }

    // ========================================================================
    // Routes
    // ========================================================================

    fn get_route_by_id(&self, strength: LockingStrength, account_id: &str, route_id: &str) -> Result<Route> {
        self.check_strength(strength)?;
        self.get_entity("routes", "route", account_id, route_id)
    }

    fn get_account_routes(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<Route>> {
        self.check_strength(strength)?;
        self.list_entities("routes", account_id)
    }

    fn save_route(&self, strength: LockingStrength, route: &Route) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity("routes", &route.account_id, &route.id, &route.net_id, route)
    }

    fn delete_route(&self, strength: LockingStrength, account_id: &str, route_id: &str) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.delete_entity("routes", "route", account_id, route_id)
    }

    // ========================================================================
    // Name server groups
    // ========================================================================

    fn get_name_server_group_by_id(
        &self,
        strength: LockingStrength,
        account_id: &str,
        ns_group_id: &str,
    ) -> Result<NameServerGroup> {
        self.check_strength(strength)?;
        self.get_entity("name_server_groups", "name server group", account_id, ns_group_id)
    }

    fn get_account_name_server_groups(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<NameServerGroup>> {
        self.check_strength(strength)?;
        self.list_entities("name_server_groups", account_id)
    }

    fn save_name_server_group(&self, strength: LockingStrength, ns_group: &NameServerGroup) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity(
            "name_server_groups",
            &ns_group.account_id,
            &ns_group.id,
            &ns_group.name,
            ns_group,
        )
    }

    fn delete_name_server_group(&self, strength: LockingStrength, account_id: &str, ns_group_id: &str) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.delete_entity("name_server_groups", "name server group", account_id, ns_group_id)
    }

    // ========================================================================
    // Setup keys
    // ========================================================================

    fn get_setup_key_by_id(&self, strength: LockingStrength, account_id: &str, key_id: &str) -> Result<SetupKey> {
        self.check_strength(strength)?;
        self.get_entity("setup_keys", "setup key", account_id, key_id)
    }

    fn get_account_setup_keys(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<SetupKey>> {
        self.check_strength(strength)?;
        self.list_entities("setup_keys", account_id)
    }

    fn save_setup_key(&self, strength: LockingStrength, key: &SetupKey) -> Result<()> {
        self.check_strength(strength)?;
        self.check_writable()?;
        self.upsert_entity("setup_keys", &key.account_id, &key.id, &key.name, key)
    }

    // ========================================================================
    // Activity
    // ========================================================================

    fn save_event(&self, event: &ActivityEvent) -> Result<()> {
        self.check_writable()?;
        self.conn.execute(
            "INSERT INTO events (account_id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![
                event.account_id,
                event.timestamp.to_rfc3339(),
                serde_json::to_string(event)?
            ],
        )?;
        Ok(())
    }

    fn get_account_events(&self, strength: LockingStrength, account_id: &str) -> Result<Vec<ActivityEvent>> {
        self.check_strength(strength)?;
        self.query_entities(
            "SELECT data FROM events WHERE account_id = ?1 ORDER BY seq",
            params![account_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use crate::ErrorKind;
    use std::net::Ipv4Addr;

    fn seeded_db() -> Database {
        let db = Database::open_memory().unwrap();
        db.execute_in_transaction(|tx| {
            tx.save_account(
                LockingStrength::Update,
                &Account::new("acc".into(), "owner".into(), "example.com".into()),
            )
        })
        .unwrap();
        db
    }

    #[test]
    fn test_group_crud() {
        let db = seeded_db();

        let mut group = Group::new("eng", GroupIssued::Api, vec!["p1".into()]);
        group.id = "g1".into();
        group.account_id = "acc".into();

        db.execute_in_transaction(|tx| tx.save_group(LockingStrength::Update, &group))
            .unwrap();

        let fetched = db
            .read(|tx| tx.get_group_by_id(LockingStrength::Share, "acc", "g1"))
            .unwrap();
        assert_eq!(fetched, group);

        // Same ID in another account is a different row
        let err = db
            .read(|tx| tx.get_group_by_id(LockingStrength::Share, "other", "g1"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        db.execute_in_transaction(|tx| {
            tx.delete_groups(LockingStrength::Update, "acc", &["g1".to_string()])
        })
        .unwrap();
        let groups = db
            .read(|tx| tx.get_account_groups(LockingStrength::Share, "acc"))
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_group_by_name_prefers_most_peers() {
        let db = seeded_db();
        db.execute_in_transaction(|tx| {
            for (id, peers) in [("g1", vec!["p1"]), ("g2", vec!["p1", "p2"]), ("g3", vec![])] {
                let mut group = Group::new(
                    "dup",
                    GroupIssued::Jwt,
                    peers.into_iter().map(String::from).collect(),
                );
                group.id = id.into();
                group.account_id = "acc".into();
                tx.save_group(LockingStrength::Update, &group)?;
            }
            Ok(())
        })
        .unwrap();

        let group = db
            .read(|tx| tx.get_group_by_name(LockingStrength::Share, "acc", "dup"))
            .unwrap();
        assert_eq!(group.id, "g2");
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = seeded_db();

        let result: Result<()> = db.execute_in_transaction(|tx| {
            tx.increment_network_serial(LockingStrength::Update, "acc")?;
            Err(Error::InvalidArgument("abort".into()))
        });
        assert!(result.is_err());

        let account = db
            .read(|tx| tx.get_account(LockingStrength::Share, "acc"))
            .unwrap();
        assert_eq!(account.network_serial, 0);
    }

    #[test]
    fn test_serial_survives_account_save() {
        let db = seeded_db();
        db.execute_in_transaction(|tx| {
            tx.increment_network_serial(LockingStrength::Update, "acc")?;
            tx.increment_network_serial(LockingStrength::Update, "acc")?;
            let mut account = tx.get_account(LockingStrength::Update, "acc")?;
            account.network_serial = 0;
            account.dns_settings.disabled_management_groups = vec!["g1".into()];
            tx.save_account(LockingStrength::Update, &account)
        })
        .unwrap();

        let account = db
            .read(|tx| tx.get_account(LockingStrength::Share, "acc"))
            .unwrap();
        assert_eq!(account.network_serial, 2);
        assert_eq!(account.dns_settings.disabled_management_groups, vec!["g1"]);
    }

    #[test]
    fn test_read_transaction_rejects_writes() {
        let db = seeded_db();
        let err = db
            .read(|tx| tx.increment_network_serial(LockingStrength::Update, "acc"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = db
            .read(|tx| tx.get_account(LockingStrength::Update, "acc"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_peers_by_ids_skips_missing() {
        let db = seeded_db();
        let mut peer = Peer::new("laptop", "key", Ipv4Addr::new(100, 64, 0, 1));
        peer.account_id = "acc".into();
        let peer_id = peer.id.clone();
        db.execute_in_transaction(|tx| tx.save_peer(LockingStrength::Update, &peer))
            .unwrap();

        let peers = db
            .read(|tx| {
                tx.get_peers_by_ids(
                    LockingStrength::Share,
                    "acc",
                    &[peer_id.clone(), "missing".to_string()],
                )
            })
            .unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains_key(&peer_id));
    }

    #[test]
    fn test_events_in_order() {
        let db = seeded_db();
        db.execute_in_transaction(|tx| {
            tx.save_event(&ActivityEvent::new(
                "u1",
                "g1",
                "acc",
                Activity::GroupCreated { name: "eng".into() },
            ))?;
            tx.save_event(&ActivityEvent::new(
                "u1",
                "g1",
                "acc",
                Activity::GroupDeleted { name: "eng".into() },
            ))
        })
        .unwrap();

        let events = db
            .read(|tx| tx.get_account_events(LockingStrength::Share, "acc"))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].activity.code(), "group.add");
        assert_eq!(events[1].activity.code(), "group.delete");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = Database::open(&path, Duration::from_secs(1)).unwrap();
            db.execute_in_transaction(|tx| {
                tx.save_account(
                    LockingStrength::Update,
                    &Account::new("acc".into(), "owner".into(), String::new()),
                )
            })
            .unwrap();
        }

        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        assert!(db
            .read(|tx| tx.account_exists(LockingStrength::Share, "acc"))
            .unwrap());
    }
}
