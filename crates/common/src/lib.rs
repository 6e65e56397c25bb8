//! meshplane Common Library
//!
//! Domain types, error taxonomy, activity records and the entity store shared
//! by the management service.

pub mod activity;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use activity::{Activity, ActivityEvent};
pub use db::{Database, LockingStrength, Store};
pub use error::{Error, ErrorKind, Result};
pub use types::*;

/// meshplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshplane")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("store.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
