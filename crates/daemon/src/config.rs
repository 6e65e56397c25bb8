//! Management service configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Management service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// DNS domain appended to peer labels
    pub dns_domain: String,

    /// Entity store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Network map propagation configuration
    #[serde(default)]
    pub propagation: PropagationConfig,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            store_path: meshplane_common::default_store_path(),
            dns_domain: "meshplane.cloud".to_string(),
            store: StoreConfig::default(),
            propagation: PropagationConfig::default(),
        }
    }
}

/// Entity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a transaction waits on a locked database before failing
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

/// Network map propagation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Pending network maps buffered per connected peer
    pub peer_channel_capacity: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            peer_channel_capacity: 100,
        }
    }
}

impl ManagementConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("store.db")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }
}
