//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wgledger_common::LedgerConfig;

/// Daemon configuration: the shared ledger settings plus a `[daemon]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub ledger: LedgerConfig,

    pub daemon: DaemonSettings,
}

/// Loop timing and expiry enforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Seconds between traffic counter syncs
    pub sync_interval_secs: u64,

    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,

    /// Mark overdue accounts expired on each sweep
    pub enforce_expiry: bool,

    /// Also revoke expired accounts through `delete`
    pub revoke_expired: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            sweep_interval_secs: 3600,
            enforce_expiry: false,
            revoke_expired: false,
        }
    }
}

impl DaemonSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.ledger.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
