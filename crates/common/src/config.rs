//! Ledger configuration
//!
//! Built once per process and handed to every component constructor.

use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Top-level configuration shared by the CLI and the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Tunnel daemon server configuration (peer blocks live here)
    pub server_config: PathBuf,

    /// Installer params file (server public key, endpoint, DNS)
    pub params_file: PathBuf,

    /// Directory holding the ledger, archive, traffic and lock files
    pub data_dir: PathBuf,

    /// Where rendered client configs are written
    pub client_dir: Option<PathBuf>,

    pub network: NetworkConfig,

    pub runtime: RuntimeConfig,

    pub accounts: AccountConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            server_config: PathBuf::from("/etc/wireguard/wg0.conf"),
            params_file: PathBuf::from("/etc/wireguard/params"),
            data_dir: crate::default_data_dir(),
            client_dir: None,
            network: NetworkConfig::default(),
            runtime: RuntimeConfig::default(),
            accounts: AccountConfig::default(),
        }
    }
}

/// Tunnel subnet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Subnet peers are leased from
    pub subnet: Ipv4Network,

    /// Server-side address, never leased. Defaults to the first host.
    pub gateway: Option<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: Ipv4Network::new(Ipv4Addr::new(10, 66, 66, 0), 24)
                .expect("static subnet is valid"),
            gateway: None,
        }
    }
}

impl NetworkConfig {
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(self.subnet.network()).wrapping_add(1)))
    }
}

/// Runtime control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tunnel interface name
    pub interface: String,

    /// Path to the `wg` tool
    pub wg_binary: String,

    /// Path to the `wg-quick` tool
    pub wg_quick_binary: String,

    /// Add new peers to the live interface as the last step of `create`
    pub apply_on_create: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            wg_binary: "wg".to_string(),
            wg_quick_binary: "wg-quick".to_string(),
            apply_on_create: true,
        }
    }
}

/// Upper bound on `accounts.default_trial_days` (about a century)
pub const MAX_TRIAL_DAYS: i64 = 36_500;

/// Account defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub default_trial_days: i64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            default_trial_days: 30,
        }
    }
}

impl LedgerConfig {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.subnet.prefix() > 30 {
            return Err(Error::InvalidConfig(format!(
                "subnet {} has no usable host addresses",
                self.network.subnet
            )));
        }
        if !self.network.subnet.contains(self.network.gateway()) {
            return Err(Error::InvalidConfig(format!(
                "gateway {} is outside {}",
                self.network.gateway(),
                self.network.subnet
            )));
        }
        if !(1..=MAX_TRIAL_DAYS).contains(&self.accounts.default_trial_days) {
            return Err(Error::InvalidConfig(format!(
                "accounts.default_trial_days must be between 1 and {}, got {}",
                MAX_TRIAL_DAYS, self.accounts.default_trial_days
            )));
        }
        Ok(())
    }

    /// Active user ledger
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("user_records.json")
    }

    /// Archive of removed users
    pub fn archive_path(&self) -> PathBuf {
        self.data_dir.join("stale_user_records.json")
    }

    /// Cumulative traffic counters
    pub fn traffic_path(&self) -> PathBuf {
        self.data_dir.join("traffic.json")
    }

    /// Advisory lock serialising writers
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(".wgledger.lock")
    }

    pub fn client_dir(&self) -> PathBuf {
        self.client_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wg_configs"))
    }
}

/// Values from the installer's `KEY=VALUE` params file
#[derive(Debug, Clone, Default)]
pub struct ServerParams {
    values: HashMap<String, String>,
}

impl ServerParams {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("params file", path.display().to_string()),
            _ => Error::Io(e),
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| {
                (
                    k.trim().to_string(),
                    v.trim().trim_matches('"').trim_matches('\'').to_string(),
                )
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::InvalidConfig(format!("params file is missing {}", key)))
    }

    pub fn server_public_key(&self) -> Result<&str> {
        self.require("SERVER_PUB_KEY")
    }

    pub fn endpoint(&self) -> Result<String> {
        Ok(format!(
            "{}:{}",
            self.require("SERVER_PUB_IP")?,
            self.require("SERVER_PORT")?
        ))
    }

    pub fn dns_servers(&self) -> Option<String> {
        let dns: Vec<&str> = ["CLIENT_DNS_1", "CLIENT_DNS_2"]
            .iter()
            .filter_map(|k| self.get(k))
            .filter(|v| !v.is_empty())
            .collect();
        if dns.is_empty() {
            None
        } else {
            Some(dns.join(","))
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.get("SERVER_WG_NIC")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.network.subnet.to_string(), "10.66.66.0/24");
        assert_eq!(config.network.gateway(), Ipv4Addr::new(10, 66, 66, 1));
        assert_eq!(config.runtime.interface, "wg0");
        assert_eq!(config.accounts.default_trial_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: LedgerConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/wgledger"

            [network]
            subnet = "10.8.0.0/24"
            "#,
        )
        .unwrap();
        assert_eq!(config.records_path(), PathBuf::from("/var/lib/wgledger/user_records.json"));
        assert_eq!(config.network.gateway(), Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(config.runtime.wg_binary, "wg");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wgledger.toml");
        let mut config = LedgerConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.accounts.default_trial_days = 7;
        config.save(&path).unwrap();

        let loaded = LedgerConfig::load(&path).unwrap();
        assert_eq!(loaded.accounts.default_trial_days, 7);
        assert_eq!(loaded.data_dir, dir.path());
    }

    #[test]
    fn test_trial_days_bounds() {
        let mut config = LedgerConfig::default();
        config.accounts.default_trial_days = MAX_TRIAL_DAYS;
        assert!(config.validate().is_ok());

        for days in [0, -1, MAX_TRIAL_DAYS + 1, i64::MAX] {
            config.accounts.default_trial_days = days;
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_rejects_gateway_outside_subnet() {
        let mut config = LedgerConfig::default();
        config.network.gateway = Some(Ipv4Addr::new(192, 168, 1, 1));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_server_params() {
        let params = ServerParams::parse(
            "SERVER_PUB_IP=203.0.113.7\nSERVER_PORT=51820\nSERVER_PUB_KEY=abc=\n\
             CLIENT_DNS_1=1.1.1.1\nCLIENT_DNS_2=8.8.8.8\nSERVER_WG_NIC=wg0\n",
        );
        assert_eq!(params.endpoint().unwrap(), "203.0.113.7:51820");
        // Only the first '=' splits key from value
        assert_eq!(params.server_public_key().unwrap(), "abc=");
        assert_eq!(params.dns_servers().as_deref(), Some("1.1.1.1,8.8.8.8"));
        assert_eq!(params.interface(), Some("wg0"));
    }
}
