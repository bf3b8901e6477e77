//! Command context: loaded configuration and the lifecycle coordinator

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use wgledger_common::{LedgerConfig, LifecycleCoordinator};

/// Everything a command needs, built once per invocation
pub struct Context {
    pub config_path: PathBuf,
    pub coordinator: LifecycleCoordinator,
}

impl Context {
    pub fn load(config_path: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(wgledger_common::default_config_path);
        let mut config = LedgerConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        if let Some(dir) = data_dir {
            config.data_dir = dir.to_path_buf();
        }
        debug!("Using config {:?} (data dir {:?})", config_path, config.data_dir);

        let coordinator = LifecycleCoordinator::from_config(config)?;
        Ok(Self {
            config_path,
            coordinator,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        self.coordinator.config()
    }
}
