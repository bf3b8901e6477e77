//! WgLedger Common Library
//!
//! Peer provisioning, account ledger and traffic accounting for a
//! WireGuard server, shared by the `wgledger` CLI and the `wgledgerd`
//! daemon.

pub mod allocator;
pub mod client_config;
pub mod config;
pub mod error;
pub mod keygen;
pub mod ledger;
pub mod lifecycle;
pub mod lock;
pub mod runtime;
pub mod server_conf;
pub mod stats;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use allocator::IpAllocator;
pub use client_config::ClientConfig;
pub use config::{LedgerConfig, ServerParams};
pub use error::{Error, LifecycleStep, Result};
pub use keygen::{KeyGenerator, X25519KeyGenerator};
pub use ledger::UserLedger;
pub use lifecycle::{Inconsistency, LifecycleCoordinator, NewUser, Provisioned};
pub use runtime::{RuntimeControl, WgCommand};
pub use server_conf::ConfigBlockEditor;
pub use stats::{StatsReconciler, SyncReport, TrafficStore};
pub use types::*;

/// WgLedger version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default data directory
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgledger")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_data_dir().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
