//! Peer lifecycle coordinator
//!
//! Per-username state machine:
//!
//! ```text
//! Provisioning -> Active <-> Expired
//!                   |          |
//!                   +----------+--> Removed (archived)
//! ```
//!
//! `create` and `delete` run a fixed sequence of steps across the server
//! config, the ledger and the live daemon. Nothing is rolled back: when a
//! step fails after earlier ones committed, the error is
//! `Error::Incomplete` naming the failed step and the committed ones so an
//! operator can reconcile by hand.
//!
//! All mutations take an in-process mutex and an exclusive file lock, so
//! concurrent callers (CLI invocations, the daemon) never interleave their
//! read-modify-write cycles on the shared files.

use crate::allocator::IpAllocator;
use crate::config::LedgerConfig;
use crate::error::LifecycleStep;
use crate::keygen::{KeyGenerator, X25519KeyGenerator};
use crate::ledger::UserLedger;
use crate::lock::StoreLock;
use crate::runtime::{RuntimeControl, WgCommand};
use crate::server_conf::ConfigBlockEditor;
use crate::stats::{StatsReconciler, SyncReport, TrafficStore};
use crate::types::{
    validate_username, ArchiveRecord, ConnectionStatus, ExpiryState, ListFilter, PeerIdentity,
    PeerKeys, UserRecord, UserStatus,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Optional contact details captured at creation
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: Option<String>,
    pub contact_id: Option<String>,
}

/// Result of a successful `create`. `keys.private_key` is not stored
/// anywhere; hand it to the owner now or lose it.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub record: UserRecord,
    pub keys: PeerKeys,
}

/// Tracks which steps of a multi-step operation have committed
struct StepLog {
    operation: &'static str,
    username: String,
    completed: Vec<LifecycleStep>,
}

impl StepLog {
    fn new(operation: &'static str, username: &str) -> Self {
        Self {
            operation,
            username: username.to_string(),
            completed: Vec::new(),
        }
    }

    /// Run one step. Failures before anything committed pass through
    /// unchanged; later ones are wrapped with the committed steps.
    fn step<T>(&mut self, step: LifecycleStep, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match f() {
            Ok(value) => {
                debug!("{} {}: {} done", self.operation, self.username, step);
                self.completed.push(step);
                Ok(value)
            }
            Err(e) if self.completed.iter().all(|s| !s.commits()) => Err(e),
            Err(e) => {
                error!(
                    "{} {} failed at {} after {:?}: {}",
                    self.operation, self.username, step, self.completed, e
                );
                Err(Error::Incomplete {
                    operation: self.operation,
                    username: self.username.clone(),
                    failed: step,
                    completed: self.completed.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}

impl LifecycleStep {
    /// Whether the step changes persistent or runtime state
    fn commits(&self) -> bool {
        !matches!(
            self,
            LifecycleStep::AllocateAddress | LifecycleStep::GenerateKeys | LifecycleStep::FindPublicKey
        )
    }
}

/// Top-level coordinator over allocator, config editor, ledger and stats
pub struct LifecycleCoordinator {
    config: LedgerConfig,
    allocator: IpAllocator,
    editor: ConfigBlockEditor,
    ledger: UserLedger,
    reconciler: StatsReconciler,
    runtime: Arc<dyn RuntimeControl>,
    keygen: Arc<dyn KeyGenerator>,
    writer: Mutex<()>,
    file_lock: StoreLock,
}

impl LifecycleCoordinator {
    pub fn new(
        config: LedgerConfig,
        runtime: Arc<dyn RuntimeControl>,
        keygen: Arc<dyn KeyGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            allocator: IpAllocator::new(config.network.subnet, config.network.gateway()),
            editor: ConfigBlockEditor::new(&config.server_config),
            ledger: UserLedger::new(config.records_path(), config.archive_path()),
            reconciler: StatsReconciler::new(TrafficStore::new(config.traffic_path())),
            file_lock: StoreLock::new(config.lock_path()),
            writer: Mutex::new(()),
            runtime,
            keygen,
            config,
        })
    }

    /// Coordinator wired to the `wg` tools and in-process key generation
    pub fn from_config(config: LedgerConfig) -> Result<Self> {
        let runtime = Arc::new(WgCommand::new(&config.runtime));
        Self::new(config, runtime, Arc::new(X25519KeyGenerator))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &UserLedger {
        &self.ledger
    }

    pub fn editor(&self) -> &ConfigBlockEditor {
        &self.editor
    }

    pub fn traffic(&self) -> &TrafficStore {
        self.reconciler.store()
    }

    /// Run `f` as the only writer, in this process and across processes
    fn exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _local = self.writer.lock();
        let _file = self.file_lock.acquire()?;
        f()
    }

    // ========================================================================
    // Create / delete
    // ========================================================================

    /// Provision a new peer for `username`
    pub fn create(&self, username: &str, details: NewUser) -> Result<Provisioned> {
        self.create_at(username, details, Utc::now())
    }

    pub fn create_at(&self, username: &str, details: NewUser, now: DateTime<Utc>) -> Result<Provisioned> {
        validate_username(username)?;
        let expires_at = days_after(now, self.config.accounts.default_trial_days)?;
        self.exclusive(|| {
            let conf = self.editor.load()?;
            if self.ledger.contains(username)? || conf.has_marker(username) {
                return Err(Error::DuplicateUser {
                    username: username.to_string(),
                });
            }

            info!("Creating peer for {}", username);
            let mut log = StepLog::new("create", username);

            let address = log.step(LifecycleStep::AllocateAddress, || {
                let mut reserved = conf.reserved_addresses();
                reserved.extend(self.ledger.leases()?);
                self.allocator.allocate(&reserved)
            })?;

            let keys = log.step(LifecycleStep::GenerateKeys, || {
                let keys = self.keygen.generate()?;
                if let Some(owner) = conf.public_key_map().get(&keys.public_key) {
                    return Err(Error::KeyCollision {
                        username: owner.clone(),
                    });
                }
                Ok(keys)
            })?;

            let identity = PeerIdentity {
                username: username.to_string(),
                public_key: keys.public_key.clone(),
                preshared_key: keys.preshared_key.clone(),
            };
            log.step(LifecycleStep::InsertBlock, || {
                self.editor.insert_block(&identity, address)
            })?;

            let record = UserRecord {
                username: username.to_string(),
                created_at: now,
                expires_at,
                address,
                status: UserStatus::Active,
                email: details.email,
                contact_id: details.contact_id,
                peer_public_key: keys.public_key.clone(),
            };
            log.step(LifecycleStep::CreateRecord, || self.ledger.create(record.clone()))?;

            if self.config.runtime.apply_on_create {
                log.step(LifecycleStep::RuntimeAdd, || {
                    self.runtime
                        .add_peer(&keys.public_key, &keys.preshared_key, address)
                })?;
            }

            info!("Created {} at {} (expires {})", username, address, record.expires_at);
            Ok(Provisioned { record, keys })
        })
    }

    /// Revoke `username`: runtime, config block, then ledger archive
    pub fn delete(&self, username: &str) -> Result<ArchiveRecord> {
        self.delete_at(username, Utc::now())
    }

    pub fn delete_at(&self, username: &str, now: DateTime<Utc>) -> Result<ArchiveRecord> {
        self.exclusive(|| {
            info!("Deleting peer for {}", username);
            let mut log = StepLog::new("delete", username);

            let public_key = log.step(LifecycleStep::FindPublicKey, || {
                self.editor.find_public_key(username)
            })?;
            log.step(LifecycleStep::RuntimeRemove, || {
                self.runtime.remove_peer(&public_key)
            })?;
            log.step(LifecycleStep::RemoveBlock, || {
                self.editor.remove_block(username).map(|_| ())
            })?;
            let archived = log.step(LifecycleStep::ArchiveRecord, || {
                self.ledger.archive(username, now)
            })?;

            info!("Deleted {} (address {} released)", username, archived.record.address);
            Ok(archived)
        })
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Push expiry out by `days` from the later of now and the current expiry
    pub fn extend(&self, username: &str, days: i64) -> Result<UserRecord> {
        self.extend_at(username, days, Utc::now())
    }

    pub fn extend_at(&self, username: &str, days: i64, now: DateTime<Utc>) -> Result<UserRecord> {
        if days <= 0 {
            return Err(Error::InvalidConfig(format!(
                "extension must be a positive number of days, got {}",
                days
            )));
        }
        self.exclusive(|| {
            let current = self.ledger.get(username)?;
            let expires_at = days_after(current.expires_at.max(now), days)?;
            let record = self.ledger.update(username, |r| {
                r.expires_at = expires_at;
                reactivate(r, now);
            })?;
            info!("Extended {} by {} days to {}", username, days, record.expires_at);
            Ok(record)
        })
    }

    /// Restart the trial period from now
    pub fn reset_expiry(&self, username: &str) -> Result<UserRecord> {
        self.reset_expiry_at(username, Utc::now())
    }

    pub fn reset_expiry_at(&self, username: &str, now: DateTime<Utc>) -> Result<UserRecord> {
        let expires_at = days_after(now, self.config.accounts.default_trial_days)?;
        self.exclusive(|| {
            let record = self.ledger.update(username, |r| {
                r.expires_at = expires_at;
                reactivate(r, now);
            })?;
            info!("Reset expiry of {} to {}", username, record.expires_at);
            Ok(record)
        })
    }

    /// Mark one account expired. Daemon access is unchanged.
    pub fn expire(&self, username: &str) -> Result<UserRecord> {
        self.exclusive(|| {
            let record = self.ledger.update(username, |r| r.status = UserStatus::Expired)?;
            info!("Marked {} expired", username);
            Ok(record)
        })
    }

    /// Mark every account past its expiry; returns the affected usernames
    pub fn mark_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.exclusive(|| {
            let changed = self.ledger.update_all(|r| {
                if r.status != UserStatus::Expired && r.expires_at <= now {
                    r.status = UserStatus::Expired;
                    true
                } else {
                    false
                }
            })?;
            if !changed.is_empty() {
                info!("Marked {} account(s) expired: {:?}", changed.len(), changed);
            }
            Ok(changed)
        })
    }

    pub fn check_expiry(&self, username: &str, now: DateTime<Utc>) -> Result<ExpiryState> {
        Ok(self.ledger.get(username)?.expiry_state(now))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, username: &str) -> Result<UserRecord> {
        self.ledger.get(username)
    }

    pub fn list(&self, filter: ListFilter) -> Result<Vec<UserRecord>> {
        self.ledger.list(filter)
    }

    pub fn archived(&self, username: Option<&str>) -> Result<Vec<ArchiveRecord>> {
        self.ledger.archived(username)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Pull a runtime snapshot and fold it into the cumulative counters.
    ///
    /// Each account that is not expired takes its connection state from
    /// the sync: `Active` with a handshake, `Inactive` without one.
    pub fn refresh_stats(&self) -> Result<SyncReport> {
        self.exclusive(|| {
            let conf = self.editor.load()?;
            let snapshot = self.runtime.snapshot()?;
            let allowed_ips: HashMap<String, String> = conf
                .blocks()
                .iter()
                .map(|b| (b.username.clone(), b.allowed_ips.clone()))
                .collect();
            let report = self
                .reconciler
                .sync(&snapshot, &conf.public_key_map(), &allowed_ips)?;

            let connected: HashMap<String, ConnectionStatus> = self
                .reconciler
                .store()
                .load()?
                .users
                .into_values()
                .map(|c| (c.username, c.status))
                .collect();
            let changed = self.ledger.update_all(|r| {
                if r.status == UserStatus::Expired {
                    return false;
                }
                let next = match connected.get(&r.username) {
                    Some(ConnectionStatus::Active) => UserStatus::Active,
                    Some(ConnectionStatus::Inactive) => UserStatus::Inactive,
                    None => return false,
                };
                if r.status == next {
                    return false;
                }
                r.status = next;
                true
            })?;
            if !changed.is_empty() {
                debug!("Connection state changed for {:?}", changed);
            }
            Ok(report)
        })
    }

    /// Ask the live daemon to re-read its config
    pub fn reload_runtime(&self) -> Result<()> {
        self.runtime.reload()
    }

    /// Usernames whose three views disagree: config marker without a
    /// ledger record, or a ledger record without a config block
    pub fn audit(&self) -> Result<Vec<Inconsistency>> {
        let conf = self.editor.load()?;
        let records = self.ledger.list(ListFilter {
            include_inactive: true,
        })?;
        let mut found = Vec::new();

        for block in conf.blocks() {
            match records.iter().find(|r| r.username == block.username) {
                None => found.push(Inconsistency::OrphanBlock {
                    username: block.username.clone(),
                }),
                Some(r) if r.peer_public_key != block.public_key => {
                    found.push(Inconsistency::KeyMismatch {
                        username: block.username.clone(),
                    })
                }
                Some(r) if block.address() != Some(r.address) => {
                    found.push(Inconsistency::AddressMismatch {
                        username: block.username.clone(),
                        ledger: r.address,
                        config: block.address(),
                    })
                }
                Some(_) => {}
            }
        }
        for bad in conf.malformed() {
            found.push(Inconsistency::MalformedBlock {
                username: bad.username.clone(),
                line: bad.line,
            });
        }
        for record in &records {
            if !conf.has_marker(&record.username) {
                found.push(Inconsistency::MissingBlock {
                    username: record.username.clone(),
                });
            }
        }
        if !found.is_empty() {
            warn!("Audit found {} inconsistencies", found.len());
        }
        Ok(found)
    }
}

/// Disagreement between the server config and the ledger
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inconsistency {
    OrphanBlock { username: String },
    MissingBlock { username: String },
    MalformedBlock { username: String, line: usize },
    KeyMismatch { username: String },
    AddressMismatch { username: String, ledger: Ipv4Addr, config: Option<Ipv4Addr> },
}

fn reactivate(record: &mut UserRecord, now: DateTime<Utc>) {
    if record.status == UserStatus::Expired && record.expires_at > now {
        record.status = UserStatus::Active;
    }
}

/// `base` pushed out by `days`, or `InvalidConfig` when that leaves the
/// representable calendar
fn days_after(base: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| {
            Error::InvalidConfig(format!("{} days after {} is out of range", days, base))
        })
}
