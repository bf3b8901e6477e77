//! User ledger
//!
//! Two JSON documents: the active store (username → record) and the archive
//! (username → every removed incarnation of that username). Each mutation
//! loads the whole document, changes it and writes it back atomically.
//! Callers that may run concurrently must serialise through the writer lock
//! held by the lifecycle coordinator.

use crate::store::{load_json, save_json};
use crate::types::{ArchiveRecord, ListFilter, UserRecord, UserStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type ActiveStore = BTreeMap<String, UserRecord>;
type ArchiveStore = BTreeMap<String, Vec<ArchiveRecord>>;

/// Persistent account records keyed by username
#[derive(Debug, Clone)]
pub struct UserLedger {
    records_path: PathBuf,
    archive_path: PathBuf,
}

impl UserLedger {
    pub fn new(records_path: impl Into<PathBuf>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            records_path: records_path.into(),
            archive_path: archive_path.into(),
        }
    }

    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    fn load(&self) -> Result<ActiveStore> {
        let store: ActiveStore = load_json(&self.records_path)?;
        // Keys are authoritative; a record body naming another user is corrupt
        if let Some((key, record)) = store.iter().find(|(k, r)| **k != r.username) {
            return Err(Error::Internal(format!(
                "ledger key {} holds record for {}",
                key, record.username
            )));
        }
        Ok(store)
    }

    fn save(&self, store: &ActiveStore) -> Result<()> {
        save_json(&self.records_path, store)
    }

    fn load_archive(&self) -> Result<ArchiveStore> {
        load_json(&self.archive_path)
    }

    /// Insert a new record; the username must be free
    pub fn create(&self, record: UserRecord) -> Result<()> {
        let mut store = self.load()?;
        if store.contains_key(&record.username) {
            return Err(Error::DuplicateUser {
                username: record.username,
            });
        }
        debug!("Ledger create {} at {}", record.username, record.address);
        store.insert(record.username.clone(), record);
        self.save(&store)
    }

    pub fn get(&self, username: &str) -> Result<UserRecord> {
        self.load()?
            .remove(username)
            .ok_or_else(|| Error::not_found("user", username))
    }

    pub fn contains(&self, username: &str) -> Result<bool> {
        Ok(self.load()?.contains_key(username))
    }

    /// Records in username order
    pub fn list(&self, filter: ListFilter) -> Result<Vec<UserRecord>> {
        Ok(self
            .load()?
            .into_values()
            .filter(|r| filter.include_inactive || r.status != UserStatus::Inactive)
            .collect())
    }

    /// Apply `f` to one record and persist the result
    pub fn update<F>(&self, username: &str, f: F) -> Result<UserRecord>
    where
        F: FnOnce(&mut UserRecord),
    {
        let mut store = self.load()?;
        let record = store
            .get_mut(username)
            .ok_or_else(|| Error::not_found("user", username))?;
        f(record);
        record.username = username.to_string();
        let updated = record.clone();
        self.save(&store)?;
        Ok(updated)
    }

    /// Apply `f` to every record; returns usernames `f` reported as changed
    pub fn update_all<F>(&self, mut f: F) -> Result<Vec<String>>
    where
        F: FnMut(&mut UserRecord) -> bool,
    {
        let mut store = self.load()?;
        let changed: Vec<String> = store
            .values_mut()
            .filter_map(|r| f(r).then(|| r.username.clone()))
            .collect();
        if !changed.is_empty() {
            self.save(&store)?;
        }
        Ok(changed)
    }

    /// Move a record into the archive, stamping `removed_at`.
    ///
    /// The archive is written before the active store, so an interrupted
    /// archive leaves the record in both documents rather than in neither.
    pub fn archive(&self, username: &str, removed_at: DateTime<Utc>) -> Result<ArchiveRecord> {
        let mut store = self.load()?;
        let record = store
            .remove(username)
            .ok_or_else(|| Error::not_found("user", username))?;

        let archived = ArchiveRecord {
            record,
            removed_at,
        };
        let mut archive = self.load_archive()?;
        archive
            .entry(username.to_string())
            .or_default()
            .push(archived.clone());
        save_json(&self.archive_path, &archive)?;
        self.save(&store)?;

        info!("Archived user {}", username);
        Ok(archived)
    }

    /// Archived incarnations, oldest first; all usernames when `None`
    pub fn archived(&self, username: Option<&str>) -> Result<Vec<ArchiveRecord>> {
        let archive = self.load_archive()?;
        Ok(match username {
            Some(name) => archive.get(name).cloned().unwrap_or_default(),
            None => archive.into_values().flatten().collect(),
        })
    }

    /// Addresses held by ledger records
    pub fn leases(&self) -> Result<HashSet<Ipv4Addr>> {
        Ok(self.load()?.values().map(|r| r.address).collect())
    }
}
