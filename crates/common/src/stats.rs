//! Traffic statistics reconciliation
//!
//! The tunnel daemon's per-peer transfer counters reset to zero whenever it
//! restarts. The reconciler folds each runtime reading into durable
//! cumulative counters keyed by username.
//!
//! Counter rule: if either fresh reading is below the stored cumulative
//! value the daemon is assumed to have restarted, and the reading is added
//! as an increment. Otherwise the reading replaces the stored value. A second
//! restart between two syncs can therefore double-count the part of the
//! traffic that was already merged; the rule is kept as is.

use crate::store::{load_json, save_json};
use crate::types::{ConnectionStatus, PeerSnapshot, TrafficCounter, PLACEHOLDER_LABEL};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Merge a runtime reading `(received, sent)` into the stored cumulative pair
pub fn merge_counters(stored: (u64, u64), runtime: (u64, u64)) -> (u64, u64) {
    let (r_old, s_old) = stored;
    let (r_new, s_new) = runtime;
    if r_new < r_old || s_new < s_old {
        (r_old.saturating_add(r_new), s_old.saturating_add(s_new))
    } else {
        (r_new, s_new)
    }
}

/// On-disk traffic document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficDocument {
    #[serde(default)]
    pub users: BTreeMap<String, TrafficCounter>,
}

/// Persistent cumulative counters
#[derive(Debug, Clone)]
pub struct TrafficStore {
    path: PathBuf,
}

impl TrafficStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<TrafficDocument> {
        load_json(&self.path)
    }

    pub fn save(&self, doc: &TrafficDocument) -> Result<()> {
        save_json(&self.path, doc)
    }

    pub fn get(&self, username: &str) -> Result<Option<TrafficCounter>> {
        Ok(self.load()?.users.remove(username))
    }

    /// Counters in username order, optionally hiding inactive peers
    pub fn list(&self, include_inactive: bool) -> Result<Vec<TrafficCounter>> {
        Ok(self
            .load()?
            .users
            .into_values()
            .filter(|c| include_inactive || c.status == ConnectionStatus::Active)
            .collect())
    }
}

/// Summary of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Usernames updated from a snapshot entry
    pub updated: Vec<String>,
    /// Configured peers absent from the snapshot
    pub missing: Vec<String>,
    /// Snapshot keys with no configured username
    pub stale_keys: Vec<String>,
    /// Counters dropped for placeholder or empty usernames
    pub dropped: Vec<String>,
    /// Usernames whose counters restarted under a new identity
    pub rekeyed: Vec<String>,
}

/// Folds runtime snapshots into the traffic store
#[derive(Debug, Clone)]
pub struct StatsReconciler {
    store: TrafficStore,
}

impl StatsReconciler {
    pub fn new(store: TrafficStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TrafficStore {
        &self.store
    }

    /// Merge `snapshot` into the stored counters and persist them.
    ///
    /// `public_key_to_username` comes from the server config's peer blocks.
    /// `allowed_ips` optionally carries each username's AllowedIPs for
    /// display.
    pub fn sync(
        &self,
        snapshot: &[PeerSnapshot],
        public_key_to_username: &HashMap<String, String>,
        allowed_ips: &HashMap<String, String>,
    ) -> Result<SyncReport> {
        let mut doc = self.store.load()?;
        let report = merge_snapshot(&mut doc, snapshot, public_key_to_username, allowed_ips);
        self.store.save(&doc)?;

        info!(
            "Stats sync: {} updated, {} missing from runtime, {} stale keys, {} dropped",
            report.updated.len(),
            report.missing.len(),
            report.stale_keys.len(),
            report.dropped.len()
        );
        for counter in doc.users.values() {
            debug!(
                "{} {}: rx {} tx {}",
                counter.username,
                counter.status,
                crate::types::format_bytes(counter.cumulative_received),
                crate::types::format_bytes(counter.cumulative_sent)
            );
        }
        Ok(report)
    }
}

/// In-memory merge used by `StatsReconciler::sync`
pub fn merge_snapshot(
    doc: &mut TrafficDocument,
    snapshot: &[PeerSnapshot],
    public_key_to_username: &HashMap<String, String>,
    allowed_ips: &HashMap<String, String>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let mut seen: Vec<&str> = Vec::new();

    for peer in snapshot {
        let Some(username) = public_key_to_username.get(&peer.public_key) else {
            report.stale_keys.push(peer.public_key.clone());
            continue;
        };
        seen.push(peer.public_key.as_str());

        let counter = counter_for(doc, username, &peer.public_key, &mut report);
        if let Some(ips) = allowed_ips.get(username) {
            counter.allowed_ips = Some(ips.clone());
        }

        if let Some(endpoint) = &peer.endpoint {
            if !counter.endpoints.contains(endpoint) {
                counter.endpoints.push(endpoint.clone());
            }
        }

        match peer.last_handshake {
            Some(at) => {
                counter.last_handshake = Some(at);
                counter.status = ConnectionStatus::Active;
            }
            None => counter.status = ConnectionStatus::Inactive,
        }

        let (received, sent) = merge_counters(
            (counter.cumulative_received, counter.cumulative_sent),
            (peer.received, peer.sent),
        );
        counter.cumulative_received = received;
        counter.cumulative_sent = sent;
        report.updated.push(username.clone());
    }

    // Configured peers the daemon no longer reports: no handshake, counters kept
    for (public_key, username) in public_key_to_username {
        if seen.contains(&public_key.as_str()) {
            continue;
        }
        let counter = counter_for(doc, username, public_key, &mut report);
        if let Some(ips) = allowed_ips.get(username) {
            counter.allowed_ips = Some(ips.clone());
        }
        counter.status = ConnectionStatus::Inactive;
        report.missing.push(username.clone());
    }

    doc.users.retain(|username, _| {
        let keep = !username.is_empty() && !username.contains(PLACEHOLDER_LABEL);
        if !keep {
            report.dropped.push(username.clone());
        }
        keep
    });
    report.updated.retain(|u| !report.dropped.contains(u));
    report.missing.retain(|u| !report.dropped.contains(u));
    report.missing.sort();
    report
}

fn counter_for<'a>(
    doc: &'a mut TrafficDocument,
    username: &str,
    public_key: &str,
    report: &mut SyncReport,
) -> &'a mut TrafficCounter {
    let counter = doc
        .users
        .entry(username.to_string())
        .or_insert_with(|| TrafficCounter::new(username, public_key));
    if counter.public_key != public_key {
        // Username reused by a new identity
        report.rekeyed.push(username.to_string());
        *counter = TrafficCounter::new(username, public_key);
    }
    counter
}
