//! Reconciliation loop
//!
//! Periodically folds the live counters into the traffic store and, when
//! enabled, sweeps the ledger for overdue accounts. The coordinator is
//! synchronous, so every pass runs on the blocking pool.

use crate::config::DaemonSettings;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wgledger_common::{LifecycleCoordinator, ListFilter, SyncReport, UserStatus};

/// Outcome of one expiry sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub marked: Vec<String>,
    pub revoked: Vec<String>,
    pub failed: Vec<String>,
}

/// Drives stats refresh and expiry enforcement
pub struct Reconciler {
    coordinator: Arc<LifecycleCoordinator>,
    settings: DaemonSettings,
}

impl Reconciler {
    pub fn new(coordinator: Arc<LifecycleCoordinator>, settings: DaemonSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Reconciler started (sync every {:?}, sweep every {:?}, enforce_expiry={})",
            self.settings.sync_interval(),
            self.settings.sweep_interval(),
            self.settings.enforce_expiry
        );

        let mut sync_tick = tokio::time::interval(self.settings.sync_interval());
        let mut sweep_tick = tokio::time::interval(self.settings.sweep_interval());
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!("Stats sync error: {}", e);
                    }
                }
                _ = sweep_tick.tick(), if self.settings.enforce_expiry => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if !report.failed.is_empty() => {
                            warn!("Expiry sweep could not revoke {:?}", report.failed);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Expiry sweep error: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// One stats refresh
    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        let coordinator = self.coordinator.clone();
        let report = tokio::task::spawn_blocking(move || coordinator.refresh_stats()).await??;
        debug!("Sync report: {:?}", report);
        Ok(report)
    }

    /// One expiry sweep as of `now`
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let coordinator = self.coordinator.clone();
        let revoke = self.settings.revoke_expired;

        let report = tokio::task::spawn_blocking(move || -> wgledger_common::Result<SweepReport> {
            let mut report = SweepReport {
                marked: coordinator.mark_expired(now)?,
                ..Default::default()
            };
            if !revoke {
                return Ok(report);
            }

            let expired: Vec<String> = coordinator
                .list(ListFilter {
                    include_inactive: true,
                })?
                .into_iter()
                .filter(|r| r.status == UserStatus::Expired)
                .map(|r| r.username)
                .collect();

            for username in expired {
                match coordinator.delete_at(&username, now) {
                    Ok(_) => {
                        info!("Revoked expired account {}", username);
                        report.revoked.push(username);
                    }
                    Err(e) => {
                        warn!("Failed to revoke {}: {}", username, e);
                        report.failed.push(username);
                    }
                }
            }
            Ok(report)
        })
        .await??;

        if !report.marked.is_empty() || !report.revoked.is_empty() {
            info!(
                "Expiry sweep: {} marked, {} revoked",
                report.marked.len(),
                report.revoked.len()
            );
        }
        Ok(report)
    }
}
