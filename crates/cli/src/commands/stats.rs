//! Traffic Statistics Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::commands::fmt_time;
use crate::context::Context;
use crate::output::{
    connection_status_cell, print_item, print_list, OutputFormat, TableDisplay,
};
use wgledger_common::{format_bytes, SyncReport, TrafficCounter};

#[derive(Subcommand)]
pub enum StatsCommands {
    /// Pull counters from the live interface and merge them
    Sync,

    /// Show cumulative traffic per user
    List {
        /// Include peers without a recent handshake
        #[arg(short, long)]
        all: bool,

        /// Sync before listing
        #[arg(long)]
        sync: bool,
    },

    /// Show one user's counters
    Show {
        /// Username
        username: String,
    },
}

/// Traffic display wrapper; raw byte counts in structured output
#[derive(Serialize)]
pub struct TrafficDisplay(TrafficCounter);

impl TableDisplay for TrafficDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Username", "Allowed IPs", "Received", "Sent", "Last handshake", "Endpoints", "Status"]
    }

    fn row(&self) -> Vec<String> {
        let c = &self.0;
        vec![
            c.username.clone(),
            c.allowed_ips.clone().unwrap_or_else(|| "-".to_string()),
            format_bytes(c.cumulative_received),
            format_bytes(c.cumulative_sent),
            fmt_time(c.last_handshake),
            if c.endpoints.is_empty() {
                "-".to_string()
            } else {
                c.endpoints.join(", ")
            },
            connection_status_cell(c.status),
        ]
    }
}

#[derive(Serialize)]
pub struct SyncDisplay(SyncReport);

impl TableDisplay for SyncDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Updated", "Missing", "Stale keys", "Dropped", "Rekeyed"]
    }

    fn row(&self) -> Vec<String> {
        let r = &self.0;
        let list = |v: &[String]| {
            if v.is_empty() {
                "-".to_string()
            } else {
                v.join(", ")
            }
        };
        vec![
            list(&r.updated),
            list(&r.missing),
            r.stale_keys.len().to_string(),
            list(&r.dropped),
            list(&r.rekeyed),
        ]
    }
}

pub fn execute(cmd: StatsCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let coordinator = &ctx.coordinator;

    match cmd {
        StatsCommands::Sync => {
            let report = coordinator.refresh_stats()?;
            print_item(&SyncDisplay(report), format);
        }

        StatsCommands::List { all, sync } => {
            if sync {
                coordinator.refresh_stats()?;
            }
            let counters: Vec<TrafficDisplay> = coordinator
                .traffic()
                .list(all)?
                .into_iter()
                .map(TrafficDisplay)
                .collect();
            print_list(&counters, format);
        }

        StatsCommands::Show { username } => {
            let counter = coordinator
                .traffic()
                .get(&username)?
                .ok_or_else(|| wgledger_common::Error::not_found("traffic counters", &username))?;
            print_item(&TrafficDisplay(counter), format);
        }
    }

    Ok(())
}
