//! Archive Commands

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;
use std::net::Ipv4Addr;

use crate::commands::fmt_time;
use crate::context::Context;
use crate::output::{print_list, user_status_cell, OutputFormat, TableDisplay};
use wgledger_common::{ArchiveRecord, UserStatus};

#[derive(Subcommand)]
pub enum ArchiveCommands {
    /// List removed users
    List {
        /// Only this username
        username: Option<String>,
    },
}

#[derive(Serialize)]
pub struct ArchiveDisplay {
    pub username: String,
    pub address: Ipv4Addr,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub removed_at: DateTime<Utc>,
}

impl From<ArchiveRecord> for ArchiveDisplay {
    fn from(archived: ArchiveRecord) -> Self {
        let record = archived.record;
        Self {
            username: record.username,
            address: record.address,
            status: record.status,
            created_at: record.created_at,
            expires_at: record.expires_at,
            removed_at: archived.removed_at,
        }
    }
}

impl TableDisplay for ArchiveDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Username", "Address", "Last status", "Created", "Expires", "Removed"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.address.to_string(),
            user_status_cell(self.status),
            fmt_time(Some(self.created_at)),
            fmt_time(Some(self.expires_at)),
            fmt_time(Some(self.removed_at)),
        ]
    }
}

pub fn execute(cmd: ArchiveCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ArchiveCommands::List { username } => {
            let entries: Vec<ArchiveDisplay> = ctx
                .coordinator
                .archived(username.as_deref())?
                .into_iter()
                .map(ArchiveDisplay::from)
                .collect();
            print_list(&entries, format);
        }
    }

    Ok(())
}
