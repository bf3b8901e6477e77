//! Expiry Commands

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;

use crate::commands::fmt_time;
use crate::commands::user::UserDisplay;
use crate::context::Context;
use crate::output::{print_item, print_list, print_message, print_success, OutputFormat, TableDisplay};
use wgledger_common::ExpiryState;

#[derive(Subcommand)]
pub enum ExpiryCommands {
    /// Extend an account by a number of days
    Extend {
        /// Username
        username: String,

        /// Days to add
        days: i64,
    },

    /// Restart the trial period from now
    Reset {
        /// Username
        username: String,
    },

    /// Mark an account expired now
    Expire {
        /// Username
        username: String,
    },

    /// Show how long an account has left
    Check {
        /// Username
        username: String,
    },

    /// Mark every overdue account expired
    Sweep,
}

#[derive(Serialize)]
pub struct ExpiryDisplay {
    pub username: String,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub remaining_secs: i64,
    pub summary: String,
}

impl TableDisplay for ExpiryDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Username", "Expires", "State"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            fmt_time(Some(self.expires_at)),
            self.summary.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct SweptDisplay {
    pub username: String,
}

impl TableDisplay for SweptDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Marked expired"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.username.clone()]
    }
}

pub fn execute(cmd: ExpiryCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let coordinator = &ctx.coordinator;

    match cmd {
        ExpiryCommands::Extend { username, days } => {
            let record = coordinator.extend(&username, days)?;
            print_success(&format!("User '{}' extended by {} days", username, days));
            print_item(&UserDisplay::new(record, Utc::now()), format);
        }

        ExpiryCommands::Reset { username } => {
            let record = coordinator.reset_expiry(&username)?;
            print_success(&format!("Expiry of '{}' reset", username));
            print_item(&UserDisplay::new(record, Utc::now()), format);
        }

        ExpiryCommands::Expire { username } => {
            let record = coordinator.expire(&username)?;
            print_success(&format!("User '{}' marked expired", username));
            print_item(&UserDisplay::new(record, Utc::now()), format);
        }

        ExpiryCommands::Check { username } => {
            let now = Utc::now();
            let record = coordinator.get(&username)?;
            let state = coordinator.check_expiry(&username, now)?;
            let remaining_secs = match state {
                ExpiryState::Valid { remaining } => remaining.num_seconds(),
                ExpiryState::Expired => 0,
            };
            print_item(
                &ExpiryDisplay {
                    username,
                    expires_at: record.expires_at,
                    expired: state == ExpiryState::Expired,
                    remaining_secs,
                    summary: state.to_string(),
                },
                format,
            );
        }

        ExpiryCommands::Sweep => {
            let marked = coordinator.mark_expired(Utc::now())?;
            if marked.is_empty() {
                print_message("No overdue accounts", format);
            } else {
                let rows: Vec<SweptDisplay> = marked
                    .into_iter()
                    .map(|username| SweptDisplay { username })
                    .collect();
                print_list(&rows, format);
            }
        }
    }

    Ok(())
}
