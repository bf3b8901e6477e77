//! User Commands

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::Serialize;
use std::net::Ipv4Addr;

use crate::commands::{fmt_time, report_failure};
use crate::context::Context;
use crate::output::{
    print_info, print_item, print_list, print_success, print_warning, user_status_cell,
    OutputFormat, TableDisplay,
};
use wgledger_common::{
    ClientConfig, Inconsistency, ListFilter, NewUser, Provisioned, ServerParams, UserRecord,
    UserStatus,
};

#[derive(Subcommand)]
pub enum UserCommands {
    /// Provision a new peer
    Create {
        /// Username (becomes the config marker)
        username: String,

        /// Contact email
        #[arg(long)]
        email: Option<String>,

        /// External contact identifier
        #[arg(long)]
        contact_id: Option<String>,

        /// Print the client config instead of writing it to the client dir
        #[arg(long)]
        stdout: bool,
    },

    /// Revoke a peer and archive its record
    Delete {
        /// Username
        username: String,

        /// Keep the rendered client config file
        #[arg(long)]
        keep_client_config: bool,
    },

    /// List users
    List {
        /// Include inactive users
        #[arg(short, long)]
        all: bool,
    },

    /// Show one user
    Show {
        /// Username
        username: String,
    },

    /// Compare the server config against the ledger
    Audit,
}

/// User display wrapper for serialization
#[derive(Serialize)]
pub struct UserDisplay {
    pub username: String,
    pub address: Ipv4Addr,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub public_key: String,
}

impl UserDisplay {
    pub fn new(record: UserRecord, now: DateTime<Utc>) -> Self {
        Self {
            remaining: record.expiry_state(now).to_string(),
            username: record.username,
            address: record.address,
            status: record.status,
            created_at: record.created_at,
            expires_at: record.expires_at,
            email: record.email,
            contact_id: record.contact_id,
            public_key: record.peer_public_key,
        }
    }
}

impl TableDisplay for UserDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Username", "Address", "Status", "Created", "Expires", "Remaining", "Email"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.username.clone(),
            self.address.to_string(),
            user_status_cell(self.status),
            fmt_time(Some(self.created_at)),
            fmt_time(Some(self.expires_at)),
            self.remaining.clone(),
            self.email.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

#[derive(Serialize)]
pub struct InconsistencyDisplay(Inconsistency);

impl TableDisplay for InconsistencyDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Username", "Problem"]
    }

    fn row(&self) -> Vec<String> {
        match &self.0 {
            Inconsistency::OrphanBlock { username } => {
                vec![username.clone(), "config block without ledger record".to_string()]
            }
            Inconsistency::MissingBlock { username } => {
                vec![username.clone(), "ledger record without config block".to_string()]
            }
            Inconsistency::MalformedBlock { username, line } => {
                vec![username.clone(), format!("malformed config block at line {}", line)]
            }
            Inconsistency::KeyMismatch { username } => {
                vec![username.clone(), "public key differs between config and ledger".to_string()]
            }
            Inconsistency::AddressMismatch {
                username,
                ledger,
                config,
            } => vec![
                username.clone(),
                format!(
                    "ledger has {}, config has {}",
                    ledger,
                    config.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
                ),
            ],
        }
    }
}

pub fn execute(cmd: UserCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let coordinator = &ctx.coordinator;

    match cmd {
        UserCommands::Create {
            username,
            email,
            contact_id,
            stdout,
        } => {
            let provisioned = coordinator
                .create(&username, NewUser { email, contact_id })
                .inspect_err(report_failure)?;
            print_success(&format!(
                "User '{}' created at {}",
                username, provisioned.record.address
            ));
            deliver_client_config(ctx, &provisioned, stdout);
            print_item(&UserDisplay::new(provisioned.record, Utc::now()), format);
        }

        UserCommands::Delete {
            username,
            keep_client_config,
        } => {
            let archived = coordinator.delete(&username).inspect_err(report_failure)?;
            print_success(&format!(
                "User '{}' deleted, {} released",
                username, archived.record.address
            ));

            if !keep_client_config {
                let path = ctx.config().client_dir().join(format!("{}.conf", username));
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    print_info(&format!("Removed {}", path.display()));
                }
            }
        }

        UserCommands::List { all } => {
            let now = Utc::now();
            let users: Vec<UserDisplay> = coordinator
                .list(ListFilter {
                    include_inactive: all,
                })?
                .into_iter()
                .map(|r| UserDisplay::new(r, now))
                .collect();
            print_list(&users, format);
        }

        UserCommands::Show { username } => {
            let record = coordinator.get(&username)?;
            print_item(&UserDisplay::new(record, Utc::now()), format);
        }

        UserCommands::Audit => {
            let found: Vec<InconsistencyDisplay> = coordinator
                .audit()?
                .into_iter()
                .map(InconsistencyDisplay)
                .collect();
            if found.is_empty() && format == OutputFormat::Table {
                print_success("Server config and ledger agree");
            } else {
                print_list(&found, format);
            }
        }
    }

    Ok(())
}

/// Hand the one-time private key to the operator. A failure here does not
/// undo the create; the key is printed instead so it is not lost.
fn deliver_client_config(ctx: &Context, provisioned: &Provisioned, stdout: bool) {
    let config = ctx.config();
    let rendered = ServerParams::load(&config.params_file).and_then(|params| {
        ClientConfig::render(
            &provisioned.record.username,
            &params,
            &provisioned.keys,
            provisioned.record.address,
        )
    });

    match rendered {
        Ok(client) if stdout => println!("{}", client.contents),
        Ok(client) => match client.write_to(&config.client_dir()) {
            Ok(path) => print_info(&format!("Client config written to {}", path.display())),
            Err(e) => {
                print_warning(&format!("Could not write client config: {}", e));
                println!("{}", client.contents);
            }
        },
        Err(e) => {
            print_warning(&format!("Client config not rendered: {}", e));
            print_warning(&format!(
                "Private key (not stored anywhere): {}",
                provisioned.keys.private_key
            ));
        }
    }
}
