//! Runtime control of the live tunnel interface
//!
//! The core only needs four things from the running daemon: a snapshot of
//! per-peer counters, adding a peer, removing a peer by public key, and a
//! reload from the config file. `WgCommand` does this through the `wg` and
//! `wg-quick` tools.

use crate::config::RuntimeConfig;
use crate::types::PeerSnapshot;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::net::Ipv4Addr;
use std::process::{Command, Output};
use tracing::{debug, info};

/// Operations the core performs against the live daemon
pub trait RuntimeControl: Send + Sync {
    /// Per-peer counters as currently reported by the daemon
    fn snapshot(&self) -> Result<Vec<PeerSnapshot>>;

    /// Add a peer with a preshared key and a single /32
    fn add_peer(&self, public_key: &str, preshared_key: &str, address: Ipv4Addr) -> Result<()>;

    /// Remove a peer by public key
    fn remove_peer(&self, public_key: &str) -> Result<()>;

    /// Re-read the server config without dropping sessions
    fn reload(&self) -> Result<()>;
}

/// `wg`/`wg-quick` backed runtime control
#[derive(Debug, Clone)]
pub struct WgCommand {
    interface: String,
    wg_binary: String,
    wg_quick_binary: String,
}

impl WgCommand {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            wg_binary: config.wg_binary.clone(),
            wg_quick_binary: config.wg_quick_binary.clone(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("Running {}", command);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::RuntimeCommand {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::RuntimeCommand {
                command,
                message: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output)
    }

    fn secret_file(contents: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "{}", contents)?;
        file.as_file().sync_all()?;
        Ok(file)
    }
}

impl RuntimeControl for WgCommand {
    fn snapshot(&self) -> Result<Vec<PeerSnapshot>> {
        let output = self.run(&self.wg_binary, &["show", &self.interface, "dump"])?;
        parse_dump(&String::from_utf8_lossy(&output.stdout))
    }

    fn add_peer(&self, public_key: &str, preshared_key: &str, address: Ipv4Addr) -> Result<()> {
        // wg reads the preshared key from a file, never from argv
        let psk = Self::secret_file(preshared_key)?;
        let psk_path = psk.path().to_string_lossy().to_string();
        let allowed = format!("{}/32", address);
        self.run(
            &self.wg_binary,
            &[
                "set",
                &self.interface,
                "peer",
                public_key,
                "preshared-key",
                &psk_path,
                "allowed-ips",
                &allowed,
            ],
        )?;
        info!("Added peer {} ({}) to {}", public_key, allowed, self.interface);
        Ok(())
    }

    fn remove_peer(&self, public_key: &str) -> Result<()> {
        self.run(
            &self.wg_binary,
            &["set", &self.interface, "peer", public_key, "remove"],
        )?;
        info!("Removed peer {} from {}", public_key, self.interface);
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        let stripped = self.run(&self.wg_quick_binary, &["strip", &self.interface])?;
        let conf = Self::secret_file(&String::from_utf8_lossy(&stripped.stdout))?;
        let conf_path = conf.path().to_string_lossy().to_string();
        self.run(&self.wg_binary, &["syncconf", &self.interface, &conf_path])?;
        info!("Reloaded {} from config", self.interface);
        Ok(())
    }
}

/// Parse `wg show <interface> dump`.
///
/// The first line describes the interface (4 fields) and is skipped. Peer
/// lines carry 8 tab-separated fields: public key, preshared key, endpoint,
/// allowed ips, latest handshake (unix seconds, 0 = never), rx bytes,
/// tx bytes, persistent keepalive.
pub fn parse_dump(output: &str) -> Result<Vec<PeerSnapshot>> {
    let mut peers = Vec::new();
    for (idx, line) in output.lines().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.len() {
            0 | 1 if line.trim().is_empty() => continue,
            4 => continue,
            8 => {}
            n => {
                return Err(Error::RuntimeCommand {
                    command: "wg show dump".to_string(),
                    message: format!("line {}: expected 8 fields, got {}", idx + 1, n),
                })
            }
        }

        let number = |field: &str, name: &str| -> Result<i64> {
            field.parse::<i64>().map_err(|_| Error::RuntimeCommand {
                command: "wg show dump".to_string(),
                message: format!("line {}: bad {} {:?}", idx + 1, name, field),
            })
        };

        let handshake = number(fields[4], "handshake")?;
        let received = number(fields[5], "rx bytes")?;
        let sent = number(fields[6], "tx bytes")?;

        peers.push(PeerSnapshot {
            public_key: fields[0].to_string(),
            received: received.max(0) as u64,
            sent: sent.max(0) as u64,
            last_handshake: if handshake > 0 {
                DateTime::<Utc>::from_timestamp(handshake, 0)
            } else {
                None
            },
            endpoint: match fields[2] {
                "(none)" | "" => None,
                ep => Some(ep.to_string()),
            },
        });
    }
    Ok(peers)
}
