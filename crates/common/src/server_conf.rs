//! Server configuration block editor
//!
//! The tunnel daemon's config holds one `[Interface]` section followed by
//! peer blocks of a fixed five-line shape:
//!
//! ```text
//! ### Client <username>
//! [Peer]
//! PublicKey = <publicKey>
//! PresharedKey = <presharedKey>
//! AllowedIPs = <address>/32
//! ```
//!
//! The file is parsed into a line list plus block nodes; edits operate on
//! node boundaries and the whole file is written back. A marker whose next
//! four lines do not have that shape is kept as a malformed node and is
//! never edited.

use crate::store::write_atomic;
use crate::types::PeerIdentity;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Comment prefix that starts every peer block
pub const MARKER_PREFIX: &str = "### Client ";

/// Lines in a canonical peer block, marker included
pub const BLOCK_LINES: usize = 5;

/// A well-formed peer block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock {
    pub username: String,
    /// Index of the marker line
    pub start: usize,
    /// One past the last line of the block
    pub end: usize,
    pub public_key: String,
    pub preshared_key: String,
    pub allowed_ips: String,
}

impl PeerBlock {
    /// IPv4 host address from `AllowedIPs`, if it holds one
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.allowed_ips
            .split(',')
            .filter_map(|part| part.trim().split('/').next())
            .find_map(|ip| ip.parse().ok())
    }
}

/// A marker that is not followed by a canonical block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedBlock {
    pub username: String,
    /// 1-based line of the marker
    pub line: usize,
    pub reason: String,
}

/// Parsed server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConf {
    lines: Vec<String>,
    blocks: Vec<PeerBlock>,
    malformed: Vec<MalformedBlock>,
    interface_addresses: Vec<Ipv4Addr>,
}

impl ServerConf {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_string).collect();
        let mut blocks = Vec::new();
        let mut malformed = Vec::new();
        let mut interface_addresses = Vec::new();
        let mut in_interface = false;

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i].trim();

            if let Some(username) = marker_username(line) {
                in_interface = false;
                match parse_block(&lines, i, username) {
                    Ok(block) => {
                        i = block.end;
                        blocks.push(block);
                        continue;
                    }
                    Err(reason) => {
                        warn!("Malformed peer block for {} at line {}: {}", username, i + 1, reason);
                        malformed.push(MalformedBlock {
                            username: username.to_string(),
                            line: i + 1,
                            reason,
                        });
                    }
                }
            } else if line.starts_with('[') {
                in_interface = line == "[Interface]";
            } else if in_interface {
                if let Some(("Address", value)) = key_value(line) {
                    interface_addresses.extend(
                        value
                            .split(',')
                            .filter_map(|part| part.trim().split('/').next())
                            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok()),
                    );
                }
            }
            i += 1;
        }

        Self {
            lines,
            blocks,
            malformed,
            interface_addresses,
        }
    }

    pub fn blocks(&self) -> &[PeerBlock] {
        &self.blocks
    }

    pub fn malformed(&self) -> &[MalformedBlock] {
        &self.malformed
    }

    /// Addresses assigned to the server interface itself
    pub fn interface_addresses(&self) -> &[Ipv4Addr] {
        &self.interface_addresses
    }

    /// True if any marker (well-formed or not) names `username`
    pub fn has_marker(&self, username: &str) -> bool {
        self.blocks.iter().any(|b| b.username == username)
            || self.malformed.iter().any(|m| m.username == username)
    }

    /// The block for `username`
    pub fn block(&self, username: &str) -> Result<&PeerBlock> {
        if let Some(block) = self.blocks.iter().find(|b| b.username == username) {
            return Ok(block);
        }
        if let Some(bad) = self.malformed.iter().find(|m| m.username == username) {
            return Err(Error::ConfigParse {
                line: bad.line,
                message: format!("block for {}: {}", username, bad.reason),
            });
        }
        Err(Error::not_found("config marker", username))
    }

    /// Public key → username for every well-formed block
    pub fn public_key_map(&self) -> HashMap<String, String> {
        self.blocks
            .iter()
            .map(|b| (b.public_key.clone(), b.username.clone()))
            .collect()
    }

    /// Addresses already claimed by the config: peer AllowedIPs plus the
    /// interface's own address
    pub fn reserved_addresses(&self) -> HashSet<Ipv4Addr> {
        self.blocks
            .iter()
            .filter_map(PeerBlock::address)
            .chain(self.interface_addresses.iter().copied())
            .collect()
    }

    /// Append a block for `identity` leasing `address`
    pub fn push_block(&mut self, identity: &PeerIdentity, address: Ipv4Addr) {
        if let Some(last) = self.lines.last_mut() {
            if !last.ends_with('\n') {
                last.push('\n');
            }
        }
        self.lines.extend(render_block(identity, address));
        self.reparse();
    }

    /// Drop the block for `username`, returning it
    pub fn remove_block(&mut self, username: &str) -> Result<PeerBlock> {
        let block = self.block(username)?.clone();
        self.lines.drain(block.start..block.end);
        self.reparse();
        Ok(block)
    }

    pub fn render(&self) -> String {
        self.lines.concat()
    }

    fn reparse(&mut self) {
        *self = Self::parse(&self.render());
    }
}

/// The five lines of a peer block, newline-terminated
pub fn render_block(identity: &PeerIdentity, address: Ipv4Addr) -> Vec<String> {
    vec![
        format!("{}{}\n", MARKER_PREFIX, identity.username),
        "[Peer]\n".to_string(),
        format!("PublicKey = {}\n", identity.public_key),
        format!("PresharedKey = {}\n", identity.preshared_key),
        format!("AllowedIPs = {}/32\n", address),
    ]
}

fn marker_username(line: &str) -> Option<&str> {
    line.strip_prefix(MARKER_PREFIX)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    line.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
}

fn parse_block(lines: &[String], start: usize, username: &str) -> std::result::Result<PeerBlock, String> {
    if start + BLOCK_LINES > lines.len() {
        return Err(format!(
            "expected {} lines, file ends after {}",
            BLOCK_LINES,
            lines.len() - start
        ));
    }

    let body = &lines[start + 1..start + BLOCK_LINES];
    if body[0].trim() != "[Peer]" {
        return Err(format!("expected [Peer], found {:?}", body[0].trim()));
    }

    let field = |idx: usize, key: &str| -> std::result::Result<String, String> {
        match key_value(body[idx].trim()) {
            Some((k, v)) if k == key && !v.is_empty() => Ok(v.to_string()),
            _ => Err(format!("expected {} = ..., found {:?}", key, body[idx].trim())),
        }
    };

    Ok(PeerBlock {
        username: username.to_string(),
        start,
        end: start + BLOCK_LINES,
        public_key: field(1, "PublicKey")?,
        preshared_key: field(2, "PresharedKey")?,
        allowed_ips: field(3, "AllowedIPs")?,
    })
}

/// Reads and rewrites peer blocks in the server configuration file
#[derive(Debug, Clone)]
pub struct ConfigBlockEditor {
    path: PathBuf,
}

impl ConfigBlockEditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the current file
    pub fn load(&self) -> Result<ServerConf> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| Error::ConfigRead {
            path: self.path.clone(),
            source,
        })?;
        Ok(ServerConf::parse(&text))
    }

    fn store(&self, conf: &ServerConf) -> Result<()> {
        write_atomic(&self.path, conf.render().as_bytes()).map_err(|source| Error::ConfigWrite {
            path: self.path.clone(),
            source,
        })
    }

    /// Append a peer block
    pub fn insert_block(&self, identity: &PeerIdentity, address: Ipv4Addr) -> Result<()> {
        let mut conf = self.load()?;
        conf.push_block(identity, address);
        self.store(&conf)?;
        info!("Added peer block for {} ({}) to {:?}", identity.username, address, self.path);
        Ok(())
    }

    /// Remove the peer block for `username`. The file is not touched when
    /// the marker is absent.
    pub fn remove_block(&self, username: &str) -> Result<PeerBlock> {
        let mut conf = self.load()?;
        let block = conf.remove_block(username)?;
        self.store(&conf)?;
        info!(
            "Removed peer block for {} (lines {}-{}) from {:?}",
            username,
            block.start + 1,
            block.end,
            self.path
        );
        Ok(block)
    }

    pub fn find_public_key(&self, username: &str) -> Result<String> {
        let conf = self.load()?;
        let key = conf.block(username)?.public_key.clone();
        debug!("Found public key for {}", username);
        Ok(key)
    }

    pub fn has_marker(&self, username: &str) -> Result<bool> {
        Ok(self.load()?.has_marker(username))
    }

    pub fn public_key_map(&self) -> Result<HashMap<String, String>> {
        Ok(self.load()?.public_key_map())
    }

    pub fn reserved_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        Ok(self.load()?.reserved_addresses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "[Interface]\n\
        Address = 10.66.66.1/24,fd42:42:42::1/64\n\
        ListenPort = 51820\n\
        PrivateKey = c2VydmVy\n\
        \n\
        ### Client alice\n\
        [Peer]\n\
        PublicKey = alicepub=\n\
        PresharedKey = alicepsk=\n\
        AllowedIPs = 10.66.66.2/32\n\
        ### Client bob\n\
        [Peer]\n\
        PublicKey = bobpub=\n\
        PresharedKey = bobpsk=\n\
        AllowedIPs = 10.66.66.3/32\n";

    fn identity(name: &str) -> PeerIdentity {
        PeerIdentity {
            username: name.to_string(),
            public_key: format!("{}pub=", name),
            preshared_key: format!("{}psk=", name),
        }
    }

    fn editor_with(text: &str) -> (tempfile::TempDir, ConfigBlockEditor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        std::fs::write(&path, text).unwrap();
        (dir, ConfigBlockEditor::new(path))
    }

    #[test]
    fn test_parse_blocks() {
        let conf = ServerConf::parse(BASE);
        assert_eq!(conf.blocks().len(), 2);
        let alice = conf.block("alice").unwrap();
        assert_eq!(alice.public_key, "alicepub=");
        assert_eq!(alice.preshared_key, "alicepsk=");
        assert_eq!(alice.address(), Some(Ipv4Addr::new(10, 66, 66, 2)));
        assert_eq!(alice.start, 5);
        assert_eq!(alice.end, 10);
        assert_eq!(conf.interface_addresses(), &[Ipv4Addr::new(10, 66, 66, 1)]);
        assert_eq!(conf.render(), BASE);
    }

    #[test]
    fn test_reserved_and_key_map() {
        let conf = ServerConf::parse(BASE);
        let reserved = conf.reserved_addresses();
        assert!(reserved.contains(&Ipv4Addr::new(10, 66, 66, 1)));
        assert!(reserved.contains(&Ipv4Addr::new(10, 66, 66, 2)));
        assert!(reserved.contains(&Ipv4Addr::new(10, 66, 66, 3)));
        let map = conf.public_key_map();
        assert_eq!(map.get("bobpub=").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_remove_missing_marker_leaves_file_untouched() {
        let (_dir, editor) = editor_with(BASE);
        let err = editor.remove_block("carol").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(std::fs::read(editor.path()).unwrap(), BASE.as_bytes());
    }

    #[test]
    fn test_insert_then_remove_restores_bytes() {
        let (_dir, editor) = editor_with(BASE);
        editor
            .insert_block(&identity("carol"), Ipv4Addr::new(10, 66, 66, 4))
            .unwrap();
        let grown = std::fs::read_to_string(editor.path()).unwrap();
        assert!(grown.ends_with(
            "### Client carol\n[Peer]\nPublicKey = carolpub=\nPresharedKey = carolpsk=\nAllowedIPs = 10.66.66.4/32\n"
        ));

        editor.remove_block("carol").unwrap();
        assert_eq!(std::fs::read(editor.path()).unwrap(), BASE.as_bytes());
    }

    #[test]
    fn test_remove_middle_block() {
        let (_dir, editor) = editor_with(BASE);
        editor.remove_block("alice").unwrap();
        let conf = editor.load().unwrap();
        assert_eq!(conf.blocks().len(), 1);
        assert_eq!(conf.blocks()[0].username, "bob");
        assert!(!conf.has_marker("alice"));
    }

    #[test]
    fn test_find_public_key() {
        let (_dir, editor) = editor_with(BASE);
        assert_eq!(editor.find_public_key("bob").unwrap(), "bobpub=");
        assert!(matches!(
            editor.find_public_key("nobody"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_marker_match_is_exact() {
        // "al" must not match the block for "alice"
        let conf = ServerConf::parse(BASE);
        assert!(!conf.has_marker("al"));
        assert!(conf.block("al").is_err());
    }

    #[test]
    fn test_malformed_block_is_not_edited() {
        let text = "[Interface]\nAddress = 10.66.66.1/24\n\
            ### Client dave\n[Peer]\nPublicKey = davepub=\nAllowedIPs = 10.66.66.9/32\n\
            ### Client erin\n[Peer]\nPublicKey = erinpub=\nPresharedKey = erinpsk=\nAllowedIPs = 10.66.66.5/32\n";
        let (_dir, editor) = editor_with(text);

        let conf = editor.load().unwrap();
        assert_eq!(conf.malformed().len(), 1);
        assert_eq!(conf.malformed()[0].line, 3);
        assert!(conf.has_marker("dave"));

        let err = editor.remove_block("dave").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { line: 3, .. }));
        assert_eq!(std::fs::read_to_string(editor.path()).unwrap(), text);

        // The well-formed neighbour stays editable
        editor.remove_block("erin").unwrap();
        assert!(!editor.has_marker("erin").unwrap());
    }

    #[test]
    fn test_insert_adds_missing_trailing_newline() {
        let (_dir, editor) = editor_with("[Interface]\nAddress = 10.66.66.1/24");
        editor
            .insert_block(&identity("frank"), Ipv4Addr::new(10, 66, 66, 2))
            .unwrap();
        let text = std::fs::read_to_string(editor.path()).unwrap();
        assert!(text.starts_with("[Interface]\nAddress = 10.66.66.1/24\n### Client frank\n"));
    }

    #[test]
    fn test_crlf_lines_parse() {
        let text = "### Client gina\r\n[Peer]\r\nPublicKey = ginapub=\r\nPresharedKey = ginapsk=\r\nAllowedIPs = 10.66.66.7/32\r\n";
        let conf = ServerConf::parse(text);
        assert_eq!(conf.block("gina").unwrap().public_key, "ginapub=");
        assert_eq!(conf.render(), text);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let editor = ConfigBlockEditor::new(dir.path().join("absent.conf"));
        assert!(matches!(editor.load(), Err(Error::ConfigRead { .. })));
    }
}
