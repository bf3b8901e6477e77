//! Client configuration rendering
//!
//! The owner's config is the only place the private key is ever written.

use crate::config::ServerParams;
use crate::types::PeerKeys;
use crate::Result;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Routes everything through the tunnel
pub const FULL_TUNNEL: &str = "0.0.0.0/0,::/0";

/// Rendered client config for one peer
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub contents: String,
}

impl ClientConfig {
    pub fn render(
        username: &str,
        params: &ServerParams,
        keys: &PeerKeys,
        address: Ipv4Addr,
    ) -> Result<Self> {
        let dns_line = params
            .dns_servers()
            .map(|dns| format!("DNS = {}\n", dns))
            .unwrap_or_default();

        let contents = format!(
            "[Interface]\n\
             PrivateKey = {private_key}\n\
             Address = {address}/32\n\
             {dns_line}\n\
             [Peer]\n\
             PublicKey = {server_key}\n\
             PresharedKey = {preshared_key}\n\
             Endpoint = {endpoint}\n\
             AllowedIPs = {allowed}\n",
            private_key = keys.private_key,
            address = address,
            dns_line = dns_line,
            server_key = params.server_public_key()?,
            preshared_key = keys.preshared_key,
            endpoint = params.endpoint()?,
            allowed = FULL_TUNNEL,
        );

        Ok(Self {
            username: username.to_string(),
            contents,
        })
    }

    /// Write `<dir>/<username>.conf`, readable by the owner only
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.conf", self.username));
        crate::store::write_atomic(&path, self.contents.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Wrote client config {:?}", path);
        Ok(path)
    }
}
