//! Core record types for wgledger

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Label the key-generation bootstrap writes into placeholder markers.
/// Usernames containing it never enter the traffic statistics.
pub const PLACEHOLDER_LABEL: &str = "Client";

/// Account status as owned by the lifecycle coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
    Expired,
}

impl Default for UserStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserStatus::Active => write!(f, "active"),
            UserStatus::Inactive => write!(f, "inactive"),
            UserStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Connection status as observed by the stats reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Active => write!(f, "active"),
            ConnectionStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Assignment of one subnet host address to one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLease {
    pub address: Ipv4Addr,
    pub owner: String,
}

/// Identity written into a server config block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub username: String,
    pub public_key: String,
    pub preshared_key: String,
}

/// Key material for one peer. The private key leaves the core exactly once,
/// in the value returned by `create`.
#[derive(Clone)]
pub struct PeerKeys {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
}

impl std::fmt::Debug for PeerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerKeys")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("preshared_key", &"<redacted>")
            .finish()
    }
}

/// Account record persisted in the user ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub address: Ipv4Addr,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    pub peer_public_key: String,
}

impl UserRecord {
    pub fn lease(&self) -> NetworkLease {
        NetworkLease {
            address: self.address,
            owner: self.username.clone(),
        }
    }

    pub fn allowed_ips(&self) -> String {
        format!("{}/32", self.address)
    }

    /// Expiry state relative to `now`
    pub fn expiry_state(&self, now: DateTime<Utc>) -> ExpiryState {
        if self.expires_at > now {
            ExpiryState::Valid {
                remaining: self.expires_at - now,
            }
        } else {
            ExpiryState::Expired
        }
    }
}

/// Result of an expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    Valid { remaining: Duration },
    Expired,
}

impl std::fmt::Display for ExpiryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpiryState::Valid { remaining } => {
                let days = remaining.num_days();
                let hours = remaining.num_hours() - days * 24;
                write!(f, "{}d {}h remaining", days, hours)
            }
            ExpiryState::Expired => write!(f, "expired"),
        }
    }
}

/// A removed account, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    #[serde(flatten)]
    pub record: UserRecord,
    pub removed_at: DateTime<Utc>,
}

/// Cumulative traffic for one username, owned by the stats reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficCounter {
    pub username: String,
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Option<String>,
    pub cumulative_received: u64,
    pub cumulative_sent: u64,
    #[serde(default)]
    pub last_handshake: Option<DateTime<Utc>>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub status: ConnectionStatus,
}

impl TrafficCounter {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            public_key: public_key.into(),
            allowed_ips: None,
            cumulative_received: 0,
            cumulative_sent: 0,
            last_handshake: None,
            endpoints: Vec::new(),
            status: ConnectionStatus::Inactive,
        }
    }
}

/// One peer entry of a live runtime snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub public_key: String,
    pub received: u64,
    pub sent: u64,
    pub last_handshake: Option<DateTime<Utc>>,
    pub endpoint: Option<String>,
}

/// Filter for ledger and statistics listings
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub include_inactive: bool,
}

/// Check a username before it is written into the server config.
///
/// Markers are matched by whole line, so anything that would break the line
/// structure is refused.
pub fn validate_username(username: &str) -> crate::Result<()> {
    let reject = |reason: &str| {
        Err(crate::Error::InvalidUsername {
            username: username.to_string(),
            reason: reason.to_string(),
        })
    };

    if username.is_empty() {
        return reject("must not be empty");
    }
    if username.len() > 64 {
        return reject("must be at most 64 characters");
    }
    if username.contains(PLACEHOLDER_LABEL) {
        return reject("contains the reserved placeholder label");
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return reject("only ASCII letters, digits and - _ . @ are allowed");
    }
    Ok(())
}

const SIZE_UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

/// Render a byte count as `12.34 MiB`
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in SIZE_UNITS {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} GiB", value * 1024.0)
}

/// Parse a size such as `4.88 KiB` back into bytes
pub fn parse_bytes(s: &str) -> Option<u64> {
    let mut parts = s.split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next().unwrap_or("B").to_ascii_lowercase().as_str() {
        "b" => 1u64,
        "kib" => 1024,
        "mib" => 1024 * 1024,
        "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_in_days: i64) -> UserRecord {
        let now = Utc::now();
        UserRecord {
            username: "alice".to_string(),
            created_at: now,
            expires_at: now + Duration::days(expires_in_days),
            address: Ipv4Addr::new(10, 66, 66, 2),
            status: UserStatus::Active,
            email: None,
            contact_id: None,
            peer_public_key: "pk".to_string(),
        }
    }

    #[test]
    fn test_expiry_state() {
        let now = Utc::now();
        assert!(matches!(record(3).expiry_state(now), ExpiryState::Valid { .. }));
        assert_eq!(record(-1).expiry_state(now), ExpiryState::Expired);
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record(30)).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["address"], "10.66.66.2");
        assert!(json.get("email").is_none());
        // ISO-8601 timestamps
        assert!(json["created_at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_archive_flattens_record() {
        let archived = ArchiveRecord {
            record: record(1),
            removed_at: Utc::now(),
        };
        let json = serde_json::to_value(&archived).unwrap();
        assert_eq!(json["username"], "alice");
        assert!(json.get("removed_at").is_some());
        let back: ArchiveRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, archived);
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob.smith@home").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("line\nbreak").is_err());
        assert!(validate_username("Client1").is_err());
    }

    #[test]
    fn test_format_and_parse_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(500 * 1024 * 1024), "500.00 MiB");
        assert_eq!(parse_bytes("4.00 KiB"), Some(4096));
        assert_eq!(parse_bytes("2 MiB"), Some(2 * 1024 * 1024));
        assert_eq!(parse_bytes("12 parsecs"), None);
    }
}
