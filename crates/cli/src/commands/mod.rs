//! CLI Commands

pub mod archive;
pub mod expiry;
pub mod stats;
pub mod user;

use crate::output::print_error;
use wgledger_common::Error;

/// Spell out which steps committed before a multi-step failure, so the
/// operator knows what to reconcile by hand
pub fn report_failure(err: &Error) {
    if let Error::Incomplete {
        operation,
        username,
        failed,
        completed,
        source,
    } = err
    {
        print_error(&format!(
            "{} '{}' stopped at step '{}': {}",
            operation, username, failed, source
        ));
        let done: Vec<String> = completed.iter().map(|s| s.to_string()).collect();
        print_error(&format!("Already committed: {}", done.join(", ")));
        print_error("Nothing was rolled back; reconcile the remaining steps manually.");
    }
}

/// Display helper for optional timestamps
pub fn fmt_time(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
