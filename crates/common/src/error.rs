//! Error types for wgledger

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using wgledger Error
pub type Result<T> = std::result::Result<T, Error>;

/// One committed (or attempted) step of a multi-step lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    AllocateAddress,
    GenerateKeys,
    InsertBlock,
    CreateRecord,
    RuntimeAdd,
    FindPublicKey,
    RuntimeRemove,
    RemoveBlock,
    ArchiveRecord,
}

impl std::fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleStep::AllocateAddress => "allocate-address",
            LifecycleStep::GenerateKeys => "generate-keys",
            LifecycleStep::InsertBlock => "insert-block",
            LifecycleStep::CreateRecord => "create-record",
            LifecycleStep::RuntimeAdd => "runtime-add",
            LifecycleStep::FindPublicKey => "find-public-key",
            LifecycleStep::RuntimeRemove => "runtime-remove",
            LifecycleStep::RemoveBlock => "remove-block",
            LifecycleStep::ArchiveRecord => "archive-record",
        };
        f.write_str(s)
    }
}

/// wgledger error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("User already exists: {username}")]
    DuplicateUser { username: String },

    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("No free host address left in {subnet}")]
    AddressSpaceExhausted { subnet: String },

    #[error("Failed to read server config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write server config {path:?}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed server config at line {line}: {message}")]
    ConfigParse { line: usize, message: String },

    #[error("Ledger I/O failed for {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger file {path:?} is not valid: {source}")]
    PersistenceDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Runtime command `{command}` failed: {message}")]
    RuntimeCommand { command: String, message: String },

    #[error("Generated public key collides with existing peer {username}")]
    KeyCollision { username: String },

    #[error("Invalid username {username:?}: {reason}")]
    InvalidUsername { username: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "{operation} of {username} stopped at {failed} after committing [{}]: {source}",
        format_steps(.completed)
    )]
    Incomplete {
        operation: &'static str,
        username: String,
        failed: LifecycleStep,
        completed: Vec<LifecycleStep>,
        #[source]
        source: Box<Error>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_steps(steps: &[LifecycleStep]) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// True when the operation left some of its steps committed.
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::Incomplete { completed, .. } if !completed.is_empty())
    }

    /// Steps already committed when a multi-step operation failed.
    pub fn completed_steps(&self) -> &[LifecycleStep] {
        match self {
            Error::Incomplete { completed, .. } => completed,
            _ => &[],
        }
    }

    /// The innermost error, looking through `Incomplete` wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Incomplete { source, .. } => source.root(),
            other => other,
        }
    }
}
