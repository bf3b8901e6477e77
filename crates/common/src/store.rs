//! Whole-file persistence helpers
//!
//! Every store in wgledger is read entirely, mutated in memory, and written
//! back by replacing the file. Replacement goes through a temp file in the
//! same directory followed by a rename, so readers see either the old or the
//! new content.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Replace `path` with `data` atomically
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    // Keep the mode of the file being replaced (wg0.conf is 0600)
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions())?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    debug!("Replaced {:?} ({} bytes)", path, data.len());
    Ok(())
}

/// Load a JSON document, returning the default value when the file is absent
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(Error::Persistence {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&data).map_err(|source| Error::PersistenceDecode {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a JSON document atomically, pretty-printed
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value).map_err(|source| Error::PersistenceDecode {
        path: path.to_path_buf(),
        source,
    })?;
    data.push(b'\n');
    write_atomic(path, &data).map_err(|source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    })
}
