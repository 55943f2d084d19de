//! Shared persistence helpers for the JSON-file stores.
//!
//! Reads fail soft (missing or half-written documents become the default value)
//! because several processes share these files and a reader can observe a
//! writer mid-write; the next poll sees the finished document. Writes go
//! through a temp file + rename, lifting a read-only permission bit for the
//! duration when a prior protective step set one.

pub mod queue;
pub mod results;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Load a JSON document, treating absence or corruption as `T::default()`.
pub fn load_json_soft<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            tracing::warn!("Could not read {}: {err}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            // Likely a concurrent writer mid-write; retry on the next poll.
            tracing::warn!("Could not parse {}: {err}", path.display());
            T::default()
        }
    }
}

/// Atomically replace `path` with the serialized value (temp file + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(value)?;
    let tmp_name = format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
    );
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(tmp_name);
    fs::write(&tmp_path, payload)
        .with_context(|| format!("Failed to write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} -> {}",
            tmp_path.display(),
            path.display()
        )
    })
}

/// Write a store that may have been marked read-only by a prior protective
/// step: lift the bit, write, and restore it only if it had been set.
pub fn safe_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let was_readonly = match fs::metadata(path) {
        Ok(meta) => meta.permissions().readonly(),
        Err(_) => false,
    };

    if was_readonly {
        let mut perms = fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to unlock {}", path.display()))?;
    }

    write_json_atomic(path, value)?;

    if was_readonly {
        let mut perms = fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to re-protect {}", path.display()))?;
    }

    Ok(())
}
