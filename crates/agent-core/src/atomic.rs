//! Atomic JSON writes: write to `<path>.tmp`, then rename over `path`.
//!
//! Used for `status.json`, command responses, and command error reports
//! — anywhere a reader must never observe a partially written file.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Serializes `value` as compact JSON and atomically installs it at
/// `path` (create parent directories as needed).
///
/// # Errors
///
/// Returns an error if serialization fails, the temp file cannot be
/// written, or the rename fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
    }

    let json = serde_json::to_string(value)
        .map_err(|e| Error::json(format!("serializing {}", path.display()), e))?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, json.as_bytes())
        .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;

    std::fs::rename(&tmp, path)
        .map_err(|e| Error::io(format!("renaming {} to {}", tmp.display(), path.display()), e))?;

    Ok(())
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        ok: bool,
        n: u32,
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        write_json_atomic(&path, &Payload { ok: true, n: 7 }).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Payload = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded, Payload { ok: true, n: 7 });

        // No leftover temp file.
        assert!(!path.with_file_name("status.json.tmp").exists());
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/status.json");

        write_json_atomic(&path, &Payload { ok: false, n: 0 }).unwrap();
        assert!(path.exists());
    }
}
