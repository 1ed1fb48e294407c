//! Crash-safe file replacement.
//!
//! K_i: Readers only ever observe the previous complete file or the new
//! complete file (write to a sibling temp file, fsync, rename over).

use crate::models::{Result, TiltflowError};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Sibling temp path used while replacing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("tiltflow"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_with(path, |writer| {
        writer
            .write_all(contents)
            .map_err(|e| TiltflowError::io(format!("writing {}", path.display()), e))
    })
}

/// Atomically replace `path` with pretty-printed JSON.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic_with(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value)
            .map_err(|e| TiltflowError::Internal(format!("Serializing {}: {e}", path.display())))?;
        writer
            .write_all(b"\n")
            .map_err(|e| TiltflowError::io(format!("writing {}", path.display()), e))
    })
}

fn write_atomic_with<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| TiltflowError::io(format!("creating {}", parent.display()), e))?;
    }

    let temp_path = temp_path_for(path);
    let file = File::create(&temp_path)
        .map_err(|e| TiltflowError::io(format!("creating {}", temp_path.display()), e))?;
    let mut writer = BufWriter::new(file);
    fill(&mut writer)?;

    let file = writer
        .into_inner()
        .map_err(|e| TiltflowError::io(format!("flushing {}", temp_path.display()), e.into_error()))?;
    file.sync_all()
        .map_err(|e| TiltflowError::io(format!("syncing {}", temp_path.display()), e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| TiltflowError::io(format!("renaming onto {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_and_cleans_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_stale_temp_does_not_affect_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

        // A crash mid-write leaves only a partial temp file behind.
        fs::write(temp_path_for(&path), b"[1, 2").unwrap();

        let parsed: Vec<i32> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, vec![1, 2, 3]);
    }
}
