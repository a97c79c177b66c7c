//! Filesystem helpers shared by the config store, cipher and commands.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Total size in bytes of the files below `root`
///
/// Symbolic links are counted as entries, never followed.
pub fn dir_size(root: &Path) -> io::Result<u64> {
    let mut pending = vec![root.to_path_buf()];
    let mut bytes = 0;
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                pending.push(entry.path());
            } else if kind.is_file() {
                bytes += entry.metadata()?.len();
            }
        }
    }
    Ok(bytes)
}

/// Replace `path` with `content` without ever exposing a half-written file
///
/// The bytes go to `temp_path` first (same directory, so the final rename
/// stays on one filesystem), are flushed and fsynced, then renamed over
/// `path`. The temp file is removed if any step fails.
pub fn write_atomic(path: &Path, temp_path: &Path, content: &[u8]) -> io::Result<()> {
    let result = (|| {
        let mut file = File::create(temp_path)?;
        file.write_all(content)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(temp_path, path)
    })();

    if result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(temp_path);
    }
    result
}

/// Format a byte count for display
pub fn human_size(size: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if size < 1024 {
        return format!("{} B", size);
    }
    let mut value = size as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("configs.json");
        let temp_path = temp_dir.path().join("configs.tmp");

        fs::write(&path, "old").unwrap();
        write_atomic(&path, &temp_path, b"new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_write_atomic_missing_dir_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        let result = write_atomic(&missing.join("a.json"), &missing.join("a.tmp"), b"x");
        assert!(result.is_err());
        assert!(!missing.exists());
    }

    #[test]
    fn test_dir_size() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), [0u8; 10]).unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/b"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(temp_dir.path()).unwrap(), 15);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
