//! Single-instance guard.
//!
//! Every command that can touch the installation holds an exclusive lock on
//! `tgprof.lock` for its whole duration. The lock file also records who
//! holds it, so a second instance can say so.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// An acquired instance lock; released on drop
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without blocking
    ///
    /// Fails if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        if file.try_lock_exclusive().is_err() {
            match read_owner(&mut file) {
                Some(owner) => bail!(
                    "Another tgprof instance is running (pid {}, started {}).",
                    owner.pid,
                    owner.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => bail!("Another tgprof instance is running."),
            }
        }

        let owner = serde_json::to_string(&LockOwner::current()).context("Failed to serialize lock owner")?;
        file.set_len(0)
            .with_context(|| format!("Failed to truncate lock file: {:?}", path))?;
        file.seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to seek lock file: {:?}", path))?;
        file.write_all(owner.as_bytes())
            .with_context(|| format!("Failed to write lock file: {:?}", path))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync lock file: {:?}", path))?;

        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_owner(file: &mut File) -> Option<LockOwner> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Release the lock (ignore errors during drop)
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}
