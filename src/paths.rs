use anyhow::{Context, Result};
use std::path::PathBuf;

/// All computed paths used by tgprof
///
/// Everything tgprof owns lives in the working directory it is started from;
/// the client installation root comes from the config and is not stored here.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Directory tgprof was started from
    pub work_dir: PathBuf,
    /// <work_dir>/configs.json
    pub config_file: PathBuf,
    /// <work_dir>/configs.tmp
    pub config_tmp: PathBuf,
    /// <work_dir>/tgprof.log
    pub log_file: PathBuf,
    /// <work_dir>/tgprof.lock
    pub lock_file: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        let work_dir = std::env::current_dir().context("Failed to determine working directory")?;
        Ok(Self::in_dir(work_dir))
    }

    /// Build the layout rooted at an explicit directory
    pub fn in_dir(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let config_file = work_dir.join("configs.json");
        let config_tmp = config_file.with_extension("tmp");
        let log_file = work_dir.join("tgprof.log");
        let lock_file = work_dir.join("tgprof.lock");

        Self {
            work_dir,
            config_file,
            config_tmp,
            log_file,
            lock_file,
        }
    }
}
