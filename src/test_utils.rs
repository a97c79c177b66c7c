//! Test utilities shared across test modules
//!
//! Helpers for building throwaway installations and a scripted process
//! table, so orchestrator and monitor tests never touch real processes.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;

use crate::config::ConfigStore;
use crate::error::ProcessError;
use crate::paths::Paths;
use crate::process::ProcessTable;
use crate::tags::CREDENTIAL_FILE;

/// Executable name used by test installations
pub const TEST_CLIENT: &str = "FakeGram";

/// Create a Paths struct rooted in a temporary directory
pub fn setup_test_paths(temp_dir: &TempDir) -> Paths {
    Paths::in_dir(temp_dir.path())
}

/// Create a profile directory carrying the marker for `tag`
pub fn make_profile(root: &Path, dir_name: &str, tag: &str, credential: &[u8]) -> PathBuf {
    let dir = root.join(dir_name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(tag), b"").unwrap();
    fs::write(dir.join(CREDENTIAL_FILE), credential).unwrap();
    fs::write(dir.join("settings.dat"), format!("profile {tag}")).unwrap();
    dir
}

/// A loaded store pointing at an installation inside a temp dir
pub struct Fixture {
    pub temp_dir: TempDir,
    pub paths: Paths,
    pub store: ConfigStore,
    /// Installation root (`path` in the config)
    pub root: PathBuf,
}

/// Build a fixture with `default` and `tags` configured
///
/// The installation root exists and holds a client executable, but no
/// profiles; tests add those with `make_profile`.
pub fn fixture(default: &str, tags: &[&str]) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let paths = setup_test_paths(&temp_dir);
    let root = temp_dir.path().join("install");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join(TEST_CLIENT), b"#!/bin/sh\n").unwrap();

    let store = ConfigStore::load(&paths).unwrap();
    store.set_client(TEST_CLIENT);
    store.set_path(root.to_string_lossy());
    store.set_default(default);
    store.set_tags(tags.iter().map(|t| t.to_string()).collect());
    store.flush().unwrap();

    Fixture {
        temp_dir,
        paths,
        store,
        root,
    }
}

/// Scripted stand-in for the OS process table
///
/// A spawn makes the client alive (unless `never_starts`), and it exits by
/// itself after `exits_after` liveness checks.
#[derive(Default)]
pub struct FakeProcesses {
    alive: AtomicBool,
    no_start: bool,
    exit_after: Option<u32>,
    checks_since_spawn: AtomicU32,
    checks: AtomicU32,
    spawns: AtomicU32,
    terminations: AtomicU32,
    running: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn never_starts(mut self) -> Self {
        self.no_start = true;
        self
    }

    pub fn exits_after(mut self, checks: u32) -> Self {
        self.exit_after = Some(checks);
        self
    }

    pub fn already_running(self) -> Self {
        self.alive.store(true, Ordering::SeqCst);
        self
    }

    /// Add a named process for `find_first_matching_process`
    pub fn with_running(self, name: &str, dir: &Path) -> Self {
        self.running.lock().push((name.to_string(), dir.to_path_buf()));
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ProcessTable for FakeProcesses {
    fn is_process_alive(&self, _name: &str) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if !self.alive() {
            return false;
        }
        if let Some(limit) = self.exit_after {
            let seen = self.checks_since_spawn.fetch_add(1, Ordering::SeqCst) + 1;
            if seen > limit {
                self.set_alive(false);
                return false;
            }
        }
        true
    }

    fn terminate_process(&self, _name: &str) -> Result<bool, ProcessError> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }

    fn spawn_detached(&self, executable: &Path, _working_dir: &Path) -> Result<u32, ProcessError> {
        if !executable.is_file() {
            return Err(ProcessError::ExecutableMissing(executable.to_path_buf()));
        }
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        self.checks_since_spawn.store(0, Ordering::SeqCst);
        if !self.no_start {
            self.set_alive(true);
        }
        Ok(1000 + n)
    }

    fn find_first_matching_process(&self, candidates: &[&str], exclude: &[&str]) -> Option<String> {
        self.running
            .lock()
            .iter()
            .map(|(name, _)| name)
            .find(|name| {
                let lower = name.to_lowercase();
                !exclude.iter().any(|e| lower.contains(&e.to_lowercase()))
                    && candidates.iter().any(|c| lower.contains(&c.to_lowercase()))
            })
            .cloned()
    }

    fn process_install_dir(&self, name: &str) -> Option<PathBuf> {
        self.running
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, dir)| dir.clone())
    }
}
