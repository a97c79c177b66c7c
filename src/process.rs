//! Process primitives.
//!
//! The switching core only needs a handful of questions answered about the
//! OS process table. `ProcessTable` is that seam; `SystemProcesses` answers
//! them from `/proc` on Linux.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// Client executables recognized by `detect`
pub const CLIENT_POOL: &[&str] = &[
    "iMe", "telegram", "Forkgram", "64Gram", "Unigram", "Beeper", "AyuGram",
];

/// Processes whose names contain a client name but are not clients
pub const EXCLUDED_PROCESSES: &[&str] = &["sogouimebroker", "runtimebroker", "ChsIME"];

pub trait ProcessTable: Send + Sync {
    /// Whether a process with this executable name is running
    ///
    /// Enumeration failures count as "not running".
    fn is_process_alive(&self, name: &str) -> bool;

    /// Ask every process with this name to exit; true if any was signalled
    fn terminate_process(&self, name: &str) -> Result<bool, ProcessError>;

    /// Start `executable` detached from our stdio, returning its pid
    fn spawn_detached(&self, executable: &Path, working_dir: &Path) -> Result<u32, ProcessError>;

    /// Name of the first running process matching any candidate
    fn find_first_matching_process(&self, candidates: &[&str], exclude: &[&str]) -> Option<String>;

    /// Directory holding the executable of a running process
    fn process_install_dir(&self, name: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcEntry {
    pid: i32,
    name: String,
    /// Kernel short name, at most 15 bytes
    comm: String,
    exe: Option<PathBuf>,
}

impl ProcEntry {
    fn is_named(&self, wanted: &str) -> bool {
        let wanted = strip_exe_suffix(wanted);
        strip_exe_suffix(&self.name) == wanted || comm_matches(&self.comm, wanted)
    }
}

fn strip_exe_suffix(name: &str) -> &str {
    match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".exe") => {
            &name[..cut]
        }
        _ => name,
    }
}

fn comm_matches(comm: &str, wanted: &str) -> bool {
    if comm.is_empty() {
        return false;
    }
    if wanted.len() <= 15 {
        return comm == wanted;
    }
    wanted.is_char_boundary(15) && comm == &wanted[..15]
}

/// Pick the first name that contains a candidate and no excluded keyword
fn first_match<'a>(
    names: impl IntoIterator<Item = &'a str>,
    candidates: &[&str],
    exclude: &[&str],
) -> Option<&'a str> {
    let candidates: Vec<String> = candidates.iter().map(|c| c.to_lowercase()).collect();
    let exclude: Vec<String> = exclude.iter().map(|e| e.to_lowercase()).collect();

    names.into_iter().find(|name| {
        let lower = name.to_lowercase();
        !exclude.iter().any(|e| lower.contains(e.as_str()))
            && candidates.iter().any(|c| lower.contains(c.as_str()))
    })
}

/// The real process table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl SystemProcesses {
    fn entries(&self) -> Result<Vec<ProcEntry>, ProcessError> {
        read_proc_entries().map_err(ProcessError::Enumerate)
    }
}

impl ProcessTable for SystemProcesses {
    fn is_process_alive(&self, name: &str) -> bool {
        match self.entries() {
            Ok(entries) => entries.iter().any(|e| e.is_named(name)),
            Err(err) => {
                warn!(error = %err, "process enumeration failed, assuming not running");
                false
            }
        }
    }

    fn terminate_process(&self, name: &str) -> Result<bool, ProcessError> {
        let entries = self.entries()?;
        let own_pid = std::process::id() as i32;
        let mut signalled = false;

        for entry in entries.iter().filter(|e| e.is_named(name) && e.pid != own_pid) {
            match send_terminate(entry.pid) {
                Ok(true) => {
                    info!(pid = entry.pid, name = %entry.name, "terminated client process");
                    signalled = true;
                }
                Ok(false) => debug!(pid = entry.pid, "process exited before it could be signalled"),
                Err(reason) => {
                    return Err(ProcessError::Terminate {
                        name: name.to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(signalled)
    }

    fn spawn_detached(&self, executable: &Path, working_dir: &Path) -> Result<u32, ProcessError> {
        if !executable.is_file() {
            return Err(ProcessError::ExecutableMissing(executable.to_path_buf()));
        }

        let mut command = Command::new(executable);
        command
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Launch {
            path: executable.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        info!(pid, exe = %executable.display(), "client started");

        // Reap the child so it does not linger as a zombie once it exits.
        let reaper = std::thread::Builder::new()
            .name("client-reaper".to_string())
            .spawn(move || {
                if let Err(err) = child.wait() {
                    debug!(error = %err, "waiting on client failed");
                }
            });
        if let Err(err) = reaper {
            warn!(error = %err, "could not start reaper thread for client");
        }

        Ok(pid)
    }

    fn find_first_matching_process(&self, candidates: &[&str], exclude: &[&str]) -> Option<String> {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "process enumeration failed");
                return None;
            }
        };
        first_match(entries.iter().map(|e| e.name.as_str()), candidates, exclude)
            .map(str::to_string)
    }

    fn process_install_dir(&self, name: &str) -> Option<PathBuf> {
        self.entries()
            .ok()?
            .into_iter()
            .filter(|e| e.is_named(name))
            .find_map(|e| e.exe.and_then(|exe| exe.parent().map(Path::to_path_buf)))
    }
}

#[cfg(target_os = "linux")]
fn read_proc_entries() -> io::Result<Vec<ProcEntry>> {
    let mut entries = Vec::new();

    for dir_entry in fs::read_dir("/proc")? {
        let Ok(dir_entry) = dir_entry else { continue };
        let Some(pid) = dir_entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };

        match read_entry(pid) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(err) => debug!(pid, error = %err, "skipping process"),
        }
    }

    entries.sort_by_key(|e| e.pid);
    Ok(entries)
}

/// Read one `/proc/<pid>`; zombies yield `None`
#[cfg(target_os = "linux")]
fn read_entry(pid: i32) -> io::Result<Option<ProcEntry>> {
    let base = PathBuf::from(format!("/proc/{pid}"));

    let stat = fs::read_to_string(base.join("stat"))?;
    if stat_state(&stat) == Some('Z') {
        return Ok(None);
    }

    let comm = fs::read_to_string(base.join("comm"))?.trim_end().to_string();
    let exe = fs::read_link(base.join("exe")).ok().map(|p| {
        match p.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
            Some(stripped) => PathBuf::from(stripped),
            None => p,
        }
    });
    let name = exe
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| comm.clone());

    Ok(Some(ProcEntry {
        pid,
        name,
        comm,
        exe,
    }))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_entries() -> io::Result<Vec<ProcEntry>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process enumeration requires /proc",
    ))
}

/// Process state letter from a `/proc/<pid>/stat` line
fn stat_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}

/// Send SIGTERM; `Ok(false)` when the process is already gone
#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<bool, String> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(errno.desc().to_string()),
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: i32) -> Result<bool, String> {
    Err("signals are not available on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, comm: &str) -> ProcEntry {
        ProcEntry {
            pid: 1,
            name: name.to_string(),
            comm: comm.to_string(),
            exe: None,
        }
    }

    #[test]
    fn test_name_matching() {
        assert!(entry("Telegram", "Telegram").is_named("Telegram"));
        assert!(entry("Telegram", "Telegram").is_named("Telegram.exe"));
        assert!(!entry("Telegram", "Telegram").is_named("telegram-desktop"));
        assert!(!entry("Telegram", "Telegram").is_named("Tele"));

        // comm is truncated by the kernel
        let long = entry("", "AyuGramDesktopB");
        assert!(long.is_named("AyuGramDesktopBeta"));
        assert!(!long.is_named("AyuGramDesktop"));
    }

    #[test]
    fn test_strip_exe_suffix() {
        assert_eq!(strip_exe_suffix("Telegram.exe"), "Telegram");
        assert_eq!(strip_exe_suffix("Telegram.EXE"), "Telegram");
        assert_eq!(strip_exe_suffix("Telegram"), "Telegram");
        assert_eq!(strip_exe_suffix("exe"), "exe");
        assert_eq!(strip_exe_suffix("тг.exe"), "тг");
    }

    #[test]
    fn test_first_match_respects_exclusions() {
        let names = ["systemd", "SogouImeBroker", "ime-helper", "Forkgram", "Telegram"];
        assert_eq!(
            first_match(names, CLIENT_POOL, EXCLUDED_PROCESSES),
            Some("ime-helper")
        );

        let names = ["systemd", "SogouImeBroker", "Forkgram", "Telegram"];
        assert_eq!(
            first_match(names, CLIENT_POOL, EXCLUDED_PROCESSES),
            Some("Forkgram")
        );

        let names = ["bash", "runtimebroker"];
        assert_eq!(first_match(names, CLIENT_POOL, EXCLUDED_PROCESSES), None);
    }

    #[test]
    fn test_stat_state() {
        assert_eq!(stat_state("42 (Telegram) S 1 42 42"), Some('S'));
        assert_eq!(stat_state("43 (odd) name) Z 1 43 43"), Some('Z'));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn test_spawn_missing_executable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = SystemProcesses.spawn_detached(&temp_dir.path().join("Telegram"), temp_dir.path());
        assert!(matches!(result, Err(ProcessError::ExecutableMissing(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process_is_visible() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap().to_string();

        assert!(SystemProcesses.is_process_alive(&name));
        assert_eq!(
            SystemProcesses.process_install_dir(&name),
            exe.parent().map(Path::to_path_buf)
        );
        assert!(!SystemProcesses.is_process_alive("tgprof-no-such-process"));
    }
}
